use std::path::Path;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info};

use crate::archive::{self, ArchiveRequest};
use crate::collaborators::{
    BootstrapRequest, CleanupRequest, NotificationKind, NotificationSink, RuntimeSessionEntry,
    RuntimeSessionRegistry, TerminalManager, VcsRunner, WorkspaceManager,
};
use crate::config_io::render_bubble_toml;
use crate::convergence::{ConvergenceInput, ConvergencePolicy};
use crate::error::{CoreError, CoreResult};
use crate::io::AtomicFileStore;
use crate::lock::LockOptions;
use crate::machine::{StateMachine, TransitionPatch};
use crate::metrics::{ActorRole, MetricsEmitter, MetricsEvent};
use crate::model::agent::{AgentName, AgentPair, Role};
use crate::model::config::{
    generate_bubble_instance_id, validate_bubble_id, CommandsConfig, LocalOverlayConfig,
    NotificationsConfig, QualityMode, ReviewerContextMode, WorkMode,
};
use crate::model::envelope::{
    ApprovalDecisionPayload, DonePackageMetadata, DonePackagePayload, Finding,
    HumanQuestionPayload, HumanReplyPayload, PassPayload, SummaryPayload, TaskPayload,
};
use crate::model::state::{
    PendingReworkIntent, ReworkIntentHistoryEntry, ReworkStatus, RoundRoleHistoryEntry,
};
use crate::model::{
    BubbleConfig, BubbleState, BubbleStateSnapshot, Decision, EnvelopeType, PassIntent,
    Participant, Payload, ProtocolEnvelope,
};
use crate::paths::{default_worktree_path, BubbleLayout};
use crate::state_store::{StateStore, WriteExpectation};
use crate::transcript_store::{AppendRequest, EnvelopeDraft, ReadOptions, TranscriptStore};
use crate::watchdog::Watchdog;

/// The bundle of external collaborators a command may need (§6.2). Every
/// command that only touches state/transcript (pass, ask-human, converged,
/// approve, reply) needs none of these; start/commit/stop/delete take a
/// `&Collaborators` explicitly so their signatures advertise the external
/// surface they cross.
pub struct Collaborators<'a> {
    pub workspace: &'a dyn WorkspaceManager,
    pub vcs: &'a dyn VcsRunner,
    pub terminal: &'a dyn TerminalManager,
    pub registry: &'a dyn RuntimeSessionRegistry,
    pub notifications: &'a dyn NotificationSink,
}

/// The outcome every mutating command returns: the new durable snapshot,
/// its fingerprint, and whichever envelopes were appended by this call.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub snapshot: BubbleStateSnapshot,
    pub fingerprint: String,
    pub envelopes: Vec<ProtocolEnvelope>,
}

fn role_actor(role: Role) -> ActorRole {
    match role {
        Role::Implementer => ActorRole::Implementer,
        Role::Reviewer => ActorRole::Reviewer,
    }
}

fn emit(
    events_root: &Path,
    config: &BubbleConfig,
    instance_id: &str,
    event_type: &str,
    round: Option<u32>,
    actor_role: ActorRole,
    now: DateTime<Utc>,
) {
    MetricsEmitter::emit(
        events_root,
        MetricsEvent {
            repo_path: config.repo_path.clone(),
            bubble_instance_id: Some(instance_id.to_string()),
            bubble_id: config.id.clone(),
            event_type: event_type.to_string(),
            round,
            actor_role,
            metadata: serde_json::Map::new(),
        },
        now,
    );
}

/// Backfills `bubble_instance_id` the first time a mutating command sees it
/// missing (§3.2/§4.8), under the per-bubble lock since it mutates
/// `bubble.toml`.
fn ensure_bubble_instance_id(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<String> {
    if let Some(id) = &config.bubble_instance_id {
        return Ok(id.clone());
    }
    let millis = now.timestamp_millis().max(0) as u128;
    let instance_id = generate_bubble_instance_id(millis, |buf| {
        rand::thread_rng().fill_bytes(buf);
    });
    config.bubble_instance_id = Some(instance_id.clone());
    config.validate()?;
    AtomicFileStore::atomic_replace(
        &layout.config_path(),
        render_bubble_toml(config).as_bytes(),
        true,
    )?;
    emit(
        events_root,
        config,
        &instance_id,
        "bubble_instance_backfilled",
        None,
        ActorRole::Orchestrator,
        now,
    );
    Ok(instance_id)
}

fn read_state(layout: &BubbleLayout) -> CoreResult<crate::state_store::ReadResult> {
    StateStore::read(&layout.state_path())
}

fn lock_opts() -> LockOptions {
    LockOptions {
        ensure_parent_dir: true,
        ..Default::default()
    }
}

fn write_state(
    layout: &BubbleLayout,
    config: &BubbleConfig,
    next: &BubbleStateSnapshot,
    expected_fingerprint: &str,
) -> CoreResult<String> {
    StateStore::write(
        &layout.state_path(),
        &layout.bubble_lock_path(&config.id),
        next,
        config,
        WriteExpectation {
            expected_fingerprint: Some(expected_fingerprint),
            expected_state: None,
        },
        lock_opts(),
    )
}

fn append_one(
    layout: &BubbleLayout,
    config: &BubbleConfig,
    draft: EnvelopeDraft,
    mirror_paths: Vec<std::path::PathBuf>,
    now: DateTime<Utc>,
) -> CoreResult<crate::transcript_store::AppendOutcome> {
    TranscriptStore::append_one(
        &layout.transcript_path(),
        &layout.bubble_lock_path(&config.id),
        &config.id,
        AppendRequest { draft, mirror_paths },
        now,
        lock_opts(),
    )
}

fn append_many(
    layout: &BubbleLayout,
    config: &BubbleConfig,
    requests: Vec<AppendRequest>,
    now: DateTime<Utc>,
) -> CoreResult<crate::transcript_store::AppendOutcome> {
    TranscriptStore::append_many(
        &layout.transcript_path(),
        &layout.bubble_lock_path(&config.id),
        &config.id,
        requests,
        now,
        lock_opts(),
    )
}

/// §4.8.1 `create`: writes `bubble.toml` (instance id filled eagerly),
/// `state.json` (CREATED), the initial TASK envelope, and `artifacts/task.md`.
pub struct CreateRequest<'a> {
    pub id: &'a str,
    pub repo_path: &'a Path,
    pub base_branch: &'a str,
    pub bubble_branch: &'a str,
    pub work_mode: WorkMode,
    pub quality_mode: QualityMode,
    pub reviewer_context_mode: ReviewerContextMode,
    pub watchdog_timeout_minutes: u32,
    pub max_rounds: u32,
    pub commit_requires_approval: bool,
    pub open_command: Option<String>,
    pub agents: AgentPair,
    pub commands: CommandsConfig,
    pub notifications: NotificationsConfig,
    pub local_overlay: Option<LocalOverlayConfig>,
    pub task: &'a str,
}

pub fn create(
    req: CreateRequest,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<(BubbleConfig, CommandOutcome)> {
    validate_bubble_id(req.id)?;

    let millis = now.timestamp_millis().max(0) as u128;
    let instance_id = generate_bubble_instance_id(millis, |buf| {
        rand::thread_rng().fill_bytes(buf);
    });

    let config = BubbleConfig {
        id: req.id.to_string(),
        repo_path: req.repo_path.to_path_buf(),
        base_branch: req.base_branch.to_string(),
        bubble_branch: req.bubble_branch.to_string(),
        work_mode: req.work_mode,
        quality_mode: req.quality_mode,
        reviewer_context_mode: req.reviewer_context_mode,
        watchdog_timeout_minutes: req.watchdog_timeout_minutes,
        max_rounds: req.max_rounds,
        commit_requires_approval: req.commit_requires_approval,
        open_command: req.open_command,
        agents: req.agents,
        commands: req.commands,
        notifications: req.notifications,
        local_overlay: req.local_overlay,
        bubble_instance_id: Some(instance_id.clone()),
    };
    config.validate()?;

    let layout = BubbleLayout::under_repo(req.repo_path, req.id);
    if layout.config_path().exists() {
        return Err(CoreError::StateConflict(format!(
            "bubble {} already exists at {}",
            req.id,
            layout.root.display()
        )));
    }

    std::fs::create_dir_all(layout.artifacts_dir())?;
    AtomicFileStore::atomic_replace(
        &layout.config_path(),
        render_bubble_toml(&config).as_bytes(),
        true,
    )?;

    let snapshot = BubbleStateSnapshot::new_created(req.id);
    let fingerprint = StateStore::create(&layout.state_path(), &snapshot, &config)?;

    let draft = EnvelopeDraft {
        sender: Participant::Human,
        recipient: Participant::Agent(config.agents.implementer),
        msg_type: EnvelopeType::Task,
        round: 0,
        payload: Payload::Task(TaskPayload {
            task: req.task.to_string(),
        }),
        refs: vec![],
    };
    let outcome = append_one(&layout, &config, draft, vec![], now)?;

    AtomicFileStore::atomic_replace(&layout.task_artifact_path(), req.task.as_bytes(), true)?;

    emit(
        events_root,
        &config,
        &instance_id,
        "bubble_created",
        Some(0),
        ActorRole::Human,
        now,
    );

    Ok((
        config,
        CommandOutcome {
            snapshot,
            fingerprint,
            envelopes: outcome.envelopes,
        },
    ))
}

/// §4.8.2 `start`: CREATED -> PREPARING_WORKSPACE -> (bootstrap) -> RUNNING,
/// or PREPARING_WORKSPACE -> FAILED with best-effort cleanup on bootstrap
/// or terminal-launch failure.
pub fn start(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    collab: &Collaborators,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    if read.snapshot.state != BubbleState::Created {
        return Err(CoreError::StateTransitionDenied {
            from: read.snapshot.state.to_string(),
            to: BubbleState::PreparingWorkspace.to_string(),
        });
    }

    let preparing = StateMachine::apply_transition(
        &read.snapshot,
        TransitionPatch {
            to: Some(BubbleState::PreparingWorkspace),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fp_preparing = write_state(layout, config, &preparing, &read.fingerprint)?;

    let worktree_path = default_worktree_path(&config.repo_path, &config.id);
    let bootstrap_result = collab.workspace.bootstrap(&BootstrapRequest {
        repo_path: &config.repo_path,
        base_branch: &config.base_branch,
        bubble_branch: &config.bubble_branch,
        worktree_path: &worktree_path,
        local_overlay: config.local_overlay.as_ref(),
    });

    let tmux_session_name = format!("pf-{}", config.id);
    let launch_result = match &bootstrap_result {
        Ok(_) => Some(collab.terminal.launch(&tmux_session_name, &worktree_path, "true")),
        Err(_) => None,
    };

    let succeeded = matches!(&bootstrap_result, Ok(_)) && matches!(&launch_result, Some(Ok(())));

    if succeeded {
        collab.registry.upsert(
            &config.id,
            RuntimeSessionEntry {
                repo_path: config.repo_path.clone(),
                worktree_path: worktree_path.clone(),
                tmux_session_name,
                updated_at: now.to_rfc3339(),
            },
        )?;

        let history_entry = RoundRoleHistoryEntry {
            round: 1,
            implementer: config.agents.implementer,
            reviewer: config.agents.reviewer,
            switched_at: now.to_rfc3339(),
        };
        let running = StateMachine::apply_transition(
            &preparing,
            TransitionPatch {
                to: Some(BubbleState::Running),
                round: Some(1),
                active_agent: Some(Some(config.agents.implementer)),
                active_role: Some(Some(Role::Implementer)),
                active_since: Some(Some(now.to_rfc3339())),
                append_round_role_history: Some(history_entry),
                last_command_at: Some(now.to_rfc3339()),
                ..Default::default()
            },
            config,
        )?;
        let fingerprint = write_state(layout, config, &running, &fp_preparing)?;
        emit(
            events_root,
            config,
            &instance_id,
            "bubble_started",
            Some(1),
            ActorRole::Orchestrator,
            now,
        );
        return Ok(CommandOutcome {
            snapshot: running,
            fingerprint,
            envelopes: vec![],
        });
    }

    let _ = collab.workspace.cleanup(&CleanupRequest {
        repo_path: &config.repo_path,
        bubble_branch: &config.bubble_branch,
        worktree_path: &worktree_path,
    });
    let failed = StateMachine::apply_transition(
        &preparing,
        TransitionPatch {
            to: Some(BubbleState::Failed),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let _ = write_state(layout, config, &failed, &fp_preparing);
    emit(
        events_root,
        config,
        &instance_id,
        "bubble_start_failed",
        None,
        ActorRole::Orchestrator,
        now,
    );

    let message = bootstrap_result
        .err()
        .map(|e| e.to_string())
        .or_else(|| launch_result.and_then(Result::err).map(|e| e.to_string()))
        .unwrap_or_else(|| "workspace bootstrap failed".to_string());
    Err(CoreError::ExternalFailure {
        collaborator: "workspace".to_string(),
        message,
    })
}

/// §4.8.3 `pass`, the central ping-pong handoff.
pub struct PassRequest {
    pub summary: String,
    pub intent: Option<PassIntent>,
    pub findings: Option<Vec<Finding>>,
    pub refs: Vec<String>,
}

pub fn pass(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    req: PassRequest,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;

    if snap.state != BubbleState::Running || snap.round < 1 {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: "PASS".to_string(),
        });
    }
    let active_role = snap
        .active_role
        .ok_or_else(|| CoreError::schema("active_role missing while RUNNING"))?;
    let active_agent = snap
        .active_agent
        .ok_or_else(|| CoreError::schema("active_agent missing while RUNNING"))?;
    if config.agents.for_role(active_role) != active_agent {
        return Err(CoreError::schema(
            "active_agent does not match configured agents for active_role",
        ));
    }

    let (sender, recipient, default_intent, patch) = match active_role {
        Role::Implementer => (
            Participant::Agent(config.agents.implementer),
            Participant::Agent(config.agents.reviewer),
            PassIntent::Review,
            TransitionPatch {
                active_agent: Some(Some(config.agents.reviewer)),
                active_role: Some(Some(Role::Reviewer)),
                active_since: Some(Some(now.to_rfc3339())),
                last_command_at: Some(now.to_rfc3339()),
                ..Default::default()
            },
        ),
        Role::Reviewer => {
            let next_round = snap.round + 1;
            let has_entry = snap.round_role_history.iter().any(|e| e.round == next_round);
            let mut patch = TransitionPatch {
                round: Some(next_round),
                active_agent: Some(Some(config.agents.implementer)),
                active_role: Some(Some(Role::Implementer)),
                active_since: Some(Some(now.to_rfc3339())),
                last_command_at: Some(now.to_rfc3339()),
                ..Default::default()
            };
            if !has_entry {
                patch.append_round_role_history = Some(RoundRoleHistoryEntry {
                    round: next_round,
                    implementer: config.agents.implementer,
                    reviewer: config.agents.reviewer,
                    switched_at: now.to_rfc3339(),
                });
            }
            (
                Participant::Agent(config.agents.reviewer),
                Participant::Agent(config.agents.implementer),
                PassIntent::FixRequest,
                patch,
            )
        }
    };

    let draft = EnvelopeDraft {
        sender,
        recipient,
        msg_type: EnvelopeType::Pass,
        round: snap.round,
        payload: Payload::Pass(PassPayload {
            summary: req.summary,
            pass_intent: req.intent.unwrap_or(default_intent),
            findings: req.findings,
            metadata: None,
        }),
        refs: req.refs,
    };
    let append_outcome = append_one(layout, config, draft, vec![], now)?;

    let next_snapshot = StateMachine::apply_transition(snap, patch, config)?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        "pass",
        Some(snap.round),
        role_actor(active_role),
        now,
    );
    info!(
        bubble = %config.id,
        round = snap.round,
        from = %active_role,
        to = %next_snapshot.active_role.map(|r| r.as_str()).unwrap_or("?"),
        "pass handed off"
    );

    Ok(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: append_outcome.envelopes,
    })
}

/// §4.8.4 `ask-human`.
pub fn ask_human(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    question: &str,
    refs: Vec<String>,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;
    if snap.state != BubbleState::Running {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: BubbleState::WaitingHuman.to_string(),
        });
    }
    let active_agent = snap
        .active_agent
        .ok_or_else(|| CoreError::schema("active_agent missing while RUNNING"))?;

    let draft = EnvelopeDraft {
        sender: Participant::Agent(active_agent),
        recipient: Participant::Human,
        msg_type: EnvelopeType::HumanQuestion,
        round: snap.round,
        payload: Payload::HumanQuestion(HumanQuestionPayload {
            question: question.to_string(),
        }),
        refs,
    };
    let append_outcome = append_one(layout, config, draft, vec![layout.inbox_path()], now)?;

    let next_snapshot = StateMachine::apply_transition(
        snap,
        TransitionPatch {
            to: Some(BubbleState::WaitingHuman),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        "ask_human",
        Some(snap.round),
        role_actor(
            snap.active_role
                .expect("active_role present when active_agent present"),
        ),
        now,
    );

    Ok(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: append_outcome.envelopes,
    })
}

/// §4.8.5 human reply / resume.
pub fn human_reply(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    message: &str,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;
    if snap.state != BubbleState::WaitingHuman {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: BubbleState::Running.to_string(),
        });
    }
    let active_agent = snap
        .active_agent
        .ok_or_else(|| CoreError::schema("active_agent missing while WAITING_HUMAN"))?;

    let draft = EnvelopeDraft {
        sender: Participant::Human,
        recipient: Participant::Agent(active_agent),
        msg_type: EnvelopeType::HumanReply,
        round: snap.round,
        payload: Payload::HumanReply(HumanReplyPayload {
            message: message.to_string(),
        }),
        refs: vec![],
    };
    let append_outcome = append_one(layout, config, draft, vec![layout.inbox_path()], now)?;

    let next_snapshot = StateMachine::apply_transition(
        snap,
        TransitionPatch {
            to: Some(BubbleState::Running),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        "human_reply",
        Some(snap.round),
        ActorRole::Human,
        now,
    );

    Ok(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: append_outcome.envelopes,
    })
}

/// §4.8.6 `converged`.
pub fn converged(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    summary: &str,
    refs: Vec<String>,
    notifications: &dyn NotificationSink,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;

    if snap.state != BubbleState::Running {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: BubbleState::ReadyForApproval.to_string(),
        });
    }
    if snap.active_role != Some(Role::Reviewer) || snap.active_agent != Some(config.agents.reviewer) {
        return Err(CoreError::schema(
            "converged may only be declared by the active reviewer",
        ));
    }

    let transcript = TranscriptStore::read(
        &layout.transcript_path(),
        ReadOptions {
            allow_missing: false,
            tolerate_partial_final_line: true,
        },
    )?;
    let outcome = ConvergencePolicy::evaluate(&ConvergenceInput {
        current_round: snap.round,
        agents: &config.agents,
        round_role_history: &snap.round_role_history,
        transcript: &transcript,
    });
    if !outcome.ok {
        debug!(bubble = %config.id, round = snap.round, errors = ?outcome.errors, "convergence denied");
        return Err(CoreError::ConvergenceDenied(outcome.errors));
    }

    let convergence_draft = EnvelopeDraft {
        sender: Participant::Agent(config.agents.reviewer),
        recipient: Participant::Orchestrator,
        msg_type: EnvelopeType::Convergence,
        round: snap.round,
        payload: Payload::Summary(SummaryPayload {
            summary: summary.to_string(),
        }),
        refs: refs.clone(),
    };
    let approval_request_draft = EnvelopeDraft {
        sender: Participant::Orchestrator,
        recipient: Participant::Human,
        msg_type: EnvelopeType::ApprovalRequest,
        round: snap.round,
        payload: Payload::Summary(SummaryPayload {
            summary: summary.to_string(),
        }),
        refs,
    };
    let append_outcome = append_many(
        layout,
        config,
        vec![
            AppendRequest {
                draft: convergence_draft,
                mirror_paths: vec![],
            },
            AppendRequest {
                draft: approval_request_draft,
                mirror_paths: vec![layout.inbox_path()],
            },
        ],
        now,
    )?;

    let next_snapshot = StateMachine::apply_transition(
        snap,
        TransitionPatch {
            to: Some(BubbleState::ReadyForApproval),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        "converged",
        Some(snap.round),
        ActorRole::Reviewer,
        now,
    );
    let _ = notifications.emit(&config.id, NotificationKind::Converged);
    info!(bubble = %config.id, round = snap.round, "reviewer declared convergence");

    Ok(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: append_outcome.envelopes,
    })
}

/// §4.8.7 `approve` / `request-rework` while READY_FOR_APPROVAL.
pub fn decide(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    decision: Decision,
    message: Option<String>,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;
    if snap.state != BubbleState::ReadyForApproval {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: "APPROVAL_DECISION".to_string(),
        });
    }

    let draft = EnvelopeDraft {
        sender: Participant::Human,
        recipient: Participant::Orchestrator,
        msg_type: EnvelopeType::ApprovalDecision,
        round: snap.round,
        payload: Payload::ApprovalDecision(ApprovalDecisionPayload { decision, message }),
        refs: vec![],
    };
    let append_outcome = append_one(layout, config, draft, vec![layout.inbox_path()], now)?;

    let patch = match decision {
        Decision::Approve => TransitionPatch {
            to: Some(BubbleState::ApprovedForCommit),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        Decision::Revise => {
            let next_round = snap.round + 1;
            let has_entry = snap.round_role_history.iter().any(|e| e.round == next_round);
            let mut patch = TransitionPatch {
                to: Some(BubbleState::Running),
                round: Some(next_round),
                active_agent: Some(Some(config.agents.implementer)),
                active_role: Some(Some(Role::Implementer)),
                active_since: Some(Some(now.to_rfc3339())),
                last_command_at: Some(now.to_rfc3339()),
                ..Default::default()
            };
            if !has_entry {
                patch.append_round_role_history = Some(RoundRoleHistoryEntry {
                    round: next_round,
                    implementer: config.agents.implementer,
                    reviewer: config.agents.reviewer,
                    switched_at: now.to_rfc3339(),
                });
            }
            patch
        }
    };

    let next_snapshot = StateMachine::apply_transition(snap, patch, config)?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        match decision {
            Decision::Approve => "approved",
            Decision::Revise => "rework_requested",
        },
        Some(snap.round),
        ActorRole::Human,
        now,
    );

    Ok(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: append_outcome.envelopes,
    })
}

/// §4.8.8 deferred rework intent raised while WAITING_HUMAN: queues a
/// pending intent rather than transitioning immediately. Superseded prior
/// pending intents move to `rework_intent_history`.
pub fn request_rework_deferred(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    message: &str,
    refs: Vec<String>,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;
    if snap.state != BubbleState::WaitingHuman {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: "PENDING_REWORK_INTENT".to_string(),
        });
    }

    let mut next = snap.clone();
    if let Some(prior) = next.pending_rework_intent.take() {
        if prior.status == ReworkStatus::Pending {
            next.rework_intent_history.push(ReworkIntentHistoryEntry {
                intent_id: prior.intent_id,
                requested_at: prior.requested_at,
                message: prior.message,
                refs: prior.refs,
                status: ReworkStatus::Superseded,
            });
        }
    }
    let mut suffix = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut suffix);
    let intent_id = format!(
        "ri_{:x}_{}",
        now.timestamp_millis().max(0),
        suffix.iter().map(|b| format!("{b:02x}")).collect::<String>()
    );
    next.pending_rework_intent = Some(PendingReworkIntent {
        intent_id,
        requested_at: now.to_rfc3339(),
        message: message.to_string(),
        refs,
        status: ReworkStatus::Pending,
    });
    next.last_command_at = Some(now.to_rfc3339());
    next.validate(config)?;

    let fingerprint = write_state(layout, config, &next, &read.fingerprint)?;
    emit(
        events_root,
        config,
        &instance_id,
        "rework_intent_queued",
        Some(snap.round),
        ActorRole::Human,
        now,
    );

    Ok(CommandOutcome {
        snapshot: next,
        fingerprint,
        envelopes: vec![],
    })
}

/// §4.8.9 `commit`.
pub struct CommitRequest {
    pub commit_message: String,
    pub staged_files: Vec<String>,
    pub refs: Vec<String>,
}

pub fn commit(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    req: CommitRequest,
    collab: &Collaborators,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;
    if snap.state != BubbleState::ApprovedForCommit {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: BubbleState::Committed.to_string(),
        });
    }

    let done_package_path = layout.done_package_path();
    let done_package = std::fs::read_to_string(&done_package_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CoreError::schema("artifacts/done-package.md does not exist")
        } else {
            CoreError::Io(e)
        }
    })?;
    if done_package.trim().is_empty() {
        return Err(CoreError::schema("artifacts/done-package.md is empty"));
    }
    if req.staged_files.is_empty() {
        return Err(CoreError::schema("commit requires a non-empty staged file set"));
    }

    let worktree_path = collab
        .registry
        .read(&config.id)?
        .map(|entry| entry.worktree_path)
        .unwrap_or_else(|| default_worktree_path(&config.repo_path, &config.id));
    let canonical_worktree = std::fs::canonicalize(&worktree_path)
        .map_err(|e| CoreError::WorkspaceResolution(format!("cannot resolve worktree: {e}")))?;
    for staged in &req.staged_files {
        let path = Path::new(staged);
        if path.is_absolute() {
            return Err(CoreError::schema(format!(
                "staged file must be relative: {staged}"
            )));
        }
        let joined = worktree_path.join(path);
        let resolved = joined
            .parent()
            .and_then(|p| std::fs::canonicalize(p).ok())
            .map(|p| p.join(path.file_name().unwrap_or_default()))
            .unwrap_or(joined);
        if !resolved.starts_with(&canonical_worktree) {
            return Err(CoreError::schema(format!(
                "staged file escapes the workspace: {staged}"
            )));
        }
    }

    let mut add_args: Vec<&str> = vec!["add", "--"];
    for f in &req.staged_files {
        add_args.push(f);
    }
    collab.vcs.run(&add_args, &worktree_path, false)?;
    collab
        .vcs
        .run(&["commit", "-m", &req.commit_message], &worktree_path, false)?;
    let sha_out = collab.vcs.run(&["rev-parse", "HEAD"], &worktree_path, false)?;
    let commit_sha = sha_out.stdout.trim().to_string();

    let mut refs = vec![done_package_path.display().to_string()];
    refs.extend(req.refs);
    let draft = EnvelopeDraft {
        sender: Participant::Orchestrator,
        recipient: Participant::Human,
        msg_type: EnvelopeType::DonePackage,
        round: snap.round,
        payload: Payload::DonePackage(DonePackagePayload {
            summary: done_package.clone(),
            metadata: DonePackageMetadata {
                done_package_path: done_package_path.display().to_string(),
                staged_files: req.staged_files,
                commit_message: req.commit_message,
                commit_sha,
            },
        }),
        refs,
    };
    let append_outcome = append_one(layout, config, draft, vec![], now)?;

    let committed = StateMachine::apply_transition(
        snap,
        TransitionPatch {
            to: Some(BubbleState::Committed),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fp_committed = write_state(layout, config, &committed, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    let done = StateMachine::apply_transition(
        &committed,
        TransitionPatch {
            to: Some(BubbleState::Done),
            active_agent: Some(None),
            active_role: Some(None),
            active_since: Some(None),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fingerprint = write_state(layout, config, &done, &fp_committed)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        "committed",
        Some(snap.round),
        ActorRole::Orchestrator,
        now,
    );
    info!(bubble = %config.id, round = snap.round, "bubble committed and marked done");

    Ok(CommandOutcome {
        snapshot: done,
        fingerprint,
        envelopes: append_outcome.envelopes,
    })
}

/// §4.8.10 watchdog sweep outcomes.
#[derive(Debug, Clone)]
pub enum WatchdogSweepOutcome {
    NoOp { reason: String },
    Escalated(CommandOutcome),
    ReworkApplied(CommandOutcome),
}

pub struct WatchdogSweepRequest {
    /// External confirmation (via a tmux/terminal delivery probe outside
    /// the core's concern) that the last human message to the stalled agent
    /// has actually been delivered, required before applying a deferred
    /// rework intent.
    pub rework_delivery_confirmed: bool,
}

pub fn watchdog_sweep(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    req: WatchdogSweepRequest,
    notifications: &dyn NotificationSink,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<WatchdogSweepOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;

    if snap.state == BubbleState::WaitingHuman {
        if let Some(intent) = snap.pending_rework_intent.clone() {
            if intent.status == ReworkStatus::Pending {
                if !req.rework_delivery_confirmed {
                    return Ok(WatchdogSweepOutcome::NoOp {
                        reason: "rework_delivery_failed".to_string(),
                    });
                }
                let draft = EnvelopeDraft {
                    sender: Participant::Human,
                    recipient: Participant::Orchestrator,
                    msg_type: EnvelopeType::ApprovalDecision,
                    round: snap.round,
                    payload: Payload::ApprovalDecision(ApprovalDecisionPayload {
                        decision: Decision::Revise,
                        message: Some(intent.message.clone()),
                    }),
                    refs: intent.refs.clone(),
                };
                let append_outcome =
                    append_one(layout, config, draft, vec![layout.inbox_path()], now)?;

                let next_round = snap.round + 1;
                let has_entry = snap.round_role_history.iter().any(|e| e.round == next_round);
                let mut next = snap.clone();
                next.state = BubbleState::Running;
                next.round = next_round;
                next.active_agent = Some(config.agents.implementer);
                next.active_role = Some(Role::Implementer);
                next.active_since = Some(now.to_rfc3339());
                next.last_command_at = Some(now.to_rfc3339());
                if !has_entry {
                    next.round_role_history.push(RoundRoleHistoryEntry {
                        round: next_round,
                        implementer: config.agents.implementer,
                        reviewer: config.agents.reviewer,
                        switched_at: now.to_rfc3339(),
                    });
                }
                next.pending_rework_intent = None;
                next.rework_intent_history.push(ReworkIntentHistoryEntry {
                    intent_id: intent.intent_id,
                    requested_at: intent.requested_at,
                    message: intent.message,
                    refs: intent.refs,
                    status: ReworkStatus::Applied,
                });
                next.validate(config)?;

                let fingerprint = write_state(layout, config, &next, &read.fingerprint)
                    .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;
                emit(
                    events_root,
                    config,
                    &instance_id,
                    "deferred_rework_applied",
                    Some(snap.round),
                    ActorRole::Orchestrator,
                    now,
                );
                return Ok(WatchdogSweepOutcome::ReworkApplied(CommandOutcome {
                    snapshot: next,
                    fingerprint,
                    envelopes: append_outcome.envelopes,
                }));
            }
        }
        return Ok(WatchdogSweepOutcome::NoOp {
            reason: "not_monitored".to_string(),
        });
    }

    let status = Watchdog::evaluate(snap, config.watchdog_timeout_minutes, now);
    if !status.monitored {
        return Ok(WatchdogSweepOutcome::NoOp {
            reason: "not_monitored".to_string(),
        });
    }
    if !status.expired {
        return Ok(WatchdogSweepOutcome::NoOp {
            reason: "not_expired".to_string(),
        });
    }

    let stalled_agent = snap
        .active_agent
        .ok_or_else(|| CoreError::schema("active_agent missing while RUNNING"))?;
    let question = format!(
        "{} has been idle past the configured watchdog timeout of {} minutes. Please check in.",
        stalled_agent, config.watchdog_timeout_minutes
    );
    let draft = EnvelopeDraft {
        sender: Participant::Orchestrator,
        recipient: Participant::Human,
        msg_type: EnvelopeType::HumanQuestion,
        round: snap.round,
        payload: Payload::HumanQuestion(HumanQuestionPayload { question }),
        refs: vec![],
    };
    let append_outcome = append_one(layout, config, draft, vec![layout.inbox_path()], now)?;

    let next_snapshot = StateMachine::apply_transition(
        snap,
        TransitionPatch {
            to: Some(BubbleState::WaitingHuman),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)
        .map_err(|e| CoreError::PostAppendStateDivergence(e.to_string()))?;

    emit(
        events_root,
        config,
        &instance_id,
        "watchdog_escalated",
        Some(snap.round),
        ActorRole::Orchestrator,
        now,
    );
    let _ = notifications.emit(&config.id, NotificationKind::WaitingHuman);
    info!(bubble = %config.id, agent = %stalled_agent, timeout_minutes = config.watchdog_timeout_minutes, "watchdog escalated idle agent");

    Ok(WatchdogSweepOutcome::Escalated(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: append_outcome.envelopes,
    }))
}

/// §4.8.11 `stop`: terminates runtime session ownership and transitions any
/// non-final state to CANCELLED.
pub fn stop(
    layout: &BubbleLayout,
    config: &mut BubbleConfig,
    collab: &Collaborators,
    now: DateTime<Utc>,
    events_root: &Path,
) -> CoreResult<CommandOutcome> {
    let instance_id = ensure_bubble_instance_id(layout, config, now, events_root)?;
    let read = read_state(layout)?;
    let snap = &read.snapshot;
    if snap.state.is_final() {
        return Err(CoreError::StateTransitionDenied {
            from: snap.state.to_string(),
            to: BubbleState::Cancelled.to_string(),
        });
    }

    let tmux_session_name = format!("pf-{}", config.id);
    let _ = collab.terminal.terminate(&tmux_session_name);
    let _ = collab.registry.remove(&config.id);

    let next_snapshot = StateMachine::apply_transition(
        snap,
        TransitionPatch {
            to: Some(BubbleState::Cancelled),
            active_agent: Some(None),
            active_role: Some(None),
            active_since: Some(None),
            last_command_at: Some(now.to_rfc3339()),
            ..Default::default()
        },
        config,
    )?;
    let fingerprint = write_state(layout, config, &next_snapshot, &read.fingerprint)?;

    emit(
        events_root,
        config,
        &instance_id,
        "stopped",
        Some(snap.round),
        ActorRole::Human,
        now,
    );

    Ok(CommandOutcome {
        snapshot: next_snapshot,
        fingerprint,
        envelopes: vec![],
    })
}

/// §4.8.11 `delete`.
#[derive(Debug, Clone)]
pub enum DeleteOutcome {
    AlreadyGone,
    RequiresConfirmation { summary: Vec<String> },
    Deleted,
}

pub fn delete(
    layout: &BubbleLayout,
    config: &BubbleConfig,
    force: bool,
    collab: &Collaborators,
    archive_root: &Path,
    now: DateTime<Utc>,
) -> CoreResult<DeleteOutcome> {
    if !layout.root.exists() {
        return Ok(DeleteOutcome::AlreadyGone);
    }

    let worktree_path = default_worktree_path(&config.repo_path, &config.id);
    let tmux_session_name = format!("pf-{}", config.id);
    let tmux_alive = collab.terminal.session_alive(&tmux_session_name);
    let registry_entry = collab.registry.read(&config.id)?;
    let worktree_present = worktree_path.exists();
    let branch_present = collab
        .vcs
        .run(&["rev-parse", "--verify", &config.bubble_branch], &config.repo_path, true)?
        .exit_code
        == 0;

    if !force && (tmux_alive || registry_entry.is_some() || worktree_present || branch_present) {
        let mut summary = Vec::new();
        if tmux_alive {
            summary.push(format!("tmux session {tmux_session_name} is alive"));
        }
        if registry_entry.is_some() {
            summary.push("runtime session entry present".to_string());
        }
        if worktree_present {
            summary.push(format!("worktree present at {}", worktree_path.display()));
        }
        if branch_present {
            summary.push(format!("branch {} present", config.bubble_branch));
        }
        return Ok(DeleteOutcome::RequiresConfirmation { summary });
    }

    let _ = collab.workspace.cleanup(&CleanupRequest {
        repo_path: &config.repo_path,
        bubble_branch: &config.bubble_branch,
        worktree_path: &worktree_path,
    });
    let _ = collab.terminal.terminate(&tmux_session_name);
    let _ = collab.registry.remove(&config.id);

    let instance_id = config
        .bubble_instance_id
        .clone()
        .unwrap_or_else(|| "bi_unknown".to_string());
    archive::archive_bubble(
        &ArchiveRequest {
            repo_path: &config.repo_path,
            bubble_id: &config.id,
            bubble_instance_id: &instance_id,
            bubble_dir: &layout.root,
            archive_root_path: archive_root,
        },
        now,
    )?;

    match std::fs::remove_dir_all(&layout.root) {
        Ok(()) => Ok(DeleteOutcome::Deleted),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::AlreadyGone),
        Err(e) => Err(CoreError::Io(e)),
    }
}
