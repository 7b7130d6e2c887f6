//! Integration scenarios S3, S5, S6 (§8.2) driven through the public crate
//! API, as an external caller would use it. S1, S2, S4 are covered as
//! inline `#[cfg(test)]` unit tests in `src/commands.rs` against the same
//! fixture helpers; these three exercise the cross-bubble and lock-recovery
//! paths that only make sense from outside a single command call.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use pairflow::collaborators::{
    BootstrapOutcome, CleanupOutcome, NotificationKind, NotificationOutcome, NotificationSink,
    RuntimeSessionEntry, RuntimeSessionRegistry, TerminalManager, VcsCommandOutcome, VcsRunner,
    WorkspaceManager,
};
use pairflow::commands::{self, Collaborators, CreateRequest, PassRequest};
use pairflow::model::agent::{AgentName, AgentPair, Role};
use pairflow::model::config::{
    BubbleConfig, CommandsConfig, NotificationsConfig, QualityMode, ReviewerContextMode, WorkMode,
};
use pairflow::model::envelope::{Finding, Severity};
use pairflow::paths::BubbleLayout;

struct FakeWorkspace;
impl WorkspaceManager for FakeWorkspace {
    fn bootstrap(
        &self,
        req: &pairflow::collaborators::BootstrapRequest,
    ) -> pairflow::CoreResult<BootstrapOutcome> {
        std::fs::create_dir_all(req.worktree_path)?;
        Ok(BootstrapOutcome {
            base_ref: req.base_branch.to_string(),
            bubble_branch: req.bubble_branch.to_string(),
            worktree_path: req.worktree_path.to_path_buf(),
        })
    }
    fn cleanup(
        &self,
        _req: &pairflow::collaborators::CleanupRequest,
    ) -> pairflow::CoreResult<CleanupOutcome> {
        Ok(CleanupOutcome::default())
    }
}

struct FakeVcs;
impl VcsRunner for FakeVcs {
    fn run(
        &self,
        args: &[&str],
        _cwd: &Path,
        _allow_failure: bool,
    ) -> pairflow::CoreResult<VcsCommandOutcome> {
        let stdout = if args.first() == Some(&"rev-parse") && args.get(1) == Some(&"HEAD") {
            "cafef00d".to_string()
        } else {
            String::new()
        };
        Ok(VcsCommandOutcome {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

struct FakeTerminal;
impl TerminalManager for FakeTerminal {
    fn launch(&self, _s: &str, _cwd: &Path, _cmd: &str) -> pairflow::CoreResult<()> {
        Ok(())
    }
    fn terminate(&self, _s: &str) -> pairflow::CoreResult<()> {
        Ok(())
    }
    fn respawn_pane(&self, _s: &str, _cmd: &str) -> pairflow::CoreResult<()> {
        Ok(())
    }
    fn send_input(&self, _s: &str, _input: &str) -> pairflow::CoreResult<()> {
        Ok(())
    }
    fn session_alive(&self, _s: &str) -> bool {
        false
    }
}

struct FakeRegistry;
impl RuntimeSessionRegistry for FakeRegistry {
    fn read(&self, _id: &str) -> pairflow::CoreResult<Option<RuntimeSessionEntry>> {
        Ok(None)
    }
    fn upsert(&self, _id: &str, _entry: RuntimeSessionEntry) -> pairflow::CoreResult<()> {
        Ok(())
    }
    fn remove(&self, _id: &str) -> pairflow::CoreResult<()> {
        Ok(())
    }
}

struct FakeNotifications;
impl NotificationSink for FakeNotifications {
    fn emit(&self, _id: &str, _kind: NotificationKind) -> NotificationOutcome {
        NotificationOutcome {
            attempted: false,
            delivered: false,
            reason: None,
        }
    }
}

fn collaborators() -> Collaborators<'static> {
    Collaborators {
        workspace: Box::leak(Box::new(FakeWorkspace)),
        vcs: Box::leak(Box::new(FakeVcs)),
        terminal: Box::leak(Box::new(FakeTerminal)),
        registry: Box::leak(Box::new(FakeRegistry)),
        notifications: Box::leak(Box::new(FakeNotifications)),
    }
}

/// Builds one fresh bubble, already past `start` (RUNNING, round 1,
/// implementer active), under its own temp repo root.
fn bootstrapped_bubble(
    id: &str,
    repo_root: &Path,
    now: DateTime<Utc>,
    events_root: &Path,
    collab: &Collaborators,
) -> (BubbleLayout, BubbleConfig) {
    let layout = BubbleLayout::under_repo(repo_root, id);
    let agents = AgentPair::new(AgentName::Claude, AgentName::Codex).unwrap();
    let (mut config, _) = commands::create(
        CreateRequest {
            id,
            repo_path: repo_root,
            base_branch: "main",
            bubble_branch: &format!("bubble/{id}"),
            work_mode: WorkMode::Worktree,
            quality_mode: QualityMode::Strict,
            reviewer_context_mode: ReviewerContextMode::Fresh,
            watchdog_timeout_minutes: 30,
            max_rounds: 10,
            commit_requires_approval: true,
            open_command: None,
            agents,
            commands: CommandsConfig {
                test: "cargo test".to_string(),
                typecheck: "cargo check".to_string(),
            },
            notifications: NotificationsConfig {
                enabled: false,
                waiting_human_sound: None,
                converged_sound: None,
            },
            local_overlay: None,
            task: "T",
        },
        now,
        events_root,
    )
    .unwrap();
    commands::start(&layout, &mut config, collab, now, events_root).unwrap();
    (layout, config)
}

/// S3 — convergence is denied when the prior reviewer PASS carried an open
/// P0/P1 finding; state must be left untouched.
#[test]
fn s3_converge_denied_on_open_blocker_finding() {
    let dir = tempfile::tempdir().unwrap();
    let repo_root = std::fs::canonicalize(dir.path()).unwrap();
    let events_root = repo_root.join("events");
    let collab = collaborators();
    let t0: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();

    let (layout, mut config) = bootstrapped_bubble("b_s3", &repo_root, t0, &events_root, &collab);

    let t1 = t0 + chrono::Duration::seconds(1);
    commands::pass(
        &layout,
        &mut config,
        PassRequest {
            summary: "impl1".to_string(),
            intent: None,
            findings: None,
            refs: vec![],
        },
        t1,
        &events_root,
    )
    .unwrap();

    // Reviewer hands back with a blocker finding instead of converging.
    let t2 = t1 + chrono::Duration::seconds(1);
    let before = commands::pass(
        &layout,
        &mut config,
        PassRequest {
            summary: "found a race".to_string(),
            intent: None,
            findings: Some(vec![Finding {
                severity: Severity::P1,
                title: "Race".to_string(),
                detail: None,
                code: None,
                refs: vec!["src/lib.rs:42".to_string()],
            }]),
            refs: vec![],
        },
        t2,
        &events_root,
    )
    .unwrap();
    assert_eq!(before.snapshot.active_role, Some(Role::Implementer));
    assert_eq!(before.snapshot.round, 2);

    // Implementer hands back to the reviewer; the round-1 PASS carrying
    // the open P1 still gates round 2's convergence.
    let t3 = t2 + chrono::Duration::seconds(1);
    commands::pass(
        &layout,
        &mut config,
        PassRequest {
            summary: "impl2".to_string(),
            intent: None,
            findings: None,
            refs: vec![],
        },
        t3,
        &events_root,
    )
    .unwrap();

    let t4 = t3 + chrono::Duration::seconds(1);
    let before_state = pairflow::state_store::StateStore::read(&layout.state_path()).unwrap();
    let err = commands::converged(
        &layout,
        &mut config,
        "ready",
        vec![],
        collab.notifications,
        t4,
        &events_root,
    )
    .unwrap_err();
    match err {
        pairflow::CoreError::ConvergenceDenied(errors) => {
            assert!(errors.iter().any(|e| e.contains("P0/P1") || e.contains("no open")));
        }
        other => panic!("expected ConvergenceDenied, got {other:?}"),
    }
    let after_state = pairflow::state_store::StateStore::read(&layout.state_path()).unwrap();
    assert_eq!(before_state.snapshot, after_state.snapshot);
}

/// S5 — two independent bubbles handle a PASS concurrently with no
/// cross-bubble interleaving: each transcript gains exactly one new
/// envelope and each state shows the reviewer now active.
#[test]
fn s5_concurrent_pass_across_two_bubbles_is_independent() {
    let dir = tempfile::tempdir().unwrap();
    let repo_root = std::fs::canonicalize(dir.path()).unwrap();
    let events_root = repo_root.join("events");
    let t0: DateTime<Utc> = "2026-03-02T00:00:00Z".parse().unwrap();

    let collab_a = collaborators();
    let collab_b = collaborators();
    let (layout_a, config_a) = bootstrapped_bubble("b_a", &repo_root, t0, &events_root, &collab_a);
    let (layout_b, config_b) = bootstrapped_bubble("b_b", &repo_root, t0, &events_root, &collab_b);

    let layout_a = Arc::new(layout_a);
    let layout_b = Arc::new(layout_b);
    let events_root_a = Arc::new(events_root.clone());
    let events_root_b = Arc::new(events_root.clone());

    let la = Arc::clone(&layout_a);
    let ea = Arc::clone(&events_root_a);
    let mut config_a_owned = config_a;
    let handle_a = std::thread::spawn(move || {
        commands::pass(
            &la,
            &mut config_a_owned,
            PassRequest {
                summary: "impl-a".to_string(),
                intent: None,
                findings: None,
                refs: vec![],
            },
            t0 + chrono::Duration::seconds(5),
            &ea,
        )
        .unwrap()
    });

    let lb = Arc::clone(&layout_b);
    let eb = Arc::clone(&events_root_b);
    let mut config_b_owned = config_b;
    let handle_b = std::thread::spawn(move || {
        commands::pass(
            &lb,
            &mut config_b_owned,
            PassRequest {
                summary: "impl-b".to_string(),
                intent: None,
                findings: None,
                refs: vec![],
            },
            t0 + chrono::Duration::seconds(5),
            &eb,
        )
        .unwrap()
    });

    let outcome_a = handle_a.join().unwrap();
    let outcome_b = handle_b.join().unwrap();

    assert_eq!(outcome_a.snapshot.active_role, Some(Role::Reviewer));
    assert_eq!(outcome_b.snapshot.active_role, Some(Role::Reviewer));
    assert_eq!(outcome_a.envelopes.len(), 1);
    assert_eq!(outcome_b.envelopes.len(), 1);

    let transcript_a = pairflow::transcript_store::TranscriptStore::read(
        &layout_a.transcript_path(),
        pairflow::transcript_store::ReadOptions {
            allow_missing: false,
            tolerate_partial_final_line: false,
        },
    )
    .unwrap();
    let transcript_b = pairflow::transcript_store::TranscriptStore::read(
        &layout_b.transcript_path(),
        pairflow::transcript_store::ReadOptions {
            allow_missing: false,
            tolerate_partial_final_line: false,
        },
    )
    .unwrap();
    assert_eq!(transcript_a.len(), 2); // TASK + PASS
    assert_eq!(transcript_b.len(), 2);
    assert!(transcript_a.iter().all(|e| e.bubble_id == "b_a"));
    assert!(transcript_b.iter().all(|e| e.bubble_id == "b_b"));
}

/// S6 — a lock sentinel left behind by a dead pid is recovered within the
/// configured timeout; a lock held by the current (live) process is not.
#[test]
fn s6_stale_lock_recovered_live_lock_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("b1.lock");

    // A pid essentially guaranteed not to be alive.
    let stale_body = serde_json::json!({
        "version": 1,
        "pid": 999_999,
        "acquired_at": "2026-01-01T00:00:00Z",
    });
    std::fs::write(&lock_path, serde_json::to_vec(&stale_body).unwrap()).unwrap();
    // Let the sentinel's mtime actually age past `stale_after` (a zero
    // `stale_after` is a rejected programming error per §4.1, not a
    // shortcut for "already stale").
    std::thread::sleep(std::time::Duration::from_millis(40));

    let opts = pairflow::lock::LockOptions {
        timeout: std::time::Duration::from_millis(500),
        poll_interval: std::time::Duration::from_millis(10),
        stale_after: std::time::Duration::from_millis(10),
        ensure_parent_dir: false,
    };
    let guard = pairflow::lock::FileLock::acquire(&lock_path, opts).unwrap();
    drop(guard);
    assert!(!lock_path.exists());

    let live_body = serde_json::json!({
        "version": 1,
        "pid": std::process::id(),
        "acquired_at": "2026-01-01T00:00:00Z",
    });
    std::fs::write(&lock_path, serde_json::to_vec(&live_body).unwrap()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(40));
    let opts = pairflow::lock::LockOptions {
        timeout: std::time::Duration::from_millis(80),
        poll_interval: std::time::Duration::from_millis(10),
        stale_after: std::time::Duration::from_millis(10),
        ensure_parent_dir: false,
    };
    let err = pairflow::lock::FileLock::acquire(&lock_path, opts).unwrap_err();
    assert_eq!(err.kind_name(), "lock_timeout");
    std::fs::remove_file(&lock_path).ok();
}
