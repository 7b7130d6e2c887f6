use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use pairflow::collaborators::{
    DefaultNotificationSink, GitWorkspace, JsonRuntimeSessionRegistry, RuntimeSessionRegistry,
    TerminalManager, TmuxSession, VcsRunner,
};
use pairflow::commands::{self, CommandOutcome, CreateRequest, DeleteOutcome, WatchdogSweepOutcome};
use pairflow::context::{resolve_by_id, resolve_from_workspace_cwd, ResolvedBubble};
use pairflow::metrics::MetricsEmitter;
use pairflow::model::agent::AgentName;
use pairflow::model::agent::AgentPair;
use pairflow::model::config::{
    CommandsConfig, LocalOverlayConfig, NotificationsConfig, OverlayMode, QualityMode,
    ReviewerContextMode, WorkMode,
};
use pairflow::model::envelope::{Decision, Finding, PassIntent, Severity};
use pairflow::paths::BubbleLayout;
use pairflow::repo_registry::RepoRegistry;
use pairflow::transcript_store::{ReadOptions, TranscriptStore};

#[derive(Debug, Parser)]
#[command(name = "pf")]
#[command(about = "Orchestrates paired implementer/reviewer coding agents, one bubble per task")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Hand a PASS envelope to the other side of the pair")]
    Pass(PassArgs),
    #[command(about = "Escalate a question to the human and block on a reply")]
    AskHuman(AskHumanArgs),
    #[command(about = "Declare convergence and request human approval")]
    Converged(ConvergedArgs),
    #[command(subcommand, about = "Bubble lifecycle commands")]
    Bubble(BubbleCommand),
    #[command(subcommand, about = "Metrics reporting")]
    Metrics(MetricsCommand),
    #[command(about = "Start the UI SSE/HTTP server")]
    Ui(UiArgs),
    #[command(subcommand, about = "Repo registry maintenance")]
    Repo(RepoCommand),
}

#[derive(Debug, Args)]
struct ContextArgs {
    #[arg(long, help = "Bubble id; inferred from the current worktree when omitted")]
    id: Option<String>,
    #[arg(long, help = "Repo root path; inferred from --id/cwd when omitted")]
    repo: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PassArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Summary of the work handed off")]
    summary: String,
    #[arg(long = "ref", help = "A reference this pass cites; may be repeated")]
    refs: Vec<String>,
    #[arg(long, help = "task|review|fix_request; defaults to the role-appropriate intent")]
    intent: Option<String>,
    #[arg(
        long = "finding",
        help = "SEVERITY:Title[|ref1,ref2] where SEVERITY is P0|P1|P2|P3; may be repeated"
    )]
    findings: Vec<String>,
    #[arg(long, help = "Explicitly declare no findings accompany this pass")]
    no_findings: bool,
}

#[derive(Debug, Args)]
struct AskHumanArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "The question to raise")]
    question: String,
    #[arg(long = "ref", help = "A reference this question cites; may be repeated")]
    refs: Vec<String>,
}

#[derive(Debug, Args)]
struct ConvergedArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Summary of why the pair believes this bubble has converged")]
    summary: String,
    #[arg(long = "ref", help = "A reference this summary cites; may be repeated")]
    refs: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum BubbleCommand {
    #[command(about = "Create a new bubble")]
    Create(BubbleCreateArgs),
    #[command(about = "Bootstrap the workspace and launch the implementer")]
    Start(BubbleIdArgs),
    #[command(about = "Cancel a bubble and tear down its runtime session")]
    Stop(BubbleIdArgs),
    #[command(about = "Archive and remove a bubble's directory")]
    Delete(BubbleDeleteArgs),
    #[command(about = "Run the bubble's configured open_command against its worktree")]
    Open(BubbleIdArgs),
    #[command(about = "Attach this terminal to the bubble's tmux session")]
    Attach(BubbleIdArgs),
    #[command(about = "Relaunch the terminal session if it is not alive")]
    Resume(BubbleIdArgs),
    #[command(about = "Print unread human-facing envelopes from inbox.ndjson")]
    Inbox(BubbleIdArgs),
    #[command(about = "Print the current state snapshot")]
    Status(BubbleStatusArgs),
    #[command(about = "Evaluate (and act on) the watchdog time predicate")]
    Watchdog(BubbleWatchdogArgs),
    #[command(about = "List bubbles under a repo")]
    List(BubbleListArgs),
    #[command(about = "Read-only consistency check between tmux/registry/state")]
    Reconcile(BubbleIdArgs),
    #[command(about = "Stage files and commit an approved bubble")]
    Commit(BubbleCommitArgs),
    #[command(about = "Merge a bubble's branch into its base branch")]
    Merge(BubbleMergeArgs),
    #[command(about = "Approve or revise a bubble awaiting approval")]
    Approve(BubbleApproveArgs),
    #[command(about = "Request rework; dispatches by current bubble state")]
    RequestRework(BubbleRequestReworkArgs),
    #[command(about = "Reply to an open human question and resume the active agent")]
    Reply(BubbleReplyArgs),
}

#[derive(Debug, Args)]
struct BubbleIdArgs {
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Debug, Args)]
struct BubbleStatusArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Emit JSON instead of a human-readable summary")]
    json: bool,
}

#[derive(Debug, Args)]
struct BubbleWatchdogArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(
        long,
        help = "Confirm the deferred rework message was actually delivered to the stalled agent"
    )]
    rework_delivered: bool,
}

#[derive(Debug, Args)]
struct BubbleListArgs {
    #[arg(long, help = "Repo root to list bubbles under; defaults to cwd")]
    repo: Option<PathBuf>,
    #[arg(long, help = "Emit JSON instead of a table")]
    json: bool,
}

#[derive(Debug, Args)]
struct BubbleDeleteArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Delete even if the tmux session, worktree, or branch is still live")]
    force: bool,
}

#[derive(Debug, Args)]
struct BubbleCommitArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Commit message")]
    message: String,
    #[arg(long = "file", help = "A file path (relative to the worktree) to stage; may be repeated")]
    files: Vec<String>,
    #[arg(long = "ref", help = "A reference the done package cites; may be repeated")]
    refs: Vec<String>,
}

#[derive(Debug, Args)]
struct BubbleMergeArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Delete the bubble branch after a successful merge")]
    delete_branch: bool,
}

#[derive(Debug, Args)]
struct BubbleApproveArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Optional message to attach to the decision")]
    message: Option<String>,
}

#[derive(Debug, Args)]
struct BubbleRequestReworkArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Rework message")]
    message: String,
    #[arg(long = "ref", help = "A reference this rework request cites; may be repeated")]
    refs: Vec<String>,
}

#[derive(Debug, Args)]
struct BubbleReplyArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long, help = "Reply message")]
    message: String,
}

#[derive(Debug, Args)]
struct BubbleCreateArgs {
    #[arg(long, help = "Bubble id")]
    id: String,
    #[arg(long, help = "Repo root path")]
    repo: PathBuf,
    #[arg(long, default_value = "main", help = "Base branch the bubble branches from")]
    base_branch: String,
    #[arg(long, help = "Bubble branch name; defaults to bubble/<id>")]
    bubble_branch: Option<String>,
    #[arg(long, default_value = "worktree", help = "worktree|clone")]
    work_mode: String,
    #[arg(long, default_value = "strict", help = "strict")]
    quality_mode: String,
    #[arg(long, default_value = "fresh", help = "fresh|persistent")]
    reviewer_context_mode: String,
    #[arg(long, default_value_t = 30, help = "Watchdog idle timeout, in minutes")]
    watchdog_timeout_minutes: u32,
    #[arg(long, default_value_t = 20, help = "Max ping-pong rounds before escalation")]
    max_rounds: u32,
    #[arg(long, default_value_t = true, help = "Require human approval before commit")]
    commit_requires_approval: bool,
    #[arg(long, help = "Shell template run by `bubble open`; must contain {{worktree_path}}")]
    open_command: Option<String>,
    #[arg(long, default_value = "claude", help = "claude|codex|opencode")]
    implementer: String,
    #[arg(long, default_value = "codex", help = "claude|codex|opencode")]
    reviewer: String,
    #[arg(long, default_value = "", help = "Test command recorded in bubble.toml")]
    test_command: String,
    #[arg(long, default_value = "", help = "Typecheck command recorded in bubble.toml")]
    typecheck_command: String,
    #[arg(long, help = "Enable desktop notifications on WAITING_HUMAN/converged")]
    notifications: bool,
    #[arg(
        long = "overlay",
        help = "Local-only file to overlay into the worktree (not committed); may be repeated"
    )]
    overlay_entries: Vec<String>,
    #[arg(long, default_value = "symlink", help = "symlink|copy, used when --overlay is given")]
    overlay_mode: String,
    #[arg(long, help = "Task description handed to the implementer")]
    task: String,
}

#[derive(Debug, Subcommand)]
enum MetricsCommand {
    #[command(about = "Report recorded lifecycle events over a date range")]
    Report(MetricsReportArgs),
}

#[derive(Debug, Args)]
struct MetricsReportArgs {
    #[arg(long, help = "Start date, YYYY-MM-DD or strict UTC ISO-8601")]
    from: String,
    #[arg(long, help = "End date, YYYY-MM-DD or strict UTC ISO-8601")]
    to: String,
    #[arg(long, help = "Restrict to events recorded under this repo path")]
    repo: Option<PathBuf>,
    #[arg(long, default_value = "table", help = "table|json")]
    format: String,
}

#[derive(Debug, Args)]
struct UiArgs {
    #[arg(long = "repo", help = "Repo to surface in the UI; may be repeated")]
    repos: Vec<PathBuf>,
    #[arg(long, default_value_t = 4317, help = "Port to bind")]
    port: u16,
    #[arg(long, default_value = "127.0.0.1", help = "Host to bind")]
    host: String,
}

#[derive(Debug, Subcommand)]
enum RepoCommand {
    #[command(about = "Register a repo with pairflow")]
    Add(RepoAddArgs),
    #[command(about = "List registered repos")]
    List(RepoListArgs),
    #[command(about = "Unregister a repo")]
    Remove(RepoRemoveArgs),
}

#[derive(Debug, Args)]
struct RepoAddArgs {
    path: PathBuf,
    #[arg(long, help = "Display label for this repo")]
    label: Option<String>,
}

#[derive(Debug, Args)]
struct RepoListArgs {
    #[arg(long, help = "Emit JSON instead of a table")]
    json: bool,
}

#[derive(Debug, Args)]
struct RepoRemoveArgs {
    path: PathBuf,
}

/// The `DeleteOutcome::RequiresConfirmation` sentinel exit code carved out
/// by the CLI surface, distinct from the generic error exit code 1.
const EXIT_REQUIRES_CONFIRMATION: i32 = 2;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("pf: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Pass(args) => pass(args),
        Commands::AskHuman(args) => ask_human(args),
        Commands::Converged(args) => converged(args),
        Commands::Bubble(cmd) => bubble(cmd),
        Commands::Metrics(cmd) => metrics(cmd),
        Commands::Ui(args) => ui(args),
        Commands::Repo(cmd) => repo(cmd),
    }
}

fn events_root() -> Result<PathBuf> {
    if let Ok(raw) = std::env::var("PAIRFLOW_METRICS_EVENTS_ROOT") {
        return Ok(PathBuf::from(raw));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("could not resolve home directory"))?;
    Ok(home.join(".pairflow").join("metrics").join("events"))
}

fn resolve_context(ctx: &ContextArgs) -> Result<ResolvedBubble> {
    let cwd = std::env::current_dir().context("resolving current directory")?;
    match &ctx.id {
        Some(id) => resolve_by_id(id, ctx.repo.as_deref(), Some(&cwd))
            .map_err(|e| anyhow!(e).context(format!("resolving bubble '{id}'"))),
        None => resolve_from_workspace_cwd(&cwd, &GitWorkspace)
            .map_err(|e| anyhow!(e).context("resolving bubble from the current worktree")),
    }
}

fn runtime_session_registry(repo_root: &Path) -> JsonRuntimeSessionRegistry {
    JsonRuntimeSessionRegistry::new(repo_root.join(".pairflow").join("runtime-sessions.json"))
}

fn archive_root(repo_root: &Path) -> PathBuf {
    repo_root.join(".pairflow").join("archive")
}

/// `SEVERITY:Title[|ref1,ref2]`. `,` separates refs; `\,` escapes a literal
/// comma inside one ref; `|` is reserved as the title/refs divider.
fn parse_finding(raw: &str) -> Result<Finding> {
    let (severity_raw, rest) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("finding '{raw}' must be SEVERITY:Title[|ref1,ref2]"))?;
    let severity = match severity_raw {
        "P0" => Severity::P0,
        "P1" => Severity::P1,
        "P2" => Severity::P2,
        "P3" => Severity::P3,
        other => return Err(anyhow!("unknown finding severity '{other}'")),
    };

    let (title, refs_raw) = match rest.split_once('|') {
        Some((t, r)) => (t, Some(r)),
        None => (rest, None),
    };
    if title.trim().is_empty() {
        return Err(anyhow!("finding '{raw}' has an empty title"));
    }

    let refs = match refs_raw {
        None => Vec::new(),
        Some(r) => split_escaped_refs(r),
    };

    Ok(Finding {
        severity,
        title: title.to_string(),
        detail: None,
        code: None,
        refs,
    })
}

fn split_escaped_refs(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => {
                out.push(current.clone());
                current.clear();
            }
            other => current.push(other),
        }
    }
    out.push(current);
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn print_outcome(outcome: &CommandOutcome) {
    println!(
        "bubble {} -> {} (round {})",
        outcome.snapshot.bubble_id, outcome.snapshot.state, outcome.snapshot.round
    );
    for env in &outcome.envelopes {
        println!("  appended {} ({})", env.id, env.msg_type.as_str());
    }
}

fn pass(args: PassArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let intent = args
        .intent
        .as_deref()
        .map(|raw| match raw {
            "task" => Ok(PassIntent::Task),
            "review" => Ok(PassIntent::Review),
            "fix_request" => Ok(PassIntent::FixRequest),
            other => Err(anyhow!("unknown intent '{other}'")),
        })
        .transpose()?;

    let findings = if args.no_findings {
        None
    } else if args.findings.is_empty() {
        None
    } else {
        Some(
            args.findings
                .iter()
                .map(|raw| parse_finding(raw))
                .collect::<Result<Vec<_>>>()?,
        )
    };

    let now = Utc::now();
    let outcome = commands::pass(
        &resolved.layout,
        &mut config,
        commands::PassRequest {
            summary: args.summary,
            intent,
            findings,
            refs: args.refs,
        },
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn ask_human(args: AskHumanArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let now = Utc::now();
    let outcome = commands::ask_human(
        &resolved.layout,
        &mut config,
        &args.question,
        args.refs,
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn converged(args: ConvergedArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let now = Utc::now();
    let outcome = commands::converged(
        &resolved.layout,
        &mut config,
        &args.summary,
        args.refs,
        &DefaultNotificationSink,
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn bubble(cmd: BubbleCommand) -> Result<i32> {
    match cmd {
        BubbleCommand::Create(args) => bubble_create(args),
        BubbleCommand::Start(args) => bubble_start(args),
        BubbleCommand::Stop(args) => bubble_stop(args),
        BubbleCommand::Delete(args) => bubble_delete(args),
        BubbleCommand::Open(args) => bubble_open(args),
        BubbleCommand::Attach(args) => bubble_attach(args),
        BubbleCommand::Resume(args) => bubble_resume(args),
        BubbleCommand::Inbox(args) => bubble_inbox(args),
        BubbleCommand::Status(args) => bubble_status(args),
        BubbleCommand::Watchdog(args) => bubble_watchdog(args),
        BubbleCommand::List(args) => bubble_list(args),
        BubbleCommand::Reconcile(args) => bubble_reconcile(args),
        BubbleCommand::Commit(args) => bubble_commit(args),
        BubbleCommand::Merge(args) => bubble_merge(args),
        BubbleCommand::Approve(args) => bubble_approve(args),
        BubbleCommand::RequestRework(args) => bubble_request_rework(args),
        BubbleCommand::Reply(args) => bubble_reply(args),
    }
}

fn collaborators<'a>(
    vcs: &'a GitWorkspace,
    terminal: &'a TmuxSession,
    registry: &'a JsonRuntimeSessionRegistry,
    notifications: &'a DefaultNotificationSink,
) -> commands::Collaborators<'a> {
    commands::Collaborators {
        workspace: vcs,
        vcs,
        terminal,
        registry,
        notifications,
    }
}

fn bubble_create(args: BubbleCreateArgs) -> Result<i32> {
    let implementer: AgentName = args.implementer.parse().map_err(|e| anyhow!("{e}"))?;
    let reviewer: AgentName = args.reviewer.parse().map_err(|e| anyhow!("{e}"))?;
    let agents = AgentPair::new(implementer, reviewer).map_err(|e| anyhow!(e))?;

    let work_mode = match args.work_mode.as_str() {
        "worktree" => WorkMode::Worktree,
        "clone" => WorkMode::Clone,
        other => return Err(anyhow!("unknown work mode '{other}'")),
    };
    let quality_mode = match args.quality_mode.as_str() {
        "strict" => QualityMode::Strict,
        other => return Err(anyhow!("unknown quality mode '{other}'")),
    };
    let reviewer_context_mode = match args.reviewer_context_mode.as_str() {
        "fresh" => ReviewerContextMode::Fresh,
        "persistent" => ReviewerContextMode::Persistent,
        other => return Err(anyhow!("unknown reviewer context mode '{other}'")),
    };

    let local_overlay = if args.overlay_entries.is_empty() {
        None
    } else {
        let mode = match args.overlay_mode.as_str() {
            "symlink" => OverlayMode::Symlink,
            "copy" => OverlayMode::Copy,
            other => return Err(anyhow!("unknown overlay mode '{other}'")),
        };
        Some(LocalOverlayConfig {
            enabled: true,
            mode,
            entries: args.overlay_entries,
        })
    };

    let bubble_branch = args
        .bubble_branch
        .unwrap_or_else(|| format!("bubble/{}", args.id));

    let now = Utc::now();
    let (_config, outcome) = commands::create(
        CreateRequest {
            id: &args.id,
            repo_path: &args.repo,
            base_branch: &args.base_branch,
            bubble_branch: &bubble_branch,
            work_mode,
            quality_mode,
            reviewer_context_mode,
            watchdog_timeout_minutes: args.watchdog_timeout_minutes,
            max_rounds: args.max_rounds,
            commit_requires_approval: args.commit_requires_approval,
            open_command: args.open_command,
            agents,
            commands: CommandsConfig {
                test: args.test_command,
                typecheck: args.typecheck_command,
            },
            notifications: NotificationsConfig {
                enabled: args.notifications,
                waiting_human_sound: None,
                converged_sound: None,
            },
            local_overlay,
            task: &args.task,
        },
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn bubble_start(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let vcs = GitWorkspace;
    let terminal = TmuxSession;
    let registry = runtime_session_registry(&resolved.repo_root);
    let notifications = DefaultNotificationSink;
    let collab = collaborators(&vcs, &terminal, &registry, &notifications);
    let now = Utc::now();
    let outcome = commands::start(&resolved.layout, &mut config, &collab, now, &events_root()?)
        .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn bubble_stop(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let vcs = GitWorkspace;
    let terminal = TmuxSession;
    let registry = runtime_session_registry(&resolved.repo_root);
    let notifications = DefaultNotificationSink;
    let collab = collaborators(&vcs, &terminal, &registry, &notifications);
    let now = Utc::now();
    let outcome = commands::stop(&resolved.layout, &mut config, &collab, now, &events_root()?)
        .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn bubble_delete(args: BubbleDeleteArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let config = resolved.config;
    let vcs = GitWorkspace;
    let terminal = TmuxSession;
    let registry = runtime_session_registry(&resolved.repo_root);
    let notifications = DefaultNotificationSink;
    let collab = collaborators(&vcs, &terminal, &registry, &notifications);
    let now = Utc::now();
    let outcome = commands::delete(
        &resolved.layout,
        &config,
        args.force,
        &collab,
        &archive_root(&resolved.repo_root),
        now,
    )
    .map_err(|e| anyhow!(e))?;
    match outcome {
        DeleteOutcome::AlreadyGone => {
            println!("bubble {} already gone", config.id);
            Ok(0)
        }
        DeleteOutcome::Deleted => {
            println!("bubble {} deleted", config.id);
            Ok(0)
        }
        DeleteOutcome::RequiresConfirmation { summary } => {
            println!("bubble {} requires --force to delete:", config.id);
            for line in summary {
                println!("  {line}");
            }
            Ok(EXIT_REQUIRES_CONFIRMATION)
        }
    }
}

/// `open`/`attach`/`resume`/`reconcile`/`merge` are CLI-layer conveniences
/// with no `ProtocolCommands` counterpart: they never touch `state.json` or
/// the transcript, so they live only here.
fn bubble_open(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let config = resolved.config;
    let open_command = config
        .open_command
        .as_ref()
        .ok_or_else(|| anyhow!("bubble {} has no open_command configured", config.id))?;
    let worktree_path = pairflow::paths::default_worktree_path(&config.repo_path, &config.id);
    let command = open_command.replace("{{worktree_path}}", &worktree_path.display().to_string());
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .context("spawning open_command")?;
    if !status.success() {
        return Err(anyhow!("open_command exited with {status}"));
    }
    Ok(0)
}

fn bubble_attach(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let config = resolved.config;
    let session = format!("pf-{}", config.id);
    let status = std::process::Command::new("tmux")
        .args(["attach-session", "-t", &session])
        .status()
        .context("attaching to tmux session")?;
    Ok(status.code().unwrap_or(1))
}

fn bubble_resume(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let config = resolved.config;
    let terminal = TmuxSession;
    let session = format!("pf-{}", config.id);
    if terminal.session_alive(&session) {
        println!("bubble {} session already alive", config.id);
        return Ok(0);
    }
    let registry = runtime_session_registry(&resolved.repo_root);
    let worktree_path = registry
        .read(&config.id)
        .map_err(|e| anyhow!(e))?
        .map(|entry| entry.worktree_path)
        .unwrap_or_else(|| pairflow::paths::default_worktree_path(&config.repo_path, &config.id));
    terminal
        .launch(&session, &worktree_path, "true")
        .map_err(|e| anyhow!(e))?;
    println!("bubble {} session relaunched", config.id);
    Ok(0)
}

fn bubble_inbox(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let envelopes = TranscriptStore::read(
        &resolved.layout.inbox_path(),
        ReadOptions {
            allow_missing: true,
            tolerate_partial_final_line: true,
        },
    )
    .map_err(|e| anyhow!(e))?;
    for env in &envelopes {
        let line = serde_json::to_string(env).context("serializing inbox envelope")?;
        println!("{line}");
    }
    Ok(0)
}

fn bubble_status(args: BubbleStatusArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let read = pairflow::state_store::StateStore::read(&resolved.layout.state_path())
        .map_err(|e| anyhow!(e))?;
    if args.json {
        let line = serde_json::to_string_pretty(&read.snapshot).context("serializing snapshot")?;
        println!("{line}");
    } else {
        println!("bubble: {}", read.snapshot.bubble_id);
        println!("state: {}", read.snapshot.state);
        println!("round: {}", read.snapshot.round);
        if let Some(agent) = read.snapshot.active_agent {
            println!(
                "active: {agent} as {}",
                read.snapshot.active_role.map(|r| r.as_str()).unwrap_or("?")
            );
        }
        if let Some(intent) = &read.snapshot.pending_rework_intent {
            println!("pending rework: {} ({:?})", intent.message, intent.status);
        }
    }
    Ok(0)
}

fn bubble_watchdog(args: BubbleWatchdogArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let notifications = DefaultNotificationSink;
    let now = Utc::now();
    let outcome = commands::watchdog_sweep(
        &resolved.layout,
        &mut config,
        commands::WatchdogSweepRequest {
            rework_delivery_confirmed: args.rework_delivered,
        },
        &notifications,
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    match outcome {
        WatchdogSweepOutcome::NoOp { reason } => {
            println!("bubble {} watchdog no-op: {reason}", config.id);
        }
        WatchdogSweepOutcome::Escalated(outcome) => {
            println!("bubble {} watchdog escalated to human", config.id);
            print_outcome(&outcome);
        }
        WatchdogSweepOutcome::ReworkApplied(outcome) => {
            println!("bubble {} deferred rework applied", config.id);
            print_outcome(&outcome);
        }
    }
    Ok(0)
}

fn bubble_list(args: BubbleListArgs) -> Result<i32> {
    let repo = match args.repo {
        Some(r) => r,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let bubbles_dir = pairflow::paths::bubbles_root(&repo);
    let mut rows = Vec::new();
    match std::fs::read_dir(&bubbles_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.context("reading bubbles directory")?;
                if !entry.path().is_dir() {
                    continue;
                }
                let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let layout = BubbleLayout::under_repo(&repo, &id);
                let Ok(read) = pairflow::state_store::StateStore::read(&layout.state_path()) else {
                    continue;
                };
                rows.push((id, read.snapshot.state.to_string(), read.snapshot.round));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("reading bubbles directory"),
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    if args.json {
        let json: Vec<_> = rows
            .iter()
            .map(|(id, state, round)| serde_json::json!({"id": id, "state": state, "round": round}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        for (id, state, round) in &rows {
            println!("{id}\t{state}\tround {round}");
        }
    }
    Ok(0)
}

fn bubble_reconcile(args: BubbleIdArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let config = resolved.config;
    let terminal = TmuxSession;
    let session = format!("pf-{}", config.id);
    let tmux_alive = terminal.session_alive(&session);
    let registry = runtime_session_registry(&resolved.repo_root);
    let registry_entry = registry.read(&config.id).map_err(|e| anyhow!(e))?;
    let read = pairflow::state_store::StateStore::read(&resolved.layout.state_path())
        .map_err(|e| anyhow!(e))?;

    println!("bubble {}: state={}", config.id, read.snapshot.state);
    println!("  tmux session {} alive: {tmux_alive}", session);
    println!("  runtime registry entry present: {}", registry_entry.is_some());
    let is_active = read.snapshot.state.is_active();
    if is_active && !tmux_alive {
        println!("  WARNING: bubble is active but its tmux session is not alive");
    }
    if !is_active && (tmux_alive || registry_entry.is_some()) {
        println!("  WARNING: bubble is not active but runtime session state remains");
    }
    Ok(0)
}

fn bubble_commit(args: BubbleCommitArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let vcs = GitWorkspace;
    let terminal = TmuxSession;
    let registry = runtime_session_registry(&resolved.repo_root);
    let notifications = DefaultNotificationSink;
    let collab = collaborators(&vcs, &terminal, &registry, &notifications);
    let now = Utc::now();
    let outcome = commands::commit(
        &resolved.layout,
        &mut config,
        commands::CommitRequest {
            commit_message: args.message,
            staged_files: args.files,
            refs: args.refs,
        },
        &collab,
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn bubble_merge(args: BubbleMergeArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let config = resolved.config;
    let vcs = GitWorkspace;
    vcs.run(
        &["merge", "--no-ff", &config.bubble_branch],
        &config.repo_path,
        false,
    )
    .map_err(|e| anyhow!(e))?;
    println!("merged {} into the current branch", config.bubble_branch);
    if args.delete_branch {
        vcs.run(&["branch", "-D", &config.bubble_branch], &config.repo_path, true)
            .map_err(|e| anyhow!(e))?;
        println!("deleted branch {}", config.bubble_branch);
    }
    Ok(0)
}

fn bubble_approve(args: BubbleApproveArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let now = Utc::now();
    let outcome = commands::decide(
        &resolved.layout,
        &mut config,
        Decision::Approve,
        args.message,
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

/// Dispatches by current state (§4.8.7/§4.8.8): a bubble awaiting approval
/// revises immediately; a bubble already waiting on a human queues a
/// deferred intent for the next watchdog sweep to apply.
fn bubble_request_rework(args: BubbleRequestReworkArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let now = Utc::now();
    let read = pairflow::state_store::StateStore::read(&resolved.layout.state_path())
        .map_err(|e| anyhow!(e))?;

    let outcome = match read.snapshot.state {
        pairflow::model::BubbleState::ReadyForApproval => commands::decide(
            &resolved.layout,
            &mut config,
            Decision::Revise,
            Some(args.message),
            now,
            &events_root()?,
        )
        .map_err(|e| anyhow!(e))?,
        pairflow::model::BubbleState::WaitingHuman => commands::request_rework_deferred(
            &resolved.layout,
            &mut config,
            &args.message,
            args.refs,
            now,
            &events_root()?,
        )
        .map_err(|e| anyhow!(e))?,
        other => {
            return Err(anyhow!(
                "request-rework is only valid from READY_FOR_APPROVAL or WAITING_HUMAN, bubble is {other}"
            ))
        }
    };
    print_outcome(&outcome);
    Ok(0)
}

fn bubble_reply(args: BubbleReplyArgs) -> Result<i32> {
    let resolved = resolve_context(&args.context)?;
    let mut config = resolved.config;
    let now = Utc::now();
    let outcome = commands::human_reply(
        &resolved.layout,
        &mut config,
        &args.message,
        now,
        &events_root()?,
    )
    .map_err(|e| anyhow!(e))?;
    print_outcome(&outcome);
    Ok(0)
}

fn parse_report_boundary(raw: &str, end_of_day: bool) -> Result<chrono::DateTime<Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| anyhow!("'{raw}' is not YYYY-MM-DD or strict UTC ISO-8601"))?;
    let time = if end_of_day {
        chrono::NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap()
    } else {
        chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap()
    };
    Ok(chrono::DateTime::from_naive_utc_and_offset(date.and_time(time), Utc))
}

fn metrics(cmd: MetricsCommand) -> Result<i32> {
    match cmd {
        MetricsCommand::Report(args) => metrics_report(args),
    }
}

fn metrics_report(args: MetricsReportArgs) -> Result<i32> {
    let from = parse_report_boundary(&args.from, false)?;
    let to = parse_report_boundary(&args.to, true)?;
    if from > to {
        return Err(anyhow!("--from must not be after --to"));
    }

    let root = events_root()?;
    let mut cursor = from;
    let mut shards = Vec::new();
    loop {
        let shard = MetricsEmitter::shard_path(&root, cursor);
        if !shards.contains(&shard) {
            shards.push(shard);
        }
        let next = cursor + chrono::Duration::days(28);
        if next > to {
            break;
        }
        cursor = next;
    }

    let mut rows: Vec<serde_json::Value> = Vec::new();
    for shard in shards {
        let raw = match std::fs::read_to_string(&shard) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("reading {}", shard.display())),
        };
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(line).context("parsing metrics record")?;
            let Some(ts_str) = value.get("ts").and_then(|v| v.as_str()) else {
                continue;
            };
            let Ok(ts) = chrono::DateTime::parse_from_rfc3339(ts_str) else {
                continue;
            };
            let ts = ts.with_timezone(&Utc);
            if ts < from || ts > to {
                continue;
            }
            if let Some(repo_filter) = &args.repo {
                let matches = value
                    .get("repo_path")
                    .and_then(|v| v.as_str())
                    .map(|p| Path::new(p) == repo_filter.as_path())
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            rows.push(value);
        }
    }

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        "table" => {
            for row in &rows {
                let ts = row.get("ts").and_then(|v| v.as_str()).unwrap_or("");
                let bubble = row.get("bubble_id").and_then(|v| v.as_str()).unwrap_or("");
                let event = row.get("event_type").and_then(|v| v.as_str()).unwrap_or("");
                let actor = row.get("actor_role").and_then(|v| v.as_str()).unwrap_or("");
                println!("{ts}\t{bubble}\t{event}\t{actor}");
            }
        }
        other => return Err(anyhow!("unknown format '{other}'")),
    }
    Ok(0)
}

fn ui(args: UiArgs) -> Result<i32> {
    println!(
        "pf ui is an external SSE/HTTP server, not part of this binary; would bind {}:{} for {} repo(s)",
        args.host,
        args.port,
        args.repos.len()
    );
    Ok(0)
}

fn repo(cmd: RepoCommand) -> Result<i32> {
    match cmd {
        RepoCommand::Add(args) => repo_add(args),
        RepoCommand::List(args) => repo_list(args),
        RepoCommand::Remove(args) => repo_remove(args),
    }
}

fn repo_add(args: RepoAddArgs) -> Result<i32> {
    let registry = RepoRegistry::new(RepoRegistry::default_path()?);
    let key = registry
        .add(&args.path, args.label, Utc::now())
        .map_err(|e| anyhow!(e))?;
    println!("registered {key}");
    Ok(0)
}

fn repo_list(args: RepoListArgs) -> Result<i32> {
    let registry = RepoRegistry::new(RepoRegistry::default_path()?);
    let entries = registry.list().map_err(|e| anyhow!(e))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!(
                "{}\t{}",
                entry.path,
                entry.label.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(0)
}

fn repo_remove(args: RepoRemoveArgs) -> Result<i32> {
    let registry = RepoRegistry::new(RepoRegistry::default_path()?);
    let existed = registry.remove(&args.path).map_err(|e| anyhow!(e))?;
    if existed {
        println!("removed {}", args.path.display());
    } else {
        println!("{} was not registered", args.path.display());
    }
    Ok(0)
}

