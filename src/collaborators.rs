use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::io::AtomicFileStore;
use crate::lock::{FileLock, LockOptions};
use crate::model::config::LocalOverlayConfig;

/// Narrow external-collaborator contracts (§6.2). `ProtocolCommands` depend
/// only on these traits; the concrete adapters below are real but
/// deliberately thin, grounded in the teacher's own `git.rs`,
/// `autopilot::worker::create_worktree`, `autopilot::tmux`, and
/// `approval::send_notification`.
pub struct BootstrapRequest<'a> {
    pub repo_path: &'a Path,
    pub base_branch: &'a str,
    pub bubble_branch: &'a str,
    pub worktree_path: &'a Path,
    pub local_overlay: Option<&'a LocalOverlayConfig>,
}

#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub base_ref: String,
    pub bubble_branch: String,
    pub worktree_path: PathBuf,
}

pub struct CleanupRequest<'a> {
    pub repo_path: &'a Path,
    pub bubble_branch: &'a str,
    pub worktree_path: &'a Path,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    pub removed_worktree: bool,
    pub removed_branch: bool,
}

pub trait WorkspaceManager {
    fn bootstrap(&self, req: &BootstrapRequest) -> CoreResult<BootstrapOutcome>;
    fn cleanup(&self, req: &CleanupRequest) -> CoreResult<CleanupOutcome>;
}

#[derive(Debug, Clone)]
pub struct VcsCommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub trait VcsRunner {
    fn run(&self, args: &[&str], cwd: &Path, allow_failure: bool) -> CoreResult<VcsCommandOutcome>;
}

pub trait TerminalManager {
    fn launch(&self, session: &str, cwd: &Path, command: &str) -> CoreResult<()>;
    fn terminate(&self, session: &str) -> CoreResult<()>;
    fn respawn_pane(&self, session: &str, command: &str) -> CoreResult<()>;
    fn send_input(&self, session: &str, input: &str) -> CoreResult<()>;
    fn session_alive(&self, session: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSessionEntry {
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub tmux_session_name: String,
    pub updated_at: String,
}

pub trait RuntimeSessionRegistry {
    fn read(&self, bubble_id: &str) -> CoreResult<Option<RuntimeSessionEntry>>;
    fn upsert(&self, bubble_id: &str, entry: RuntimeSessionEntry) -> CoreResult<()>;
    fn remove(&self, bubble_id: &str) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    WaitingHuman,
    Converged,
}

#[derive(Debug, Clone)]
pub struct NotificationOutcome {
    pub attempted: bool,
    pub delivered: bool,
    pub reason: Option<String>,
}

pub trait NotificationSink {
    fn emit(&self, bubble_id: &str, kind: NotificationKind) -> NotificationOutcome;
}

fn run_command(program: &str, args: &[&str], cwd: &Path) -> CoreResult<VcsCommandOutcome> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| CoreError::ExternalFailure {
            collaborator: program.to_string(),
            message: e.to_string(),
        })?;
    Ok(VcsCommandOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Workspace manager + VCS runner over the system `git` binary. Grounded in
/// `task::git`'s plain `git` subprocess calls and
/// `autopilot::worker::create_worktree`'s `git worktree add` sequence,
/// generalized to synchronous `std::process::Command` — the rest of the
/// core is synchronous-first and has no call site that needs the teacher's
/// `tokio::process::Command`, so this crate does not carry a `tokio`
/// dependency for it.
pub struct GitWorkspace;

impl GitWorkspace {
    fn apply_local_overlay(
        repo_path: &Path,
        worktree_path: &Path,
        overlay: &LocalOverlayConfig,
    ) -> CoreResult<()> {
        if !overlay.enabled {
            return Ok(());
        }
        for entry in &overlay.entries {
            let src = repo_path.join(entry);
            let dst = worktree_path.join(entry);
            if !src.exists() {
                continue;
            }
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match overlay.mode {
                crate::model::config::OverlayMode::Copy => {
                    std::fs::copy(&src, &dst)?;
                }
                crate::model::config::OverlayMode::Symlink => {
                    #[cfg(unix)]
                    {
                        std::os::unix::fs::symlink(&src, &dst).or_else(|e| {
                            if e.kind() == std::io::ErrorKind::AlreadyExists {
                                Ok(())
                            } else {
                                Err(e)
                            }
                        })?;
                    }
                    #[cfg(not(unix))]
                    {
                        std::fs::copy(&src, &dst)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl VcsRunner for GitWorkspace {
    fn run(&self, args: &[&str], cwd: &Path, allow_failure: bool) -> CoreResult<VcsCommandOutcome> {
        let outcome = run_command("git", args, cwd)?;
        if outcome.exit_code != 0 && !allow_failure {
            return Err(CoreError::ExternalFailure {
                collaborator: "git".to_string(),
                message: format!("git {:?} exited {}: {}", args, outcome.exit_code, outcome.stderr),
            });
        }
        Ok(outcome)
    }
}

impl WorkspaceManager for GitWorkspace {
    fn bootstrap(&self, req: &BootstrapRequest) -> CoreResult<BootstrapOutcome> {
        if let Some(parent) = req.worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.run(
            &["worktree", "add", "-b", req.bubble_branch, &path_str(req.worktree_path), req.base_branch],
            req.repo_path,
            false,
        )?;
        if let Some(overlay) = req.local_overlay {
            Self::apply_local_overlay(req.repo_path, req.worktree_path, overlay)?;
        }
        Ok(BootstrapOutcome {
            base_ref: req.base_branch.to_string(),
            bubble_branch: req.bubble_branch.to_string(),
            worktree_path: req.worktree_path.to_path_buf(),
        })
    }

    fn cleanup(&self, req: &CleanupRequest) -> CoreResult<CleanupOutcome> {
        let mut outcome = CleanupOutcome::default();
        if req.worktree_path.exists() {
            self.run(
                &["worktree", "remove", "--force", &path_str(req.worktree_path)],
                req.repo_path,
                true,
            )?;
            outcome.removed_worktree = true;
        }
        let branch_exists = self
            .run(&["rev-parse", "--verify", req.bubble_branch], req.repo_path, true)?
            .exit_code
            == 0;
        if branch_exists {
            self.run(&["branch", "-D", req.bubble_branch], req.repo_path, true)?;
            outcome.removed_branch = true;
        }
        Ok(outcome)
    }
}

fn path_str(p: &Path) -> String {
    p.display().to_string()
}

/// tmux-only terminal manager. Grounded in `autopilot::mux`'s tmux variant;
/// the zellij variant is dropped for this crate's default adapter (see
/// DESIGN.md).
pub struct TmuxSession;

impl TerminalManager for TmuxSession {
    fn launch(&self, session: &str, cwd: &Path, command: &str) -> CoreResult<()> {
        let outcome = run_command(
            "tmux",
            &["new-session", "-d", "-s", session, "-c", &path_str(cwd), command],
            cwd,
        )?;
        if outcome.exit_code != 0 {
            return Err(CoreError::ExternalFailure {
                collaborator: "tmux".to_string(),
                message: format!("new-session failed: {}", outcome.stderr),
            });
        }
        Ok(())
    }

    fn terminate(&self, session: &str) -> CoreResult<()> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let _ = run_command("tmux", &["kill-session", "-t", session], &cwd)?;
        Ok(())
    }

    fn respawn_pane(&self, session: &str, command: &str) -> CoreResult<()> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let outcome = run_command("tmux", &["respawn-pane", "-t", session, "-k", command], &cwd)?;
        if outcome.exit_code != 0 {
            return Err(CoreError::ExternalFailure {
                collaborator: "tmux".to_string(),
                message: format!("respawn-pane failed: {}", outcome.stderr),
            });
        }
        Ok(())
    }

    fn send_input(&self, session: &str, input: &str) -> CoreResult<()> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let outcome = run_command("tmux", &["send-keys", "-t", session, input, "Enter"], &cwd)?;
        if outcome.exit_code != 0 {
            return Err(CoreError::ExternalFailure {
                collaborator: "tmux".to_string(),
                message: format!("send-keys failed: {}", outcome.stderr),
            });
        }
        Ok(())
    }

    fn session_alive(&self, session: &str) -> bool {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        run_command("tmux", &["has-session", "-t", session], &cwd)
            .map(|o| o.exit_code == 0)
            .unwrap_or(false)
    }
}

/// Runtime-session registry: one JSON map file, grounded in
/// `autopilot::markers`'s per-task marker-file convention generalized into a
/// single map instead of one file per entry.
pub struct JsonRuntimeSessionRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonRuntimeSessionRegistry {
    pub fn new(path: PathBuf) -> Self {
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    fn read_map(&self) -> CoreResult<std::collections::BTreeMap<String, RuntimeSessionEntry>> {
        match AtomicFileStore::read_optional(&self.path)? {
            None => Ok(std::collections::BTreeMap::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| CoreError::schema(e.to_string())),
        }
    }

    fn write_map(&self, map: &std::collections::BTreeMap<String, RuntimeSessionEntry>) -> CoreResult<()> {
        let bytes = serde_json::to_vec_pretty(map).map_err(|e| CoreError::schema(e.to_string()))?;
        AtomicFileStore::atomic_replace(&self.path, &bytes, true)
    }
}

impl RuntimeSessionRegistry for JsonRuntimeSessionRegistry {
    fn read(&self, bubble_id: &str) -> CoreResult<Option<RuntimeSessionEntry>> {
        Ok(self.read_map()?.get(bubble_id).cloned())
    }

    fn upsert(&self, bubble_id: &str, entry: RuntimeSessionEntry) -> CoreResult<()> {
        let _guard = FileLock::acquire(&self.lock_path, LockOptions {
            ensure_parent_dir: true,
            ..Default::default()
        })?;
        let mut map = self.read_map()?;
        map.insert(bubble_id.to_string(), entry);
        self.write_map(&map)
    }

    fn remove(&self, bubble_id: &str) -> CoreResult<()> {
        let _guard = FileLock::acquire(&self.lock_path, LockOptions {
            ensure_parent_dir: true,
            ..Default::default()
        })?;
        let mut map = self.read_map()?;
        map.remove(bubble_id);
        self.write_map(&map)
    }
}

/// Grounded in `approval::send_notification`'s macOS `osascript` call;
/// non-fatal and a no-op everywhere else.
pub struct DefaultNotificationSink;

impl NotificationSink for DefaultNotificationSink {
    fn emit(&self, bubble_id: &str, kind: NotificationKind) -> NotificationOutcome {
        if !cfg!(target_os = "macos") {
            return NotificationOutcome {
                attempted: false,
                delivered: false,
                reason: Some("notifications not supported on this platform".to_string()),
            };
        }
        let title = match kind {
            NotificationKind::WaitingHuman => "pairflow: waiting on you",
            NotificationKind::Converged => "pairflow: bubble converged",
        };
        let script = format!(
            "display notification \"bubble {bubble_id}\" with title \"{title}\"",
        );
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match run_command("osascript", &["-e", &script], &cwd) {
            Ok(outcome) if outcome.exit_code == 0 => NotificationOutcome {
                attempted: true,
                delivered: true,
                reason: None,
            },
            Ok(outcome) => NotificationOutcome {
                attempted: true,
                delivered: false,
                reason: Some(outcome.stderr),
            },
            Err(e) => NotificationOutcome {
                attempted: true,
                delivered: false,
                reason: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_session_registry_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JsonRuntimeSessionRegistry::new(dir.path().join("sessions.json"));
        assert!(registry.read("b1").unwrap().is_none());
        registry
            .upsert(
                "b1",
                RuntimeSessionEntry {
                    repo_path: "/repo".into(),
                    worktree_path: "/repo/worktrees/b1".into(),
                    tmux_session_name: "pf-b1".to_string(),
                    updated_at: "2026-01-01T00:00:00Z".to_string(),
                },
            )
            .unwrap();
        let entry = registry.read("b1").unwrap().unwrap();
        assert_eq!(entry.tmux_session_name, "pf-b1");
        registry.remove("b1").unwrap();
        assert!(registry.read("b1").unwrap().is_none());
    }

    #[test]
    fn notification_sink_never_panics_off_macos() {
        let sink = DefaultNotificationSink;
        let outcome = sink.emit("b1", NotificationKind::Converged);
        if !cfg!(target_os = "macos") {
            assert!(!outcome.attempted);
        }
    }
}
