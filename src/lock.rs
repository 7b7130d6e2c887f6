use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub ensure_parent_dir: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_TIMEOUT,
            ensure_parent_dir: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    version: u32,
    pid: i64,
    acquired_at: String,
}

/// Holds an advisory lock on `path` until dropped, at which point the
/// sentinel file is removed. The held-scope is expected to run its task
/// exactly once and then let this guard drop on every exit path (normal
/// return, `?`-propagated error, or panic unwind).
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn warn_once_clamped(path: &Path) {
    static WARNED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    let set = WARNED.get_or_init(|| Mutex::new(HashSet::new()));
    let mut set = set.lock().unwrap_or_else(|e| e.into_inner());
    if set.insert(path.to_path_buf()) {
        eprintln!(
            "pairflow: lock stale_after exceeds timeout for {}; clamping to timeout",
            path.display()
        );
    }
}

fn pid_is_live(pid: i64) -> Result<bool, CoreError> {
    if pid <= 0 {
        return Ok(false);
    }
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        // EPERM means a process with that pid exists but we can't signal it:
        // still alive as far as staleness is concerned.
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(CoreError::Io(std::io::Error::from(e))),
    }
}

fn file_age(path: &Path) -> Result<Duration, std::io::Error> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

/// Reads the lock file body and reports whether it is eligible for stale
/// removal: pid absent, not a positive integer, or probing shows it's dead.
/// Permission or probe I/O errors propagate rather than being treated as
/// "probably stale".
fn is_eligible_for_removal(path: &Path) -> Result<bool, CoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CoreError::Io(e)),
    };
    if contents.trim().is_empty() {
        return Ok(true);
    }
    let body: LockBody = match serde_json::from_str(&contents) {
        Ok(b) => b,
        Err(_) => return Ok(true),
    };
    if body.pid <= 0 {
        return Ok(true);
    }
    pid_is_live(body.pid).map(|alive| !alive)
}

pub struct FileLock;

impl FileLock {
    /// Acquires the lock at `path`, blocking the current thread (via
    /// `std::thread::sleep` between polls, matching the synchronous-first
    /// style the rest of the core is built in) until it is owned or
    /// `opts.timeout` elapses.
    pub fn acquire(path: &Path, mut opts: LockOptions) -> Result<LockGuard, CoreError> {
        if opts.stale_after.is_zero() {
            return Err(CoreError::schema(
                "LockOptions::stale_after must not be zero (every lock would be immediately stale)",
            ));
        }
        if opts.stale_after > opts.timeout {
            warn_once_clamped(path);
            opts.stale_after = opts.timeout;
        }
        if opts.ensure_parent_dir {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let started = Instant::now();
        let pid = std::process::id() as i64;
        let body = LockBody {
            version: 1,
            pid,
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        let body_bytes = serde_json::to_vec(&body).expect("LockBody always serializes");

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    f.write_all(&body_bytes)?;
                    return Ok(LockGuard {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= opts.timeout {
                        return Err(CoreError::LockTimeout {
                            path: path.display().to_string(),
                        });
                    }

                    let age = file_age(path).unwrap_or(Duration::ZERO);
                    if age >= opts.stale_after {
                        // Re-read and re-probe once more right before removal
                        // to avoid racing a freshly written owner.
                        if is_eligible_for_removal(path)? && is_eligible_for_removal(path)? {
                            warn!(path = %path.display(), age_ms = age.as_millis() as u64, "removing stale lock with dead owner");
                            let _ = std::fs::remove_file(path);
                        }
                    }

                    std::thread::sleep(opts.poll_interval);
                }
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn acquire_and_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.lock");
        {
            let _guard = FileLock::acquire(&path, LockOptions::default()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.lock");
        let _holder = FileLock::acquire(&path, LockOptions::default()).unwrap();
        let opts = LockOptions {
            timeout: Duration::from_millis(60),
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(3600),
            ensure_parent_dir: false,
        };
        let err = FileLock::acquire(&path, opts).unwrap_err();
        assert_eq!(err.kind_name(), "lock_timeout");
    }

    #[test]
    fn stale_lock_with_dead_pid_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.lock");
        // A pid that is very unlikely to be alive.
        let body = LockBody {
            version: 1,
            pid: 999_999,
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        // Let the lock file's mtime actually age past `stale_after` rather
        // than exploiting a zero `stale_after` (the programming-error guard
        // above now rejects that outright).
        std::thread::sleep(Duration::from_millis(40));
        let opts = LockOptions {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(10),
            ensure_parent_dir: false,
        };
        let _guard = FileLock::acquire(&path, opts).unwrap();
    }

    #[test]
    fn live_pid_lock_is_never_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.lock");
        let body = LockBody {
            version: 1,
            pid: std::process::id() as i64,
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let opts = LockOptions {
            timeout: Duration::from_millis(80),
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(10),
            ensure_parent_dir: false,
        };
        let err = FileLock::acquire(&path, opts).unwrap_err();
        assert_eq!(err.kind_name(), "lock_timeout");
    }

    #[test]
    fn zero_stale_after_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.lock");
        let opts = LockOptions {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(0),
            ensure_parent_dir: false,
        };
        let err = FileLock::acquire(&path, opts).unwrap_err();
        assert_eq!(err.kind_name(), "schema_validation");
    }
}
