use std::path::Path;

use crate::error::CoreError;
use crate::fingerprint::fingerprint_of;
use crate::io::AtomicFileStore;
use crate::lock::{FileLock, LockOptions};
use crate::model::{BubbleConfig, BubbleStateSnapshot};

pub struct ReadResult {
    pub snapshot: BubbleStateSnapshot,
    pub fingerprint: String,
}

#[derive(Default)]
pub struct WriteExpectation<'a> {
    pub expected_fingerprint: Option<&'a str>,
    pub expected_state: Option<crate::model::BubbleState>,
}

/// Reads/writes `state.json` with fingerprint-based optimistic concurrency
/// (§4.3). Every write happens under `state.json.lock`.
pub struct StateStore;

fn render(snapshot: &BubbleStateSnapshot) -> Result<Vec<u8>, CoreError> {
    let mut s = serde_json::to_string_pretty(snapshot).map_err(|e| CoreError::schema(e.to_string()))?;
    s.push('\n');
    Ok(s.into_bytes())
}

fn parse(raw: &str) -> Result<BubbleStateSnapshot, CoreError> {
    serde_json::from_str(raw).map_err(|e| CoreError::schema(format!("state.json: {e}")))
}

impl StateStore {
    /// Write-if-not-exists. Validates, then writes.
    pub fn create(
        path: &Path,
        snapshot: &BubbleStateSnapshot,
        config: &BubbleConfig,
    ) -> Result<String, CoreError> {
        snapshot.validate(config)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = render(snapshot)?;
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        match opts.open(path) {
            Ok(mut f) => {
                use std::io::Write as _;
                f.write_all(&bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CoreError::StateConflict(format!(
                    "state already exists at {}",
                    path.display()
                )));
            }
            Err(e) => return Err(CoreError::Io(e)),
        }
        fingerprint_of(snapshot)
    }

    pub fn read(path: &Path) -> Result<ReadResult, CoreError> {
        let raw = AtomicFileStore::read_optional(path)?
            .ok_or_else(|| CoreError::BubbleNotFound(path.display().to_string()))?;
        let snapshot = parse(&raw)?;
        let fingerprint = fingerprint_of(&snapshot)?;
        Ok(ReadResult {
            snapshot,
            fingerprint,
        })
    }

    /// Writes `snapshot` under `lock_path`, enforcing CAS against whichever
    /// of `expected_fingerprint`/`expected_state` the caller supplied.
    pub fn write(
        path: &Path,
        lock_path: &Path,
        snapshot: &BubbleStateSnapshot,
        config: &BubbleConfig,
        expectation: WriteExpectation,
        lock_opts: LockOptions,
    ) -> Result<String, CoreError> {
        let _guard = FileLock::acquire(lock_path, lock_opts)?;

        let current_raw = AtomicFileStore::read_optional(path)?;
        if let Some(raw) = &current_raw {
            let current = parse(raw)?;
            let current_fp = fingerprint_of(&current)?;
            if let Some(expected) = expectation.expected_fingerprint {
                if expected != current_fp {
                    return Err(CoreError::StateConflict(format!(
                        "fingerprint mismatch: expected {expected}, found {current_fp}"
                    )));
                }
            }
            if let Some(expected_state) = expectation.expected_state {
                if current.state != expected_state {
                    return Err(CoreError::StateConflict(format!(
                        "expected state {expected_state}, found {}",
                        current.state
                    )));
                }
            }
        }

        snapshot.validate(config)?;
        let bytes = render(snapshot)?;
        AtomicFileStore::atomic_replace(path, &bytes, false)?;
        fingerprint_of(snapshot)
    }
}
