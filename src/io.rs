use std::io::Write as _;
use std::path::Path;

use crate::error::CoreError;
use crate::lock::{FileLock, LockOptions};

/// Whole-file atomic replace and append-with-lock primitives (§4.2).
///
/// Generalizes the teacher's `crank_io::write_string`, which did a plain
/// non-atomic `fs::write`, into a tempfile-write-then-rename so a reader
/// never observes a partially written `state.json`.
pub struct AtomicFileStore;

impl AtomicFileStore {
    /// Returns `None` if the file does not exist.
    pub fn read_optional(path: &Path) -> Result<Option<String>, CoreError> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Writes `contents` to a sibling temp file, then renames it over
    /// `path`. The temp file is removed on any failure before the rename.
    pub fn atomic_replace(path: &Path, contents: &[u8], ensure_parent_dir: bool) -> Result<(), CoreError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if ensure_parent_dir {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent)
            .map_err(CoreError::Io)?;

        let write_result = tmp.write_all(contents).and_then(|_| tmp.flush());
        if let Err(e) = write_result {
            return Err(CoreError::Io(e));
        }

        tmp.persist(path)
            .map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }

    /// Appends `lines` to `path`, creating its parent directory, with no
    /// locking of its own. `transcript_store`/`metrics` call this while
    /// already holding their own per-bubble/per-shard `FileLock` guard
    /// (transcript appends and mirror-file fan-out happen inside one lock
    /// acquisition per §4.4, so a second nested lock here would be wrong).
    /// Use `append_with_lock` instead when the caller has no lock of its
    /// own yet.
    pub fn append_lines(path: &Path, lines: &[String]) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            if !line.ends_with('\n') {
                file.write_all(b"\n")?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Acquires `lock_path` then appends `lines` to `path` via
    /// `append_lines` (§4.2).
    pub fn append_with_lock(
        path: &Path,
        lock_path: &Path,
        lines: &[String],
        lock_opts: LockOptions,
    ) -> Result<(), CoreError> {
        let _guard = FileLock::acquire(lock_path, lock_opts)?;
        Self::append_lines(path, lines)
    }
}
