use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::fingerprint::fingerprint_hex;
use crate::io::AtomicFileStore;
use crate::lock::{FileLock, LockOptions};

/// §6.3 archive boundary: invoked on `delete`, snapshots a bubble directory
/// into a content-addressed archive tree and records it in a shared index.
/// Grounded in `approval`'s JSON-per-entity file convention, generalized
/// into a manifest-per-bubble layout.
pub struct ArchiveRequest<'a> {
    pub repo_path: &'a Path,
    pub bubble_id: &'a str,
    pub bubble_instance_id: &'a str,
    pub bubble_dir: &'a Path,
    pub archive_root_path: &'a Path,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub schema_version: u32,
    pub archived_at: String,
    pub repo_path: String,
    pub repo_key: String,
    pub bubble_instance_id: String,
    pub bubble_id: String,
    pub source_bubble_dir: String,
    pub archived_files: Vec<String>,
}

/// `sha256(normalized_repo_path)[:16]`, hex.
pub fn repo_key(repo_path: &Path) -> String {
    let normalized = repo_path.display().to_string();
    let hex = fingerprint_hex(normalized.as_bytes());
    hex[..16].to_string()
}

fn copy_dir_recursive(src: &Path, dst: &Path, archived: &mut Vec<String>) -> CoreResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path, archived)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dst_path)?;
            archived.push(dst_path.display().to_string());
        }
    }
    Ok(())
}

fn update_index(archive_root: &Path, manifest: &ArchiveManifest) -> CoreResult<()> {
    let index_path = archive_root.join("index.json");
    let lock_path = archive_root.join("index.json.lock");
    let _guard = FileLock::acquire(
        &lock_path,
        LockOptions {
            ensure_parent_dir: true,
            ..Default::default()
        },
    )?;
    let mut index: Vec<ArchiveManifest> = match AtomicFileStore::read_optional(&index_path)? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| CoreError::schema(e.to_string()))?,
        None => Vec::new(),
    };
    index.retain(|m| !(m.bubble_id == manifest.bubble_id && m.repo_key == manifest.repo_key));
    index.push(manifest.clone());
    let bytes = serde_json::to_vec_pretty(&index).map_err(|e| CoreError::schema(e.to_string()))?;
    AtomicFileStore::atomic_replace(&index_path, &bytes, true)
}

/// Idempotent: a retry with identical `(bubble_id, bubble_instance_id)`
/// reuses the existing manifest; a mismatched identity at the same archive
/// path is an error.
pub fn archive_bubble(req: &ArchiveRequest, now: DateTime<Utc>) -> CoreResult<ArchiveManifest> {
    let key = repo_key(req.repo_path);
    let archive_dir = req.archive_root_path.join(&key).join(req.bubble_id);
    let manifest_path = archive_dir.join("manifest.json");

    if manifest_path.exists() {
        let raw = std::fs::read_to_string(&manifest_path)?;
        let existing: ArchiveManifest =
            serde_json::from_str(&raw).map_err(|e| CoreError::schema(e.to_string()))?;
        if existing.bubble_instance_id == req.bubble_instance_id
            && existing.bubble_id == req.bubble_id
        {
            return Ok(existing);
        }
        return Err(CoreError::schema(format!(
            "archive identity mismatch for bubble {}: existing instance {} != {}",
            req.bubble_id, existing.bubble_instance_id, req.bubble_instance_id
        )));
    }

    std::fs::create_dir_all(&archive_dir)?;
    let mut archived_files = Vec::new();
    if req.bubble_dir.is_dir() {
        copy_dir_recursive(req.bubble_dir, &archive_dir.join("bubble"), &mut archived_files)?;
    }

    let manifest = ArchiveManifest {
        schema_version: 1,
        archived_at: now.to_rfc3339(),
        repo_path: req.repo_path.display().to_string(),
        repo_key: key,
        bubble_instance_id: req.bubble_instance_id.to_string(),
        bubble_id: req.bubble_id.to_string(),
        source_bubble_dir: req.bubble_dir.display().to_string(),
        archived_files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| CoreError::schema(e.to_string()))?;
    AtomicFileStore::atomic_replace(&manifest_path, &bytes, true)?;

    update_index(req.archive_root_path, &manifest)?;

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_directory_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let bubble_dir = dir.path().join("bubbles").join("b1");
        std::fs::create_dir_all(&bubble_dir).unwrap();
        std::fs::write(bubble_dir.join("state.json"), "{}").unwrap();
        let archive_root = dir.path().join("archive");

        let req = ArchiveRequest {
            repo_path: Path::new("/repo"),
            bubble_id: "b1",
            bubble_instance_id: "bi_1_aaaaaaaaaaaaaaaaaaaa",
            bubble_dir: &bubble_dir,
            archive_root_path: &archive_root,
        };
        let now: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let manifest = archive_bubble(&req, now).unwrap();
        assert_eq!(manifest.archived_files.len(), 1);
        assert!(archive_root.join(&manifest.repo_key).join("b1").join("manifest.json").exists());
    }

    #[test]
    fn retry_with_same_identity_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bubble_dir = dir.path().join("bubbles").join("b1");
        std::fs::create_dir_all(&bubble_dir).unwrap();
        let archive_root = dir.path().join("archive");
        let req = ArchiveRequest {
            repo_path: Path::new("/repo"),
            bubble_id: "b1",
            bubble_instance_id: "bi_1_aaaaaaaaaaaaaaaaaaaa",
            bubble_dir: &bubble_dir,
            archive_root_path: &archive_root,
        };
        let now: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let first = archive_bubble(&req, now).unwrap();
        let second = archive_bubble(&req, now).unwrap();
        assert_eq!(first.archived_at, second.archived_at);
    }

    #[test]
    fn mismatched_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bubble_dir = dir.path().join("bubbles").join("b1");
        std::fs::create_dir_all(&bubble_dir).unwrap();
        let archive_root = dir.path().join("archive");
        let now: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        archive_bubble(
            &ArchiveRequest {
                repo_path: Path::new("/repo"),
                bubble_id: "b1",
                bubble_instance_id: "bi_1_aaaaaaaaaaaaaaaaaaaa",
                bubble_dir: &bubble_dir,
                archive_root_path: &archive_root,
            },
            now,
        )
        .unwrap();
        let err = archive_bubble(
            &ArchiveRequest {
                repo_path: Path::new("/repo"),
                bubble_id: "b1",
                bubble_instance_id: "bi_2_bbbbbbbbbbbbbbbbbbbb",
                bubble_dir: &bubble_dir,
                archive_root_path: &archive_root,
            },
            now,
        )
        .unwrap_err();
        assert_eq!(err.kind_name(), "schema_validation");
    }
}
