use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::io::AtomicFileStore;
use crate::lock::{FileLock, LockOptions};

/// `repo {add,list,remove}` (§6.5) needs a concrete on-disk shape. Grounded
/// in the teacher's JSON-file-per-entity convention (`approval::PendingMerge`),
/// generalized into one JSON map keyed by canonical repo path instead of
/// one file per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRegistryEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub added_at: String,
}

pub struct RepoRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

fn canonical_key(path: &Path) -> Result<String, CoreError> {
    let canonical = std::fs::canonicalize(path).map_err(|e| {
        CoreError::WorkspaceResolution(format!("cannot canonicalize {}: {e}", path.display()))
    })?;
    Ok(canonical.display().to_string())
}

impl RepoRegistry {
    pub fn new(path: PathBuf) -> Self {
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    /// `PAIRFLOW_REPO_REGISTRY_PATH`, defaulting to `$HOME/.pairflow/repos.json`.
    pub fn default_path() -> Result<PathBuf, CoreError> {
        if let Ok(raw) = std::env::var("PAIRFLOW_REPO_REGISTRY_PATH") {
            return Ok(PathBuf::from(raw));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::WorkspaceResolution("could not resolve home directory".to_string()))?;
        Ok(home.join(".pairflow").join("repos.json"))
    }

    fn read_map(&self) -> Result<BTreeMap<String, RepoRegistryEntry>, CoreError> {
        match AtomicFileStore::read_optional(&self.path)? {
            None => Ok(BTreeMap::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| CoreError::schema(e.to_string())),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, RepoRegistryEntry>) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(map).map_err(|e| CoreError::schema(e.to_string()))?;
        AtomicFileStore::atomic_replace(&self.path, &bytes, true)
    }

    pub fn add(&self, repo_path: &Path, label: Option<String>, now: DateTime<Utc>) -> Result<String, CoreError> {
        let key = canonical_key(repo_path)?;
        let _guard = FileLock::acquire(
            &self.lock_path,
            LockOptions {
                ensure_parent_dir: true,
                ..Default::default()
            },
        )?;
        let mut map = self.read_map()?;
        map.insert(
            key.clone(),
            RepoRegistryEntry {
                path: key.clone(),
                label,
                added_at: now.to_rfc3339(),
            },
        );
        self.write_map(&map)?;
        Ok(key)
    }

    pub fn remove(&self, repo_path: &Path) -> Result<bool, CoreError> {
        let key = canonical_key(repo_path)?;
        let _guard = FileLock::acquire(
            &self.lock_path,
            LockOptions {
                ensure_parent_dir: true,
                ..Default::default()
            },
        )?;
        let mut map = self.read_map()?;
        let existed = map.remove(&key).is_some();
        self.write_map(&map)?;
        Ok(existed)
    }

    pub fn list(&self) -> Result<Vec<RepoRegistryEntry>, CoreError> {
        Ok(self.read_map()?.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let registry = RepoRegistry::new(dir.path().join("registry").join("repos.json"));
        let now: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();

        let key = registry.add(&repo, Some("demo".to_string()), now).unwrap();
        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, key);
        assert_eq!(listed[0].label.as_deref(), Some("demo"));

        assert!(registry.remove(&repo).unwrap());
        assert!(registry.list().unwrap().is_empty());
        assert!(!registry.remove(&repo).unwrap());
    }
}
