use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io::AtomicFileStore;
use crate::lock::{FileLock, LockOptions};

const DEDUP_CACHE_CAP: usize = 512;
const EMIT_TIMEOUT: Duration = Duration::from_millis(150);
const EMIT_STALE_AFTER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Implementer,
    Reviewer,
    Human,
    Orchestrator,
}

#[derive(Debug, Clone)]
pub struct MetricsEvent {
    pub repo_path: PathBuf,
    pub bubble_instance_id: Option<String>,
    pub bubble_id: String,
    pub event_type: String,
    pub round: Option<u32>,
    pub actor_role: ActorRole,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct MetricsRecord<'a> {
    ts: String,
    schema_version: u32,
    repo_path: &'a Path,
    bubble_instance_id: &'a Option<String>,
    bubble_id: &'a str,
    event_type: &'a str,
    round: Option<u32>,
    actor_role: ActorRole,
    metadata: &'a serde_json::Map<String, serde_json::Value>,
}

fn dedup_cache() -> &'static Mutex<HashSet<(String, String, String)>> {
    static CACHE: OnceLock<Mutex<HashSet<(String, String, String)>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn warn_once(bubble_id: &str, event_type: &str, reason: &str) {
    let cache = dedup_cache();
    let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
    let key = (bubble_id.to_string(), event_type.to_string(), reason.to_string());
    if guard.len() >= DEDUP_CACHE_CAP {
        guard.clear();
    }
    if guard.insert(key) {
        eprintln!("pairflow: metrics emit failed for {bubble_id}/{event_type}: {reason}");
    }
}

/// Best-effort append of lifecycle events into a monthly-sharded NDJSON
/// file, under its own per-shard lock, so emission failures never block or
/// fail the lifecycle operation that triggered them (§4.9).
pub struct MetricsEmitter;

impl MetricsEmitter {
    pub fn shard_path(events_root: &Path, now: DateTime<Utc>) -> PathBuf {
        let year = now.format("%Y").to_string();
        let month = now.format("%m").to_string();
        events_root
            .join(&year)
            .join(&month)
            .join(format!("events-{year}-{month}.ndjson"))
    }

    pub fn emit(events_root: &Path, event: MetricsEvent, now: DateTime<Utc>) {
        if let Err(reason) = Self::try_emit(events_root, &event, now) {
            warn_once(&event.bubble_id, &event.event_type, &reason);
        }
    }

    fn try_emit(events_root: &Path, event: &MetricsEvent, now: DateTime<Utc>) -> Result<(), String> {
        let shard = Self::shard_path(events_root, now);
        let lock_path = shard.with_extension("ndjson.lock");

        let record = MetricsRecord {
            ts: now.to_rfc3339(),
            schema_version: 1,
            repo_path: &event.repo_path,
            bubble_instance_id: &event.bubble_instance_id,
            bubble_id: &event.bubble_id,
            event_type: &event.event_type,
            round: event.round,
            actor_role: event.actor_role,
            metadata: &event.metadata,
        };
        let line = serde_json::to_string(&record).map_err(|e| e.to_string())?;

        let lock_opts = LockOptions {
            timeout: EMIT_TIMEOUT,
            poll_interval: Duration::from_millis(10),
            stale_after: EMIT_STALE_AFTER,
            ensure_parent_dir: true,
        };
        let _guard = FileLock::acquire(&lock_path, lock_opts).map_err(|e| e.to_string())?;
        AtomicFileStore::append_lines(&shard, &[line]).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_into_monthly_shard() {
        let dir = tempfile::tempdir().unwrap();
        let now: DateTime<Utc> = "2026-02-22T12:00:00Z".parse().unwrap();
        let event = MetricsEvent {
            repo_path: "/tmp/repo".into(),
            bubble_instance_id: Some("bi_1_aaaaaaaaaaaaaaaaaaaa".to_string()),
            bubble_id: "b1".to_string(),
            event_type: "bubble_created".to_string(),
            round: None,
            actor_role: ActorRole::Orchestrator,
            metadata: serde_json::Map::new(),
        };
        MetricsEmitter::emit(dir.path(), event, now);
        let shard = MetricsEmitter::shard_path(dir.path(), now);
        let contents = std::fs::read_to_string(&shard).unwrap();
        assert!(contents.contains("bubble_created"));
    }
}
