use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::io::AtomicFileStore;
use crate::lock::{FileLock, LockOptions};
use crate::model::envelope::{normalize_refs, validate_payload};
use crate::model::{parse_envelope_seq, Participant, Payload, ProtocolEnvelope};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub allow_missing: bool,
    pub tolerate_partial_final_line: bool,
}

/// A not-yet-assigned envelope: everything a command knows before the store
/// allocates `id`/`ts` and normalizes `refs`.
#[derive(Debug, Clone)]
pub struct EnvelopeDraft {
    pub sender: Participant,
    pub recipient: Participant,
    pub msg_type: crate::model::EnvelopeType,
    pub round: u32,
    pub payload: Payload,
    pub refs: Vec<String>,
}

/// One append request: a draft plus the mirror files it should also be
/// written to (e.g. `inbox.ndjson` for human-facing envelope types).
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub draft: EnvelopeDraft,
    pub mirror_paths: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct AppendOutcome {
    pub envelopes: Vec<ProtocolEnvelope>,
    pub mirror_failures: Vec<(PathBuf, String)>,
}

pub struct TranscriptStore;

/// Validates strict continuity across a whole envelope sequence: ids form
/// `1..N` with no gaps/duplicates, one shared `bubble_id`, `ts`
/// non-decreasing.
pub fn validate_continuity(envelopes: &[ProtocolEnvelope], bubble_id: &str) -> Result<(), CoreError> {
    let mut prev_ts: Option<DateTime<Utc>> = None;
    for (idx, env) in envelopes.iter().enumerate() {
        let expected_seq = (idx + 1) as u64;
        let seq = parse_envelope_seq(&env.id).ok_or_else(|| {
            CoreError::TranscriptContinuityViolation(format!("unparseable envelope id: {}", env.id))
        })?;
        if seq != expected_seq {
            return Err(CoreError::TranscriptContinuityViolation(format!(
                "expected sequence {expected_seq}, found {seq} at id {}",
                env.id
            )));
        }
        if env.bubble_id != bubble_id {
            return Err(CoreError::TranscriptContinuityViolation(format!(
                "envelope {} has bubble_id {}, expected {bubble_id}",
                env.id, env.bubble_id
            )));
        }
        let ts = DateTime::parse_from_rfc3339(&env.ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                CoreError::TranscriptContinuityViolation(format!("bad ts on {}: {e}", env.id))
            })?;
        if let Some(prev) = prev_ts {
            if ts < prev {
                return Err(CoreError::TranscriptContinuityViolation(format!(
                    "ts went backwards at {}",
                    env.id
                )));
            }
        }
        prev_ts = Some(ts);
    }
    Ok(())
}

fn read_lines(path: &Path) -> Result<Option<Vec<String>>, CoreError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw.lines().map(|l| l.to_string()).collect())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Io(e)),
    }
}

impl TranscriptStore {
    pub fn read(path: &Path, opts: ReadOptions) -> Result<Vec<ProtocolEnvelope>, CoreError> {
        let lines = match read_lines(path)? {
            Some(l) => l,
            None if opts.allow_missing => return Ok(Vec::new()),
            None => {
                return Err(CoreError::BubbleNotFound(path.display().to_string()));
            }
        };

        let mut out = Vec::with_capacity(lines.len());
        let n = lines.len();
        for (idx, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProtocolEnvelope>(&line) {
                Ok(env) => out.push(env),
                Err(e) => {
                    let is_last = idx + 1 == n;
                    if is_last && opts.tolerate_partial_final_line {
                        break;
                    }
                    return Err(CoreError::SchemaValidation(format!(
                        "invalid envelope at line {}: {e}",
                        idx + 1
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Appends `requests` to `transcript_path` under one acquisition of
    /// `lock_path`, following the algorithm of §4.4.
    pub fn append_many(
        transcript_path: &Path,
        lock_path: &Path,
        bubble_id: &str,
        requests: Vec<AppendRequest>,
        now: DateTime<Utc>,
        lock_opts: LockOptions,
    ) -> Result<AppendOutcome, CoreError> {
        if requests.is_empty() {
            return Ok(AppendOutcome {
                envelopes: Vec::new(),
                mirror_failures: Vec::new(),
            });
        }

        let _guard = FileLock::acquire(lock_path, lock_opts)?;

        let existing = Self::read(
            transcript_path,
            ReadOptions {
                allow_missing: true,
                tolerate_partial_final_line: true,
            },
        )?;

        let last_seq = existing
            .last()
            .and_then(|e| parse_envelope_seq(&e.id))
            .unwrap_or(0);
        let mut prev_ts = existing
            .last()
            .and_then(|e| DateTime::parse_from_rfc3339(&e.ts).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let max_seq_after = last_seq + requests.len() as u64;
        let width = std::cmp::max(3, max_seq_after.to_string().len());
        let date = now.date_naive();

        let mut new_envelopes = Vec::with_capacity(requests.len());
        let mut mirror_plan: Vec<(PathBuf, usize)> = Vec::new();

        for (i, req) in requests.iter().enumerate() {
            let seq = last_seq + (i as u64) + 1;
            let ts = match prev_ts {
                Some(prev) if now < prev => prev,
                _ => now,
            };
            prev_ts = Some(ts);

            let id = format!(
                "msg_{}_{:0width$}",
                date.format("%Y%m%d"),
                seq,
                width = width
            );

            validate_payload(req.draft.msg_type, &req.draft.payload)?;

            let env = ProtocolEnvelope {
                id,
                ts: ts.to_rfc3339(),
                bubble_id: bubble_id.to_string(),
                sender: req.draft.sender,
                recipient: req.draft.recipient,
                msg_type: req.draft.msg_type,
                round: req.draft.round,
                payload: req.draft.payload.clone(),
                refs: normalize_refs(req.draft.refs.clone()),
            };
            for mp in &req.mirror_paths {
                mirror_plan.push((mp.clone(), new_envelopes.len()));
            }
            new_envelopes.push(env);
        }

        let mut combined = existing;
        combined.extend(new_envelopes.iter().cloned());
        validate_continuity(&combined, bubble_id)?;

        let mut batch_lines = Vec::with_capacity(new_envelopes.len());
        for env in &new_envelopes {
            batch_lines.push(
                serde_json::to_string(env).map_err(|e| CoreError::schema(e.to_string()))?,
            );
        }
        // Already holding `_guard`: append via the lock-free primitive
        // rather than re-acquiring `lock_path` (§4.4 is one acquisition
        // covering the transcript write and every mirror-file fan-out).
        AtomicFileStore::append_lines(transcript_path, &batch_lines)?;

        let mut mirror_failures = Vec::new();
        for (mirror_path, env_idx) in mirror_plan {
            let env = &new_envelopes[env_idx];
            let line = match serde_json::to_string(env) {
                Ok(l) => l,
                Err(e) => {
                    mirror_failures.push((mirror_path, e.to_string()));
                    continue;
                }
            };
            if let Err(e) = AtomicFileStore::append_lines(&mirror_path, &[line]) {
                mirror_failures.push((mirror_path, e.to_string()));
            }
        }

        Ok(AppendOutcome {
            envelopes: new_envelopes,
            mirror_failures,
        })
    }

    pub fn append_one(
        transcript_path: &Path,
        lock_path: &Path,
        bubble_id: &str,
        request: AppendRequest,
        now: DateTime<Utc>,
        lock_opts: LockOptions,
    ) -> Result<AppendOutcome, CoreError> {
        Self::append_many(transcript_path, lock_path, bubble_id, vec![request], now, lock_opts)
    }

    /// Counts `HUMAN_QUESTION` minus `HUMAN_REPLY` in occurrence order,
    /// clamped at zero (§4.6/§8.1.6).
    pub fn open_human_questions(envelopes: &[ProtocolEnvelope]) -> u32 {
        let mut open = 0i64;
        for env in envelopes {
            match env.msg_type {
                crate::model::EnvelopeType::HumanQuestion => open += 1,
                crate::model::EnvelopeType::HumanReply => open = (open - 1).max(0),
                _ => {}
            }
        }
        open.max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::AgentName;
    use crate::model::envelope::{PassIntent, PassPayload, TaskPayload};
    use crate::model::EnvelopeType;

    fn task_request(round: u32) -> AppendRequest {
        AppendRequest {
            draft: EnvelopeDraft {
                sender: Participant::Human,
                recipient: Participant::Agent(AgentName::Claude),
                msg_type: EnvelopeType::Task,
                round,
                payload: Payload::Task(TaskPayload {
                    task: "do it".to_string(),
                }),
                refs: vec![],
            },
            mirror_paths: vec![],
        }
    }

    #[test]
    fn append_many_allocates_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("transcript.ndjson");
        let lock = dir.path().join("locks").join("b1.lock");
        let now = Utc::now();
        let outcome = TranscriptStore::append_many(
            &transcript,
            &lock,
            "b1",
            vec![task_request(0), task_request(0)],
            now,
            LockOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.envelopes[0].id, "msg_".to_string() + &now.format("%Y%m%d").to_string() + "_001");
        assert_eq!(outcome.envelopes[1].id, "msg_".to_string() + &now.format("%Y%m%d").to_string() + "_002");
    }

    #[test]
    fn mirror_write_failure_does_not_fail_append() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("transcript.ndjson");
        let lock = dir.path().join("locks").join("b1.lock");
        let mut req = task_request(0);
        // A mirror path with a null byte is invalid on most filesystems and
        // should fail to open without aborting the whole append.
        req.mirror_paths.push(PathBuf::from("/dev/null/not/creatable"));
        let outcome = TranscriptStore::append_many(
            &transcript,
            &lock,
            "b1",
            vec![req],
            Utc::now(),
            LockOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.envelopes.len(), 1);
        assert_eq!(outcome.mirror_failures.len(), 1);
    }

    #[test]
    fn blocker_finding_without_ref_fails_append() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("transcript.ndjson");
        let lock = dir.path().join("locks").join("b1.lock");
        let req = AppendRequest {
            draft: EnvelopeDraft {
                sender: Participant::Agent(AgentName::Codex),
                recipient: Participant::Agent(AgentName::Claude),
                msg_type: EnvelopeType::Pass,
                round: 1,
                payload: Payload::Pass(PassPayload {
                    summary: "s".to_string(),
                    pass_intent: PassIntent::FixRequest,
                    findings: Some(vec![crate::model::Finding {
                        severity: crate::model::Severity::P0,
                        title: "bug".to_string(),
                        detail: None,
                        code: None,
                        refs: vec![],
                    }]),
                    metadata: None,
                }),
                refs: vec![],
            },
            mirror_paths: vec![],
        };
        let err = TranscriptStore::append_many(
            &transcript,
            &lock,
            "b1",
            vec![req],
            Utc::now(),
            LockOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind_name(), "schema_validation");
        assert!(!transcript.exists());
    }

    #[test]
    fn open_human_questions_never_goes_negative() {
        use crate::model::envelope::{HumanQuestionPayload, HumanReplyPayload};
        let mut envs = Vec::new();
        let mut push = |t: EnvelopeType, payload: Payload| {
            envs.push(ProtocolEnvelope {
                id: format!("msg_20260101_{:03}", envs.len() + 1),
                ts: "2026-01-01T00:00:00Z".to_string(),
                bubble_id: "b1".to_string(),
                sender: Participant::Human,
                recipient: Participant::Orchestrator,
                msg_type: t,
                round: 1,
                payload,
                refs: vec![],
            });
        };
        push(
            EnvelopeType::HumanReply,
            Payload::HumanReply(HumanReplyPayload {
                message: "m".to_string(),
            }),
        );
        push(
            EnvelopeType::HumanQuestion,
            Payload::HumanQuestion(HumanQuestionPayload {
                question: "q".to_string(),
            }),
        );
        assert_eq!(TranscriptStore::open_human_questions(&envs), 1);
    }
}
