use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::model::agent::AgentName;

/// `sender`/`recipient` participant: one of the closed agent names, the
/// orchestrator itself, or a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participant {
    Agent(AgentName),
    Orchestrator,
    Human,
}

impl Participant {
    pub fn as_str(&self) -> String {
        match self {
            Participant::Agent(a) => a.as_str().to_string(),
            Participant::Orchestrator => "orchestrator".to_string(),
            Participant::Human => "human".to_string(),
        }
    }
}

impl std::str::FromStr for Participant {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Participant::Orchestrator),
            "human" => Ok(Participant::Human),
            other => other.parse::<AgentName>().map(Participant::Agent),
        }
    }
}

impl Serialize for Participant {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Participant {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(DeError::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    Task,
    Pass,
    HumanQuestion,
    HumanReply,
    Convergence,
    ApprovalRequest,
    ApprovalDecision,
    DonePackage,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Task => "TASK",
            EnvelopeType::Pass => "PASS",
            EnvelopeType::HumanQuestion => "HUMAN_QUESTION",
            EnvelopeType::HumanReply => "HUMAN_REPLY",
            EnvelopeType::Convergence => "CONVERGENCE",
            EnvelopeType::ApprovalRequest => "APPROVAL_REQUEST",
            EnvelopeType::ApprovalDecision => "APPROVAL_DECISION",
            EnvelopeType::DonePackage => "DONE_PACKAGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    P0,
    P1,
    P2,
    P3,
}

impl Severity {
    pub fn is_blocker(self) -> bool {
        matches!(self, Severity::P0 | Severity::P1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassIntent {
    Task,
    Review,
    FixRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Revise,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassPayload {
    pub summary: String,
    pub pass_intent: PassIntent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<Finding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanQuestionPayload {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanReplyPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecisionPayload {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonePackageMetadata {
    pub done_package_path: String,
    pub staged_files: Vec<String>,
    pub commit_message: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonePackagePayload {
    pub summary: String,
    pub metadata: DonePackageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Task(TaskPayload),
    Pass(PassPayload),
    HumanQuestion(HumanQuestionPayload),
    HumanReply(HumanReplyPayload),
    /// Shared shape for CONVERGENCE and APPROVAL_REQUEST (both `{summary}`).
    Summary(SummaryPayload),
    ApprovalDecision(ApprovalDecisionPayload),
    DonePackage(DonePackagePayload),
}

impl Payload {
    fn from_value(
        msg_type: EnvelopeType,
        value: serde_json::Value,
    ) -> Result<Payload, serde_json::Error> {
        match msg_type {
            EnvelopeType::Task => Ok(Payload::Task(serde_json::from_value(value)?)),
            EnvelopeType::Pass => Ok(Payload::Pass(serde_json::from_value(value)?)),
            EnvelopeType::HumanQuestion => {
                Ok(Payload::HumanQuestion(serde_json::from_value(value)?))
            }
            EnvelopeType::HumanReply => Ok(Payload::HumanReply(serde_json::from_value(value)?)),
            EnvelopeType::Convergence | EnvelopeType::ApprovalRequest => {
                Ok(Payload::Summary(serde_json::from_value(value)?))
            }
            EnvelopeType::ApprovalDecision => {
                Ok(Payload::ApprovalDecision(serde_json::from_value(value)?))
            }
            EnvelopeType::DonePackage => Ok(Payload::DonePackage(serde_json::from_value(value)?)),
        }
    }
}

/// One immutable, append-only protocol message (§3.4).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolEnvelope {
    pub id: String,
    pub ts: String,
    pub bubble_id: String,
    pub sender: Participant,
    pub recipient: Participant,
    #[serde(rename = "type")]
    pub msg_type: EnvelopeType,
    pub round: u32,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
}

#[derive(Deserialize)]
struct EnvelopeWire {
    id: String,
    ts: String,
    bubble_id: String,
    sender: Participant,
    recipient: Participant,
    #[serde(rename = "type")]
    msg_type: EnvelopeType,
    round: u32,
    payload: serde_json::Value,
    #[serde(default)]
    refs: Vec<String>,
}

impl<'de> Deserialize<'de> for ProtocolEnvelope {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let wire = EnvelopeWire::deserialize(d)?;
        let payload = Payload::from_value(wire.msg_type, wire.payload).map_err(DeError::custom)?;
        Ok(ProtocolEnvelope {
            id: wire.id,
            ts: wire.ts,
            bubble_id: wire.bubble_id,
            sender: wire.sender,
            recipient: wire.recipient,
            msg_type: wire.msg_type,
            round: wire.round,
            payload,
            refs: wire.refs,
        })
    }
}

/// Normalizes `refs`: trims, drops empty/whitespace-only entries, dedupes
/// while preserving first-seen order.
pub fn normalize_refs(refs: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for r in refs {
        let trimmed = r.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.clone()) {
            out.push(trimmed);
        }
    }
    out
}

/// Validates the closed-keyset/blocker-ref rules of §3.4 that the type
/// system does not already encode.
pub fn validate_payload(msg_type: EnvelopeType, payload: &Payload) -> Result<(), CoreError> {
    match (msg_type, payload) {
        (EnvelopeType::Task, Payload::Task(_)) => Ok(()),
        (EnvelopeType::Pass, Payload::Pass(p)) => {
            if let Some(findings) = &p.findings {
                for f in findings {
                    if f.severity.is_blocker() && f.refs.is_empty() {
                        return Err(CoreError::schema(format!(
                            "finding '{}' with severity {:?} must carry at least one ref",
                            f.title, f.severity
                        )));
                    }
                }
            }
            Ok(())
        }
        (EnvelopeType::HumanQuestion, Payload::HumanQuestion(_)) => Ok(()),
        (EnvelopeType::HumanReply, Payload::HumanReply(_)) => Ok(()),
        (EnvelopeType::Convergence, Payload::Summary(_)) => Ok(()),
        (EnvelopeType::ApprovalRequest, Payload::Summary(_)) => Ok(()),
        (EnvelopeType::ApprovalDecision, Payload::ApprovalDecision(_)) => Ok(()),
        (EnvelopeType::DonePackage, Payload::DonePackage(_)) => Ok(()),
        (t, _) => Err(CoreError::schema(format!(
            "payload shape does not match envelope type {}",
            t.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocker_finding_without_ref_is_rejected() {
        let payload = Payload::Pass(PassPayload {
            summary: "s".to_string(),
            pass_intent: PassIntent::Review,
            findings: Some(vec![Finding {
                severity: Severity::P0,
                title: "t".to_string(),
                detail: None,
                code: None,
                refs: vec![],
            }]),
            metadata: None,
        });
        assert!(validate_payload(EnvelopeType::Pass, &payload).is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let env = ProtocolEnvelope {
            id: "msg_20260101_001".to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            bubble_id: "b1".to_string(),
            sender: Participant::Human,
            recipient: Participant::Agent(AgentName::Claude),
            msg_type: EnvelopeType::Task,
            round: 0,
            payload: Payload::Task(TaskPayload {
                task: "do it".to_string(),
            }),
            refs: vec![],
        };
        let s = serde_json::to_string(&env).unwrap();
        let back: ProtocolEnvelope = serde_json::from_str(&s).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn normalize_refs_dedupes_and_trims() {
        let refs = normalize_refs(vec![
            "  a  ".to_string(),
            "a".to_string(),
            "".to_string(),
            " ".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);
    }
}
