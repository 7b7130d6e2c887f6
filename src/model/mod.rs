pub mod agent;
pub mod config;
pub mod envelope;
pub mod state;

pub use agent::{AgentName, AgentPair, Role};
pub use config::{
    BubbleConfig, CommandsConfig, LocalOverlayConfig, NotificationsConfig, OverlayMode,
    QualityMode, ReviewerContextMode, WorkMode,
};
pub use envelope::{
    Decision, EnvelopeType, Finding, Participant, PassIntent, Payload, ProtocolEnvelope, Severity,
};
pub use state::{
    BubbleState, BubbleStateSnapshot, PendingReworkIntent, ReworkIntentHistoryEntry,
    ReworkStatus, RoundRoleHistoryEntry,
};

/// Builds `msg_<YYYYMMDD>_<NNN>` with padding width `max(3, digits(seq))`.
pub fn format_envelope_id(date_utc: chrono::NaiveDate, seq: u64) -> String {
    let width = std::cmp::max(3, seq.to_string().len());
    format!(
        "msg_{}_{:0width$}",
        date_utc.format("%Y%m%d"),
        seq,
        width = width
    )
}

/// Parses the trailing sequence number out of an envelope id. Per design
/// notes, the date fragment of `id` is opaque and never read as semantic
/// data by any core logic; this helper exists purely for continuity checks.
pub fn parse_envelope_seq(id: &str) -> Option<u64> {
    let rest = id.strip_prefix("msg_")?;
    let (_, seq) = rest.split_once('_')?;
    seq.parse().ok()
}
