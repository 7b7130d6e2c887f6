use chrono::{DateTime, Utc};

use crate::model::agent::AgentName;
use crate::model::{BubbleState, BubbleStateSnapshot};

/// Result of evaluating the watchdog time-predicate (§4.7) against one
/// bubble snapshot at a reference instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub monitored: bool,
    pub monitored_agent: Option<AgentName>,
    pub timeout_minutes: Option<u32>,
    pub reference_timestamp: Option<DateTime<Utc>>,
    pub deadline_timestamp: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<u64>,
    pub expired: bool,
}

impl WatchdogStatus {
    fn not_monitored() -> Self {
        Self {
            monitored: false,
            monitored_agent: None,
            timeout_minutes: None,
            reference_timestamp: None,
            deadline_timestamp: None,
            remaining_seconds: None,
            expired: false,
        }
    }
}

pub struct Watchdog;

impl Watchdog {
    /// Only `RUNNING` is monitored, grounded in the teacher's
    /// `autopilot::worker` idle-nudge timers generalized into a pure
    /// function of state + now.
    pub fn evaluate(
        snapshot: &BubbleStateSnapshot,
        timeout_minutes: u32,
        now: DateTime<Utc>,
    ) -> WatchdogStatus {
        if snapshot.state != BubbleState::Running {
            return WatchdogStatus::not_monitored();
        }

        let active_since = snapshot.active_since.as_deref().and_then(parse_ts);
        let last_command_at = snapshot.last_command_at.as_deref().and_then(parse_ts);

        let reference = match (active_since, last_command_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let Some(reference) = reference else {
            return WatchdogStatus::not_monitored();
        };

        let deadline = reference + chrono::Duration::minutes(timeout_minutes as i64);
        let remaining = (deadline - now).num_seconds().max(0) as u64;
        let expired = now >= deadline;

        WatchdogStatus {
            monitored: true,
            monitored_agent: snapshot.active_agent,
            timeout_minutes: Some(timeout_minutes),
            reference_timestamp: Some(reference),
            deadline_timestamp: Some(deadline),
            remaining_seconds: Some(remaining),
            expired,
        }
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::Role;

    fn running_snapshot(active_since: &str, last_command_at: Option<&str>) -> BubbleStateSnapshot {
        let mut snap = BubbleStateSnapshot::new_created("b1");
        snap.state = BubbleState::Running;
        snap.round = 1;
        snap.active_agent = Some(AgentName::Claude);
        snap.active_role = Some(Role::Implementer);
        snap.active_since = Some(active_since.to_string());
        snap.last_command_at = last_command_at.map(|s| s.to_string());
        snap
    }

    #[test]
    fn waiting_human_is_not_monitored() {
        let mut snap = running_snapshot("2026-02-22T12:00:00Z", None);
        snap.state = BubbleState::WaitingHuman;
        let status = Watchdog::evaluate(&snap, 5, "2026-02-22T12:12:00Z".parse().unwrap());
        assert!(!status.monitored);
    }

    #[test]
    fn escalates_after_timeout() {
        let snap = running_snapshot("2026-02-22T12:00:00Z", None);
        let status = Watchdog::evaluate(&snap, 5, "2026-02-22T12:12:00Z".parse().unwrap());
        assert!(status.monitored);
        assert!(status.expired);
        assert_eq!(status.remaining_seconds, Some(0));
    }

    #[test]
    fn not_expired_before_deadline() {
        let snap = running_snapshot("2026-02-22T12:00:00Z", None);
        let status = Watchdog::evaluate(&snap, 5, "2026-02-22T12:03:00Z".parse().unwrap());
        assert!(status.monitored);
        assert!(!status.expired);
        assert_eq!(status.remaining_seconds, Some(120));
    }
}
