use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::agent::{AgentName, AgentPair, Role};
use crate::model::config::BubbleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BubbleState {
    Created,
    PreparingWorkspace,
    Running,
    WaitingHuman,
    ReadyForApproval,
    ApprovedForCommit,
    Committed,
    Done,
    Failed,
    Cancelled,
}

impl BubbleState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            BubbleState::Done | BubbleState::Failed | BubbleState::Cancelled
        )
    }

    pub fn is_setup(self) -> bool {
        matches!(self, BubbleState::Created | BubbleState::PreparingWorkspace)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            BubbleState::PreparingWorkspace
                | BubbleState::Running
                | BubbleState::WaitingHuman
                | BubbleState::ReadyForApproval
                | BubbleState::ApprovedForCommit
                | BubbleState::Committed
        ) || self == BubbleState::Created
    }
}

impl std::fmt::Display for BubbleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BubbleState::Created => "CREATED",
            BubbleState::PreparingWorkspace => "PREPARING_WORKSPACE",
            BubbleState::Running => "RUNNING",
            BubbleState::WaitingHuman => "WAITING_HUMAN",
            BubbleState::ReadyForApproval => "READY_FOR_APPROVAL",
            BubbleState::ApprovedForCommit => "APPROVED_FOR_COMMIT",
            BubbleState::Committed => "COMMITTED",
            BubbleState::Done => "DONE",
            BubbleState::Failed => "FAILED",
            BubbleState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRoleHistoryEntry {
    pub round: u32,
    pub implementer: AgentName,
    pub reviewer: AgentName,
    pub switched_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReworkStatus {
    Pending,
    Applied,
    Superseded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReworkIntent {
    pub intent_id: String,
    pub requested_at: String,
    pub message: String,
    #[serde(default)]
    pub refs: Vec<String>,
    pub status: ReworkStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReworkIntentHistoryEntry {
    pub intent_id: String,
    pub requested_at: String,
    pub message: String,
    #[serde(default)]
    pub refs: Vec<String>,
    pub status: ReworkStatus,
}

/// The mutable `state.json` snapshot (§3.3). Field order here is the
/// canonical key order used for fingerprinting (§4.3) and JSON rendering
/// (§6.1) — do not reorder fields without accepting a fingerprint break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BubbleStateSnapshot {
    pub bubble_id: String,
    pub state: BubbleState,
    pub round: u32,
    pub active_agent: Option<AgentName>,
    pub active_role: Option<Role>,
    pub active_since: Option<String>,
    pub round_role_history: Vec<RoundRoleHistoryEntry>,
    pub last_command_at: Option<String>,
    pub pending_rework_intent: Option<PendingReworkIntent>,
    pub rework_intent_history: Vec<ReworkIntentHistoryEntry>,
}

impl BubbleStateSnapshot {
    pub fn new_created(bubble_id: impl Into<String>) -> Self {
        Self {
            bubble_id: bubble_id.into(),
            state: BubbleState::Created,
            round: 0,
            active_agent: None,
            active_role: None,
            active_since: None,
            round_role_history: Vec::new(),
            last_command_at: None,
            pending_rework_intent: None,
            rework_intent_history: Vec::new(),
        }
    }

    /// Validates §3.3 invariants against a config. Called before every write.
    pub fn validate(&self, config: &BubbleConfig) -> Result<(), CoreError> {
        if self.bubble_id != config.id {
            return Err(CoreError::schema(
                "state.bubble_id must equal BubbleConfig.id",
            ));
        }

        let active_all_null =
            self.active_agent.is_none() && self.active_role.is_none() && self.active_since.is_none();
        let active_all_set =
            self.active_agent.is_some() && self.active_role.is_some() && self.active_since.is_some();
        if !active_all_null && !active_all_set {
            return Err(CoreError::schema(
                "active_agent/active_role/active_since must be all-null or all-set together",
            ));
        }

        if self.state.is_setup() {
            if !active_all_null || self.round != 0 {
                return Err(CoreError::schema(
                    "CREATED/PREPARING_WORKSPACE require active_*=null and round=0",
                ));
            }
        } else if self.state.is_final() {
            if !active_all_null {
                return Err(CoreError::schema(
                    "final states require active_*=null",
                ));
            }
        } else {
            // RUNNING / WAITING_HUMAN / READY_FOR_APPROVAL / APPROVED_FOR_COMMIT / COMMITTED
            if !active_all_set || self.round < 1 {
                return Err(CoreError::schema(
                    "active states require active_*=set and round>=1",
                ));
            }
        }

        if let (Some(agent), Some(role)) = (self.active_agent, self.active_role) {
            if config.agents.for_role(role) != agent {
                return Err(CoreError::schema(
                    "active_agent must match BubbleConfig.agents[active_role]",
                ));
            }
        }

        let mut last_round: Option<u32> = None;
        for entry in &self.round_role_history {
            if let Some(prev) = last_round {
                if entry.round <= prev {
                    return Err(CoreError::schema(
                        "round_role_history rounds must be strictly increasing",
                    ));
                }
            }
            last_round = Some(entry.round);
        }

        if !self.state.is_setup() {
            let have: std::collections::BTreeSet<u32> =
                self.round_role_history.iter().map(|e| e.round).collect();
            for r in 1..=self.round {
                if !have.contains(&r) {
                    return Err(CoreError::schema(format!(
                        "round_role_history missing entry for round {r}"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn is_waiting_human(&self) -> bool {
        self.state == BubbleState::WaitingHuman
    }
}

impl AgentPair {
    /// Convenience used by commands constructing the next `active_*` triad.
    pub fn require_role(&self, role: Role) -> AgentName {
        self.for_role(role)
    }
}
