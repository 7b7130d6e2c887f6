use crate::error::CoreError;
use crate::model::agent::{AgentName, Role};
use crate::model::state::{BubbleState, RoundRoleHistoryEntry};
use crate::model::{BubbleConfig, BubbleStateSnapshot, PendingReworkIntent, ReworkIntentHistoryEntry};

/// Permitted transitions (§4.5), self-transitions forbidden.
fn is_permitted(from: BubbleState, to: BubbleState) -> bool {
    use BubbleState::*;
    if from == to {
        return false;
    }
    match (from, to) {
        (Created, PreparingWorkspace) => true,
        (PreparingWorkspace, Running) => true,
        (Running, WaitingHuman) | (Running, ReadyForApproval) => true,
        (WaitingHuman, Running) => true,
        (ReadyForApproval, Running) | (ReadyForApproval, ApprovedForCommit) => true,
        (ApprovedForCommit, Committed) => true,
        (Committed, Done) => true,
        (_, Failed) => !from.is_final(),
        (_, Cancelled) => !from.is_final(),
        _ => false,
    }
}

/// A shallow-merge patch applied atomically to a snapshot by
/// `apply_transition`.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub to: Option<BubbleState>,
    pub round: Option<u32>,
    pub active_agent: Option<Option<AgentName>>,
    pub active_role: Option<Option<Role>>,
    pub active_since: Option<Option<String>>,
    pub append_round_role_history: Option<RoundRoleHistoryEntry>,
    pub last_command_at: Option<String>,
    pub pending_rework_intent: Option<Option<PendingReworkIntent>>,
    pub append_rework_history: Option<ReworkIntentHistoryEntry>,
}

pub struct StateMachine;

impl StateMachine {
    pub fn can_transition(from: BubbleState, to: BubbleState) -> bool {
        is_permitted(from, to)
    }

    /// Produces the next snapshot by shallow-merging `patch` into `current`,
    /// then validating the result (§3.3). Any transition or schema
    /// violation surfaces as a typed error before anything is written.
    pub fn apply_transition(
        current: &BubbleStateSnapshot,
        patch: TransitionPatch,
        config: &BubbleConfig,
    ) -> Result<BubbleStateSnapshot, CoreError> {
        let mut next = current.clone();

        if let Some(to) = patch.to {
            if !is_permitted(current.state, to) {
                return Err(CoreError::StateTransitionDenied {
                    from: current.state.to_string(),
                    to: to.to_string(),
                });
            }
            next.state = to;
        }

        if let Some(round) = patch.round {
            next.round = round;
        }
        if let Some(agent) = patch.active_agent {
            next.active_agent = agent;
        }
        if let Some(role) = patch.active_role {
            next.active_role = role;
        }
        if let Some(since) = patch.active_since {
            next.active_since = since;
        }
        if let Some(entry) = patch.append_round_role_history {
            next.round_role_history.push(entry);
        }
        if let Some(at) = patch.last_command_at {
            next.last_command_at = Some(at);
        }
        if let Some(intent) = patch.pending_rework_intent {
            next.pending_rework_intent = intent;
        }
        if let Some(entry) = patch.append_rework_history {
            next.rework_intent_history.push(entry);
        }

        next.validate(config)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_to_preparing_is_permitted() {
        assert!(StateMachine::can_transition(
            BubbleState::Created,
            BubbleState::PreparingWorkspace
        ));
    }

    #[test]
    fn self_transition_is_forbidden() {
        assert!(!StateMachine::can_transition(
            BubbleState::Running,
            BubbleState::Running
        ));
    }

    #[test]
    fn committed_can_only_go_to_done() {
        assert!(StateMachine::can_transition(
            BubbleState::Committed,
            BubbleState::Done
        ));
        assert!(!StateMachine::can_transition(
            BubbleState::Committed,
            BubbleState::Running
        ));
    }

    #[test]
    fn final_states_reject_further_transitions() {
        assert!(!StateMachine::can_transition(
            BubbleState::Done,
            BubbleState::Cancelled
        ));
        assert!(!StateMachine::can_transition(
            BubbleState::Failed,
            BubbleState::Running
        ));
    }

    #[test]
    fn cancelled_reachable_from_any_non_final_state() {
        for state in [
            BubbleState::Created,
            BubbleState::PreparingWorkspace,
            BubbleState::Running,
            BubbleState::WaitingHuman,
            BubbleState::ReadyForApproval,
            BubbleState::ApprovedForCommit,
            BubbleState::Committed,
        ] {
            assert!(StateMachine::can_transition(state, BubbleState::Cancelled));
        }
    }

    #[test]
    fn failed_reachable_from_any_non_final_state_including_created() {
        for state in [
            BubbleState::Created,
            BubbleState::PreparingWorkspace,
            BubbleState::Running,
            BubbleState::WaitingHuman,
            BubbleState::ReadyForApproval,
            BubbleState::ApprovedForCommit,
            BubbleState::Committed,
        ] {
            assert!(StateMachine::can_transition(state, BubbleState::Failed));
        }
        assert!(!StateMachine::can_transition(
            BubbleState::Done,
            BubbleState::Failed
        ));
    }
}
