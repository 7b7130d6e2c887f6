use crate::model::agent::{AgentName, AgentPair};
use crate::model::envelope::{Participant, Payload};
use crate::model::state::RoundRoleHistoryEntry;
use crate::model::{EnvelopeType, ProtocolEnvelope};
use crate::transcript_store::TranscriptStore;

#[derive(Debug, Clone)]
pub struct ConvergenceInput<'a> {
    pub current_round: u32,
    pub agents: &'a AgentPair,
    pub round_role_history: &'a [RoundRoleHistoryEntry],
    pub transcript: &'a [ProtocolEnvelope],
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConvergenceOutcome {
    pub ok: bool,
    pub errors: Vec<String>,
}

/// Pure predicate deciding whether a reviewer may declare convergence
/// (§4.6). Never mutates anything; equal inputs always produce equal
/// outputs (§8.1.9).
pub struct ConvergencePolicy;

impl ConvergencePolicy {
    pub fn evaluate(input: &ConvergenceInput) -> ConvergenceOutcome {
        let mut errors = Vec::new();

        let current_entry = input
            .round_role_history
            .iter()
            .find(|e| e.round == input.current_round);
        match current_entry {
            Some(entry)
                if entry.implementer == input.agents.implementer
                    && entry.reviewer == input.agents.reviewer => {}
            Some(_) => errors.push(
                "round_role_history entry for current round does not match configured agents"
                    .to_string(),
            ),
            None => errors.push(format!(
                "no round_role_history entry for round {}",
                input.current_round
            )),
        }

        let distinct_rounds: std::collections::BTreeSet<u32> = input
            .round_role_history
            .iter()
            .map(|e| e.round)
            .collect();
        if distinct_rounds.len() < 2 {
            errors.push("fewer than two distinct rounds have occurred".to_string());
        }

        if input.current_round == 0 {
            errors.push("current round must be at least 1 to converge".to_string());
        } else {
            let prior_round = input.current_round - 1;
            let has_clean_pass = input.transcript.iter().any(|env| {
                env.msg_type == EnvelopeType::Pass
                    && env.round == prior_round
                    && matches!(env.sender, Participant::Agent(a) if a == input.agents.reviewer)
                    && matches!(env.recipient, Participant::Agent(a) if a == input.agents.implementer)
                    && pass_has_no_open_blockers(env)
            });
            if !has_clean_pass {
                errors.push(format!(
                    "no reviewer PASS at round {prior_round} with findings and no open P0/P1"
                ));
            }
        }

        let open_questions = TranscriptStore::open_human_questions(input.transcript);
        if open_questions > 0 {
            errors.push(format!(
                "{open_questions} unresolved HUMAN_QUESTION entr{}",
                if open_questions == 1 { "y" } else { "ies" }
            ));
        }

        ConvergenceOutcome {
            ok: errors.is_empty(),
            errors,
        }
    }
}

fn pass_has_no_open_blockers(env: &ProtocolEnvelope) -> bool {
    let Payload::Pass(p) = &env.payload else {
        return false;
    };
    match &p.findings {
        None => false,
        Some(findings) => !findings.iter().any(|f| f.severity.is_blocker()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::AgentName;
    use crate::model::envelope::{Finding, PassIntent, PassPayload, Severity};

    fn pass_envelope(round: u32, reviewer: AgentName, implementer: AgentName, findings: Option<Vec<Finding>>) -> ProtocolEnvelope {
        ProtocolEnvelope {
            id: format!("msg_20260101_{:03}", round + 1),
            ts: "2026-01-01T00:00:00Z".to_string(),
            bubble_id: "b1".to_string(),
            sender: Participant::Agent(reviewer),
            recipient: Participant::Agent(implementer),
            msg_type: EnvelopeType::Pass,
            round,
            payload: Payload::Pass(PassPayload {
                summary: "s".to_string(),
                pass_intent: PassIntent::FixRequest,
                findings,
                metadata: None,
            }),
            refs: vec![],
        }
    }

    #[test]
    fn passes_when_all_conditions_met() {
        let agents = AgentPair::new(AgentName::Claude, AgentName::Codex).unwrap();
        let history = vec![
            RoundRoleHistoryEntry {
                round: 1,
                implementer: AgentName::Claude,
                reviewer: AgentName::Codex,
                switched_at: "t".to_string(),
            },
            RoundRoleHistoryEntry {
                round: 2,
                implementer: AgentName::Claude,
                reviewer: AgentName::Codex,
                switched_at: "t".to_string(),
            },
        ];
        let transcript = vec![pass_envelope(1, AgentName::Codex, AgentName::Claude, Some(vec![]))];
        let input = ConvergenceInput {
            current_round: 2,
            agents: &agents,
            round_role_history: &history,
            transcript: &transcript,
        };
        let outcome = ConvergencePolicy::evaluate(&input);
        assert!(outcome.ok, "{:?}", outcome.errors);
    }

    #[test]
    fn fails_on_open_blocker_finding() {
        let agents = AgentPair::new(AgentName::Claude, AgentName::Codex).unwrap();
        let history = vec![
            RoundRoleHistoryEntry {
                round: 1,
                implementer: AgentName::Claude,
                reviewer: AgentName::Codex,
                switched_at: "t".to_string(),
            },
            RoundRoleHistoryEntry {
                round: 2,
                implementer: AgentName::Claude,
                reviewer: AgentName::Codex,
                switched_at: "t".to_string(),
            },
        ];
        let transcript = vec![pass_envelope(
            1,
            AgentName::Codex,
            AgentName::Claude,
            Some(vec![Finding {
                severity: Severity::P1,
                title: "Race".to_string(),
                detail: None,
                code: None,
                refs: vec!["x".to_string()],
            }]),
        )];
        let input = ConvergenceInput {
            current_round: 2,
            agents: &agents,
            round_role_history: &history,
            transcript: &transcript,
        };
        let outcome = ConvergencePolicy::evaluate(&input);
        assert!(!outcome.ok);
    }

    #[test]
    fn is_pure_for_equal_inputs() {
        let agents = AgentPair::new(AgentName::Claude, AgentName::Codex).unwrap();
        let history = vec![RoundRoleHistoryEntry {
            round: 1,
            implementer: AgentName::Claude,
            reviewer: AgentName::Codex,
            switched_at: "t".to_string(),
        }];
        let transcript = vec![];
        let input = ConvergenceInput {
            current_round: 1,
            agents: &agents,
            round_role_history: &history,
            transcript: &transcript,
        };
        let a = ConvergencePolicy::evaluate(&input);
        let b = ConvergencePolicy::evaluate(&input);
        assert_eq!(a, b);
    }
}
