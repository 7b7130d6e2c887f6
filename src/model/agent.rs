use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The closed set of coding agents the orchestrator knows how to pair and
/// spawn. Grounded in the teacher's own `autopilot::worker::AgentKind`
/// (`Opencode`, `Codex`, `Claude`), which is the one place the source repo
/// already commits to a fixed roster of agent binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentName {
    Claude,
    Codex,
    Opencode,
}

impl AgentName {
    pub const ALL: [AgentName; 3] = [AgentName::Claude, AgentName::Codex, AgentName::Opencode];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Claude => "claude",
            AgentName::Codex => "codex",
            AgentName::Opencode => "opencode",
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentName::Claude),
            "codex" => Ok(AgentName::Codex),
            "opencode" => Ok(AgentName::Opencode),
            other => Err(CoreError::schema(format!("unknown agent name: {other}"))),
        }
    }
}

/// The two sides of the ping-pong protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Implementer,
    Reviewer,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Implementer => Role::Reviewer,
            Role::Reviewer => Role::Implementer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `agents = { implementer, reviewer }`: the two agent names paired for a
/// bubble. `implementer != reviewer` is enforced at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPair {
    pub implementer: AgentName,
    pub reviewer: AgentName,
}

impl AgentPair {
    pub fn new(implementer: AgentName, reviewer: AgentName) -> Result<Self, CoreError> {
        if implementer == reviewer {
            return Err(CoreError::schema(
                "agents.implementer and agents.reviewer must differ",
            ));
        }
        Ok(Self {
            implementer,
            reviewer,
        })
    }

    pub fn for_role(&self, role: Role) -> AgentName {
        match role {
            Role::Implementer => self.implementer,
            Role::Reviewer => self.reviewer,
        }
    }
}
