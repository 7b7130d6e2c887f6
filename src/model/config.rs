use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::agent::AgentPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    Worktree,
    Clone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerContextMode {
    Fresh,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    Symlink,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsConfig {
    pub test: String,
    pub typecheck: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_human_sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converged_sound: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOverlayConfig {
    pub enabled: bool,
    pub mode: OverlayMode,
    pub entries: Vec<String>,
}

impl LocalOverlayConfig {
    fn validate(&self) -> Result<(), CoreError> {
        if self.entries.is_empty() {
            return Err(CoreError::schema(
                "local_overlay.entries must be non-empty when local_overlay is present",
            ));
        }
        for entry in &self.entries {
            if entry.trim().is_empty() {
                return Err(CoreError::schema("local_overlay entry must be non-empty"));
            }
            if std::path::Path::new(entry).is_absolute() {
                return Err(CoreError::schema(format!(
                    "local_overlay entry must be relative: {entry}"
                )));
            }
            if entry.split('/').any(|seg| seg == "..") {
                return Err(CoreError::schema(format!(
                    "local_overlay entry must not escape the workspace: {entry}"
                )));
            }
        }
        Ok(())
    }
}

/// Immutable-after-creation bubble configuration (`bubble.toml`), plus the
/// lazily backfilled `bubble_instance_id` field (the one mutable exception,
/// §3.2/§4.8.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BubbleConfig {
    pub id: String,
    pub repo_path: std::path::PathBuf,
    pub base_branch: String,
    pub bubble_branch: String,
    pub work_mode: WorkMode,
    pub quality_mode: QualityMode,
    pub reviewer_context_mode: ReviewerContextMode,
    pub watchdog_timeout_minutes: u32,
    pub max_rounds: u32,
    pub commit_requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_command: Option<String>,
    pub agents: AgentPair,
    pub commands: CommandsConfig,
    pub notifications: NotificationsConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_overlay: Option<LocalOverlayConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bubble_instance_id: Option<String>,
}

pub fn validate_bubble_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::schema("bubble id must not be empty"));
    }
    let ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(CoreError::schema(format!(
            "bubble id has invalid characters: {id}"
        )));
    }
    Ok(())
}

pub fn validate_bubble_instance_id(value: &str) -> Result<(), CoreError> {
    let bytes = value.as_bytes();
    if bytes.len() < 10 || bytes.len() > 128 {
        return Err(CoreError::schema(
            "bubble_instance_id length must be 10..=128",
        ));
    }
    let first = bytes[0] as char;
    if !first.is_ascii_alphanumeric() {
        return Err(CoreError::schema(
            "bubble_instance_id must start with an alphanumeric character",
        ));
    }
    let rest_ok = value[1..]
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !rest_ok {
        return Err(CoreError::schema(
            "bubble_instance_id has invalid characters",
        ));
    }
    Ok(())
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ASCII")
}

/// Generates `bi_<base36-millis>_<20 hex chars>` per §3.2. Callers supply the
/// timestamp (no `Instant::now()`/`SystemTime::now()` inside library code
/// wherever the caller context already carries a `now`) and a source of
/// randomness for the suffix.
pub fn generate_bubble_instance_id(now_millis: u128, mut rand_bytes: impl FnMut(&mut [u8])) -> String {
    let mut buf = [0u8; 10];
    rand_bytes(&mut buf);
    let mut hex = String::with_capacity(20);
    for b in buf {
        hex.push_str(&format!("{:02x}", b));
    }
    format!("bi_{}_{}", to_base36(now_millis), hex)
}

impl BubbleConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_bubble_id(&self.id)?;
        if self.base_branch == self.bubble_branch {
            return Err(CoreError::schema(
                "base_branch and bubble_branch must be distinct",
            ));
        }
        if self.watchdog_timeout_minutes == 0 {
            return Err(CoreError::schema(
                "watchdog_timeout_minutes must be positive",
            ));
        }
        if self.max_rounds == 0 {
            return Err(CoreError::schema("max_rounds must be positive"));
        }
        if let Some(cmd) = &self.open_command {
            if !cmd.contains("{{worktree_path}}") {
                return Err(CoreError::schema(
                    "open_command must contain the literal {{worktree_path}}",
                ));
            }
        }
        if let Some(overlay) = &self.local_overlay {
            overlay.validate()?;
        }
        if let Some(id) = &self.bubble_instance_id {
            validate_bubble_instance_id(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_equal_agents() {
        let err = AgentPair::new(
            crate::model::agent::AgentName::Claude,
            crate::model::agent::AgentName::Claude,
        )
        .unwrap_err();
        assert_eq!(err.kind_name(), "schema_validation");
    }

    #[test]
    fn instance_id_round_trips_pattern() {
        let id = generate_bubble_instance_id(1_700_000_000_000, |buf| buf.fill(0xab));
        assert!(id.starts_with("bi_"));
        validate_bubble_instance_id(&id).expect("generated id must validate");
    }

    #[test]
    fn local_overlay_rejects_parent_escape() {
        let overlay = LocalOverlayConfig {
            enabled: true,
            mode: OverlayMode::Symlink,
            entries: vec!["../escape".to_string()],
        };
        assert!(overlay.validate().is_err());
    }
}
