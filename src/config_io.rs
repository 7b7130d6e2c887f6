use crate::error::CoreError;
use crate::model::config::{
    BubbleConfig, CommandsConfig, LocalOverlayConfig, NotificationsConfig, OverlayMode,
    QualityMode, ReviewerContextMode, WorkMode,
};
use crate::model::agent::{AgentName, AgentPair};

/// `bubble.toml` reader/writer (§6.1): a restricted TOML 1.0 subset with a
/// deterministic render form, grounded in the teacher's own TOML config
/// loader (`main.rs::load_config`, which round-trips a `Config` struct
/// through `toml::from_str`) generalized with an explicit writer, since the
/// teacher never writes TOML back out.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn work_mode_str(m: WorkMode) -> &'static str {
    match m {
        WorkMode::Worktree => "worktree",
        WorkMode::Clone => "clone",
    }
}

fn quality_mode_str(m: QualityMode) -> &'static str {
    match m {
        QualityMode::Strict => "strict",
    }
}

fn reviewer_context_mode_str(m: ReviewerContextMode) -> &'static str {
    match m {
        ReviewerContextMode::Fresh => "fresh",
        ReviewerContextMode::Persistent => "persistent",
    }
}

fn overlay_mode_str(m: OverlayMode) -> &'static str {
    match m {
        OverlayMode::Symlink => "symlink",
        OverlayMode::Copy => "copy",
    }
}

/// Renders `config` in the canonical form: header keys in the declaration
/// order of §3.2, then `[agents]`, `[commands]`, `[notifications]`, then an
/// optional `[local_overlay]` — no duplicated blank lines when optional
/// sections are omitted.
pub fn render_bubble_toml(config: &BubbleConfig) -> String {
    let mut out = String::new();
    out.push_str("# pairflow bubble config — do not edit after creation\n");
    out.push_str(&format!("id = {}\n", quote(&config.id)));
    out.push_str(&format!(
        "repo_path = {}\n",
        quote(&config.repo_path.display().to_string())
    ));
    out.push_str(&format!("base_branch = {}\n", quote(&config.base_branch)));
    out.push_str(&format!(
        "bubble_branch = {}\n",
        quote(&config.bubble_branch)
    ));
    out.push_str(&format!(
        "work_mode = {}\n",
        quote(work_mode_str(config.work_mode))
    ));
    out.push_str(&format!(
        "quality_mode = {}\n",
        quote(quality_mode_str(config.quality_mode))
    ));
    out.push_str(&format!(
        "reviewer_context_mode = {}\n",
        quote(reviewer_context_mode_str(config.reviewer_context_mode))
    ));
    out.push_str(&format!(
        "watchdog_timeout_minutes = {}\n",
        config.watchdog_timeout_minutes
    ));
    out.push_str(&format!("max_rounds = {}\n", config.max_rounds));
    out.push_str(&format!(
        "commit_requires_approval = {}\n",
        config.commit_requires_approval
    ));
    if let Some(cmd) = &config.open_command {
        out.push_str(&format!("open_command = {}\n", quote(cmd)));
    }
    if let Some(id) = &config.bubble_instance_id {
        out.push_str(&format!("bubble_instance_id = {}\n", quote(id)));
    }

    out.push_str("\n[agents]\n");
    out.push_str(&format!(
        "implementer = {}\n",
        quote(config.agents.implementer.as_str())
    ));
    out.push_str(&format!(
        "reviewer = {}\n",
        quote(config.agents.reviewer.as_str())
    ));

    out.push_str("\n[commands]\n");
    out.push_str(&format!("test = {}\n", quote(&config.commands.test)));
    out.push_str(&format!(
        "typecheck = {}\n",
        quote(&config.commands.typecheck)
    ));

    out.push_str("\n[notifications]\n");
    out.push_str(&format!("enabled = {}\n", config.notifications.enabled));
    if let Some(s) = &config.notifications.waiting_human_sound {
        out.push_str(&format!("waiting_human_sound = {}\n", quote(s)));
    }
    if let Some(s) = &config.notifications.converged_sound {
        out.push_str(&format!("converged_sound = {}\n", quote(s)));
    }

    if let Some(overlay) = &config.local_overlay {
        out.push_str("\n[local_overlay]\n");
        out.push_str(&format!("enabled = {}\n", overlay.enabled));
        out.push_str(&format!(
            "mode = {}\n",
            quote(overlay_mode_str(overlay.mode))
        ));
        out.push_str("entries = [");
        for (i, e) in overlay.entries.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&quote(e));
        }
        out.push_str("]\n");
    }

    out
}

/// Rejects the subset of TOML the spec disallows: dotted keys, array-of-
/// tables, multiline strings. A hand-rolled scan rather than a custom
/// parser, since `toml::from_str` already accepts the full grammar and we
/// only need to reject a few constructs before handing off to it.
fn reject_disallowed_syntax(raw: &str) -> Result<(), CoreError> {
    for (lineno, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("[[") {
            return Err(CoreError::schema(format!(
                "bubble.toml line {}: array-of-tables is not supported",
                lineno + 1
            )));
        }
        if trimmed.contains("\"\"\"") || trimmed.contains("'''") {
            return Err(CoreError::schema(format!(
                "bubble.toml line {}: multiline strings are not supported",
                lineno + 1
            )));
        }
        if let Some((key, _)) = trimmed.split_once('=') {
            let key = key.trim();
            if !key.starts_with('[') && key.contains('.') {
                return Err(CoreError::schema(format!(
                    "bubble.toml line {}: dotted keys are not supported",
                    lineno + 1
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct WireAgents {
    implementer: String,
    reviewer: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct WireCommands {
    test: String,
    typecheck: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct WireNotifications {
    enabled: bool,
    waiting_human_sound: Option<String>,
    converged_sound: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct WireOverlay {
    enabled: bool,
    mode: String,
    entries: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct WireConfig {
    id: String,
    repo_path: String,
    base_branch: String,
    bubble_branch: String,
    work_mode: String,
    quality_mode: String,
    reviewer_context_mode: String,
    watchdog_timeout_minutes: u32,
    max_rounds: u32,
    commit_requires_approval: bool,
    open_command: Option<String>,
    bubble_instance_id: Option<String>,
    agents: WireAgents,
    commands: WireCommands,
    notifications: WireNotifications,
    local_overlay: Option<WireOverlay>,
}

pub fn parse_bubble_toml(raw: &str) -> Result<BubbleConfig, CoreError> {
    reject_disallowed_syntax(raw)?;
    let wire: WireConfig =
        toml::from_str(raw).map_err(|e| CoreError::schema(format!("bubble.toml: {e}")))?;

    let work_mode = match wire.work_mode.as_str() {
        "worktree" => WorkMode::Worktree,
        "clone" => WorkMode::Clone,
        other => return Err(CoreError::schema(format!("unknown work_mode: {other}"))),
    };
    let quality_mode = match wire.quality_mode.as_str() {
        "strict" => QualityMode::Strict,
        other => return Err(CoreError::schema(format!("unknown quality_mode: {other}"))),
    };
    let reviewer_context_mode = match wire.reviewer_context_mode.as_str() {
        "fresh" => ReviewerContextMode::Fresh,
        "persistent" => ReviewerContextMode::Persistent,
        other => {
            return Err(CoreError::schema(format!(
                "unknown reviewer_context_mode: {other}"
            )))
        }
    };
    let implementer: AgentName = wire.agents.implementer.parse()?;
    let reviewer: AgentName = wire.agents.reviewer.parse()?;
    let agents = AgentPair::new(implementer, reviewer)?;

    let local_overlay = match wire.local_overlay {
        None => None,
        Some(o) => {
            let mode = match o.mode.as_str() {
                "symlink" => OverlayMode::Symlink,
                "copy" => OverlayMode::Copy,
                other => return Err(CoreError::schema(format!("unknown overlay mode: {other}"))),
            };
            Some(LocalOverlayConfig {
                enabled: o.enabled,
                mode,
                entries: o.entries,
            })
        }
    };

    let config = BubbleConfig {
        id: wire.id,
        repo_path: wire.repo_path.into(),
        base_branch: wire.base_branch,
        bubble_branch: wire.bubble_branch,
        work_mode,
        quality_mode,
        reviewer_context_mode,
        watchdog_timeout_minutes: wire.watchdog_timeout_minutes,
        max_rounds: wire.max_rounds,
        commit_requires_approval: wire.commit_requires_approval,
        open_command: wire.open_command,
        agents,
        commands: CommandsConfig {
            test: wire.commands.test,
            typecheck: wire.commands.typecheck,
        },
        notifications: NotificationsConfig {
            enabled: wire.notifications.enabled,
            waiting_human_sound: wire.notifications.waiting_human_sound,
            converged_sound: wire.notifications.converged_sound,
        },
        local_overlay,
        bubble_instance_id: wire.bubble_instance_id,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{CommandsConfig, NotificationsConfig};

    fn sample_config() -> BubbleConfig {
        BubbleConfig {
            id: "b1".to_string(),
            repo_path: "/tmp/repo".into(),
            base_branch: "main".to_string(),
            bubble_branch: "bubble/b1".to_string(),
            work_mode: WorkMode::Worktree,
            quality_mode: QualityMode::Strict,
            reviewer_context_mode: ReviewerContextMode::Fresh,
            watchdog_timeout_minutes: 30,
            max_rounds: 10,
            commit_requires_approval: true,
            open_command: None,
            agents: AgentPair::new(AgentName::Claude, AgentName::Codex).unwrap(),
            commands: CommandsConfig {
                test: "cargo test".to_string(),
                typecheck: "cargo check".to_string(),
            },
            notifications: NotificationsConfig {
                enabled: true,
                waiting_human_sound: None,
                converged_sound: None,
            },
            local_overlay: None,
            bubble_instance_id: None,
        }
    }

    #[test]
    fn render_parse_round_trips() {
        let config = sample_config();
        let rendered = render_bubble_toml(&config);
        let parsed = parse_bubble_toml(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn render_is_idempotent_through_parse(
    ) {
        let config = sample_config();
        let first = render_bubble_toml(&config);
        let reparsed = parse_bubble_toml(&first).unwrap();
        let second = render_bubble_toml(&reparsed);
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_dotted_keys() {
        let raw = "id = \"b1\"\na.b = \"x\"\n";
        assert!(parse_bubble_toml(raw).is_err());
    }

    #[test]
    fn rejects_array_of_tables() {
        let raw = "id = \"b1\"\n[[agents]]\n";
        assert!(parse_bubble_toml(raw).is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let config = sample_config();
        let mut rendered = render_bubble_toml(&config);
        rendered.push_str("unknown_field = \"x\"\n");
        assert!(parse_bubble_toml(&rendered).is_err());
    }
}
