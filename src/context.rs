use std::path::{Path, PathBuf};

use crate::collaborators::VcsRunner;
use crate::config_io::parse_bubble_toml;
use crate::error::{CoreError, CoreResult};
use crate::model::BubbleConfig;
use crate::paths::{bubbles_root, default_worktree_path, BubbleLayout};

/// The outcome of either context-resolution operation (§6.4): the bubble's
/// config plus the repo root it was resolved under.
#[derive(Debug, Clone)]
pub struct ResolvedBubble {
    pub repo_root: PathBuf,
    pub layout: BubbleLayout,
    pub config: BubbleConfig,
}

fn canonical(path: &Path) -> CoreResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| {
        CoreError::WorkspaceResolution(format!("cannot canonicalize {}: {e}", path.display()))
    })
}

fn load_bubble(repo_root: &Path, bubble_id: &str) -> CoreResult<ResolvedBubble> {
    let layout = BubbleLayout::under_repo(repo_root, bubble_id);
    let config_path = layout.config_path();
    let raw = std::fs::read_to_string(&config_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CoreError::BubbleNotFound(bubble_id.to_string())
        } else {
            CoreError::Io(e)
        }
    })?;
    let config = parse_bubble_toml(&raw)?;

    if config.id != bubble_id {
        return Err(CoreError::WorkspaceResolution(format!(
            "bubble.toml id '{}' does not match directory id '{bubble_id}'",
            config.id
        )));
    }

    let canonical_repo_root = canonical(repo_root)?;
    let canonical_config_repo = canonical(&config.repo_path)?;
    if canonical_config_repo != canonical_repo_root {
        return Err(CoreError::WorkspaceResolution(format!(
            "bubble.toml repo_path {} does not match resolved repo {}",
            config.repo_path.display(),
            repo_root.display()
        )));
    }

    Ok(ResolvedBubble {
        repo_root: canonical_repo_root,
        layout,
        config,
    })
}

/// §6.4 `resolveById`: either trusts the supplied `repo_path`, or walks
/// ancestors of `cwd` looking for `.pairflow/bubbles/<id>/bubble.toml`.
pub fn resolve_by_id(
    bubble_id: &str,
    repo_path: Option<&Path>,
    cwd: Option<&Path>,
) -> CoreResult<ResolvedBubble> {
    if let Some(repo_path) = repo_path {
        return load_bubble(repo_path, bubble_id);
    }

    let start = match cwd {
        Some(c) => c.to_path_buf(),
        None => std::env::current_dir().map_err(CoreError::Io)?,
    };

    let mut candidate = Some(start.as_path());
    while let Some(dir) = candidate {
        let marker = bubbles_root(dir).join(bubble_id).join("bubble.toml");
        if marker.is_file() {
            return load_bubble(dir, bubble_id);
        }
        candidate = dir.parent();
    }

    Err(CoreError::WorkspaceResolution(format!(
        "no bubble.toml found for id '{bubble_id}' walking up from {}",
        start.display()
    )))
}

fn branch_candidate_id(branch: &str) -> Option<&str> {
    branch
        .strip_prefix("bubble/")
        .or_else(|| branch.strip_prefix("pf/"))
}

/// §6.4 `resolveFromWorkspaceCwd`: asks the VCS collaborator for the
/// common-dir/work-tree-root, derives a candidate id from the branch name,
/// and falls back to scanning bubble configs and matching by the
/// conventional worktree path when the branch doesn't name a candidate (or
/// the named bubble isn't actually rooted at `cwd`).
pub fn resolve_from_workspace_cwd(cwd: &Path, vcs: &dyn VcsRunner) -> CoreResult<ResolvedBubble> {
    let common_dir_out = vcs.run(&["rev-parse", "--git-common-dir"], cwd, false)?;
    let common_dir = PathBuf::from(common_dir_out.stdout.trim());
    let common_dir = if common_dir.is_absolute() {
        common_dir
    } else {
        cwd.join(common_dir)
    };
    let repo_root = common_dir
        .parent()
        .ok_or_else(|| CoreError::WorkspaceResolution("git common-dir has no parent".to_string()))?
        .to_path_buf();
    let repo_root = canonical(&repo_root)?;

    let work_tree_out = vcs.run(&["rev-parse", "--show-toplevel"], cwd, false)?;
    let work_tree_root = canonical(Path::new(work_tree_out.stdout.trim()))?;

    let branch_out = vcs.run(&["rev-parse", "--abbrev-ref", "HEAD"], cwd, true)?;
    let branch = branch_out.stdout.trim();

    if let Some(candidate_id) = branch_candidate_id(branch) {
        if let Ok(resolved) = load_bubble(&repo_root, candidate_id) {
            return Ok(resolved);
        }
    }

    let scan_root = bubbles_root(&repo_root);
    let entries = match std::fs::read_dir(&scan_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::WorkspaceResolution(format!(
                "no bubble matches workspace at {}",
                cwd.display()
            )))
        }
        Err(e) => return Err(CoreError::Io(e)),
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(CoreError::Io)?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let candidate_worktree = default_worktree_path(&repo_root, &id);
        if canonical(&candidate_worktree).ok().as_ref() == Some(&work_tree_root) {
            matches.push(id);
        }
    }

    match matches.len() {
        0 => Err(CoreError::WorkspaceResolution(format!(
            "no bubble matches workspace at {}",
            cwd.display()
        ))),
        1 => load_bubble(&repo_root, &matches[0]),
        _ => Err(CoreError::WorkspaceResolution(format!(
            "multiple bubbles match workspace at {}: {:?}",
            cwd.display(),
            matches
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_io::render_bubble_toml;
    use crate::model::agent::{AgentName, AgentPair};
    use crate::model::config::{CommandsConfig, NotificationsConfig, QualityMode, ReviewerContextMode, WorkMode};

    fn write_bubble(repo_root: &Path, id: &str) {
        let layout = BubbleLayout::under_repo(repo_root, id);
        std::fs::create_dir_all(layout.root.clone()).unwrap();
        let config = BubbleConfig {
            id: id.to_string(),
            repo_path: repo_root.to_path_buf(),
            base_branch: "main".to_string(),
            bubble_branch: format!("bubble/{id}"),
            work_mode: WorkMode::Worktree,
            quality_mode: QualityMode::Strict,
            reviewer_context_mode: ReviewerContextMode::Fresh,
            watchdog_timeout_minutes: 30,
            max_rounds: 10,
            commit_requires_approval: true,
            open_command: None,
            agents: AgentPair::new(AgentName::Claude, AgentName::Codex).unwrap(),
            commands: CommandsConfig {
                test: "t".to_string(),
                typecheck: "tc".to_string(),
            },
            notifications: NotificationsConfig {
                enabled: false,
                waiting_human_sound: None,
                converged_sound: None,
            },
            local_overlay: None,
            bubble_instance_id: None,
        };
        std::fs::write(layout.config_path(), render_bubble_toml(&config)).unwrap();
    }

    #[test]
    fn resolve_by_id_with_explicit_repo_path() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = std::fs::canonicalize(dir.path()).unwrap();
        write_bubble(&repo_root, "b1");
        let resolved = resolve_by_id("b1", Some(&repo_root), None).unwrap();
        assert_eq!(resolved.config.id, "b1");
    }

    #[test]
    fn resolve_by_id_walks_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = std::fs::canonicalize(dir.path()).unwrap();
        write_bubble(&repo_root, "b1");
        let nested = repo_root.join("nested").join("deeper");
        std::fs::create_dir_all(&nested).unwrap();
        let resolved = resolve_by_id("b1", None, Some(&nested)).unwrap();
        assert_eq!(resolved.config.id, "b1");
    }

    #[test]
    fn resolve_by_id_missing_is_bubble_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = std::fs::canonicalize(dir.path()).unwrap();
        let err = resolve_by_id("missing", Some(&repo_root), None).unwrap_err();
        assert_eq!(err.kind_name(), "bubble_not_found");
    }
}
