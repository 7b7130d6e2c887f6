use std::path::{Path, PathBuf};

/// Filesystem layout for one bubble directory (§3.1): `bubble.toml`,
/// `state.json`, `transcript.ndjson`, `inbox.ndjson`, `artifacts/`, plus a
/// sibling `locks/` directory holding sentinel files.
#[derive(Debug, Clone)]
pub struct BubbleLayout {
    pub root: PathBuf,
}

impl BubbleLayout {
    /// `<repo_root>/.pairflow/bubbles/<id>`, matching the `.pairflow/bubbles/<id>/bubble.toml`
    /// layout context resolution walks for (§6.4).
    pub fn under_repo(repo_root: &Path, bubble_id: &str) -> Self {
        Self {
            root: repo_root.join(".pairflow").join("bubbles").join(bubble_id),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("bubble.toml")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.root.join("transcript.ndjson")
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.root.join("inbox.ndjson")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn task_artifact_path(&self) -> PathBuf {
        self.artifacts_dir().join("task.md")
    }

    pub fn done_package_path(&self) -> PathBuf {
        self.artifacts_dir().join("done-package.md")
    }

    /// `locks/` is a sibling of the bubble directory, not nested under it,
    /// per §3.1.
    fn locks_dir(&self) -> PathBuf {
        self.root
            .parent()
            .map(|p| p.join("locks"))
            .unwrap_or_else(|| self.root.join("..").join("locks"))
    }

    /// Every mutating command acquires exactly one per-bubble lock at
    /// `locks/<bubbleId>.lock` (§4.8/§5).
    pub fn bubble_lock_path(&self, bubble_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{bubble_id}.lock"))
    }
}

/// Spec.md is silent on the worktree path convention (it only names the
/// bubble *directory* layout). This crate places worktrees as siblings of
/// the bubbles root, following the teacher's own
/// `autopilot::worker::create_worktree`, which materializes worktrees under
/// `<repo_root>/worktrees/`.
pub fn default_worktree_path(repo_root: &Path, bubble_id: &str) -> PathBuf {
    repo_root
        .join(".pairflow")
        .join("worktrees")
        .join(bubble_id)
}

/// Root directory under which every bubble subdirectory lives.
pub fn bubbles_root(repo_root: &Path) -> PathBuf {
    repo_root.join(".pairflow").join("bubbles")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_under_bubble_root() {
        let layout = BubbleLayout::under_repo(Path::new("/repo"), "b1");
        assert_eq!(
            layout.root,
            PathBuf::from("/repo/.pairflow/bubbles/b1")
        );
        assert_eq!(layout.config_path(), layout.root.join("bubble.toml"));
        assert_eq!(layout.state_path(), layout.root.join("state.json"));
        assert_eq!(
            layout.transcript_path(),
            layout.root.join("transcript.ndjson")
        );
        assert_eq!(layout.inbox_path(), layout.root.join("inbox.ndjson"));
    }

    #[test]
    fn lock_path_is_sibling_of_bubble_dir() {
        let layout = BubbleLayout::under_repo(Path::new("/repo"), "b1");
        assert_eq!(
            layout.bubble_lock_path("b1"),
            PathBuf::from("/repo/.pairflow/bubbles/locks/b1.lock")
        );
    }
}
