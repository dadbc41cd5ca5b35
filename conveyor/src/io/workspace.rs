//! Per-item git worktrees.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::branch::{BranchNameError, validate_branch_name};
use crate::io::git::{Git, WorktreeEntry};
use crate::io::process::{ProcessRequest, run_streaming, shell_argv};
use crate::io::registry::ProcessRegistry;

/// An isolated checkout for one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub item_id: u64,
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Branch(#[from] BranchNameError),
    #[error("git {op} failed: {detail}")]
    Git { op: &'static str, detail: String },
    #[error("setup command `{command}` failed: {detail}")]
    Setup { command: String, detail: String },
}

fn git_err(op: &'static str) -> impl FnOnce(anyhow::Error) -> WorkspaceError {
    move |err| WorkspaceError::Git {
        op,
        detail: format!("{err:#}"),
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: Git,
    repo_root: PathBuf,
    base_dir: PathBuf,
    branch_prefix: String,
    trunk: String,
    setup_timeout: Duration,
    registry: Arc<ProcessRegistry>,
}

impl WorkspaceManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
        trunk: impl Into<String>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        let repo_root = repo_root.into();
        Self {
            git: Git::new(&repo_root),
            repo_root,
            base_dir: base_dir.into(),
            branch_prefix: branch_prefix.into(),
            trunk: trunk.into(),
            setup_timeout: Duration::from_secs(15 * 60),
            registry,
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, item_id: u64) -> PathBuf {
        self.base_dir.join(format!("issue-{item_id}"))
    }

    pub fn branch_for(&self, item_id: u64, suffix: &str) -> String {
        format!("{}issue-{item_id}-{suffix}", self.branch_prefix)
    }

    /// Create a fresh branch off trunk and check it out in a new worktree.
    #[instrument(skip_all, fields(item_id))]
    pub fn create(&self, item_id: u64, setup: Option<&str>) -> Result<Workspace, WorkspaceError> {
        let branch = self.branch_for(item_id, &short_suffix());
        validate_branch_name(&branch)?;
        validate_branch_name(&self.trunk)?;
        let path = self.path_for(item_id);
        self.clear_path(&path);
        self.ensure_base_dir()?;

        self.git
            .worktree_add_new_branch(&path, &branch, &self.trunk)
            .map_err(git_err("worktree add"))?;
        info!(branch = %branch, path = %path.display(), "workspace created");

        let workspace = Workspace {
            item_id,
            path,
            branch,
        };
        if let Some(command) = setup.filter(|c| !c.trim().is_empty())
            && let Err(err) = self.run_setup(&workspace, command)
        {
            if let Err(cleanup) = self.remove(&workspace) {
                warn!(err = %cleanup, "failed to remove workspace after setup failure");
            }
            return Err(err);
        }
        Ok(workspace)
    }

    /// Check out an existing branch in the item's worktree path.
    #[instrument(skip_all, fields(item_id, branch))]
    pub fn attach(&self, item_id: u64, branch: &str) -> Result<Workspace, WorkspaceError> {
        validate_branch_name(branch)?;
        let path = self.path_for(item_id);
        self.clear_path(&path);
        self.ensure_base_dir()?;
        self.git
            .worktree_add_existing(&path, branch)
            .map_err(git_err("worktree add"))?;
        info!(path = %path.display(), "workspace attached to existing branch");
        Ok(Workspace {
            item_id,
            path,
            branch: branch.to_string(),
        })
    }

    /// Reuse a checkout that is still registered at `path` on `branch`.
    pub fn reuse(&self, item_id: u64, path: &Path, branch: &str) -> Option<Workspace> {
        let entries = self.list().ok()?;
        let wanted = canonical(path);
        entries
            .iter()
            .any(|e| canonical(&e.path) == wanted && e.branch.as_deref() == Some(branch))
            .then(|| Workspace {
                item_id,
                path: path.to_path_buf(),
                branch: branch.to_string(),
            })
    }

    #[instrument(skip_all, fields(item_id = workspace.item_id))]
    pub fn remove(&self, workspace: &Workspace) -> anyhow::Result<()> {
        self.git.worktree_remove(&workspace.path)?;
        self.git.worktree_prune()?;
        debug!("workspace removed");
        Ok(())
    }

    pub fn list(&self) -> anyhow::Result<Vec<WorktreeEntry>> {
        self.git.worktree_list()
    }

    /// Remove every worktree under the base directory, continuing past failures.
    #[instrument(skip_all)]
    pub fn clean_stale(&self) -> anyhow::Result<usize> {
        let base = canonical(&self.base_dir);
        let root = canonical(&self.repo_root);
        let mut removed = 0;
        for entry in self.list()? {
            let path = canonical(&entry.path);
            if path == root || entry.branch.as_deref() == Some(self.trunk.as_str()) {
                continue;
            }
            if !path.starts_with(&base) {
                continue;
            }
            match self.git.worktree_remove(&entry.path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %entry.path.display(), err = %err, "failed to remove stale worktree"),
            }
        }
        if let Err(err) = self.git.worktree_prune() {
            warn!(err = %err, "worktree prune failed");
        }
        info!(removed, "stale worktrees cleaned");
        Ok(removed)
    }

    /// Most recent pipeline branch for an item, local or remote.
    pub fn find_branch_for(&self, item_id: u64) -> anyhow::Result<Option<String>> {
        let pattern = format!("{}issue-{item_id}-*", self.branch_prefix);
        let branches = self.git.branches_matching(&pattern)?;
        Ok(branches.into_iter().next())
    }

    fn run_setup(&self, workspace: &Workspace, command: &str) -> Result<(), WorkspaceError> {
        info!(command, "running workspace setup");
        let argv = shell_argv(command);
        let req = ProcessRequest::new(&argv, &workspace.path, self.setup_timeout);
        let out = run_streaming(&req, &self.registry, |line| debug!(line, "setup")).map_err(|err| {
            WorkspaceError::Setup {
                command: command.to_string(),
                detail: format!("{err:#}"),
            }
        })?;
        if !out.success() {
            return Err(WorkspaceError::Setup {
                command: command.to_string(),
                detail: out.diagnostic(),
            });
        }
        Ok(())
    }

    fn ensure_base_dir(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.base_dir).map_err(|err| WorkspaceError::Git {
            op: "create worktree dir",
            detail: format!("{}: {err}", self.base_dir.display()),
        })
    }

    /// Drop a leftover checkout from an earlier crash.
    fn clear_path(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        warn!(path = %path.display(), "removing leftover workspace path");
        if self.git.worktree_remove(path).is_err()
            && let Err(err) = fs::remove_dir_all(path)
        {
            warn!(err = %err, "failed to delete leftover workspace path");
        }
        if let Err(err) = self.git.worktree_prune() {
            warn!(err = %err, "worktree prune failed");
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn short_suffix() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn manager(repo: &TestRepo) -> WorkspaceManager {
        WorkspaceManager::new(
            repo.path(),
            repo.path().join(".conveyor/worktrees"),
            "auto/",
            "main",
            Arc::new(ProcessRegistry::new()),
        )
    }

    #[test]
    fn create_makes_branch_and_worktree() {
        let repo = TestRepo::new();
        let manager = manager(&repo);

        let ws = manager.create(42, None).expect("create");

        assert!(ws.branch.starts_with("auto/issue-42-"));
        assert_eq!(ws.branch.len(), "auto/issue-42-".len() + 6);
        assert!(ws.path.join("README.md").exists());
        let listed = manager.list().expect("list");
        assert!(listed.iter().any(|e| e.branch.as_deref() == Some(ws.branch.as_str())));
    }

    #[test]
    fn setup_failure_is_typed_and_cleans_up() {
        let repo = TestRepo::new();
        let manager = manager(&repo);

        let err = manager.create(5, Some("echo broken >&2; exit 1")).unwrap_err();

        assert!(matches!(err, WorkspaceError::Setup { .. }), "{err}");
        assert!(err.to_string().contains("broken"));
        assert!(!manager.path_for(5).exists());
    }

    #[test]
    fn setup_runs_inside_the_worktree() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let ws = manager.create(6, Some("touch installed")).expect("create");
        assert!(ws.path.join("installed").exists());
    }

    #[test]
    fn bad_trunk_is_a_branch_error() {
        let repo = TestRepo::new();
        let manager = WorkspaceManager::new(
            repo.path(),
            repo.path().join("wt"),
            "auto/",
            "--upload-pack=/tmp/evil",
            Arc::new(ProcessRegistry::new()),
        );
        assert!(matches!(manager.create(1, None), Err(WorkspaceError::Branch(_))));
    }

    #[test]
    fn remove_and_clean_stale() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let first = manager.create(1, None).expect("create 1");
        manager.create(2, None).expect("create 2");
        manager.create(3, None).expect("create 3");

        manager.remove(&first).expect("remove");
        assert!(!first.path.exists());

        let removed = manager.clean_stale().expect("clean");
        assert_eq!(removed, 2);
        let remaining = manager.list().expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn attach_and_find_existing_branch() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let ws = manager.create(9, None).expect("create");
        manager.remove(&ws).expect("remove");

        let found = manager.find_branch_for(9).expect("find");
        assert_eq!(found.as_deref(), Some(ws.branch.as_str()));
        let attached = manager.attach(9, &ws.branch).expect("attach");
        assert_eq!(attached.path, manager.path_for(9));
        assert!(manager.reuse(9, &attached.path, &attached.branch).is_some());
        assert_eq!(manager.find_branch_for(10).expect("find"), None);
    }
}
