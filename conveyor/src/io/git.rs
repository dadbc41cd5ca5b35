//! Git adapter for worktrees, integration and publishing.
//!
//! Every branch name that reaches a `git` argv is validated first, so a
//! tracker-sourced name can never be read as an option.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::branch::validate_branch_name;

/// One record of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name; `None` when detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Local and remote-tracking branches matching a glob, as short names.
    pub fn branches_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let remote_pattern = format!("refs/remotes/*/{pattern}");
        let local_pattern = format!("refs/heads/{pattern}");
        let out = self.run_capture(&[
            "for-each-ref",
            "--format=%(refname)",
            &local_pattern,
            &remote_pattern,
        ])?;
        let mut names = Vec::new();
        for refname in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let short = if let Some(local) = refname.strip_prefix("refs/heads/") {
                local
            } else if let Some(remote) = refname.strip_prefix("refs/remotes/") {
                remote.split_once('/').map_or(remote, |(_, rest)| rest)
            } else {
                continue;
            };
            if validate_branch_name(short).is_ok() && !names.iter().any(|n| n == short) {
                names.push(short.to_string());
            }
        }
        Ok(names)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stage everything and commit; "nothing to commit" is `Ok(false)`.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }

    /// Conclude an in-progress merge with the prepared message.
    pub fn commit_no_edit(&self) -> Result<()> {
        self.run_checked(&["commit", "--no-edit"])?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote))]
    pub fn fetch(&self, remote: &str) -> Result<()> {
        validate_branch_name(remote)?;
        self.run_checked(&["fetch", "--quiet", remote])?;
        Ok(())
    }

    /// Rebase the current branch onto `upstream`. Returns false on conflict.
    #[instrument(skip_all, fields(upstream))]
    pub fn rebase(&self, upstream: &str) -> Result<bool> {
        validate_branch_name(upstream)?;
        let out = self.run(&["rebase", upstream])?;
        if !out.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&out.stderr).trim(), "rebase failed");
        }
        Ok(out.status.success())
    }

    pub fn rebase_abort(&self) -> Result<()> {
        self.run_checked(&["rebase", "--abort"])?;
        Ok(())
    }

    /// Merge `other` into the current branch. Returns false on conflict.
    #[instrument(skip_all, fields(other))]
    pub fn merge_no_edit(&self, other: &str) -> Result<bool> {
        validate_branch_name(other)?;
        let out = self.run(&["merge", "--no-edit", other])?;
        if !out.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&out.stderr).trim(), "merge failed");
        }
        Ok(out.status.success())
    }

    pub fn merge_abort(&self) -> Result<()> {
        self.run_checked(&["merge", "--abort"])?;
        Ok(())
    }

    /// Paths with unresolved conflicts.
    pub fn conflicted_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Push `branch` to `remote`, optionally with `--force-with-lease`.
    #[instrument(skip_all, fields(remote, branch, force_with_lease))]
    pub fn push(&self, remote: &str, branch: &str, force_with_lease: bool) -> Result<()> {
        validate_branch_name(remote)?;
        validate_branch_name(branch)?;
        let mut args = vec!["push", "--quiet"];
        if force_with_lease {
            args.push("--force-with-lease");
        }
        args.extend(["-u", remote, branch]);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Create `branch` from `start` and check it out at `path` as a new worktree.
    #[instrument(skip_all, fields(branch, start))]
    pub fn worktree_add_new_branch(&self, path: &Path, branch: &str, start: &str) -> Result<()> {
        validate_branch_name(branch)?;
        validate_branch_name(start)?;
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", "-b", branch, path, start])?;
        Ok(())
    }

    /// Check out an existing branch at `path`.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", path, branch])?;
        Ok(())
    }

    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "remove", "--force", path])?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    let text = path
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 path {}", path.display()))?;
    if text.starts_with('-') {
        return Err(anyhow!("path may not start with '-': {text}"));
    }
    Ok(text)
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
        } else if line == "bare" {
            entry.bare = true;
        }
    }
    entries.extend(current);
    entries
}
