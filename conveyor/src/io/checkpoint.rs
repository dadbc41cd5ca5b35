//! Per-item pipeline checkpoints (`.conveyor/state/issue-<id>.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::io::atomic::write_json_atomic;

/// Which steps of an item's pipeline have completed, and where.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineState {
    pub item_id: u64,
    /// Indexes into the step list, in completion order.
    pub completed_steps: Vec<usize>,
    pub workspace_path: PathBuf,
    pub branch: String,
    /// Set once an audit blocked or failed; a resumed run keeps the merge gated.
    #[serde(default)]
    pub audit_blocked: bool,
    /// Verdict of the most recent review or audit step.
    #[serde(default)]
    pub last_review_blocking: Option<bool>,
    /// Output of the last completed step, fed to the next prompt.
    #[serde(default)]
    pub last_output: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(item_id: u64, workspace_path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            item_id,
            completed_steps: Vec::new(),
            workspace_path: workspace_path.into(),
            branch: branch.into(),
            audit_blocked: false,
            last_review_blocking: None,
            last_output: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.completed_steps.contains(&index)
    }

    pub fn mark_completed(&mut self, index: usize) {
        if !self.completed_steps.contains(&index) {
            self.completed_steps.push(index);
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, item_id: u64) -> PathBuf {
        self.dir.join(format!("issue-{item_id}.json"))
    }

    /// Missing or unreadable checkpoints are "no state", never an error.
    pub fn load(&self, item_id: u64) -> Option<PipelineState> {
        let path = self.path_for(item_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "failed to read checkpoint");
                return None;
            }
        };
        match serde_json::from_str::<PipelineState>(&contents) {
            Ok(state) => {
                debug!(item_id, completed = ?state.completed_steps, "checkpoint loaded");
                Some(state)
            }
            Err(err) => {
                warn!(path = %path.display(), err = %err, "ignoring corrupt checkpoint");
                None
            }
        }
    }

    pub fn save(&self, state: &PipelineState) -> Result<()> {
        let path = self.path_for(state.item_id);
        debug!(path = %path.display(), completed = ?state.completed_steps, "writing checkpoint");
        write_json_atomic(&path, state).with_context(|| format!("write checkpoint {}", path.display()))
    }

    pub fn delete(&self, item_id: u64) -> Result<()> {
        let path = self.path_for(item_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "checkpoint deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete checkpoint {}", path.display())),
        }
    }
}
