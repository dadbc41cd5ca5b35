//! Work-item label state machine.
//!
//! ```text
//! ready -> in-progress -> { completed | failed | awaiting-review }
//! failed -> in-progress            (resume)
//! awaiting-review <-> reready      (human feedback loop)
//! in-progress -> ready             (interrupt)
//! ```

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Label {
    Ready,
    InProgress,
    Completed,
    Failed,
    AwaitingReview,
    Reready,
}

impl Label {
    pub const ALL: [Label; 6] = [
        Label::Ready,
        Label::InProgress,
        Label::Completed,
        Label::Failed,
        Label::AwaitingReview,
        Label::Reready,
    ];

    pub fn can_transition(from: Label, to: Label) -> bool {
        use Label::{AwaitingReview, Completed, Failed, InProgress, Ready, Reready};
        matches!(
            (from, to),
            (Ready, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, AwaitingReview)
                | (InProgress, Ready)
                | (Failed, InProgress)
                | (AwaitingReview, Reready)
                | (Reready, AwaitingReview)
        )
    }

    pub fn ensure_transition(from: Label, to: Label) -> Result<()> {
        if !Label::can_transition(from, to) {
            bail!("illegal label transition {from:?} -> {to:?}");
        }
        Ok(())
    }
}

/// Tracker-side names for each label state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelNames {
    pub ready: String,
    pub in_progress: String,
    pub completed: String,
    pub failed: String,
    pub awaiting_review: String,
    pub reready: String,
}

impl Default for LabelNames {
    fn default() -> Self {
        Self {
            ready: "pipeline:ready".to_string(),
            in_progress: "pipeline:in-progress".to_string(),
            completed: "pipeline:completed".to_string(),
            failed: "pipeline:failed".to_string(),
            awaiting_review: "pipeline:awaiting-review".to_string(),
            reready: "pipeline:reready".to_string(),
        }
    }
}

impl LabelNames {
    pub fn name(&self, label: Label) -> &str {
        match label {
            Label::Ready => &self.ready,
            Label::InProgress => &self.in_progress,
            Label::Completed => &self.completed,
            Label::Failed => &self.failed,
            Label::AwaitingReview => &self.awaiting_review,
            Label::Reready => &self.reready,
        }
    }

    pub fn all(&self) -> Vec<&str> {
        Label::ALL.iter().map(|label| self.name(*label)).collect()
    }
}
