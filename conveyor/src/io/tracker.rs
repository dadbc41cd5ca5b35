//! Contract with the external work-item tracker.
//!
//! Backends (remote API, local files) live outside this crate; the pipeline
//! only needs the operations below.

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::labels::{Label, LabelNames};
use crate::core::types::WorkItem;

#[derive(Debug, Clone)]
pub struct EligibleQuery<'a> {
    pub label: &'a str,
    /// Items carrying any of these labels are never eligible.
    pub exclude_labels: Vec<&'a str>,
    /// Empty means any author.
    pub allowed_authors: &'a [String],
}

pub trait Tracker: Send + Sync {
    fn fetch_eligible(&self, query: &EligibleQuery<'_>) -> Result<Vec<WorkItem>>;

    fn view(&self, id: u64) -> Result<WorkItem>;

    fn add_label(&self, id: u64, label: &str) -> Result<()>;

    fn remove_label(&self, id: u64, label: &str) -> Result<()>;

    fn transition(&self, id: u64, from: &str, to: &str) -> Result<()> {
        self.remove_label(id, from)?;
        self.add_label(id, to)
    }

    fn comment(&self, id: u64, body: &str) -> Result<()>;

    /// Create the label if the tracker does not have it yet.
    fn ensure_label(&self, name: &str) -> Result<()>;

    /// Open a pull request and return its number, for backends that can.
    fn create_pull_request(&self, _head: &str, _base: &str, _title: &str, _body: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Validate a label move against the state machine, then apply it.
pub fn move_label(tracker: &dyn Tracker, names: &LabelNames, id: u64, from: Label, to: Label) -> Result<()> {
    Label::ensure_transition(from, to)?;
    debug!(id, ?from, ?to, "moving label");
    tracker
        .transition(id, names.name(from), names.name(to))
        .with_context(|| format!("move item #{id} from {from:?} to {to:?}"))
}

pub fn ensure_labels(tracker: &dyn Tracker, names: &LabelNames) -> Result<()> {
    for name in names.all() {
        tracker
            .ensure_label(name)
            .with_context(|| format!("ensure label {name}"))?;
    }
    Ok(())
}

/// Keep items whose author is allowlisted. An empty allowlist keeps all.
pub fn filter_by_author(items: Vec<WorkItem>, allowed: &[String]) -> Vec<WorkItem> {
    if allowed.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| {
            item.author
                .as_deref()
                .is_some_and(|author| allowed.iter().any(|a| a.eq_ignore_ascii_case(author)))
        })
        .collect()
}

/// Shared eligibility rule for in-memory or file-backed trackers.
pub fn is_eligible(item: &WorkItem, query: &EligibleQuery<'_>) -> bool {
    item.has_label(query.label) && !query.exclude_labels.iter().any(|l| item.has_label(l))
}
