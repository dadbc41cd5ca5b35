//! Batch planning and complexity tagging for a set of eligible items.
//!
//! The classifier agent proposes parallel batches. Its reply is untrusted:
//! unknown ids are dropped, duplicates ignored, and every input item ends up
//! in exactly one batch. Any failure degrades to one item per batch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::core::types::{Complexity, WorkItem};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::prompt::PromptEngine;

pub const CLASSIFY_AGENT: &str = "classifier";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Run one after another; items within a batch run concurrently.
    pub batches: Vec<Vec<WorkItem>>,
}

impl BatchPlan {
    /// One batch per item, in input order.
    pub fn sequential(items: Vec<WorkItem>) -> Self {
        Self {
            batches: items.into_iter().map(|item| vec![item]).collect(),
        }
    }

    pub fn item_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    batches: Vec<Vec<u64>>,
    #[serde(default)]
    complexity: BTreeMap<String, String>,
}

#[derive(Clone, Copy)]
pub struct Classifier<'a> {
    pub agents: &'a dyn AgentRunner,
    pub prompts: &'a PromptEngine,
    pub workdir: &'a Path,
}

impl Classifier<'_> {
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn plan(&self, items: Vec<WorkItem>) -> (BatchPlan, f64) {
        if items.len() <= 1 {
            return (BatchPlan::sequential(items), 0.0);
        }
        let prompt = match self.prompts.render_classify(&items) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "classify prompt failed to render");
                return (BatchPlan::sequential(items), 0.0);
            }
        };
        let result = self.agents.run_agent(&AgentRequest {
            agent: CLASSIFY_AGENT,
            prompt: &prompt,
            workdir: self.workdir,
            model: None,
        });
        if !result.success {
            warn!("classifier failed, running items one at a time");
            return (BatchPlan::sequential(items), result.cost_usd);
        }
        let plan = apply_plan(items, &result.output);
        info!(batches = plan.batches.len(), "batch plan ready");
        (plan, result.cost_usd)
    }
}

/// Build a plan from the classifier's reply, falling back to sequential.
pub fn apply_plan(items: Vec<WorkItem>, reply: &str) -> BatchPlan {
    let Some(raw) = parse_reply(reply) else {
        warn!("classifier reply was not a batch plan");
        return BatchPlan::sequential(items);
    };

    let mut pending: BTreeMap<u64, WorkItem> = items.iter().map(|item| (item.id, item.clone())).collect();
    for (id, tag) in &raw.complexity {
        let (Ok(id), Some(tag)) = (id.trim_start_matches('#').parse::<u64>(), Complexity::parse(tag)) else {
            continue;
        };
        if let Some(item) = pending.get_mut(&id)
            && item.complexity.is_none()
        {
            item.complexity = Some(tag);
        }
    }

    let mut seen = BTreeSet::new();
    let mut batches = Vec::new();
    for ids in raw.batches {
        let batch: Vec<WorkItem> = ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| pending.remove(&id))
            .collect();
        if !batch.is_empty() {
            batches.push(batch);
        }
    }

    // Items the classifier forgot keep their input order.
    for item in items {
        if let Some(left) = pending.remove(&item.id) {
            batches.push(vec![left]);
        }
    }
    BatchPlan { batches }
}

fn parse_reply(reply: &str) -> Option<RawPlan> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}
