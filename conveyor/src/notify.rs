//! Progress comments on work items.
//!
//! Every tracker error is logged and swallowed: a failed comment never
//! affects the pipeline.

use tracing::warn;

use crate::core::sanitize::{neutralize_fences, tail_chars};
use crate::io::report::{RunReport, StepOutcome};
use crate::io::tracker::Tracker;

/// Diagnostic output in a failure comment is capped to its tail.
const DIAGNOSTIC_CHARS: usize = 3_000;

#[derive(Clone, Copy)]
pub struct Notifier<'a> {
    tracker: &'a dyn Tracker,
}

impl std::fmt::Debug for Notifier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl<'a> Notifier<'a> {
    pub fn new(tracker: &'a dyn Tracker) -> Self {
        Self { tracker }
    }

    pub fn post(&self, item_id: u64, body: &str) {
        if let Err(err) = self.tracker.comment(item_id, body) {
            warn!(item_id, err = %format!("{err:#}"), "failed to post comment");
        }
    }

    pub fn started(&self, item_id: u64, branch: &str, steps: usize) {
        self.post(
            item_id,
            &format!("Pipeline started on branch `{branch}` ({steps} steps)."),
        );
    }

    pub fn step_completed(&self, item_id: u64, role: &str, cost_usd: f64, duration_ms: u64) {
        self.post(
            item_id,
            &format!(
                "Step `{role}` completed in {} (${cost_usd:.2}).",
                format_duration(duration_ms)
            ),
        );
    }

    pub fn step_skipped(&self, item_id: u64, role: &str, reason: &str) {
        self.post(item_id, &format!("Step `{role}` skipped: {reason}."));
    }

    pub fn failure(&self, item_id: u64, phase: &str, diagnostic: &str) {
        self.post(item_id, &failure_comment(phase, diagnostic));
    }

    pub fn success(&self, report: &RunReport) {
        self.post(report.item_id, &success_comment(report));
    }

    pub fn interrupted(&self, item_id: u64) {
        self.post(
            item_id,
            "Pipeline interrupted by shutdown. Work in progress was committed and the item \
             was returned to the queue; completed steps will be skipped on resume.",
        );
    }
}

pub fn failure_comment(phase: &str, diagnostic: &str) -> String {
    let detail = neutralize_fences(&tail_chars(diagnostic.trim(), DIAGNOSTIC_CHARS));
    format!("Pipeline failed at phase `{phase}`.\n\n```\n{detail}\n```")
}

pub fn success_comment(report: &RunReport) -> String {
    let mut body = format!(
        "Pipeline finished: {} of {} steps ran, total cost ${:.2}, {}.\n",
        report.steps_run(),
        report.steps.len(),
        report.total_cost_usd,
        format_duration(report.total_duration_ms())
    );
    for step in &report.steps {
        let status = match step.outcome {
            StepOutcome::Completed { .. } => "ran",
            StepOutcome::Skipped { .. } => "skipped",
            StepOutcome::Deferred => "handed to merge",
        };
        body.push_str(&format!("\n- `{}` ({}): {status}", step.role, step.agent));
    }
    body
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
