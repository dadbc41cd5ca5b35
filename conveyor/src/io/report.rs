//! Run reports and the per-step output audit trail.
//!
//! Reports are product artifacts written to `.conveyor/reports/` whether or
//! not tracing is enabled.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{AgentResult, Complexity};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed {
        duration_ms: u64,
        cost_usd: f64,
        num_turns: u32,
        #[serde(default)]
        edited_files: Vec<String>,
    },
    Skipped {
        reason: String,
    },
    /// Handed to the merge coordinator, which runs after the pipeline.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub agent: String,
    pub role: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

impl StepRecord {
    pub fn ran(&self) -> bool {
        matches!(self.outcome, StepOutcome::Completed { .. })
    }
}

/// Everything that happened during one pipeline run for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub item_id: u64,
    pub complexity: Complexity,
    pub steps: Vec<StepRecord>,
    pub success: bool,
    #[serde(default)]
    pub failed_phase: Option<String>,
    #[serde(default)]
    pub interrupted: bool,
    pub total_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(item_id: u64, complexity: Complexity) -> Self {
        Self {
            item_id,
            complexity,
            steps: Vec::new(),
            success: false,
            failed_phase: None,
            interrupted: false,
            total_cost_usd: 0.0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_completed(&mut self, index: usize, agent: &str, role: &str, result: &AgentResult) {
        self.steps.push(StepRecord {
            index,
            agent: agent.to_string(),
            role: role.to_string(),
            outcome: StepOutcome::Completed {
                duration_ms: result.duration_ms,
                cost_usd: result.cost_usd,
                num_turns: result.num_turns,
                edited_files: result.edited_files.clone(),
            },
        });
    }

    pub fn record_skipped(&mut self, index: usize, agent: &str, role: &str, reason: impl Into<String>) {
        self.steps.push(StepRecord {
            index,
            agent: agent.to_string(),
            role: role.to_string(),
            outcome: StepOutcome::Skipped {
                reason: reason.into(),
            },
        });
    }

    pub fn record_deferred(&mut self, index: usize, agent: &str, role: &str) {
        self.steps.push(StepRecord {
            index,
            agent: agent.to_string(),
            role: role.to_string(),
            outcome: StepOutcome::Deferred,
        });
    }

    pub fn steps_run(&self) -> usize {
        self.steps.iter().filter(|s| s.ran()).count()
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(|s| match s.outcome {
                StepOutcome::Completed { duration_ms, .. } => duration_ms,
                StepOutcome::Skipped { .. } | StepOutcome::Deferred => 0,
            })
            .sum()
    }

    pub fn finish_success(&mut self, total_cost_usd: f64) {
        self.success = true;
        self.total_cost_usd = total_cost_usd;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_failed(&mut self, phase: &str, total_cost_usd: f64) {
        self.success = false;
        self.failed_phase = Some(phase.to_string());
        self.total_cost_usd = total_cost_usd;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_interrupted(&mut self, total_cost_usd: f64) {
        self.success = false;
        self.interrupted = true;
        self.total_cost_usd = total_cost_usd;
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn write(&self, report: &RunReport) -> Result<PathBuf> {
        let stamp = report.started_at.format("%Y%m%d_%H%M%S_%3f");
        let path = self
            .dir
            .join(format!("issue-{}-{stamp}.json", report.item_id));
        write_json_atomic(&path, report).with_context(|| format!("write report {}", path.display()))?;
        debug!(path = %path.display(), "run report written");
        Ok(path)
    }

    /// Every parseable report in the directory, oldest first. Unparseable
    /// files are skipped.
    pub fn load_all(&self) -> Result<Vec<RunReport>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.dir.display())),
        };
        let mut reports = Vec::new();
        for entry in entries {
            let path = entry.context("read report entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str::<RunReport>(&text).map_err(anyhow::Error::from));
            match parsed {
                Ok(report) => reports.push(report),
                Err(err) => warn!(path = %path.display(), err = %err, "skipping unreadable report"),
            }
        }
        reports.sort_by_key(|r| r.started_at);
        Ok(reports)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub runs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub failures_by_phase: BTreeMap<String, usize>,
    pub total_cost_usd: f64,
    pub mean_cost_usd: f64,
}

pub fn summarize(reports: &[RunReport]) -> ReportSummary {
    let mut summary = ReportSummary {
        runs: reports.len(),
        ..ReportSummary::default()
    };
    for report in reports {
        summary.total_cost_usd += report.total_cost_usd;
        if report.success {
            summary.succeeded += 1;
        } else if report.interrupted {
            summary.interrupted += 1;
        } else {
            summary.failed += 1;
            let phase = report.failed_phase.clone().unwrap_or_else(|| "unknown".to_string());
            *summary.failures_by_phase.entry(phase).or_default() += 1;
        }
    }
    if summary.runs > 0 {
        summary.mean_cost_usd = summary.total_cost_usd / summary.runs as f64;
    }
    summary
}

pub fn summarize_reports(dir: &Path) -> Result<ReportSummary> {
    Ok(summarize(&ReportStore::new(dir).load_all()?))
}

pub fn step_output_path(outputs_dir: &Path, item_id: u64, index: usize, role: &str) -> PathBuf {
    let role: String = role
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    outputs_dir.join(format!("issue-{item_id}-step-{index}-{role}.md"))
}

/// Best-effort audit copy of a step's output; never fails the caller.
pub fn write_step_output(outputs_dir: &Path, item_id: u64, index: usize, role: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let path = step_output_path(outputs_dir, item_id, index, role);
    let result = fs::create_dir_all(outputs_dir).and_then(|()| fs::write(&path, text));
    if let Err(err) = result {
        warn!(path = %path.display(), err = %err, "failed to write step output");
    }
}
