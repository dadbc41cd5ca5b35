//! Step executor: runs one work item through the ordered step list.
//!
//! States are pending, running step `i`, final verify, then one of done,
//! failed or interrupted. Cancellation is consulted only between steps.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::budget::CostBudget;
use crate::core::sanitize::tail_chars;
use crate::core::skip::{SkipContext, SkipDecision, SkipReason, decide};
use crate::core::types::{AgentResult, Role, StepSpec, WorkItem};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::checkpoint::{CheckpointStore, PipelineState};
use crate::io::prompt::{PromptEngine, StepPrompt};
use crate::io::report::{RunReport, write_step_output};
use crate::io::workspace::Workspace;
use crate::notify::Notifier;
use crate::verify::{Verify, VerifyOutcome, verify_with_repair};

pub const BUDGET_PHASE: &str = "budget";
pub const FINAL_VERIFY_PHASE: &str = "final-verify";

/// Failure output kept in a skip reason for non-fatal roles.
const SKIP_DETAIL_CHARS: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct ExecutorSettings {
    pub budget_usd: Option<f64>,
    pub manual_review: bool,
    pub audit_mode: bool,
    pub trunk: String,
}

pub struct StepExecutor<'a> {
    pub agents: &'a dyn AgentRunner,
    pub verifier: &'a dyn Verify,
    pub notifier: Option<Notifier<'a>>,
    pub prompts: &'a PromptEngine,
    pub checkpoints: &'a CheckpointStore,
    pub outputs_dir: &'a Path,
    pub settings: ExecutorSettings,
}

pub struct RunRequest<'a> {
    pub item: &'a WorkItem,
    pub workspace: &'a Workspace,
    pub steps: &'a [StepSpec],
    /// Checkpoint of an earlier run: completed steps and the verdicts so far.
    pub resume: Option<&'a PipelineState>,
    pub cancel: &'a (dyn Fn() -> bool + Sync),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    Failed { phase: String, diagnostic: String },
    Interrupted,
}

/// How the merge coordinator should finish a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Run the merge agent of step `index`.
    Auto {
        agent: String,
        model: Option<String>,
        index: usize,
    },
    /// Only open a pull request and leave the item for a human.
    ReviewOnly { reason: String },
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub report: RunReport,
    pub audit_blocked: bool,
    pub merge: MergeDecision,
    pub completed_steps: Vec<usize>,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }
}

/// Mutable bookkeeping for one run. Verdicts that must survive a resume
/// live in the checkpoint.
struct RunState {
    budget: CostBudget,
    report: RunReport,
    checkpoint: PipelineState,
    previous_step_ran: bool,
    merge: Option<MergeDecision>,
}

impl StepExecutor<'_> {
    #[instrument(skip_all, fields(item_id = req.item.id, branch = %req.workspace.branch))]
    pub fn run(&self, req: &RunRequest<'_>) -> Result<RunOutcome> {
        let item = req.item;
        let checkpoint = match req.resume {
            Some(previous) => PipelineState {
                workspace_path: req.workspace.path.clone(),
                branch: req.workspace.branch.clone(),
                ..previous.clone()
            },
            None => PipelineState::new(item.id, &req.workspace.path, &req.workspace.branch),
        };
        let resumed = checkpoint.completed_steps.len();
        let mut st = RunState {
            budget: CostBudget::new(self.settings.budget_usd),
            report: RunReport::new(item.id, item.effective_complexity()),
            checkpoint,
            previous_step_ran: false,
            merge: None,
        };
        info!(steps = req.steps.len(), resumed, "pipeline starting");

        for (index, step) in req.steps.iter().enumerate() {
            if (req.cancel)() {
                return Ok(self.interrupted(st));
            }
            let ctx = SkipContext {
                resumed: req.resume.is_some_and(|previous| previous.is_completed(index)),
                complexity: item.effective_complexity(),
                manual_review: self.settings.manual_review,
                audit_mode: self.settings.audit_mode,
                audit_blocked: st.checkpoint.audit_blocked,
                last_review_blocking: st.checkpoint.last_review_blocking,
                previous_step_ran: st.previous_step_ran,
            };
            if let SkipDecision::Skip(reason) = decide(step, &ctx) {
                self.skip(&mut st, item.id, index, step, reason);
                continue;
            }

            let kind = step.kind();
            if kind == Role::Merge {
                info!(index, agent = %step.agent, "merge step handed to merge coordinator");
                st.report.record_deferred(index, &step.agent, &step.role);
                st.merge = Some(MergeDecision::Auto {
                    agent: step.agent.clone(),
                    model: step.model.clone(),
                    index,
                });
                st.previous_step_ran = false;
                continue;
            }

            let prompt = self.prompts.render_step(&StepPrompt {
                item,
                role: &step.role,
                branch: &req.workspace.branch,
                trunk: &self.settings.trunk,
                previous_output: st.checkpoint.last_output.as_deref(),
            })?;
            info!(index, role = %step.role, agent = %step.agent, "running step");
            let result = self.agents.run_agent(&AgentRequest {
                agent: &step.agent,
                prompt: &prompt,
                workdir: &req.workspace.path,
                model: step.model.as_deref(),
            });
            st.budget.charge(result.cost_usd);

            if !result.success {
                if (req.cancel)() {
                    warn!(index, "step failed during shutdown");
                    return Ok(self.interrupted(st));
                }
                if kind.aborts_on_failure() {
                    return Ok(self.failed(st, item.id, &step.role, result.output));
                }
                warn!(index, role = %step.role, "non-fatal step failed");
                if kind == Role::Audit {
                    st.checkpoint.audit_blocked = true;
                    st.checkpoint.last_review_blocking = Some(true);
                }
                let reason = format!(
                    "agent call failed: {}",
                    tail_chars(result.output.trim(), SKIP_DETAIL_CHARS)
                );
                st.report.record_skipped(index, &step.agent, &step.role, reason.clone());
                if let Some(notifier) = &self.notifier {
                    notifier.step_skipped(item.id, &step.role, &reason);
                }
                st.previous_step_ran = false;
                continue;
            }

            self.completed(&mut st, item.id, index, step, &result);
            if kind.is_reviewing() {
                st.checkpoint.last_review_blocking = Some(result.has_blocking_finding());
            }
            if kind == Role::Audit && !result.is_clean_audit() {
                info!(index, "audit reported blocking findings");
                st.checkpoint.audit_blocked = true;
            }
            st.checkpoint.last_output = Some(result.output.clone());

            if st.budget.exceeded() {
                let diagnostic = budget_diagnostic(&st.budget);
                return Ok(self.failed(st, item.id, BUDGET_PHASE, diagnostic));
            }
            self.checkpoints.save(&st.checkpoint)?;
            write_step_output(self.outputs_dir, item.id, index, &step.role, &result.output);
            st.previous_step_ran = true;
        }

        if (req.cancel)() {
            return Ok(self.interrupted(st));
        }
        let verified = verify_with_repair(
            self.verifier,
            self.agents,
            self.prompts,
            item,
            &req.workspace.path,
            &req.workspace.branch,
        )?;
        if let Some(repair) = &verified.repair {
            st.budget.charge(repair.cost_usd);
        }
        if let VerifyOutcome::Failed { output } = verified.outcome {
            return Ok(self.failed(st, item.id, FINAL_VERIFY_PHASE, output));
        }
        if st.budget.exceeded() {
            let diagnostic = budget_diagnostic(&st.budget);
            return Ok(self.failed(st, item.id, BUDGET_PHASE, diagnostic));
        }

        st.report.finish_success(st.budget.spent());
        // Kept until the merge outcome is known; the orchestrator deletes it.
        self.checkpoints.save(&st.checkpoint)?;
        if let Some(notifier) = &self.notifier {
            notifier.success(&st.report);
        }
        info!(cost_usd = st.budget.spent(), "pipeline succeeded");
        let merge = st.merge.unwrap_or_else(|| MergeDecision::ReviewOnly {
            reason: "pipeline has no merge step".to_string(),
        });
        Ok(RunOutcome {
            status: RunStatus::Done,
            report: st.report,
            audit_blocked: st.checkpoint.audit_blocked,
            merge,
            completed_steps: st.checkpoint.completed_steps,
        })
    }

    fn skip(&self, st: &mut RunState, item_id: u64, index: usize, step: &StepSpec, reason: SkipReason) {
        info!(index, role = %step.role, %reason, "skipping step");
        st.report.record_skipped(index, &step.agent, &step.role, reason.to_string());
        if step.kind() == Role::Merge {
            st.merge = Some(MergeDecision::ReviewOnly {
                reason: reason.to_string(),
            });
        }
        if reason == SkipReason::Resumed {
            st.previous_step_ran = true;
            return;
        }
        st.previous_step_ran = false;
        if let Some(notifier) = &self.notifier {
            notifier.step_skipped(item_id, &step.role, &reason.to_string());
        }
    }

    fn completed(&self, st: &mut RunState, item_id: u64, index: usize, step: &StepSpec, result: &AgentResult) {
        info!(
            index,
            role = %step.role,
            cost_usd = result.cost_usd,
            edited = result.edited_files.len(),
            "step completed"
        );
        st.report.record_completed(index, &step.agent, &step.role, result);
        st.checkpoint.mark_completed(index);
        if let Some(notifier) = &self.notifier {
            notifier.step_completed(item_id, &step.role, result.cost_usd, result.duration_ms);
        }
    }

    fn failed(&self, mut st: RunState, item_id: u64, phase: &str, diagnostic: String) -> RunOutcome {
        warn!(phase, "pipeline failed");
        st.report.finish_failed(phase, st.budget.spent());
        if let Err(err) = self.checkpoints.save(&st.checkpoint) {
            warn!(err = %format!("{err:#}"), "failed to save checkpoint on failure");
        }
        if let Some(notifier) = &self.notifier {
            notifier.failure(item_id, phase, &diagnostic);
        }
        RunOutcome {
            status: RunStatus::Failed {
                phase: phase.to_string(),
                diagnostic,
            },
            report: st.report,
            audit_blocked: st.checkpoint.audit_blocked,
            merge: MergeDecision::ReviewOnly {
                reason: format!("pipeline failed at {phase}"),
            },
            completed_steps: st.checkpoint.completed_steps,
        }
    }

    /// Stop without running anything else; the checkpoint stays on disk.
    fn interrupted(&self, mut st: RunState) -> RunOutcome {
        warn!("pipeline interrupted");
        st.report.finish_interrupted(st.budget.spent());
        if let Err(err) = self.checkpoints.save(&st.checkpoint) {
            warn!(err = %format!("{err:#}"), "failed to save checkpoint on interrupt");
        }
        RunOutcome {
            status: RunStatus::Interrupted,
            report: st.report,
            audit_blocked: st.checkpoint.audit_blocked,
            merge: MergeDecision::ReviewOnly {
                reason: "interrupted".to_string(),
            },
            completed_steps: st.checkpoint.completed_steps,
        }
    }
}

fn budget_diagnostic(budget: &CostBudget) -> String {
    format!(
        "spent ${:.4} which exceeds the budget of ${:.4}",
        budget.spent(),
        budget.limit().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::core::types::{Complexity, Condition, RED_MARKER};
    use crate::test_support::{ScriptedAgents, ScriptedVerifier};

    struct Harness {
        temp: tempfile::TempDir,
        checkpoints: CheckpointStore,
        prompts: PromptEngine,
        workspace: Workspace,
    }

    impl Harness {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let checkpoints = CheckpointStore::new(temp.path().join("state"));
            let workspace = Workspace {
                item_id: 10,
                path: temp.path().to_path_buf(),
                branch: "auto/issue-10-abc123".to_string(),
            };
            Self {
                temp,
                checkpoints,
                prompts: PromptEngine::new(),
                workspace,
            }
        }

        fn outputs(&self) -> PathBuf {
            self.temp.path().join("outputs")
        }

        fn run(
            &self,
            agents: &ScriptedAgents,
            verifier: &ScriptedVerifier,
            settings: ExecutorSettings,
            item: &WorkItem,
            steps: &[StepSpec],
            resume: Option<&PipelineState>,
            cancel: &(dyn Fn() -> bool + Sync),
        ) -> RunOutcome {
            let outputs = self.outputs();
            let executor = StepExecutor {
                agents,
                verifier,
                notifier: None,
                prompts: &self.prompts,
                checkpoints: &self.checkpoints,
                outputs_dir: &outputs,
                settings,
            };
            executor
                .run(&RunRequest {
                    item,
                    workspace: &self.workspace,
                    steps,
                    resume,
                    cancel,
                })
                .expect("run")
        }

        fn simple(&self, agents: &ScriptedAgents, steps: &[StepSpec]) -> RunOutcome {
            self.run(
                agents,
                &ScriptedVerifier::passing(),
                settings(),
                &WorkItem::new(10, "Add feature"),
                steps,
                None,
                &|| false,
            )
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            budget_usd: None,
            manual_review: false,
            audit_mode: true,
            trunk: "main".to_string(),
        }
    }

    fn review_fix_steps() -> Vec<StepSpec> {
        vec![
            StepSpec::new("implementer", "implement"),
            StepSpec::new("reviewer", "review"),
            StepSpec::new("fixer", "fix").when(Condition::HasFindings),
        ]
    }

    #[test]
    fn red_marker_review_triggers_fix_once() {
        let h = Harness::new();
        let agents = ScriptedAgents::new()
            .respond("implementer", AgentResult::succeeded("implemented"))
            .respond("reviewer", AgentResult::succeeded(format!("{RED_MARKER} missing validation")));

        let outcome = h.simple(&agents, &review_fix_steps());

        assert!(outcome.is_done());
        assert_eq!(agents.calls_for("fixer"), 1);
        assert!(agents.prompts_for("fixer")[0].contains("missing validation"));
        assert_eq!(outcome.completed_steps, vec![0, 1, 2]);
        let kept = h.checkpoints.load(10).expect("checkpoint kept until merge");
        assert_eq!(kept.completed_steps, vec![0, 1, 2]);
    }

    #[test]
    fn clean_review_never_invokes_fix() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("reviewer", AgentResult::succeeded("looks good"));

        let outcome = h.simple(&agents, &review_fix_steps());

        assert!(outcome.is_done());
        assert_eq!(agents.calls_for("fixer"), 0);
        assert!(!outcome.report.steps[2].ran());
    }

    #[test]
    fn implement_failure_aborts_at_role_phase() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("implementer", AgentResult::failed("syntax error"));

        let outcome = h.simple(&agents, &review_fix_steps());

        assert_eq!(
            outcome.status,
            RunStatus::Failed {
                phase: "implement".to_string(),
                diagnostic: "syntax error".to_string()
            }
        );
        assert_eq!(agents.calls_for("reviewer"), 0);
    }

    #[test]
    fn budget_overrun_fails_even_though_step_succeeded() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("implementer", AgentResult::succeeded("ok").with_cost(0.02));
        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            ExecutorSettings {
                budget_usd: Some(0.01),
                ..settings()
            },
            &WorkItem::new(10, "t"),
            &review_fix_steps(),
            None,
            &|| false,
        );
        assert!(matches!(outcome.status, RunStatus::Failed { ref phase, .. } if phase == BUDGET_PHASE));
        assert_eq!(agents.calls_for("reviewer"), 0);
    }

    #[test]
    fn small_spend_under_budget_succeeds() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("implementer", AgentResult::succeeded("ok").with_cost(0.01));
        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            ExecutorSettings {
                budget_usd: Some(10.0),
                ..settings()
            },
            &WorkItem::new(10, "t"),
            &review_fix_steps(),
            None,
            &|| false,
        );
        assert!(outcome.is_done());
        assert_eq!(outcome.report.total_cost_usd, 0.01);
    }

    #[test]
    fn resume_skips_completed_steps() {
        let h = Harness::new();
        let agents = ScriptedAgents::new();
        let steps = vec![
            StepSpec::new("implementer", "implement"),
            StepSpec::new("reviewer", "review"),
        ];
        let mut resume = PipelineState::new(10, &h.workspace.path, &h.workspace.branch);
        resume.mark_completed(0);
        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            settings(),
            &WorkItem::new(10, "t"),
            &steps,
            Some(&resume),
            &|| false,
        );
        assert!(outcome.is_done());
        assert_eq!(agents.calls_for("implementer"), 0);
        assert_eq!(agents.calls_for("reviewer"), 1);
    }

    #[test]
    fn had_fixes_follows_whether_previous_step_ran() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("reviewer", AgentResult::succeeded("clean"));
        let mut steps = review_fix_steps();
        steps.push(StepSpec::new("reviewer", "re-review").when(Condition::HadFixes));

        h.simple(&agents, &steps);

        assert_eq!(agents.calls_for("reviewer"), 1);
    }

    #[test]
    fn simple_items_skip_full_only_steps() {
        let h = Harness::new();
        let agents = ScriptedAgents::new();
        let steps = vec![
            StepSpec::new("implementer", "implement"),
            StepSpec::new("tester", "test").full_only(),
        ];
        let item = WorkItem {
            complexity: Some(Complexity::Simple),
            ..WorkItem::new(10, "typo")
        };
        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            settings(),
            &item,
            &steps,
            None,
            &|| false,
        );
        assert!(outcome.is_done());
        assert_eq!(agents.calls_for("tester"), 0);
    }

    #[test]
    fn failed_audit_blocks_merge() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("auditor", AgentResult::failed("auditor crashed"));
        let steps = vec![
            StepSpec::new("implementer", "implement"),
            StepSpec::new("auditor", "audit"),
            StepSpec::new("merger", "merge"),
        ];

        let outcome = h.simple(&agents, &steps);

        assert!(outcome.is_done());
        assert!(outcome.audit_blocked);
        assert!(matches!(outcome.merge, MergeDecision::ReviewOnly { .. }));
        assert_eq!(agents.calls_for("merger"), 0);
    }

    #[test]
    fn audit_block_token_blocks_merge_and_clean_audit_allows_it() {
        let steps = vec![
            StepSpec::new("implementer", "implement"),
            StepSpec::new("auditor", "audit"),
            StepSpec::new("merger", "merge"),
        ];

        let h = Harness::new();
        let blocked = ScriptedAgents::new().respond("auditor", AgentResult::succeeded("BLOCK: secrets in repo"));
        let outcome = h.simple(&blocked, &steps);
        assert!(outcome.audit_blocked);

        let h = Harness::new();
        let clean = ScriptedAgents::new().respond("auditor", AgentResult::succeeded("nothing found"));
        let outcome = h.simple(&clean, &steps);
        assert!(!outcome.audit_blocked);
        assert_eq!(
            outcome.merge,
            MergeDecision::Auto {
                agent: "merger".to_string(),
                model: None,
                index: 2
            }
        );
        assert_eq!(clean.calls_for("merger"), 0);
    }

    #[test]
    fn manual_review_skips_merge() {
        let h = Harness::new();
        let agents = ScriptedAgents::new();
        let steps = vec![StepSpec::new("implementer", "implement"), StepSpec::new("merger", "merge")];
        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            ExecutorSettings {
                manual_review: true,
                ..settings()
            },
            &WorkItem::new(10, "t"),
            &steps,
            None,
            &|| false,
        );
        assert_eq!(
            outcome.merge,
            MergeDecision::ReviewOnly {
                reason: SkipReason::ManualReview.to_string()
            }
        );
    }

    #[test]
    fn cancellation_interrupts_and_keeps_checkpoint() {
        let h = Harness::new();
        let agents = ScriptedAgents::new();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let cancel = || calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1;

        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            settings(),
            &WorkItem::new(10, "t"),
            &review_fix_steps(),
            None,
            &cancel,
        );

        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert_eq!(agents.calls_for("implementer"), 1);
        assert_eq!(agents.calls_for("reviewer"), 0);
        let saved = h.checkpoints.load(10).expect("checkpoint kept");
        assert_eq!(saved.completed_steps, vec![0]);
    }

    #[test]
    fn final_verify_failure_after_repair_is_fatal() {
        let h = Harness::new();
        let agents = ScriptedAgents::new();
        let failed = VerifyOutcome::Failed {
            output: "2 failed".to_string(),
        };
        let verifier = ScriptedVerifier::new(vec![failed.clone(), failed]);
        let outcome = h.run(
            &agents,
            &verifier,
            settings(),
            &WorkItem::new(10, "t"),
            &[StepSpec::new("implementer", "implement")],
            None,
            &|| false,
        );
        assert!(matches!(outcome.status, RunStatus::Failed { ref phase, .. } if phase == FINAL_VERIFY_PHASE));
        assert_eq!(agents.calls_for(crate::verify::REPAIR_AGENT), 1);
        assert!(h.checkpoints.load(10).is_some());
    }

    #[test]
    fn step_outputs_are_written_to_side_files() {
        let h = Harness::new();
        let agents = ScriptedAgents::new().respond("implementer", AgentResult::succeeded("diff summary"));
        h.simple(&agents, &[StepSpec::new("implementer", "implement")]);
        let path = h.outputs().join("issue-10-step-0-implement.md");
        assert_eq!(std::fs::read_to_string(path).expect("side file"), "diff summary");
    }

    #[test]
    fn resumed_run_keeps_audit_block_from_checkpoint() {
        let h = Harness::new();
        let steps = vec![
            StepSpec::new("implementer", "implement"),
            StepSpec::new("auditor", "audit"),
            StepSpec::new("merger", "merge"),
        ];
        let agents = ScriptedAgents::new().respond("auditor", AgentResult::succeeded("BLOCK: leaked secret"));
        let boundaries = std::sync::atomic::AtomicUsize::new(0);
        let cancel_before_merge = || boundaries.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 2;
        let first = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            settings(),
            &WorkItem::new(10, "t"),
            &steps,
            None,
            &cancel_before_merge,
        );
        assert_eq!(first.status, RunStatus::Interrupted);
        let saved = h.checkpoints.load(10).expect("checkpoint");
        assert!(saved.audit_blocked);

        let agents = ScriptedAgents::new();
        let resumed = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            settings(),
            &WorkItem::new(10, "t"),
            &steps,
            Some(&saved),
            &|| false,
        );

        assert!(resumed.is_done());
        assert_eq!(agents.calls_for("auditor"), 0);
        assert!(resumed.audit_blocked);
        assert!(matches!(resumed.merge, MergeDecision::ReviewOnly { .. }), "{:?}", resumed.merge);
    }

    #[test]
    fn resumed_run_fixes_findings_of_an_earlier_review() {
        let h = Harness::new();
        let mut saved = PipelineState::new(10, &h.workspace.path, &h.workspace.branch);
        saved.mark_completed(0);
        saved.mark_completed(1);
        saved.last_review_blocking = Some(true);
        saved.last_output = Some(format!("{RED_MARKER} token is logged"));
        let agents = ScriptedAgents::new();

        let outcome = h.run(
            &agents,
            &ScriptedVerifier::passing(),
            settings(),
            &WorkItem::new(10, "t"),
            &review_fix_steps(),
            Some(&saved),
            &|| false,
        );

        assert!(outcome.is_done());
        assert_eq!(agents.calls_for("reviewer"), 0);
        assert_eq!(agents.calls_for("fixer"), 1);
        assert!(agents.prompts_for("fixer")[0].contains("token is logged"));
        assert_eq!(outcome.completed_steps, vec![0, 1, 2]);
    }
}
