//! Pipeline orchestrator: claims work items, runs them in bounded parallel
//! batches, then merges and finalizes them one at a time.
//!
//! Lifecycle of one batch:
//!
//! 1. Parallel phase: each worker claims an item (label -> in-progress),
//!    creates or reuses its workspace and runs the step executor.
//! 2. Sequential phase: merges, label transitions, workspace removal and
//!    report writing, in batch order.
//!
//! A worker panic still releases every item of the batch before the panic
//! is resumed on the caller's thread.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{error, info, instrument, warn};

use crate::classify::Classifier;
use crate::core::labels::Label;
use crate::core::types::{Role, WorkItem};
use crate::exit_codes;
use crate::io::agent::{AgentRequest, AgentRunner, ClaudeAgentRunner};
use crate::io::checkpoint::{CheckpointStore, PipelineState};
use crate::io::config::OrchestratorConfig;
use crate::io::git::Git;
use crate::io::prompt::PromptEngine;
use crate::io::registry::ProcessRegistry;
use crate::io::report::{ReportStore, RunReport};
use crate::io::tracker::{EligibleQuery, Tracker, ensure_labels, filter_by_author, move_label};
use crate::io::workspace::{Workspace, WorkspaceManager};
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::notify::Notifier;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::step::{ExecutorSettings, RunOutcome, RunRequest, RunStatus, StepExecutor};
use crate::verify::{CommandVerifier, Verify};

const WORKSPACE_PHASE: &str = "workspace";
const INTERNAL_PHASE: &str = "pipeline";
const REREVIEW_PHASE: &str = "re-review";
const DEFAULT_IMPLEMENTER: &str = "implementer";
/// Granularity of the shutdown check while sleeping between poll cycles.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Completed { pr_number: Option<u64> },
    AwaitingReview { pr_number: Option<u64> },
    Failed { phase: String },
    Interrupted,
    /// The label claim failed; nothing was touched.
    Unclaimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSummary {
    pub item_id: u64,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub items: Vec<ItemSummary>,
    pub rereviewed: usize,
    pub interrupted: bool,
}

impl CycleSummary {
    fn absorb(&mut self, other: CycleSummary) {
        self.items.extend(other.items);
        self.rereviewed += other.rereviewed;
        self.interrupted |= other.interrupted;
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|s| matches!(s.status, ItemStatus::Failed { .. }))
            .count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            exit_codes::INTERRUPTED
        } else if self.failed() > 0 {
            exit_codes::FAILED
        } else {
            exit_codes::OK
        }
    }
}

/// One unit of work for the parallel phase.
#[derive(Debug, Clone)]
struct Job {
    item: WorkItem,
    resume: Option<PipelineState>,
}

/// An item claimed by a worker and not yet handed back.
#[derive(Debug, Clone)]
struct InFlight {
    item: WorkItem,
    workspace: Option<Workspace>,
}

enum Worked {
    Unclaimed,
    /// Claimed, but no workspace could be prepared.
    NoWorkspace { report: RunReport },
    Ran { workspace: Workspace, outcome: RunOutcome },
}

struct Finished {
    item: WorkItem,
    worked: Worked,
}

type InFlightMap = Mutex<BTreeMap<u64, InFlight>>;
type PanicPayload = Box<dyn Any + Send + 'static>;

/// Shared state of one batch's worker pool.
struct BatchQueue<'j> {
    pending: Mutex<std::iter::Enumerate<std::slice::Iter<'j, Job>>>,
    finished: Mutex<Vec<(usize, Finished)>>,
    panicked: Mutex<Option<PanicPayload>>,
    inflight: InFlightMap,
}

/// What a [`run`] invocation processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Poll until shutdown, or for at most `max_cycles` cycles.
    Poll { max_cycles: Option<usize> },
    /// One item; resumes from its checkpoint when one exists.
    Item(u64),
    /// One item that must have a checkpoint.
    Resume(u64),
}

/// Wire the agent CLI, the verification command and interrupt handling
/// around an orchestrator, run `mode`, and return the process exit code.
#[instrument(skip_all, fields(mode = ?mode))]
pub fn run(tracker: &dyn Tracker, repo_root: &Path, config: &OrchestratorConfig, mode: Mode) -> Result<i32> {
    config.validate()?;
    let registry = Arc::new(ProcessRegistry::new());
    let signal = Arc::new(ShutdownSignal::new());
    let coordinator = ShutdownCoordinator::new(Arc::clone(&signal), Arc::clone(&registry), config.kill_grace());
    if let Err(err) = coordinator.install() {
        warn!(err = %format!("{err:#}"), "interrupt handling unavailable");
    }
    let agents = ClaudeAgentRunner {
        command: config.agent_command.clone(),
        agents_dir: config.resolve(repo_root, &config.agents_dir),
        timeout: config.agent_timeout(),
        retry_delays: config.retry_delays(),
        registry: Arc::clone(&registry),
    };
    let verifier = CommandVerifier::new(
        config.verify.command.clone(),
        Duration::from_secs(config.verify.timeout_secs),
        Arc::clone(&registry),
    );
    let orchestrator = Orchestrator::new(config, repo_root, tracker, &agents, &verifier, registry, &signal);
    run_with(&orchestrator, mode)
}

/// Run `mode` on an already wired orchestrator.
pub fn run_with(orchestrator: &Orchestrator<'_>, mode: Mode) -> Result<i32> {
    let summary = match mode {
        Mode::Poll { max_cycles } => orchestrator.poll(max_cycles)?,
        Mode::Item(id) => orchestrator.run_item(id)?,
        Mode::Resume(id) => orchestrator.resume(id)?,
    };
    let code = summary.exit_code();
    info!(
        items = summary.items.len(),
        failed = summary.failed(),
        rereviewed = summary.rereviewed,
        interrupted = summary.interrupted,
        code,
        "run finished"
    );
    Ok(code)
}

pub struct Orchestrator<'a> {
    config: &'a OrchestratorConfig,
    repo_root: PathBuf,
    tracker: &'a dyn Tracker,
    agents: &'a dyn AgentRunner,
    verifier: &'a dyn Verify,
    shutdown: &'a ShutdownSignal,
    workspaces: WorkspaceManager,
    checkpoints: CheckpointStore,
    reports: ReportStore,
    outputs_dir: PathBuf,
    prompts: PromptEngine,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a OrchestratorConfig,
        repo_root: impl Into<PathBuf>,
        tracker: &'a dyn Tracker,
        agents: &'a dyn AgentRunner,
        verifier: &'a dyn Verify,
        registry: Arc<ProcessRegistry>,
        shutdown: &'a ShutdownSignal,
    ) -> Self {
        let repo_root = repo_root.into();
        let workspaces = WorkspaceManager::new(
            &repo_root,
            config.resolve(&repo_root, &config.worktree_dir),
            &config.branch_prefix,
            &config.trunk,
            registry,
        )
        .with_setup_timeout(Duration::from_secs(config.setup_timeout_secs));
        Self {
            checkpoints: CheckpointStore::new(config.resolve(&repo_root, &config.state_dir)),
            reports: ReportStore::new(config.resolve(&repo_root, &config.reports_dir)),
            outputs_dir: config.resolve(&repo_root, &config.outputs_dir),
            config,
            repo_root,
            tracker,
            agents,
            verifier,
            shutdown,
            workspaces,
            prompts: PromptEngine::new(),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Create any missing pipeline labels on the tracker.
    pub fn prepare(&self) {
        if let Err(err) = ensure_labels(self.tracker, &self.config.labels) {
            warn!(err = %format!("{err:#}"), "failed to ensure tracker labels");
        }
    }

    /// Single-item mode; resumes from a checkpoint when one exists.
    #[instrument(skip_all, fields(item_id))]
    pub fn run_item(&self, item_id: u64) -> Result<CycleSummary> {
        let item = self.tracker.view(item_id)?;
        let resume = self.checkpoints.load(item_id);
        if resume.is_some() {
            info!("checkpoint found, resuming");
        }
        Ok(self.process_batch(vec![Job { item, resume }]))
    }

    #[instrument(skip_all, fields(item_id))]
    pub fn resume(&self, item_id: u64) -> Result<CycleSummary> {
        let state = self
            .checkpoints
            .load(item_id)
            .ok_or_else(|| anyhow!("no checkpoint for item #{item_id}"))?;
        let item = self.tracker.view(item_id)?;
        Ok(self.process_batch(vec![Job {
            item,
            resume: Some(state),
        }]))
    }

    /// Run cycles until shutdown, or until `max_cycles` have run.
    #[instrument(skip_all)]
    pub fn poll(&self, max_cycles: Option<usize>) -> Result<CycleSummary> {
        self.prepare();
        let mut total = CycleSummary::default();
        let mut cycles = 0;
        while !self.shutdown.is_shutting_down() {
            total.absorb(self.run_cycle()?);
            cycles += 1;
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            self.sleep_until_next_cycle();
        }
        total.interrupted |= self.shutdown.is_shutting_down();
        Ok(total)
    }

    /// Re-review, fetch, classify, then process each batch in order.
    #[instrument(skip_all)]
    pub fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary {
            rereviewed: self.rereview_pending(),
            ..CycleSummary::default()
        };
        if self.shutdown.is_shutting_down() {
            summary.interrupted = true;
            return Ok(summary);
        }

        let names = &self.config.labels;
        let query = EligibleQuery {
            label: &names.ready,
            exclude_labels: vec![&names.in_progress],
            allowed_authors: &self.config.allowed_authors,
        };
        let items = filter_by_author(self.tracker.fetch_eligible(&query)?, &self.config.allowed_authors);
        if items.is_empty() {
            info!("no eligible items");
            return Ok(summary);
        }
        info!(count = items.len(), "eligible items fetched");

        let classifier = Classifier {
            agents: self.agents,
            prompts: &self.prompts,
            workdir: &self.repo_root,
        };
        let (plan, cost) = classifier.plan(items);
        info!(batches = plan.batches.len(), cost_usd = cost, "items planned");

        for batch in plan.batches {
            if self.shutdown.is_shutting_down() {
                summary.interrupted = true;
                break;
            }
            let jobs = batch
                .into_iter()
                .map(|item| {
                    let resume = self.checkpoints.load(item.id);
                    Job { item, resume }
                })
                .collect();
            summary.absorb(self.process_batch(jobs));
        }
        Ok(summary)
    }

    /// Drain `jobs` with at most `max_parallel` workers, then finalize the
    /// results one at a time in batch order.
    #[instrument(skip_all, fields(items = jobs.len()))]
    fn process_batch(&self, jobs: Vec<Job>) -> CycleSummary {
        let queue = BatchQueue {
            pending: Mutex::new(jobs.iter().enumerate()),
            finished: Mutex::new(Vec::new()),
            panicked: Mutex::new(None),
            inflight: Mutex::new(BTreeMap::new()),
        };
        let workers = self.config.max_parallel.max(1).min(jobs.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.drain(&queue));
            }
        });

        let mut finished = std::mem::take(&mut *locked(&queue.finished));
        finished.sort_by_key(|(index, _)| *index);
        let finished: Vec<Finished> = finished.into_iter().map(|(_, done)| done).collect();
        if let Some(payload) = locked(&queue.panicked).take() {
            self.release_after_panic(finished, &queue.inflight);
            panic::resume_unwind(payload);
        }

        let shutting_down = self.shutdown.is_shutting_down();
        let mut summary = CycleSummary {
            interrupted: shutting_down,
            ..CycleSummary::default()
        };
        let mut interrupted_ids = Vec::new();
        for done in finished {
            let item_id = done.item.id;
            let status = self.finalize(done, shutting_down);
            if status == ItemStatus::Interrupted {
                interrupted_ids.push(item_id);
            }
            summary.items.push(ItemSummary { item_id, status });
        }
        if !interrupted_ids.is_empty() {
            let text = resume_instructions(&interrupted_ids, self.checkpoints.dir());
            info!(items = ?interrupted_ids, "items returned to queue");
            eprintln!("{text}");
        }
        summary
    }

    /// Worker loop: claim the next job until the queue is empty, shutdown is
    /// requested, or another worker panicked.
    fn drain(&self, queue: &BatchQueue<'_>) {
        loop {
            if self.shutdown.is_shutting_down() {
                info!("shutdown requested, not claiming further items");
                return;
            }
            if locked(&queue.panicked).is_some() {
                return;
            }
            let Some((index, job)) = locked(&queue.pending).next() else {
                return;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| self.run_job(job, &queue.inflight))) {
                Ok(done) => locked(&queue.finished).push((index, done)),
                Err(payload) => {
                    error!(item_id = job.item.id, "pipeline worker panicked");
                    locked(&queue.panicked).get_or_insert(payload);
                    return;
                }
            }
        }
    }

    /// Parallel-phase work for one item.
    #[instrument(skip_all, fields(item_id = job.item.id))]
    fn run_job(&self, job: &Job, inflight: &InFlightMap) -> Finished {
        let item = job.item.clone();
        let notifier = Notifier::new(self.tracker);
        if let Err(err) = move_label(self.tracker, &self.config.labels, item.id, self.claim_from(&item), Label::InProgress) {
            warn!(err = %format!("{err:#}"), "failed to claim item");
            return Finished {
                item,
                worked: Worked::Unclaimed,
            };
        }
        track(inflight, &item, None);

        let workspace = match self.workspace_for(job) {
            Ok(ws) => ws,
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(err = %detail, "workspace preparation failed");
                notifier.failure(item.id, WORKSPACE_PHASE, &detail);
                let mut report = RunReport::new(item.id, item.effective_complexity());
                report.finish_failed(WORKSPACE_PHASE, 0.0);
                untrack(inflight, item.id);
                return Finished {
                    item,
                    worked: Worked::NoWorkspace { report },
                };
            }
        };
        track(inflight, &item, Some(workspace.clone()));
        notifier.started(item.id, &workspace.branch, self.config.steps.len());

        let executor = StepExecutor {
            agents: self.agents,
            verifier: self.verifier,
            notifier: Some(notifier),
            prompts: &self.prompts,
            checkpoints: &self.checkpoints,
            outputs_dir: &self.outputs_dir,
            settings: ExecutorSettings {
                budget_usd: self.config.budget_usd,
                manual_review: self.config.manual_review,
                audit_mode: self.config.audit_mode,
                trunk: self.config.trunk.clone(),
            },
        };
        let resume = job.resume.as_ref();
        let cancel = || self.shutdown.is_shutting_down();
        let outcome = executor
            .run(&RunRequest {
                item: &item,
                workspace: &workspace,
                steps: &self.config.steps,
                resume,
                cancel: &cancel,
            })
            .unwrap_or_else(|err| {
                let diagnostic = format!("{err:#}");
                error!(err = %diagnostic, "step executor error");
                notifier.failure(item.id, INTERNAL_PHASE, &diagnostic);
                internal_failure(&item, diagnostic, resume)
            });
        untrack(inflight, item.id);
        Finished {
            item,
            worked: Worked::Ran { workspace, outcome },
        }
    }

    fn claim_from(&self, item: &WorkItem) -> Label {
        if item.has_label(&self.config.labels.failed) {
            Label::Failed
        } else {
            Label::Ready
        }
    }

    /// Reuse the checkpointed workspace, reattach its branch, or start fresh.
    fn workspace_for(&self, job: &Job) -> Result<Workspace> {
        let id = job.item.id;
        if let Some(state) = &job.resume {
            if let Some(ws) = self.workspaces.reuse(id, &state.workspace_path, &state.branch) {
                info!(path = %ws.path.display(), "reusing checkpointed workspace");
                return Ok(ws);
            }
            info!(branch = %state.branch, "recreating workspace from checkpointed branch");
            return Ok(self.workspaces.attach(id, &state.branch)?);
        }
        Ok(self
            .workspaces
            .create(id, self.config.setup_command.as_deref())?)
    }

    /// Sequential phase for one item. Returns its final status.
    #[instrument(skip_all, fields(item_id = done.item.id))]
    fn finalize(&self, done: Finished, shutting_down: bool) -> ItemStatus {
        let item = done.item;
        let (workspace, outcome) = match done.worked {
            Worked::Unclaimed => return ItemStatus::Unclaimed,
            Worked::NoWorkspace { report } => {
                self.set_label(item.id, Label::InProgress, Label::Failed);
                self.write_report(&report);
                return ItemStatus::Failed {
                    phase: WORKSPACE_PHASE.to_string(),
                };
            }
            Worked::Ran { workspace, outcome } => (workspace, outcome),
        };

        if shutting_down || outcome.status == RunStatus::Interrupted {
            return self.finalize_interrupted(&item, &workspace, outcome);
        }

        let mut report = outcome.report.clone();
        let status = match &outcome.status {
            RunStatus::Done => self.merge(&item, &workspace, &outcome, &mut report),
            RunStatus::Failed { phase, .. } => {
                commit_wip(&workspace, &format!("wip: #{} failed at {phase}", item.id));
                self.set_label(item.id, Label::InProgress, Label::Failed);
                ItemStatus::Failed { phase: phase.clone() }
            }
            RunStatus::Interrupted => ItemStatus::Interrupted,
        };
        self.remove_workspace(&workspace);
        self.write_report(&report);
        status
    }

    fn merge(&self, item: &WorkItem, workspace: &Workspace, outcome: &RunOutcome, report: &mut RunReport) -> ItemStatus {
        let upstream = self.config.upstream();
        let coordinator = MergeCoordinator::new(
            self.agents,
            self.verifier,
            self.tracker,
            &self.prompts,
            self.config.remote.as_deref(),
            &self.config.trunk,
            upstream,
        );
        let result = coordinator.integrate(item, workspace, &outcome.merge);
        report.total_cost_usd += result.cost_usd;
        let notifier = Notifier::new(self.tracker);
        if !result.is_failed() {
            self.delete_checkpoint(item.id);
        }
        match result.outcome {
            MergeOutcome::Merged { pr_number, .. } => {
                self.set_label(item.id, Label::InProgress, Label::Completed);
                notifier.post(item.id, &merged_comment(pr_number));
                ItemStatus::Completed { pr_number }
            }
            MergeOutcome::PullRequest { number } => {
                self.set_label(item.id, Label::InProgress, Label::AwaitingReview);
                notifier.post(item.id, &review_comment(number));
                ItemStatus::AwaitingReview { pr_number: number }
            }
            MergeOutcome::Failed { stage, detail } => {
                self.set_label(item.id, Label::InProgress, Label::Failed);
                notifier.failure(item.id, stage.as_str(), &detail);
                report.finish_failed(stage.as_str(), report.total_cost_usd);
                ItemStatus::Failed {
                    phase: stage.as_str().to_string(),
                }
            }
        }
    }

    /// Shutdown path: keep the work, return the item to the queue.
    fn finalize_interrupted(&self, item: &WorkItem, workspace: &Workspace, outcome: RunOutcome) -> ItemStatus {
        commit_wip(workspace, &format!("wip: #{} interrupted by shutdown", item.id));
        let mut report = outcome.report;
        match outcome.status {
            RunStatus::Failed { phase, .. } => {
                self.set_label(item.id, Label::InProgress, Label::Failed);
                self.remove_workspace(workspace);
                self.write_report(&report);
                return ItemStatus::Failed { phase };
            }
            RunStatus::Done => {
                // Not merged during shutdown; the checkpoint lets the next run
                // go straight to verification and merge.
                report.finish_interrupted(report.total_cost_usd);
            }
            RunStatus::Interrupted => {}
        }
        self.set_label(item.id, Label::InProgress, Label::Ready);
        Notifier::new(self.tracker).interrupted(item.id);
        self.write_report(&report);
        ItemStatus::Interrupted
    }

    /// Release every item of a batch whose worker panicked.
    fn release_after_panic(&self, finished: Vec<Finished>, inflight: &InFlightMap) {
        let mut pending: Vec<InFlight> = locked(inflight).values().cloned().collect();
        for done in finished {
            match done.worked {
                Worked::Unclaimed => {}
                Worked::NoWorkspace { .. } => pending.push(InFlight {
                    item: done.item,
                    workspace: None,
                }),
                Worked::Ran { workspace, .. } => pending.push(InFlight {
                    item: done.item,
                    workspace: Some(workspace),
                }),
            }
        }
        for entry in pending {
            warn!(item_id = entry.item.id, "releasing item after worker panic");
            if let Some(workspace) = &entry.workspace {
                commit_wip(workspace, &format!("wip: #{} aborted", entry.item.id));
                self.remove_workspace(workspace);
            }
            self.set_label(entry.item.id, Label::InProgress, Label::Ready);
        }
    }

    /// Address human feedback on items labeled for re-review.
    #[instrument(skip_all)]
    pub fn rereview_pending(&self) -> usize {
        let names = &self.config.labels;
        let query = EligibleQuery {
            label: &names.reready,
            exclude_labels: vec![&names.in_progress],
            allowed_authors: &self.config.allowed_authors,
        };
        let items = match self.tracker.fetch_eligible(&query) {
            Ok(items) => items,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to fetch re-review items");
                return 0;
            }
        };
        let mut handled = 0;
        for item in items {
            if self.shutdown.is_shutting_down() {
                break;
            }
            match self.rereview(item.id) {
                Ok(()) => handled += 1,
                Err(err) => {
                    let detail = format!("{err:#}");
                    warn!(item_id = item.id, err = %detail, "re-review failed");
                    Notifier::new(self.tracker).failure(item.id, REREVIEW_PHASE, &detail);
                }
            }
        }
        handled
    }

    #[instrument(skip_all, fields(item_id))]
    fn rereview(&self, item_id: u64) -> Result<()> {
        let item = self.tracker.view(item_id)?;
        let branch = self
            .workspaces
            .find_branch_for(item_id)?
            .ok_or_else(|| anyhow!("no pipeline branch found for item #{item_id}"))?;
        let workspace = self.workspaces.attach(item_id, &branch)?;
        let result = self.address_feedback(&item, &workspace);
        self.remove_workspace(&workspace);
        result?;
        self.set_label(item_id, Label::Reready, Label::AwaitingReview);
        Notifier::new(self.tracker).post(item_id, "Review feedback addressed and pushed; ready for another look.");
        Ok(())
    }

    fn address_feedback(&self, item: &WorkItem, workspace: &Workspace) -> Result<()> {
        let feedback = if item.comments.is_empty() {
            "(no comments were provided)".to_string()
        } else {
            item.comments.join("\n\n---\n\n")
        };
        let prompt = self.prompts.render_rereview(item, &workspace.branch, &feedback)?;
        let agent = self
            .config
            .steps
            .iter()
            .find(|step| step.kind() == Role::Implement)
            .map_or(DEFAULT_IMPLEMENTER, |step| step.agent.as_str());
        let result = self.agents.run_agent(&AgentRequest {
            agent,
            prompt: &prompt,
            workdir: &workspace.path,
            model: None,
        });
        if !result.success {
            return Err(anyhow!("implementer failed: {}", result.output.trim()));
        }
        let git = Git::new(&workspace.path);
        let committed = git.commit_all(&format!("fix: address review feedback on #{}", item.id))?;
        info!(committed, "feedback applied");
        if let Some(remote) = &self.config.remote {
            git.push(remote, &workspace.branch, true)?;
        }
        Ok(())
    }

    fn set_label(&self, item_id: u64, from: Label, to: Label) {
        if let Err(err) = move_label(self.tracker, &self.config.labels, item_id, from, to) {
            warn!(item_id, err = %format!("{err:#}"), "label update failed");
        }
    }

    fn remove_workspace(&self, workspace: &Workspace) {
        if let Err(err) = self.workspaces.remove(workspace) {
            warn!(path = %workspace.path.display(), err = %format!("{err:#}"), "failed to remove workspace");
        }
    }

    fn delete_checkpoint(&self, item_id: u64) {
        if let Err(err) = self.checkpoints.delete(item_id) {
            warn!(item_id, err = %format!("{err:#}"), "failed to delete checkpoint");
        }
    }

    fn write_report(&self, report: &RunReport) {
        match self.reports.write(report) {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to write run report"),
        }
    }

    fn sleep_until_next_cycle(&self) {
        let deadline = Instant::now() + self.config.poll_interval();
        while !self.shutdown.is_shutting_down() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn track(inflight: &InFlightMap, item: &WorkItem, workspace: Option<Workspace>) {
    locked(inflight).insert(
        item.id,
        InFlight {
            item: item.clone(),
            workspace,
        },
    );
}

fn untrack(inflight: &InFlightMap, item_id: u64) {
    locked(inflight).remove(&item_id);
}

fn commit_wip(workspace: &Workspace, message: &str) {
    match Git::new(&workspace.path).commit_all(message) {
        Ok(true) => info!(branch = %workspace.branch, "work in progress committed"),
        Ok(false) => {}
        Err(err) => warn!(err = %format!("{err:#}"), "failed to commit work in progress"),
    }
}

fn internal_failure(item: &WorkItem, diagnostic: String, resume: Option<&PipelineState>) -> RunOutcome {
    let mut report = RunReport::new(item.id, item.effective_complexity());
    report.finish_failed(INTERNAL_PHASE, 0.0);
    RunOutcome {
        status: RunStatus::Failed {
            phase: INTERNAL_PHASE.to_string(),
            diagnostic,
        },
        report,
        audit_blocked: resume.is_some_and(|state| state.audit_blocked),
        merge: crate::step::MergeDecision::ReviewOnly {
            reason: "pipeline error".to_string(),
        },
        completed_steps: resume.map(|state| state.completed_steps.clone()).unwrap_or_default(),
    }
}

fn merged_comment(pr_number: Option<u64>) -> String {
    match pr_number {
        Some(number) => format!("Merged via pull request #{number}."),
        None => "Merge agent finished.".to_string(),
    }
}

fn review_comment(pr_number: Option<u64>) -> String {
    match pr_number {
        Some(number) => format!("Pull request #{number} is open and waiting for human review."),
        None => "Branch pushed and waiting for human review.".to_string(),
    }
}

pub fn resume_instructions(item_ids: &[u64], state_dir: &Path) -> String {
    let ids: Vec<String> = item_ids.iter().map(|id| format!("#{id}")).collect();
    format!(
        "Interrupted: {} returned to the ready queue.\nCheckpoints are in {}; the next run skips completed steps.",
        ids.join(", "),
        state_dir.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_prefers_interrupted_over_failed() {
        let mut summary = CycleSummary::default();
        assert_eq!(summary.exit_code(), exit_codes::OK);
        summary.items.push(ItemSummary {
            item_id: 1,
            status: ItemStatus::Failed {
                phase: "implement".to_string(),
            },
        });
        assert_eq!(summary.exit_code(), exit_codes::FAILED);
        summary.interrupted = true;
        assert_eq!(summary.exit_code(), exit_codes::INTERRUPTED);
    }

    #[test]
    fn resume_instructions_list_items() {
        let text = resume_instructions(&[3, 7], Path::new(".conveyor/state"));
        assert!(text.contains("#3, #7"));
        assert!(text.contains(".conveyor/state"));
    }
}
