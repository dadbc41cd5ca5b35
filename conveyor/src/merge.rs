//! Integration of a finished branch with trunk, then publishing.
//!
//! Only one merge runs at a time. The branch is rebased onto the upstream
//! trunk, falling back to a merge commit; conflicts go to the resolver agent.
//! The integrated branch is verified and pushed, then either handed to the
//! merge agent or opened as a pull request for human review.

use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};

use anyhow::Result;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::sanitize::tail_chars;
use crate::core::types::WorkItem;
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::git::Git;
use crate::io::prompt::{PromptEngine, pr_title};
use crate::io::tracker::Tracker;
use crate::io::workspace::Workspace;
use crate::step::MergeDecision;
use crate::verify::{Verify, VerifyOutcome};

pub const RESOLVE_AGENT: &str = "resolver";

static PULL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/pulls?/(\d+)").expect("pull url regex should compile"));
static PULL_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:pr|pull request|merge request)\s*#(\d+)").expect("pull ref regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    Commit,
    Fetch,
    Integrate,
    Resolve,
    Verify,
    Push,
    Publish,
}

impl MergeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStage::Commit => "merge-commit",
            MergeStage::Fetch => "merge-fetch",
            MergeStage::Integrate => "merge-integrate",
            MergeStage::Resolve => "merge-resolve",
            MergeStage::Verify => "merge-verify",
            MergeStage::Push => "merge-push",
            MergeStage::Publish => "merge-publish",
        }
    }
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The merge agent finished; `pr_number` is parsed from its output.
    Merged { output: String, pr_number: Option<u64> },
    /// A pull request was opened for a human to merge.
    PullRequest { number: Option<u64> },
    Failed { stage: MergeStage, detail: String },
}

/// Outcome plus what the agent calls of this merge cost.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub outcome: MergeOutcome,
    pub cost_usd: f64,
}

impl MergeResult {
    fn failed(stage: MergeStage, detail: impl Into<String>, cost_usd: f64) -> Self {
        let detail = detail.into();
        warn!(%stage, detail = %tail_chars(&detail, 500), "merge failed");
        Self {
            outcome: MergeOutcome::Failed { stage, detail },
            cost_usd,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, MergeOutcome::Failed { .. })
    }
}

pub struct MergeCoordinator<'a> {
    pub agents: &'a dyn AgentRunner,
    pub verifier: &'a dyn Verify,
    pub tracker: &'a dyn Tracker,
    pub prompts: &'a PromptEngine,
    pub remote: Option<&'a str>,
    pub trunk: &'a str,
    /// Ref the branch is integrated with, e.g. `origin/main`.
    pub upstream: String,
    lock: Mutex<()>,
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(
        agents: &'a dyn AgentRunner,
        verifier: &'a dyn Verify,
        tracker: &'a dyn Tracker,
        prompts: &'a PromptEngine,
        remote: Option<&'a str>,
        trunk: &'a str,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            agents,
            verifier,
            tracker,
            prompts,
            remote,
            trunk,
            upstream: upstream.into(),
            lock: Mutex::new(()),
        }
    }

    #[instrument(skip_all, fields(item_id = item.id, branch = %workspace.branch))]
    pub fn integrate(&self, item: &WorkItem, workspace: &Workspace, decision: &MergeDecision) -> MergeResult {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let git = Git::new(&workspace.path);
        let mut cost = 0.0;

        if let Err(err) = git.commit_all(&format!("chore: finalize #{} pipeline output", item.id)) {
            return MergeResult::failed(MergeStage::Commit, format!("{err:#}"), cost);
        }
        if let Some(remote) = self.remote
            && let Err(err) = git.fetch(remote)
        {
            return MergeResult::failed(MergeStage::Fetch, format!("{err:#}"), cost);
        }

        match self.bring_up_to_date(&git, item, workspace, &mut cost) {
            Ok(None) => {}
            Ok(Some(failure)) => return failure,
            Err(err) => return MergeResult::failed(MergeStage::Integrate, format!("{err:#}"), cost),
        }

        match self.verifier.verify(&workspace.path) {
            Ok(VerifyOutcome::Failed { output }) => return MergeResult::failed(MergeStage::Verify, output, cost),
            Ok(VerifyOutcome::Passed | VerifyOutcome::Skipped) => {}
            Err(err) => return MergeResult::failed(MergeStage::Verify, format!("{err:#}"), cost),
        }

        if let Some(remote) = self.remote
            && let Err(err) = git.push(remote, &workspace.branch, true)
        {
            return MergeResult::failed(MergeStage::Push, format!("{err:#}"), cost);
        }

        match decision {
            MergeDecision::Auto { agent, model, .. } => {
                self.run_merge_agent(item, workspace, agent, model.as_deref(), cost)
            }
            MergeDecision::ReviewOnly { reason } => self.open_pull_request(item, workspace, reason, cost),
        }
    }

    /// Rebase onto upstream, or merge it in when the rebase conflicts.
    fn bring_up_to_date(
        &self,
        git: &Git,
        item: &WorkItem,
        workspace: &Workspace,
        cost: &mut f64,
    ) -> Result<Option<MergeResult>> {
        if git.rebase(&self.upstream)? {
            info!(upstream = %self.upstream, "rebased onto upstream");
            return Ok(None);
        }
        if let Err(err) = git.rebase_abort() {
            warn!(err = %format!("{err:#}"), "rebase abort failed");
        }
        if git.merge_no_edit(&self.upstream)? {
            info!(upstream = %self.upstream, "merged upstream after rebase conflict");
            return Ok(None);
        }

        let files = git.conflicted_files()?;
        info!(files = files.len(), "resolving merge conflicts");
        let prompt = self
            .prompts
            .render_resolve(item, &workspace.branch, &self.upstream, &files)?;
        let result = self.agents.run_agent(&AgentRequest {
            agent: RESOLVE_AGENT,
            prompt: &prompt,
            workdir: &workspace.path,
            model: None,
        });
        *cost += result.cost_usd;
        if !result.success {
            abort_merge(git);
            return Ok(Some(MergeResult::failed(MergeStage::Resolve, result.output, *cost)));
        }

        git.add_paths(&files)?;
        let remaining = git.conflicted_files()?;
        if !remaining.is_empty() {
            abort_merge(git);
            let detail = format!("conflicts remain in: {}", remaining.join(", "));
            return Ok(Some(MergeResult::failed(MergeStage::Resolve, detail, *cost)));
        }
        if let Err(err) = git.commit_no_edit() {
            abort_merge(git);
            return Ok(Some(MergeResult::failed(MergeStage::Resolve, format!("{err:#}"), *cost)));
        }
        info!("conflicts resolved");
        Ok(None)
    }

    fn run_merge_agent(
        &self,
        item: &WorkItem,
        workspace: &Workspace,
        agent: &str,
        model: Option<&str>,
        mut cost: f64,
    ) -> MergeResult {
        let prompt = match self
            .prompts
            .render_merge(item, &workspace.branch, self.trunk, self.remote)
        {
            Ok(prompt) => prompt,
            Err(err) => return MergeResult::failed(MergeStage::Publish, format!("{err:#}"), cost),
        };
        info!(agent, "running merge agent");
        let result = self.agents.run_agent(&AgentRequest {
            agent,
            prompt: &prompt,
            workdir: &workspace.path,
            model,
        });
        cost += result.cost_usd;
        if !result.success {
            return MergeResult::failed(MergeStage::Publish, result.output, cost);
        }
        let pr_number = extract_pr_number(&result.output);
        info!(?pr_number, "merge agent finished");
        MergeResult {
            outcome: MergeOutcome::Merged {
                output: result.output,
                pr_number,
            },
            cost_usd: cost,
        }
    }

    fn open_pull_request(&self, item: &WorkItem, workspace: &Workspace, reason: &str, cost: f64) -> MergeResult {
        let body = pr_body(item, reason);
        match self
            .tracker
            .create_pull_request(&workspace.branch, self.trunk, &pr_title(item), &body)
        {
            Ok(number) => {
                info!(?number, "pull request opened for review");
                MergeResult {
                    outcome: MergeOutcome::PullRequest { number },
                    cost_usd: cost,
                }
            }
            Err(err) => MergeResult::failed(MergeStage::Publish, format!("{err:#}"), cost),
        }
    }
}

fn abort_merge(git: &Git) {
    if let Err(err) = git.merge_abort() {
        warn!(err = %format!("{err:#}"), "merge abort failed");
    }
}

pub fn pr_body(item: &WorkItem, reason: &str) -> String {
    format!(
        "Automated changes for #{}.\n\nLeft for human review: {reason}.",
        item.id
    )
}

/// PR number from a pull request URL or an explicit "PR #n" mention.
pub fn extract_pr_number(output: &str) -> Option<u64> {
    PULL_URL_RE
        .captures(output)
        .or_else(|| PULL_REF_RE.captures(output))
        .and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use crate::core::types::AgentResult;
    use crate::io::registry::ProcessRegistry;
    use crate::io::workspace::WorkspaceManager;
    use crate::test_support::{MemoryTracker, ScriptedAgents, ScriptedVerifier, TestRepo};

    fn manager(repo: &TestRepo) -> WorkspaceManager {
        WorkspaceManager::new(
            repo.path(),
            repo.path().join(".conveyor/worktrees"),
            "auto/",
            "main",
            Arc::new(ProcessRegistry::new()),
        )
    }

    fn auto() -> MergeDecision {
        MergeDecision::Auto {
            agent: "merger".to_string(),
            model: None,
            index: 3,
        }
    }

    fn coordinator<'a>(
        agents: &'a ScriptedAgents,
        verifier: &'a ScriptedVerifier,
        tracker: &'a MemoryTracker,
        prompts: &'a PromptEngine,
    ) -> MergeCoordinator<'a> {
        MergeCoordinator::new(agents, verifier, tracker, prompts, Some("origin"), "main", "origin/main")
    }

    #[test]
    fn pr_number_from_url_or_mention() {
        assert_eq!(extract_pr_number("https://github.com/o/r/pull/123\n"), Some(123));
        assert_eq!(extract_pr_number("Opened PR #77 and merged it"), Some(77));
        assert_eq!(extract_pr_number("closes item #5"), None);
        assert_eq!(extract_pr_number("done"), None);
    }

    #[test]
    fn clean_branch_is_pushed_and_merged_by_agent() {
        let repo = TestRepo::new();
        let ws = manager(&repo).create(10, None).expect("create");
        fs::write(ws.path.join("feature.txt"), "feature\n").expect("write");
        let agents =
            ScriptedAgents::new().respond("merger", AgentResult::succeeded("https://x/pull/9").with_cost(0.05));
        let verifier = ScriptedVerifier::passing();
        let tracker = MemoryTracker::new();
        let prompts = PromptEngine::new();

        let result = coordinator(&agents, &verifier, &tracker, &prompts).integrate(
            &WorkItem::new(10, "Add feature"),
            &ws,
            &auto(),
        );

        assert_eq!(
            result.outcome,
            MergeOutcome::Merged {
                output: "https://x/pull/9".to_string(),
                pr_number: Some(9)
            }
        );
        assert_eq!(result.cost_usd, 0.05);
        let remote_head = repo.git(&["ls-remote", "origin", &ws.branch]);
        assert!(!remote_head.is_empty());
        assert_eq!(verifier.runs(), 1);
    }

    #[test]
    fn review_only_opens_pull_request() {
        let repo = TestRepo::new();
        let ws = manager(&repo).create(11, None).expect("create");
        fs::write(ws.path.join("a.txt"), "a\n").expect("write");
        let agents = ScriptedAgents::new();
        let verifier = ScriptedVerifier::passing();
        let tracker = MemoryTracker::new();
        let prompts = PromptEngine::new();
        let decision = MergeDecision::ReviewOnly {
            reason: "manual review mode".to_string(),
        };

        let result =
            coordinator(&agents, &verifier, &tracker, &prompts).integrate(&WorkItem::new(11, "t"), &ws, &decision);

        assert_eq!(result.outcome, MergeOutcome::PullRequest { number: Some(1) });
        assert_eq!(agents.calls_for("merger"), 0);
        let prs = tracker.pull_requests();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].head, ws.branch);
        assert!(prs[0].body.contains("manual review mode"));
    }

    #[test]
    fn conflicts_are_resolved_by_agent() {
        let repo = TestRepo::new();
        let ws = manager(&repo).create(12, None).expect("create");

        fs::write(repo.path().join("README.md"), "trunk version\n").expect("write");
        repo.git(&["commit", "-am", "trunk change"]);
        repo.git(&["push", "-q", "origin", "main"]);
        fs::write(ws.path.join("README.md"), "branch version\n").expect("write");

        let agents = ScriptedAgents::new().on_call(RESOLVE_AGENT, |dir| {
            fs::write(dir.join("README.md"), "resolved\n").expect("resolve");
        });
        let verifier = ScriptedVerifier::passing();
        let tracker = MemoryTracker::new();
        let prompts = PromptEngine::new();

        let result = coordinator(&agents, &verifier, &tracker, &prompts).integrate(
            &WorkItem::new(12, "t"),
            &ws,
            &auto(),
        );

        assert!(!result.is_failed(), "{result:?}");
        assert_eq!(agents.calls_for(RESOLVE_AGENT), 1);
        assert!(agents.prompts_for(RESOLVE_AGENT)[0].contains("- README.md"));
        assert_eq!(fs::read_to_string(ws.path.join("README.md")).expect("read"), "resolved\n");
    }

    #[test]
    fn unresolved_conflict_fails_and_aborts() {
        let repo = TestRepo::new();
        let ws = manager(&repo).create(13, None).expect("create");
        fs::write(repo.path().join("README.md"), "trunk\n").expect("write");
        repo.git(&["commit", "-am", "trunk change"]);
        repo.git(&["push", "-q", "origin", "main"]);
        fs::write(ws.path.join("README.md"), "branch\n").expect("write");

        let agents = ScriptedAgents::new().respond(RESOLVE_AGENT, AgentResult::failed("cannot resolve"));
        let verifier = ScriptedVerifier::passing();
        let tracker = MemoryTracker::new();
        let prompts = PromptEngine::new();

        let result = coordinator(&agents, &verifier, &tracker, &prompts).integrate(
            &WorkItem::new(13, "t"),
            &ws,
            &auto(),
        );

        assert!(matches!(
            result.outcome,
            MergeOutcome::Failed {
                stage: MergeStage::Resolve,
                ..
            }
        ));
        assert!(Git::new(&ws.path).conflicted_files().expect("status").is_empty());
        assert_eq!(agents.calls_for("merger"), 0);
    }

    #[test]
    fn failed_post_merge_verify_blocks_publish() {
        let repo = TestRepo::new();
        let ws = manager(&repo).create(14, None).expect("create");
        let agents = ScriptedAgents::new();
        let verifier = ScriptedVerifier::new(vec![VerifyOutcome::Failed {
            output: "tests failed".to_string(),
        }]);
        let tracker = MemoryTracker::new();
        let prompts = PromptEngine::new();

        let result = coordinator(&agents, &verifier, &tracker, &prompts).integrate(
            &WorkItem::new(14, "t"),
            &ws,
            &auto(),
        );

        assert_eq!(
            result.outcome,
            MergeOutcome::Failed {
                stage: MergeStage::Verify,
                detail: "tests failed".to_string()
            }
        );
        assert_eq!(agents.calls_for("merger"), 0);
        assert!(repo.git(&["ls-remote", "origin", &ws.branch]).is_empty());
    }
}
