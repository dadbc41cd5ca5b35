//! Test-only fakes: scripted agents, scripted verification, an in-memory
//! tracker and throwaway git repositories.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{AgentResult, WorkItem};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::tracker::{EligibleQuery, Tracker, filter_by_author, is_eligible};
use crate::verify::{Verify, VerifyOutcome};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("test mutex poisoned")
}

/// One recorded agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub agent: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub model: Option<String>,
}

type Action = Box<dyn Fn(&Path) + Send + Sync>;

/// Agent runner returning queued results per agent name.
///
/// Unscripted calls succeed with `"{agent} done"`.
#[derive(Default)]
pub struct ScriptedAgents {
    responses: Mutex<BTreeMap<String, VecDeque<AgentResult>>>,
    actions: BTreeMap<String, Action>,
    panics: BTreeSet<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, agent: &str, result: AgentResult) -> Self {
        lock(&self.responses)
            .entry(agent.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Run `action` in the agent's working directory on every call.
    pub fn on_call(mut self, agent: &str, action: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.actions.insert(agent.to_string(), Box::new(action));
        self
    }

    pub fn panic_on(mut self, agent: &str) -> Self {
        self.panics.insert(agent.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, agent: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.agent == agent).count()
    }

    pub fn prompts_for(&self, agent: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.agent == agent)
            .map(|c| c.prompt.clone())
            .collect()
    }
}

impl AgentRunner for ScriptedAgents {
    fn run_agent(&self, request: &AgentRequest<'_>) -> AgentResult {
        lock(&self.calls).push(RecordedCall {
            agent: request.agent.to_string(),
            prompt: request.prompt.to_string(),
            workdir: request.workdir.to_path_buf(),
            model: request.model.map(str::to_string),
        });
        if self.panics.contains(request.agent) {
            panic!("scripted panic in agent {}", request.agent);
        }
        if let Some(action) = self.actions.get(request.agent) {
            action(request.workdir);
        }
        lock(&self.responses)
            .get_mut(request.agent)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| AgentResult::succeeded(format!("{} done", request.agent)))
    }
}

/// Verifier returning queued outcomes, then `Passed`.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    outcomes: Mutex<VecDeque<VerifyOutcome>>,
    runs: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new(outcomes: Vec<VerifyOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::new(Vec::new())
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Verify for ScriptedVerifier {
    fn command(&self) -> Option<&str> {
        Some("scripted-verify")
    }

    fn verify(&self, _workdir: &Path) -> Result<VerifyOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.outcomes).pop_front().unwrap_or(VerifyOutcome::Passed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    items: BTreeMap<u64, WorkItem>,
    comments: BTreeMap<u64, Vec<String>>,
    labels: BTreeSet<String>,
    pull_requests: Vec<PullRequest>,
}

/// In-memory tracker; labels live on the stored items.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    state: Mutex<TrackerState>,
    fail_comments: AtomicBool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(self, item: WorkItem) -> Self {
        self.insert(item);
        self
    }

    pub fn insert(&self, item: WorkItem) {
        lock(&self.state).items.insert(item.id, item);
    }

    pub fn fail_comments(&self, fail: bool) {
        self.fail_comments.store(fail, Ordering::SeqCst);
    }

    pub fn labels(&self, id: u64) -> Vec<String> {
        lock(&self.state)
            .items
            .get(&id)
            .map(|item| item.labels.clone())
            .unwrap_or_default()
    }

    pub fn comments(&self, id: u64) -> Vec<String> {
        lock(&self.state).comments.get(&id).cloned().unwrap_or_default()
    }

    pub fn created_labels(&self) -> Vec<String> {
        lock(&self.state).labels.iter().cloned().collect()
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        lock(&self.state).pull_requests.clone()
    }
}

impl Tracker for MemoryTracker {
    fn fetch_eligible(&self, query: &EligibleQuery<'_>) -> Result<Vec<WorkItem>> {
        let items: Vec<WorkItem> = lock(&self.state)
            .items
            .values()
            .filter(|item| is_eligible(item, query))
            .cloned()
            .collect();
        Ok(filter_by_author(items, query.allowed_authors))
    }

    fn view(&self, id: u64) -> Result<WorkItem> {
        lock(&self.state)
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("item #{id} not found"))
    }

    fn add_label(&self, id: u64, label: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let item = state.items.get_mut(&id).ok_or_else(|| anyhow!("item #{id} not found"))?;
        if !item.has_label(label) {
            item.labels.push(label.to_string());
        }
        Ok(())
    }

    fn remove_label(&self, id: u64, label: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let item = state.items.get_mut(&id).ok_or_else(|| anyhow!("item #{id} not found"))?;
        item.labels.retain(|l| l != label);
        Ok(())
    }

    fn comment(&self, id: u64, body: &str) -> Result<()> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(anyhow!("comment service unavailable"));
        }
        lock(&self.state).comments.entry(id).or_default().push(body.to_string());
        Ok(())
    }

    fn ensure_label(&self, name: &str) -> Result<()> {
        lock(&self.state).labels.insert(name.to_string());
        Ok(())
    }

    fn create_pull_request(&self, head: &str, base: &str, title: &str, body: &str) -> Result<Option<u64>> {
        let mut state = lock(&self.state);
        let number = state.pull_requests.len() as u64 + 1;
        state.pull_requests.push(PullRequest {
            number,
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(Some(number))
    }
}

/// Git repository on `main` with one commit, pushed to a bare `origin`.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("repo");
        let remote = dir.path().join("origin.git");
        fs::create_dir_all(&root).expect("repo dir");

        git(dir.path(), &["init", "-q", "--bare", "-b", "main", path_str(&remote)]);
        git(&root, &["init", "-q", "-b", "main"]);
        git(&root, &["config", "user.email", "pipeline@example.com"]);
        git(&root, &["config", "user.name", "Pipeline Test"]);
        git(&root, &["config", "commit.gpgsign", "false"]);
        fs::write(root.join("README.md"), "# test repo\n").expect("readme");
        git(&root, &["add", "README.md"]);
        git(&root, &["commit", "-q", "-m", "initial commit"]);
        git(&root, &["remote", "add", "origin", path_str(&remote)]);
        git(&root, &["push", "-q", "-u", "origin", "main"]);

        Self { _dir: dir, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Run git in the main checkout and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        git(&self.root, args)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Write an executable `sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}
