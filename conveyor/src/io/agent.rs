//! Agent process adapter.
//!
//! The [`AgentRunner`] trait decouples the step executor from the agent CLI.
//! Tests use scripted runners that return predetermined results without
//! spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentKind, AgentResult};
use crate::io::process::{ExitState, ProcessOutput, ProcessRequest, run_streaming};
use crate::io::registry::ProcessRegistry;
use crate::io::stream::StreamParser;

/// Substrings (matched case-insensitively) that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "etimedout",
    "econnrefused",
    "socket hang up",
    "connection reset",
    "network error",
    "overloaded_error",
    "502 bad gateway",
    "503 service unavailable",
];

#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    pub agent: &'a str,
    pub prompt: &'a str,
    pub workdir: &'a Path,
    /// Overrides the agent's default model.
    pub model: Option<&'a str>,
}

/// Abstraction over agent backends.
pub trait AgentRunner: Sync {
    fn run_agent(&self, request: &AgentRequest<'_>) -> AgentResult;
}

/// Whether a failure diagnostic looks like a network or capacity blip.
pub fn is_transient_failure(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Runs agents through the `claude` CLI in stream-json print mode.
#[derive(Debug, Clone)]
pub struct ClaudeAgentRunner {
    pub command: String,
    pub agents_dir: PathBuf,
    pub timeout: Duration,
    /// One entry per retry; its length is the retry budget.
    pub retry_delays: Vec<Duration>,
    pub registry: Arc<ProcessRegistry>,
}

impl ClaudeAgentRunner {
    pub fn new(agents_dir: impl Into<PathBuf>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            command: "claude".to_string(),
            agents_dir: agents_dir.into(),
            timeout: Duration::from_secs(30 * 60),
            retry_delays: vec![Duration::from_secs(5), Duration::from_secs(15)],
            registry,
        }
    }

    pub fn definition_path(&self, agent: &str) -> Option<PathBuf> {
        if agent.is_empty() || agent.contains('/') || agent.contains("..") {
            return None;
        }
        Some(self.agents_dir.join(format!("{agent}.md")))
    }

    fn build_argv(&self, agent: &str, definition: &str, request: &AgentRequest<'_>) -> Vec<String> {
        let kind = AgentKind::from_name(agent);
        let model = request.model.unwrap_or(kind.default_model());
        let prompt = format!("{}\n\n---\n\n{}", definition.trim_end(), request.prompt);
        vec![
            self.command.clone(),
            "-p".to_string(),
            prompt,
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            model.to_string(),
            "--allowedTools".to_string(),
            kind.allowed_tools().to_string(),
        ]
    }

    fn invoke_once(&self, argv: &[String], workdir: &Path) -> Attempt {
        let mut parser = StreamParser::new();
        let req = ProcessRequest::new(argv, workdir, self.timeout);
        let output = match run_streaming(&req, &self.registry, |line| {
            parser.parse_line(line);
        }) {
            Ok(output) => output,
            Err(err) => ProcessOutput {
                stdout: String::new(),
                stderr: format!("{err:#}"),
                state: ExitState::SpawnFailed,
            },
        };

        if parser.succeeded() {
            return Attempt::Done(result_from_parser(&parser));
        }

        let mut diagnostic = output.diagnostic();
        let text = parser.full_output();
        if !text.trim().is_empty() {
            diagnostic.push_str("\n\n");
            diagnostic.push_str(&text);
        }
        let retryable = output.state != ExitState::TimedOut
            && is_transient_failure(&format!("{}\n{}", output.stderr, output.stdout));
        let mut result = AgentResult::failed(diagnostic);
        if let Some(fin) = parser.final_result() {
            result.cost_usd = fin.cost_usd;
            result.duration_ms = fin.duration_ms;
            result.num_turns = fin.num_turns;
        }
        result.edited_files = parser.edited_files().to_vec();
        Attempt::Failed { result, retryable }
    }
}

enum Attempt {
    Done(AgentResult),
    Failed { result: AgentResult, retryable: bool },
}

fn result_from_parser(parser: &StreamParser) -> AgentResult {
    let full = parser.full_output();
    let fin = parser.final_result();
    let output = if full.trim().is_empty() {
        fin.and_then(|r| r.result.clone()).unwrap_or_default()
    } else {
        full
    };
    AgentResult {
        success: true,
        output,
        cost_usd: fin.map_or(0.0, |r| r.cost_usd),
        duration_ms: fin.map_or(0, |r| r.duration_ms),
        num_turns: fin.map_or(0, |r| r.num_turns),
        edited_files: parser.edited_files().to_vec(),
    }
}

impl AgentRunner for ClaudeAgentRunner {
    #[instrument(skip_all, fields(agent = request.agent, model = request.model))]
    fn run_agent(&self, request: &AgentRequest<'_>) -> AgentResult {
        let Some(path) = self.definition_path(request.agent) else {
            warn!("rejecting agent name");
            return AgentResult::failed(format!("invalid agent name '{}'", request.agent));
        };
        let definition = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "agent definition missing");
                return AgentResult::failed(format!(
                    "agent definition not found: {} ({err})",
                    path.display()
                ));
            }
        };

        let argv = self.build_argv(request.agent, &definition, request);
        let mut attempt = 0usize;
        loop {
            info!(attempt, workdir = %request.workdir.display(), "starting agent");
            match self.invoke_once(&argv, request.workdir) {
                Attempt::Done(result) => {
                    debug!(cost_usd = result.cost_usd, "agent succeeded");
                    return result;
                }
                Attempt::Failed { result, retryable } => {
                    let Some(delay) = self.retry_delays.get(attempt).filter(|_| retryable) else {
                        warn!(attempt, retryable, "agent failed");
                        return result;
                    };
                    warn!(attempt, delay_secs = delay.as_secs(), "transient agent failure, retrying");
                    thread::sleep(*delay);
                    attempt += 1;
                }
            }
        }
    }
}
