//! Test/lint verification service.
//!
//! Shared by the step executor (final verify with one repair attempt) and the
//! merge coordinator (post-integration check).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::sanitize::tail_chars;
use crate::core::types::{AgentResult, WorkItem};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::process::{ProcessRequest, run_streaming, shell_argv};
use crate::io::prompt::PromptEngine;
use crate::io::registry::ProcessRegistry;

/// Agent asked to repair a failing verification.
pub const REPAIR_AGENT: &str = "fixer";

/// Failure output embedded in the repair prompt is capped to its tail.
const REPAIR_CONTEXT_CHARS: usize = 20_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No verification command configured.
    Skipped,
    Passed,
    Failed { output: String },
}

pub trait Verify: Sync {
    fn command(&self) -> Option<&str>;

    fn verify(&self, workdir: &Path) -> Result<VerifyOutcome>;
}

/// Runs the configured shell command through the process supervisor.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: Option<String>,
    timeout: Duration,
    registry: Arc<ProcessRegistry>,
}

impl CommandVerifier {
    pub fn new(command: Option<String>, timeout: Duration, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            timeout,
            registry,
        }
    }
}

impl Verify for CommandVerifier {
    fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn verify(&self, workdir: &Path) -> Result<VerifyOutcome> {
        let Some(command) = self.command.as_deref() else {
            return Ok(VerifyOutcome::Skipped);
        };
        info!(command, "running verification");
        let argv = shell_argv(command);
        let req = ProcessRequest::new(&argv, workdir, self.timeout);
        let out = run_streaming(&req, &self.registry, |line| debug!(line, "verify"))?;
        if out.success() {
            info!("verification passed");
            return Ok(VerifyOutcome::Passed);
        }
        warn!(state = ?out.state, "verification failed");
        Ok(VerifyOutcome::Failed {
            output: out.diagnostic(),
        })
    }
}

/// Result of [`verify_with_repair`], with the spend of any repair call.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub outcome: VerifyOutcome,
    pub repair: Option<AgentResult>,
}

/// Verify; on failure run one repair agent call and verify exactly once more.
#[instrument(skip_all, fields(item_id = item.id))]
pub fn verify_with_repair(
    verifier: &dyn Verify,
    agents: &dyn AgentRunner,
    prompts: &PromptEngine,
    item: &WorkItem,
    workdir: &Path,
    branch: &str,
) -> Result<RepairOutcome> {
    let first = verifier.verify(workdir)?;
    let VerifyOutcome::Failed { output } = first else {
        return Ok(RepairOutcome {
            outcome: first,
            repair: None,
        });
    };

    let command = verifier.command().unwrap_or_default();
    let prompt = prompts.render_repair(item, branch, command, &tail_chars(&output, REPAIR_CONTEXT_CHARS))?;
    info!("verification failed, invoking repair agent");
    let repair = agents.run_agent(&AgentRequest {
        agent: REPAIR_AGENT,
        prompt: &prompt,
        workdir,
        model: None,
    });
    if !repair.success {
        warn!("repair agent failed, re-running verification anyway");
    }
    let second = verifier.verify(workdir)?;
    Ok(RepairOutcome {
        outcome: second,
        repair: Some(repair),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedAgents, ScriptedVerifier};

    fn verifier(command: Option<&str>) -> CommandVerifier {
        CommandVerifier::new(
            command.map(str::to_string),
            Duration::from_secs(10),
            Arc::new(ProcessRegistry::new()),
        )
    }

    #[test]
    fn no_command_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(verifier(None).verify(temp.path()).expect("verify"), VerifyOutcome::Skipped);
        assert_eq!(verifier(Some("  ")).verify(temp.path()).expect("verify"), VerifyOutcome::Skipped);
    }

    #[test]
    fn command_exit_status_decides() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(verifier(Some("true")).verify(temp.path()).expect("verify"), VerifyOutcome::Passed);
        let failed = verifier(Some("echo '1 failed'; exit 1")).verify(temp.path()).expect("verify");
        assert!(matches!(failed, VerifyOutcome::Failed { output } if output.contains("1 failed")));
    }

    #[test]
    fn repair_runs_once_then_reverifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![
            VerifyOutcome::Failed {
                output: "assertion failed".to_string(),
            },
            VerifyOutcome::Passed,
        ]);
        let agents = ScriptedAgents::new().respond(REPAIR_AGENT, AgentResult::succeeded("fixed").with_cost(0.1));
        let item = WorkItem::new(1, "t");

        let outcome =
            verify_with_repair(&verifier, &agents, &PromptEngine::new(), &item, temp.path(), "b").expect("verify");

        assert_eq!(outcome.outcome, VerifyOutcome::Passed);
        assert_eq!(agents.calls_for(REPAIR_AGENT), 1);
        assert!(agents.prompts_for(REPAIR_AGENT)[0].contains("<untrusted-output>\nassertion failed"));
        assert_eq!(verifier.runs(), 2);
    }

    #[test]
    fn second_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failed = VerifyOutcome::Failed {
            output: "still broken".to_string(),
        };
        let verifier = ScriptedVerifier::new(vec![failed.clone(), failed.clone(), VerifyOutcome::Passed]);
        let agents = ScriptedAgents::new();
        let item = WorkItem::new(1, "t");

        let outcome =
            verify_with_repair(&verifier, &agents, &PromptEngine::new(), &item, temp.path(), "b").expect("verify");

        assert_eq!(outcome.outcome, failed);
        assert_eq!(verifier.runs(), 2);
    }
}
