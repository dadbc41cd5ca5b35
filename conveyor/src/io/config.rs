//! Orchestrator configuration stored under `.conveyor/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::branch::validate_branch_name;
use crate::core::labels::LabelNames;
use crate::core::types::{Condition, StepSpec};
use crate::io::atomic::write_atomic;

pub const CONFIG_PATH: &str = ".conveyor/config.toml";

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below. Relative paths
/// are resolved against the repository root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub trunk: String,
    /// Remote to fetch from and push to. `None` keeps everything local.
    pub remote: Option<String>,
    pub branch_prefix: String,

    pub worktree_dir: PathBuf,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub agents_dir: PathBuf,

    pub agent_command: String,
    pub agent_timeout_secs: u64,
    /// Backoff before each transient-failure retry; its length is the retry count.
    pub retry_delays_secs: Vec<u64>,
    /// Wait between SIGTERM and SIGKILL on forced shutdown.
    pub kill_grace_secs: u64,

    pub max_parallel: usize,
    pub poll_interval_secs: u64,
    pub budget_usd: Option<f64>,

    pub verify: VerifyConfig,
    /// Runs once inside each new workspace (e.g. dependency install).
    pub setup_command: Option<String>,
    pub setup_timeout_secs: u64,

    /// Never auto-merge; leave a PR for a human.
    pub manual_review: bool,
    /// When set, a blocked or failed audit keeps the merge step from running.
    pub audit_mode: bool,

    pub labels: LabelNames,
    /// Only items opened by these authors are eligible. Empty allows everyone.
    pub allowed_authors: Vec<String>,

    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Shell command for tests/lint, e.g. `cargo test`.
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 20 * 60,
        }
    }
}

pub fn default_steps() -> Vec<StepSpec> {
    vec![
        StepSpec::new("implementer", "implement"),
        StepSpec::new("reviewer", "review"),
        StepSpec::new("fixer", "fix").when(Condition::HasFindings),
        StepSpec::new("reviewer", "re-review").when(Condition::HadFixes),
        StepSpec::new("auditor", "audit").full_only(),
        StepSpec::new("merger", "merge"),
    ]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            trunk: "main".to_string(),
            remote: Some("origin".to_string()),
            branch_prefix: "auto/".to_string(),
            worktree_dir: PathBuf::from(".conveyor/worktrees"),
            state_dir: PathBuf::from(".conveyor/state"),
            reports_dir: PathBuf::from(".conveyor/reports"),
            outputs_dir: PathBuf::from(".conveyor/outputs"),
            agents_dir: PathBuf::from(".claude/agents"),
            agent_command: "claude".to_string(),
            agent_timeout_secs: 30 * 60,
            retry_delays_secs: vec![5, 15],
            kill_grace_secs: 2,
            max_parallel: 2,
            poll_interval_secs: 60,
            budget_usd: None,
            verify: VerifyConfig::default(),
            setup_command: None,
            setup_timeout_secs: 15 * 60,
            manual_review: false,
            audit_mode: true,
            labels: LabelNames::default(),
            allowed_authors: Vec::new(),
            steps: default_steps(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.setup_timeout_secs == 0 {
            return Err(anyhow!("setup_timeout_secs must be > 0"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.agent_command.trim().is_empty() {
            return Err(anyhow!("agent_command must be non-empty"));
        }
        if let Some(budget) = self.budget_usd
            && !(budget.is_finite() && budget >= 0.0)
        {
            return Err(anyhow!("budget_usd must be a non-negative number"));
        }
        validate_branch_name(&self.trunk).context("invalid trunk")?;
        if let Some(remote) = &self.remote {
            validate_branch_name(remote).context("invalid remote")?;
        }
        validate_branch_name(&format!("{}issue-1-abc123", self.branch_prefix))
            .context("invalid branch_prefix")?;

        if self.steps.is_empty() {
            return Err(anyhow!("steps must be non-empty"));
        }
        let mut roles = BTreeSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.agent.trim().is_empty() {
                return Err(anyhow!("steps[{index}].agent must be non-empty"));
            }
            if step.role.trim().is_empty() {
                return Err(anyhow!("steps[{index}].role must be non-empty"));
            }
            if !roles.insert(step.role.as_str()) {
                return Err(anyhow!("duplicate step role '{}'", step.role));
            }
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// `remote/trunk` when a remote is configured, else the local trunk.
    pub fn upstream(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{remote}/{}", self.trunk),
            None => self.trunk.clone(),
        }
    }

    pub fn resolve(&self, root: &Path, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            root.join(relative)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OrchestratorConfig {
            budget_usd: Some(2.5),
            setup_command: Some("npm ci".to_string()),
            ..OrchestratorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_parallel = 4\n\n[[steps]]\nagent = \"implementer\"\nrole = \"implement\"\n\n\
             [[steps]]\nagent = \"fixer\"\nrole = \"fix\"\ncondition = \"has_findings\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_parallel, 4);
        assert_eq!(cfg.trunk, "main");
        assert_eq!(cfg.steps.len(), 2);
        assert_eq!(cfg.steps[1].condition, Some(Condition::HasFindings));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let dup = OrchestratorConfig {
            steps: vec![StepSpec::new("a", "review"), StepSpec::new("b", "review")],
            ..OrchestratorConfig::default()
        };
        assert!(dup.validate().unwrap_err().to_string().contains("duplicate"));

        let zero = OrchestratorConfig {
            max_parallel: 0,
            ..OrchestratorConfig::default()
        };
        assert!(zero.validate().is_err());

        let evil = OrchestratorConfig {
            trunk: "--upload-pack=/tmp/evil".to_string(),
            ..OrchestratorConfig::default()
        };
        assert!(evil.validate().is_err());

        let prefix = OrchestratorConfig {
            branch_prefix: "auto;rm/".to_string(),
            ..OrchestratorConfig::default()
        };
        assert!(prefix.validate().is_err());
    }

    #[test]
    fn upstream_includes_remote() {
        let mut cfg = OrchestratorConfig::default();
        assert_eq!(cfg.upstream(), "origin/main");
        cfg.remote = None;
        assert_eq!(cfg.upstream(), "main");
    }
}
