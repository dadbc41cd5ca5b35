//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between the step executor, the merge
//! coordinator and the orchestrator. They carry no I/O and must serialize the
//! same way across runs.

use serde::{Deserialize, Serialize};

/// Reserved marker agents emit for a must-fix finding.
pub const RED_MARKER: &str = "\u{1F534}";
/// Reserved marker agents emit for a non-blocking warning.
pub const YELLOW_MARKER: &str = "\u{1F7E1}";
/// Reserved marker agents emit for a passing check.
pub const GREEN_MARKER: &str = "\u{1F7E2}";
/// Literal token that also counts as a blocking finding (case-sensitive).
pub const BLOCK_TOKEN: &str = "BLOCK";

/// How much of the pipeline a work item needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Full,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Full => "full",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "full" => Some(Complexity::Full),
            _ => None,
        }
    }
}

/// Snapshot of an externally tracked work item.
///
/// Owned by the tracker; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Pre-existing complexity tag, if the tracker carries one.
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub author: Option<String>,
    /// Human comments, used as feedback by the re-review flow.
    #[serde(default)]
    pub comments: Vec<String>,
}

impl WorkItem {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: String::new(),
            labels: Vec::new(),
            complexity: None,
            author: None,
            comments: Vec::new(),
        }
    }

    /// Complexity used for gating; untagged items run the full pipeline.
    pub fn effective_complexity(&self) -> Complexity {
        self.complexity.unwrap_or_default()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Condition that must hold for a step to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Run only if the most recent reviewing step reported a blocking finding.
    HasFindings,
    /// Run only if the immediately preceding step actually ran.
    HadFixes,
}

/// One entry of the ordered pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub agent: String,
    /// Unique within one pipeline; used as report key and failure phase.
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Complexity gate. Only `full` restricts anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl StepSpec {
    pub fn new(agent: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            role: role.into(),
            condition: None,
            complexity: None,
            model: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn full_only(mut self) -> Self {
        self.complexity = Some(Complexity::Full);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn kind(&self) -> Role {
        Role::from_name(&self.role)
    }
}

/// Behavioral category of a step, derived from its role name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Implement,
    Review,
    Fix,
    Audit,
    Test,
    Docs,
    Merge,
    /// Any role without dedicated handling.
    Other,
}

impl Role {
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "implement" | "implementation" | "implementer" => Role::Implement,
            "audit" | "security-audit" | "auditor" => Role::Audit,
            "test" | "tests" | "tester" | "test-writer" => Role::Test,
            "docs" | "documentation" | "documenter" => Role::Docs,
            "merge" | "merger" => Role::Merge,
            other if other.ends_with("review") || other == "reviewer" => Role::Review,
            other if other.starts_with("fix") => Role::Fix,
            _ => Role::Other,
        }
    }

    /// Steps whose findings gate `has_findings` conditions.
    pub fn is_reviewing(self) -> bool {
        matches!(self, Role::Review | Role::Audit)
    }

    /// Whether a failed agent call aborts the whole run.
    ///
    /// Audit failures block the merge instead; docs failures are advisory.
    pub fn aborts_on_failure(self) -> bool {
        !matches!(self, Role::Audit | Role::Docs)
    }
}

/// Well-known agent definitions, keyed by agent name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Implementer,
    Reviewer,
    Fixer,
    Auditor,
    Tester,
    Documenter,
    Merger,
    Resolver,
    Classifier,
    /// Unrecognized names get a read-only tool set.
    Unknown,
}

const EDIT_TOOLS: &str = "Read,Edit,Write,MultiEdit,Glob,Grep,Bash";
const REVIEW_TOOLS: &str = "Read,Glob,Grep,Bash";
const READ_ONLY_TOOLS: &str = "Read,Glob,Grep";

impl AgentKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "implementer" | "implement" => AgentKind::Implementer,
            "reviewer" | "code-reviewer" => AgentKind::Reviewer,
            "fixer" | "fix" => AgentKind::Fixer,
            "auditor" | "security-auditor" => AgentKind::Auditor,
            "tester" | "test-writer" => AgentKind::Tester,
            "documenter" | "docs-writer" => AgentKind::Documenter,
            "merger" | "merge" => AgentKind::Merger,
            "resolver" | "conflict-resolver" => AgentKind::Resolver,
            "classifier" | "triage" => AgentKind::Classifier,
            _ => AgentKind::Unknown,
        }
    }

    /// Comma-separated `--allowedTools` value.
    pub fn allowed_tools(self) -> &'static str {
        match self {
            AgentKind::Implementer
            | AgentKind::Fixer
            | AgentKind::Tester
            | AgentKind::Documenter
            | AgentKind::Resolver => EDIT_TOOLS,
            AgentKind::Reviewer | AgentKind::Auditor => REVIEW_TOOLS,
            AgentKind::Merger => "Bash,Read",
            AgentKind::Classifier | AgentKind::Unknown => READ_ONLY_TOOLS,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            AgentKind::Implementer | AgentKind::Auditor => "opus",
            AgentKind::Documenter | AgentKind::Merger | AgentKind::Classifier => "haiku",
            AgentKind::Reviewer
            | AgentKind::Fixer
            | AgentKind::Tester
            | AgentKind::Resolver
            | AgentKind::Unknown => "sonnet",
        }
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub edited_files: Vec<String>,
}

impl AgentResult {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    pub fn has_blocking_finding(&self) -> bool {
        self.output.contains(RED_MARKER) || self.output.contains(BLOCK_TOKEN)
    }

    pub fn has_warning(&self) -> bool {
        self.output.contains(YELLOW_MARKER)
    }

    /// An audit is clean only when the call succeeded and flagged nothing.
    pub fn is_clean_audit(&self) -> bool {
        self.success && !self.has_blocking_finding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_finding_from_marker_or_token() {
        assert!(AgentResult::succeeded(format!("{RED_MARKER} sql injection")).has_blocking_finding());
        assert!(AgentResult::succeeded("verdict: BLOCK").has_blocking_finding());
        assert!(!AgentResult::succeeded("verdict: block").has_blocking_finding());
        assert!(!AgentResult::succeeded(format!("{GREEN_MARKER} all good")).has_blocking_finding());
    }

    #[test]
    fn warning_from_yellow_marker() {
        let result = AgentResult::succeeded(format!("{YELLOW_MARKER} naming"));
        assert!(result.has_warning());
        assert!(!result.has_blocking_finding());
    }

    #[test]
    fn failed_audit_is_never_clean() {
        assert!(!AgentResult::failed("crashed").is_clean_audit());
        assert!(AgentResult::succeeded("nothing found").is_clean_audit());
    }

    #[test]
    fn role_names_map_to_kinds() {
        assert_eq!(Role::from_name("implement"), Role::Implement);
        assert_eq!(Role::from_name("review"), Role::Review);
        assert_eq!(Role::from_name("re-review"), Role::Review);
        assert_eq!(Role::from_name("fix"), Role::Fix);
        assert_eq!(Role::from_name("fix-review"), Role::Review);
        assert_eq!(Role::from_name("merge"), Role::Merge);
        assert_eq!(Role::from_name("lint"), Role::Other);
    }

    #[test]
    fn unknown_agents_fall_back_to_read_only_tools() {
        let kind = AgentKind::from_name("mystery");
        assert_eq!(kind, AgentKind::Unknown);
        assert_eq!(kind.allowed_tools(), "Read,Glob,Grep");
        assert!(AgentKind::Implementer.allowed_tools().contains("Edit"));
        assert!(!AgentKind::Reviewer.allowed_tools().contains("Edit"));
    }

    #[test]
    fn untagged_items_run_full_pipeline() {
        let item = WorkItem::new(1, "t");
        assert_eq!(item.effective_complexity(), Complexity::Full);
    }
}
