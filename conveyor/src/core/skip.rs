//! Per-step skip rules.
//!
//! Pure decision logic: given a step and what has happened so far in the
//! run, decide whether the step runs.

use std::fmt;

use crate::core::types::{Complexity, Condition, Role, StepSpec};

/// What the executor knows when it reaches a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipContext {
    pub resumed: bool,
    pub complexity: Complexity,
    pub manual_review: bool,
    pub audit_mode: bool,
    pub audit_blocked: bool,
    /// `Some(blocking)` once a reviewing step has produced a result.
    pub last_review_blocking: Option<bool>,
    pub previous_step_ran: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Resumed,
    ComplexityGate,
    ManualReview,
    AuditBlocked,
    NoFindings,
    NoFixes,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::Resumed => "already completed in a previous run",
            SkipReason::ComplexityGate => "only runs for full-complexity items",
            SkipReason::ManualReview => "manual review mode: merge left to a human",
            SkipReason::AuditBlocked => "audit reported blocking findings or failed",
            SkipReason::NoFindings => "previous review reported no blocking findings",
            SkipReason::NoFixes => "previous step did not run, nothing to re-check",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Run,
    Skip(SkipReason),
}

pub fn decide(step: &StepSpec, ctx: &SkipContext) -> SkipDecision {
    if ctx.resumed {
        return SkipDecision::Skip(SkipReason::Resumed);
    }
    if step.complexity == Some(Complexity::Full) && ctx.complexity == Complexity::Simple {
        return SkipDecision::Skip(SkipReason::ComplexityGate);
    }
    match step.kind() {
        Role::Merge if ctx.manual_review => return SkipDecision::Skip(SkipReason::ManualReview),
        Role::Merge if ctx.audit_mode && ctx.audit_blocked => {
            return SkipDecision::Skip(SkipReason::AuditBlocked);
        }
        _ => {}
    }
    match step.condition {
        Some(Condition::HasFindings) if ctx.last_review_blocking != Some(true) => {
            SkipDecision::Skip(SkipReason::NoFindings)
        }
        Some(Condition::HadFixes) if !ctx.previous_step_ran => {
            SkipDecision::Skip(SkipReason::NoFixes)
        }
        _ => SkipDecision::Run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SkipContext {
        SkipContext {
            resumed: false,
            complexity: Complexity::Full,
            manual_review: false,
            audit_mode: true,
            audit_blocked: false,
            last_review_blocking: None,
            previous_step_ran: true,
        }
    }

    #[test]
    fn resumed_steps_skip_first() {
        let step = StepSpec::new("implementer", "implement");
        let decision = decide(&step, &SkipContext { resumed: true, ..ctx() });
        assert_eq!(decision, SkipDecision::Skip(SkipReason::Resumed));
    }

    #[test]
    fn full_gate_skips_simple_items() {
        let step = StepSpec::new("tester", "test").full_only();
        let simple = SkipContext {
            complexity: Complexity::Simple,
            ..ctx()
        };
        assert_eq!(decide(&step, &simple), SkipDecision::Skip(SkipReason::ComplexityGate));
        assert_eq!(decide(&step, &ctx()), SkipDecision::Run);
    }

    #[test]
    fn has_findings_requires_blocking_review() {
        let step = StepSpec::new("fixer", "fix").when(Condition::HasFindings);
        assert_eq!(decide(&step, &ctx()), SkipDecision::Skip(SkipReason::NoFindings));
        let clean = SkipContext {
            last_review_blocking: Some(false),
            ..ctx()
        };
        assert_eq!(decide(&step, &clean), SkipDecision::Skip(SkipReason::NoFindings));
        let blocking = SkipContext {
            last_review_blocking: Some(true),
            ..ctx()
        };
        assert_eq!(decide(&step, &blocking), SkipDecision::Run);
    }

    #[test]
    fn had_fixes_requires_previous_step_to_run() {
        let step = StepSpec::new("reviewer", "re-review").when(Condition::HadFixes);
        let skipped = SkipContext {
            previous_step_ran: false,
            ..ctx()
        };
        assert_eq!(decide(&step, &skipped), SkipDecision::Skip(SkipReason::NoFixes));
        assert_eq!(decide(&step, &ctx()), SkipDecision::Run);
    }

    #[test]
    fn merge_skips_in_manual_mode_or_when_audit_blocked() {
        let step = StepSpec::new("merger", "merge");
        let manual = SkipContext {
            manual_review: true,
            ..ctx()
        };
        assert_eq!(decide(&step, &manual), SkipDecision::Skip(SkipReason::ManualReview));
        let blocked = SkipContext {
            audit_blocked: true,
            ..ctx()
        };
        assert_eq!(decide(&step, &blocked), SkipDecision::Skip(SkipReason::AuditBlocked));
        assert_eq!(decide(&step, &ctx()), SkipDecision::Run);
    }

    #[test]
    fn audit_mode_only_decides_whether_a_block_gates_the_merge() {
        let audit = StepSpec::new("auditor", "audit");
        let merge = StepSpec::new("merger", "merge");
        let off = SkipContext {
            audit_mode: false,
            audit_blocked: true,
            ..ctx()
        };
        assert_eq!(decide(&audit, &off), SkipDecision::Run);
        assert_eq!(decide(&merge, &off), SkipDecision::Run);
    }

    #[test]
    fn reasons_are_human_readable() {
        assert!(SkipReason::ManualReview.to_string().contains("manual review"));
    }
}
