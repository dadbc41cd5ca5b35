//! Prompt rendering for every agent the pipeline invokes.
//!
//! All tracker-sourced or agent-produced text is wrapped with
//! [`wrap_untrusted`] before it reaches a template.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::sanitize::{ITEM_TAG, UNTRUSTED_TAG, wrap_untrusted};
use crate::core::types::{Role, WorkItem};

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const AUDIT_TEMPLATE: &str = include_str!("prompts/audit.md");
const TEST_TEMPLATE: &str = include_str!("prompts/test.md");
const DOCS_TEMPLATE: &str = include_str!("prompts/docs.md");
const GENERIC_TEMPLATE: &str = include_str!("prompts/generic.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const RESOLVE_TEMPLATE: &str = include_str!("prompts/resolve.md");
const MERGE_TEMPLATE: &str = include_str!("prompts/merge.md");
const CLASSIFY_TEMPLATE: &str = include_str!("prompts/classify.md");
const REREVIEW_TEMPLATE: &str = include_str!("prompts/rereview.md");

/// Template name for each role. Merge steps never render a step prompt.
fn template_for(role: Role) -> &'static str {
    match role {
        Role::Implement => "implement",
        Role::Review => "review",
        Role::Fix => "fix",
        Role::Audit => "audit",
        Role::Test => "test",
        Role::Docs => "docs",
        Role::Merge | Role::Other => "generic",
    }
}

#[derive(Debug, Clone, Serialize)]
struct ItemContext {
    id: u64,
    title: String,
}

impl ItemContext {
    fn from_item(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            title: item.title.clone(),
        }
    }
}

fn item_block(item: &WorkItem) -> String {
    let mut text = format!("Title: {}", item.title.trim());
    if !item.body.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(item.body.trim());
    }
    wrap_untrusted(ITEM_TAG, &text)
}

/// Inputs for a pipeline step prompt.
#[derive(Debug, Clone, Copy)]
pub struct StepPrompt<'a> {
    pub item: &'a WorkItem,
    pub role: &'a str,
    pub branch: &'a str,
    pub trunk: &'a str,
    /// Output of the step before this one, if it ran.
    pub previous_output: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl std::fmt::Debug for PromptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptEngine").finish_non_exhaustive()
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("implement", IMPLEMENT_TEMPLATE),
            ("review", REVIEW_TEMPLATE),
            ("fix", FIX_TEMPLATE),
            ("audit", AUDIT_TEMPLATE),
            ("test", TEST_TEMPLATE),
            ("docs", DOCS_TEMPLATE),
            ("generic", GENERIC_TEMPLATE),
            ("repair", REPAIR_TEMPLATE),
            ("resolve", RESOLVE_TEMPLATE),
            ("merge", MERGE_TEMPLATE),
            ("classify", CLASSIFY_TEMPLATE),
            ("rereview", REREVIEW_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled prompt templates should be valid");
        }
        Self { env }
    }

    pub fn render_step(&self, input: &StepPrompt<'_>) -> Result<String> {
        let role = Role::from_name(input.role);
        let previous = input
            .previous_output
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| wrap_untrusted(UNTRUSTED_TAG, s));
        let template = self.env.get_template(template_for(role))?;
        let rendered = template.render(context! {
            item => ItemContext::from_item(input.item),
            item_block => item_block(input.item),
            role => input.role,
            branch => input.branch,
            trunk => input.trunk,
            previous_output => previous,
        })?;
        Ok(rendered)
    }

    pub fn render_repair(&self, item: &WorkItem, branch: &str, command: &str, failure_output: &str) -> Result<String> {
        let template = self.env.get_template("repair")?;
        let rendered = template.render(context! {
            item => ItemContext::from_item(item),
            item_block => item_block(item),
            branch => branch,
            command => command,
            failure_output => wrap_untrusted(UNTRUSTED_TAG, failure_output),
        })?;
        Ok(rendered)
    }

    pub fn render_resolve(&self, item: &WorkItem, branch: &str, upstream: &str, files: &[String]) -> Result<String> {
        let template = self.env.get_template("resolve")?;
        let rendered = template.render(context! {
            item => ItemContext::from_item(item),
            branch => branch,
            upstream => upstream,
            files => files,
        })?;
        Ok(rendered)
    }

    pub fn render_merge(&self, item: &WorkItem, branch: &str, trunk: &str, remote: Option<&str>) -> Result<String> {
        let template = self.env.get_template("merge")?;
        let rendered = template.render(context! {
            item => ItemContext::from_item(item),
            item_block => item_block(item),
            title => pr_title(item),
            branch => branch,
            trunk => trunk,
            remote => remote,
        })?;
        Ok(rendered)
    }

    pub fn render_classify(&self, items: &[WorkItem]) -> Result<String> {
        let entries: Vec<String> = items
            .iter()
            .map(|item| format!("#{}\n{}", item.id, item_block(item)))
            .collect();
        let template = self.env.get_template("classify")?;
        Ok(template.render(context! { items => entries })?)
    }

    pub fn render_rereview(&self, item: &WorkItem, branch: &str, feedback: &str) -> Result<String> {
        let template = self.env.get_template("rereview")?;
        let rendered = template.render(context! {
            item => ItemContext::from_item(item),
            item_block => item_block(item),
            branch => branch,
            feedback => wrap_untrusted(UNTRUSTED_TAG, feedback),
        })?;
        Ok(rendered)
    }
}

/// Single-line PR title; tracker titles can carry newlines.
pub fn pr_title(item: &WorkItem) -> String {
    let title: String = item.title.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("#{}: {title}", item.id)
}
