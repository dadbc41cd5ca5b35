//! Parser for the agent CLI's newline-delimited JSON event stream.
//!
//! One parser per agent invocation. Lines that are not JSON, or JSON of an
//! unknown shape, yield no events and never abort the stream.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::sanitize::truncate_chars;
use crate::core::types::{GREEN_MARKER, RED_MARKER, YELLOW_MARKER};

const EXCERPT_CHARS: usize = 200;
const COMMAND_DETAIL_CHARS: usize = 100;

static TEST_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(cargo (test|nextest)|npm (run )?test|yarn test|pnpm test|pytest|go test|rspec|jest|vitest|mocha|rubocop|rake test|make test|just test|mix test|phpunit|dotnet test|gradle test|mvn test|bin/rails test)\b",
    )
    .expect("valid test command regex")
});

static STRONG_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: FAILED|\b[1-9]\d* (failures?|failed|errors?)\b")
        .expect("valid failure regex")
});

static PASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b0 failures\b|test result: ok|no offenses detected|all tests passed|\b\d+ passed\b")
        .expect("valid pass regex")
});

static WEAK_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)fail").expect("valid weak failure regex"));

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    SessionInit {
        model: Option<String>,
        session_id: Option<String>,
    },
    Text(TextChunk),
    ToolUse {
        name: String,
        detail: Option<String>,
    },
    TestResult {
        command: String,
        outcome: TestOutcome,
    },
    Final(FinalResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Display excerpt; the untruncated text goes to the full-output buffer.
    pub excerpt: String,
    pub has_findings: bool,
    pub has_red: bool,
    pub has_yellow: bool,
    pub has_green: bool,
}

impl TextChunk {
    fn scan(text: &str) -> Self {
        let has_red = text.contains(RED_MARKER);
        let has_yellow = text.contains(YELLOW_MARKER);
        Self {
            excerpt: truncate_chars(text, EXCERPT_CHARS),
            has_findings: has_red || has_yellow,
            has_red,
            has_yellow,
            has_green: text.contains(GREEN_MARKER),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Pass,
    Fail,
    Unknown,
}

/// Classify test-runner output.
///
/// Explicit failure counts win over pass phrases, so "3 passed, 1 failed" is
/// a failure.
pub fn classify_test_output(output: &str) -> TestOutcome {
    if STRONG_FAIL_RE.is_match(output) {
        return TestOutcome::Fail;
    }
    if PASS_RE.is_match(output) {
        return TestOutcome::Pass;
    }
    if WEAK_FAIL_RE.is_match(output) {
        return TestOutcome::Fail;
    }
    TestOutcome::Unknown
}

pub fn looks_like_test_command(command: &str) -> bool {
    TEST_COMMAND_RE.is_match(command)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult {
    pub success: bool,
    pub subtype: String,
    /// Terminal summary; often shorter than the accumulated text.
    pub result: Option<String>,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
}

#[derive(Debug, Default)]
pub struct StreamParser {
    chunks: Vec<String>,
    edited_files: Vec<String>,
    /// tool_use id -> shell command, for test-runner invocations only.
    pending_tests: HashMap<String, String>,
    final_result: Option<FinalResult>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            debug!(excerpt = %truncate_chars(line, 80), "skipping non-JSON stream line");
            return Vec::new();
        };
        match value.get("type").and_then(Value::as_str) {
            Some("system") => self.on_system(&value),
            Some("assistant") => self.on_assistant(&value),
            Some("user") => self.on_user(&value),
            Some("result") => self.on_result(&value),
            _ => Vec::new(),
        }
    }

    /// Text chunks joined by newlines.
    pub fn full_output(&self) -> String {
        self.chunks.join("\n")
    }

    pub fn edited_files(&self) -> &[String] {
        &self.edited_files
    }

    pub fn final_result(&self) -> Option<&FinalResult> {
        self.final_result.as_ref()
    }

    /// True once a final-result event reported success.
    pub fn succeeded(&self) -> bool {
        self.final_result.as_ref().is_some_and(|r| r.success)
    }

    fn on_system(&mut self, value: &Value) -> Vec<StreamEvent> {
        if value.get("subtype").and_then(Value::as_str) != Some("init") {
            return Vec::new();
        }
        let model = string_field(value, "model");
        let session_id = string_field(value, "session_id");
        debug!(?model, ?session_id, "agent session started");
        vec![StreamEvent::SessionInit { model, session_id }]
    }

    fn on_assistant(&mut self, value: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for block in content_blocks(value) {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let Some(text) = block.get("text").and_then(Value::as_str) else {
                        continue;
                    };
                    if text.trim().is_empty() {
                        continue;
                    }
                    let chunk = TextChunk::scan(text);
                    debug!(excerpt = %chunk.excerpt, has_red = chunk.has_red, "agent text");
                    self.chunks.push(text.to_string());
                    events.push(StreamEvent::Text(chunk));
                }
                Some("tool_use") => events.push(self.on_tool_use(block)),
                _ => {}
            }
        }
        events
    }

    fn on_tool_use(&mut self, block: &Value) -> StreamEvent {
        let name = string_field(block, "name").unwrap_or_else(|| "unknown".to_string());
        let input = block.get("input").unwrap_or(&Value::Null);
        let file = string_field(input, "file_path").or_else(|| string_field(input, "notebook_path"));
        let detail = match name.as_str() {
            "Bash" => string_field(input, "command").map(|c| truncate_chars(&c, COMMAND_DETAIL_CHARS)),
            "Glob" | "Grep" => string_field(input, "pattern"),
            _ => file.clone(),
        };

        match name.as_str() {
            "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => {
                if let Some(path) = file
                    && !self.edited_files.contains(&path)
                {
                    self.edited_files.push(path);
                }
                info!(tool = %name, detail = ?detail, "agent tool call");
            }
            "Read" | "Glob" | "Grep" => debug!(tool = %name, detail = ?detail, "agent tool call"),
            _ => info!(tool = %name, detail = ?detail, "agent tool call"),
        }

        if name == "Bash"
            && let Some(command) = string_field(input, "command")
            && looks_like_test_command(&command)
            && let Some(id) = string_field(block, "id")
        {
            self.pending_tests.insert(id, command);
        }

        StreamEvent::ToolUse { name, detail }
    }

    fn on_user(&mut self, value: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for block in content_blocks(value) {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(command) = self.pending_tests.remove(id) else {
                continue;
            };
            let output = tool_result_text(block);
            let outcome = classify_test_output(&output);
            info!(command = %truncate_chars(&command, COMMAND_DETAIL_CHARS), ?outcome, "test run observed");
            events.push(StreamEvent::TestResult { command, outcome });
        }
        events
    }

    fn on_result(&mut self, value: &Value) -> Vec<StreamEvent> {
        let subtype = string_field(value, "subtype").unwrap_or_default();
        let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let result = FinalResult {
            success: subtype == "success" && !is_error,
            result: string_field(value, "result"),
            cost_usd: value.get("total_cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
            num_turns: value
                .get("num_turns")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            subtype,
        };
        info!(
            success = result.success,
            subtype = %result.subtype,
            cost_usd = result.cost_usd,
            duration_ms = result.duration_ms,
            num_turns = result.num_turns,
            "agent finished"
        );
        self.final_result = Some(result.clone());
        vec![StreamEvent::Final(result)]
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_text(text: &str) -> String {
        json!({"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}}).to_string()
    }

    fn tool_use(id: &str, name: &str, input: Value) -> String {
        json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": id, "name": name, "input": input}
        ]}})
        .to_string()
    }

    fn tool_result(id: &str, content: &str) -> String {
        json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": id, "content": content}
        ]}})
        .to_string()
    }

    fn final_line(subtype: &str, cost: f64) -> String {
        json!({
            "type": "result", "subtype": subtype, "is_error": false,
            "result": "short summary", "total_cost_usd": cost,
            "duration_ms": 1500, "num_turns": 4
        })
        .to_string()
    }

    #[test]
    fn recovers_from_malformed_line_and_reads_final_result() {
        let mut parser = StreamParser::new();
        assert!(parser.parse_line("{not json").is_empty());
        assert!(parser.parse_line("plain text banner").is_empty());
        let events = parser.parse_line(&final_line("success", 0.25));

        assert!(matches!(events.as_slice(), [StreamEvent::Final(r)] if r.success));
        assert!(parser.succeeded());
        let result = parser.final_result().expect("final");
        assert_eq!(result.cost_usd, 0.25);
        assert_eq!(result.duration_ms, 1500);
        assert_eq!(result.num_turns, 4);
    }

    #[test]
    fn error_subtype_is_not_success() {
        let mut parser = StreamParser::new();
        parser.parse_line(&final_line("error_max_turns", 0.1));
        assert!(!parser.succeeded());
    }

    #[test]
    fn session_init_carries_model_and_session() {
        let mut parser = StreamParser::new();
        let line = json!({"type": "system", "subtype": "init", "model": "sonnet", "session_id": "abc"}).to_string();
        let events = parser.parse_line(&line);
        assert_eq!(
            events,
            vec![StreamEvent::SessionInit {
                model: Some("sonnet".to_string()),
                session_id: Some("abc".to_string())
            }]
        );
    }

    #[test]
    fn text_chunks_accumulate_full_output_and_flag_markers() {
        let mut parser = StreamParser::new();
        let long = "x".repeat(300);
        let events = parser.parse_line(&assistant_text(&long));
        let StreamEvent::Text(chunk) = &events[0] else {
            panic!("expected text event");
        };
        assert_eq!(chunk.excerpt.chars().count(), 200);
        assert!(chunk.excerpt.ends_with('\u{2026}'));
        assert!(!chunk.has_findings);

        let events = parser.parse_line(&assistant_text(&format!("{RED_MARKER} missing auth check")));
        let StreamEvent::Text(chunk) = &events[0] else {
            panic!("expected text event");
        };
        assert!(chunk.has_red && chunk.has_findings && !chunk.has_green);

        assert_eq!(parser.full_output(), format!("{long}\n{RED_MARKER} missing auth check"));
    }

    #[test]
    fn tool_use_records_edits_and_details() {
        let mut parser = StreamParser::new();
        parser.parse_line(&tool_use("t1", "Edit", json!({"file_path": "src/lib.rs"})));
        parser.parse_line(&tool_use("t2", "Write", json!({"file_path": "src/new.rs"})));
        parser.parse_line(&tool_use("t3", "Edit", json!({"file_path": "src/lib.rs"})));
        let events = parser.parse_line(&tool_use("t4", "Grep", json!({"pattern": "fn main"})));

        assert_eq!(parser.edited_files(), ["src/lib.rs", "src/new.rs"]);
        assert_eq!(
            events,
            vec![StreamEvent::ToolUse {
                name: "Grep".to_string(),
                detail: Some("fn main".to_string())
            }]
        );
    }

    #[test]
    fn bash_detail_is_truncated() {
        let mut parser = StreamParser::new();
        let command = format!("echo {}", "y".repeat(200));
        let events = parser.parse_line(&tool_use("b1", "Bash", json!({"command": command})));
        let StreamEvent::ToolUse { detail: Some(detail), .. } = &events[0] else {
            panic!("expected tool use");
        };
        assert_eq!(detail.chars().count(), 101);
    }

    #[test]
    fn test_results_only_for_correlated_test_commands() {
        let mut parser = StreamParser::new();
        parser.parse_line(&tool_use("b1", "Bash", json!({"command": "cargo test --all"})));
        parser.parse_line(&tool_use("b2", "Bash", json!({"command": "ls -la"})));

        assert!(parser.parse_line(&tool_result("b2", "total 0")).is_empty());
        assert!(parser.parse_line(&tool_result("zzz", "test result: ok")).is_empty());
        let events = parser.parse_line(&tool_result("b1", "test result: ok. 12 passed; 0 failed"));
        assert_eq!(
            events,
            vec![StreamEvent::TestResult {
                command: "cargo test --all".to_string(),
                outcome: TestOutcome::Pass
            }]
        );
    }

    #[test]
    fn classifies_common_framework_phrases() {
        assert_eq!(classify_test_output("42 examples, 0 failures"), TestOutcome::Pass);
        assert_eq!(classify_test_output("test result: ok. 3 passed"), TestOutcome::Pass);
        assert_eq!(classify_test_output("10 files inspected, no offenses detected"), TestOutcome::Pass);
        assert_eq!(classify_test_output("FAIL src/app.test.js"), TestOutcome::Fail);
        assert_eq!(classify_test_output("test result: FAILED. 1 passed; 2 failed"), TestOutcome::Fail);
        assert_eq!(classify_test_output("5 passed, 1 failed"), TestOutcome::Fail);
        assert_eq!(classify_test_output("compiling..."), TestOutcome::Unknown);
    }
}
