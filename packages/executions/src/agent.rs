// ABOUTME: Agent CLI invocation and interpretation of its stream-json output
// ABOUTME: Builds the in-sandbox command line and classifies each stdout line

use serde_json::Value;
use std::collections::BTreeSet;

/// Result subtype the agent reports when it stops at its own turn limit
pub const MAX_TURNS_SUBTYPE: &str = "error_max_turns";

/// Command line for one agent run
pub fn build_command(
    program: &str,
    prompt: &str,
    max_turns: u32,
    effective_tools: &BTreeSet<String>,
    disallowed_tools: &BTreeSet<String>,
) -> Vec<String> {
    let mut command = vec![
        program.to_string(),
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if max_turns > 0 {
        command.push("--max-turns".to_string());
        command.push(max_turns.to_string());
    }
    if !effective_tools.is_empty() {
        command.push("--allowedTools".to_string());
        command.push(join(effective_tools));
    }
    if !disallowed_tools.is_empty() {
        command.push("--disallowedTools".to_string());
        command.push(join(disallowed_tools));
    }
    command
}

fn join(tools: &BTreeSet<String>) -> String {
    tools.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// One stdout line, classified
#[derive(Debug, Clone, PartialEq)]
pub enum AgentLine {
    /// One assistant turn
    Assistant,
    Result {
        subtype: Option<String>,
        text: Option<String>,
        is_error: bool,
    },
    /// Other JSON events (system, user, tool results)
    Event,
    /// Not JSON
    Plain,
}

pub fn parse_line(line: &str) -> AgentLine {
    let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
        return AgentLine::Plain;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => AgentLine::Assistant,
        Some("result") => AgentLine::Result {
            subtype: value
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_string),
            text: value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        Some(_) => AgentLine::Event,
        None => AgentLine::Plain,
    }
}

/// Reassembles lines from arbitrarily split output chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Complete lines contained in `data` plus anything held back before it
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim_end_matches('\r');
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// The trailing partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}
