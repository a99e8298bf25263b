//! Code-block extraction, terminating-marker detection, and execution
//! result formatting.

use regex::Regex;
use std::sync::LazyLock;

use crate::sandbox::{Sandbox, SandboxBackend};
use crate::types::{IterationRecord, Message, ReplValue};

/// Pre-compiled regex matching exactly the `repl`-tagged fence, non-greedy,
/// nested fences unsupported.
static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```repl\n([\s\S]*?)```").expect("invalid regex"));

static FINAL_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*FINAL_VAR\(([^)]*)\)[ \t]*$").expect("invalid regex"));

const RENDER_CLAMP: usize = 20_000;

/// Extract the ordered list of source strings found inside ```` ```repl ``` ````
/// fences, leading/trailing whitespace stripped.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    CODE_BLOCK_RE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// A terminating marker found in LM output, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// `FINAL_VAR(name)` — name is the REPL identifier to resolve.
    FinalVar(String),
    /// `FINAL(...)` — answer is the trimmed inner text.
    Final(String),
}

/// Scan for a terminating marker, `FINAL_VAR(` taking priority over `FINAL(`.
pub fn detect_marker(text: &str) -> Option<Marker> {
    if let Some(cap) = FINAL_VAR_RE.captures(text) {
        let raw = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        return Some(Marker::FinalVar(strip_quotes(raw.trim())));
    }
    extract_final_paren(text).map(Marker::Final)
}

fn strip_quotes(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2
        && ((t.starts_with('"') && t.ends_with('"')) || (t.starts_with('\'') && t.ends_with('\'')))
    {
        t[1..t.len() - 1].to_string()
    } else {
        t.to_string()
    }
}

/// Find a line starting with `FINAL(` at its start and ending with `)` at its
/// end, greedy so parentheses inside the answer are tolerated.
fn extract_final_paren(text: &str) -> Option<String> {
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("FINAL(") {
            if let Some(inner) = rest.strip_suffix(')') {
                return Some(inner.trim().to_string());
            }
        }
    }
    None
}

/// Resolve a detected [`Marker`] into the final answer text, dispatching to
/// the sandbox for `FINAL_VAR`. Returns `None` when a `FINAL_VAR` marker was
/// found but no sandbox is available — the marker is detected but discarded
/// rather than erroring.
pub async fn resolve_marker(
    marker: &Marker,
    sandbox: Option<&mut SandboxBackend>,
) -> Option<String> {
    match marker {
        Marker::Final(answer) => Some(answer.clone()),
        Marker::FinalVar(name) => {
            let sandbox = sandbox?;
            let program = format!("FINAL_VAR({:?})", name);
            let result = sandbox.execute_code(&program).await.ok()?;
            if !result.stdout.is_empty() {
                Some(result.stdout)
            } else if !result.stderr.is_empty() {
                Some(result.stderr)
            } else {
                None
            }
        }
    }
}

/// Format one iteration's executed code blocks back into chat-turn messages:
/// one assistant message with the verbatim response, then one user message
/// per code block carrying the fenced code and its rendered result.
pub fn format_iteration_messages(record: &IterationRecord) -> Vec<Message> {
    let mut messages = vec![Message::assistant(&record.response)];
    for block in &record.code_blocks {
        let rendered = render_result(&block.result);
        let content = format!("```repl\n{}\n```\n{}", block.code, clamp(&rendered));
        messages.push(Message::user(content));
    }
    messages
}

/// Render one execution result's stdout/stderr/locals-listing lines.
fn render_result(result: &crate::types::ReplResult) -> String {
    let mut lines = Vec::new();
    if !result.stdout.is_empty() {
        lines.push(result.stdout.trim_end_matches('\n').to_string());
    }
    if !result.stderr.is_empty() {
        lines.push(result.stderr.trim_end_matches('\n').to_string());
    }
    let mut names: Vec<&str> = result
        .locals
        .iter()
        .filter(|(name, value)| !name.starts_with('_') && value.is_listable())
        .map(|(name, _)| name.as_str())
        .collect();
    if !names.is_empty() {
        names.sort_unstable();
        lines.push(format!("Variables: {}", names.join(", ")));
    }

    if lines.is_empty() {
        "No output".to_string()
    } else {
        lines.join("\n")
    }
}

/// Clamp rendered text to [`RENDER_CLAMP`] characters, appending a suffix
/// reporting the number of elided characters.
fn clamp(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= RENDER_CLAMP {
        return text.to_string();
    }
    let elided = chars.len() - RENDER_CLAMP;
    let head: String = chars[..RENDER_CLAMP].iter().collect();
    format!("{head}... + [{elided} chars...]")
}

/// Non-reserved identifier names and their types, as returned by `SHOW_VARS()`.
pub fn show_vars(
    locals: &std::collections::HashMap<String, ReplValue>,
) -> std::collections::HashMap<String, String> {
    locals
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| (name.clone(), value.type_name().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn extracts_repl_blocks_in_order() {
        let text = "```repl\na = 1\n```\nnoise\n```repl\nb = 2\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["a = 1", "b = 2"]);
    }

    #[test]
    fn non_repl_fences_are_ignored() {
        let text = "```python\nx = 1\n```";
        assert!(extract_code_blocks(text).is_empty());
    }

    #[test]
    fn final_var_takes_priority_over_final() {
        let text = "FINAL_VAR(x)\nFINAL(y)";
        assert_eq!(detect_marker(text), Some(Marker::FinalVar("x".to_string())));
    }

    #[test]
    fn final_paren_matches_greedily() {
        let text = "FINAL(the answer is (42))";
        assert_eq!(
            detect_marker(text),
            Some(Marker::Final("the answer is (42)".to_string()))
        );
    }

    #[test]
    fn final_var_strips_quotes() {
        let text = "FINAL_VAR(\"result\")";
        assert_eq!(
            detect_marker(text),
            Some(Marker::FinalVar("result".to_string()))
        );
    }

    #[test]
    fn no_marker_returns_none() {
        assert_eq!(detect_marker("just some text"), None);
    }

    #[test]
    fn clamp_reports_elided_count() {
        let text = "x".repeat(50_000);
        let clamped = clamp(&text);
        assert!(clamped.len() <= RENDER_CLAMP + 32);
        assert!(clamped.contains("chars...]"));
    }

    #[test]
    fn empty_result_renders_no_output() {
        let result = crate::types::ReplResult {
            execution_time: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(render_result(&result), "No output");
    }

    #[test]
    fn reserved_identifiers_excluded_from_listing() {
        let mut locals = std::collections::HashMap::new();
        locals.insert("_hidden".to_string(), ReplValue::Json(serde_json::json!(1)));
        locals.insert("visible".to_string(), ReplValue::Json(serde_json::json!(1)));
        let result = crate::types::ReplResult {
            locals,
            execution_time: Duration::ZERO,
            ..Default::default()
        };
        let rendered = render_result(&result);
        assert!(rendered.contains("visible"));
        assert!(!rendered.contains("_hidden"));
    }
}
