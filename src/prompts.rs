//! System and continuation prompt templates, with a box-drawing
//! section-header style and the context-shape metadata and
//! `context_N`/`history_N` availability notes the iteration loop needs.

use crate::types::QueryMetadata;

const RULE: &str =
    "═══════════════════════════════════════════════════════════════════════════════";

/// System prompt: fixed task framing plus the hook surface. Context shape
/// details are surfaced separately, as the metadata message in the initial
/// history (step 4 of the completion algorithm), not inlined here.
pub fn build_system_prompt() -> String {
    format!(
        r#"You are an LLM performing iterative task decomposition. You have a Python
REPL to interactively explore the supplied context, call sub-LLMs, and build
your response.

{rule}
                           AVAILABLE FUNCTIONS
{rule}

  print(value)                        -> display output, continue reasoning
  llm_query(prompt, model=None)       -> query a sub-LLM (isolated context)
  llm_query_batched(prompts, model)   -> query several sub-LLMs concurrently
  FINAL(answer)                       -> terminate with a literal answer
  FINAL_VAR(name)                     -> terminate, answer is the named variable
  SHOW_VARS()                         -> list currently defined variable names

CRITICAL: llm_query() runs in an isolated sub-LLM call. It cannot see your
REPL state. Pass all necessary information explicitly in the prompt string.

{rule}
                              EXECUTION RULES
{rule}

1. Write ONE ```repl code block per response.
2. Code executes immediately; you see stdout/stderr/variable names next turn.
3. Store results you need again in variables so they persist across turns.
4. Finish with a line reading FINAL(answer) or FINAL_VAR(name)."#,
        rule = RULE,
    )
}

/// The assistant-role metadata message describing the context's shape,
/// following the caller-supplied context in the initial history.
pub fn build_metadata_message(meta: &QueryMetadata) -> String {
    const LISTING_LIMIT: usize = 100;
    let chunk_listing = if meta.chunk_lens.len() > LISTING_LIMIT {
        let shown: Vec<String> = meta.chunk_lens[..LISTING_LIMIT]
            .iter()
            .map(|n| n.to_string())
            .collect();
        format!(
            "[{}, ... {} others]",
            shown.join(", "),
            meta.chunk_lens.len() - LISTING_LIMIT
        )
    } else {
        format!(
            "[{}]",
            meta.chunk_lens
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    format!(
        "Context shape: {} | total length: {} characters | per-chunk lengths: {}",
        meta.shape, meta.total_len, chunk_listing
    )
}

/// The per-iteration user-role prompt asking for the next step. On
/// iteration 0 this is prefixed with a safeguard noting the model has not
/// yet inspected the REPL and, if supplied, the root question; later
/// iterations append availability notes for extra `context_N`/`history_N`
/// identifiers.
pub fn build_iteration_prompt(
    iteration: u32,
    max_iterations: u32,
    root_question: Option<&str>,
    context_count: usize,
    history_count: usize,
) -> String {
    let mut prompt = String::new();

    if iteration == 0 {
        prompt.push_str(
            "You have not yet inspected the REPL state. Begin by examining `context` to \
             understand your task.",
        );
        if let Some(question) = root_question {
            prompt.push_str(&format!(" The question to answer is: {question}"));
        }
        prompt.push('\n');
    }

    let urgency = if iteration + 3 >= max_iterations {
        "URGENT: few iterations remain. Finish soon or call FINAL(...) with a partial result."
    } else if iteration * 2 >= max_iterations {
        "You're past the halfway point. Make concrete progress toward a final answer."
    } else {
        "Continue working. Use print() to check progress before finalizing."
    };

    prompt.push_str(&format!(
        "[Iteration {}/{}] {}\n",
        iteration + 1,
        max_iterations,
        urgency
    ));

    if context_count > 1 {
        let names: Vec<String> = (0..context_count).map(|i| format!("context_{i}")).collect();
        prompt.push_str(&format!("Available contexts: {}\n", names.join(", ")));
    }
    if history_count > 1 {
        let names: Vec<String> = (0..history_count).map(|i| format!("history_{i}")).collect();
        prompt.push_str(&format!("Available histories: {}\n", names.join(", ")));
    }

    prompt.push_str("Write a ```repl code block for your next step:");
    prompt
}

/// The fall-through prompt sent once iterations are exhausted, asking for a
/// final answer using only the accumulated history.
pub fn build_exhaustion_prompt() -> String {
    "You have used all available iterations. Using only what you've already \
     established in this conversation, respond now with FINAL(answer) or \
     FINAL_VAR(name)."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_message_truncates_long_chunk_lists() {
        let meta = QueryMetadata {
            shape: "sequence".to_string(),
            total_len: 500,
            chunk_lens: (0..150).collect(),
        };
        let msg = build_metadata_message(&meta);
        assert!(msg.contains("... 50 others"));
    }

    #[test]
    fn iteration_zero_includes_safeguard_and_root_question() {
        let prompt = build_iteration_prompt(0, 30, Some("what is 2+2?"), 1, 1);
        assert!(prompt.contains("have not yet inspected"));
        assert!(prompt.contains("what is 2+2?"));
    }

    #[test]
    fn multiple_contexts_are_listed_by_name() {
        let prompt = build_iteration_prompt(5, 30, None, 3, 1);
        assert!(prompt.contains("context_0, context_1, context_2"));
    }

    #[test]
    fn single_context_is_not_listed() {
        let prompt = build_iteration_prompt(5, 30, None, 1, 1);
        assert!(!prompt.contains("Available contexts"));
    }
}
