use crate::models::ChatMessage;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const CONTEXT_PREAMBLE: &str =
    "Use the following information from the knowledge base to answer the question:";

const REASONING_INSTRUCTION: &str = "When answering complex questions, show your reasoning step by step before providing the final answer.";

/// Characters kept from any single message.
const MAX_MESSAGE_CHARS: usize = 32_000;

/// System prompt, then injected context, then the reasoning instruction,
/// separated by blank lines.
pub fn build_system_prompt(custom: Option<&str>, context: &str, show_reasoning: bool) -> String {
    let mut prompt = custom
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string();

    if !context.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(CONTEXT_PREAMBLE);
        prompt.push('\n');
        prompt.push_str(context);
    }
    if show_reasoning {
        prompt.push_str("\n\n");
        prompt.push_str(REASONING_INSTRUCTION);
    }
    prompt
}

/// Keep only user/assistant turns, bound each one, and keep the last `max_turns`.
pub fn sanitize_history(history: &[ChatMessage], max_turns: usize) -> Vec<ChatMessage> {
    let kept: Vec<ChatMessage> = history
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| ChatMessage {
            role: m.role.clone(),
            content: truncate_to_char_boundary(&m.content, MAX_MESSAGE_CHARS),
        })
        .collect();
    let skip = kept.len().saturating_sub(max_turns);
    kept.into_iter().skip(skip).collect()
}

/// Final message array: system, prior turns, current user message.
pub fn build_messages(system_prompt: String, history: &[ChatMessage], message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system_prompt,
    });
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: truncate_to_char_boundary(message, MAX_MESSAGE_CHARS),
    });
    messages
}

/// At most `max_chars` chars of `s`.
pub fn truncate_to_char_boundary(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}
