use serde::{Deserialize, Serialize};

mod cancel;
mod client;
mod embed;
mod error;
mod http;
mod retry;

pub use cancel::CancelToken;
pub use client::{
    Completion, CompletionRequest, ContentBlock, LlmClient, StopReason, ToolUse, Usage,
    extract_text, extract_tool_uses,
};
pub use embed::{EmbeddingClient, HashingEmbedder};
pub use error::LlmError;
pub use http::HttpChatClient;
pub use retry::{RetryPolicy, RetryingClient};

// ── Chat message types ───────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Extract the first usable JSON payload from an LLM response.
///
/// A fenced ` ```json ` block wins when present; otherwise the first
/// balanced `{…}` object in the raw text is tried.  Returns `None` when
/// neither parses — every caller is expected to have a documented fallback
/// path for that case.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(parsed) = fenced_body(response).and_then(|body| serde_json::from_str(body).ok()) {
        return Some(parsed);
    }
    balanced_object(response).and_then(|object| serde_json::from_str(object).ok())
}

/// Trimmed body of the first ` ```json … ``` ` fence, if the response
/// carries a complete one.
fn fenced_body(response: &str) -> Option<&str> {
    let (_, after_marker) = response.split_once("```json")?;
    let (body, _) = after_marker.split_once("```")?;
    Some(body.trim())
}

/// Single forward pass tracking brace depth, skipping braces that sit
/// inside JSON string literals.  Yields the first balanced `{…}` span.
fn balanced_object(text: &str) -> Option<&str> {
    let mut opened_at = None;
    let mut depth = 0usize;
    let mut in_literal = false;
    let mut backslashed = false;

    for (at, ch) in text.char_indices() {
        if in_literal {
            if backslashed {
                backslashed = false;
            } else if ch == '\\' {
                backslashed = true;
            } else if ch == '"' {
                in_literal = false;
            }
            continue;
        }
        match ch {
            '"' if opened_at.is_some() => in_literal = true,
            '{' => {
                if opened_at.is_none() {
                    opened_at = Some(at);
                }
                depth += 1;
            }
            '}' => {
                if let Some(open) = opened_at {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[open..=at]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────────────────
