use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::ChatMessage;

// ── Request / response shapes ────────────────────────────────────────────────

/// A single chat-completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Tool schemas in the function-calling shape, when the caller wants the
    /// model to be able to select tools directly.
    pub tools: Option<serde_json::Value>,
}

impl CompletionRequest {
    /// Convenience constructor for the common single-prompt case.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self { messages: vec![ChatMessage::user(prompt)], ..Self::default() }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// One block of assistant output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse(ToolUse),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Completed model response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Concatenate all text blocks of a completion.
pub fn extract_text(completion: &Completion) -> String {
    completion
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::ToolUse(_) => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Collect all tool-use blocks of a completion.
pub fn extract_tool_uses(completion: &Completion) -> Vec<&ToolUse> {
    completion
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse(tool_use) => Some(tool_use),
            ContentBlock::Text { .. } => None,
        })
        .collect()
}

// ── Client trait ─────────────────────────────────────────────────────────────

/// Chat-completion capability.
///
/// Implementations are expected to map transport failures into the typed
/// [`LlmError`] so the retry wrapper can classify them.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion_with(blocks: Vec<ContentBlock>) -> Completion {
        Completion { content: blocks, stop_reason: StopReason::EndTurn, usage: Usage::default() }
    }

    #[test]
    fn extract_text_joins_text_blocks_and_skips_tool_uses() {
        let completion = completion_with(vec![
            ContentBlock::Text { text: "hello ".into() },
            ContentBlock::ToolUse(ToolUse {
                id: "t1".into(),
                name: "search".into(),
                input: serde_json::json!({}),
            }),
            ContentBlock::Text { text: "world".into() },
        ]);
        assert_eq!(extract_text(&completion), "hello world");
    }

    #[test]
    fn extract_tool_uses_returns_only_tool_blocks() {
        let completion = completion_with(vec![
            ContentBlock::Text { text: "thinking".into() },
            ContentBlock::ToolUse(ToolUse {
                id: "t1".into(),
                name: "fetch".into(),
                input: serde_json::json!({"url": "https://example.org"}),
            }),
        ]);
        let uses = extract_tool_uses(&completion);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].name, "fetch");
    }
}
