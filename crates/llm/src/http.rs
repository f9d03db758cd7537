//! OpenAI-compatible HTTP chat adapter.
//!
//! Speaks the `/chat/completions` dialect so it works against hosted
//! gateways and local servers alike.  Transport and status failures are
//! mapped into [`LlmError`] variants; the retry wrapper decides what to do
//! with them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::client::{
    Completion, CompletionRequest, ContentBlock, LlmClient, StopReason, ToolUse, Usage,
};
use crate::error::LlmError;
use crate::{ChatMessage, ChatRole};

#[derive(Debug, Clone)]
pub struct HttpChatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpChatClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.trim().is_empty()).then_some(key);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({"role": role_slug(message), "content": message.content}));
        }

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(tools) = &request.tools {
            payload["tools"] = tools.clone();
        }
        payload
    }
}

fn role_slug(message: &ChatMessage) -> &'static str {
    match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

#[async_trait]
impl LlmClient for HttpChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = self.payload(&request);

        let mut http_request = self.client.post(&endpoint).timeout(self.timeout).json(&payload);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await.map_err(|error| {
            if error.is_timeout() {
                LlmError::Timeout { secs: self.timeout.as_secs() }
            } else {
                LlmError::Unknown { status: None, message: error.to_string() }
            }
        })?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| LlmError::Unknown { status: Some(status), message: error.to_string() })?;

        if !(200..300).contains(&status) {
            let message = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("request failed")
                .to_string();
            return Err(LlmError::from_status(status, message));
        }

        parse_completion(&body)
    }
}

fn parse_completion(body: &serde_json::Value) -> Result<Completion, LlmError> {
    let choice = body
        .pointer("/choices/0")
        .ok_or_else(|| LlmError::Unknown { status: None, message: format!("response missing choices: {body}") })?;

    let mut content = Vec::new();
    if let Some(text) = choice.pointer("/message/content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.to_string() });
        }
    }
    if let Some(calls) = choice.pointer("/message/tool_calls").and_then(|c| c.as_array()) {
        for call in calls {
            let name = call
                .pointer("/function/name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            // Arguments arrive as a JSON-encoded string; fall back to the
            // raw value when a server sends a parsed object instead.
            let input = match call.pointer("/function/arguments") {
                Some(serde_json::Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                }
                Some(value) => value.clone(),
                None => json!({}),
            };
            content.push(ContentBlock::ToolUse(ToolUse {
                id: call.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
                name,
                input,
            }));
        }
    }

    let stop_reason = match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        _ => StopReason::Other,
    };

    let usage = Usage {
        input_tokens: body.pointer("/usage/prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: body.pointer("/usage/completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
            as u32,
    };

    debug!(blocks = content.len(), ?stop_reason, "parsed completion");
    Ok(Completion { content, stop_reason, usage })
}
