use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

mod registry;
pub use registry::{
    ExecutionLogEntry, HistoryQuery, RegisterOptions, ToolRegistry, ToolStatistics,
};

// ── Tool contract ────────────────────────────────────────────────────────────

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), required: true }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), required: false }
    }
}

/// Static metadata about a tool, used for discovery and for the LLM's
/// function-calling schema export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub version: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Render this spec in the LLM function-calling shape
    /// `{name, description, input_schema}`.
    pub fn to_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({"type": "string", "description": param.description}),
            );
            if param.required {
                required.push(json!(param.name));
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

/// The value returned after a tool runs.  Tools never propagate errors as
/// `Err` across the registry boundary — the registry maps any failure into a
/// `ToolResult` with `success = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data: Some(data), error: None, metadata: HashMap::new() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()), metadata: HashMap::new() }
    }
}

/// Per-invocation context threaded from the control loop into tools.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self { session_id: Some(session_id.into()) }
    }
}

/// Trait implemented by every tool.  No inheritance; each tool is a
/// standalone type satisfying the contract, dispatched by name through the
/// registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Structural input check.  The default verifies that `input` is an
    /// object carrying every required parameter.
    fn validate_input(&self, input: &serde_json::Value) -> bool {
        let Some(object) = input.as_object() else {
            return false;
        };
        self.spec()
            .params
            .iter()
            .filter(|param| param.required)
            .all(|param| object.get(&param.name).is_some_and(|value| !value.is_null()))
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo the input back".to_string(),
                version: "1.0.0".to_string(),
                params: vec![
                    ToolParam::required("text", "Text to echo"),
                    ToolParam::optional("upper", "Uppercase the output"),
                ],
            }
        }

        async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult> {
            Ok(ToolResult::ok(input))
        }
    }

    #[test]
    fn default_validation_requires_required_params() {
        let tool = EchoTool;
        assert!(tool.validate_input(&json!({"text": "hi"})));
        assert!(tool.validate_input(&json!({"text": "hi", "upper": true})));
        assert!(!tool.validate_input(&json!({"upper": true})));
        assert!(!tool.validate_input(&json!({"text": null})));
        assert!(!tool.validate_input(&json!("not an object")));
    }

    #[test]
    fn schema_export_carries_required_list() {
        let schema = EchoTool.spec().to_schema();
        assert_eq!(schema["name"], "echo");
        assert_eq!(schema["input_schema"]["type"], "object");
        assert!(schema["input_schema"]["properties"]["text"].is_object());
        assert_eq!(schema["input_schema"]["required"][0], "text");
        assert_eq!(schema["input_schema"]["required"].as_array().unwrap().len(), 1);
    }
}
