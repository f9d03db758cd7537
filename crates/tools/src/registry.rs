//! Central registry for all available tools.
//!
//! The registry is the only path from the agent core to the outside world:
//! registration, discovery, dispatch, per-tool statistics, and a bounded
//! execution log.  Tool failures never escape `execute_tool` — every call
//! returns a [`ToolResult`] value.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{Tool, ToolContext, ToolResult, ToolSpec};

/// Retained execution log entries; oldest are dropped first.
const HISTORY_CAP: usize = 1000;

/// Attributes recorded at registration time.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub enabled: bool,
}

impl RegisterOptions {
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(ToString::to_string).collect();
        self
    }
}

/// One dispatched execution, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Short sha256 digest of the canonical input, for log correlation
    /// without retaining payloads.
    pub input_digest: String,
}

/// Aggregate statistics for one tool, computed over the retained history.
#[derive(Debug, Clone)]
pub struct ToolStatistics {
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

/// Filters for [`ToolRegistry::execution_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub tool_name: Option<String>,
    pub success_only: bool,
    pub limit: Option<usize>,
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    spec: ToolSpec,
    category: Option<String>,
    tags: Vec<String>,
    enabled: bool,
    usage_count: u64,
    last_used: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    history: VecDeque<ExecutionLogEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  Re-registering an existing name replaces the old
    /// tool (with a warning) and resets its statistics.
    pub fn register(&mut self, tool: Arc<dyn Tool>, opts: RegisterOptions) {
        let spec = tool.spec();
        let name = spec.name.clone();
        if self.tools.contains_key(&name) {
            warn!(tool = %name, "replacing previously registered tool");
        }
        self.tools.insert(
            name.clone(),
            RegisteredTool {
                tool,
                spec,
                category: opts.category,
                tags: opts.tags,
                enabled: opts.enabled,
                usage_count: 0,
                last_used: None,
            },
        );
        debug!(tool = %name, "tool registered");
    }

    /// Remove a tool.  Returns `false` when the name was not registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| Arc::clone(&entry.tool))
    }

    pub fn all_tools(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|entry| entry.spec.clone()).collect()
    }

    pub fn enabled_tools(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.spec.clone())
            .collect()
    }

    pub fn tools_by_category(&self, category: &str) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|entry| entry.category.as_deref() == Some(category))
            .map(|entry| entry.spec.clone())
            .collect()
    }

    pub fn tools_by_tag(&self, tag: &str) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|entry| entry.tags.iter().any(|t| t == tag))
            .map(|entry| entry.spec.clone())
            .collect()
    }

    pub fn enable_tool(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable_tool(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.tools.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|entry| entry.enabled)
    }

    /// Dispatch one tool call.  Never returns `Err` semantics to the caller:
    /// unknown names, disabled tools, validation failures, and execution
    /// errors all come back as a failed [`ToolResult`].
    pub async fn execute_tool(
        &mut self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolResult {
        let Some(entry) = self.tools.get(name) else {
            return ToolResult::failure("Tool not found");
        };
        if !entry.enabled {
            return ToolResult::failure(format!("Tool '{name}' is disabled"));
        }
        if !entry.tool.validate_input(&input) {
            return ToolResult::failure("Input validation failed");
        }

        let tool = Arc::clone(&entry.tool);
        let digest = input_digest(&input);
        let started = Instant::now();
        let result = match tool.execute(input, ctx).await {
            Ok(result) => result,
            Err(error) => {
                warn!(tool = %name, %error, "tool execution failed");
                ToolResult::failure(error.to_string())
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let now = Utc::now();
        if let Some(entry) = self.tools.get_mut(name) {
            entry.usage_count += 1;
            entry.last_used = Some(now);
        }
        self.history.push_back(ExecutionLogEntry {
            tool_name: name.to_string(),
            timestamp: now,
            duration_ms,
            success: result.success,
            error: result.error.clone(),
            input_digest: digest,
        });
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }

        debug!(tool = %name, success = result.success, duration_ms, "tool executed");
        result
    }

    /// Statistics for one tool, or `None` when it was never registered.
    pub fn tool_statistics(&self, name: &str) -> Option<ToolStatistics> {
        let entry = self.tools.get(name)?;
        let runs: Vec<&ExecutionLogEntry> =
            self.history.iter().filter(|log| log.tool_name == name).collect();
        let (success_rate, average_duration_ms) = if runs.is_empty() {
            (0.0, 0.0)
        } else {
            let successes = runs.iter().filter(|log| log.success).count();
            let total_ms: u64 = runs.iter().map(|log| log.duration_ms).sum();
            (successes as f64 / runs.len() as f64, total_ms as f64 / runs.len() as f64)
        };
        Some(ToolStatistics {
            usage_count: entry.usage_count,
            last_used: entry.last_used,
            success_rate,
            average_duration_ms,
        })
    }

    pub fn execution_history(&self, query: &HistoryQuery) -> Vec<ExecutionLogEntry> {
        let filtered = self
            .history
            .iter()
            .filter(|log| {
                query.tool_name.as_deref().is_none_or(|name| log.tool_name == name)
                    && (!query.success_only || log.success)
            })
            .cloned()
            .collect::<Vec<_>>();
        match query.limit {
            // Most-recent entries win when a limit applies.
            Some(limit) if filtered.len() > limit => {
                filtered[filtered.len() - limit..].to_vec()
            }
            _ => filtered,
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Schemas of all enabled tools in the LLM function-calling shape.
    pub fn tool_schemas(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.spec.to_schema())
            .collect()
    }

    pub fn tool_schemas_by_name(&self, names: &[&str]) -> Vec<serde_json::Value> {
        names
            .iter()
            .filter_map(|name| self.tools.get(*name))
            .filter(|entry| entry.enabled)
            .map(|entry| entry.spec.to_schema())
            .collect()
    }
}

fn input_digest(input: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(input).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    // 8 bytes of hex is plenty for correlation.
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
