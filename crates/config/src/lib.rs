use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Knobs for the research loop itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard upper bound on loop iterations per research run.
    pub max_iterations: u32,
    /// Reflect every N iterations (when auto-reflection is enabled).
    pub reflection_interval: u32,
    /// Token budget handed to the memory context builder.
    pub max_context_tokens: usize,
    pub enable_auto_reflection: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            reflection_interval: 5,
            max_context_tokens: 4000,
            enable_auto_reflection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    /// Overridden at runtime by the `DELVER_LLM_BASE_URL` environment
    /// variable when set.
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.  The key itself
    /// never lives in the config file.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    /// Maximum attempts for retryable failures (rate limit, 5xx, timeout).
    pub max_attempts: u32,
    /// Dimension of embedding vectors.  Fixed at client construction.
    pub embedding_dimensions: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1:8b".to_string(),
            api_key_env: "DELVER_API_KEY".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            request_timeout_secs: 60,
            max_attempts: 3,
            embedding_dimensions: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Consolidate episodes and facts when a session completes.
    pub auto_consolidate: bool,
    /// Count actions toward the reflection trigger.
    pub auto_reflect: bool,
    /// Episodes older than this many days are eligible for consolidation.
    pub consolidation_threshold_days: i64,
    /// Cosine similarity at which two facts count as duplicates.
    pub similarity_threshold: f32,
    /// Entries kept per working-memory window.
    pub working_memory_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            auto_consolidate: true,
            auto_reflect: true,
            consolidation_threshold_days: 7,
            similarity_threshold: 0.92,
            working_memory_window: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("DELVER_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = AppConfig::default();
        assert_eq!(config.agent.reflection_interval, 5);
        assert_eq!(config.agent.max_context_tokens, 4000);
        assert_eq!(config.llm.max_attempts, 3);
        assert_eq!(config.memory.working_memory_window, 20);
        assert!(config.memory.auto_consolidate);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from("/nonexistent/delver.toml").unwrap();
        assert_eq!(config.agent.max_iterations, 15);
    }

    #[test]
    fn roundtrip_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("delver.toml");

        let mut config = AppConfig::default();
        config.agent.max_iterations = 30;
        config.memory.similarity_threshold = 0.9;
        config.save_to(&path)?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.agent.max_iterations, 30);
        assert!((loaded.memory.similarity_threshold - 0.9).abs() < f32::EPSILON);
        Ok(())
    }

    #[test]
    fn partial_toml_fills_missing_sections() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[agent]\nmax_iterations = 3\n")?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.agent.max_iterations, 3);
        // Untouched sections keep their defaults.
        assert_eq!(loaded.llm.max_attempts, 3);
        assert_eq!(loaded.telemetry.log_level, "info");
        Ok(())
    }
}
