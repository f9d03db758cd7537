//! Result assembly types returned by a research run.

use serde::{Deserialize, Serialize};

use delver_memory::{Finding, Goal};

/// The final research artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub session_id: String,
    pub topic: String,
    pub goal: Goal,
    pub synthesis: String,
    pub key_findings: Vec<Finding>,
    /// Distinct source URLs the findings trace back to.
    pub sources: Vec<String>,
    pub confidence: f32,
    /// `steps_completed / max(1, steps_total)` of the final plan.
    pub completeness: f32,
    pub duration_ms: u64,
    pub total_actions: u32,
    pub total_reflections: u32,
    pub strategies_used: Vec<String>,
    pub successful_approaches: Vec<String>,
    pub challenges: Vec<String>,
    pub suggestions: Vec<String>,
}

/// What `research()` always returns — success or not, never a panic or a
/// raw error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub result: Option<ResearchResult>,
    pub error: Option<String>,
    pub iterations: u32,
    pub reflections: u32,
}

impl ExecutionReport {
    pub fn failed(error: impl Into<String>, iterations: u32, reflections: u32) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            iterations,
            reflections,
        }
    }
}
