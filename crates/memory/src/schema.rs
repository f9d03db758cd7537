//! Persistent and in-flight data model for research sessions.
//!
//! Relationships are by id only; `related_facts` / `related_findings` hold
//! id lists resolved by store lookup, never owned object graphs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fresh string id for any record.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ── Goal & session ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// What the run is trying to achieve.  Immutable for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub estimated_complexity: Complexity,
}

impl Goal {
    pub fn new(description: impl Into<String>, criteria: &[&str], complexity: Complexity) -> Self {
        Self {
            description: description.into(),
            success_criteria: criteria.iter().map(ToString::to_string).collect(),
            constraints: Vec::new(),
            estimated_complexity: complexity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl SessionStatus {
    /// Statuses that must carry a `completed_at` timestamp.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Root record of one research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub topic: String,
    pub goal: Goal,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_session_id: Option<String>,
}

// ── Progress & working memory ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Gathering,
    Analyzing,
    Synthesizing,
    Verifying,
    Completed,
}

impl Phase {
    /// Ordering rank for the phase-monotonicity law.  Verifying is optional
    /// and slots in before synthesizing completes.
    pub fn rank(self) -> u8 {
        match self {
            Self::Planning => 0,
            Self::Gathering => 1,
            Self::Analyzing => 2,
            Self::Verifying => 3,
            Self::Synthesizing => 4,
            Self::Completed => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub steps_completed: u32,
    pub steps_total: u32,
    pub sources_gathered: u32,
    pub facts_extracted: u32,
    pub current_phase: Phase,
    pub confidence: f32,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            steps_completed: 0,
            steps_total: 0,
            sources_gathered: 0,
            facts_extracted: 0,
            current_phase: Phase::Planning,
            confidence: 0.5,
        }
    }
}

/// Bounded sliding windows over the most recent loop activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub recent_actions: Vec<Action>,
    pub recent_outcomes: Vec<Outcome>,
    pub key_findings: Vec<Finding>,
    pub open_questions: Vec<String>,
    pub hypotheses: Vec<String>,
}

impl WorkingMemory {
    /// Trim every window to its `window` most recent entries.
    pub fn trim(&mut self, window: usize) {
        fn keep_tail<T>(items: &mut Vec<T>, window: usize) {
            if items.len() > window {
                items.drain(..items.len() - window);
            }
        }
        keep_tail(&mut self.recent_actions, window);
        keep_tail(&mut self.recent_outcomes, window);
        keep_tail(&mut self.key_findings, window);
        keep_tail(&mut self.open_questions, window);
        keep_tail(&mut self.hypotheses, window);
    }

    pub fn max_window_len(&self) -> usize {
        [
            self.recent_actions.len(),
            self.recent_outcomes.len(),
            self.key_findings.len(),
            self.open_questions.len(),
            self.hypotheses.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

// ── Actions & outcomes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Search,
    Fetch,
    Analyze,
    Extract,
    Verify,
    Synthesize,
    Reflect,
    Replan,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Fetch => "fetch",
            Self::Analyze => "analyze",
            Self::Extract => "extract",
            Self::Verify => "verify",
            Self::Synthesize => "synthesize",
            Self::Reflect => "reflect",
            Self::Replan => "replan",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters bound per action kind.  The reasoner proposes an abstract
/// action with `Empty` params; the control loop binds the concrete variant
/// from working memory before dispatch.
///
/// Externally tagged so the bincode-backed store can round-trip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionParams {
    Search { query: String, max_results: u32 },
    Fetch { url: String },
    Analyze { content: String, focus: Option<String> },
    Synthesize { sources: Vec<String>, style: Option<String> },
    Verify { claims: Vec<String> },
    Empty,
}

/// A single tool-invocation proposal produced by the reasoner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub session_id: String,
    pub kind: ActionKind,
    pub tool: String,
    pub params: ActionParams,
    pub reasoning: String,
    pub strategy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A candidate declarative statement before it becomes a stored fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFact {
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_fact_confidence")]
    pub confidence: f32,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_fact_confidence() -> f32 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedClaim {
    pub claim: String,
    pub verified: bool,
    pub note: Option<String>,
}

/// Typed result payload per action kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Search { results: Vec<SearchResultItem> },
    Fetch { url: String, content: String },
    Analyze { facts: Vec<CandidateFact> },
    Synthesize { synthesis: String },
    Verify { verdicts: Vec<VerifiedClaim> },
    Raw { payload: String },
}

/// The recorded result of executing an [`Action`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub action_id: String,
    pub success: bool,
    pub result: Option<ActionResult>,
    pub error: Option<String>,
    pub observations: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

// ── Findings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Academic,
    News,
    Webpage,
    Report,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    pub title: String,
    pub kind: SourceKind,
    pub credibility: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Unverified,
    Disputed,
}

/// A piece of evidence with provenance extracted during research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub content: String,
    pub source: SourceRef,
    pub confidence: f32,
    pub relevance: f32,
    pub timestamp: DateTime<Utc>,
    pub verification: VerificationStatus,
    #[serde(default)]
    pub related_findings: Vec<String>,
}

// ── Memory records ───────────────────────────────────────────────────────────

/// One atomic unit of experience persisted to episodic memory.
/// Immutable once consolidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicMemory {
    pub id: String,
    pub session_id: String,
    pub topic: String,
    pub actions: Vec<Action>,
    pub outcomes: Vec<Outcome>,
    pub findings: Vec<Finding>,
    pub duration_ms: u64,
    pub success: bool,
    pub summary: String,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A consolidated declarative statement in semantic memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub content: String,
    pub category: String,
    pub subcategory: Option<String>,
    /// Episode id or free-form provenance string.
    pub source: String,
    pub confidence: f32,
    pub relevance: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub related_facts: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

/// A named procedural pattern reusable across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub strategy_name: String,
    pub description: String,
    pub applicable_contexts: Vec<String>,
    pub required_tools: Vec<String>,
    pub success_rate: f32,
    pub average_duration_ms: u64,
    pub times_used: u64,
    #[serde(default)]
    pub refinements: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_refined: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub rating: Option<f32>,
    pub created_at: DateTime<Utc>,
}

// ── Plans ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub id: String,
    pub description: String,
    /// Tool name or action kind this step expects to run.
    pub action: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub expected_outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub id: String,
    pub strategy: String,
    pub steps: Vec<PlannedStep>,
    pub estimated_duration_secs: u64,
    pub created_at: DateTime<Utc>,
    pub revised_at: Option<DateTime<Utc>>,
    pub revision_reason: Option<String>,
}

// ── Reflection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressAssessment {
    pub progress_rate: f32,
    /// Estimated iterations remaining at the current rate.
    pub estimated_completion: f32,
    pub is_on_track: bool,
    pub blockers: Vec<String>,
    pub achievements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyRecommendation {
    Continue,
    Adjust,
    Change,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub effectiveness: f32,
    pub recommendation: StrategyRecommendation,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub alternatives: Vec<String>,
}

/// A meta-cognitive record of progress, strategy evaluation, and learnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub session_id: String,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub actions_summary: String,
    pub outcomes_summary: String,
    pub progress_assessment: ProgressAssessment,
    pub strategy_evaluation: StrategyEvaluation,
    pub learnings: Vec<String>,
    pub should_replan: bool,
    pub adjustments: Vec<String>,
    pub next_focus: String,
}

// ── Agent state ──────────────────────────────────────────────────────────────

/// Mutable per-iteration scratchpad co-owned with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub goal: Goal,
    pub plan: ResearchPlan,
    pub progress: Progress,
    pub working_memory: WorkingMemory,
    pub reflections: Vec<Reflection>,
    pub iteration_count: u32,
    pub last_action_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_memory_trim_keeps_most_recent() {
        let mut wm = WorkingMemory::default();
        for i in 0..30 {
            wm.open_questions.push(format!("q{i}"));
        }
        wm.trim(20);
        assert_eq!(wm.open_questions.len(), 20);
        assert_eq!(wm.open_questions.first().map(String::as_str), Some("q10"));
        assert_eq!(wm.open_questions.last().map(String::as_str), Some("q29"));
    }

    #[test]
    fn phase_ranks_are_monotone_along_the_lifecycle() {
        assert!(Phase::Planning.rank() < Phase::Gathering.rank());
        assert!(Phase::Gathering.rank() < Phase::Analyzing.rank());
        assert!(Phase::Analyzing.rank() < Phase::Verifying.rank());
        assert!(Phase::Verifying.rank() < Phase::Synthesizing.rank());
        assert!(Phase::Synthesizing.rank() < Phase::Completed.rank());
    }

    #[test]
    fn terminal_statuses_are_exactly_the_completed_ones() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn action_params_serialize_with_variant_tags() {
        let params = ActionParams::Search { query: "rust agents".into(), max_results: 5 };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["search"]["query"], "rust agents");

        let back: ActionParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
