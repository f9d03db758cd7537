//! Reasoning engine: decision in, action out.
//!
//! `reason` turns the current goal, progress, and memory context into one
//! selected [`Action`]; `observe` turns an executed action's outcome into
//! learnings plus the continue/replan flags.  The engine holds no state
//! across calls and never binds tool parameters — that belongs to the
//! control loop.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use delver_llm::{CompletionRequest, LlmClient, extract_json_output, extract_text};
use delver_memory::{
    Action, ActionKind, ActionParams, ActionResult, Goal, MemoryContext, Outcome, Phase,
    Progress, RankedStrategy, WorkingMemory, new_id,
};
use delver_tools::ToolSpec;

mod prompt;
pub use prompt::truncate_for_prompt;

use prompt::{build_learning_prompt, build_reasoning_prompt};

/// Identifier of the option injected when the LLM yields nothing usable.
pub const FALLBACK_OPTION_ID: &str = "fallback-option";

/// Confidence assigned to the fallback option.
const FALLBACK_CONFIDENCE: f32 = 0.3;

/// Failures in a row (tail of working memory) that force a replan.
const REPLAN_FAILURE_STREAK: usize = 3;

// ── Option generation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateOption {
    #[serde(default)]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub expected_benefit: String,
    #[serde(default)]
    pub potential_risks: Vec<String>,
    #[serde(default = "default_cost")]
    pub estimated_cost: f32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_cost() -> f32 {
    5.0
}

fn default_confidence() -> f32 {
    0.5
}

#[derive(Debug, Deserialize)]
struct OptionsOutput {
    #[serde(default)]
    options: Vec<CandidateOption>,
}

#[derive(Debug, Deserialize)]
struct LearningsOutput {
    #[serde(default)]
    learnings: Vec<String>,
}

/// `0.7·confidence + 0.3·(1 − cost/10)`.
pub fn score_option(option: &CandidateOption) -> f32 {
    let confidence = option.confidence.clamp(0.0, 1.0);
    let cost = option.estimated_cost.clamp(1.0, 10.0);
    0.7 * confidence + 0.3 * (1.0 - cost / 10.0)
}

/// Deterministic argmax; the earliest option wins ties.
pub fn select_option(options: &[CandidateOption]) -> Option<&CandidateOption> {
    let mut best: Option<(&CandidateOption, f32)> = None;
    for option in options {
        let score = score_option(option);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((option, score)),
        }
    }
    best.map(|(option, _)| option)
}

// ── Action-type / tool mapping ───────────────────────────────────────────────

/// Case-insensitive substring table between tool names and action types.
const KIND_PATTERNS: &[(&str, ActionKind)] = &[
    ("search", ActionKind::Search),
    ("fetch", ActionKind::Fetch),
    ("analyz", ActionKind::Analyze),
    ("extract", ActionKind::Extract),
    ("verif", ActionKind::Verify),
    ("synth", ActionKind::Synthesize),
    ("reflect", ActionKind::Reflect),
    ("replan", ActionKind::Replan),
];

pub fn kind_for_label(label: &str) -> Option<ActionKind> {
    let lower = label.to_lowercase();
    KIND_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, kind)| *kind)
}

/// Resolve an option's `action` label to a concrete tool: exact tool-name
/// match first, then the nearest tool by action-type substring.  The action
/// kind is inferred symmetrically from whichever name wins.
fn resolve_tool(label: &str, available: &[ToolSpec]) -> (String, ActionKind) {
    if let Some(tool) = available.iter().find(|tool| tool.name == label) {
        let kind = kind_for_label(&tool.name)
            .or_else(|| kind_for_label(label))
            .unwrap_or(ActionKind::Search);
        return (tool.name.clone(), kind);
    }

    if let Some(kind) = kind_for_label(label) {
        let pattern = KIND_PATTERNS
            .iter()
            .find(|(_, candidate)| *candidate == kind)
            .map(|(pattern, _)| *pattern)
            .unwrap_or_default();
        if let Some(tool) =
            available.iter().find(|tool| tool.name.to_lowercase().contains(pattern))
        {
            return (tool.name.clone(), kind);
        }
        // No matching tool registered; keep the label so the registry can
        // report "Tool not found" as a failed outcome.
        return (label.to_string(), kind);
    }

    (label.to_string(), ActionKind::Search)
}

/// Phase-default action labels, used only when the LLM response is unusable.
fn phase_default_action(progress: &Progress, working_memory: &WorkingMemory) -> &'static str {
    match progress.current_phase {
        Phase::Planning | Phase::Gathering => "search",
        Phase::Analyzing => {
            let fetched = working_memory.recent_outcomes.iter().any(|outcome| {
                matches!(outcome.result, Some(ActionResult::Fetch { .. }))
            });
            if fetched { "analyze" } else { "fetch" }
        }
        Phase::Synthesizing | Phase::Completed => {
            if progress.facts_extracted >= 1 { "synthesize" } else { "analyze" }
        }
        Phase::Verifying => "verify",
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReasoningResult {
    pub reasoning: String,
    pub selected_action: Action,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct ObservationResult {
    pub observations: Vec<String>,
    pub success: bool,
    pub should_continue: bool,
    pub should_replan: bool,
    pub learnings: Vec<String>,
}

pub struct ReasoningEngine {
    llm: Arc<dyn LlmClient>,
}

impl ReasoningEngine {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Generate candidate actions, score them, and return the winner as an
    /// abstract [`Action`] (empty params, bound later by the loop).
    #[allow(clippy::too_many_arguments)]
    pub async fn reason(
        &self,
        goal: &Goal,
        progress: &Progress,
        working_memory: &WorkingMemory,
        available_tools: &[ToolSpec],
        memory_context: &MemoryContext,
        recommendations: &[RankedStrategy],
        session_id: &str,
    ) -> Result<ReasoningResult> {
        let prompt = build_reasoning_prompt(
            goal,
            progress,
            working_memory,
            available_tools,
            memory_context,
            recommendations,
        );

        let options = match self.llm.complete(CompletionRequest::from_prompt(prompt)).await {
            Ok(completion) => {
                let raw = extract_text(&completion);
                extract_json_output::<OptionsOutput>(&raw)
                    .map(|output| output.options)
                    .unwrap_or_default()
            }
            Err(error) => {
                warn!(%error, "reasoning LLM call failed — using phase default");
                Vec::new()
            }
        };

        let fallback;
        let selected = match select_option(&options) {
            Some(option) => option,
            None => {
                let action = phase_default_action(progress, working_memory);
                debug!(action, "no usable options — falling back to phase default");
                fallback = CandidateOption {
                    id: FALLBACK_OPTION_ID.to_string(),
                    action: action.to_string(),
                    rationale: format!("Defaulting to {action} for the current phase"),
                    expected_benefit: String::new(),
                    potential_risks: Vec::new(),
                    estimated_cost: 5.0,
                    confidence: FALLBACK_CONFIDENCE,
                };
                &fallback
            }
        };

        let (tool, kind) = resolve_tool(&selected.action, available_tools);
        let action = Action {
            id: new_id(),
            session_id: session_id.to_string(),
            kind,
            tool,
            params: ActionParams::Empty,
            reasoning: selected.rationale.clone(),
            strategy: recommendations
                .first()
                .map(|recommendation| recommendation.strategy.strategy_name.clone()),
            timestamp: Utc::now(),
        };

        debug!(
            option = %selected.id,
            tool = %action.tool,
            kind = %action.kind,
            confidence = selected.confidence,
            "action selected"
        );
        Ok(ReasoningResult {
            reasoning: selected.rationale.clone(),
            selected_action: action,
            confidence: selected.confidence.clamp(0.0, 1.0),
        })
    }

    /// Digest one executed action: extract learnings and decide whether the
    /// loop should continue and whether the plan is still credible.
    pub async fn observe(
        &self,
        action: &Action,
        outcome: &Outcome,
        goal: &Goal,
        progress: &Progress,
        working_memory: &WorkingMemory,
    ) -> Result<ObservationResult> {
        let prompt = build_learning_prompt(
            &action.tool,
            outcome.success,
            &outcome.observations,
            outcome.error.as_deref(),
            goal,
        );

        let learnings = match self.llm.complete(CompletionRequest::from_prompt(prompt)).await {
            Ok(completion) => {
                let raw = extract_text(&completion);
                extract_json_output::<LearningsOutput>(&raw)
                    .map(|output| output.learnings)
                    .filter(|learnings| !learnings.is_empty())
            }
            Err(error) => {
                warn!(%error, "learning extraction failed — using fallback learning");
                None
            }
        }
        .unwrap_or_else(|| vec![fallback_learning(action, outcome)]);

        let should_continue = !(progress.current_phase == Phase::Completed
            || (!outcome.success && progress.confidence < 0.3));

        let tail = &working_memory.recent_outcomes;
        let streak_failed = tail.len() >= REPLAN_FAILURE_STREAK
            && tail[tail.len() - REPLAN_FAILURE_STREAK..]
                .iter()
                .all(|outcome| !outcome.success);
        let should_replan = !outcome.success
            || streak_failed
            || (progress.confidence < 0.4 && progress.steps_completed >= 5);

        Ok(ObservationResult {
            observations: outcome.observations.clone(),
            success: outcome.success,
            should_continue,
            should_replan,
            learnings,
        })
    }
}

fn fallback_learning(action: &Action, outcome: &Outcome) -> String {
    let detail = outcome
        .observations
        .first()
        .map(String::as_str)
        .or(outcome.error.as_deref())
        .unwrap_or("no details");
    format!(
        "{} {}: {detail}",
        action.tool,
        if outcome.success { "succeeded" } else { "failed" },
    )
}

// ── Tests ────────────────────────────────────────────────────────────────────
