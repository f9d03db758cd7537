//! Meta-cognition: the loop-side reflection gate and the memory-side
//! analyzer.
//!
//! `AgentReflection` decides *when* to pause and look inward and produces
//! the [`Reflection`] record; `ReflectionEngine` runs the heavier read-only
//! analyses used during longer sessions.  Reflection failures never fail
//! the loop — they log and continue.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use delver_llm::{CompletionRequest, LlmClient, extract_text};
use delver_memory::{
    Action, AgentState, MemorySystem, Outcome, Phase, ProgressAssessment, Reflection,
    StrategyEvaluation, StrategyRecommendation as RecommendationKind, new_id,
};

/// Outcomes inspected by the failure-streak trigger.
const FAILURE_WINDOW: usize = 5;

/// Failures within [`FAILURE_WINDOW`] that trip the trigger.
const FAILURE_TRIGGER: usize = 3;

/// Actions inspected by the repetition detector.
const REPETITION_WINDOW: usize = 6;

/// Same-kind actions within [`REPETITION_WINDOW`] that flag repetition.
const REPETITION_TRIGGER: usize = 4;

/// Why a reflection fired (for logs and telemetry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectTrigger {
    Interval,
    ConsecutiveFailures,
    LowConfidence,
    ApproachingLimit,
}

#[derive(Debug, Clone)]
pub struct AppliedReflection {
    pub adjustments_made: Vec<String>,
    pub should_replan: bool,
    pub new_focus: String,
    pub strategy_recommendation: RecommendationKind,
}

pub struct AgentReflection {
    llm: Arc<dyn LlmClient>,
    reflection_interval: u32,
    max_iterations: u32,
    last_reflection_iteration: u32,
    /// The approaching-limit trigger fires once per run, not once per
    /// remaining iteration.
    limit_served: bool,
}

impl AgentReflection {
    pub fn new(llm: Arc<dyn LlmClient>, reflection_interval: u32, max_iterations: u32) -> Self {
        Self {
            llm,
            reflection_interval: reflection_interval.max(1),
            max_iterations,
            last_reflection_iteration: 0,
            limit_served: false,
        }
    }

    /// The reflection gate: interval elapsed, failure streak, low
    /// confidence, or the iteration budget running out.
    pub fn should_reflect(&self, state: &AgentState) -> Option<ReflectTrigger> {
        if state.iteration_count - self.last_reflection_iteration >= self.reflection_interval {
            return Some(ReflectTrigger::Interval);
        }

        let outcomes = &state.working_memory.recent_outcomes;
        let window = &outcomes[outcomes.len().saturating_sub(FAILURE_WINDOW)..];
        if window.iter().filter(|outcome| !outcome.success).count() >= FAILURE_TRIGGER {
            return Some(ReflectTrigger::ConsecutiveFailures);
        }

        if state.progress.confidence < 0.4 && state.iteration_count >= 3 {
            return Some(ReflectTrigger::LowConfidence);
        }

        if !self.limit_served
            && self.max_iterations > 0
            && state.iteration_count as f32 >= 0.8 * self.max_iterations as f32
            && state.progress.current_phase != Phase::Completed
        {
            return Some(ReflectTrigger::ApproachingLimit);
        }

        None
    }

    /// Produce one [`Reflection`] over the recent actions and outcomes and
    /// remember the iteration it covered.  The caller appends it to
    /// `state.reflections` and resets the memory system's counter.
    pub async fn reflect(&mut self, session_id: &str, state: &AgentState) -> Reflection {
        let actions = &state.working_memory.recent_actions;
        let outcomes = &state.working_memory.recent_outcomes;

        let progress_assessment = assess_progress(state, outcomes);
        let strategy_evaluation = self.evaluate_strategy(state, actions, outcomes).await;
        let learnings = extract_learnings(actions, outcomes);

        let failure_streak = {
            let window = &outcomes[outcomes.len().saturating_sub(FAILURE_WINDOW)..];
            window.iter().filter(|outcome| !outcome.success).count() >= FAILURE_TRIGGER
        };
        let should_replan = !progress_assessment.is_on_track
            || strategy_evaluation.recommendation == RecommendationKind::Change
            || failure_streak;

        let mut adjustments = learnings.clone();
        if strategy_evaluation.recommendation == RecommendationKind::Adjust {
            adjustments.push("Refine current strategy based on observations".to_string());
        }

        let next_focus = focus_for_phase(state.progress.current_phase);

        self.last_reflection_iteration = state.iteration_count;
        if self.max_iterations > 0
            && state.iteration_count as f32 >= 0.8 * self.max_iterations as f32
        {
            self.limit_served = true;
        }
        debug!(
            iteration = state.iteration_count,
            on_track = progress_assessment.is_on_track,
            should_replan,
            "reflection produced"
        );

        Reflection {
            id: new_id(),
            session_id: session_id.to_string(),
            iteration: state.iteration_count,
            timestamp: Utc::now(),
            actions_summary: summarize_actions(actions),
            outcomes_summary: summarize_outcomes(outcomes),
            progress_assessment,
            strategy_evaluation,
            learnings,
            should_replan,
            adjustments,
            next_focus,
        }
    }

    /// Surface the loop-relevant consequences of a reflection.
    pub fn apply_reflection(&self, reflection: &Reflection) -> AppliedReflection {
        AppliedReflection {
            adjustments_made: reflection.adjustments.clone(),
            should_replan: reflection.should_replan,
            new_focus: reflection.next_focus.clone(),
            strategy_recommendation: reflection.strategy_evaluation.recommendation,
        }
    }

    async fn evaluate_strategy(
        &self,
        state: &AgentState,
        actions: &[Action],
        outcomes: &[Outcome],
    ) -> StrategyEvaluation {
        let effectiveness = if outcomes.is_empty() {
            0.0
        } else {
            outcomes.iter().filter(|outcome| outcome.success).count() as f32
                / outcomes.len() as f32
        };

        let recommendation = if effectiveness >= 0.7 {
            RecommendationKind::Continue
        } else if effectiveness >= 0.4 {
            RecommendationKind::Adjust
        } else {
            RecommendationKind::Change
        };

        let per_tool = per_tool_rates(actions, outcomes);
        let strengths: Vec<String> = per_tool
            .iter()
            .filter(|(_, (successes, failures))| {
                let uses = successes + failures;
                uses >= 2 && *successes as f32 / uses as f32 >= 0.7
            })
            .map(|(tool, (successes, _))| format!("{tool} is working well ({successes} successes)"))
            .collect();

        let mut weaknesses = Vec::new();
        if effectiveness < 0.5 {
            weaknesses.push("High failure rate".to_string());
        }
        if state.iteration_count >= 10
            && state
                .plan
                .steps
                .iter()
                .any(|step| step.status == delver_memory::StepStatus::InProgress)
        {
            weaknesses.push("Stalled step".to_string());
        }

        // Alternatives are best-effort; an unusable response leaves them empty.
        let alternatives = match self
            .llm
            .complete(CompletionRequest::from_prompt(format!(
                "A research agent's current strategy is {:.0}% effective on the \
                 goal \"{}\".  Suggest up to 3 alternative strategies as a \
                 bulleted list, one line each.",
                effectiveness * 100.0,
                state.goal.description,
            )))
            .await
        {
            Ok(completion) => extract_text(&completion)
                .lines()
                .filter_map(|line| {
                    let trimmed = line.trim().trim_start_matches(['-', '*', '•']).trim();
                    (!trimmed.is_empty() && line.trim().starts_with(['-', '*', '•']))
                        .then(|| trimmed.to_string())
                })
                .take(3)
                .collect(),
            Err(error) => {
                warn!(%error, "alternative-strategy lookup failed");
                Vec::new()
            }
        };

        StrategyEvaluation {
            effectiveness,
            recommendation,
            strengths,
            weaknesses,
            alternatives,
        }
    }
}

fn assess_progress(state: &AgentState, outcomes: &[Outcome]) -> ProgressAssessment {
    let progress = &state.progress;
    let iteration_count = state.iteration_count.max(1);
    let progress_rate = progress.steps_completed as f32 / iteration_count as f32;
    let remaining = progress.steps_total.saturating_sub(progress.steps_completed) as f32;
    let estimated_completion = remaining / progress_rate.max(f32::EPSILON);

    let success_rate = if outcomes.is_empty() {
        0.0
    } else {
        outcomes.iter().filter(|outcome| outcome.success).count() as f32 / outcomes.len() as f32
    };
    let is_on_track = progress.steps_completed as f32 > 0.15 * state.iteration_count as f32
        && success_rate >= 0.5
        && progress.confidence >= 0.5;

    let mut blockers = Vec::new();
    if success_rate < 0.5 {
        blockers.push("Frequent action failures".to_string());
    }
    if progress.confidence < 0.4 {
        blockers.push("Low confidence in current approach".to_string());
    }
    if state.working_memory.open_questions.len() > 5 {
        blockers.push("Too many unanswered questions".to_string());
    }
    if progress.sources_gathered < 2 {
        blockers.push("Insufficient sources gathered".to_string());
    }

    let mut achievements = Vec::new();
    if progress.sources_gathered >= 5 {
        achievements.push(format!("{} sources gathered", progress.sources_gathered));
    }
    if progress.facts_extracted >= 10 {
        achievements.push(format!("{} facts extracted", progress.facts_extracted));
    }
    if progress.confidence >= 0.7 {
        achievements.push("High confidence maintained".to_string());
    }
    if state.working_memory.key_findings.len() >= 3 {
        achievements.push(format!("{} key findings", state.working_memory.key_findings.len()));
    }

    ProgressAssessment {
        progress_rate,
        estimated_completion,
        is_on_track,
        blockers,
        achievements,
    }
}

fn extract_learnings(actions: &[Action], outcomes: &[Outcome]) -> Vec<String> {
    let mut learnings = Vec::new();
    for (tool, (successes, failures)) in per_tool_rates(actions, outcomes) {
        if successes >= 2 && failures == 0 {
            learnings.push(format!("{tool} is effective ({successes} successes)"));
        } else if failures >= 2 {
            learnings.push(format!("{tool} needs improvement ({failures} failures)"));
        }
    }
    learnings.sort();

    let window = &actions[actions.len().saturating_sub(REPETITION_WINDOW)..];
    if !window.is_empty() {
        let mut kind_counts: HashMap<&str, usize> = HashMap::new();
        for action in window {
            *kind_counts.entry(action.kind.as_str()).or_default() += 1;
        }
        if kind_counts.values().any(|count| *count >= REPETITION_TRIGGER) {
            learnings.push("Consider action diversity".to_string());
        }
    }
    learnings
}

fn per_tool_rates(actions: &[Action], outcomes: &[Outcome]) -> HashMap<String, (usize, usize)> {
    let tool_by_action: HashMap<&str, &str> = actions
        .iter()
        .map(|action| (action.id.as_str(), action.tool.as_str()))
        .collect();

    let mut rates: HashMap<String, (usize, usize)> = HashMap::new();
    for outcome in outcomes {
        let Some(tool) = tool_by_action.get(outcome.action_id.as_str()) else {
            continue;
        };
        let entry = rates.entry(tool.to_string()).or_default();
        if outcome.success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }
    rates
}

fn summarize_actions(actions: &[Action]) -> String {
    if actions.is_empty() {
        return "no actions yet".to_string();
    }
    actions
        .iter()
        .map(|action| format!("{} via {}", action.kind, action.tool))
        .collect::<Vec<_>>()
        .join("; ")
}

fn summarize_outcomes(outcomes: &[Outcome]) -> String {
    if outcomes.is_empty() {
        return "no outcomes yet".to_string();
    }
    let successes = outcomes.iter().filter(|outcome| outcome.success).count();
    format!("{successes}/{} succeeded", outcomes.len())
}

fn focus_for_phase(phase: Phase) -> String {
    match phase {
        Phase::Planning => "Finalize the research plan".to_string(),
        Phase::Gathering => "Focus on gathering diverse sources".to_string(),
        Phase::Analyzing => "Focus on extracting facts from gathered content".to_string(),
        Phase::Synthesizing => "Focus on synthesis phase".to_string(),
        Phase::Verifying => "Focus on verifying key claims".to_string(),
        Phase::Completed => "Wrap up and report".to_string(),
    }
}

// ── Memory-side analyzer ─────────────────────────────────────────────────────

/// Consolidation fires when episodic memory reaches this size…
const CONSOLIDATION_EPISODE_THRESHOLD: usize = 50;

/// …or semantic memory reaches this one.
const CONSOLIDATION_FACT_THRESHOLD: usize = 200;

/// Read-only analyses over accumulated memory, plus the consolidation
/// trigger.  None of these have control-flow side effects on the loop.
pub struct ReflectionEngine;

impl ReflectionEngine {
    /// Frequency of topics across a session's episodes.
    pub async fn analyze_topic_patterns(
        memory: &MemorySystem,
        session_id: &str,
    ) -> Result<Vec<(String, usize)>> {
        let episodes = memory.episodic.session_episodes(session_id).await?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for episode in &episodes {
            for tag in &episode.tags {
                *counts.entry(tag.clone()).or_default() += 1;
            }
        }
        let mut patterns: Vec<(String, usize)> = counts.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(patterns)
    }

    /// Strategies ranked by observed success, most effective first.
    pub async fn analyze_strategy_effectiveness(
        memory: &MemorySystem,
    ) -> Result<Vec<(String, f32, u64)>> {
        let strategies = memory.docs().list_strategies().await?;
        Ok(strategies
            .into_iter()
            .map(|strategy| {
                (strategy.strategy_name, strategy.success_rate, strategy.times_used)
            })
            .collect())
    }

    /// Open questions plus fact categories that look under-populated.
    pub async fn identify_knowledge_gaps(
        memory: &MemorySystem,
        state: &AgentState,
    ) -> Result<Vec<String>> {
        let mut gaps: Vec<String> =
            state.working_memory.open_questions.iter().cloned().collect();

        let facts = memory.docs().all_facts().await?;
        let mut by_category: HashMap<&str, usize> = HashMap::new();
        for fact in &facts {
            *by_category.entry(fact.category.as_str()).or_default() += 1;
        }
        for (category, count) in by_category {
            if count < 2 {
                gaps.push(format!("thin coverage in category '{category}'"));
            }
        }
        Ok(gaps)
    }

    /// Describe how the newest reflection moved relative to the previous one.
    pub fn compare_with_previous(current: &Reflection, previous: &Reflection) -> String {
        let delta = current.strategy_evaluation.effectiveness
            - previous.strategy_evaluation.effectiveness;
        let direction = if delta > 0.05 {
            "improving"
        } else if delta < -0.05 {
            "regressing"
        } else {
            "holding steady"
        };
        format!(
            "effectiveness {direction} ({:.2} → {:.2}); on-track {} → {}",
            previous.strategy_evaluation.effectiveness,
            current.strategy_evaluation.effectiveness,
            previous.progress_assessment.is_on_track,
            current.progress_assessment.is_on_track,
        )
    }

    /// Kick off maintenance when memory pressure crosses the documented
    /// thresholds.  Returns whether consolidation ran.
    pub async fn trigger_consolidation_if_needed(memory: &MemorySystem) -> Result<bool> {
        let (episodes, facts) = memory.memory_pressure().await?;
        if episodes >= CONSOLIDATION_EPISODE_THRESHOLD || facts >= CONSOLIDATION_FACT_THRESHOLD {
            memory.perform_maintenance().await?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use delver_llm::{Completion, ContentBlock, LlmError, StopReason, Usage};
    use delver_memory::{
        ActionKind, ActionParams, Complexity, Goal, Progress, ResearchPlan, WorkingMemory,
    };

    use super::*;
    use crate::plan::fallback_plan;

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion {
                content: vec![ContentBlock::Text { text: self.0.clone() }],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            })
        }
    }

    fn reflection_under_test(interval: u32, max_iterations: u32) -> AgentReflection {
        AgentReflection::new(
            Arc::new(ScriptedLlm("- try a vertical search engine".to_string())),
            interval,
            max_iterations,
        )
    }

    fn state_with(plan: ResearchPlan, iteration_count: u32) -> AgentState {
        AgentState {
            goal: Goal::new("study agent memory", &["done"], Complexity::Moderate),
            plan,
            progress: Progress::default(),
            working_memory: WorkingMemory::default(),
            reflections: Vec::new(),
            iteration_count,
            last_action_at: None,
        }
    }

    fn action(kind: ActionKind, tool: &str, id: &str) -> Action {
        Action {
            id: id.to_string(),
            session_id: "s".to_string(),
            kind,
            tool: tool.to_string(),
            params: ActionParams::Empty,
            reasoning: String::new(),
            strategy: None,
            timestamp: Utc::now(),
        }
    }

    fn outcome(action_id: &str, success: bool) -> Outcome {
        Outcome {
            action_id: action_id.to_string(),
            success,
            result: None,
            error: None,
            observations: Vec::new(),
            duration_ms: 1,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn interval_trigger_counts_from_last_reflection() {
        let gate = reflection_under_test(5, 100);
        let mut state = state_with(fallback_plan(), 4);
        state.progress.confidence = 0.8;
        assert!(gate.should_reflect(&state).is_none());

        state.iteration_count = 5;
        assert_eq!(gate.should_reflect(&state), Some(ReflectTrigger::Interval));
    }

    #[test]
    fn failure_streak_and_low_confidence_trigger_early() {
        let gate = reflection_under_test(50, 1000);
        let mut state = state_with(fallback_plan(), 4);
        state.progress.confidence = 0.8;
        for i in 0..5 {
            state.working_memory.recent_outcomes.push(outcome(&format!("a{i}"), i >= 3));
        }
        assert_eq!(gate.should_reflect(&state), Some(ReflectTrigger::ConsecutiveFailures));

        let mut state = state_with(fallback_plan(), 3);
        state.progress.confidence = 0.3;
        assert_eq!(gate.should_reflect(&state), Some(ReflectTrigger::LowConfidence));

        // Low confidence alone is not enough before iteration 3.
        state.iteration_count = 2;
        assert!(gate.should_reflect(&state).is_none());
    }

    #[test]
    fn approaching_iteration_limit_triggers() {
        let gate = reflection_under_test(50, 10);
        let mut state = state_with(fallback_plan(), 8);
        state.progress.confidence = 0.9;
        assert_eq!(gate.should_reflect(&state), Some(ReflectTrigger::ApproachingLimit));

        state.progress.current_phase = Phase::Completed;
        assert!(gate.should_reflect(&state).is_none());
    }

    #[tokio::test]
    async fn reflect_assembles_assessment_and_learnings() {
        let mut gate = reflection_under_test(5, 100);
        let mut state = state_with(fallback_plan(), 5);
        state.progress.steps_completed = 2;
        state.progress.steps_total = 5;
        state.progress.confidence = 0.75;
        state.progress.sources_gathered = 6;

        for i in 0..3 {
            let id = format!("a{i}");
            state
                .working_memory
                .recent_actions
                .push(action(ActionKind::Search, "web_search", &id));
            state.working_memory.recent_outcomes.push(outcome(&id, true));
        }

        let reflection = gate.reflect("s1", &state).await;
        assert_eq!(reflection.iteration, 5);
        assert!(reflection.progress_assessment.is_on_track);
        assert!(reflection
            .progress_assessment
            .achievements
            .iter()
            .any(|achievement| achievement.contains("6 sources")));
        assert_eq!(
            reflection.strategy_evaluation.recommendation,
            RecommendationKind::Continue
        );
        assert!(reflection
            .learnings
            .iter()
            .any(|learning| learning.contains("web_search is effective")));
        assert!(!reflection.should_replan);
        assert_eq!(reflection.strategy_evaluation.alternatives.len(), 1);

        // The gate now counts from iteration 5.
        state.iteration_count = 9;
        assert!(gate.should_reflect(&state).is_none());
    }

    #[tokio::test]
    async fn failing_run_recommends_change_and_replan() {
        let mut gate = reflection_under_test(5, 100);
        let mut state = state_with(fallback_plan(), 5);
        state.progress.confidence = 0.3;

        for i in 0..4 {
            let id = format!("a{i}");
            state
                .working_memory
                .recent_actions
                .push(action(ActionKind::Search, "web_search", &id));
            state.working_memory.recent_outcomes.push(outcome(&id, false));
        }

        let reflection = gate.reflect("s1", &state).await;
        assert!(!reflection.progress_assessment.is_on_track);
        assert_eq!(
            reflection.strategy_evaluation.recommendation,
            RecommendationKind::Change
        );
        assert!(reflection.should_replan);
        assert!(reflection
            .progress_assessment
            .blockers
            .iter()
            .any(|blocker| blocker.contains("failures")));
        assert!(reflection
            .learnings
            .iter()
            .any(|learning| learning.contains("needs improvement")));
        // 4 searches in the last 6 actions → repetition flag.
        assert!(reflection.learnings.contains(&"Consider action diversity".to_string()));

        let applied = gate.apply_reflection(&reflection);
        assert!(applied.should_replan);
        assert_eq!(applied.strategy_recommendation, RecommendationKind::Change);
    }

    #[test]
    fn comparison_reports_direction() {
        let mut earlier = Reflection {
            id: new_id(),
            session_id: "s".to_string(),
            iteration: 5,
            timestamp: Utc::now(),
            actions_summary: String::new(),
            outcomes_summary: String::new(),
            progress_assessment: ProgressAssessment {
                progress_rate: 0.2,
                estimated_completion: 10.0,
                is_on_track: false,
                blockers: Vec::new(),
                achievements: Vec::new(),
            },
            strategy_evaluation: StrategyEvaluation {
                effectiveness: 0.4,
                recommendation: RecommendationKind::Adjust,
                strengths: Vec::new(),
                weaknesses: Vec::new(),
                alternatives: Vec::new(),
            },
            learnings: Vec::new(),
            should_replan: false,
            adjustments: Vec::new(),
            next_focus: String::new(),
        };
        let mut later = earlier.clone();
        later.strategy_evaluation.effectiveness = 0.8;
        later.progress_assessment.is_on_track = true;

        let summary = ReflectionEngine::compare_with_previous(&later, &earlier);
        assert!(summary.contains("improving"));

        earlier.strategy_evaluation.effectiveness = 0.9;
        let summary = ReflectionEngine::compare_with_previous(&later, &earlier);
        assert!(summary.contains("regressing"));
    }
}
