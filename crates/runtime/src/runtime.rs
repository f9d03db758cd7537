//! The control loop: plan → reason → act → observe → store → reflect.
//!
//! One research run is a single cooperative task.  Every failure inside an
//! iteration becomes a failed [`Outcome`] and a learning; only cancellation
//! and invariant violations end the run early, and even those return a
//! clean [`ExecutionReport`] rather than an error.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use delver_config::AppConfig;
use delver_llm::{CancelToken, LlmClient};
use delver_memory::{
    Action, ActionKind, ActionResult, AgentState, CandidateFact, ContextBudget, Finding, Goal,
    MemoryContext, MemorySystem, Outcome, Phase, Progress, SessionStatus, SourceKind, SourceRef,
    VerificationStatus, WorkingMemory, new_id,
};
use delver_thinker::ReasoningEngine;
use delver_tools::{ToolContext, ToolRegistry, ToolResult};

use crate::bind::{bind_params, params_to_input};
use crate::plan::{create_plan, mark_step};
use crate::reflection::AgentReflection;
use crate::report::{ExecutionReport, ResearchResult};

/// Strategy recommendations pulled per planning / reasoning step.
const TOP_RECOMMENDATIONS: usize = 3;

/// Reasoning confidence below this caps overall progress confidence.
const CONFIDENCE_DRAG_FLOOR: f32 = 0.3;

pub struct AgentRuntime {
    config: AppConfig,
    memory: MemorySystem,
    reasoner: ReasoningEngine,
    tools: ToolRegistry,
    llm: Arc<dyn LlmClient>,
    cancel: CancelToken,
}

impl AgentRuntime {
    pub fn new(
        config: AppConfig,
        memory: MemorySystem,
        tools: ToolRegistry,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            config,
            memory,
            reasoner: ReasoningEngine::new(Arc::clone(&llm)),
            tools,
            llm,
            cancel: CancelToken::new(),
        }
    }

    /// Handle for cancelling the run from outside the loop task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn memory(&self) -> &MemorySystem {
        &self.memory
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    /// Execute one research run.  Never returns an error: every failure is
    /// folded into the report.
    pub async fn research(&mut self, topic: &str, goal: Goal) -> ExecutionReport {
        let started = Instant::now();
        let mut iterations = 0u32;
        let mut reflections = 0u32;

        match self.run(topic, goal, started, &mut iterations, &mut reflections).await {
            Ok(report) => report,
            Err(run_error) => {
                error!(%run_error, iterations, "research run aborted");
                if self.memory.current_session().is_some() {
                    if let Err(close_error) =
                        self.memory.close_session(SessionStatus::Failed).await
                    {
                        warn!(%close_error, "failed to close session after abort");
                    }
                }
                ExecutionReport::failed(run_error.to_string(), iterations, reflections)
            }
        }
    }

    async fn run(
        &mut self,
        topic: &str,
        goal: Goal,
        started: Instant,
        iterations: &mut u32,
        reflections: &mut u32,
    ) -> Result<ExecutionReport> {
        self.memory.initialize().await?;
        let session = self.memory.start_session(topic, goal.clone(), None).await?;
        let session_id = session.id.clone();
        let context_query = format!("{topic} {}", goal.description);

        // Initial plan.
        let recommendations = self.recommendations(&context_query).await;
        let plan =
            create_plan(&self.llm, &goal, &recommendations, &self.tools.enabled_tools()).await;
        info!(session = %session_id, plan = %plan.id, strategy = %plan.strategy, "research started");

        let mut state = AgentState {
            goal,
            progress: Progress { steps_total: plan.steps.len() as u32, ..Default::default() },
            plan,
            working_memory: WorkingMemory::default(),
            reflections: Vec::new(),
            iteration_count: 0,
            last_action_at: None,
        };

        let mut gate = AgentReflection::new(
            Arc::clone(&self.llm),
            self.config.agent.reflection_interval,
            self.config.agent.max_iterations,
        );

        let mut should_continue = true;
        let mut pending_replan = false;
        let mut total_actions = 0u32;

        while should_continue && state.iteration_count < self.config.agent.max_iterations {
            if self.cancel.is_cancelled() {
                return self.cancelled(&state, iterations, reflections).await;
            }
            state.iteration_count += 1;
            *iterations = state.iteration_count;
            state.last_action_at = Some(Utc::now());

            // Reflection gate: memory's action counter or the loop-side
            // triggers, whichever fires first.
            if self.config.agent.enable_auto_reflection {
                let memory_requests = self.memory.should_reflect();
                let trigger = gate.should_reflect(&state);
                if memory_requests || trigger.is_some() {
                    debug!(iteration = state.iteration_count, ?trigger, "reflecting");
                    let reflection = gate.reflect(&session_id, &state).await;
                    let applied = gate.apply_reflection(&reflection);
                    pending_replan |= applied.should_replan;
                    state.reflections.push(reflection);
                    *reflections = state.reflections.len() as u32;
                    self.memory.reset_reflection_counter();
                }
            }

            // Context + recommendations feed the reasoner.  Both are
            // best-effort: an empty context is valid input.
            let memory_context = match self
                .memory
                .build_context(
                    &context_query,
                    &ContextBudget::with_max_tokens(self.config.agent.max_context_tokens),
                )
                .await
            {
                Ok(context) => context,
                Err(build_error) => {
                    warn!(%build_error, "context build failed — reasoning without memory");
                    MemoryContext::default()
                }
            };
            let recommendations = self.recommendations(&context_query).await;

            let reasoning = self
                .reasoner
                .reason(
                    &state.goal,
                    &state.progress,
                    &state.working_memory,
                    &self.tools.enabled_tools(),
                    &memory_context,
                    &recommendations,
                    &session_id,
                )
                .await?;

            // A decision the reasoner itself barely believes caps overall
            // confidence; the observe step reads the dip.
            if reasoning.confidence < CONFIDENCE_DRAG_FLOOR {
                state.progress.confidence =
                    state.progress.confidence.min(reasoning.confidence);
            }

            let mut action = reasoning.selected_action;

            // Parameter binding is loop-side; a bind failure is a failed
            // outcome, never an exception.
            let outcome = match bind_params(action.kind, &state.goal, &state.working_memory) {
                Ok(params) => {
                    action.params = params;
                    if self.cancel.is_cancelled() {
                        return self.cancelled(&state, iterations, reflections).await;
                    }
                    let input = params_to_input(&action.params);
                    let tool_started = Instant::now();
                    let result = self
                        .tools
                        .execute_tool(&action.tool, input, &ToolContext::for_session(&session_id))
                        .await;
                    compose_outcome(&action, result, tool_started.elapsed().as_millis() as u64)
                }
                Err(bind_error) => {
                    debug!(tool = %action.tool, %bind_error, "parameter binding failed");
                    validation_outcome(&action, &bind_error)
                }
            };

            let observation = self
                .reasoner
                .observe(&action, &outcome, &state.goal, &state.progress, &state.working_memory)
                .await?;

            // Append to working memory and harvest findings.
            state.working_memory.recent_actions.push(action.clone());
            state.working_memory.recent_outcomes.push(outcome.clone());
            match &outcome.result {
                Some(ActionResult::Analyze { facts }) => {
                    for fact in facts {
                        state.working_memory.key_findings.push(finding_from_fact(fact));
                    }
                }
                Some(ActionResult::Verify { verdicts }) => {
                    for verdict in verdicts {
                        if !verdict.verified {
                            state
                                .working_memory
                                .open_questions
                                .push(format!("Recheck: {}", verdict.claim));
                        }
                    }
                }
                _ => {}
            }
            state
                .working_memory
                .hypotheses
                .extend(observation.learnings.iter().cloned());

            // Write-back: the episode must be durable before the next
            // iteration reads context.  One retry on store failure.
            let summary = format!(
                "{}: {}. {}",
                action.tool,
                if outcome.success { "succeeded" } else { "failed" },
                observation.learnings.join(" "),
            );
            let phase_tag = format!("{:?}", state.progress.current_phase).to_lowercase();
            let mut stored = self
                .memory
                .store_experience(
                    &session_id,
                    vec![action.clone()],
                    vec![outcome.clone()],
                    state.working_memory.key_findings.clone(),
                    summary.clone(),
                    vec![phase_tag.clone()],
                )
                .await;
            if stored.is_err() {
                warn!("store_experience failed — retrying once");
                stored = self
                    .memory
                    .store_experience(
                        &session_id,
                        vec![action.clone()],
                        vec![outcome.clone()],
                        state.working_memory.key_findings.clone(),
                        summary,
                        vec![phase_tag],
                    )
                    .await;
            }
            if let Err(store_error) = stored {
                warn!(%store_error, "experience lost for this iteration");
            }
            total_actions += 1;

            // Progress update.
            match &outcome.result {
                Some(ActionResult::Search { results }) => {
                    state.progress.sources_gathered += results.len() as u32;
                }
                Some(ActionResult::Analyze { facts }) => {
                    state.progress.facts_extracted += facts.len() as u32;
                }
                _ => {}
            }
            state.progress.confidence = if outcome.success {
                (state.progress.confidence + 0.1).min(1.0)
            } else {
                (state.progress.confidence - 0.05).max(0.0)
            };
            advance_phase(&mut state.progress, &action, &outcome);

            // Plan bookkeeping.
            if mark_step(&mut state.plan, &action.tool, action.kind, outcome.success) {
                state.progress.steps_completed += 1;
            }
            state.progress.steps_total = state.plan.steps.len() as u32;
            state.progress.steps_completed =
                state.progress.steps_completed.min(state.progress.steps_total);

            // Replan discards the old plan wholesale.
            if observation.should_replan || pending_replan {
                pending_replan = false;
                let recommendations = self.recommendations(&context_query).await;
                let new_plan = create_plan(
                    &self.llm,
                    &state.goal,
                    &recommendations,
                    &self.tools.enabled_tools(),
                )
                .await;
                info!(old = %state.plan.id, new = %new_plan.id, "replanned");
                state.plan = new_plan;
                state.progress.steps_completed = 0;
                state.progress.steps_total = state.plan.steps.len() as u32;
            }

            let goal_done = is_goal_complete(&state.progress);
            if goal_done {
                state.progress.current_phase = Phase::Completed;
            }
            should_continue = observation.should_continue && !goal_done;

            state.working_memory.trim(self.config.memory.working_memory_window);
            debug!(
                iteration = state.iteration_count,
                phase = ?state.progress.current_phase,
                confidence = state.progress.confidence,
                sources = state.progress.sources_gathered,
                facts = state.progress.facts_extracted,
                should_continue,
                "iteration finished"
            );
        }

        if self.cancel.is_cancelled() {
            return self.cancelled(&state, iterations, reflections).await;
        }

        // Final reflection uses the same gate, so a reflection that just
        // happened is not duplicated.
        if self.config.agent.enable_auto_reflection
            && (self.memory.should_reflect() || gate.should_reflect(&state).is_some())
        {
            let reflection = gate.reflect(&session_id, &state).await;
            state.reflections.push(reflection);
            *reflections = state.reflections.len() as u32;
            self.memory.reset_reflection_counter();
        }

        let result = self
            .synthesize_result(&state, &session_id, topic, started, total_actions)
            .await;

        // Fold this run into the plan strategy's track record, when the
        // strategy is a stored one.
        let goal_reached = state.progress.current_phase == Phase::Completed;
        if let Ok(strategies) = self.memory.docs().list_strategies().await {
            if let Some(strategy) = strategies
                .iter()
                .find(|strategy| strategy.strategy_name == state.plan.strategy)
            {
                if let Err(use_error) = self
                    .memory
                    .procedural
                    .record_strategy_use(
                        &strategy.id,
                        goal_reached,
                        started.elapsed().as_millis() as u64,
                    )
                    .await
                {
                    warn!(%use_error, "failed to record strategy use");
                }

                // An adjust-leaning reflection leaves a refinement note on
                // the strategy for future runs.
                let adjustment = state
                    .reflections
                    .iter()
                    .rev()
                    .find(|reflection| {
                        reflection.strategy_evaluation.recommendation
                            == delver_memory::StrategyRecommendation::Adjust
                    })
                    .and_then(|reflection| reflection.adjustments.first().cloned());
                if let Some(note) = adjustment {
                    if let Err(refine_error) =
                        self.memory.procedural.add_refinement(&strategy.id, &note).await
                    {
                        warn!(%refine_error, "failed to record strategy refinement");
                    }
                }
            }
        }

        if let Err(close_error) = self.memory.complete_session().await {
            warn!(%close_error, "failed to complete session");
        }

        info!(
            session = %session_id,
            iterations = state.iteration_count,
            reflections = state.reflections.len(),
            confidence = result.confidence,
            "research finished"
        );
        Ok(ExecutionReport {
            success: true,
            result: Some(result),
            error: None,
            iterations: state.iteration_count,
            reflections: state.reflections.len() as u32,
        })
    }

    async fn recommendations(&self, query: &str) -> Vec<delver_memory::RankedStrategy> {
        let available: Vec<String> = self
            .tools
            .enabled_tools()
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        match self
            .memory
            .strategy_recommendations(query, &available, TOP_RECOMMENDATIONS)
            .await
        {
            Ok(recommendations) => recommendations,
            Err(recommendation_error) => {
                warn!(%recommendation_error, "strategy recommendation lookup failed");
                Vec::new()
            }
        }
    }

    async fn cancelled(
        &mut self,
        state: &AgentState,
        iterations: &mut u32,
        reflections: &mut u32,
    ) -> Result<ExecutionReport> {
        warn!(iteration = state.iteration_count, "run cancelled");
        *iterations = state.iteration_count;
        *reflections = state.reflections.len() as u32;
        if let Err(close_error) = self.memory.close_session(SessionStatus::Cancelled).await {
            warn!(%close_error, "failed to close cancelled session");
        }
        Ok(ExecutionReport::failed("cancelled", *iterations, *reflections))
    }

    /// Prefer the synthesize tool; fall back to assembling the result from
    /// accumulated findings when the tool is absent or fails.
    async fn synthesize_result(
        &mut self,
        state: &AgentState,
        session_id: &str,
        topic: &str,
        started: Instant,
        total_actions: u32,
    ) -> ResearchResult {
        let findings = &state.working_memory.key_findings;

        let synthesis_tool = self
            .tools
            .enabled_tools()
            .into_iter()
            .map(|spec| spec.name)
            .find(|name| name.to_lowercase().contains("synth"));

        let synthesis = match synthesis_tool {
            Some(tool_name) => {
                let sources: Vec<String> =
                    findings.iter().map(|finding| finding.content.clone()).collect();
                let input = serde_json::json!({"sources": sources, "style": "report"});
                let result = self
                    .tools
                    .execute_tool(&tool_name, input, &ToolContext::for_session(session_id))
                    .await;
                match result {
                    ToolResult { success: true, data: Some(data), .. } => data
                        .get("synthesis")
                        .and_then(|value| value.as_str())
                        .map(ToString::to_string),
                    ToolResult { error, .. } => {
                        warn!(?error, "synthesis tool failed — using fallback synthesis");
                        None
                    }
                }
            }
            None => None,
        }
        .unwrap_or_else(|| fallback_synthesis(topic, state));

        let mut sources: Vec<String> = Vec::new();
        for finding in findings {
            if !finding.source.url.is_empty() && !sources.contains(&finding.source.url) {
                sources.push(finding.source.url.clone());
            }
        }
        for outcome in &state.working_memory.recent_outcomes {
            if let Some(ActionResult::Fetch { url, .. }) = &outcome.result {
                if !sources.contains(url) {
                    sources.push(url.clone());
                }
            }
        }

        let mut strategies_used = vec![state.plan.strategy.clone()];
        for action in &state.working_memory.recent_actions {
            if let Some(strategy) = &action.strategy {
                if !strategies_used.contains(strategy) {
                    strategies_used.push(strategy.clone());
                }
            }
        }

        let mut successful_approaches = Vec::new();
        let mut challenges = Vec::new();
        let mut suggestions = Vec::new();
        for reflection in &state.reflections {
            for achievement in &reflection.progress_assessment.achievements {
                if !successful_approaches.contains(achievement) {
                    successful_approaches.push(achievement.clone());
                }
            }
            for blocker in &reflection.progress_assessment.blockers {
                if !challenges.contains(blocker) {
                    challenges.push(blocker.clone());
                }
            }
            for adjustment in &reflection.adjustments {
                if !suggestions.contains(adjustment) {
                    suggestions.push(adjustment.clone());
                }
            }
        }

        ResearchResult {
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            goal: state.goal.clone(),
            synthesis,
            key_findings: findings.clone(),
            sources,
            confidence: state.progress.confidence,
            completeness: state.progress.steps_completed as f32
                / state.progress.steps_total.max(1) as f32,
            duration_ms: started.elapsed().as_millis() as u64,
            total_actions,
            total_reflections: state.reflections.len() as u32,
            strategies_used,
            successful_approaches,
            challenges,
            suggestions,
        }
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────────

/// Counter-driven phase transitions, strictly forward.
fn advance_phase(progress: &mut Progress, action: &Action, outcome: &Outcome) {
    let target = if progress.facts_extracted >= 10 {
        Phase::Synthesizing
    } else if progress.sources_gathered >= 5 {
        Phase::Analyzing
    } else {
        Phase::Gathering
    };
    if target.rank() > progress.current_phase.rank() {
        progress.current_phase = target;
    }
    // Verification is optional and slots in only when a verify action lands.
    if action.kind == ActionKind::Verify
        && outcome.success
        && progress.current_phase.rank() < Phase::Verifying.rank()
    {
        progress.current_phase = Phase::Verifying;
    }
}

fn is_goal_complete(progress: &Progress) -> bool {
    progress.current_phase == Phase::Synthesizing
        && progress.confidence >= 0.7
        && progress.facts_extracted >= 10
        && progress.sources_gathered >= 5
}

fn validation_outcome(action: &Action, message: &str) -> Outcome {
    Outcome {
        action_id: action.id.clone(),
        success: false,
        result: None,
        error: Some(format!("Input validation failed: {message}")),
        observations: vec![format!("Failed to execute {}: {message}", action.tool)],
        duration_ms: 0,
        metadata: Default::default(),
        timestamp: Utc::now(),
    }
}

/// Fold a [`ToolResult`] into the iteration's [`Outcome`], including the
/// kind-specific observation lines.
fn compose_outcome(action: &Action, result: ToolResult, duration_ms: u64) -> Outcome {
    let mut observations = Vec::new();
    if result.success {
        observations.push(format!("Successfully executed {}", action.tool));
    } else {
        observations.push(format!(
            "Failed to execute {}: {}",
            action.tool,
            result.error.as_deref().unwrap_or("unknown error"),
        ));
    }

    let parsed = result.data.as_ref().and_then(|data| parse_action_result(action.kind, data));
    match &parsed {
        Some(ActionResult::Search { results }) => {
            observations.push(format!("Found {} results", results.len()));
        }
        Some(ActionResult::Fetch { content, .. }) => {
            observations.push(format!("Fetched content ({} chars)", content.len()));
        }
        Some(ActionResult::Analyze { facts }) => {
            observations.push(format!("Extracted {} facts", facts.len()));
        }
        Some(ActionResult::Synthesize { .. }) => {
            observations.push("Generated synthesis".to_string());
        }
        Some(ActionResult::Verify { verdicts }) => {
            observations.push(format!("Verified {} claims", verdicts.len()));
        }
        _ => {}
    }

    Outcome {
        action_id: action.id.clone(),
        success: result.success,
        result: parsed,
        error: result.error,
        observations,
        duration_ms,
        metadata: Default::default(),
        timestamp: Utc::now(),
    }
}

fn parse_action_result(kind: ActionKind, data: &serde_json::Value) -> Option<ActionResult> {
    let parsed = match kind {
        ActionKind::Search => data
            .get("results")
            .cloned()
            .and_then(|results| serde_json::from_value(results).ok())
            .map(|results| ActionResult::Search { results }),
        ActionKind::Fetch => {
            let url = data.get("url")?.as_str()?.to_string();
            let content = data.get("content")?.as_str()?.to_string();
            Some(ActionResult::Fetch { url, content })
        }
        ActionKind::Analyze | ActionKind::Extract => data
            .get("facts")
            .cloned()
            .and_then(|facts| serde_json::from_value::<Vec<CandidateFact>>(facts).ok())
            .map(|facts| ActionResult::Analyze { facts }),
        ActionKind::Synthesize => data
            .get("synthesis")
            .and_then(|synthesis| synthesis.as_str())
            .map(|synthesis| ActionResult::Synthesize { synthesis: synthesis.to_string() }),
        ActionKind::Verify => data
            .get("verdicts")
            .cloned()
            .and_then(|verdicts| serde_json::from_value(verdicts).ok())
            .map(|verdicts| ActionResult::Verify { verdicts }),
        ActionKind::Reflect | ActionKind::Replan => None,
    };
    parsed.or_else(|| Some(ActionResult::Raw { payload: data.to_string() }))
}

fn finding_from_fact(fact: &CandidateFact) -> Finding {
    Finding {
        id: new_id(),
        content: fact.content.clone(),
        source: SourceRef {
            url: String::new(),
            title: "content analysis".to_string(),
            kind: SourceKind::Other,
            credibility: None,
        },
        confidence: fact.confidence,
        relevance: fact.confidence,
        timestamp: Utc::now(),
        verification: VerificationStatus::Unverified,
        related_findings: Vec::new(),
    }
}

fn fallback_synthesis(topic: &str, state: &AgentState) -> String {
    let findings = &state.working_memory.key_findings;
    if findings.is_empty() {
        return format!(
            "Research on \"{topic}\" ended after {} iterations without durable \
             findings ({} sources gathered).",
            state.iteration_count, state.progress.sources_gathered,
        );
    }
    let bullets = findings
        .iter()
        .map(|finding| format!("- {}", finding.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Research summary for \"{topic}\" ({} sources, {} facts):\n{bullets}",
        state.progress.sources_gathered, state.progress.facts_extracted,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use delver_memory::ActionParams;

    fn action(kind: ActionKind) -> Action {
        Action {
            id: "a1".to_string(),
            session_id: "s1".to_string(),
            kind,
            tool: "tool".to_string(),
            params: ActionParams::Empty,
            reasoning: String::new(),
            strategy: None,
            timestamp: Utc::now(),
        }
    }

    fn success_outcome() -> Outcome {
        Outcome {
            action_id: "a1".to_string(),
            success: true,
            result: None,
            error: None,
            observations: Vec::new(),
            duration_ms: 0,
            metadata: Default::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn phases_never_regress() {
        let mut progress = Progress { facts_extracted: 12, ..Default::default() };
        advance_phase(&mut progress, &action(ActionKind::Analyze), &success_outcome());
        assert_eq!(progress.current_phase, Phase::Synthesizing);

        // Counters dropping back (they cannot, but belt and braces) would
        // still not move the phase backwards.
        progress.facts_extracted = 0;
        progress.sources_gathered = 0;
        advance_phase(&mut progress, &action(ActionKind::Search), &success_outcome());
        assert_eq!(progress.current_phase, Phase::Synthesizing);
    }

    #[test]
    fn verify_actions_enter_the_optional_phase() {
        let mut progress = Progress { sources_gathered: 6, ..Default::default() };
        advance_phase(&mut progress, &action(ActionKind::Verify), &success_outcome());
        assert_eq!(progress.current_phase, Phase::Verifying);

        // Synthesizing still outranks verifying afterwards.
        progress.facts_extracted = 12;
        advance_phase(&mut progress, &action(ActionKind::Analyze), &success_outcome());
        assert_eq!(progress.current_phase, Phase::Synthesizing);
    }

    #[test]
    fn goal_completion_needs_all_four_conditions() {
        let mut progress = Progress {
            current_phase: Phase::Synthesizing,
            confidence: 0.8,
            facts_extracted: 10,
            sources_gathered: 5,
            ..Default::default()
        };
        assert!(is_goal_complete(&progress));

        progress.confidence = 0.6;
        assert!(!is_goal_complete(&progress));
        progress.confidence = 0.8;
        progress.facts_extracted = 9;
        assert!(!is_goal_complete(&progress));
    }

    #[test]
    fn outcome_composition_adds_kind_specific_observations() {
        let result = ToolResult::ok(serde_json::json!({
            "results": [
                {"title": "t", "url": "https://a", "snippet": "s"},
                {"title": "t2", "url": "https://b", "snippet": "s2"}
            ]
        }));
        let outcome = compose_outcome(&action(ActionKind::Search), result, 12);
        assert!(outcome.success);
        assert_eq!(outcome.observations[0], "Successfully executed tool");
        assert_eq!(outcome.observations[1], "Found 2 results");
        assert!(matches!(outcome.result, Some(ActionResult::Search { .. })));
        assert_eq!(outcome.duration_ms, 12);

        let result = ToolResult::failure("socket closed");
        let outcome = compose_outcome(&action(ActionKind::Fetch), result, 3);
        assert!(!outcome.success);
        assert!(outcome.observations[0].contains("Failed to execute tool: socket closed"));
    }

    #[test]
    fn unparseable_data_degrades_to_raw() {
        let result = ToolResult::ok(serde_json::json!({"unexpected": true}));
        let outcome = compose_outcome(&action(ActionKind::Search), result, 1);
        assert!(matches!(outcome.result, Some(ActionResult::Raw { .. })));
    }
}
