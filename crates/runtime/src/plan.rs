//! Research plan creation.
//!
//! Plans come from the LLM when possible and from a hard-coded
//! gather→analyze→synthesize skeleton when not.  A replan always produces a
//! fresh plan; the old one is discarded wholesale.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use delver_llm::{CompletionRequest, LlmClient, extract_json_output, extract_text};
use delver_memory::{
    ActionKind, Goal, PlannedStep, ResearchPlan, StepStatus, RankedStrategy, new_id,
};
use delver_tools::ToolSpec;

/// Strategy name used when no better recommendation exists.
pub const GENERAL_RESEARCH: &str = "general-research";

/// Fallback plan duration estimate.
const FALLBACK_DURATION_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanOutput {
    #[serde(default)]
    steps: Vec<PlanStepOutput>,
    #[serde(default)]
    estimated_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanStepOutput {
    description: String,
    action: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    expected_outcome: Option<String>,
}

/// Build the planning prompt and parse the LLM's step list; fall back to
/// the fixed five-step plan on any failure.
pub async fn create_plan(
    llm: &Arc<dyn LlmClient>,
    goal: &Goal,
    recommendations: &[RankedStrategy],
    available_tools: &[ToolSpec],
) -> ResearchPlan {
    let prompt = planning_prompt(goal, recommendations, available_tools);

    let parsed = match llm.complete(CompletionRequest::from_prompt(prompt)).await {
        Ok(completion) => {
            let raw = extract_text(&completion);
            extract_json_output::<PlanOutput>(&raw)
        }
        Err(error) => {
            warn!(%error, "planning LLM call failed — using fallback plan");
            None
        }
    };

    let strategy = recommendations
        .first()
        .map(|recommendation| recommendation.strategy.strategy_name.clone())
        .unwrap_or_else(|| GENERAL_RESEARCH.to_string());

    match parsed {
        Some(output) if !output.steps.is_empty() => {
            match assemble_plan(output, strategy.clone()) {
                Some(plan) => plan,
                None => {
                    warn!("LLM plan had dependency cycles — using fallback plan");
                    fallback_plan()
                }
            }
        }
        _ => {
            debug!("unusable planning output — using fallback plan");
            fallback_plan()
        }
    }
}

fn planning_prompt(
    goal: &Goal,
    recommendations: &[RankedStrategy],
    available_tools: &[ToolSpec],
) -> String {
    let mut prompt = format!(
        "Plan a research run.\n\nGOAL: {description}\nSUCCESS CRITERIA:\n{criteria}\n",
        description = goal.description,
        criteria = goal
            .success_criteria
            .iter()
            .map(|criterion| format!("- {criterion}"))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    if !goal.constraints.is_empty() {
        prompt.push_str(&format!(
            "CONSTRAINTS:\n{}\n",
            goal.constraints
                .iter()
                .map(|constraint| format!("- {constraint}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ));
    }
    prompt.push_str(&format!(
        "ESTIMATED COMPLEXITY: {:?}\n",
        goal.estimated_complexity
    ));

    if !recommendations.is_empty() {
        prompt.push_str("\nRECOMMENDED STRATEGIES:\n");
        for recommendation in recommendations {
            prompt.push_str(&format!("- {}\n", recommendation.reasoning));
        }
    }

    prompt.push_str("\nAVAILABLE TOOLS:\n");
    for tool in available_tools {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }

    prompt.push_str(
        "\nAim for 5-8 steps moving gather → analyze → synthesize.  Respond \
         only with valid JSON:\n\
         {\"steps\":[{\"description\":\"...\",\"action\":\"<tool or action type>\",\
         \"dependencies\":[],\"expectedOutcome\":\"...\"}],\"estimatedDuration\":600}\n",
    );
    prompt
}

fn assemble_plan(output: PlanOutput, strategy: String) -> Option<ResearchPlan> {
    let steps: Vec<PlannedStep> = output
        .steps
        .into_iter()
        .enumerate()
        .map(|(index, step)| PlannedStep {
            id: format!("step-{}", index + 1),
            description: step.description,
            action: step.action,
            dependencies: step.dependencies,
            status: StepStatus::Pending,
            expected_outcome: step.expected_outcome,
        })
        .collect();

    if has_dependency_cycle(&steps) {
        return None;
    }

    Some(ResearchPlan {
        id: new_id(),
        strategy,
        steps,
        estimated_duration_secs: output.estimated_duration.unwrap_or(FALLBACK_DURATION_SECS),
        created_at: Utc::now(),
        revised_at: None,
        revision_reason: None,
    })
}

/// The hard-coded plan used when planning itself fails.
pub fn fallback_plan() -> ResearchPlan {
    let actions = [
        ("Search for sources on the topic", ActionKind::Search),
        ("Fetch the most promising source", ActionKind::Fetch),
        ("Analyze gathered content for facts", ActionKind::Analyze),
        ("Search for gaps uncovered by analysis", ActionKind::Search),
        ("Synthesize findings into a result", ActionKind::Synthesize),
    ];
    ResearchPlan {
        id: new_id(),
        strategy: GENERAL_RESEARCH.to_string(),
        steps: actions
            .iter()
            .enumerate()
            .map(|(index, (description, kind))| PlannedStep {
                id: format!("step-{}", index + 1),
                description: description.to_string(),
                action: kind.as_str().to_string(),
                dependencies: if index == 0 {
                    Vec::new()
                } else {
                    vec![format!("step-{index}")]
                },
                status: StepStatus::Pending,
                expected_outcome: None,
            })
            .collect(),
        estimated_duration_secs: FALLBACK_DURATION_SECS,
        created_at: Utc::now(),
        revised_at: None,
        revision_reason: None,
    }
}

/// Kahn toposort over step dependencies; unknown dependency ids are ignored.
fn has_dependency_cycle(steps: &[PlannedStep]) -> bool {
    let ids: HashSet<&str> = steps.iter().map(|step| step.id.as_str()).collect();
    let mut indegree: HashMap<&str, usize> = steps.iter().map(|step| (step.id.as_str(), 0)).collect();
    for step in steps {
        for dependency in &step.dependencies {
            if ids.contains(dependency.as_str()) {
                *indegree.get_mut(step.id.as_str()).expect("step is present") += 1;
            }
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = ready.pop() {
        visited += 1;
        for step in steps {
            if step.dependencies.iter().any(|dependency| dependency == id) {
                let degree = indegree.get_mut(step.id.as_str()).expect("step is present");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(step.id.as_str());
                }
            }
        }
    }
    visited != steps.len()
}

/// Mark the first pending step matching the executed tool or action kind.
/// Returns `true` when a step was completed.
pub fn mark_step(plan: &mut ResearchPlan, tool: &str, kind: ActionKind, success: bool) -> bool {
    let Some(step) = plan.steps.iter_mut().find(|step| {
        step.status == StepStatus::Pending
            && (step.action == tool || step.action == kind.as_str())
    }) else {
        return false;
    };
    step.status = if success { StepStatus::Completed } else { StepStatus::Failed };
    success
}
