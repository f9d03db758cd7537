//! Prompt assembly for the reasoning engine.
//!
//! Owns the block layout so the engine stays focused on option scoring and
//! action mapping.

use delver_memory::{
    Goal, MemoryContext, Progress, RankedStrategy, WorkingMemory,
    format_context_for_prompt,
};
use delver_tools::ToolSpec;

/// Recent actions/outcomes shown to the reasoner.
const RECENT_WINDOW: usize = 5;

pub(crate) fn build_reasoning_prompt(
    goal: &Goal,
    progress: &Progress,
    working_memory: &WorkingMemory,
    available_tools: &[ToolSpec],
    memory_context: &MemoryContext,
    recommendations: &[RankedStrategy],
) -> String {
    let mut prompt = format!(
        "You are the reasoning core of an autonomous research agent.\n\n\
         GOAL: {description}\nSUCCESS CRITERIA:\n{criteria}\n",
        description = goal.description,
        criteria = bullet_list(&goal.success_criteria),
    );
    if !goal.constraints.is_empty() {
        prompt.push_str(&format!("CONSTRAINTS:\n{}\n", bullet_list(&goal.constraints)));
    }

    prompt.push_str(&format!(
        "\nCURRENT PROGRESS:\n\
         - phase: {phase}\n\
         - confidence: {confidence:.2}\n\
         - steps completed: {steps_completed}/{steps_total}\n\
         - sources gathered: {sources}\n\
         - facts extracted: {facts}\n",
        phase = format!("{:?}", progress.current_phase).to_lowercase(),
        confidence = progress.confidence,
        steps_completed = progress.steps_completed,
        steps_total = progress.steps_total,
        sources = progress.sources_gathered,
        facts = progress.facts_extracted,
    ));

    prompt.push_str("\nRECENT ACTIONS:\n");
    let start = working_memory.recent_actions.len().saturating_sub(RECENT_WINDOW);
    if working_memory.recent_actions.is_empty() {
        prompt.push_str("(none yet)\n");
    }
    for action in &working_memory.recent_actions[start..] {
        prompt.push_str(&format!(
            "- {} via {}: {}\n",
            action.kind,
            action.tool,
            truncate_for_prompt(&action.reasoning, 120),
        ));
    }

    prompt.push_str("\nRECENT OUTCOMES:\n");
    let start = working_memory.recent_outcomes.len().saturating_sub(RECENT_WINDOW);
    if working_memory.recent_outcomes.is_empty() {
        prompt.push_str("(none yet)\n");
    }
    for outcome in &working_memory.recent_outcomes[start..] {
        let note = outcome
            .observations
            .first()
            .map(String::as_str)
            .or(outcome.error.as_deref())
            .unwrap_or("no observations");
        prompt.push_str(&format!(
            "- {}: {}\n",
            if outcome.success { "ok" } else { "FAILED" },
            truncate_for_prompt(note, 120),
        ));
    }

    prompt.push_str("\nAVAILABLE TOOLS:\n");
    for tool in available_tools {
        let params = tool
            .params
            .iter()
            .map(|param| {
                if param.required {
                    format!("{}*", param.name)
                } else {
                    param.name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!("- {}: {} [{params}]\n", tool.name, tool.description));
    }

    if !memory_context.is_empty() || !recommendations.is_empty() {
        prompt.push_str("\nRELEVANT PAST EXPERIENCES:\n");
        if !memory_context.is_empty() {
            prompt.push_str(&format_context_for_prompt(memory_context));
            prompt.push('\n');
        }
        for recommendation in recommendations {
            prompt.push_str(&format!("- Recommended: {}\n", recommendation.reasoning));
        }
    }

    prompt.push_str(
        "\nPropose 2-4 candidate next actions.  Respond only with valid JSON:\n\
         {\"options\":[{\"id\":\"opt-1\",\"action\":\"<tool or action type>\",\
         \"rationale\":\"...\",\"expectedBenefit\":\"...\",\"potentialRisks\":[\"...\"],\
         \"estimatedCost\":3,\"confidence\":0.8}]}\n",
    );
    prompt
}

pub(crate) fn build_learning_prompt(
    tool: &str,
    success: bool,
    observations: &[String],
    error: Option<&str>,
    goal: &Goal,
) -> String {
    let detail = if observations.is_empty() {
        error.unwrap_or("no observations").to_string()
    } else {
        observations.join("; ")
    };
    format!(
        "An autonomous research agent pursuing the goal below just ran the \
         tool `{tool}` ({status}).\n\
         GOAL: {goal}\nRESULT: {detail}\n\n\
         List up to 3 short learnings worth carrying forward.  Respond only \
         with valid JSON: {{\"learnings\":[\"...\"]}}",
        status = if success { "successfully" } else { "it failed" },
        goal = truncate_for_prompt(&goal.description, 200),
        detail = truncate_for_prompt(&detail, 400),
    )
}

fn bullet_list(items: &[String]) -> String {
    items.iter().map(|item| format!("- {item}")).collect::<Vec<_>>().join("\n")
}

/// Cap `text` at `max_chars` characters, marking any cut with `…`.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    // nth() lands on the first character past the cap, which is exactly
    // the byte offset to slice at; None means the text already fits.
    match text.char_indices().nth(max_chars) {
        Some((cut_at, _)) => format!("{}…", &text[..cut_at]),
        None => text.to_string(),
    }
}
