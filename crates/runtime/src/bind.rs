//! Loop-side parameter binding.
//!
//! The reasoner proposes abstract actions; this module fills the concrete
//! [`ActionParams`] variant out of working memory right before dispatch.
//! When nothing valid can be bound the action fails with a validation
//! error — no exception escapes into the loop.

use std::collections::HashSet;

use serde_json::json;

use delver_memory::{ActionKind, ActionParams, ActionResult, Goal, WorkingMemory};

/// Open questions folded into a derived search query.
const QUESTIONS_IN_QUERY: usize = 2;

/// Search results fetched per query.
const DEFAULT_MAX_RESULTS: u32 = 5;

/// Characters of concatenated content handed to the analyzer.
const MAX_ANALYZE_CHARS: usize = 8000;

/// Bind parameters for `kind` from the goal and working memory.  `Err`
/// carries the human-readable validation failure.
pub fn bind_params(
    kind: ActionKind,
    goal: &Goal,
    working_memory: &WorkingMemory,
) -> Result<ActionParams, String> {
    match kind {
        ActionKind::Search => {
            let mut query = goal.description.clone();
            for question in working_memory.open_questions.iter().rev().take(QUESTIONS_IN_QUERY) {
                query.push(' ');
                query.push_str(question);
            }
            Ok(ActionParams::Search { query, max_results: DEFAULT_MAX_RESULTS })
        }

        ActionKind::Fetch => {
            let fetched: HashSet<&str> = working_memory
                .recent_outcomes
                .iter()
                .filter_map(|outcome| match &outcome.result {
                    Some(ActionResult::Fetch { url, .. }) => Some(url.as_str()),
                    _ => None,
                })
                .collect();

            let next_url = working_memory
                .recent_outcomes
                .iter()
                .filter_map(|outcome| match &outcome.result {
                    Some(ActionResult::Search { results }) => Some(results),
                    _ => None,
                })
                .flatten()
                .map(|result| result.url.as_str())
                .find(|url| !fetched.contains(url));

            match next_url {
                Some(url) => Ok(ActionParams::Fetch { url: url.to_string() }),
                None => Err("no unfetched search-result URL available".to_string()),
            }
        }

        ActionKind::Analyze | ActionKind::Extract => {
            let mut content = String::new();
            for outcome in &working_memory.recent_outcomes {
                match &outcome.result {
                    Some(ActionResult::Fetch { content: body, .. }) => {
                        content.push_str(body);
                        content.push('\n');
                    }
                    Some(ActionResult::Search { results }) => {
                        for result in results {
                            content.push_str(&result.snippet);
                            content.push('\n');
                        }
                    }
                    _ => {}
                }
                if content.len() >= MAX_ANALYZE_CHARS {
                    break;
                }
            }
            if content.trim().is_empty() {
                return Err("no fetched content or search snippets to analyze".to_string());
            }
            if content.len() > MAX_ANALYZE_CHARS {
                let mut cut = MAX_ANALYZE_CHARS;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
            Ok(ActionParams::Analyze { content, focus: Some(goal.description.clone()) })
        }

        ActionKind::Synthesize => Ok(ActionParams::Synthesize {
            sources: working_memory
                .key_findings
                .iter()
                .map(|finding| finding.content.clone())
                .collect(),
            style: None,
        }),

        ActionKind::Verify => {
            let claims: Vec<String> = working_memory
                .key_findings
                .iter()
                .filter(|finding| {
                    finding.verification == delver_memory::VerificationStatus::Unverified
                })
                .map(|finding| finding.content.clone())
                .collect();
            if claims.is_empty() {
                return Err("no unverified findings to check".to_string());
            }
            Ok(ActionParams::Verify { claims })
        }

        ActionKind::Reflect | ActionKind::Replan => Ok(ActionParams::Empty),
    }
}

/// Flatten bound params into the JSON object shape tools validate against.
pub fn params_to_input(params: &ActionParams) -> serde_json::Value {
    match params {
        ActionParams::Search { query, max_results } => {
            json!({"query": query, "max_results": max_results})
        }
        ActionParams::Fetch { url } => json!({"url": url}),
        ActionParams::Analyze { content, focus } => json!({"content": content, "focus": focus}),
        ActionParams::Synthesize { sources, style } => {
            json!({"sources": sources, "style": style})
        }
        ActionParams::Verify { claims } => json!({"claims": claims}),
        ActionParams::Empty => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use delver_memory::{
        Complexity, Finding, Outcome, SearchResultItem, SourceKind, SourceRef,
        VerificationStatus,
    };
    use std::collections::HashMap;

    use super::*;

    fn goal() -> Goal {
        Goal::new("rust agent ecosystems", &["done"], Complexity::Simple)
    }

    fn outcome_with(result: ActionResult) -> Outcome {
        Outcome {
            action_id: "a".to_string(),
            success: true,
            result: Some(result),
            error: None,
            observations: Vec::new(),
            duration_ms: 1,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn search_results(urls: &[&str]) -> ActionResult {
        ActionResult::Search {
            results: urls
                .iter()
                .map(|url| SearchResultItem {
                    title: format!("page {url}"),
                    url: url.to_string(),
                    snippet: format!("snippet about {url}"),
                })
                .collect(),
        }
    }

    fn finding(content: &str, verification: VerificationStatus) -> Finding {
        Finding {
            id: "f".to_string(),
            content: content.to_string(),
            source: SourceRef {
                url: "https://example.org".to_string(),
                title: "example".to_string(),
                kind: SourceKind::Webpage,
                credibility: None,
            },
            confidence: 0.8,
            relevance: 0.8,
            timestamp: Utc::now(),
            verification,
            related_findings: Vec::new(),
        }
    }

    #[test]
    fn search_query_folds_in_recent_open_questions() {
        let mut wm = WorkingMemory::default();
        wm.open_questions.push("what about wasm tools".to_string());
        wm.open_questions.push("how does memory decay".to_string());

        let params = bind_params(ActionKind::Search, &goal(), &wm).unwrap();
        match params {
            ActionParams::Search { query, max_results } => {
                assert!(query.starts_with("rust agent ecosystems"));
                assert!(query.contains("how does memory decay"));
                assert_eq!(max_results, DEFAULT_MAX_RESULTS);
            }
            other => panic!("expected search params, got {other:?}"),
        }
    }

    #[test]
    fn fetch_picks_the_first_unfetched_url() {
        let mut wm = WorkingMemory::default();
        wm.recent_outcomes.push(outcome_with(search_results(&["https://a", "https://b"])));
        wm.recent_outcomes.push(outcome_with(ActionResult::Fetch {
            url: "https://a".to_string(),
            content: "body".to_string(),
        }));

        let params = bind_params(ActionKind::Fetch, &goal(), &wm).unwrap();
        assert_eq!(params, ActionParams::Fetch { url: "https://b".to_string() });
    }

    #[test]
    fn fetch_without_candidates_is_a_validation_error() {
        let error = bind_params(ActionKind::Fetch, &goal(), &WorkingMemory::default()).unwrap_err();
        assert!(error.contains("no unfetched"));
    }

    #[test]
    fn analyze_concatenates_fetched_content_and_snippets() {
        let mut wm = WorkingMemory::default();
        wm.recent_outcomes.push(outcome_with(search_results(&["https://a"])));
        wm.recent_outcomes.push(outcome_with(ActionResult::Fetch {
            url: "https://a".to_string(),
            content: "fetched body".to_string(),
        }));

        let params = bind_params(ActionKind::Analyze, &goal(), &wm).unwrap();
        match params {
            ActionParams::Analyze { content, focus } => {
                assert!(content.contains("fetched body"));
                assert!(content.contains("snippet about https://a"));
                assert_eq!(focus.as_deref(), Some("rust agent ecosystems"));
            }
            other => panic!("expected analyze params, got {other:?}"),
        }

        let error = bind_params(ActionKind::Analyze, &goal(), &WorkingMemory::default()).unwrap_err();
        assert!(error.contains("to analyze"));
    }

    #[test]
    fn analyze_truncation_respects_char_boundaries() {
        let mut wm = WorkingMemory::default();
        wm.recent_outcomes.push(outcome_with(ActionResult::Fetch {
            url: "https://a".to_string(),
            content: "é".repeat(9000),
        }));

        let params = bind_params(ActionKind::Analyze, &goal(), &wm).unwrap();
        match params {
            ActionParams::Analyze { content, .. } => {
                assert!(content.len() <= MAX_ANALYZE_CHARS);
                assert!(content.chars().all(|c| c == 'é' || c == '\n'));
            }
            other => panic!("expected analyze params, got {other:?}"),
        }
    }

    #[test]
    fn synthesize_passes_key_findings_as_sources() {
        let mut wm = WorkingMemory::default();
        wm.key_findings.push(finding("agents use episodic memory", VerificationStatus::Verified));

        let params = bind_params(ActionKind::Synthesize, &goal(), &wm).unwrap();
        assert_eq!(
            params,
            ActionParams::Synthesize {
                sources: vec!["agents use episodic memory".to_string()],
                style: None,
            }
        );
    }

    #[test]
    fn verify_targets_only_unverified_findings() {
        let mut wm = WorkingMemory::default();
        wm.key_findings.push(finding("checked already", VerificationStatus::Verified));
        wm.key_findings.push(finding("still dubious", VerificationStatus::Unverified));

        let params = bind_params(ActionKind::Verify, &goal(), &wm).unwrap();
        assert_eq!(params, ActionParams::Verify { claims: vec!["still dubious".to_string()] });

        let mut wm = WorkingMemory::default();
        wm.key_findings.push(finding("checked already", VerificationStatus::Verified));
        assert!(bind_params(ActionKind::Verify, &goal(), &wm).is_err());
    }

    #[test]
    fn params_flatten_into_tool_input_objects() {
        let input = params_to_input(&ActionParams::Search {
            query: "q".to_string(),
            max_results: 5,
        });
        assert_eq!(input["query"], "q");
        assert_eq!(input["max_results"], 5);

        assert_eq!(params_to_input(&ActionParams::Empty), json!({}));
    }
}
