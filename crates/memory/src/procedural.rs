//! Procedural memory: named strategies with historical success tracking.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use delver_llm::EmbeddingClient;

use crate::schema::{ActionKind, EpisodicMemory, Strategy, new_id};
use crate::store::DocumentStore;
use crate::vector::{PROCEDURAL_COLLECTION, VectorStore};

/// EWMA weight for blending a fresh observation into `success_rate`.
const SUCCESS_ALPHA: f32 = 0.2;

/// Minimum successful episodes sharing an action sequence before it is
/// worth naming as a strategy.
const MIN_EPISODES_FOR_STRATEGY: usize = 3;

/// Seed statistics for a brand-new strategy.
#[derive(Debug, Clone, Copy)]
pub struct StrategySeed {
    pub success_rate: f32,
    pub average_duration_ms: u64,
}

impl Default for StrategySeed {
    fn default() -> Self {
        Self { success_rate: 0.5, average_duration_ms: 0 }
    }
}

/// One ranked recommendation out of [`ProceduralManager::recommendations`].
#[derive(Debug, Clone)]
pub struct RankedStrategy {
    pub strategy: Strategy,
    pub relevance_score: f32,
    pub reasoning: String,
}

pub struct ProceduralManager {
    docs: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl ProceduralManager {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self { docs, vectors, embedder }
    }

    pub async fn store_strategy(
        &self,
        name: &str,
        description: &str,
        contexts: Vec<String>,
        tools: Vec<String>,
        seed: StrategySeed,
    ) -> Result<Strategy> {
        let strategy = Strategy {
            id: new_id(),
            strategy_name: name.to_string(),
            description: description.to_string(),
            applicable_contexts: contexts,
            required_tools: tools,
            success_rate: seed.success_rate.clamp(0.0, 1.0),
            average_duration_ms: seed.average_duration_ms,
            times_used: 0,
            refinements: Vec::new(),
            created_at: Utc::now(),
            last_used: None,
            last_refined: None,
        };

        self.docs.store_strategy(&strategy).await?;
        let embedding = self.embedder.embed(&strategy_text(&strategy)).await?;
        let mut metadata = HashMap::new();
        metadata.insert("strategy_name".to_string(), strategy.strategy_name.clone());
        self.vectors
            .store_embedding(PROCEDURAL_COLLECTION, &strategy.id, embedding, metadata)
            .await?;

        debug!(strategy = %strategy.strategy_name, "strategy stored");
        Ok(strategy)
    }

    /// Fold one observed use into the strategy's running statistics.
    pub async fn record_strategy_use(
        &self,
        id: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<Strategy> {
        let mut strategy = self
            .docs
            .get_strategy(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("strategy not found: {id}"))?;

        let observed = if success { 1.0 } else { 0.0 };
        strategy.success_rate =
            (1.0 - SUCCESS_ALPHA) * strategy.success_rate + SUCCESS_ALPHA * observed;
        strategy.times_used += 1;
        // Running mean keeps the duration estimate stable across uses.
        let n = strategy.times_used;
        strategy.average_duration_ms = ((strategy.average_duration_ms as i128
            + ((duration_ms as i128 - strategy.average_duration_ms as i128) / n as i128))
            .max(0)) as u64;
        strategy.last_used = Some(Utc::now());

        self.docs.update_strategy(&strategy).await?;
        Ok(strategy)
    }

    /// Append a refinement note and stamp `last_refined`.
    pub async fn add_refinement(&self, id: &str, note: &str) -> Result<Strategy> {
        let mut strategy = self
            .docs
            .get_strategy(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("strategy not found: {id}"))?;
        strategy.refinements.push(note.to_string());
        strategy.last_refined = Some(Utc::now());
        self.docs.update_strategy(&strategy).await?;
        Ok(strategy)
    }

    /// Rank applicable strategies by `success_rate × textual relevance`.
    /// A strategy is applicable only when every tool it requires is
    /// available right now.
    pub async fn recommendations(
        &self,
        query: &str,
        available_tools: &[String],
        k: usize,
    ) -> Result<Vec<RankedStrategy>> {
        let query_vector = self.embedder.embed(query).await?;
        // Over-fetch so tool filtering still leaves k candidates.
        let hits = self
            .vectors
            .search(PROCEDURAL_COLLECTION, &query_vector, k.saturating_mul(4).max(8), None)
            .await?;

        let mut recommendations = Vec::new();
        for hit in hits {
            let Some(strategy) = self.docs.get_strategy(&hit.id).await? else {
                continue;
            };
            let applicable = strategy
                .required_tools
                .iter()
                .all(|tool| available_tools.iter().any(|have| have == tool));
            if !applicable {
                continue;
            }

            let relevance = hit.score.max(0.0);
            let score = strategy.success_rate * relevance;
            let reasoning = format!(
                "{}: {:.0}% success over {} uses; context match {:.2}",
                strategy.strategy_name,
                strategy.success_rate * 100.0,
                strategy.times_used,
                relevance,
            );
            recommendations.push(RankedStrategy {
                strategy,
                relevance_score: score,
                reasoning,
            });
        }

        recommendations.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        recommendations.truncate(k);
        Ok(recommendations)
    }

    /// Distill a reusable strategy out of episodes that repeated the same
    /// action-kind sequence successfully at least three times.
    pub async fn extract_strategy_from_episodes(
        &self,
        episodes: &[EpisodicMemory],
        name: &str,
    ) -> Result<Option<Strategy>> {
        let mut by_sequence: HashMap<Vec<ActionKind>, Vec<&EpisodicMemory>> = HashMap::new();
        for episode in episodes {
            if episode.actions.is_empty() {
                continue;
            }
            let sequence: Vec<ActionKind> =
                episode.actions.iter().map(|action| action.kind).collect();
            by_sequence.entry(sequence).or_default().push(episode);
        }

        let Some((sequence, group)) = by_sequence
            .into_iter()
            .filter(|(_, group)| {
                group.iter().filter(|episode| episode.success).count() >= MIN_EPISODES_FOR_STRATEGY
            })
            .max_by_key(|(_, group)| group.iter().filter(|episode| episode.success).count())
        else {
            return Ok(None);
        };

        let successes = group.iter().filter(|episode| episode.success).count();
        let success_rate = successes as f32 / group.len() as f32;
        let tools: BTreeSet<String> = group
            .iter()
            .flat_map(|episode| episode.actions.iter().map(|action| action.tool.clone()))
            .collect();
        let total_ms: u64 = group.iter().map(|episode| episode.duration_ms).sum();
        let contexts: BTreeSet<String> =
            group.iter().map(|episode| episode.topic.clone()).collect();

        let description = format!(
            "Repeatable sequence {} observed across {} episodes",
            sequence.iter().map(|kind| kind.as_str()).collect::<Vec<_>>().join(" → "),
            group.len(),
        );
        let strategy = self
            .store_strategy(
                name,
                &description,
                contexts.into_iter().collect(),
                tools.into_iter().collect(),
                StrategySeed {
                    success_rate,
                    average_duration_ms: total_ms / group.len() as u64,
                },
            )
            .await?;

        info!(strategy = %name, episodes = group.len(), success_rate, "strategy extracted");
        Ok(Some(strategy))
    }
}

fn strategy_text(strategy: &Strategy) -> String {
    format!("{} {}", strategy.description, strategy.applicable_contexts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Action, ActionParams};
    use crate::store::MemoryDocumentStore;
    use crate::vector::MemoryVectorStore;
    use delver_llm::HashingEmbedder;

    async fn manager() -> ProceduralManager {
        let vectors = Arc::new(MemoryVectorStore::new());
        vectors.create_collection(PROCEDURAL_COLLECTION).await.unwrap();
        ProceduralManager::new(
            Arc::new(MemoryDocumentStore::new()),
            vectors,
            Arc::new(HashingEmbedder::new(64)),
        )
    }

    fn episode(kinds: &[ActionKind], tools: &[&str], success: bool) -> EpisodicMemory {
        let now = Utc::now();
        EpisodicMemory {
            id: new_id(),
            session_id: "s1".to_string(),
            topic: "benchmark research".to_string(),
            actions: kinds
                .iter()
                .zip(tools.iter().cycle())
                .map(|(kind, tool)| Action {
                    id: new_id(),
                    session_id: "s1".to_string(),
                    kind: *kind,
                    tool: tool.to_string(),
                    params: ActionParams::Empty,
                    reasoning: String::new(),
                    strategy: None,
                    timestamp: now,
                })
                .collect(),
            outcomes: Vec::new(),
            findings: Vec::new(),
            duration_ms: 100,
            success,
            summary: String::new(),
            tags: Vec::new(),
            embedding: None,
            feedback: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn recording_use_updates_ewma_and_counters() -> Result<()> {
        let manager = manager().await;
        let strategy = manager
            .store_strategy(
                "broad-sweep",
                "search widely then analyze",
                vec!["surveys".to_string()],
                vec!["web_search".to_string()],
                StrategySeed { success_rate: 0.5, average_duration_ms: 0 },
            )
            .await?;

        let updated = manager.record_strategy_use(&strategy.id, true, 200).await?;
        assert!((updated.success_rate - 0.6).abs() < 1e-6);
        assert_eq!(updated.times_used, 1);
        assert_eq!(updated.average_duration_ms, 200);
        assert!(updated.last_used.is_some());

        let updated = manager.record_strategy_use(&strategy.id, false, 100).await?;
        assert!((updated.success_rate - 0.48).abs() < 1e-6);
        assert_eq!(updated.times_used, 2);
        Ok(())
    }

    #[tokio::test]
    async fn refinements_accumulate_with_a_timestamp() -> Result<()> {
        let manager = manager().await;
        let strategy = manager
            .store_strategy("tuned", "gather narrowly", Vec::new(), Vec::new(), StrategySeed::default())
            .await?;
        assert!(strategy.last_refined.is_none());

        let refined = manager
            .add_refinement(&strategy.id, "prefer primary sources over aggregators")
            .await?;
        assert_eq!(refined.refinements.len(), 1);
        assert!(refined.last_refined.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn recommendations_require_available_tools() -> Result<()> {
        let manager = manager().await;
        manager
            .store_strategy(
                "needs-search",
                "search the web for evidence",
                vec!["evidence gathering".to_string()],
                vec!["web_search".to_string()],
                StrategySeed { success_rate: 0.9, average_duration_ms: 0 },
            )
            .await?;
        manager
            .store_strategy(
                "needs-browser",
                "search the web with a full browser",
                vec!["evidence gathering".to_string()],
                vec!["browser".to_string()],
                StrategySeed { success_rate: 0.9, average_duration_ms: 0 },
            )
            .await?;

        let available = vec!["web_search".to_string(), "analyze".to_string()];
        let recs = manager.recommendations("search the web evidence", &available, 3).await?;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].strategy.strategy_name, "needs-search");
        assert!(recs[0].reasoning.contains("90%"));
        Ok(())
    }

    #[tokio::test]
    async fn higher_success_rate_wins_at_equal_relevance() -> Result<()> {
        let manager = manager().await;
        for (name, rate) in [("shaky", 0.3f32), ("solid", 0.9)] {
            manager
                .store_strategy(
                    name,
                    "gather then synthesize findings",
                    vec!["reports".to_string()],
                    Vec::new(),
                    StrategySeed { success_rate: rate, average_duration_ms: 0 },
                )
                .await?;
        }

        let recs = manager.recommendations("gather synthesize findings", &[], 2).await?;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].strategy.strategy_name, "solid");
        Ok(())
    }

    #[tokio::test]
    async fn extraction_needs_three_successful_repeats() -> Result<()> {
        let manager = manager().await;
        let kinds = [ActionKind::Search, ActionKind::Analyze];

        let two = vec![
            episode(&kinds, &["web_search", "analyze"], true),
            episode(&kinds, &["web_search", "analyze"], true),
        ];
        assert!(manager.extract_strategy_from_episodes(&two, "too-few").await?.is_none());

        let mut four = two;
        four.push(episode(&kinds, &["web_search", "analyze"], true));
        four.push(episode(&kinds, &["web_search", "analyze"], false));
        let strategy = manager
            .extract_strategy_from_episodes(&four, "search-analyze")
            .await?
            .expect("three successes should extract");

        assert_eq!(strategy.strategy_name, "search-analyze");
        assert!((strategy.success_rate - 0.75).abs() < 1e-6);
        assert!(strategy.required_tools.contains(&"web_search".to_string()));
        assert!(strategy.required_tools.contains(&"analyze".to_string()));
        assert!(strategy.description.contains("search → analyze"));
        Ok(())
    }
}
