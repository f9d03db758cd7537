//! Episodic memory: one immutable record per stored experience.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info};

use delver_llm::EmbeddingClient;

use crate::schema::{Action, EpisodicMemory, Finding, Outcome, new_id};
use crate::store::DocumentStore;
use crate::vector::{EPISODIC_COLLECTION, MetadataFilter, VectorStore};

#[derive(Debug, Clone)]
pub struct EpisodeSearchOptions {
    pub limit: usize,
    pub similarity_threshold: f32,
    pub filters: Option<MetadataFilter>,
}

impl Default for EpisodeSearchOptions {
    fn default() -> Self {
        Self { limit: 5, similarity_threshold: 0.0, filters: None }
    }
}

pub struct EpisodicManager {
    docs: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl EpisodicManager {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self { docs, vectors, embedder }
    }

    /// Persist one episode and its embedding.  The episode succeeds when
    /// every outcome in it succeeded.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_episode(
        &self,
        session_id: &str,
        topic: &str,
        actions: Vec<Action>,
        outcomes: Vec<Outcome>,
        findings: Vec<Finding>,
        summary: String,
        tags: Vec<String>,
    ) -> Result<EpisodicMemory> {
        let success = outcomes.iter().all(|outcome| outcome.success);
        let duration_ms = outcomes.iter().map(|outcome| outcome.duration_ms).sum();
        let embedding = self.embedder.embed(&format!("{topic} {summary}")).await?;

        let episode = EpisodicMemory {
            id: new_id(),
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            actions,
            outcomes,
            findings,
            duration_ms,
            success,
            summary,
            tags,
            embedding: Some(embedding.clone()),
            feedback: None,
            created_at: Utc::now(),
        };

        // Record first, vector second: a dangling vector hit hydrates to
        // nothing and is skipped, the reverse would lose the episode.
        self.docs.store_episode(&episode).await?;

        let mut metadata = HashMap::new();
        metadata.insert("session_id".to_string(), episode.session_id.clone());
        metadata.insert("success".to_string(), episode.success.to_string());
        metadata.insert("tags".to_string(), episode.tags.join(","));
        metadata.insert("timestamp".to_string(), episode.created_at.to_rfc3339());
        self.vectors
            .store_embedding(EPISODIC_COLLECTION, &episode.id, embedding, metadata)
            .await?;

        debug!(episode = %episode.id, session = %session_id, success, "episode stored");
        Ok(episode)
    }

    /// Embed the query, run k-NN, hydrate, and apply the similarity floor.
    pub async fn search_episodes(
        &self,
        query: &str,
        opts: &EpisodeSearchOptions,
    ) -> Result<Vec<(EpisodicMemory, f32)>> {
        let query_vector = self.embedder.embed(query).await?;
        let hits = self
            .vectors
            .search(EPISODIC_COLLECTION, &query_vector, opts.limit, opts.filters.as_ref())
            .await?;

        let mut episodes = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.score < opts.similarity_threshold {
                continue;
            }
            if let Some(episode) = self.docs.get_episode(&hit.id).await? {
                episodes.push((episode, hit.score));
            }
        }
        Ok(episodes)
    }

    pub async fn session_episodes(&self, session_id: &str) -> Result<Vec<EpisodicMemory>> {
        Ok(self.docs.episodes_by_session(session_id).await?)
    }

    /// Prune failed, finding-less episodes older than the threshold.  Those
    /// carry no reusable signal; everything else stays immutable.
    pub async fn consolidate_older_than(&self, days_threshold: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days_threshold);
        let stale = self.docs.episodes_older_than(cutoff).await?;

        let mut pruned = 0;
        for episode in stale {
            if !episode.success && episode.findings.is_empty() {
                self.vectors.delete(EPISODIC_COLLECTION, &episode.id).await?;
                self.docs.delete_episode(&episode.id).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, days_threshold, "stale episodes consolidated");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use crate::vector::MemoryVectorStore;
    use delver_llm::HashingEmbedder;

    fn manager() -> EpisodicManager {
        EpisodicManager::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(HashingEmbedder::new(64)),
        )
    }

    async fn seeded_manager() -> EpisodicManager {
        let m = manager();
        m.vectors.create_collection(EPISODIC_COLLECTION).await.unwrap();
        m
    }

    fn outcome(success: bool, duration_ms: u64) -> Outcome {
        Outcome {
            action_id: new_id(),
            success,
            result: None,
            error: (!success).then(|| "network".to_string()),
            observations: Vec::new(),
            duration_ms,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn store_and_search_roundtrip() -> Result<()> {
        let manager = seeded_manager().await;
        manager
            .store_episode(
                "s1",
                "rust async runtimes",
                Vec::new(),
                vec![outcome(true, 50), outcome(true, 30)],
                Vec::new(),
                "compared tokio and async-std scheduling".to_string(),
                vec!["gather".to_string()],
            )
            .await?;

        let found = manager
            .search_episodes("rust async runtimes", &EpisodeSearchOptions::default())
            .await?;
        assert_eq!(found.len(), 1);
        let (episode, score) = &found[0];
        assert!(episode.success);
        assert_eq!(episode.duration_ms, 80);
        assert!(*score > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn any_failed_outcome_marks_the_episode_failed() -> Result<()> {
        let manager = seeded_manager().await;
        let episode = manager
            .store_episode(
                "s1",
                "flaky fetch",
                Vec::new(),
                vec![outcome(true, 10), outcome(false, 10)],
                Vec::new(),
                "fetch failed".to_string(),
                Vec::new(),
            )
            .await?;
        assert!(!episode.success);
        Ok(())
    }

    #[tokio::test]
    async fn metadata_filter_narrows_search() -> Result<()> {
        let manager = seeded_manager().await;
        manager
            .store_episode("s1", "topic", Vec::new(), vec![outcome(true, 1)], Vec::new(), "ok".into(), Vec::new())
            .await?;
        manager
            .store_episode("s2", "topic", Vec::new(), vec![outcome(false, 1)], Vec::new(), "bad".into(), Vec::new())
            .await?;

        let mut filter = MetadataFilter::new();
        filter.insert("success".to_string(), "true".to_string());
        let found = manager
            .search_episodes(
                "topic",
                &EpisodeSearchOptions { filters: Some(filter), ..Default::default() },
            )
            .await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.session_id, "s1");
        Ok(())
    }

    #[tokio::test]
    async fn consolidation_prunes_only_worthless_stale_episodes() -> Result<()> {
        let manager = seeded_manager().await;
        let keeper = manager
            .store_episode("s1", "good", Vec::new(), vec![outcome(true, 1)], Vec::new(), "kept".into(), Vec::new())
            .await?;
        let goner = manager
            .store_episode("s1", "bad", Vec::new(), vec![outcome(false, 1)], Vec::new(), "pruned".into(), Vec::new())
            .await?;

        // Zero-day threshold makes everything created just now "stale"
        // except that created_at == cutoff boundary; back-date instead.
        let mut old_keeper = keeper.clone();
        old_keeper.created_at = Utc::now() - Duration::days(30);
        manager.docs.store_episode(&old_keeper).await?;
        let mut old_goner = goner.clone();
        old_goner.created_at = Utc::now() - Duration::days(30);
        manager.docs.store_episode(&old_goner).await?;

        let pruned = manager.consolidate_older_than(7).await?;
        assert_eq!(pruned, 1);
        assert!(manager.docs.get_episode(&keeper.id).await?.is_some());
        assert!(manager.docs.get_episode(&goner.id).await?.is_none());
        Ok(())
    }
}
