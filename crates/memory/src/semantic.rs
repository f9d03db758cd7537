//! Semantic memory: consolidated declarative facts with provenance.
//!
//! Facts are the one mutable memory kind: retrieval bumps access counters,
//! near-duplicates merge on write, and relevance decays with disuse.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use delver_llm::{
    CompletionRequest, EmbeddingClient, LlmClient, extract_json_output, extract_text,
};

use crate::schema::{ActionResult, CandidateFact, EpisodicMemory, Fact, new_id};
use crate::store::DocumentStore;
use crate::vector::{SEMANTIC_COLLECTION, VectorStore};

/// Cosine similarity at which two facts count as the same statement.
pub const DUPLICATE_THRESHOLD: f32 = 0.92;

#[derive(Debug, Deserialize)]
struct ExtractionOutput {
    #[serde(default)]
    facts: Vec<CandidateFact>,
}

pub struct SemanticManager {
    docs: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    llm: Arc<dyn LlmClient>,
    duplicate_threshold: f32,
}

impl SemanticManager {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self { docs, vectors, embedder, llm, duplicate_threshold: DUPLICATE_THRESHOLD }
    }

    pub fn with_duplicate_threshold(mut self, threshold: f32) -> Self {
        self.duplicate_threshold = threshold;
        self
    }

    /// Ask the LLM to distill declarative statements out of an episode's
    /// outcomes and findings, then store the novel ones.  Extraction is
    /// best-effort: an unusable LLM response yields an empty list, never an
    /// error that would fail the iteration.
    pub async fn extract_facts_from_episode(&self, episode: &EpisodicMemory) -> Result<Vec<Fact>> {
        let material = extraction_material(episode);
        if material.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = format!(
            "Extract factual statements from the research notes below.\n\
             Respond only with valid JSON matching this schema:\n\
             {{\"facts\":[{{\"content\":\"...\",\"category\":\"...\",\"confidence\":0.8}},...]}}\n\
             Only include statements supported by the notes.  If there is \
             nothing factual, return {{\"facts\":[]}}.\n\n\
             TOPIC: {topic}\n\nNOTES:\n{material}",
            topic = episode.topic,
        );

        let candidates = match self.llm.complete(CompletionRequest::from_prompt(prompt)).await {
            Ok(completion) => {
                let raw = extract_text(&completion);
                match extract_json_output::<ExtractionOutput>(&raw) {
                    Some(output) => output.facts,
                    None => {
                        debug!("fact extraction response was not parseable JSON — skipping");
                        Vec::new()
                    }
                }
            }
            Err(error) => {
                warn!(%error, "fact extraction LLM call failed — skipping");
                Vec::new()
            }
        };

        let mut stored = Vec::new();
        for candidate in candidates {
            if let Some(fact) = self.admit_candidate(candidate, &episode.id).await? {
                stored.push(fact);
            }
        }
        debug!(episode = %episode.id, new_facts = stored.len(), "facts extracted");
        Ok(stored)
    }

    /// Store a candidate unless an existing fact already says the same
    /// thing, in which case the existing fact absorbs the observation.
    async fn admit_candidate(
        &self,
        candidate: CandidateFact,
        source: &str,
    ) -> Result<Option<Fact>> {
        let embedding = self.embedder.embed(&candidate.content).await?;

        let duplicates = self.vectors.search(SEMANTIC_COLLECTION, &embedding, 1, None).await?;
        if let Some(hit) = duplicates.first() {
            if hit.score >= self.duplicate_threshold {
                if let Some(mut existing) = self.docs.get_fact(&hit.id).await? {
                    existing.access_count += 1;
                    existing.last_modified = Utc::now();
                    existing.confidence = existing.confidence.max(candidate.confidence);
                    self.docs.update_fact(&existing).await?;
                    debug!(fact = %existing.id, "duplicate candidate merged into existing fact");
                    return Ok(None);
                }
            }
        }

        let now = Utc::now();
        let fact = Fact {
            id: new_id(),
            content: candidate.content,
            category: candidate.category,
            subcategory: None,
            source: source.to_string(),
            confidence: candidate.confidence.clamp(0.0, 1.0),
            relevance: 1.0,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            last_modified: now,
            tags: Vec::new(),
            related_facts: Vec::new(),
            embedding: Some(embedding.clone()),
        };
        self.store_fact_with_embedding(&fact, embedding).await?;
        Ok(Some(fact))
    }

    pub async fn store_fact(&self, fact: &Fact) -> Result<()> {
        let embedding = match &fact.embedding {
            Some(embedding) => embedding.clone(),
            None => self.embedder.embed(&fact.content).await?,
        };
        // The stored record always carries its embedding so consolidation
        // can re-rank without re-embedding.
        let mut record = fact.clone();
        record.embedding = Some(embedding.clone());
        self.store_fact_with_embedding(&record, embedding).await
    }

    async fn store_fact_with_embedding(&self, fact: &Fact, embedding: Vec<f32>) -> Result<()> {
        self.docs.store_fact(fact).await?;
        let mut metadata = HashMap::new();
        metadata.insert("category".to_string(), fact.category.clone());
        metadata.insert("source".to_string(), fact.source.clone());
        self.vectors
            .store_embedding(SEMANTIC_COLLECTION, &fact.id, embedding, metadata)
            .await?;
        Ok(())
    }

    /// k-NN search with the access bookkeeping the retrieval contract
    /// requires: every returned fact has its counters bumped.
    pub async fn search_facts(&self, query: &str, limit: usize) -> Result<Vec<(Fact, f32)>> {
        let query_vector = self.embedder.embed(query).await?;
        let hits = self.vectors.search(SEMANTIC_COLLECTION, &query_vector, limit, None).await?;

        let mut facts = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(mut fact) = self.docs.get_fact(&hit.id).await? {
                fact.access_count += 1;
                fact.last_accessed = Utc::now();
                self.docs.update_fact(&fact).await?;
                facts.push((fact, hit.score));
            }
        }
        Ok(facts)
    }

    pub async fn facts_by_category(&self, category: &str) -> Result<Vec<Fact>> {
        Ok(self.docs.facts_by_category(category).await?)
    }

    /// Decay every fact's relevance by idle time, boosted by how often it
    /// has been used.  Heavily-accessed facts fade slower.
    pub async fn update_relevance(&self) -> Result<usize> {
        let now = Utc::now();
        let facts = self.docs.all_facts().await?;
        let updated = facts.len();
        for mut fact in facts {
            let idle_days = (now - fact.last_accessed).num_days().max(0) as f32;
            let decay = 1.0 / (1.0 + idle_days / 30.0);
            let boost = 1.0 + (fact.access_count as f32).ln_1p() * 0.1;
            fact.relevance = (fact.relevance * decay * boost).clamp(0.0, 1.0);
            self.docs.update_fact(&fact).await?;
        }
        Ok(updated)
    }

    /// Merge near-duplicate facts pairwise.  The higher-confidence fact
    /// survives, absorbing the other's tags, relations, and access count.
    pub async fn consolidate_similar(&self, threshold: f32) -> Result<usize> {
        let facts = self.docs.all_facts().await?;
        let mut merged = 0usize;
        let mut retired: Vec<String> = Vec::new();

        for fact in &facts {
            if retired.contains(&fact.id) {
                continue;
            }
            let Some(embedding) = &fact.embedding else {
                continue;
            };
            let hits = self.vectors.search(SEMANTIC_COLLECTION, embedding, 4, None).await?;
            for hit in hits {
                if hit.id == fact.id || hit.score < threshold || retired.contains(&hit.id) {
                    continue;
                }
                let Some(other) = self.docs.get_fact(&hit.id).await? else {
                    continue;
                };

                let (mut survivor, casualty) = if fact.confidence >= other.confidence {
                    (fact.clone(), other)
                } else {
                    (other, fact.clone())
                };
                if retired.contains(&survivor.id) || retired.contains(&casualty.id) {
                    continue;
                }

                survivor.access_count += casualty.access_count;
                for tag in casualty.tags {
                    if !survivor.tags.contains(&tag) {
                        survivor.tags.push(tag);
                    }
                }
                for related in casualty.related_facts {
                    if related != survivor.id && !survivor.related_facts.contains(&related) {
                        survivor.related_facts.push(related);
                    }
                }
                survivor.last_modified = Utc::now();

                self.docs.update_fact(&survivor).await?;
                self.docs.delete_fact(&casualty.id).await?;
                self.vectors.delete(SEMANTIC_COLLECTION, &casualty.id).await?;
                retired.push(casualty.id.clone());
                merged += 1;
            }
        }

        if merged > 0 {
            debug!(merged, "similar facts consolidated");
        }
        Ok(merged)
    }
}

fn extraction_material(episode: &EpisodicMemory) -> String {
    let mut lines = Vec::new();
    for outcome in &episode.outcomes {
        for observation in &outcome.observations {
            lines.push(format!("- {observation}"));
        }
        if let Some(ActionResult::Analyze { facts }) = &outcome.result {
            for fact in facts {
                lines.push(format!("- {}", fact.content));
            }
        }
    }
    for finding in &episode.findings {
        lines.push(format!("- {} (source: {})", finding.content, finding.source.title));
    }
    lines.join("\n")
}
