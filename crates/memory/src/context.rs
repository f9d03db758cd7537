//! Token-budgeted context assembly for the reasoner.
//!
//! Pulls the most similar episodes, facts, and strategies for a query,
//! packs them under a hard token budget (40% episodes / 40% facts / 20%
//! strategies unless per-type budgets are given), and renders the result
//! as prompt sections.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

use delver_llm::EmbeddingClient;

use crate::schema::{EpisodicMemory, Fact, Strategy};
use crate::store::DocumentStore;
use crate::vector::{
    EPISODIC_COLLECTION, PROCEDURAL_COLLECTION, SEMANTIC_COLLECTION, VectorStore,
};

/// Hard default budget for one assembled context.
pub const DEFAULT_CONTEXT_TOKENS: usize = 4000;

/// Candidates fetched per collection before budget packing.
const CANDIDATES_PER_TYPE: usize = 10;

/// Cached query embeddings; research loops re-ask near-identical queries
/// every iteration.
const QUERY_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub episode_tokens: Option<usize>,
    pub fact_tokens: Option<usize>,
    pub strategy_tokens: Option<usize>,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CONTEXT_TOKENS,
            episode_tokens: None,
            fact_tokens: None,
            strategy_tokens: None,
        }
    }
}

impl ContextBudget {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self { max_tokens, ..Self::default() }
    }

    fn split(&self) -> (usize, usize, usize) {
        (
            self.episode_tokens.unwrap_or(self.max_tokens * 40 / 100),
            self.fact_tokens.unwrap_or(self.max_tokens * 40 / 100),
            self.strategy_tokens.unwrap_or(self.max_tokens * 20 / 100),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TruncationFlags {
    pub episodes: bool,
    pub facts: bool,
    pub strategies: bool,
}

impl TruncationFlags {
    pub fn any(&self) -> bool {
        self.episodes || self.facts || self.strategies
    }
}

/// The assembled bundle shown to the reasoner.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub episodes: Vec<(EpisodicMemory, f32)>,
    pub facts: Vec<(Fact, f32)>,
    pub strategies: Vec<(Strategy, f32)>,
    pub total_tokens: usize,
    pub truncated: TruncationFlags,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty() && self.facts.is_empty() && self.strategies.is_empty()
    }
}

/// char/4 heuristic; close enough for budget packing.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub struct ContextBuilder {
    docs: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl ContextBuilder {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            docs,
            vectors,
            embedder,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.lock().await.get(query) {
            trace!("query embedding cache hit");
            return Ok(cached.clone());
        }
        let vector = self.embedder.embed(query).await?;
        self.query_cache.lock().await.put(query.to_string(), vector.clone());
        Ok(vector)
    }

    pub async fn build_context(&self, query: &str, budget: &ContextBudget) -> Result<MemoryContext> {
        let query_vector = self.query_embedding(query).await?;

        // The three collection lookups are independent — fan out.
        let (episode_hits, fact_hits, strategy_hits) = tokio::try_join!(
            self.vectors.search(EPISODIC_COLLECTION, &query_vector, CANDIDATES_PER_TYPE, None),
            self.vectors.search(SEMANTIC_COLLECTION, &query_vector, CANDIDATES_PER_TYPE, None),
            self.vectors.search(PROCEDURAL_COLLECTION, &query_vector, CANDIDATES_PER_TYPE, None),
        )?;

        let (episode_budget, fact_budget, strategy_budget) = budget.split();
        let mut context = MemoryContext::default();

        // Episodes: hits arrive ranked by similarity; pack until the
        // type budget would overflow.
        let mut used = 0usize;
        for hit in episode_hits {
            let Some(episode) = self.docs.get_episode(&hit.id).await? else {
                continue;
            };
            let tokens = estimate_tokens(&format_episode(&episode));
            if used + tokens > episode_budget {
                context.truncated.episodes = true;
                break;
            }
            used += tokens;
            context.episodes.push((episode, hit.score));
        }
        context.total_tokens += used;

        // Facts: retrieval bumps access counters (the semantic contract).
        let mut used = 0usize;
        for hit in fact_hits {
            let Some(mut fact) = self.docs.get_fact(&hit.id).await? else {
                continue;
            };
            let tokens = estimate_tokens(&format_fact(&fact));
            if used + tokens > fact_budget {
                context.truncated.facts = true;
                break;
            }
            fact.access_count += 1;
            fact.last_accessed = Utc::now();
            self.docs.update_fact(&fact).await?;
            used += tokens;
            context.facts.push((fact, hit.score));
        }
        context.total_tokens += used;

        let mut used = 0usize;
        for hit in strategy_hits {
            let Some(strategy) = self.docs.get_strategy(&hit.id).await? else {
                continue;
            };
            let tokens = estimate_tokens(&format_strategy(&strategy));
            if used + tokens > strategy_budget {
                context.truncated.strategies = true;
                break;
            }
            used += tokens;
            context.strategies.push((strategy, hit.score));
        }
        context.total_tokens += used;

        trace!(
            episodes = context.episodes.len(),
            facts = context.facts.len(),
            strategies = context.strategies.len(),
            total_tokens = context.total_tokens,
            "context assembled"
        );
        Ok(context)
    }
}

fn format_episode(episode: &EpisodicMemory) -> String {
    format!(
        "[{}] {}: {}",
        if episode.success { "ok" } else { "failed" },
        episode.topic,
        episode.summary,
    )
}

fn format_fact(fact: &Fact) -> String {
    format!("{} ({}, confidence {:.2})", fact.content, fact.category, fact.confidence)
}

fn format_strategy(strategy: &Strategy) -> String {
    format!(
        "{}: {} ({:.0}% success, used {} times)",
        strategy.strategy_name,
        strategy.description,
        strategy.success_rate * 100.0,
        strategy.times_used,
    )
}

/// Render the context as the three prompt sections, with explicit warnings
/// when any type was truncated by the budget.
pub fn format_context_for_prompt(context: &MemoryContext) -> String {
    let mut sections = Vec::new();

    if !context.episodes.is_empty() {
        let items = context
            .episodes
            .iter()
            .map(|(episode, score)| format!("- (sim {score:.2}) {}", format_episode(episode)))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Past Experiences:\n{items}"));
    }
    if context.truncated.episodes {
        sections.push("[Some past experiences omitted to fit the context budget]".to_string());
    }

    if !context.facts.is_empty() {
        let items = context
            .facts
            .iter()
            .map(|(fact, score)| format!("- (sim {score:.2}) {}", format_fact(fact)))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Known Facts:\n{items}"));
    }
    if context.truncated.facts {
        sections.push("[Some known facts omitted to fit the context budget]".to_string());
    }

    if !context.strategies.is_empty() {
        let items = context
            .strategies
            .iter()
            .map(|(strategy, score)| format!("- (sim {score:.2}) {}", format_strategy(strategy)))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Effective Strategies:\n{items}"));
    }
    if context.truncated.strategies {
        sections.push("[Some strategies omitted to fit the context budget]".to_string());
    }

    sections.join("\n\n")
}
