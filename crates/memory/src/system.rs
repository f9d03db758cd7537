//! The memory system facade: session lifecycle, experience write-back,
//! reflection bookkeeping, and maintenance.
//!
//! Owns the one mutable global of the whole agent — the current session —
//! as a lifecycle-scoped field: `start → active → close`.  Starting a
//! session while another is active is an invariant violation, not a
//! recoverable condition.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use delver_config::AppConfig;
use delver_llm::{EmbeddingClient, LlmClient};

use crate::context::{ContextBudget, ContextBuilder, MemoryContext};
use crate::episodic::EpisodicManager;
use crate::procedural::{ProceduralManager, RankedStrategy};
use crate::schema::{
    Action, EpisodicMemory, Fact, Finding, Goal, Outcome, Session, SessionStatus, new_id,
};
use crate::semantic::SemanticManager;
use crate::store::DocumentStore;
use crate::vector::{
    EPISODIC_COLLECTION, PROCEDURAL_COLLECTION, SEMANTIC_COLLECTION, VectorStore,
};

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub reflection_interval: u32,
    pub auto_reflect: bool,
    pub auto_consolidate: bool,
    pub consolidation_threshold_days: i64,
    pub similarity_threshold: f32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            reflection_interval: 5,
            auto_reflect: true,
            auto_consolidate: true,
            consolidation_threshold_days: 7,
            similarity_threshold: 0.92,
        }
    }
}

impl MemoryOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            reflection_interval: config.agent.reflection_interval,
            auto_reflect: config.memory.auto_reflect,
            auto_consolidate: config.memory.auto_consolidate,
            consolidation_threshold_days: config.memory.consolidation_threshold_days,
            similarity_threshold: config.memory.similarity_threshold,
        }
    }
}

/// What `store_experience` hands back to the control loop.
#[derive(Debug)]
pub struct StoredExperience {
    pub episode: EpisodicMemory,
    pub extracted_facts: Vec<Fact>,
    pub should_reflect: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    pub facts_decayed: usize,
    pub facts_merged: usize,
    pub episodes_pruned: usize,
}

pub struct MemorySystem {
    docs: Arc<dyn DocumentStore>,
    pub episodic: EpisodicManager,
    pub semantic: SemanticManager,
    pub procedural: ProceduralManager,
    context: ContextBuilder,
    vectors: Arc<dyn VectorStore>,
    options: MemoryOptions,
    current_session: Option<Session>,
    actions_since_reflection: u32,
}

impl MemorySystem {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        llm: Arc<dyn LlmClient>,
        options: MemoryOptions,
    ) -> Self {
        let semantic = SemanticManager::new(
            Arc::clone(&docs),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            llm,
        )
        .with_duplicate_threshold(options.similarity_threshold);
        Self {
            episodic: EpisodicManager::new(
                Arc::clone(&docs),
                Arc::clone(&vectors),
                Arc::clone(&embedder),
            ),
            semantic,
            procedural: ProceduralManager::new(
                Arc::clone(&docs),
                Arc::clone(&vectors),
                Arc::clone(&embedder),
            ),
            context: ContextBuilder::new(
                Arc::clone(&docs),
                Arc::clone(&vectors),
                Arc::clone(&embedder),
            ),
            vectors,
            docs,
            options,
            current_session: None,
            actions_since_reflection: 0,
        }
    }

    /// Ensure the three memory collections exist.  Call once at startup.
    pub async fn initialize(&self) -> Result<()> {
        for name in [EPISODIC_COLLECTION, SEMANTIC_COLLECTION, PROCEDURAL_COLLECTION] {
            self.vectors.create_collection(name).await?;
        }
        Ok(())
    }

    pub fn docs(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    pub async fn start_session(
        &mut self,
        topic: &str,
        goal: Goal,
        user_id: Option<String>,
    ) -> Result<Session> {
        if let Some(active) = &self.current_session {
            bail!("a session is already active: {}", active.id);
        }

        let now = Utc::now();
        let session = Session {
            id: new_id(),
            user_id,
            topic: topic.to_string(),
            goal,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            parent_session_id: None,
        };
        self.docs.create_session(&session).await?;
        self.current_session = Some(session.clone());
        self.actions_since_reflection = 0;

        info!(session = %session.id, topic = %topic, "session started");
        Ok(session)
    }

    pub async fn complete_session(&mut self) -> Result<Option<Session>> {
        self.close_session(SessionStatus::Completed).await
    }

    /// Close the active session with a terminal status.  No-op with a
    /// warning when no session is active.
    pub async fn close_session(&mut self, status: SessionStatus) -> Result<Option<Session>> {
        debug_assert!(status.is_terminal(), "close_session requires a terminal status");
        let Some(mut session) = self.current_session.take() else {
            warn!("close_session called with no active session");
            return Ok(None);
        };

        let now = Utc::now();
        session.status = status;
        session.updated_at = now;
        session.completed_at = Some(now);
        self.docs.update_session(&session).await?;
        info!(session = %session.id, ?status, "session closed");

        if self.options.auto_consolidate {
            // Maintenance is non-critical: log and move on.
            if let Err(error) = self.perform_maintenance().await {
                warn!(%error, "post-session maintenance failed");
            }
        }
        if status == SessionStatus::Completed {
            if let Err(error) = self.distill_session_strategy(&session).await {
                warn!(%error, "strategy distillation failed");
            }
        }
        Ok(Some(session))
    }

    /// Try to name a reusable strategy out of a completed session's
    /// episodes.  Requires three successful repeats of the same action
    /// sequence, so short sessions simply produce nothing.
    async fn distill_session_strategy(&self, session: &Session) -> Result<()> {
        let name = format!(
            "{}-routine",
            session.topic.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-"),
        );
        let already_known = self
            .docs
            .list_strategies()
            .await?
            .iter()
            .any(|strategy| strategy.strategy_name == name);
        if already_known {
            return Ok(());
        }

        let episodes = self.episodic.session_episodes(&session.id).await?;
        if let Some(strategy) =
            self.procedural.extract_strategy_from_episodes(&episodes, &name).await?
        {
            info!(strategy = %strategy.strategy_name, "session strategy distilled");
        }
        Ok(())
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session.as_ref()
    }

    // ── Experience write-back ────────────────────────────────────────────

    /// Persist one iteration's experience: the episode, any facts the LLM
    /// can distill from it, and the reflection-counter bump.  Committed
    /// before returning, so the next `build_context` observes it.
    pub async fn store_experience(
        &mut self,
        session_id: &str,
        actions: Vec<Action>,
        outcomes: Vec<Outcome>,
        findings: Vec<Finding>,
        summary: String,
        tags: Vec<String>,
    ) -> Result<StoredExperience> {
        let action_count = actions.len() as u32;
        let topic = self
            .current_session
            .as_ref()
            .map(|session| session.topic.clone())
            .unwrap_or_default();

        let episode = self
            .episodic
            .store_episode(session_id, &topic, actions, outcomes, findings, summary, tags)
            .await?;

        // Fact extraction is best-effort; a failure must not lose the episode.
        let extracted_facts = match self.semantic.extract_facts_from_episode(&episode).await {
            Ok(facts) => facts,
            Err(error) => {
                warn!(%error, "fact extraction failed for stored episode");
                Vec::new()
            }
        };

        self.actions_since_reflection += action_count;
        let should_reflect = self.should_reflect();
        debug!(
            episode = %episode.id,
            facts = extracted_facts.len(),
            actions_since_reflection = self.actions_since_reflection,
            should_reflect,
            "experience stored"
        );

        Ok(StoredExperience { episode, extracted_facts, should_reflect })
    }

    // ── Reflection bookkeeping ───────────────────────────────────────────

    pub fn should_reflect(&self) -> bool {
        self.options.auto_reflect
            && self.actions_since_reflection >= self.options.reflection_interval
    }

    pub fn reset_reflection_counter(&mut self) {
        self.actions_since_reflection = 0;
    }

    pub fn actions_since_reflection(&self) -> u32 {
        self.actions_since_reflection
    }

    // ── Retrieval ────────────────────────────────────────────────────────

    pub async fn build_context(
        &self,
        query: &str,
        budget: &ContextBudget,
    ) -> Result<MemoryContext> {
        self.context.build_context(query, budget).await
    }

    pub async fn strategy_recommendations(
        &self,
        query: &str,
        available_tools: &[String],
        k: usize,
    ) -> Result<Vec<RankedStrategy>> {
        self.procedural.recommendations(query, available_tools, k).await
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Relevance decay, duplicate-fact merging, and stale-episode pruning.
    /// The episodic prune is independent of the fact pipeline and runs
    /// concurrently with it.
    pub async fn perform_maintenance(&self) -> Result<MaintenanceReport> {
        let semantic_pass = async {
            let decayed = self.semantic.update_relevance().await?;
            let merged = self.semantic.consolidate_similar(self.options.similarity_threshold).await?;
            Ok::<_, anyhow::Error>((decayed, merged))
        };
        let episodic_pass =
            self.episodic.consolidate_older_than(self.options.consolidation_threshold_days);

        let ((facts_decayed, facts_merged), episodes_pruned) =
            tokio::try_join!(semantic_pass, episodic_pass)?;

        let report = MaintenanceReport { facts_decayed, facts_merged, episodes_pruned };
        debug!(?report, "maintenance pass finished");
        Ok(report)
    }

    /// Counts used by the consolidation trigger.
    pub async fn memory_pressure(&self) -> Result<(usize, usize)> {
        let episodes = self.docs.count_episodes().await?;
        let facts = self.docs.count_facts().await?;
        Ok((episodes, facts))
    }
}
