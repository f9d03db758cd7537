//! Document-store interface: record CRUD plus the secondary-index queries
//! the managers need.  The in-memory implementation backs tests and
//! short-lived runs; the redb implementation in [`crate::index`] persists
//! the same interface to disk.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::schema::{EpisodicMemory, Fact, Feedback, Session, SessionStatus, Strategy};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub status: Option<SessionStatus>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Records with secondary indexes for sessions, episodes, facts, strategies,
/// and feedback.  Safe for concurrent use by the memory system's parallel
/// sub-tasks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // ── sessions ─────────────────────────────────────────────────────────
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<Session>, StoreError>;
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn delete_session(&self, id: &str) -> Result<bool, StoreError>;

    // ── episodes ─────────────────────────────────────────────────────────
    async fn store_episode(&self, episode: &EpisodicMemory) -> Result<(), StoreError>;
    async fn get_episode(&self, id: &str) -> Result<Option<EpisodicMemory>, StoreError>;
    async fn episodes_by_session(&self, session_id: &str)
        -> Result<Vec<EpisodicMemory>, StoreError>;
    async fn episodes_by_tag(&self, tag: &str) -> Result<Vec<EpisodicMemory>, StoreError>;
    async fn episodes_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EpisodicMemory>, StoreError>;
    async fn delete_episode(&self, id: &str) -> Result<bool, StoreError>;
    async fn count_episodes(&self) -> Result<usize, StoreError>;

    // ── facts ────────────────────────────────────────────────────────────
    async fn store_fact(&self, fact: &Fact) -> Result<(), StoreError>;
    async fn get_fact(&self, id: &str) -> Result<Option<Fact>, StoreError>;
    async fn update_fact(&self, fact: &Fact) -> Result<(), StoreError>;
    async fn all_facts(&self) -> Result<Vec<Fact>, StoreError>;
    async fn facts_by_category(&self, category: &str) -> Result<Vec<Fact>, StoreError>;
    /// Case-insensitive prefix match on fact content.
    async fn search_facts_by_text(&self, prefix: &str) -> Result<Vec<Fact>, StoreError>;
    async fn delete_fact(&self, id: &str) -> Result<bool, StoreError>;
    async fn count_facts(&self) -> Result<usize, StoreError>;

    // ── strategies ───────────────────────────────────────────────────────
    async fn store_strategy(&self, strategy: &Strategy) -> Result<(), StoreError>;
    async fn get_strategy(&self, id: &str) -> Result<Option<Strategy>, StoreError>;
    async fn update_strategy(&self, strategy: &Strategy) -> Result<(), StoreError>;
    async fn list_strategies(&self) -> Result<Vec<Strategy>, StoreError>;
    async fn delete_strategy(&self, id: &str) -> Result<bool, StoreError>;

    // ── feedback ─────────────────────────────────────────────────────────
    async fn store_feedback(&self, feedback: &Feedback) -> Result<(), StoreError>;
    async fn feedback_by_session(&self, session_id: &str) -> Result<Vec<Feedback>, StoreError>;
}

// ── In-memory implementation ─────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    episodes: HashMap<String, EpisodicMemory>,
    facts: HashMap<String, Fact>,
    strategies: HashMap<String, Strategy>,
    feedback: HashMap<String, Feedback>,
}

/// Process-local document store over `RwLock`-guarded maps.
#[derive(Default)]
pub struct MemoryDocumentStore {
    tables: RwLock<Tables>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.tables.write().await.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<Session>, StoreError> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|session| {
                query.status.is_none_or(|status| session.status == status)
                    && query.user_id.as_deref().is_none_or(|user| session.user_id.as_deref() == Some(user))
                    && query.since.is_none_or(|since| session.created_at >= since)
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound { kind: "session", id: session.id.clone() });
        }
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.sessions.remove(id).is_some())
    }

    async fn store_episode(&self, episode: &EpisodicMemory) -> Result<(), StoreError> {
        self.tables.write().await.episodes.insert(episode.id.clone(), episode.clone());
        Ok(())
    }

    async fn get_episode(&self, id: &str) -> Result<Option<EpisodicMemory>, StoreError> {
        Ok(self.tables.read().await.episodes.get(id).cloned())
    }

    async fn episodes_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<EpisodicMemory>, StoreError> {
        let tables = self.tables.read().await;
        let mut episodes: Vec<EpisodicMemory> = tables
            .episodes
            .values()
            .filter(|episode| episode.session_id == session_id)
            .cloned()
            .collect();
        episodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(episodes)
    }

    async fn episodes_by_tag(&self, tag: &str) -> Result<Vec<EpisodicMemory>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .episodes
            .values()
            .filter(|episode| episode.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }

    async fn episodes_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EpisodicMemory>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .episodes
            .values()
            .filter(|episode| episode.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_episode(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.episodes.remove(id).is_some())
    }

    async fn count_episodes(&self) -> Result<usize, StoreError> {
        Ok(self.tables.read().await.episodes.len())
    }

    async fn store_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        self.tables.write().await.facts.insert(fact.id.clone(), fact.clone());
        Ok(())
    }

    async fn get_fact(&self, id: &str) -> Result<Option<Fact>, StoreError> {
        Ok(self.tables.read().await.facts.get(id).cloned())
    }

    async fn update_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.facts.contains_key(&fact.id) {
            return Err(StoreError::NotFound { kind: "fact", id: fact.id.clone() });
        }
        tables.facts.insert(fact.id.clone(), fact.clone());
        Ok(())
    }

    async fn all_facts(&self) -> Result<Vec<Fact>, StoreError> {
        Ok(self.tables.read().await.facts.values().cloned().collect())
    }

    async fn facts_by_category(&self, category: &str) -> Result<Vec<Fact>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .facts
            .values()
            .filter(|fact| fact.category == category)
            .cloned()
            .collect())
    }

    async fn search_facts_by_text(&self, prefix: &str) -> Result<Vec<Fact>, StoreError> {
        let needle = prefix.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .facts
            .values()
            .filter(|fact| fact.content.to_lowercase().starts_with(&needle))
            .cloned()
            .collect())
    }

    async fn delete_fact(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.facts.remove(id).is_some())
    }

    async fn count_facts(&self) -> Result<usize, StoreError> {
        Ok(self.tables.read().await.facts.len())
    }

    async fn store_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        self.tables.write().await.strategies.insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn get_strategy(&self, id: &str) -> Result<Option<Strategy>, StoreError> {
        Ok(self.tables.read().await.strategies.get(id).cloned())
    }

    async fn update_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.strategies.contains_key(&strategy.id) {
            return Err(StoreError::NotFound { kind: "strategy", id: strategy.id.clone() });
        }
        tables.strategies.insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn list_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        let tables = self.tables.read().await;
        let mut strategies: Vec<Strategy> = tables.strategies.values().cloned().collect();
        strategies.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        Ok(strategies)
    }

    async fn delete_strategy(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.strategies.remove(id).is_some())
    }

    async fn store_feedback(&self, feedback: &Feedback) -> Result<(), StoreError> {
        self.tables.write().await.feedback.insert(feedback.id.clone(), feedback.clone());
        Ok(())
    }

    async fn feedback_by_session(&self, session_id: &str) -> Result<Vec<Feedback>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .feedback
            .values()
            .filter(|feedback| feedback.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::schema::{Complexity, Goal, new_id};

    fn sample_session(topic: &str, status: SessionStatus) -> Session {
        let now = Utc::now();
        Session {
            id: new_id(),
            user_id: Some("user-1".to_string()),
            topic: topic.to_string(),
            goal: Goal::new(topic, &["answered"], Complexity::Simple),
            status,
            created_at: now,
            updated_at: now,
            completed_at: None,
            parent_session_id: None,
        }
    }

    fn sample_fact(content: &str, category: &str) -> Fact {
        let now = Utc::now();
        Fact {
            id: new_id(),
            content: content.to_string(),
            category: category.to_string(),
            subcategory: None,
            source: "test".to_string(),
            confidence: 0.8,
            relevance: 1.0,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            last_modified: now,
            tags: Vec::new(),
            related_facts: Vec::new(),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn session_crud_roundtrip() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        let mut session = sample_session("rust agents", SessionStatus::Active);
        store.create_session(&session).await?;

        let loaded = store.get_session(&session.id).await?.unwrap();
        assert_eq!(loaded.topic, "rust agents");

        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        store.update_session(&session).await?;
        let loaded = store.get_session(&session.id).await?.unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);

        assert!(store.delete_session(&session.id).await?);
        assert!(!store.delete_session(&session.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_sessions_filters_by_status_user_and_time() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        store.create_session(&sample_session("one", SessionStatus::Active)).await?;
        store.create_session(&sample_session("two", SessionStatus::Completed)).await?;

        let active = store
            .list_sessions(&SessionQuery { status: Some(SessionStatus::Active), ..Default::default() })
            .await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].topic, "one");

        let recent = store
            .list_sessions(&SessionQuery {
                since: Some(Utc::now() + Duration::hours(1)),
                ..Default::default()
            })
            .await?;
        assert!(recent.is_empty());

        let by_user = store
            .list_sessions(&SessionQuery { user_id: Some("user-1".into()), ..Default::default() })
            .await?;
        assert_eq!(by_user.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn updating_a_missing_record_is_not_found() {
        let store = MemoryDocumentStore::new();
        let fact = sample_fact("water boils at 100C", "physics");
        let error = store.update_fact(&fact).await.unwrap_err();
        assert!(matches!(error, StoreError::NotFound { kind: "fact", .. }));
    }

    #[tokio::test]
    async fn fact_queries_by_category_and_prefix() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        store.store_fact(&sample_fact("Rust has ownership", "languages")).await?;
        store.store_fact(&sample_fact("Rust has lifetimes", "languages")).await?;
        store.store_fact(&sample_fact("Water is wet", "physics")).await?;

        assert_eq!(store.facts_by_category("languages").await?.len(), 2);
        assert_eq!(store.search_facts_by_text("rust has").await?.len(), 2);
        assert_eq!(store.search_facts_by_text("water").await?.len(), 1);
        assert_eq!(store.all_facts().await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn feedback_is_queryable_by_session() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        store
            .store_feedback(&Feedback {
                id: new_id(),
                session_id: "s1".to_string(),
                content: "synthesis missed the cost angle".to_string(),
                rating: Some(0.6),
                created_at: Utc::now(),
            })
            .await?;

        assert_eq!(store.feedback_by_session("s1").await?.len(), 1);
        assert!(store.feedback_by_session("s2").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn strategies_list_best_first() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        let now = Utc::now();
        for (name, rate) in [("weak", 0.2f32), ("strong", 0.9), ("middle", 0.5)] {
            store
                .store_strategy(&Strategy {
                    id: new_id(),
                    strategy_name: name.to_string(),
                    description: String::new(),
                    applicable_contexts: Vec::new(),
                    required_tools: Vec::new(),
                    success_rate: rate,
                    average_duration_ms: 0,
                    times_used: 0,
                    refinements: Vec::new(),
                    created_at: now,
                    last_used: None,
                    last_refined: None,
                })
                .await?;
        }
        let listed = store.list_strategies().await?;
        assert_eq!(listed[0].strategy_name, "strong");
        assert_eq!(listed[2].strategy_name, "weak");
        Ok(())
    }
}
