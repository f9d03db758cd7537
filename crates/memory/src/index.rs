//! Persistent [`DocumentStore`] backed by [`redb`].
//!
//! # Tables
//!
//! | Name                  | Key            | Value                          |
//! |-----------------------|----------------|--------------------------------|
//! | `sessions`            | record id      | bincode-serialised `Session`   |
//! | `episodes`            | record id      | bincode `EpisodicMemory`       |
//! | `facts`               | record id      | bincode `Fact`                 |
//! | `strategies`          | record id      | bincode `Strategy`             |
//! | `feedback`            | record id      | bincode `Feedback`             |
//! | `episodes_by_session` | session id     | newline-joined episode id list |
//!
//! The session secondary index is write-through: `store_episode` updates it
//! in the same transaction as the record itself.  Category/tag/time queries
//! scan, which stays cheap at single-agent volumes.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::schema::{EpisodicMemory, Fact, Feedback, Session, Strategy};
use crate::store::{DocumentStore, SessionQuery, StoreError};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const EPISODES: TableDefinition<&str, &[u8]> = TableDefinition::new("episodes");
const FACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("facts");
const STRATEGIES: TableDefinition<&str, &[u8]> = TableDefinition::new("strategies");
const FEEDBACK: TableDefinition<&str, &[u8]> = TableDefinition::new("feedback");
const EPISODES_BY_SESSION: TableDefinition<&str, &str> =
    TableDefinition::new("episodes_by_session");

pub struct RedbDocumentStore {
    db: Database,
}

fn backend(error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl RedbDocumentStore {
    /// Open (or create) the database file and ensure all tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        let write_txn = db.begin_write().map_err(backend)?;
        {
            write_txn.open_table(SESSIONS).map_err(backend)?;
            write_txn.open_table(EPISODES).map_err(backend)?;
            write_txn.open_table(FACTS).map_err(backend)?;
            write_txn.open_table(STRATEGIES).map_err(backend)?;
            write_txn.open_table(FEEDBACK).map_err(backend)?;
            write_txn.open_table(EPISODES_BY_SESSION).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        debug!(path = %path.as_ref().display(), "redb document store opened");
        Ok(Self { db })
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = encode(value)?;
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut t = write_txn.open_table(table).map_err(backend)?;
            t.insert(id, bytes.as_slice()).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(table).map_err(backend)?;
        match t.get(id).map_err(backend)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn remove(
        &self,
        table: TableDefinition<&str, &[u8]>,
        id: &str,
    ) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        let existed;
        {
            let mut t = write_txn.open_table(table).map_err(backend)?;
            existed = t.remove(id).map_err(backend)?.is_some();
        }
        write_txn.commit().map_err(backend)?;
        Ok(existed)
    }

    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(table).map_err(backend)?;
        let mut records = Vec::new();
        for entry in t.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            records.push(decode(value.value())?);
        }
        Ok(records)
    }

    fn exists(
        &self,
        table: TableDefinition<&str, &[u8]>,
        id: &str,
    ) -> Result<bool, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(table).map_err(backend)?;
        Ok(t.get(id).map_err(backend)?.is_some())
    }
}

#[async_trait]
impl DocumentStore for RedbDocumentStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.put(SESSIONS, &session.id, session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.fetch(SESSIONS, id)
    }

    async fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .scan::<Session>(SESSIONS)?
            .into_iter()
            .filter(|session| {
                query.status.is_none_or(|status| session.status == status)
                    && query
                        .user_id
                        .as_deref()
                        .is_none_or(|user| session.user_id.as_deref() == Some(user))
                    && query.since.is_none_or(|since| session.created_at >= since)
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        if !self.exists(SESSIONS, &session.id)? {
            return Err(StoreError::NotFound { kind: "session", id: session.id.clone() });
        }
        self.put(SESSIONS, &session.id, session)
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        self.remove(SESSIONS, id)
    }

    async fn store_episode(&self, episode: &EpisodicMemory) -> Result<(), StoreError> {
        let bytes = encode(episode)?;
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut episodes = write_txn.open_table(EPISODES).map_err(backend)?;
            episodes.insert(episode.id.as_str(), bytes.as_slice()).map_err(backend)?;

            // Write-through secondary index: append the id to the session's
            // newline-joined list unless it is already present.
            let mut by_session = write_txn.open_table(EPISODES_BY_SESSION).map_err(backend)?;
            let existing = by_session
                .get(episode.session_id.as_str())
                .map_err(backend)?
                .map(|guard| guard.value().to_string())
                .unwrap_or_default();
            if !existing.lines().any(|line| line == episode.id) {
                let updated = if existing.is_empty() {
                    episode.id.clone()
                } else {
                    format!("{existing}\n{}", episode.id)
                };
                by_session
                    .insert(episode.session_id.as_str(), updated.as_str())
                    .map_err(backend)?;
            }
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }

    async fn get_episode(&self, id: &str) -> Result<Option<EpisodicMemory>, StoreError> {
        self.fetch(EPISODES, id)
    }

    async fn episodes_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<EpisodicMemory>, StoreError> {
        let ids: Vec<String> = {
            let read_txn = self.db.begin_read().map_err(backend)?;
            let by_session = read_txn.open_table(EPISODES_BY_SESSION).map_err(backend)?;
            match by_session.get(session_id).map_err(backend)? {
                Some(guard) => guard.value().lines().map(ToString::to_string).collect(),
                None => Vec::new(),
            }
        };

        let mut episodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(episode) = self.fetch::<EpisodicMemory>(EPISODES, &id)? {
                episodes.push(episode);
            }
        }
        episodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(episodes)
    }

    async fn episodes_by_tag(&self, tag: &str) -> Result<Vec<EpisodicMemory>, StoreError> {
        Ok(self
            .scan::<EpisodicMemory>(EPISODES)?
            .into_iter()
            .filter(|episode| episode.tags.iter().any(|t| t == tag))
            .collect())
    }

    async fn episodes_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EpisodicMemory>, StoreError> {
        Ok(self
            .scan::<EpisodicMemory>(EPISODES)?
            .into_iter()
            .filter(|episode| episode.created_at < cutoff)
            .collect())
    }

    async fn delete_episode(&self, id: &str) -> Result<bool, StoreError> {
        self.remove(EPISODES, id)
    }

    async fn count_episodes(&self) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(EPISODES).map_err(backend)?;
        Ok(t.len().map_err(backend)? as usize)
    }

    async fn store_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        self.put(FACTS, &fact.id, fact)
    }

    async fn get_fact(&self, id: &str) -> Result<Option<Fact>, StoreError> {
        self.fetch(FACTS, id)
    }

    async fn update_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        if !self.exists(FACTS, &fact.id)? {
            return Err(StoreError::NotFound { kind: "fact", id: fact.id.clone() });
        }
        self.put(FACTS, &fact.id, fact)
    }

    async fn all_facts(&self) -> Result<Vec<Fact>, StoreError> {
        self.scan(FACTS)
    }

    async fn facts_by_category(&self, category: &str) -> Result<Vec<Fact>, StoreError> {
        Ok(self
            .scan::<Fact>(FACTS)?
            .into_iter()
            .filter(|fact| fact.category == category)
            .collect())
    }

    async fn search_facts_by_text(&self, prefix: &str) -> Result<Vec<Fact>, StoreError> {
        let needle = prefix.to_lowercase();
        Ok(self
            .scan::<Fact>(FACTS)?
            .into_iter()
            .filter(|fact| fact.content.to_lowercase().starts_with(&needle))
            .collect())
    }

    async fn delete_fact(&self, id: &str) -> Result<bool, StoreError> {
        self.remove(FACTS, id)
    }

    async fn count_facts(&self) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let t = read_txn.open_table(FACTS).map_err(backend)?;
        Ok(t.len().map_err(backend)? as usize)
    }

    async fn store_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        self.put(STRATEGIES, &strategy.id, strategy)
    }

    async fn get_strategy(&self, id: &str) -> Result<Option<Strategy>, StoreError> {
        self.fetch(STRATEGIES, id)
    }

    async fn update_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        if !self.exists(STRATEGIES, &strategy.id)? {
            return Err(StoreError::NotFound { kind: "strategy", id: strategy.id.clone() });
        }
        self.put(STRATEGIES, &strategy.id, strategy)
    }

    async fn list_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        let mut strategies = self.scan::<Strategy>(STRATEGIES)?;
        strategies.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        Ok(strategies)
    }

    async fn delete_strategy(&self, id: &str) -> Result<bool, StoreError> {
        self.remove(STRATEGIES, id)
    }

    async fn store_feedback(&self, feedback: &Feedback) -> Result<(), StoreError> {
        self.put(FEEDBACK, &feedback.id, feedback)
    }

    async fn feedback_by_session(&self, session_id: &str) -> Result<Vec<Feedback>, StoreError> {
        Ok(self
            .scan::<Feedback>(FEEDBACK)?
            .into_iter()
            .filter(|feedback| feedback.session_id == session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        Action, ActionKind, ActionParams, Complexity, Goal, SessionStatus, new_id,
    };

    fn sample_episode(session_id: &str, tag: &str) -> EpisodicMemory {
        let now = Utc::now();
        EpisodicMemory {
            id: new_id(),
            session_id: session_id.to_string(),
            topic: "redb persistence".to_string(),
            actions: vec![Action {
                id: new_id(),
                session_id: session_id.to_string(),
                kind: ActionKind::Search,
                tool: "web_search".to_string(),
                params: ActionParams::Search { query: "redb".to_string(), max_results: 5 },
                reasoning: "look things up".to_string(),
                strategy: None,
                timestamp: now,
            }],
            outcomes: Vec::new(),
            findings: Vec::new(),
            duration_ms: 120,
            success: true,
            summary: "searched for redb docs".to_string(),
            tags: vec![tag.to_string()],
            embedding: None,
            feedback: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn sessions_roundtrip_through_the_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RedbDocumentStore::open(dir.path().join("delver.redb"))?;
        let now = Utc::now();
        let session = Session {
            id: new_id(),
            user_id: None,
            topic: "persistence".to_string(),
            goal: Goal::new("persist things", &["stored"], Complexity::Simple),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            parent_session_id: None,
        };
        store.create_session(&session).await?;

        let loaded = store.get_session(&session.id).await?.unwrap();
        assert_eq!(loaded.topic, "persistence");
        assert_eq!(loaded.status, SessionStatus::Active);

        let listed = store.list_sessions(&SessionQuery::default()).await?;
        assert_eq!(listed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn episode_secondary_index_serves_session_queries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RedbDocumentStore::open(dir.path().join("delver.redb"))?;

        let session_a = new_id();
        let session_b = new_id();
        store.store_episode(&sample_episode(&session_a, "gather")).await?;
        store.store_episode(&sample_episode(&session_a, "analyze")).await?;
        store.store_episode(&sample_episode(&session_b, "gather")).await?;

        assert_eq!(store.episodes_by_session(&session_a).await?.len(), 2);
        assert_eq!(store.episodes_by_session(&session_b).await?.len(), 1);
        assert_eq!(store.episodes_by_tag("gather").await?.len(), 2);
        assert!(store.episodes_by_session("absent").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn storing_the_same_episode_twice_does_not_duplicate_the_index() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RedbDocumentStore::open(dir.path().join("delver.redb"))?;
        let session_id = new_id();
        let episode = sample_episode(&session_id, "gather");

        store.store_episode(&episode).await?;
        store.store_episode(&episode).await?;

        assert_eq!(store.episodes_by_session(&session_id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn records_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("delver.redb");
        let session_id = new_id();
        {
            let store = RedbDocumentStore::open(&path)?;
            store.store_episode(&sample_episode(&session_id, "gather")).await?;
        }

        let reopened = RedbDocumentStore::open(&path)?;
        let episodes = reopened.episodes_by_session(&session_id).await?;
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].actions[0].tool, "web_search");
        Ok(())
    }

    #[tokio::test]
    async fn update_of_missing_strategy_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RedbDocumentStore::open(dir.path().join("delver.redb"))?;
        let strategy = Strategy {
            id: new_id(),
            strategy_name: "ghost".to_string(),
            description: String::new(),
            applicable_contexts: Vec::new(),
            required_tools: Vec::new(),
            success_rate: 0.5,
            average_duration_ms: 0,
            times_used: 0,
            refinements: Vec::new(),
            created_at: Utc::now(),
            last_used: None,
            last_refined: None,
        };
        let error = store.update_strategy(&strategy).await.unwrap_err();
        assert!(matches!(error, StoreError::NotFound { kind: "strategy", .. }));
        Ok(())
    }
}
