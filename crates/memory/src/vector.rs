//! Vector-store interface: per-collection k-NN search over labeled vectors.
//!
//! Scores are cosine similarity (higher is closer).  The in-memory
//! implementation does an exact scan per query, which is plenty for the
//! collection sizes a single agent instance accumulates.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::StoreError;

/// Logical collection names used by the memory system.
pub const EPISODIC_COLLECTION: &str = "episodic_memory";
pub const SEMANTIC_COLLECTION: &str = "semantic_memory";
pub const PROCEDURAL_COLLECTION: &str = "procedural_memory";

/// Equality filter over entry metadata; every listed pair must match.
pub type MetadataFilter = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;
    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError>;

    async fn store_embedding(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    async fn store_batch(
        &self,
        collection: &str,
        items: Vec<(String, Vec<f32>, HashMap<String, String>)>,
    ) -> Result<(), StoreError>;

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

// ── In-memory implementation ─────────────────────────────────────────────────

struct StoredVector {
    vector: Vec<f32>,
    metadata: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, StoredVector>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct with the three memory collections pre-created.
    pub async fn with_memory_collections() -> Self {
        let store = Self::new();
        for name in [EPISODIC_COLLECTION, SEMANTIC_COLLECTION, PROCEDURAL_COLLECTION] {
            // Infallible for the in-memory backend.
            let _ = store.create_collection(name).await;
        }
        store
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.write().await.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.collections.write().await.remove(name).is_some())
    }

    async fn store_embedding(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let entries = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::Backend(format!("unknown collection: {collection}")))?;
        entries.insert(id.to_string(), StoredVector { vector, metadata });
        Ok(())
    }

    async fn store_batch(
        &self,
        collection: &str,
        items: Vec<(String, Vec<f32>, HashMap<String, String>)>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let entries = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::Backend(format!("unknown collection: {collection}")))?;
        for (id, vector, metadata) in items {
            entries.insert(id, StoredVector { vector, metadata });
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let collections = self.collections.read().await;
        let entries = collections
            .get(collection)
            .ok_or_else(|| StoreError::Backend(format!("unknown collection: {collection}")))?;

        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter(|(_, stored)| {
                filter.is_none_or(|wanted| {
                    wanted
                        .iter()
                        .all(|(key, value)| stored.metadata.get(key) == Some(value))
                })
            })
            .map(|(id, stored)| SearchHit {
                id: id.clone(),
                score: cosine_similarity(query, &stored.vector),
                metadata: stored.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.write().await;
        let entries = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::Backend(format!("unknown collection: {collection}")))?;
        Ok(entries.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_respects_k() -> anyhow::Result<()> {
        let store = MemoryVectorStore::new();
        store.create_collection("test").await?;
        store.store_embedding("test", "near", vec![1.0, 0.0, 0.0], meta(&[])).await?;
        store.store_embedding("test", "mid", vec![0.7, 0.7, 0.0], meta(&[])).await?;
        store.store_embedding("test", "far", vec![0.0, 0.0, 1.0], meta(&[])).await?;

        let hits = store.search("test", &[1.0, 0.0, 0.0], 2, None).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[1].id, "mid");
        assert!(hits[0].score > hits[1].score);
        Ok(())
    }

    #[tokio::test]
    async fn metadata_filters_restrict_candidates() -> anyhow::Result<()> {
        let store = MemoryVectorStore::new();
        store.create_collection("test").await?;
        store
            .store_embedding("test", "a", vec![1.0, 0.0], meta(&[("success", "true")]))
            .await?;
        store
            .store_embedding("test", "b", vec![1.0, 0.0], meta(&[("success", "false")]))
            .await?;

        let filter = meta(&[("success", "true")]);
        let hits = store.search("test", &[1.0, 0.0], 10, Some(&filter)).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_collection_is_a_backend_error() {
        let store = MemoryVectorStore::new();
        let error = store.search("ghost", &[1.0], 1, None).await.unwrap_err();
        assert!(matches!(error, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn batch_store_and_delete() -> anyhow::Result<()> {
        let store = MemoryVectorStore::with_memory_collections().await;
        store
            .store_batch(
                EPISODIC_COLLECTION,
                vec![
                    ("e1".to_string(), vec![1.0, 0.0], meta(&[])),
                    ("e2".to_string(), vec![0.0, 1.0], meta(&[])),
                ],
            )
            .await?;

        assert!(store.delete(EPISODIC_COLLECTION, "e1").await?);
        assert!(!store.delete(EPISODIC_COLLECTION, "e1").await?);
        let hits = store.search(EPISODIC_COLLECTION, &[1.0, 0.0], 10, None).await?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
