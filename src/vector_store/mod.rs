//! Vector Store Collaborator
//!
//! The retrieval core never owns persistence. It talks to a vector store
//! through the [`VectorStore`] trait: CRUD on [`VectorDocument`]s, a
//! nearest-neighbor `query` with a metadata pre-filter, and a `list` scan
//! used where no query vector exists (trending recommendations).
//!
//! ## Distance semantics
//!
//! `query` returns hits ordered by ascending distance, with
//! `VectorDocument::distance` populated. Distances are L2 and the core turns
//! them into similarities as `1 - distance`, so implementations are expected
//! to report distances in `[0, 1]`.
//!
//! [`InMemoryVectorStore`] is the reference implementation used by tests and
//! by hosts that keep a small archive in memory. It measures the L2 distance
//! between unit-normalized vectors and halves it, which maps opposite vectors
//! to 1.0 and identical directions to 0.0.

pub mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

pub use types::{
    DocumentMetadata, MetadataFilter, TimeRange, VectorDocument, VectorStoreError,
    VectorStoreResult,
};

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Name of the collection backing this store, used in error context
    fn collection(&self) -> &str;

    async fn add(&self, document: VectorDocument) -> VectorStoreResult<()>;

    /// Insert several documents. Returns one result per input, in order.
    async fn add_batch(&self, documents: Vec<VectorDocument>) -> Vec<VectorStoreResult<()>> {
        let mut results = Vec::with_capacity(documents.len());
        for document in documents {
            results.push(self.add(document).await);
        }
        results
    }

    async fn get(&self, id: &str) -> VectorStoreResult<VectorDocument>;

    async fn delete(&self, id: &str) -> VectorStoreResult<()>;

    async fn update(&self, document: VectorDocument) -> VectorStoreResult<()>;

    /// Nearest neighbors of `vector` among documents matching `filter`.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> VectorStoreResult<Vec<VectorDocument>>;

    /// Documents matching `filter`, newest first, without vector ranking.
    async fn list(&self, filter: &MetadataFilter, limit: usize) -> VectorStoreResult<Vec<VectorDocument>>;

    async fn count(&self) -> VectorStoreResult<usize>;
}

#[derive(Debug, Default)]
struct StoreState {
    documents: HashMap<String, VectorDocument>,
    dimension: Option<usize>,
}

impl StoreState {
    fn check_dimension(&self, document: &VectorDocument) -> VectorStoreResult<()> {
        match self.dimension {
            Some(expected) if expected != document.dimension() => Err(VectorStoreError::DimensionMismatch {
                expected,
                actual: document.dimension(),
            }),
            _ => Ok(()),
        }
    }
}

/// Thread-safe in-memory vector store
#[derive(Debug)]
pub struct InMemoryVectorStore {
    collection: String,
    state: RwLock<StoreState>,
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new("archive")
    }
}

impl InMemoryVectorStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: RwLock::new(StoreState::default()),
        }
    }

    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    /// Halved L2 distance between the unit-normalized forms of `a` and `b`.
    fn normalized_distance(a: &[f32], b: &[f32]) -> f32 {
        let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 1.0;
        }

        let squared: f32 = a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x / norm_a - y / norm_b;
                d * d
            })
            .sum();

        (squared.sqrt() / 2.0).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn add(&self, document: VectorDocument) -> VectorStoreResult<()> {
        document.validate()?;

        let mut state = self.state.write().await;
        if state.documents.contains_key(&document.id) {
            return Err(VectorStoreError::DuplicateId { id: document.id });
        }
        state.check_dimension(&document)?;
        if state.dimension.is_none() {
            state.dimension = Some(document.dimension());
        }

        let mut document = document;
        document.distance = None;
        state.documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn get(&self, id: &str) -> VectorStoreResult<VectorDocument> {
        let state = self.state.read().await;
        state
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| VectorStoreError::NotFound { id: id.to_string() })
    }

    async fn delete(&self, id: &str) -> VectorStoreResult<()> {
        let mut state = self.state.write().await;
        if state.documents.remove(id).is_none() {
            return Err(VectorStoreError::NotFound { id: id.to_string() });
        }
        if state.documents.is_empty() {
            state.dimension = None;
        }
        Ok(())
    }

    async fn update(&self, document: VectorDocument) -> VectorStoreResult<()> {
        document.validate()?;

        let mut state = self.state.write().await;
        if !state.documents.contains_key(&document.id) {
            return Err(VectorStoreError::NotFound { id: document.id });
        }
        // A lone document may change dimension; otherwise it must match the rest
        if state.documents.len() > 1 {
            state.check_dimension(&document)?;
        } else {
            state.dimension = Some(document.dimension());
        }

        let mut document = document;
        document.distance = None;
        document.metadata.touch();
        state.documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> VectorStoreResult<Vec<VectorDocument>> {
        if vector.is_empty() {
            return Err(VectorStoreError::InvalidDocument {
                reason: "query vector cannot be empty".to_string(),
            });
        }

        let state = self.state.read().await;
        if let Some(expected) = state.dimension {
            if expected != vector.len() {
                return Err(VectorStoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let mut hits: Vec<VectorDocument> = state
            .documents
            .values()
            .filter(|doc| filter.matches(&doc.metadata))
            .map(|doc| {
                let mut hit = doc.clone();
                hit.distance = Some(Self::normalized_distance(vector, &doc.embedding));
                hit
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);

        Ok(hits)
    }

    async fn list(&self, filter: &MetadataFilter, limit: usize) -> VectorStoreResult<Vec<VectorDocument>> {
        let state = self.state.read().await;
        let mut docs: Vec<VectorDocument> = state
            .documents
            .values()
            .filter(|doc| filter.matches(&doc.metadata))
            .cloned()
            .collect();

        docs.sort_by(|a, b| {
            b.metadata
                .created_at
                .cmp(&a.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        docs.truncate(limit);

        Ok(docs)
    }

    async fn count(&self) -> VectorStoreResult<usize> {
        Ok(self.state.read().await.documents.len())
    }
}
