//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use archivist_lib::embedding::{Embedding, EmbeddingError, EmbeddingProvider, EmbeddingResult};
use archivist_lib::{
    DocumentInput, DocumentMetadata, EngineConfig, InMemoryInteractionStore, InMemoryVectorStore,
    InteractionStore, Logger, RecallService,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};

/// Embedder with fixed vectors per text; unknown text hashes into three buckets
#[derive(Debug, Default)]
pub struct StaticEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl StaticEmbedder {
    pub fn new(entries: &[(&str, Vec<f32>)]) -> Self {
        Self {
            vectors: entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbedder {
    fn model_name(&self) -> &str {
        "static-test"
    }

    async fn embed(&self, text: &str, _content_type_hint: Option<&str>) -> EmbeddingResult<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        let vector = self.vectors.get(text).cloned().unwrap_or_else(|| {
            let mut v = vec![0.0f32; 3];
            for (i, b) in text.bytes().enumerate() {
                v[i % 3] += b as f32 / 255.0;
            }
            v
        });
        Ok(Embedding {
            vector,
            tokens_used: text.split_whitespace().count(),
        })
    }

    async fn health_check(&self) -> EmbeddingResult<()> {
        Ok(())
    }
}

pub struct Harness {
    pub service: RecallService,
    pub embedder: Arc<StaticEmbedder>,
    pub interactions: Arc<InMemoryInteractionStore>,
}

pub fn harness(embedder: StaticEmbedder) -> Harness {
    let embedder = Arc::new(embedder);
    let interactions = Arc::new(InMemoryInteractionStore::new());
    let service = RecallService::new(
        EngineConfig::default(),
        Arc::new(InMemoryVectorStore::default()),
        embedder.clone(),
        Some(interactions.clone() as Arc<dyn InteractionStore>),
        Logger::silent(),
    )
    .expect("default config is valid");

    Harness {
        service,
        embedder,
        interactions,
    }
}

/// Document with an explicit embedding, created `age_days` ago
pub fn document(
    id: &str,
    content: &str,
    embedding: Vec<f32>,
    content_type: &str,
    tags: &[&str],
    age_days: i64,
) -> DocumentInput {
    let created = Utc::now() - Duration::days(age_days);
    let metadata = DocumentMetadata {
        content_type: Some(content_type.to_string()),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        title: Some(id.to_string()),
        created_at: created,
        updated_at: created,
        ..DocumentMetadata::default()
    };
    DocumentInput::new(content, metadata).with_id(id).with_embedding(embedding)
}

/// Unit vector in the xy-plane whose normalized cosine to `[1, 0, 0]` is
/// `target`
pub fn vector_with_similarity(target: f32) -> Vec<f32> {
    let raw = 2.0 * target - 1.0;
    vec![raw, (1.0 - raw * raw).max(0.0).sqrt(), 0.0]
}
