//! # Semantic Search Engine
//!
//! Runs a query end to end:
//!
//! 1. Validate the options and apply defaults (top-k 10, max results 100,
//!    cosine metric)
//! 2. Preprocess the query text
//! 3. Resolve the query vector through the query-vector cache, embedding on a
//!    miss
//! 4. Translate the options into a [`MetadataFilter`]
//! 5. Query the vector store for up to `max_results` candidates and keep the
//!    ones meeting `min_similarity` under the chosen metric
//! 6. Enrich every hit: keywords, excerpt, composite relevance
//! 7. Optionally rerank (plain relevance sort, or a full [`Ranker`] pass when
//!    ranking options are supplied)
//! 8. Apply the final threshold, strip content if not wanted, truncate to
//!    top-k and assign ranks
//!
//! Relevance is `0.6 * similarity + 0.2 * keyword coverage + 0.1 * importance
//! + 0.1 * freshness`, clamped to [0, 1]. Weights come from
//! [`RelevanceWeights`].
//!
//! Every collaborator call goes through the caller's [`RequestContext`].
//! Individual hits with unusable embeddings are logged and skipped; store and
//! embedding failures fail the request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache_manager::CacheManager;
use crate::embedding::EmbeddingProvider;
use crate::errors::{RecallError, RecallResult};
use crate::interactions::PersonalizationContext;
use crate::logging::Logger;
use crate::ranking::{
    DiversityConfig, RankFeatures, Rankable, Ranker, RankingOptions, TimeDecayConfig,
};
use crate::request_context::RequestContext;
use crate::similarity::{SimilarityCalculator, SimilarityMetric};
use crate::text_processing;
use crate::vector_store::{DocumentMetadata, MetadataFilter, TimeRange, VectorDocument, VectorStore};

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// Weights of the composite relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceWeights {
    pub similarity: f32,
    pub keyword_coverage: f32,
    pub importance: f32,
    pub freshness: f32,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            similarity: 0.6,
            keyword_coverage: 0.2,
            importance: 0.1,
            freshness: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchEngineConfig {
    pub relevance_weights: RelevanceWeights,
    /// Half-life of the freshness factor in days
    pub freshness_half_life_days: f64,
    /// Importance assumed for documents that carry none
    pub default_importance: f32,
    pub summary_max_chars: usize,
    pub summary_window_words: usize,
    /// Single-token queries up to this length are lowercased
    pub short_query_max_chars: usize,
    /// Caps applied when a search asks for diversity without ranking options
    pub diversity: DiversityConfig,
}

impl Default for SearchEngineConfig {
    fn default() -> Self {
        Self {
            relevance_weights: RelevanceWeights::default(),
            freshness_half_life_days: 365.0, // Halves roughly yearly
            default_importance: 0.5,
            summary_max_chars: 200,
            summary_window_words: 30,
            short_query_max_chars: 3,
            diversity: DiversityConfig {
                enabled: true,
                ..DiversityConfig::default()
            },
        }
    }
}

impl SearchEngineConfig {
    pub fn validate(&self) -> RecallResult<()> {
        let w = &self.relevance_weights;
        for (name, weight) in [
            ("similarity", w.similarity),
            ("keyword_coverage", w.keyword_coverage),
            ("importance", w.importance),
            ("freshness", w.freshness),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RecallError::validation(
                    format!("search.relevance_weights.{}", name),
                    "must be a non-negative number",
                ));
            }
        }
        if !(self.freshness_half_life_days > 0.0) {
            return Err(RecallError::validation("search.freshness_half_life_days", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.default_importance) {
            return Err(RecallError::validation("search.default_importance", "must be within [0, 1]"));
        }
        if self.summary_max_chars < 10 {
            return Err(RecallError::validation("search.summary_max_chars", "must be at least 10"));
        }
        if self.summary_window_words == 0 {
            return Err(RecallError::validation("search.summary_window_words", "must be greater than 0"));
        }
        Ok(())
    }

    fn freshness_decay(&self) -> TimeDecayConfig {
        TimeDecayConfig {
            half_life_days: self.freshness_half_life_days,
            min_score: 0.0,
            recent_window_days: 0.0,
            recent_boost: 1.0,
        }
    }
}

/// Per-call search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub query: String,
    pub top_k: Option<usize>,
    pub max_results: Option<usize>,
    pub min_similarity: f32,
    pub similarity_metric: Option<SimilarityMetric>,
    pub user_id: Option<String>,
    pub content_types: Vec<String>,
    pub tags: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub min_importance: Option<f32>,
    pub include_content: bool,
    pub enable_reranking: bool,
    pub enable_diversity: bool,
    pub include_explanations: bool,
    /// Full ranking pass instead of the plain relevance sort
    pub ranking: Option<RankingOptions>,
    pub personalization: Option<PersonalizationContext>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            top_k: None,
            max_results: None,
            min_similarity: 0.0,
            similarity_metric: None,
            user_id: None,
            content_types: Vec::new(),
            tags: Vec::new(),
            time_range: None,
            min_importance: None,
            include_content: true,
            enable_reranking: true,
            enable_diversity: false,
            include_explanations: false,
            ranking: None,
            personalization: None,
        }
    }
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_content_types(mut self, types: &[&str]) -> Self {
        self.content_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn resolved_top_k(&self) -> usize {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }

    pub fn resolved_max_results(&self) -> usize {
        self.max_results.unwrap_or(DEFAULT_MAX_RESULTS)
    }

    pub fn resolved_metric(&self) -> SimilarityMetric {
        self.similarity_metric.unwrap_or_default()
    }

    /// Checks that need no vector, so they can run before any I/O
    pub fn validate_limits(&self) -> RecallResult<()> {
        if self.top_k == Some(0) {
            return Err(RecallError::validation("top_k", "must be greater than 0"));
        }
        if self.max_results == Some(0) {
            return Err(RecallError::validation("max_results", "must be greater than 0"));
        }
        if !self.min_similarity.is_finite() || !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(RecallError::validation("min_similarity", "must be within [0, 1]"));
        }
        if let Some(min) = self.min_importance {
            if !min.is_finite() || !(0.0..=1.0).contains(&min) {
                return Err(RecallError::validation("min_importance", "must be within [0, 1]"));
            }
        }
        if let Some(TimeRange { start: Some(start), end: Some(end) }) = self.time_range {
            if start > end {
                return Err(RecallError::validation("time_range", "start is after end"));
            }
        }
        if let Some(ranking) = &self.ranking {
            ranking.validate()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> RecallResult<()> {
        if self.query.trim().is_empty() {
            return Err(RecallError::validation("query", "cannot be empty"));
        }
        self.validate_limits()
    }

    /// AND across fields, OR within each field's values
    pub fn metadata_filter(&self) -> MetadataFilter {
        MetadataFilter {
            user_id: self.user_id.clone(),
            content_types: self.content_types.clone(),
            tags: self.tags.clone(),
            time_range: self.time_range,
            min_importance: self.min_importance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub similarity: f32,
    pub relevance_score: f32,
    pub keyword_score: f32,
    /// 1-based, assigned after final ordering
    pub rank: usize,
    pub matched_keywords: Vec<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<BTreeMap<String, f32>>,
    pub metadata: DocumentMetadata,
    pub created_at: DateTime<Utc>,
}

impl Rankable for SearchResultItem {
    fn features(&self) -> RankFeatures<'_> {
        RankFeatures {
            id: &self.document_id,
            similarity: self.similarity,
            relevance: self.relevance_score,
            keyword_score: self.keyword_score,
            importance: self.metadata.importance,
            created_at: self.created_at,
            content_type: self.metadata.content_type.as_deref(),
            tags: &self.metadata.tags,
        }
    }

    fn set_rank(&mut self, rank: usize) {
        self.rank = rank;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchTiming {
    pub embedding_ms: u64,
    pub vector_search_ms: u64,
    pub scoring_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<SearchResultItem>,
    /// Preprocessed query text
    pub query: String,
    /// Hits returned by the vector store before thresholds and truncation
    pub total_candidates: usize,
    pub query_vector_cached: bool,
    pub metric: SimilarityMetric,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diversity_score: Option<f32>,
    pub timing: SearchTiming,
}

/// Input for indexing or updating a document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentInput {
    /// Generated when absent on index
    pub id: Option<String>,
    pub content: String,
    pub metadata: DocumentMetadata,
    /// Embedded from `content` when absent
    pub embedding: Option<Vec<f32>>,
}

impl DocumentInput {
    pub fn new(content: impl Into<String>, metadata: DocumentMetadata) -> Self {
        Self {
            id: None,
            content: content.into(),
            metadata,
            embedding: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Position in the input batch
    pub index: usize,
    pub id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchIndexReport {
    pub succeeded: usize,
    pub failed: usize,
    pub indexed_ids: Vec<String>,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    searches: AtomicU64,
    failed_searches: AtomicU64,
    total_search_ms: AtomicU64,
    documents_indexed: AtomicU64,
    documents_updated: AtomicU64,
    documents_deleted: AtomicU64,
    index_failures: AtomicU64,
    skipped_hits: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_searches: u64,
    pub failed_searches: u64,
    pub average_search_ms: u64,
    pub documents_indexed: u64,
    pub documents_updated: u64,
    pub documents_deleted: u64,
    pub index_failures: u64,
    /// Hits dropped for unusable embeddings
    pub skipped_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentStatus {
    fn from_result<T, E: std::fmt::Display>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self { healthy: true, error: None },
            Err(e) => Self { healthy: false, error: Some(e.to_string()) },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorHealth {
    pub vector_store: ComponentStatus,
    pub embedding_provider: ComponentStatus,
    pub document_count: Option<usize>,
}

/// A candidate after similarity scoring, before enrichment
struct ScoredHit {
    document: VectorDocument,
    similarity: f32,
}

pub struct SemanticSearchEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<CacheManager>,
    config: SearchEngineConfig,
    counters: EngineCounters,
    logger: Logger,
}

impl SemanticSearchEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Arc<CacheManager>,
        config: SearchEngineConfig,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            embedder,
            cache,
            config,
            counters: EngineCounters::default(),
            logger,
        }
    }

    pub fn config(&self) -> &SearchEngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn search(&self, ctx: &RequestContext, options: &SearchOptions) -> RecallResult<SearchResponse> {
        let started = Instant::now();
        let result = self.search_inner(ctx, options, started).await;

        let elapsed = started.elapsed().as_millis() as u64;
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        self.counters.total_search_ms.fetch_add(elapsed, Ordering::Relaxed);

        match &result {
            Ok(response) => self.logger.info(format_args!(
                "🔍 Search '{}' returned {} results in {}ms (cached vector: {})",
                response.query,
                response.items.len(),
                elapsed,
                response.query_vector_cached
            )),
            Err(e) => {
                self.counters.failed_searches.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(format_args!("❌ Search failed after {}ms: {}", elapsed, e));
            }
        }

        result
    }

    async fn search_inner(
        &self,
        ctx: &RequestContext,
        options: &SearchOptions,
        started: Instant,
    ) -> RecallResult<SearchResponse> {
        options.validate()?;
        ctx.check("search")?;

        let query = text_processing::preprocess_query(&options.query, self.config.short_query_max_chars);

        let embed_started = Instant::now();
        let (vector, cached) = self.resolve_query_vector(ctx, &query, options).await?;
        let embedding_ms = embed_started.elapsed().as_millis() as u64;

        let mut response = self.search_by_vector(ctx, &vector, &query, options).await?;
        response.query_vector_cached = cached;
        response.timing.embedding_ms = embedding_ms;
        response.timing.total_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    /// Cached embedding of the preprocessed query, generated on a miss
    pub async fn resolve_query_vector(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &SearchOptions,
    ) -> RecallResult<(Vec<f32>, bool)> {
        let key = CacheManager::query_vector_key(query, options);
        if let Some(vector) = self.cache.query_vectors().get(&key).await {
            return Ok((vector, true));
        }

        let embedding = ctx
            .run("embedding.embed", async {
                self.embedder
                    .embed(query, None)
                    .await
                    .map_err(|e| e.into_recall("embed", format!("model={}", self.embedder.model_name())))
            })
            .await?;

        self.cache.query_vectors().set(&key, embedding.vector.clone()).await;
        Ok((embedding.vector, false))
    }

    /// Steps 4-8 for an already resolved query vector. `query_text` feeds
    /// keyword matching and excerpts; it may be empty.
    pub async fn search_by_vector(
        &self,
        ctx: &RequestContext,
        vector: &[f32],
        query_text: &str,
        options: &SearchOptions,
    ) -> RecallResult<SearchResponse> {
        options.validate_limits()?;
        if vector.is_empty() {
            return Err(RecallError::validation("query_vector", "cannot be empty"));
        }

        let metric = options.resolved_metric();
        let filter = options.metadata_filter();
        let max_results = options.resolved_max_results();

        let store_started = Instant::now();
        let hits = ctx
            .run("vector_store.query", async {
                self.store.query(vector, max_results, &filter).await.map_err(|e| {
                    e.into_recall(
                        "query",
                        format!("collection={}, top_k={}", self.store.collection(), max_results),
                    )
                })
            })
            .await?;
        let vector_search_ms = store_started.elapsed().as_millis() as u64;
        let total_candidates = hits.len();

        let scoring_started = Instant::now();
        let scored: Vec<ScoredHit> = hits
            .into_iter()
            .filter_map(|document| self.score_hit(document, vector, metric))
            .filter(|hit| hit.similarity >= options.min_similarity)
            .collect();

        let query_keywords = text_processing::keyword_tokens(query_text);
        let now = Utc::now();
        let mut items: Vec<SearchResultItem> = scored
            .into_iter()
            .map(|hit| self.enrich(hit, &query_keywords, options, now))
            .collect();

        let mut diversity_score = None;
        if let Some(ranking) = &options.ranking {
            let mut ranking = ranking.clone();
            ranking.diversity.enabled |= options.enable_diversity;
            let ranked = Ranker::rank_at(items, &ranking, options.personalization.as_ref(), now);
            if ranking.diversity.enabled {
                diversity_score = Some(ranked.diversity_score);
            }
            items = ranked.items;
            if options.include_explanations {
                for (item, breakdown) in items.iter_mut().zip(&ranked.breakdowns) {
                    if let Some(explanation) = item.explanation.as_mut() {
                        for (factor, value) in breakdown.factors() {
                            explanation.insert(format!("ranking.{}", factor), value);
                        }
                    }
                }
            }
        } else {
            if options.enable_reranking {
                items.sort_by(|a, b| {
                    b.relevance_score
                        .partial_cmp(&a.relevance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            } else {
                items.sort_by(|a, b| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            if options.enable_diversity {
                items = Ranker::apply_diversity(items, &self.config.diversity, |item| item.features());
                diversity_score = Some(Ranker::diversity_score(&items, &self.config.diversity.entropy_weights));
            }
        }

        // Final threshold, payload stripping, truncation, ranks
        items.retain(|item| item.similarity >= options.min_similarity);
        items.truncate(options.resolved_top_k());
        for (i, item) in items.iter_mut().enumerate() {
            item.rank = i + 1;
            if !options.include_content {
                item.content = None;
            }
        }
        let scoring_ms = scoring_started.elapsed().as_millis() as u64;

        Ok(SearchResponse {
            items,
            query: query_text.to_string(),
            total_candidates,
            query_vector_cached: false,
            metric,
            diversity_score,
            timing: SearchTiming {
                embedding_ms: 0,
                vector_search_ms,
                scoring_ms,
                total_ms: vector_search_ms + scoring_ms,
            },
        })
    }

    /// Similarity of one hit under `metric`. Hits without an embedding fall
    /// back to the store distance; unusable hits are logged and dropped.
    fn score_hit(&self, document: VectorDocument, query: &[f32], metric: SimilarityMetric) -> Option<ScoredHit> {
        if document.has_embedding() {
            return match SimilarityCalculator::calculate_similarity(query, &document.embedding, metric) {
                Ok(similarity) => Some(ScoredHit { document, similarity }),
                Err(e) => {
                    self.counters.skipped_hits.fetch_add(1, Ordering::Relaxed);
                    self.logger.warn(format_args!("⚠️ Skipping hit {}: {}", document.id, e));
                    None
                }
            };
        }

        match document.distance {
            Some(distance) if distance.is_finite() => {
                let similarity = (1.0 - distance).clamp(0.0, 1.0);
                Some(ScoredHit { document, similarity })
            }
            _ => {
                self.counters.skipped_hits.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(format_args!(
                    "⚠️ Skipping hit {}: no embedding and no distance",
                    document.id
                ));
                None
            }
        }
    }

    fn enrich(
        &self,
        hit: ScoredHit,
        query_keywords: &[String],
        options: &SearchOptions,
        now: DateTime<Utc>,
    ) -> SearchResultItem {
        let ScoredHit { document, similarity } = hit;

        let matched_keywords =
            text_processing::match_keywords(query_keywords, &document.content, &document.metadata.keywords);
        let keyword_score = if query_keywords.is_empty() {
            0.0
        } else {
            matched_keywords.len() as f32 / query_keywords.len() as f32
        };

        let importance = document
            .metadata
            .importance
            .unwrap_or(self.config.default_importance)
            .clamp(0.0, 1.0);
        let freshness = Ranker::freshness(document.metadata.created_at, now, &self.config.freshness_decay());

        let w = &self.config.relevance_weights;
        let relevance_score = (w.similarity * similarity
            + w.keyword_coverage * keyword_score
            + w.importance * importance
            + w.freshness * freshness)
            .clamp(0.0, 1.0);

        let summary = text_processing::generate_excerpt(
            &document.content,
            &matched_keywords,
            self.config.summary_max_chars,
            self.config.summary_window_words,
        );

        let explanation = options.include_explanations.then(|| {
            BTreeMap::from([
                ("similarity".to_string(), similarity),
                ("keyword_coverage".to_string(), keyword_score),
                ("importance".to_string(), importance),
                ("freshness".to_string(), freshness),
                ("relevance".to_string(), relevance_score),
            ])
        });

        SearchResultItem {
            document_id: document.id,
            created_at: document.metadata.created_at,
            content: Some(document.content),
            similarity,
            relevance_score,
            keyword_score,
            rank: 0,
            matched_keywords,
            summary,
            explanation,
            metadata: document.metadata,
        }
    }

    async fn embed_input(&self, ctx: &RequestContext, input: &DocumentInput) -> RecallResult<Vec<f32>> {
        if let Some(embedding) = &input.embedding {
            return Ok(embedding.clone());
        }
        if input.content.trim().is_empty() {
            return Err(RecallError::validation("content", "cannot be empty"));
        }

        let embedding = ctx
            .run("embedding.embed", async {
                self.embedder
                    .embed(&input.content, input.metadata.content_type.as_deref())
                    .await
                    .map_err(|e| {
                        e.into_recall(
                            "embed",
                            format!(
                                "model={}, document={}",
                                self.embedder.model_name(),
                                input.id.as_deref().unwrap_or("<new>")
                            ),
                        )
                    })
            })
            .await?;
        Ok(embedding.vector)
    }

    fn build_document(input: &DocumentInput, embedding: Vec<f32>) -> VectorDocument {
        let id = input
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        VectorDocument::new(id, input.content.clone(), embedding, input.metadata.clone())
    }

    /// Embed (unless an embedding is supplied) and store one document,
    /// returning its id.
    pub async fn index_document(&self, ctx: &RequestContext, input: DocumentInput) -> RecallResult<String> {
        ctx.check("index_document")?;
        let embedding = self.embed_input(ctx, &input).await?;
        let document = Self::build_document(&input, embedding);
        let id = document.id.clone();

        let result = ctx
            .run("vector_store.add", async {
                self.store
                    .add(document)
                    .await
                    .map_err(|e| e.into_recall("add", format!("collection={}, id={}", self.store.collection(), id)))
            })
            .await;

        match result {
            Ok(()) => {
                self.counters.documents_indexed.fetch_add(1, Ordering::Relaxed);
                self.logger.debug(format_args!("📥 Indexed document {}", id));
                Ok(id)
            }
            Err(e) => {
                self.counters.index_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Index many documents. Per-item failures are logged and counted; only
    /// cancellation or an upstream store failure for the whole batch aborts.
    pub async fn batch_index_documents(
        &self,
        ctx: &RequestContext,
        inputs: Vec<DocumentInput>,
    ) -> RecallResult<BatchIndexReport> {
        ctx.check("batch_index_documents")?;
        let batch_size = inputs.len();
        let mut report = BatchIndexReport::default();

        let mut documents = Vec::with_capacity(batch_size);
        let mut positions = Vec::with_capacity(batch_size);
        for (index, input) in inputs.iter().enumerate() {
            match self.embed_input(ctx, input).await {
                Ok(embedding) => {
                    documents.push(Self::build_document(input, embedding));
                    positions.push(index);
                }
                Err(e @ (RecallError::Cancelled { .. } | RecallError::DeadlineExceeded { .. })) => return Err(e),
                Err(e) => {
                    self.logger.warn(format_args!("⚠️ Skipping batch item {}: {}", index, e));
                    report.failures.push(BatchFailure {
                        index,
                        id: input.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        let results = ctx
            .run("vector_store.add_batch", async { Ok(self.store.add_batch(documents).await) })
            .await?;

        for ((result, id), index) in results.into_iter().zip(ids).zip(positions) {
            match result {
                Ok(()) => report.indexed_ids.push(id),
                Err(e) => {
                    let error = e.into_recall(
                        "add_batch",
                        format!("collection={}, batch_size={}", self.store.collection(), batch_size),
                    );
                    self.logger.warn(format_args!("⚠️ Failed to store batch item {} ({}): {}", index, id, error));
                    report.failures.push(BatchFailure {
                        index,
                        id: Some(id),
                        error: error.to_string(),
                    });
                }
            }
        }

        report.failures.sort_by_key(|f| f.index);
        report.succeeded = report.indexed_ids.len();
        report.failed = report.failures.len();
        self.counters.documents_indexed.fetch_add(report.succeeded as u64, Ordering::Relaxed);
        self.counters.index_failures.fetch_add(report.failed as u64, Ordering::Relaxed);

        self.logger.info(format_args!(
            "📦 Batch indexed {}/{} documents ({} failed)",
            report.succeeded, batch_size, report.failed
        ));
        Ok(report)
    }

    pub async fn get_document(&self, ctx: &RequestContext, id: &str) -> RecallResult<VectorDocument> {
        if id.trim().is_empty() {
            return Err(RecallError::validation("id", "cannot be empty"));
        }
        ctx.run("vector_store.get", async {
            self.store
                .get(id)
                .await
                .map_err(|e| e.into_recall("get", format!("collection={}, id={}", self.store.collection(), id)))
        })
        .await
    }

    pub async fn delete_document(&self, ctx: &RequestContext, id: &str) -> RecallResult<()> {
        if id.trim().is_empty() {
            return Err(RecallError::validation("id", "cannot be empty"));
        }
        ctx.run("vector_store.delete", async {
            self.store
                .delete(id)
                .await
                .map_err(|e| e.into_recall("delete", format!("collection={}, id={}", self.store.collection(), id)))
        })
        .await?;

        self.counters.documents_deleted.fetch_add(1, Ordering::Relaxed);
        self.logger.debug(format_args!("🗑️ Deleted document {}", id));
        Ok(())
    }

    /// Replace a stored document. The embedding is regenerated only when the
    /// content changed and none was supplied; `created_at` is preserved.
    pub async fn update_document(&self, ctx: &RequestContext, input: DocumentInput) -> RecallResult<()> {
        let id = match input.id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => return Err(RecallError::validation("id", "is required for updates")),
        };

        let existing = self.get_document(ctx, &id).await?;
        let embedding = match &input.embedding {
            Some(embedding) => embedding.clone(),
            None if existing.content == input.content => existing.embedding.clone(),
            None => self.embed_input(ctx, &input).await?,
        };

        let mut document = VectorDocument::new(id.clone(), input.content, embedding, input.metadata);
        document.metadata.created_at = existing.metadata.created_at;

        ctx.run("vector_store.update", async {
            self.store
                .update(document)
                .await
                .map_err(|e| e.into_recall("update", format!("collection={}, id={}", self.store.collection(), id)))
        })
        .await?;

        self.counters.documents_updated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let total = self.counters.searches.load(Ordering::Relaxed);
        let total_ms = self.counters.total_search_ms.load(Ordering::Relaxed);
        EngineStats {
            total_searches: total,
            failed_searches: self.counters.failed_searches.load(Ordering::Relaxed),
            average_search_ms: if total > 0 { total_ms / total } else { 0 },
            documents_indexed: self.counters.documents_indexed.load(Ordering::Relaxed),
            documents_updated: self.counters.documents_updated.load(Ordering::Relaxed),
            documents_deleted: self.counters.documents_deleted.load(Ordering::Relaxed),
            index_failures: self.counters.index_failures.load(Ordering::Relaxed),
            skipped_hits: self.counters.skipped_hits.load(Ordering::Relaxed),
        }
    }

    pub async fn check_collaborators(&self, ctx: &RequestContext) -> CollaboratorHealth {
        let count = ctx
            .run("vector_store.count", async {
                self.store
                    .count()
                    .await
                    .map_err(|e| e.into_recall("count", format!("collection={}", self.store.collection())))
            })
            .await;
        let embedder = ctx
            .run("embedding.health_check", async {
                self.embedder
                    .health_check()
                    .await
                    .map_err(|e| e.into_recall("health_check", format!("model={}", self.embedder.model_name())))
            })
            .await;

        CollaboratorHealth {
            vector_store: ComponentStatus::from_result(&count),
            embedding_provider: ComponentStatus::from_result(&embedder),
            document_count: count.ok(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Deterministic collaborators shared by the engine and recommender tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::embedding::{Embedding, EmbeddingError, EmbeddingProvider, EmbeddingResult};

    /// Returns preset vectors per text, or a bag-of-letters vector otherwise
    #[derive(Debug, Default)]
    pub struct FixedEmbedder {
        pub vectors: HashMap<String, Vec<f32>>,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl FixedEmbedder {
        pub fn with(entries: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                ..Self::default()
            }
        }

        pub fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, text: &str, _hint: Option<&str>) -> EmbeddingResult<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbeddingError::Api { status_code: 503, message: "unavailable".into() });
            }
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
            Ok(Embedding { vector, tokens_used: text.split_whitespace().count() })
        }

        async fn health_check(&self) -> EmbeddingResult<()> {
            if self.fail {
                Err(EmbeddingError::Api { status_code: 503, message: "unavailable".into() })
            } else {
                Ok(())
            }
        }
    }
}
