//! # Recommender
//!
//! Six strategies behind one entry point, [`Recommender::get_recommendations`]:
//!
//! - **Similar**: neighbours of a source document's embedding, scored by
//!   similarity alone. The source itself is never returned.
//! - **Related**: source document or free-text query; `0.7 * similarity +
//!   0.3 * keyword overlap` over a similarity floor lowered to 0.7x the
//!   requested minimum.
//! - **Personalized**: a query vector averaged from the user's recent
//!   interactions (or built from stated preferences), with a bonus for
//!   preferred content types, preferred tags and interaction history.
//! - **Trending**: recent documents by `0.6 * freshness + 0.4 * importance`,
//!   no query vector involved.
//! - **Collaborative**: documents liked by users whose interaction history
//!   resembles the requester's. Falls back to personalized without history.
//! - **Hybrid**: the four above run concurrently, each rescaled by its
//!   weight; merged by id keeping the highest weighted score.
//!
//! All strategies share the same post-processing: explicit exclusions,
//! optional per-content-type diversity, truncation and ranking. Finished lists
//! are cached under a key covering the whole request; a cache hit returns
//! without touching any collaborator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache_manager::CacheManager;
use crate::errors::{RecallError, RecallResult};
use crate::interactions::{InteractionStore, PersonalizationContext};
use crate::logging::Logger;
use crate::ranking::{DiversityConfig, EntropyWeights, RankFeatures, Rankable, Ranker, TimeDecayConfig};
use crate::request_context::RequestContext;
use crate::search_engine::{SearchOptions, SearchResultItem, SemanticSearchEngine};
use crate::similarity::SimilarityCalculator;
use crate::text_processing;
use crate::vector_store::{MetadataFilter, TimeRange, VectorDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Similar,
    Related,
    Personalized,
    Trending,
    Collaborative,
    Hybrid,
}

impl RecommendationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationType::Similar => "similar",
            RecommendationType::Related => "related",
            RecommendationType::Personalized => "personalized",
            RecommendationType::Trending => "trending",
            RecommendationType::Collaborative => "collaborative",
            RecommendationType::Hybrid => "hybrid",
        }
    }
}

impl FromStr for RecommendationType {
    type Err = RecallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "similar" => Ok(RecommendationType::Similar),
            "related" => Ok(RecommendationType::Related),
            "personalized" => Ok(RecommendationType::Personalized),
            "trending" => Ok(RecommendationType::Trending),
            "collaborative" => Ok(RecommendationType::Collaborative),
            "hybrid" => Ok(RecommendationType::Hybrid),
            other => Err(RecallError::unsupported(format!("recommendation type '{}'", other))),
        }
    }
}

/// Per-call recommendation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub recommendation_type: RecommendationType,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub source_document_id: Option<String>,
    #[serde(default)]
    pub source_query: Option<String>,
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default)]
    pub min_similarity: f32,
    #[serde(default)]
    pub exclude_documents: Vec<String>,
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default)]
    pub enable_diversity: bool,
    #[serde(default = "default_true")]
    pub include_content: bool,
    /// Trending window; the configured default applies when absent
    #[serde(default)]
    pub time_window_days: Option<u32>,
    /// Inline context, used instead of the interaction store
    #[serde(default)]
    pub context: Option<PersonalizationContext>,
}

fn default_max_count() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl RecommendationRequest {
    pub fn new(recommendation_type: RecommendationType) -> Self {
        Self {
            recommendation_type,
            user_id: None,
            source_document_id: None,
            source_query: None,
            max_count: default_max_count(),
            min_similarity: 0.0,
            exclude_documents: Vec::new(),
            content_types: Vec::new(),
            enable_diversity: false,
            include_content: true,
            time_window_days: None,
            context: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_source_document(mut self, id: impl Into<String>) -> Self {
        self.source_document_id = Some(id.into());
        self
    }

    pub fn with_source_query(mut self, query: impl Into<String>) -> Self {
        self.source_query = Some(query.into());
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn excluding(mut self, ids: &[&str]) -> Self {
        self.exclude_documents = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_context(mut self, context: PersonalizationContext) -> Self {
        self.context = Some(context);
        self
    }

    fn has_personalization_input(&self) -> bool {
        self.context.is_some() || self.user_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub score: f32,
    /// Vector similarity to the source, for vector-based strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub rank: usize,
    pub strategy: RecommendationType,
    pub reason: String,
    pub factors: BTreeMap<String, f32>,
    pub content_type: Option<String>,
    pub tags: Vec<String>,
    pub importance: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl RecommendationItem {
    fn from_document(document: VectorDocument, strategy: RecommendationType, score: f32, reason: String) -> Self {
        Self {
            document_id: document.id,
            content: Some(document.content),
            title: document.metadata.title,
            score,
            similarity: None,
            rank: 0,
            strategy,
            reason,
            factors: BTreeMap::new(),
            content_type: document.metadata.content_type,
            tags: document.metadata.tags,
            importance: document.metadata.importance,
            created_at: document.metadata.created_at,
        }
    }

    fn from_search(hit: SearchResultItem, strategy: RecommendationType, score: f32, reason: String) -> Self {
        Self {
            document_id: hit.document_id,
            content: hit.content,
            title: hit.metadata.title,
            score,
            similarity: Some(hit.similarity),
            rank: 0,
            strategy,
            reason,
            factors: BTreeMap::new(),
            content_type: hit.metadata.content_type,
            tags: hit.metadata.tags,
            importance: hit.metadata.importance,
            created_at: hit.created_at,
        }
    }

    fn with_factor(mut self, name: &str, value: f32) -> Self {
        self.factors.insert(name.to_string(), value);
        self
    }
}

impl Rankable for RecommendationItem {
    fn features(&self) -> RankFeatures<'_> {
        RankFeatures {
            id: &self.document_id,
            similarity: self.similarity.unwrap_or(self.score),
            relevance: self.score,
            keyword_score: 0.0,
            importance: self.importance,
            created_at: self.created_at,
            content_type: self.content_type.as_deref(),
            tags: &self.tags,
        }
    }

    fn set_rank(&mut self, rank: usize) {
        self.rank = rank;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub items: Vec<RecommendationItem>,
    pub recommendation_type: RecommendationType,
    pub from_cache: bool,
    /// Sub-strategies that contributed, for hybrid requests
    pub strategies_used: Vec<RecommendationType>,
    pub took_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalizationBonus {
    pub content_type_match: f32,
    /// Added once per matching tag
    pub tag_match: f32,
    /// Multiplier on the document's interaction weight
    pub interaction_weight: f32,
}

impl Default for PersonalizationBonus {
    fn default() -> Self {
        Self {
            content_type_match: 0.2,
            tag_match: 0.1,
            interaction_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub similar: f32,
    pub personalized: f32,
    pub trending: f32,
    pub collaborative: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            similar: 0.3,
            personalized: 0.4,
            trending: 0.2,
            collaborative: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    pub max_count_limit: usize,
    /// Candidates fetched per requested item before post-processing
    pub candidate_multiplier: usize,
    pub related_vector_weight: f32,
    pub related_keyword_weight: f32,
    /// Related requests search down to this fraction of `min_similarity`
    pub related_floor_factor: f32,
    pub personalization_bonus: PersonalizationBonus,
    pub trending_window_days: u32,
    /// Upper bound on documents scored per trending request
    pub trending_scan_limit: usize,
    pub trending_half_life_days: f64,
    pub trending_freshness_weight: f32,
    pub trending_importance_weight: f32,
    pub hybrid_weights: HybridWeights,
    pub diversity_per_type_cap: usize,
    pub collaborative_neighbors: usize,
    pub default_importance: f32,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            max_count_limit: 100,
            candidate_multiplier: 3,
            related_vector_weight: 0.7,
            related_keyword_weight: 0.3,
            related_floor_factor: 0.7,
            personalization_bonus: PersonalizationBonus::default(),
            trending_window_days: 30,
            trending_scan_limit: 10_000,
            trending_half_life_days: 7.0,
            trending_freshness_weight: 0.6,
            trending_importance_weight: 0.4,
            hybrid_weights: HybridWeights::default(),
            diversity_per_type_cap: 2,
            collaborative_neighbors: 20,
            default_importance: 0.5,
        }
    }
}

impl RecommenderConfig {
    pub fn validate(&self) -> RecallResult<()> {
        if self.max_count_limit == 0 {
            return Err(RecallError::validation("recommender.max_count_limit", "must be greater than 0"));
        }
        if self.candidate_multiplier == 0 {
            return Err(RecallError::validation("recommender.candidate_multiplier", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.related_floor_factor) {
            return Err(RecallError::validation("recommender.related_floor_factor", "must be within [0, 1]"));
        }
        if !(self.trending_half_life_days > 0.0) {
            return Err(RecallError::validation("recommender.trending_half_life_days", "must be greater than 0"));
        }
        if self.trending_window_days == 0 {
            return Err(RecallError::validation("recommender.trending_window_days", "must be greater than 0"));
        }
        if self.trending_scan_limit == 0 {
            return Err(RecallError::validation("recommender.trending_scan_limit", "must be greater than 0"));
        }
        if self.diversity_per_type_cap == 0 {
            return Err(RecallError::validation("recommender.diversity_per_type_cap", "must be greater than 0"));
        }
        if self.collaborative_neighbors == 0 {
            return Err(RecallError::validation("recommender.collaborative_neighbors", "must be greater than 0"));
        }
        let h = &self.hybrid_weights;
        let b = &self.personalization_bonus;
        for (name, weight) in [
            ("related_vector_weight", self.related_vector_weight),
            ("related_keyword_weight", self.related_keyword_weight),
            ("trending_freshness_weight", self.trending_freshness_weight),
            ("trending_importance_weight", self.trending_importance_weight),
            ("hybrid_weights.similar", h.similar),
            ("hybrid_weights.personalized", h.personalized),
            ("hybrid_weights.trending", h.trending),
            ("hybrid_weights.collaborative", h.collaborative),
            ("personalization_bonus.content_type_match", b.content_type_match),
            ("personalization_bonus.tag_match", b.tag_match),
            ("personalization_bonus.interaction_weight", b.interaction_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RecallError::validation(format!("recommender.{}", name), "must be a non-negative number"));
            }
        }
        if !(0.0..=1.0).contains(&self.default_importance) {
            return Err(RecallError::validation("recommender.default_importance", "must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecommenderCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    collaborative_fallbacks: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommenderStats {
    pub total_recommendations: u64,
    pub failed_recommendations: u64,
    pub collaborative_fallbacks: u64,
}

pub struct Recommender {
    engine: Arc<SemanticSearchEngine>,
    interactions: Option<Arc<dyn InteractionStore>>,
    cache: Arc<CacheManager>,
    config: RecommenderConfig,
    counters: RecommenderCounters,
    logger: Logger,
}

impl Recommender {
    pub fn new(
        engine: Arc<SemanticSearchEngine>,
        interactions: Option<Arc<dyn InteractionStore>>,
        cache: Arc<CacheManager>,
        config: RecommenderConfig,
        logger: Logger,
    ) -> Self {
        Self {
            engine,
            interactions,
            cache,
            config,
            counters: RecommenderCounters::default(),
            logger,
        }
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    pub fn stats(&self) -> RecommenderStats {
        RecommenderStats {
            total_recommendations: self.counters.requests.load(Ordering::Relaxed),
            failed_recommendations: self.counters.failures.load(Ordering::Relaxed),
            collaborative_fallbacks: self.counters.collaborative_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn validate(&self, request: &RecommendationRequest) -> RecallResult<()> {
        if request.max_count == 0 || request.max_count > self.config.max_count_limit {
            return Err(RecallError::validation(
                "max_count",
                format!("must be within 1..={}", self.config.max_count_limit),
            ));
        }
        if !request.min_similarity.is_finite() || !(0.0..=1.0).contains(&request.min_similarity) {
            return Err(RecallError::validation("min_similarity", "must be within [0, 1]"));
        }
        if request.time_window_days == Some(0) {
            return Err(RecallError::validation("time_window_days", "must be greater than 0"));
        }
        if matches!(&request.source_document_id, Some(id) if id.trim().is_empty()) {
            return Err(RecallError::validation("source_document_id", "cannot be blank"));
        }
        Ok(())
    }

    pub async fn get_recommendations(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
    ) -> RecallResult<RecommendationResponse> {
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let result = self.recommend(ctx, request, started).await;
        if let Err(e) = &result {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            self.logger.warn(format_args!(
                "❌ {} recommendations failed: {}",
                request.recommendation_type.as_str(),
                e
            ));
        }
        result
    }

    async fn recommend(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
        started: Instant,
    ) -> RecallResult<RecommendationResponse> {
        self.validate(request)?;

        let key = CacheManager::recommendation_key(request);
        if let Some(items) = self.cache.recommendations().get(&key).await {
            self.logger.debug(format_args!(
                "🎯 Served {} recommendations from cache",
                request.recommendation_type.as_str()
            ));
            return Ok(RecommendationResponse {
                items,
                recommendation_type: request.recommendation_type,
                from_cache: true,
                strategies_used: Vec::new(),
                took_ms: started.elapsed().as_millis() as u64,
            });
        }
        ctx.check("recommend")?;

        let (items, strategies_used) = match request.recommendation_type {
            RecommendationType::Hybrid => self.hybrid(ctx, request).await?,
            single => (self.run_strategy(ctx, request, single).await?, vec![single]),
        };
        let items = self.post_process(items, request);

        self.cache.recommendations().set(&key, items.clone()).await;
        self.logger.info(format_args!(
            "💡 Generated {} {} recommendations in {}ms",
            items.len(),
            request.recommendation_type.as_str(),
            started.elapsed().as_millis()
        ));

        Ok(RecommendationResponse {
            items,
            recommendation_type: request.recommendation_type,
            from_cache: false,
            strategies_used,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_strategy(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
        strategy: RecommendationType,
    ) -> RecallResult<Vec<RecommendationItem>> {
        let mut items = match strategy {
            RecommendationType::Similar => self.similar(ctx, request).await?,
            RecommendationType::Related => self.related(ctx, request).await?,
            RecommendationType::Personalized => self.personalized(ctx, request).await?,
            RecommendationType::Trending => self.trending(ctx, request).await?,
            RecommendationType::Collaborative => self.collaborative(ctx, request).await?,
            RecommendationType::Hybrid => {
                return Err(RecallError::unsupported("nested hybrid recommendation"));
            }
        };
        Self::sort_by_score(&mut items);
        Ok(items)
    }

    fn sort_by_score(items: &mut [RecommendationItem]) {
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
    }

    fn candidate_limit(&self, request: &RecommendationRequest) -> usize {
        (request.max_count + request.exclude_documents.len() + 1) * self.config.candidate_multiplier
    }

    fn candidate_options(&self, request: &RecommendationRequest, min_similarity: f32) -> SearchOptions {
        let limit = self.candidate_limit(request);
        SearchOptions {
            top_k: Some(limit),
            max_results: Some(limit),
            min_similarity,
            content_types: request.content_types.clone(),
            include_content: true,
            enable_reranking: false,
            ..SearchOptions::default()
        }
    }

    async fn source_document(&self, ctx: &RequestContext, request: &RecommendationRequest) -> RecallResult<VectorDocument> {
        let id = request
            .source_document_id
            .as_deref()
            .ok_or_else(|| RecallError::validation("source_document_id", "is required"))?;
        let document = self.engine.get_document(ctx, id).await?;
        if !document.has_embedding() {
            return Err(RecallError::validation("source_document_id", format!("document '{}' has no embedding", id)));
        }
        Ok(document)
    }

    fn display_name(document: &VectorDocument) -> &str {
        document.metadata.title.as_deref().unwrap_or(&document.id)
    }

    async fn similar(&self, ctx: &RequestContext, request: &RecommendationRequest) -> RecallResult<Vec<RecommendationItem>> {
        let source = self.source_document(ctx, request).await?;
        let options = self.candidate_options(request, request.min_similarity);
        let response = self.engine.search_by_vector(ctx, &source.embedding, "", &options).await?;

        let name = Self::display_name(&source);
        Ok(response
            .items
            .into_iter()
            .filter(|hit| hit.document_id != source.id)
            .map(|hit| {
                let similarity = hit.similarity;
                RecommendationItem::from_search(
                    hit,
                    RecommendationType::Similar,
                    similarity,
                    format!("Similar to '{}'", name),
                )
                .with_factor("similarity", similarity)
            })
            .collect())
    }

    async fn related(&self, ctx: &RequestContext, request: &RecommendationRequest) -> RecallResult<Vec<RecommendationItem>> {
        let floor = request.min_similarity * self.config.related_floor_factor;
        let options = self.candidate_options(request, floor);

        let (vector, source_text, source_id, label) = match (&request.source_document_id, &request.source_query) {
            (Some(_), _) => {
                let source = self.source_document(ctx, request).await?;
                let label = Self::display_name(&source).to_string();
                (source.embedding, source.content, Some(source.id), label)
            }
            (None, Some(query)) if !query.trim().is_empty() => {
                let query = text_processing::preprocess_query(query, self.engine.config().short_query_max_chars);
                let (vector, _) = self.engine.resolve_query_vector(ctx, &query, &options).await?;
                let label = query.clone();
                (vector, query, None, label)
            }
            _ => {
                return Err(RecallError::validation(
                    "source",
                    "related recommendations need a source document or a source query",
                ))
            }
        };

        let response = self.engine.search_by_vector(ctx, &vector, &source_text, &options).await?;
        let vector_weight = self.config.related_vector_weight;
        let keyword_weight = self.config.related_keyword_weight;

        Ok(response
            .items
            .into_iter()
            .filter(|hit| source_id.as_deref() != Some(hit.document_id.as_str()))
            .map(|hit| {
                let similarity = hit.similarity;
                let overlap = hit
                    .content
                    .as_deref()
                    .map(|content| text_processing::jaccard_overlap(&source_text, content))
                    .unwrap_or(0.0);
                let score = vector_weight * similarity + keyword_weight * overlap;
                RecommendationItem::from_search(hit, RecommendationType::Related, score, format!("Related to '{}'", label))
                    .with_factor("similarity", similarity)
                    .with_factor("keyword_overlap", overlap)
            })
            .collect())
    }

    /// Request context, then cached context, then the interaction store
    async fn resolve_context(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
    ) -> RecallResult<Option<PersonalizationContext>> {
        if let Some(context) = &request.context {
            return Ok(Some(context.clone()));
        }
        let Some(user_id) = request.user_id.as_deref() else {
            return Ok(None);
        };

        let key = CacheManager::user_preference_key(user_id);
        if let Some(context) = self.cache.user_preferences().get(&key).await {
            return Ok(Some(context));
        }

        let Some(store) = &self.interactions else {
            return Ok(None);
        };
        let context = ctx
            .run("interactions.personalization_context", store.personalization_context(user_id))
            .await?;
        if let Some(context) = &context {
            self.cache.user_preferences().set(&key, context.clone()).await;
        }
        Ok(context)
    }

    async fn personalized(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
    ) -> RecallResult<Vec<RecommendationItem>> {
        let context = self
            .resolve_context(ctx, request)
            .await?
            .ok_or_else(|| RecallError::validation("context", "personalized recommendations need a user context"))?;

        let mut options = self.candidate_options(request, request.min_similarity);
        options.max_results = options.max_results.map(|n| n + context.recent_interactions.len());
        options.top_k = options.max_results;

        let mut recent_vectors = Vec::new();
        for id in &context.recent_interactions {
            match self.engine.get_document(ctx, id).await {
                Ok(document) if document.has_embedding() => recent_vectors.push(document.embedding),
                Ok(_) => {}
                Err(RecallError::NotFound { .. }) => {
                    self.logger.debug(format_args!("Recent interaction {} no longer exists", id));
                }
                Err(e) => return Err(e),
            }
        }

        let query_text = context.preference_query().unwrap_or_default();
        let vector = if !recent_vectors.is_empty() {
            SimilarityCalculator::average_vectors(&recent_vectors)?
        } else if !query_text.is_empty() {
            let query = text_processing::preprocess_query(&query_text, self.engine.config().short_query_max_chars);
            self.engine.resolve_query_vector(ctx, &query, &options).await?.0
        } else {
            return Err(RecallError::validation(
                "context",
                "no recent interactions or preferences to personalize from",
            ));
        };

        let response = self.engine.search_by_vector(ctx, &vector, &query_text, &options).await?;
        let recent: HashSet<&str> = context.recent_interactions.iter().map(|s| s.as_str()).collect();
        let bonus = &self.config.personalization_bonus;

        Ok(response
            .items
            .into_iter()
            .filter(|hit| !recent.contains(hit.document_id.as_str()))
            .map(|hit| {
                let relevance = hit.relevance_score;
                let type_bonus = if context.prefers_content_type(hit.metadata.content_type.as_deref()) {
                    bonus.content_type_match
                } else {
                    0.0
                };
                let tag_bonus = bonus.tag_match * context.matching_tag_count(&hit.metadata.tags) as f32;
                let history_bonus = bonus.interaction_weight * context.interaction_weight(&hit.document_id);
                let score = (relevance + type_bonus + tag_bonus + history_bonus).min(1.0);

                RecommendationItem::from_search(
                    hit,
                    RecommendationType::Personalized,
                    score,
                    "Matches your interests".to_string(),
                )
                .with_factor("relevance", relevance)
                .with_factor("content_type_bonus", type_bonus)
                .with_factor("tag_bonus", tag_bonus)
                .with_factor("history_bonus", history_bonus)
            })
            .collect())
    }

    async fn trending(&self, ctx: &RequestContext, request: &RecommendationRequest) -> RecallResult<Vec<RecommendationItem>> {
        let now = Utc::now();
        let days = request.time_window_days.unwrap_or(self.config.trending_window_days);
        let filter = MetadataFilter {
            content_types: request.content_types.clone(),
            time_range: Some(TimeRange::since(now - ChronoDuration::days(i64::from(days)))),
            ..MetadataFilter::default()
        };

        // Every document in the window is scored; listing order is by recency only
        let store = self.engine.store();
        let limit = self.config.trending_scan_limit;
        let documents = ctx
            .run("vector_store.list", async {
                store
                    .list(&filter, limit)
                    .await
                    .map_err(|e| e.into_recall("list", format!("collection={}, limit={}", store.collection(), limit)))
            })
            .await?;

        let decay = TimeDecayConfig {
            half_life_days: self.config.trending_half_life_days,
            min_score: 0.0,
            recent_window_days: 0.0,
            recent_boost: 1.0,
        };

        Ok(documents
            .into_iter()
            .map(|document| {
                let freshness = Ranker::freshness(document.metadata.created_at, now, &decay);
                let importance = document
                    .metadata
                    .importance
                    .unwrap_or(self.config.default_importance)
                    .clamp(0.0, 1.0);
                let score = self.config.trending_freshness_weight * freshness
                    + self.config.trending_importance_weight * importance;
                let age_days = (now - document.metadata.created_at).num_days().max(0);

                RecommendationItem::from_document(
                    document,
                    RecommendationType::Trending,
                    score,
                    format!("Trending: added {} day(s) ago", age_days),
                )
                .with_factor("freshness", freshness)
                .with_factor("importance", importance)
            })
            .collect())
    }

    async fn collaborative(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
    ) -> RecallResult<Vec<RecommendationItem>> {
        let user_id = request
            .user_id
            .as_deref()
            .ok_or_else(|| RecallError::validation("user_id", "collaborative recommendations need a user"))?;

        let Some(store) = &self.interactions else {
            return self.collaborative_fallback(ctx, request, "no interaction store").await;
        };

        let own = ctx.run("interactions.interactions", store.interactions(user_id)).await?;
        if own.is_empty() {
            return self.collaborative_fallback(ctx, request, "no interaction history").await;
        }
        let own_weights = Self::weight_vector(own.iter().map(|i| (i.document_id.as_str(), i.weight)));

        let document_ids: Vec<String> = own_weights.keys().cloned().collect();
        let others = ctx
            .run("interactions.users_interacting_with", store.users_interacting_with(&document_ids))
            .await?;

        let mut neighbours: Vec<(String, f32, HashMap<String, f32>)> = others
            .into_iter()
            .filter(|(other, _)| other != user_id)
            .filter_map(|(other, interactions)| {
                let weights = Self::weight_vector(interactions.iter().map(|i| (i.document_id.as_str(), i.weight)));
                let similarity = Self::sparse_cosine(&own_weights, &weights);
                (similarity > 0.0).then_some((other, similarity, weights))
            })
            .collect();
        neighbours.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        neighbours.truncate(self.config.collaborative_neighbors);

        if neighbours.is_empty() {
            return self.collaborative_fallback(ctx, request, "no similar users").await;
        }

        // doc -> (sum of sim * weight, sum of sim)
        let mut accumulated: HashMap<String, (f32, f32)> = HashMap::new();
        for (_, similarity, weights) in &neighbours {
            for (doc, weight) in weights {
                if own_weights.contains_key(doc) {
                    continue;
                }
                let entry = accumulated.entry(doc.clone()).or_insert((0.0, 0.0));
                entry.0 += similarity * weight;
                entry.1 += similarity;
            }
        }

        let mut scored: Vec<(String, f32)> = accumulated
            .into_iter()
            .filter(|(_, (_, den))| *den > 0.0)
            .map(|(doc, (num, den))| (doc, (num / den).clamp(0.0, 1.0)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let type_filter = MetadataFilter {
            content_types: request.content_types.clone(),
            ..MetadataFilter::default()
        };
        let limit = self.candidate_limit(request);
        let neighbour_count = neighbours.len();

        let mut items = Vec::new();
        for (doc_id, score) in scored {
            if items.len() >= limit {
                break;
            }
            let document = match self.engine.get_document(ctx, &doc_id).await {
                Ok(document) => document,
                Err(RecallError::NotFound { .. }) => {
                    self.logger.debug(format_args!("Skipping collaborative candidate {}: not found", doc_id));
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !type_filter.matches(&document.metadata) {
                continue;
            }
            items.push(
                RecommendationItem::from_document(
                    document,
                    RecommendationType::Collaborative,
                    score,
                    format!("Liked by {} user(s) with similar interests", neighbour_count),
                )
                .with_factor("neighbour_score", score),
            );
        }

        Ok(items)
    }

    async fn collaborative_fallback(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
        why: &str,
    ) -> RecallResult<Vec<RecommendationItem>> {
        self.counters.collaborative_fallbacks.fetch_add(1, Ordering::Relaxed);
        self.logger.debug(format_args!("Collaborative filtering fell back to personalized: {}", why));
        self.personalized(ctx, request).await
    }

    fn weight_vector<'a>(entries: impl Iterator<Item = (&'a str, f32)>) -> HashMap<String, f32> {
        let mut weights = HashMap::new();
        for (doc, weight) in entries {
            *weights.entry(doc.to_string()).or_insert(0.0) += weight;
        }
        weights
    }

    /// Raw cosine over sparse weight vectors, 0 when either is empty
    fn sparse_cosine(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
        let dot: f32 = a.iter().filter_map(|(k, va)| b.get(k).map(|vb| va * vb)).sum();
        let norm_a = a.values().map(|v| v * v).sum::<f32>().sqrt();
        let norm_b = b.values().map(|v| v * v).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }

    async fn hybrid(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
    ) -> RecallResult<(Vec<RecommendationItem>, Vec<RecommendationType>)> {
        let weights = &self.config.hybrid_weights;
        let has_source = request.source_document_id.is_some();
        let has_user = request.has_personalization_input();

        let run = |strategy: RecommendationType, available: bool| async move {
            if available {
                Some(self.run_strategy(ctx, request, strategy).await)
            } else {
                None
            }
        };

        let (similar, personalized, trending, collaborative) = futures::join!(
            run(RecommendationType::Similar, has_source),
            run(RecommendationType::Personalized, has_user),
            run(RecommendationType::Trending, true),
            run(RecommendationType::Collaborative, request.user_id.is_some()),
        );

        let mut merged: HashMap<String, RecommendationItem> = HashMap::new();
        let mut contributions: HashMap<String, BTreeMap<String, f32>> = HashMap::new();
        let mut used = Vec::new();

        for (strategy, weight, outcome) in [
            (RecommendationType::Similar, weights.similar, similar),
            (RecommendationType::Personalized, weights.personalized, personalized),
            (RecommendationType::Trending, weights.trending, trending),
            (RecommendationType::Collaborative, weights.collaborative, collaborative),
        ] {
            let items = match outcome {
                None => continue,
                Some(Ok(items)) => items,
                Some(Err(e)) if e.is_caller_error() => {
                    self.logger.debug(format_args!("Hybrid skipped {}: {}", strategy.as_str(), e));
                    continue;
                }
                Some(Err(e)) => return Err(e),
            };
            used.push(strategy);

            for mut item in items {
                if request.source_document_id.as_deref() == Some(item.document_id.as_str()) {
                    continue;
                }
                let weighted = item.score * weight;
                contributions
                    .entry(item.document_id.clone())
                    .or_default()
                    .insert(format!("hybrid.{}", strategy.as_str()), weighted);

                item.score = weighted;
                let replace = merged
                    .get(&item.document_id)
                    .map_or(true, |existing| weighted > existing.score);
                if replace {
                    merged.insert(item.document_id.clone(), item);
                }
            }
        }

        let mut items: Vec<RecommendationItem> = merged
            .into_values()
            .map(|mut item| {
                if let Some(parts) = contributions.remove(&item.document_id) {
                    item.factors.extend(parts);
                }
                item.reason = format!("{} (via {})", item.reason, item.strategy.as_str());
                item.strategy = RecommendationType::Hybrid;
                item
            })
            .collect();
        Self::sort_by_score(&mut items);

        Ok((items, used))
    }

    /// Exclusions, optional diversity, truncation, ranks
    fn post_process(&self, items: Vec<RecommendationItem>, request: &RecommendationRequest) -> Vec<RecommendationItem> {
        let excluded: HashSet<&str> = request.exclude_documents.iter().map(|s| s.as_str()).collect();
        let mut items: Vec<RecommendationItem> = items
            .into_iter()
            .filter(|item| !excluded.contains(item.document_id.as_str()))
            .collect();

        if request.enable_diversity {
            let diversity = DiversityConfig {
                enabled: true,
                max_per_content_type: Some(self.config.diversity_per_type_cap),
                max_per_tag: None,
                max_per_day: None,
                entropy_weights: EntropyWeights::default(),
            };
            items = Ranker::apply_diversity(items, &diversity, |item| item.features());
        }

        items.truncate(request.max_count);
        for (i, item) in items.iter_mut().enumerate() {
            item.rank = i + 1;
            if !request.include_content {
                item.content = None;
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_manager::CacheConfig;
    use crate::interactions::{InMemoryInteractionStore, Interaction};
    use crate::search_engine::test_support::FixedEmbedder;
    use crate::search_engine::SearchEngineConfig;
    use crate::vector_store::{DocumentMetadata, InMemoryVectorStore, VectorStore};

    struct Fixture {
        recommender: Recommender,
        interactions: Arc<InMemoryInteractionStore>,
        embedder: Arc<FixedEmbedder>,
    }

    fn doc(id: &str, embedding: Vec<f32>, content_type: &str, tags: &[&str], age_days: i64) -> VectorDocument {
        let created = Utc::now() - ChronoDuration::days(age_days);
        VectorDocument::new(
            id,
            format!("{} about rust programming", id),
            embedding,
            DocumentMetadata {
                content_type: Some(content_type.to_string()),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                importance: Some(0.5),
                created_at: created,
                updated_at: created,
                ..DocumentMetadata::default()
            },
        )
    }

    async fn fixture(docs: Vec<VectorDocument>) -> Fixture {
        let store = Arc::new(InMemoryVectorStore::default());
        for d in docs {
            store.add(d).await.unwrap();
        }
        let embedder = Arc::new(FixedEmbedder::with(&[("rust", vec![1.0, 0.0]), ("ai", vec![0.0, 1.0])]));
        let cache = Arc::new(CacheManager::new(CacheConfig::default(), Logger::silent()));
        let engine = Arc::new(SemanticSearchEngine::new(
            store,
            embedder.clone(),
            cache.clone(),
            SearchEngineConfig::default(),
            Logger::silent(),
        ));
        let interactions = Arc::new(InMemoryInteractionStore::new());
        let recommender = Recommender::new(
            engine,
            Some(interactions.clone() as Arc<dyn InteractionStore>),
            cache,
            RecommenderConfig::default(),
            Logger::silent(),
        );
        Fixture {
            recommender,
            interactions,
            embedder,
        }
    }

    fn corpus() -> Vec<VectorDocument> {
        vec![
            doc("source", vec![1.0, 0.0], "article", &["rust"], 1),
            doc("twin", vec![0.99, 0.05], "article", &["rust"], 2),
            doc("cousin", vec![0.8, 0.6], "note", &["rust", "async"], 3),
            doc("stranger", vec![-1.0, 0.1], "image", &["cats"], 4),
            doc("old", vec![0.7, 0.7], "note", &["ai"], 90),
        ]
    }

    fn ids(items: &[RecommendationItem]) -> Vec<&str> {
        items.iter().map(|i| i.document_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_similar_excludes_source() {
        let fx = fixture(corpus()).await;
        let request = RecommendationRequest::new(RecommendationType::Similar).with_source_document("source");
        let response = fx
            .recommender
            .get_recommendations(&RequestContext::background(), &request)
            .await
            .unwrap();

        assert!(!ids(&response.items).contains(&"source"));
        assert_eq!(response.items[0].document_id, "twin");
        assert_eq!(response.items[0].rank, 1);
        for pair in response.items.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_similar_requires_source() {
        let fx = fixture(corpus()).await;
        let result = fx
            .recommender
            .get_recommendations(&RequestContext::background(), &RecommendationRequest::new(RecommendationType::Similar))
            .await;
        assert!(matches!(result, Err(RecallError::Validation { .. })));

        let missing = RecommendationRequest::new(RecommendationType::Similar).with_source_document("nope");
        let result = fx.recommender.get_recommendations(&RequestContext::background(), &missing).await;
        assert!(matches!(result, Err(RecallError::NotFound { .. })));
        assert_eq!(fx.recommender.stats().failed_recommendations, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_collaborators() {
        let fx = fixture(corpus()).await;
        let request = RecommendationRequest::new(RecommendationType::Related).with_source_query("rust");

        let first = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();
        let calls = fx.embedder.calls();
        let second = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.items, second.items);
        assert_eq!(fx.embedder.calls(), calls);
    }

    #[tokio::test]
    async fn test_related_blends_keyword_overlap() {
        let fx = fixture(corpus()).await;
        let request = RecommendationRequest::new(RecommendationType::Related)
            .with_source_document("source")
            .with_min_similarity(0.9);
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(!ids(&response.items).contains(&"source"));
        for item in &response.items {
            let expected = 0.7 * item.factors["similarity"] + 0.3 * item.factors["keyword_overlap"];
            assert!((item.score - expected).abs() < 1e-6);
            // Floor is 0.9 * 0.7
            assert!(item.factors["similarity"] >= 0.63 - 1e-6);
        }
    }

    #[tokio::test]
    async fn test_trending_window_and_scores() {
        let fx = fixture(corpus()).await;
        let request = RecommendationRequest::new(RecommendationType::Trending).with_max_count(10);
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(!ids(&response.items).contains(&"old"));
        assert_eq!(response.items.len(), 4);
        assert_eq!(response.items[0].document_id, "source");
        for item in &response.items {
            let expected = 0.6 * item.factors["freshness"] + 0.4 * item.factors["importance"];
            assert!((item.score - expected).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_trending_scores_whole_window_before_truncating() {
        let mut docs: Vec<VectorDocument> = (0..7)
            .map(|i| {
                let mut d = doc(&format!("new{}", i), vec![1.0, 0.0], "note", &[], 0);
                d.metadata.importance = Some(0.0);
                d
            })
            .collect();
        let mut gem = doc("gem", vec![0.0, 1.0], "note", &[], 2);
        gem.metadata.importance = Some(1.0);
        docs.push(gem);
        let fx = fixture(docs).await;

        let request = RecommendationRequest::new(RecommendationType::Trending).with_max_count(1);
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert_eq!(ids(&response.items), vec!["gem"]);
        // 0.6 * 0.5^(2/7) + 0.4
        assert!(response.items[0].score > 0.85);
    }

    #[tokio::test]
    async fn test_personalized_uses_recent_interactions() {
        let fx = fixture(corpus()).await;
        let context = PersonalizationContext::new("u1")
            .with_recent_interactions(&["source"])
            .with_preferred_content_types(&["note"]);
        let request = RecommendationRequest::new(RecommendationType::Personalized).with_context(context);
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(!ids(&response.items).contains(&"source"));
        let cousin = response.items.iter().find(|i| i.document_id == "cousin").unwrap();
        assert!((cousin.factors["content_type_bonus"] - 0.2).abs() < 1e-6);
        assert!(response.items.iter().all(|i| i.score <= 1.0));
    }

    #[tokio::test]
    async fn test_personalized_without_context_is_validation_error() {
        let fx = fixture(corpus()).await;
        let request = RecommendationRequest::new(RecommendationType::Personalized).with_user("ghost");
        let result = fx.recommender.get_recommendations(&RequestContext::background(), &request).await;
        assert!(matches!(result, Err(RecallError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_collaborative_from_neighbours() {
        let fx = fixture(corpus()).await;
        fx.interactions.record("me", Interaction::new("source", 1.0)).await;
        fx.interactions.record("peer", Interaction::new("source", 1.0)).await;
        fx.interactions.record("peer", Interaction::new("cousin", 0.8)).await;
        fx.interactions.record("other", Interaction::new("stranger", 1.0)).await;

        let request = RecommendationRequest::new(RecommendationType::Collaborative).with_user("me");
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert_eq!(ids(&response.items), vec!["cousin"]);
        assert!((response.items[0].score - 0.8).abs() < 1e-6);
        assert_eq!(fx.recommender.stats().collaborative_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_collaborative_falls_back_without_history() {
        let fx = fixture(corpus()).await;
        fx.interactions
            .set_context(PersonalizationContext::new("newbie").with_preferred_tags(&["rust"]))
            .await;

        let request = RecommendationRequest::new(RecommendationType::Collaborative).with_user("newbie");
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(!response.items.is_empty());
        assert!(response.items.iter().all(|i| i.strategy == RecommendationType::Personalized));
        assert_eq!(fx.recommender.stats().collaborative_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_diversity_and_exclusions() {
        let mut docs = corpus();
        docs.push(doc("twin2", vec![0.98, 0.1], "article", &["rust"], 1));
        let fx = fixture(docs).await;

        let mut request = RecommendationRequest::new(RecommendationType::Trending).excluding(&["cousin"]);
        request.enable_diversity = true;
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(!ids(&response.items).contains(&"cousin"));
        let articles = response
            .items
            .iter()
            .filter(|i| i.content_type.as_deref() == Some("article"))
            .count();
        assert_eq!(articles, 2);
    }

    #[tokio::test]
    async fn test_hybrid_skips_unavailable_strategies() {
        let fx = fixture(corpus()).await;
        let request = RecommendationRequest::new(RecommendationType::Hybrid).with_source_document("source");
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert_eq!(
            response.strategies_used,
            vec![RecommendationType::Similar, RecommendationType::Trending]
        );
        let unique: HashSet<&str> = ids(&response.items).into_iter().collect();
        assert_eq!(unique.len(), response.items.len());
        assert!(response.items.iter().all(|i| i.strategy == RecommendationType::Hybrid));
    }

    #[tokio::test]
    async fn test_hybrid_never_recommends_its_source() {
        let fx = fixture(corpus()).await;
        fx.interactions
            .set_context(PersonalizationContext::new("u1").with_preferred_tags(&["rust"]))
            .await;
        let request = RecommendationRequest::new(RecommendationType::Hybrid)
            .with_source_document("source")
            .with_user("u1");
        let response = fx.recommender.get_recommendations(&RequestContext::background(), &request).await.unwrap();

        assert!(response.strategies_used.contains(&RecommendationType::Trending));
        assert!(!response.items.is_empty());
        assert!(!ids(&response.items).contains(&"source"));
    }

    #[test]
    fn test_request_parsing() {
        assert_eq!("Hybrid".parse::<RecommendationType>().unwrap(), RecommendationType::Hybrid);
        assert!(matches!(
            "viral".parse::<RecommendationType>(),
            Err(RecallError::Unsupported { .. })
        ));

        let request: RecommendationRequest =
            serde_json::from_str(r#"{"recommendation_type":"similar","source_document_id":"d1"}"#).unwrap();
        assert_eq!(request.max_count, 10);
        assert!(request.include_content);
    }

    #[test]
    fn test_sparse_cosine() {
        let a = Recommender::weight_vector([("x", 1.0), ("y", 1.0)].into_iter());
        let b = Recommender::weight_vector([("x", 1.0)].into_iter());
        let c = Recommender::weight_vector([("z", 1.0)].into_iter());
        assert!((Recommender::sparse_cosine(&a, &b) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert_eq!(Recommender::sparse_cosine(&a, &c), 0.0);
    }
}
