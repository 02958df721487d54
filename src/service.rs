//! # Recall Service
//!
//! The caller-facing facade. Wires one [`CacheManager`], one
//! [`SemanticSearchEngine`] and one [`Recommender`] from an [`EngineConfig`]
//! and the injected collaborators, and keeps the recommendation cache
//! coherent with document mutations.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache_manager::CacheManager;
use crate::config::EngineConfig;
use crate::embedding::{EmbeddingProvider, OllamaEmbeddingProvider};
use crate::errors::{RecallError, RecallResult};
use crate::interactions::InteractionStore;
use crate::logging::Logger;
use crate::ranking::RankingOptions;
use crate::recommender::{RecommendationRequest, RecommendationResponse, Recommender};
use crate::request_context::RequestContext;
use crate::search_engine::{
    BatchIndexReport, ComponentStatus, DocumentInput, SearchOptions, SearchResponse, SemanticSearchEngine,
};
use crate::vector_store::{VectorDocument, VectorStore};

/// Cache and engine counters, flat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub query_vector_hits: u64,
    pub query_vector_misses: u64,
    pub query_vector_evictions: u64,
    pub recommendation_hits: u64,
    pub recommendation_misses: u64,
    pub recommendation_evictions: u64,
    pub user_preference_hits: u64,
    pub user_preference_misses: u64,
    pub user_preference_evictions: u64,
    pub total_searches: u64,
    pub failed_searches: u64,
    pub total_recommendations: u64,
    pub failed_recommendations: u64,
    pub average_search_ms: u64,
    pub documents_indexed: u64,
}

impl SearchStats {
    pub fn as_map(&self) -> HashMap<String, u64> {
        [
            ("query_vector_hits", self.query_vector_hits),
            ("query_vector_misses", self.query_vector_misses),
            ("query_vector_evictions", self.query_vector_evictions),
            ("recommendation_hits", self.recommendation_hits),
            ("recommendation_misses", self.recommendation_misses),
            ("recommendation_evictions", self.recommendation_evictions),
            ("user_preference_hits", self.user_preference_hits),
            ("user_preference_misses", self.user_preference_misses),
            ("user_preference_evictions", self.user_preference_evictions),
            ("total_searches", self.total_searches),
            ("failed_searches", self.failed_searches),
            ("total_recommendations", self.total_recommendations),
            ("failed_recommendations", self.failed_recommendations),
            ("average_search_ms", self.average_search_ms),
            ("documents_indexed", self.documents_indexed),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub vector_store: ComponentStatus,
    pub embedding_provider: ComponentStatus,
    pub document_count: Option<usize>,
    pub cache_entries: usize,
}

pub struct RecallService {
    cache: Arc<CacheManager>,
    engine: Arc<SemanticSearchEngine>,
    recommender: Recommender,
    default_ranking: Option<RankingOptions>,
    logger: Logger,
}

impl RecallService {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        interactions: Option<Arc<dyn InteractionStore>>,
        logger: Logger,
    ) -> RecallResult<Self> {
        config.validate()?;
        let EngineConfig {
            cache,
            search,
            recommender,
            ranking,
            ..
        } = config;

        let cache = Arc::new(CacheManager::new(cache, logger.child("cache")));
        let engine = Arc::new(SemanticSearchEngine::new(
            store,
            embedder,
            cache.clone(),
            search,
            logger.child("search"),
        ));
        let recommender = Recommender::new(
            engine.clone(),
            interactions,
            cache.clone(),
            recommender,
            logger.child("recommend"),
        );

        logger.info(format_args!("🚀 Recall service ready"));
        Ok(Self {
            cache,
            engine,
            recommender,
            default_ranking: ranking,
            logger,
        })
    }

    /// Service backed by the Ollama embedding provider from `config.ollama`
    pub fn with_ollama(
        config: EngineConfig,
        store: Arc<dyn VectorStore>,
        interactions: Option<Arc<dyn InteractionStore>>,
        logger: Logger,
    ) -> RecallResult<Self> {
        let provider = OllamaEmbeddingProvider::new(config.ollama.clone(), logger.child("ollama"))
            .map_err(|e| RecallError::validation("ollama", e.to_string()))?;
        Self::new(config, store, Arc::new(provider), interactions, logger)
    }

    pub fn engine(&self) -> &SemanticSearchEngine {
        &self.engine
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub async fn search(&self, ctx: &RequestContext, options: &SearchOptions) -> RecallResult<SearchResponse> {
        match (&options.ranking, &self.default_ranking) {
            (None, Some(ranking)) => {
                let mut options = options.clone();
                options.ranking = Some(ranking.clone());
                self.engine.search(ctx, &options).await
            }
            _ => self.engine.search(ctx, options).await,
        }
    }

    pub async fn index_document(&self, ctx: &RequestContext, input: DocumentInput) -> RecallResult<String> {
        let id = self.engine.index_document(ctx, input).await?;
        self.invalidate_recommendations("index").await;
        Ok(id)
    }

    pub async fn batch_index_documents(
        &self,
        ctx: &RequestContext,
        inputs: Vec<DocumentInput>,
    ) -> RecallResult<BatchIndexReport> {
        let report = self.engine.batch_index_documents(ctx, inputs).await?;
        if report.succeeded > 0 {
            self.invalidate_recommendations("batch index").await;
        }
        Ok(report)
    }

    pub async fn get_document(&self, ctx: &RequestContext, id: &str) -> RecallResult<VectorDocument> {
        self.engine.get_document(ctx, id).await
    }

    pub async fn delete_document(&self, ctx: &RequestContext, id: &str) -> RecallResult<()> {
        self.engine.delete_document(ctx, id).await?;
        self.invalidate_recommendations("delete").await;
        Ok(())
    }

    pub async fn update_document(&self, ctx: &RequestContext, input: DocumentInput) -> RecallResult<()> {
        self.engine.update_document(ctx, input).await?;
        self.invalidate_recommendations("update").await;
        Ok(())
    }

    pub async fn get_recommendations(
        &self,
        ctx: &RequestContext,
        request: &RecommendationRequest,
    ) -> RecallResult<RecommendationResponse> {
        self.recommender.get_recommendations(ctx, request).await
    }

    pub async fn get_search_stats(&self) -> SearchStats {
        let cache = self.cache.stats().await;
        let engine = self.engine.stats();
        let recommender = self.recommender.stats();

        SearchStats {
            query_vector_hits: cache.query_vector.hits,
            query_vector_misses: cache.query_vector.misses,
            query_vector_evictions: cache.query_vector.evictions,
            recommendation_hits: cache.recommendation.hits,
            recommendation_misses: cache.recommendation.misses,
            recommendation_evictions: cache.recommendation.evictions,
            user_preference_hits: cache.user_preference.hits,
            user_preference_misses: cache.user_preference.misses,
            user_preference_evictions: cache.user_preference.evictions,
            total_searches: engine.total_searches,
            failed_searches: engine.failed_searches,
            total_recommendations: recommender.total_recommendations,
            failed_recommendations: recommender.failed_recommendations,
            average_search_ms: engine.average_search_ms,
            documents_indexed: engine.documents_indexed,
        }
    }

    pub async fn health_check(&self, ctx: &RequestContext) -> HealthReport {
        let collaborators = self.engine.check_collaborators(ctx).await;
        let cache_entries = self.cache.stats().await.total_entries();
        let healthy = collaborators.vector_store.healthy && collaborators.embedding_provider.healthy;
        if !healthy {
            self.logger.warn(format_args!(
                "⚠️ Health check failed: store={:?} embedder={:?}",
                collaborators.vector_store.error, collaborators.embedding_provider.error
            ));
        }

        HealthReport {
            healthy,
            vector_store: collaborators.vector_store,
            embedding_provider: collaborators.embedding_provider,
            document_count: collaborators.document_count,
            cache_entries,
        }
    }

    /// Stops the cache cleanup task and drops every cached entry
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.logger.info(format_args!("🛑 Recall service stopped"));
    }

    async fn invalidate_recommendations(&self, cause: &str) {
        self.cache.recommendations().clear().await;
        self.logger.debug(format_args!("🧹 Recommendation cache cleared after {}", cause));
    }
}
