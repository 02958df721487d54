// Module declarations
pub mod errors;
pub mod logging;
pub mod request_context;
pub mod config;
pub mod similarity;
pub mod text_processing;
pub mod vector_store;
pub mod embedding;
pub mod interactions;
pub mod cache_manager;
pub mod ranking;
pub mod search_engine;
pub mod recommender;
pub mod service;

// Re-exports for commonly used types
pub use errors::{ErrorKind, RecallError, RecallResult};
pub use logging::Logger;
pub use request_context::RequestContext;
pub use config::EngineConfig;
pub use similarity::{SimilarityCalculator, SimilarityMetric};
pub use vector_store::{
    DocumentMetadata, InMemoryVectorStore, MetadataFilter, TimeRange, VectorDocument, VectorStore,
};
pub use embedding::{EmbeddingProvider, OllamaConfig, OllamaEmbeddingProvider};
pub use interactions::{InMemoryInteractionStore, Interaction, InteractionStore, PersonalizationContext};
pub use cache_manager::{CacheConfig, CacheManager, CacheStats};
pub use ranking::{Ranker, RankingOptions, RankingStrategy};
pub use search_engine::{
    BatchIndexReport, DocumentInput, SearchEngineConfig, SearchOptions, SearchResponse, SearchResultItem,
    SemanticSearchEngine,
};
pub use recommender::{
    RecommendationItem, RecommendationRequest, RecommendationResponse, RecommendationType, Recommender,
    RecommenderConfig,
};
pub use service::{HealthReport, RecallService, SearchStats};
