//! Engine-wide configuration.
//!
//! Every section falls back to its defaults when missing, so a JSON file only
//! needs the values it changes:
//!
//! ```json
//! { "cache": { "recommendations": { "max_entries": 50, "ttl_seconds": 60 } },
//!   "recommender": { "hybrid_weights": { "trending": 0.5 } } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache_manager::CacheConfig;
use crate::embedding::OllamaConfig;
use crate::errors::{RecallError, RecallResult};
use crate::ranking::RankingOptions;
use crate::recommender::RecommenderConfig;
use crate::search_engine::SearchEngineConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub search: SearchEngineConfig,
    pub recommender: RecommenderConfig,
    /// Ranking applied to searches that carry no ranking options of their
    /// own. `None` keeps the plain relevance sort.
    pub ranking: Option<RankingOptions>,
    pub ollama: OllamaConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> RecallResult<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| RecallError::validation("config", format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RecallResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RecallError::validation("config_path", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> RecallResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RecallError::validation("config", format!("cannot serialize: {}", e)))
    }

    pub fn validate(&self) -> RecallResult<()> {
        self.cache.validate()?;
        self.search.validate()?;
        self.recommender.validate()?;
        if let Some(ranking) = &self.ranking {
            ranking.validate()?;
        }
        self.ollama
            .validate()
            .map_err(|e| RecallError::validation("ollama", e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.recommendations.ttl_seconds, 300);
        assert_eq!(config.recommender.hybrid_weights.personalized, 0.4);
        assert!(config.ranking.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "cache": { "recommendations": { "max_entries": 50, "ttl_seconds": 60 } },
                 "recommender": { "diversity_per_type_cap": 3 } }"#,
        )
        .unwrap();

        assert_eq!(config.cache.recommendations.ttl_seconds, 60);
        assert_eq!(config.cache.recommendations.max_entries, 50);
        assert_eq!(config.cache.query_vectors.ttl_seconds, 3600);
        assert_eq!(config.recommender.diversity_per_type_cap, 3);
        assert_eq!(config.recommender.related_vector_weight, 0.7);
        assert_eq!(config.ollama.model, "nomic-embed-text");
    }

    #[test]
    fn test_invalid_values_name_the_field() {
        let err = EngineConfig::from_json_str(r#"{ "recommender": { "collaborative_neighbors": 0 } }"#).unwrap_err();
        match err {
            RecallError::Validation { field, .. } => assert_eq!(field, "recommender.collaborative_neighbors"),
            other => panic!("unexpected {:?}", other),
        }

        let err = EngineConfig::from_json_str(r#"{ "cache": { "query_vectors": { "max_entries": 0, "ttl_seconds": 10 } } }"#).unwrap_err();
        assert!(matches!(err, RecallError::Validation { .. }));

        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, RecallError::Validation { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "ollama": {{ "model": "mxbai-embed-large" }} }}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.ollama.model, "mxbai-embed-large");

        let missing = EngineConfig::from_json_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(RecallError::Validation { .. })));
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut config = EngineConfig::default();
        config.ranking = Some(RankingOptions::default());
        let json = config.to_json_string().unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }
}
