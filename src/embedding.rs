//! Embedding provider contract and the Ollama-backed implementation.
//!
//! The core only needs `embed(text) -> vector`. Providers must return the
//! same vector for the same text; the query-vector cache relies on it.
//! Failures are returned as-is and never retried here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::RecallError;
use crate::logging::Logger;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {status_code} - {message}")]
    Api { status_code: u16, message: String },

    #[error("Timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Empty text provided")]
    EmptyText,

    #[error("Invalid embedding response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

impl EmbeddingError {
    /// Lift into the crate taxonomy. Empty input is the caller's fault,
    /// everything else is an upstream failure.
    pub fn into_recall(self, operation: &str, context: impl Into<String>) -> RecallError {
        match self {
            EmbeddingError::EmptyText => RecallError::validation("text", "cannot be empty"),
            other => RecallError::upstream(format!("embedding.{}", operation), context, other),
        }
    }
}

/// A generated embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub tokens_used: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Embed `text`. `content_type_hint` lets providers pick a prompt prefix
    /// or model per content type; implementations may ignore it.
    async fn embed(&self, text: &str, content_type_hint: Option<&str>) -> EmbeddingResult<Embedding>;

    async fn health_check(&self) -> EmbeddingResult<()>;
}

/// Connection settings for a local Ollama instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_ms: 30_000, // Cold model loads can take several seconds
        }
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> EmbeddingResult<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(EmbeddingError::Config {
                message: format!("base_url must be an http(s) URL, got '{}'", self.base_url),
            });
        }
        if self.model.trim().is_empty() {
            return Err(EmbeddingError::Config {
                message: "model cannot be empty".to_string(),
            });
        }
        if self.timeout_ms == 0 {
            return Err(EmbeddingError::Config {
                message: "timeout_ms must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embedding provider talking to Ollama's `/api/embeddings` endpoint
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingProvider {
    config: OllamaConfig,
    client: Client,
    logger: Logger,
}

impl OllamaEmbeddingProvider {
    pub fn new(config: OllamaConfig, logger: Logger) -> EmbeddingResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { config, client, logger })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Ollama does not report token counts for embeddings; approximate with
    /// whitespace-separated words.
    fn estimate_tokens(text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn embed(&self, text: &str, _content_type_hint: Option<&str>) -> EmbeddingResult<Embedding> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        let url = format!("{}/api/embeddings", self.config.base_url.trim_end_matches('/'));
        let request = EmbeddingRequest {
            model: &self.config.model,
            prompt: text,
        };

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Timeout {
                    duration_ms: self.config.timeout_ms,
                }
            } else {
                EmbeddingError::Network(e)
            }
        })?;

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            self.logger.warn(format_args!(
                "❌ Embedding request failed with status {}: {}",
                status_code, message
            ));
            return Err(EmbeddingError::Api { status_code, message });
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse {
                reason: "empty embedding vector".to_string(),
            });
        }
        if let Some(i) = body.embedding.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidResponse {
                reason: format!("non-finite value at index {}", i),
            });
        }

        self.logger.debug(format_args!(
            "Generated {}-dim embedding with {}",
            body.embedding.len(),
            self.config.model
        ));

        Ok(Embedding {
            vector: body.embedding,
            tokens_used: Self::estimate_tokens(text),
        })
    }

    async fn health_check(&self) -> EmbeddingResult<()> {
        let url = format!("{}/api/tags", self.config.base_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(EmbeddingError::Api {
                status_code: response.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    /// Mock Ollama server for embedding API testing
    struct MockEmbeddingServer {
        server: MockServer,
    }

    impl MockEmbeddingServer {
        async fn new() -> Self {
            Self {
                server: MockServer::start().await,
            }
        }

        fn provider(&self) -> OllamaEmbeddingProvider {
            let config = OllamaConfig {
                base_url: self.server.uri(),
                model: "nomic-embed-text".to_string(),
                timeout_ms: 2_000,
            };
            OllamaEmbeddingProvider::new(config, Logger::silent()).unwrap()
        }

        async fn setup_successful_embedding(&self, dims: usize) {
            let embedding: Vec<f32> = (0..dims).map(|i| i as f32 * 0.01).collect();
            Mock::given(method("POST"))
                .and(path("/api/embeddings"))
                .and(body_partial_json(json!({ "model": "nomic-embed-text" })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embedding": embedding })))
                .mount(&self.server)
                .await;
        }
    }

    #[tokio::test]
    async fn test_embed_success() {
        let mock = MockEmbeddingServer::new().await;
        mock.setup_successful_embedding(384).await;

        let embedding = mock.provider().embed("machine learning in practice", None).await.unwrap();
        assert_eq!(embedding.vector.len(), 384);
        assert_eq!(embedding.tokens_used, 4);
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_text() {
        let mock = MockEmbeddingServer::new().await;
        let result = mock.provider().embed("   ", None).await;
        assert!(matches!(result, Err(EmbeddingError::EmptyText)));
    }

    #[tokio::test]
    async fn test_embed_api_error() {
        let mock = MockEmbeddingServer::new().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&mock.server)
            .await;

        let result = mock.provider().embed("hello world", None).await;
        match result {
            Err(EmbeddingError::Api { status_code, message }) => {
                assert_eq!(status_code, 500);
                assert!(message.contains("model not loaded"));
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_embed_empty_vector_is_invalid() {
        let mock = MockEmbeddingServer::new().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embedding": [] })))
            .mount(&mock.server)
            .await;

        let result = mock.provider().embed("hello world", None).await;
        assert!(matches!(result, Err(EmbeddingError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_health_check() {
        let mock = MockEmbeddingServer::new().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
            .mount(&mock.server)
            .await;

        assert!(mock.provider().health_check().await.is_ok());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            EmbeddingError::EmptyText.into_recall("embed", "model=x"),
            RecallError::Validation { .. }
        ));
        let timeout = EmbeddingError::Timeout { duration_ms: 10 };
        match timeout.into_recall("embed", "model=x") {
            RecallError::Upstream { operation, context, .. } => {
                assert_eq!(operation, "embedding.embed");
                assert_eq!(context, "model=x");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(OllamaConfig::default().validate().is_ok());
        let bad = OllamaConfig {
            base_url: "localhost:11434".into(),
            ..OllamaConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
