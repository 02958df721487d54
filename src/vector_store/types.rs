use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::RecallError;

/// Errors that can occur inside a vector store implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorStoreError {
    #[error("Document not found: {id}")]
    NotFound { id: String },

    #[error("Document already exists: {id}")]
    DuplicateId { id: String },

    #[error("Invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("Embedding dimension mismatch: store has {expected}, document has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

pub type VectorStoreResult<T> = Result<T, VectorStoreError>;

impl VectorStoreError {
    /// Lift a store error into the crate taxonomy, attaching the operation
    /// and its context (document id, collection, batch size...).
    pub fn into_recall(self, operation: &str, context: impl Into<String>) -> RecallError {
        match self {
            VectorStoreError::NotFound { id } => RecallError::NotFound { id },
            VectorStoreError::DuplicateId { id } => {
                RecallError::validation("id", format!("document '{}' already exists", id))
            }
            VectorStoreError::InvalidDocument { reason } => RecallError::validation("document", reason),
            VectorStoreError::DimensionMismatch { expected, actual } => RecallError::validation(
                "embedding",
                format!("expected {} dimensions, got {}", expected, actual),
            ),
            VectorStoreError::Backend { message } => {
                RecallError::upstream(format!("vector_store.{}", operation), context, message)
            }
        }
    }
}

/// Typed metadata attached to every stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentMetadata {
    /// Content type such as `article`, `note`, `image`, `link`
    pub content_type: Option<String>,
    /// Owner of the document
    pub user_id: Option<String>,
    /// Importance in [0, 1]
    pub importance: Option<f32>,
    pub tags: Vec<String>,
    /// Extra keywords considered during keyword matching
    pub keywords: Vec<String>,
    pub title: Option<String>,
    /// Where the content came from (chat message, URL, ...)
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Free-form string attributes that have no typed slot
    pub extra: BTreeMap<String, String>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            content_type: None,
            user_id: None,
            importance: None,
            tags: Vec::new(),
            keywords: Vec::new(),
            title: None,
            source: None,
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }
}

impl DocumentMetadata {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn content_type_is(&self, content_type: &str) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.eq_ignore_ascii_case(content_type))
            .unwrap_or(false)
    }

    /// Update the last modified timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Validate metadata consistency
    pub fn validate(&self) -> VectorStoreResult<()> {
        if let Some(importance) = self.importance {
            if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
                return Err(VectorStoreError::InvalidDocument {
                    reason: format!("importance must be within [0, 1], got {}", importance),
                });
            }
        }

        if matches!(self.content_type.as_deref(), Some(ct) if ct.trim().is_empty()) {
            return Err(VectorStoreError::InvalidDocument {
                reason: "content_type cannot be blank".to_string(),
            });
        }

        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(VectorStoreError::InvalidDocument {
                reason: "tags cannot contain blank entries".to_string(),
            });
        }

        if self.updated_at < self.created_at {
            return Err(VectorStoreError::InvalidDocument {
                reason: "updated_at precedes created_at".to_string(),
            });
        }

        Ok(())
    }
}

/// A stored document: content, its embedding and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
    /// Distance to the query vector, populated on query results only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl VectorDocument {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
        metadata: DocumentMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata,
            distance: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }

    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }

    /// Validate the document before it crosses the store boundary
    pub fn validate(&self) -> VectorStoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(VectorStoreError::InvalidDocument {
                reason: "id cannot be empty".to_string(),
            });
        }

        if self.embedding.is_empty() {
            return Err(VectorStoreError::InvalidDocument {
                reason: "embedding cannot be empty".to_string(),
            });
        }

        for (i, &value) in self.embedding.iter().enumerate() {
            if !value.is_finite() {
                return Err(VectorStoreError::InvalidDocument {
                    reason: format!("embedding contains invalid value at index {}: {}", i, value),
                });
            }
        }

        self.metadata.validate()
    }
}

/// Inclusive creation-time window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self { start: Some(start), end: None }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map(|s| at >= s).unwrap_or(true) && self.end.map(|e| at <= e).unwrap_or(true)
    }
}

/// Metadata predicate pushed down to the vector store.
///
/// Fields combine with AND; the values inside one set field combine with OR.
/// Empty sets and `None` fields do not constrain anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataFilter {
    pub user_id: Option<String>,
    pub content_types: Vec<String>,
    pub tags: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub min_importance: Option<f32>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.content_types.is_empty()
            && self.tags.is_empty()
            && self.time_range.is_none()
            && self.min_importance.is_none()
    }

    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        if let Some(user_id) = &self.user_id {
            if metadata.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }

        if !self.content_types.is_empty()
            && !self.content_types.iter().any(|ct| metadata.content_type_is(ct))
        {
            return false;
        }

        if !self.tags.is_empty() && !self.tags.iter().any(|tag| metadata.has_tag(tag)) {
            return false;
        }

        if let Some(range) = &self.time_range {
            if !range.contains(metadata.created_at) {
                return false;
            }
        }

        // Documents without an importance score never pass an importance floor
        if let Some(min) = self.min_importance {
            match metadata.importance {
                Some(importance) if importance >= min => {}
                _ => return false,
            }
        }

        true
    }
}
