//! Similarity Calculator
//!
//! Pure numeric functions comparing embedding vectors under several metrics.
//! Nothing here holds state; every function validates its inputs and either
//! returns a score or a [`SimilarityError`].
//!
//! ## Metrics
//!
//! | Metric        | Raw value                    | Similarity returned        |
//! |---------------|------------------------------|----------------------------|
//! | `Cosine`      | `A·B / (‖A‖‖B‖)` in [-1, 1]  | `(cos + 1) / 2` in [0, 1]  |
//! | `Euclidean`   | `‖A - B‖₂`                   | `exp(-distance)`           |
//! | `DotProduct`  | `A·B`                        | `A·B` (unbounded)          |
//! | `Manhattan`   | `Σ|A[i] - B[i]|`             | `1 / (1 + distance)`       |
//!
//! A zero-norm operand makes cosine similarity 0 rather than an error: an
//! empty embedding carries no direction, so it matches nothing.
//!
//! ## Batch views
//!
//! [`SimilarityCalculator::rank_candidates`] compares one query against many
//! candidates and returns them best-first. `rank_above_threshold` and
//! `top_k` are thin views over the same ranking. Candidate sets larger than
//! [`PARALLEL_THRESHOLD`] are scored on the rayon pool.
//!
//! [`SimilarityCalculator::similarity_matrix`] computes all pairwise scores
//! for small sets. It is meant for diagnostics and refuses inputs above
//! [`MAX_MATRIX_SIZE`] vectors.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::RecallError;

/// Candidate count above which batch scoring runs in parallel
pub const PARALLEL_THRESHOLD: usize = 256;

/// Largest vector set accepted by [`SimilarityCalculator::similarity_matrix`]
pub const MAX_MATRIX_SIZE: usize = 512;

/// Errors that can occur during similarity computation
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimilarityError {
    #[error("Vector dimension mismatch: left has {left_dim} dimensions, right has {right_dim} dimensions")]
    DimensionMismatch { left_dim: usize, right_dim: usize },

    #[error("Empty vector provided: {vector_type}")]
    EmptyVector { vector_type: String },

    #[error("Invalid vector: contains non-finite values")]
    InvalidVector,

    #[error("Unknown similarity metric: {name}")]
    UnsupportedMetric { name: String },

    #[error("Too many vectors for a similarity matrix: {count} (max {max})")]
    MatrixTooLarge { count: usize, max: usize },
}

pub type SimilarityResult<T> = Result<T, SimilarityError>;

impl From<SimilarityError> for RecallError {
    fn from(error: SimilarityError) -> Self {
        match error {
            SimilarityError::UnsupportedMetric { name } => {
                RecallError::unsupported(format!("similarity metric '{}'", name))
            }
            other => RecallError::validation("vector", other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
    Manhattan,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::Euclidean => "euclidean",
            SimilarityMetric::DotProduct => "dot_product",
            SimilarityMetric::Manhattan => "manhattan",
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMetric {
    type Err = SimilarityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "euclidean" | "l2" => Ok(SimilarityMetric::Euclidean),
            "dot_product" | "dot" => Ok(SimilarityMetric::DotProduct),
            "manhattan" | "l1" => Ok(SimilarityMetric::Manhattan),
            _ => Err(SimilarityError::UnsupportedMetric { name: s.to_string() }),
        }
    }
}

/// One candidate's score from a batch comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// Position of the candidate in the input slice
    pub index: usize,
    pub similarity: f32,
}

pub struct SimilarityCalculator;

impl SimilarityCalculator {
    fn validate_pair(a: &[f32], b: &[f32]) -> SimilarityResult<()> {
        if a.is_empty() {
            return Err(SimilarityError::EmptyVector {
                vector_type: "left".to_string(),
            });
        }
        if b.is_empty() {
            return Err(SimilarityError::EmptyVector {
                vector_type: "right".to_string(),
            });
        }
        if a.len() != b.len() {
            return Err(SimilarityError::DimensionMismatch {
                left_dim: a.len(),
                right_dim: b.len(),
            });
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(SimilarityError::InvalidVector);
        }
        Ok(())
    }

    /// Cosine similarity rescaled from [-1, 1] into [0, 1].
    ///
    /// Dot product and both squared norms are accumulated in one pass. The raw
    /// cosine is clamped before rescaling to absorb floating-point drift, so
    /// `cosine_similarity(a, a)` is exactly 1.0 for any non-zero `a`.
    ///
    /// # Errors
    ///
    /// * `EmptyVector` - either input is empty
    /// * `DimensionMismatch` - inputs differ in length
    /// * `InvalidVector` - an input contains NaN or infinity
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> SimilarityResult<f32> {
        Self::validate_pair(a, b)?;

        let mut dot = 0.0f32;
        let mut sum_sq_a = 0.0f32;
        let mut sum_sq_b = 0.0f32;
        for (x, y) in a.iter().zip(b) {
            dot += x * y;
            sum_sq_a += x * x;
            sum_sq_b += y * y;
        }

        let magnitude = sum_sq_a.sqrt() * sum_sq_b.sqrt();
        if magnitude == 0.0 {
            return Ok(0.0);
        }

        let cosine = (dot / magnitude).clamp(-1.0, 1.0);
        Ok(((cosine + 1.0) / 2.0).clamp(0.0, 1.0))
    }

    pub fn euclidean_distance(a: &[f32], b: &[f32]) -> SimilarityResult<f32> {
        Self::validate_pair(a, b)?;
        Ok(a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt())
    }

    /// `exp(-distance)`: 1.0 for identical vectors, approaching 0 with distance
    pub fn euclidean_similarity(a: &[f32], b: &[f32]) -> SimilarityResult<f32> {
        Ok((-Self::euclidean_distance(a, b)?).exp())
    }

    pub fn dot_product(a: &[f32], b: &[f32]) -> SimilarityResult<f32> {
        Self::validate_pair(a, b)?;
        Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
    }

    pub fn manhattan_distance(a: &[f32], b: &[f32]) -> SimilarityResult<f32> {
        Self::validate_pair(a, b)?;
        Ok(a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum())
    }

    /// `1 / (1 + distance)`
    pub fn manhattan_similarity(a: &[f32], b: &[f32]) -> SimilarityResult<f32> {
        Ok(1.0 / (1.0 + Self::manhattan_distance(a, b)?))
    }

    /// Dispatch on `metric`
    pub fn calculate_similarity(a: &[f32], b: &[f32], metric: SimilarityMetric) -> SimilarityResult<f32> {
        match metric {
            SimilarityMetric::Cosine => Self::cosine_similarity(a, b),
            SimilarityMetric::Euclidean => Self::euclidean_similarity(a, b),
            SimilarityMetric::DotProduct => Self::dot_product(a, b),
            SimilarityMetric::Manhattan => Self::manhattan_similarity(a, b),
        }
    }

    /// Same as [`Self::calculate_similarity`] but takes the metric by name.
    pub fn calculate_similarity_named(a: &[f32], b: &[f32], metric: &str) -> SimilarityResult<f32> {
        Self::calculate_similarity(a, b, metric.parse()?)
    }

    /// Scale a vector to unit length.
    ///
    /// # Errors
    ///
    /// * `EmptyVector` - input is empty
    /// * `InvalidVector` - input has non-finite values or zero magnitude
    pub fn normalize_vector(vector: &[f32]) -> SimilarityResult<Vec<f32>> {
        if vector.is_empty() {
            return Err(SimilarityError::EmptyVector {
                vector_type: "input vector".to_string(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(SimilarityError::InvalidVector);
        }

        let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude == 0.0 {
            return Err(SimilarityError::InvalidVector);
        }

        Ok(vector.iter().map(|v| v / magnitude).collect())
    }

    /// Component-wise mean of equally sized vectors.
    pub fn average_vectors(vectors: &[Vec<f32>]) -> SimilarityResult<Vec<f32>> {
        let first = vectors.first().ok_or_else(|| SimilarityError::EmptyVector {
            vector_type: "vector set".to_string(),
        })?;
        if first.is_empty() {
            return Err(SimilarityError::EmptyVector {
                vector_type: "vector set member".to_string(),
            });
        }

        let mut sum = vec![0.0f32; first.len()];
        for vector in vectors {
            if vector.len() != sum.len() {
                return Err(SimilarityError::DimensionMismatch {
                    left_dim: sum.len(),
                    right_dim: vector.len(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(vector) {
                *acc += v;
            }
        }

        let count = vectors.len() as f32;
        Ok(sum.into_iter().map(|v| v / count).collect())
    }

    /// Score every candidate against `query` and return them best-first.
    ///
    /// Ties keep input order. Any malformed candidate fails the whole batch.
    pub fn rank_candidates<V>(
        query: &[f32],
        candidates: &[V],
        metric: SimilarityMetric,
    ) -> SimilarityResult<Vec<ScoredCandidate>>
    where
        V: AsRef<[f32]> + Sync,
    {
        let score = |(index, candidate): (usize, &V)| -> SimilarityResult<ScoredCandidate> {
            Ok(ScoredCandidate {
                index,
                similarity: Self::calculate_similarity(query, candidate.as_ref(), metric)?,
            })
        };

        let mut scored: Vec<ScoredCandidate> = if candidates.len() > PARALLEL_THRESHOLD {
            candidates.par_iter().enumerate().map(score).collect::<SimilarityResult<_>>()?
        } else {
            candidates.iter().enumerate().map(score).collect::<SimilarityResult<_>>()?
        };

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });
        Ok(scored)
    }

    pub fn rank_above_threshold<V>(
        query: &[f32],
        candidates: &[V],
        metric: SimilarityMetric,
        threshold: f32,
    ) -> SimilarityResult<Vec<ScoredCandidate>>
    where
        V: AsRef<[f32]> + Sync,
    {
        let mut ranked = Self::rank_candidates(query, candidates, metric)?;
        ranked.retain(|c| c.similarity >= threshold);
        Ok(ranked)
    }

    pub fn top_k<V>(
        query: &[f32],
        candidates: &[V],
        metric: SimilarityMetric,
        k: usize,
    ) -> SimilarityResult<Vec<ScoredCandidate>>
    where
        V: AsRef<[f32]> + Sync,
    {
        let mut ranked = Self::rank_candidates(query, candidates, metric)?;
        ranked.truncate(k);
        Ok(ranked)
    }

    /// All pairwise similarities; `matrix[i][j] == sim(vectors[i], vectors[j])`.
    pub fn similarity_matrix<V>(vectors: &[V], metric: SimilarityMetric) -> SimilarityResult<Vec<Vec<f32>>>
    where
        V: AsRef<[f32]> + Sync,
    {
        if vectors.len() > MAX_MATRIX_SIZE {
            return Err(SimilarityError::MatrixTooLarge {
                count: vectors.len(),
                max: MAX_MATRIX_SIZE,
            });
        }

        vectors
            .par_iter()
            .map(|row| {
                vectors
                    .iter()
                    .map(|col| Self::calculate_similarity(row.as_ref(), col.as_ref(), metric))
                    .collect::<SimilarityResult<Vec<f32>>>()
            })
            .collect()
    }
}
