//! # Cache Manager
//!
//! Concurrency-safe TTL + LRU caching for the retrieval core. Three
//! independent partitions share one manager:
//!
//! - **Query vectors**: embeddings of preprocessed query text
//! - **Recommendations**: finished recommendation lists
//! - **User preferences**: personalization contexts fetched from the
//!   interaction store
//!
//! ## Entry lifecycle
//!
//! An entry is created on a miss, refreshed (access count and timestamp) on a
//! hit, and removed by TTL expiry, explicit invalidation or LRU eviction. An
//! entry older than its partition's TTL is treated as absent on read and
//! evicted right there, even if the background sweep has not reached it yet.
//!
//! ## Locking
//!
//! Each partition wraps an [`LruCache`] in its own `tokio::sync::RwLock`.
//! Lookups promote the entry in the recency list, so `get` takes the write
//! side; the critical section is O(1). Size, `contains` and sweeps over
//! expired keys only need the read side or a short write. Statistics live in
//! atomics outside the lock.
//!
//! ## Background cleanup
//!
//! One task per manager sweeps every partition on a fixed interval. It is
//! started by [`CacheManager::new`] and stopped by [`CacheManager::shutdown`],
//! which cancels the task, waits for it to exit, then clears all partitions.
//! Calling `shutdown` twice is harmless.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::RecallError;
use crate::interactions::PersonalizationContext;
use crate::logging::Logger;
use crate::recommender::{RecommendationItem, RecommendationRequest};
use crate::search_engine::SearchOptions;

/// Errors that can occur during cache configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Invalid cache configuration for {partition}: {reason}")]
    InvalidConfig { partition: String, reason: String },
}

impl From<CacheError> for RecallError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::InvalidConfig { partition, reason } => {
                RecallError::validation(format!("cache.{}", partition), reason)
            }
        }
    }
}

/// Size and lifetime bounds of one partition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Maximum number of entries before LRU eviction kicks in
    pub max_entries: usize,
    /// Time-to-live for entries in seconds
    pub ttl_seconds: u64,
}

impl PartitionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Configuration for the cache manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub query_vectors: PartitionConfig,
    pub recommendations: PartitionConfig,
    pub user_preferences: PartitionConfig,
    /// Seconds between background sweeps
    pub cleanup_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_vectors: PartitionConfig {
                max_entries: 1000,  // Embeddings for 1000 distinct queries
                ttl_seconds: 3600,  // 1 hour
            },
            recommendations: PartitionConfig {
                max_entries: 500,
                ttl_seconds: 300,   // 5 minutes; lists go stale as the archive grows
            },
            user_preferences: PartitionConfig {
                max_entries: 1000,
                ttl_seconds: 1800,  // 30 minutes
            },
            cleanup_interval_seconds: 300,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        for (name, partition) in [
            ("query_vectors", &self.query_vectors),
            ("recommendations", &self.recommendations),
            ("user_preferences", &self.user_preferences),
        ] {
            if partition.max_entries == 0 {
                return Err(CacheError::InvalidConfig {
                    partition: name.to_string(),
                    reason: "max_entries must be greater than 0".to_string(),
                });
            }
            if partition.ttl_seconds == 0 {
                return Err(CacheError::InvalidConfig {
                    partition: name.to_string(),
                    reason: "ttl_seconds must be greater than 0".to_string(),
                });
            }
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(CacheError::InvalidConfig {
                partition: "cleanup".to_string(),
                reason: "cleanup_interval_seconds must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    QueryVector,
    Recommendation,
    UserPreference,
}

impl PartitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKind::QueryVector => "query_vector",
            PartitionKind::Recommendation => "recommendation",
            PartitionKind::UserPreference => "user_preference",
        }
    }
}

/// Cache entry with access bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }

    fn mark_accessed(&mut self, now: Instant) {
        self.access_count += 1;
        self.last_accessed = now;
    }
}

#[derive(Debug, Default)]
struct PartitionCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time statistics of one partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub max_entries: usize,
    pub hit_rate: f64,
}

/// Statistics for all partitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub query_vector: PartitionStats,
    pub recommendation: PartitionStats,
    pub user_preference: PartitionStats,
}

impl CacheStats {
    pub fn total_entries(&self) -> usize {
        self.query_vector.entries + self.recommendation.entries + self.user_preference.entries
    }
}

/// One TTL + LRU bounded key/value partition
pub struct CachePartition<V> {
    kind: PartitionKind,
    entries: RwLock<LruCache<String, CacheEntry<V>>>,
    capacity: NonZeroUsize,
    ttl: Duration,
    counters: PartitionCounters,
    logger: Logger,
}

impl<V: Clone + Send + Sync> CachePartition<V> {
    pub fn new(kind: PartitionKind, config: PartitionConfig, logger: Logger) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            kind,
            entries: RwLock::new(LruCache::new(capacity)),
            capacity,
            ttl: config.ttl(),
            counters: PartitionCounters::default(),
            logger,
        }
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    /// Look up `key`. Expired entries count as misses and are evicted here.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(self.ttl, now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            entries.pop(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.mark_accessed(now);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert or replace `key`. A full partition first drops its least
    /// recently accessed entry.
    pub async fn set(&self, key: &str, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !entries.contains(key) && entries.len() >= self.capacity.get() {
            if let Some((evicted, entry)) = entries.pop_lru() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.logger.debug(format_args!(
                    "Evicted LRU {} entry {} (accessed {} times)",
                    self.kind.as_str(),
                    &evicted[..evicted.len().min(12)],
                    entry.access_count
                ));
            }
        }

        entries.put(key.to_string(), CacheEntry::new(value, now));
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.write().await.pop(key).is_some()
    }

    /// Whether a live entry exists, without touching recency or counters
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .peek(key)
            .map(|entry| !entry.is_expired(self.ttl, now))
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Remove every expired entry, returning how many were dropped
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();

        let expired_keys: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(self.ttl, now))
                .map(|(key, _)| key.clone())
                .collect()
        };
        if expired_keys.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in expired_keys {
            // Re-check: the entry may have been replaced since the scan
            let still_expired = entries
                .peek(&key)
                .map(|entry| entry.is_expired(self.ttl, now))
                .unwrap_or(false);
            if still_expired {
                entries.pop(&key);
                removed += 1;
            }
        }

        self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub async fn stats(&self) -> PartitionStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        PartitionStats {
            hits,
            misses,
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len().await,
            max_entries: self.capacity.get(),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Field-tagged SHA-256 key builder.
///
/// Every field is written as `name`, byte length, bytes, so adjacent fields
/// cannot run into each other and produce the same digest.
struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    fn new(namespace: &str) -> Self {
        let mut builder = Self { hasher: Sha256::new() };
        builder.field("ns", namespace.as_bytes());
        builder
    }

    fn field(&mut self, name: &str, value: &[u8]) -> &mut Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    fn opt_str(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.field(name, format!("some:{}", v).as_bytes()),
            None => self.field(name, b"none"),
        }
    }

    fn sorted_list(&mut self, name: &str, values: &[String]) -> &mut Self {
        let mut normalized: Vec<String> = values.iter().map(|v| v.to_lowercase()).collect();
        normalized.sort();
        normalized.dedup();
        self.field(name, normalized.join("\u{1f}").as_bytes())
    }

    fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

pub struct CacheManager {
    query_vectors: Arc<CachePartition<Vec<f32>>>,
    recommendations: Arc<CachePartition<Vec<RecommendationItem>>>,
    user_preferences: Arc<CachePartition<PersonalizationContext>>,
    config: CacheConfig,
    shutdown_token: CancellationToken,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl CacheManager {
    /// Build the partitions and start the background sweep.
    ///
    /// Outside a tokio runtime no sweep is started; expired entries are then
    /// only dropped lazily on read.
    pub fn new(config: CacheConfig, logger: Logger) -> Self {
        let query_vectors = Arc::new(CachePartition::new(
            PartitionKind::QueryVector,
            config.query_vectors,
            logger.child("query_vector"),
        ));
        let recommendations = Arc::new(CachePartition::new(
            PartitionKind::Recommendation,
            config.recommendations,
            logger.child("recommendation"),
        ));
        let user_preferences = Arc::new(CachePartition::new(
            PartitionKind::UserPreference,
            config.user_preferences,
            logger.child("user_preference"),
        ));

        let shutdown_token = CancellationToken::new();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(Self::cleanup_loop(
                query_vectors.clone(),
                recommendations.clone(),
                user_preferences.clone(),
                Duration::from_secs(config.cleanup_interval_seconds.max(1)),
                shutdown_token.clone(),
                logger.clone(),
            ))),
            Err(_) => {
                logger.warn(format_args!(
                    "⚠️ No tokio runtime; cache cleanup will only happen on read"
                ));
                None
            }
        };

        Self {
            query_vectors,
            recommendations,
            user_preferences,
            config,
            shutdown_token,
            cleanup_handle: Mutex::new(handle),
            logger,
        }
    }

    async fn cleanup_loop(
        query_vectors: Arc<CachePartition<Vec<f32>>>,
        recommendations: Arc<CachePartition<Vec<RecommendationItem>>>,
        user_preferences: Arc<CachePartition<PersonalizationContext>>,
        period: Duration,
        shutdown: CancellationToken,
        logger: Logger,
    ) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = query_vectors.cleanup_expired().await
                        + recommendations.cleanup_expired().await
                        + user_preferences.cleanup_expired().await;
                    if removed > 0 {
                        logger.debug(format_args!("🧹 Background cleanup: removed {} expired entries", removed));
                    }
                }
            }
        }

        logger.debug(format_args!("Cache cleanup task stopped"));
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn query_vectors(&self) -> &CachePartition<Vec<f32>> {
        &self.query_vectors
    }

    pub fn recommendations(&self) -> &CachePartition<Vec<RecommendationItem>> {
        &self.recommendations
    }

    pub fn user_preferences(&self) -> &CachePartition<PersonalizationContext> {
        &self.user_preferences
    }

    /// Key for a query embedding: the query text plus the options that shape
    /// the result set.
    pub fn query_vector_key(query: &str, options: &SearchOptions) -> String {
        let mut key = KeyBuilder::new("query_vector");
        key.field("query", query.as_bytes())
            .field("top_k", &(options.resolved_top_k() as u64).to_le_bytes())
            .opt_str("user_id", options.user_id.as_deref())
            .sorted_list("content_types", &options.content_types)
            .field("min_similarity", &options.min_similarity.to_bits().to_le_bytes())
            .field("include_content", &[options.include_content as u8])
            .field("metric", options.resolved_metric().as_str().as_bytes());
        key.finish()
    }

    /// Key for a recommendation list. Covers every field that can change the
    /// returned list.
    pub fn recommendation_key(request: &RecommendationRequest) -> String {
        let mut key = KeyBuilder::new("recommendation");
        key.field("type", request.recommendation_type.as_str().as_bytes())
            .opt_str("user_id", request.user_id.as_deref())
            .opt_str("source_document_id", request.source_document_id.as_deref())
            .opt_str("source_query", request.source_query.as_deref())
            .field("max_count", &(request.max_count as u64).to_le_bytes())
            .field("min_similarity", &request.min_similarity.to_bits().to_le_bytes())
            .sorted_list("exclude", &request.exclude_documents)
            .sorted_list("content_types", &request.content_types)
            .field("diversity", &[request.enable_diversity as u8])
            .field("include_content", &[request.include_content as u8]);
        if let Some(days) = request.time_window_days {
            key.field("time_window_days", &days.to_le_bytes());
        }
        if let Some(context) = &request.context {
            // Inline contexts change personalized scores, so they are part of the key
            key.field("context", context.fingerprint().as_bytes());
        }
        key.finish()
    }

    pub fn user_preference_key(user_id: &str) -> String {
        let mut key = KeyBuilder::new("user_preference");
        key.field("user_id", user_id.as_bytes());
        key.finish()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            query_vector: self.query_vectors.stats().await,
            recommendation: self.recommendations.stats().await,
            user_preference: self.user_preferences.stats().await,
        }
    }

    /// Sweep all partitions now, returning the number of removed entries
    pub async fn cleanup_expired(&self) -> usize {
        self.query_vectors.cleanup_expired().await
            + self.recommendations.cleanup_expired().await
            + self.user_preferences.cleanup_expired().await
    }

    pub async fn clear_all(&self) {
        self.query_vectors.clear().await;
        self.recommendations.clear().await;
        self.user_preferences.clear().await;
        self.logger.info(format_args!("🗑️ All cache partitions cleared"));
    }

    pub async fn is_cleanup_running(&self) -> bool {
        self.cleanup_handle
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the background sweep, wait for it to exit, and clear every
    /// partition. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let handle = self.cleanup_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                self.logger.warn(format_args!("⚠️ Cache cleanup task ended abnormally: {}", e));
            }
            self.logger.info(format_args!("⏹️ Cache manager shut down"));
        }

        self.clear_all().await;
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        if let Ok(mut guard) = self.cleanup_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
