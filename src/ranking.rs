//! # Ranker
//!
//! Stateless scoring and reordering of result sets.
//!
//! A [`RankingOptions`] value selects one of six strategies:
//!
//! | Strategy       | Sort key                                                  |
//! |----------------|-----------------------------------------------------------|
//! | `Similarity`   | vector similarity                                         |
//! | `Relevance`    | precomputed composite relevance                           |
//! | `Recency`      | freshness (half-life decay)                               |
//! | `Importance`   | metadata importance                                       |
//! | `Hybrid`       | weighted sum of all seven factors plus additive boosts    |
//! | `Personalized` | `0.6 * relevance + 0.4 * personalization` (configurable)  |
//!
//! Every strategy returns the reordered items together with a parallel
//! [`ScoreBreakdown`] per item. Ranks are 1-based and assigned after
//! diversity filtering, so they are always contiguous.
//!
//! ## Freshness
//!
//! `0.5^(age_days / half_life_days)`, floored at `min_score`, then multiplied
//! by `recent_boost` when the item is younger than `recent_window_days`. The
//! result is capped at 1.0.
//!
//! ## Diversity
//!
//! The optional filter walks the sorted list and drops any item whose content
//! type, one of whose tags, or whose creation day has already reached its
//! cap. [`Ranker::diversity_score`] reports the evenness of a list as the
//! weighted normalized Shannon entropy of those three distributions.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{RecallError, RecallResult};
use crate::interactions::PersonalizationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    Similarity,
    #[default]
    Relevance,
    Recency,
    Importance,
    Hybrid,
    Personalized,
}

impl RankingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankingStrategy::Similarity => "similarity",
            RankingStrategy::Relevance => "relevance",
            RankingStrategy::Recency => "recency",
            RankingStrategy::Importance => "importance",
            RankingStrategy::Hybrid => "hybrid",
            RankingStrategy::Personalized => "personalized",
        }
    }
}

impl FromStr for RankingStrategy {
    type Err = RecallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "similarity" => Ok(RankingStrategy::Similarity),
            "relevance" => Ok(RankingStrategy::Relevance),
            "recency" => Ok(RankingStrategy::Recency),
            "importance" => Ok(RankingStrategy::Importance),
            "hybrid" => Ok(RankingStrategy::Hybrid),
            "personalized" => Ok(RankingStrategy::Personalized),
            other => Err(RecallError::unsupported(format!("ranking strategy '{}'", other))),
        }
    }
}

/// Factor weights for the hybrid strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub similarity: f32,
    pub keyword_match: f32,
    pub importance: f32,
    pub freshness: f32,
    pub user_preference: f32,
    pub content_type_affinity: f32,
    pub tag_relevance: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            similarity: 0.35,
            keyword_match: 0.15,
            importance: 0.10,
            freshness: 0.10,
            user_preference: 0.10,
            content_type_affinity: 0.10,
            tag_relevance: 0.10,
        }
    }
}

impl RankingWeights {
    fn as_array(&self) -> [(&'static str, f32); 7] {
        [
            ("similarity", self.similarity),
            ("keyword_match", self.keyword_match),
            ("importance", self.importance),
            ("freshness", self.freshness),
            ("user_preference", self.user_preference),
            ("content_type_affinity", self.content_type_affinity),
            ("tag_relevance", self.tag_relevance),
        ]
    }
}

/// Additive score boosts keyed by content type and tag (case-insensitive)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostFactors {
    pub content_types: BTreeMap<String, f32>,
    pub tags: BTreeMap<String, f32>,
}

impl BoostFactors {
    pub fn boost_for(&self, content_type: Option<&str>, tags: &[String]) -> f32 {
        let type_boost = content_type
            .and_then(|ct| {
                self.content_types
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(ct))
                    .map(|(_, v)| *v)
            })
            .unwrap_or(0.0);

        let tag_boost: f32 = tags
            .iter()
            .filter_map(|tag| {
                self.tags
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(tag))
                    .map(|(_, v)| *v)
            })
            .sum();

        type_boost + tag_boost
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeDecayConfig {
    pub half_life_days: f64,
    /// Floor applied after decay
    pub min_score: f32,
    pub recent_window_days: f64,
    /// Multiplier for items younger than `recent_window_days`
    pub recent_boost: f32,
}

impl Default for TimeDecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            min_score: 0.1,
            recent_window_days: 1.0,
            recent_boost: 1.2,
        }
    }
}

/// Relative weight of each distribution in the diversity score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyWeights {
    pub content_type: f32,
    pub tag: f32,
    pub time_bucket: f32,
}

impl Default for EntropyWeights {
    fn default() -> Self {
        Self {
            content_type: 0.4,
            tag: 0.4,
            time_bucket: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversityConfig {
    pub enabled: bool,
    pub max_per_content_type: Option<usize>,
    pub max_per_tag: Option<usize>,
    /// Cap on items created on the same UTC day
    pub max_per_day: Option<usize>,
    pub entropy_weights: EntropyWeights,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_per_content_type: Some(3),
            max_per_tag: Some(4),
            max_per_day: None,
            entropy_weights: EntropyWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingOptions {
    pub strategy: RankingStrategy,
    pub weights: RankingWeights,
    pub boosts: BoostFactors,
    pub time_decay: TimeDecayConfig,
    pub diversity: DiversityConfig,
    /// Share of the prior relevance score in the personalized strategy
    pub personalized_relevance_weight: f32,
    /// Share of the personalization score in the personalized strategy
    pub personalized_preference_weight: f32,
    /// Importance assumed for items that carry none
    pub default_importance: f32,
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            strategy: RankingStrategy::default(),
            weights: RankingWeights::default(),
            boosts: BoostFactors::default(),
            time_decay: TimeDecayConfig::default(),
            diversity: DiversityConfig::default(),
            personalized_relevance_weight: 0.6,
            personalized_preference_weight: 0.4,
            default_importance: 0.5,
        }
    }
}

impl RankingOptions {
    pub fn with_strategy(strategy: RankingStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RecallResult<()> {
        for (name, weight) in self.weights.as_array() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RecallError::validation(
                    format!("ranking.weights.{}", name),
                    "must be a non-negative number",
                ));
            }
        }
        for (name, weight) in [
            ("personalized_relevance_weight", self.personalized_relevance_weight),
            ("personalized_preference_weight", self.personalized_preference_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RecallError::validation(format!("ranking.{}", name), "must be a non-negative number"));
            }
        }
        if !(0.0..=1.0).contains(&self.default_importance) {
            return Err(RecallError::validation("ranking.default_importance", "must be within [0, 1]"));
        }
        if !(self.time_decay.half_life_days > 0.0) {
            return Err(RecallError::validation("ranking.time_decay.half_life_days", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.time_decay.min_score) {
            return Err(RecallError::validation("ranking.time_decay.min_score", "must be within [0, 1]"));
        }
        if !(self.time_decay.recent_boost >= 1.0) {
            return Err(RecallError::validation("ranking.time_decay.recent_boost", "must be at least 1.0"));
        }
        for (name, cap) in [
            ("max_per_content_type", self.diversity.max_per_content_type),
            ("max_per_tag", self.diversity.max_per_tag),
            ("max_per_day", self.diversity.max_per_day),
        ] {
            if cap == Some(0) {
                return Err(RecallError::validation(format!("ranking.diversity.{}", name), "must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// What the ranker reads from an item
#[derive(Debug, Clone, Copy)]
pub struct RankFeatures<'a> {
    pub id: &'a str,
    pub similarity: f32,
    /// Precomputed composite relevance
    pub relevance: f32,
    pub keyword_score: f32,
    pub importance: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub content_type: Option<&'a str>,
    pub tags: &'a [String],
}

/// Anything the ranker can order
pub trait Rankable {
    fn features(&self) -> RankFeatures<'_>;

    fn set_rank(&mut self, rank: usize);
}

/// Per-item factor values behind a ranking decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub document_id: String,
    pub strategy: RankingStrategy,
    pub similarity: f32,
    pub keyword_match: f32,
    pub importance: f32,
    pub freshness: f32,
    pub user_preference: f32,
    pub content_type_affinity: f32,
    pub tag_relevance: f32,
    pub boost: f32,
    pub personalization: f32,
    pub final_score: f32,
}

impl ScoreBreakdown {
    /// Factor map for explanations
    pub fn factors(&self) -> BTreeMap<String, f32> {
        let mut factors = BTreeMap::new();
        factors.insert("similarity".to_string(), self.similarity);
        factors.insert("keyword_match".to_string(), self.keyword_match);
        factors.insert("importance".to_string(), self.importance);
        factors.insert("freshness".to_string(), self.freshness);
        factors.insert("user_preference".to_string(), self.user_preference);
        factors.insert("content_type_affinity".to_string(), self.content_type_affinity);
        factors.insert("tag_relevance".to_string(), self.tag_relevance);
        factors.insert("boost".to_string(), self.boost);
        factors.insert("personalization".to_string(), self.personalization);
        factors.insert("final_score".to_string(), self.final_score);
        factors
    }
}

#[derive(Debug, Clone)]
pub struct RankedResults<T> {
    pub items: Vec<T>,
    /// Parallel to `items`
    pub breakdowns: Vec<ScoreBreakdown>,
    pub diversity_score: f32,
}

/// Stateless ranking functions
pub struct Ranker;

impl Ranker {
    pub fn rank<T: Rankable>(
        items: Vec<T>,
        options: &RankingOptions,
        personalization: Option<&PersonalizationContext>,
    ) -> RankedResults<T> {
        Self::rank_at(items, options, personalization, Utc::now())
    }

    /// Same as [`Ranker::rank`] with an explicit clock
    pub fn rank_at<T: Rankable>(
        items: Vec<T>,
        options: &RankingOptions,
        personalization: Option<&PersonalizationContext>,
        now: DateTime<Utc>,
    ) -> RankedResults<T> {
        let mut scored: Vec<(T, ScoreBreakdown)> = items
            .into_iter()
            .map(|item| {
                let breakdown = Self::score(&item.features(), options, personalization, now);
                (item, breakdown)
            })
            .collect();

        // Stable: equal scores keep their input order
        scored.sort_by(|a, b| {
            b.1.final_score
                .partial_cmp(&a.1.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if options.diversity.enabled {
            scored = Self::apply_diversity(scored, &options.diversity, |(item, _)| item.features());
        }

        let (mut items, breakdowns): (Vec<T>, Vec<ScoreBreakdown>) = scored.into_iter().unzip();
        for (i, item) in items.iter_mut().enumerate() {
            item.set_rank(i + 1);
        }

        let diversity_score = Self::diversity_score(&items, &options.diversity.entropy_weights);

        RankedResults {
            items,
            breakdowns,
            diversity_score,
        }
    }

    /// Compute every factor and the strategy's final score for one item
    pub fn score(
        features: &RankFeatures<'_>,
        options: &RankingOptions,
        personalization: Option<&PersonalizationContext>,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        let importance = features
            .importance
            .unwrap_or(options.default_importance)
            .clamp(0.0, 1.0);
        let freshness = Self::freshness(features.created_at, now, &options.time_decay);

        let (user_preference, content_type_affinity, tag_relevance) = match personalization {
            Some(ctx) => {
                let preference = ctx.interaction_weight(features.id).clamp(0.0, 1.0);
                let affinity = if ctx.prefers_content_type(features.content_type) { 1.0 } else { 0.0 };
                let tag_relevance = if features.tags.is_empty() {
                    0.0
                } else {
                    ctx.matching_tag_count(features.tags) as f32 / features.tags.len() as f32
                };
                (preference, affinity, tag_relevance)
            }
            None => (0.0, 0.0, 0.0),
        };
        let personalization_score = (user_preference + content_type_affinity + tag_relevance) / 3.0;
        let boost = options.boosts.boost_for(features.content_type, features.tags);

        let final_score = match options.strategy {
            RankingStrategy::Similarity => features.similarity,
            RankingStrategy::Relevance => features.relevance,
            RankingStrategy::Recency => freshness,
            RankingStrategy::Importance => importance,
            RankingStrategy::Hybrid => {
                let w = &options.weights;
                let weighted = w.similarity * features.similarity
                    + w.keyword_match * features.keyword_score
                    + w.importance * importance
                    + w.freshness * freshness
                    + w.user_preference * user_preference
                    + w.content_type_affinity * content_type_affinity
                    + w.tag_relevance * tag_relevance;
                (weighted + boost).max(0.0)
            }
            RankingStrategy::Personalized => {
                options.personalized_relevance_weight * features.relevance
                    + options.personalized_preference_weight * personalization_score
            }
        };

        ScoreBreakdown {
            document_id: features.id.to_string(),
            strategy: options.strategy,
            similarity: features.similarity,
            keyword_match: features.keyword_score,
            importance,
            freshness,
            user_preference,
            content_type_affinity,
            tag_relevance,
            boost,
            personalization: personalization_score,
            final_score,
        }
    }

    /// Half-life decay with floor and recent boost, capped at 1.0
    pub fn freshness(created_at: DateTime<Utc>, now: DateTime<Utc>, config: &TimeDecayConfig) -> f32 {
        let age_days = ((now - created_at).num_seconds().max(0) as f64) / 86_400.0;
        let half_life = if config.half_life_days > 0.0 { config.half_life_days } else { 1.0 };

        let mut score = (0.5f64.powf(age_days / half_life) as f32).max(config.min_score);
        if age_days < config.recent_window_days {
            score *= config.recent_boost;
        }
        score.min(1.0)
    }

    /// Keep items in order, dropping any whose content type, tag, or creation
    /// day already reached its cap.
    pub fn apply_diversity<I, F>(items: Vec<I>, config: &DiversityConfig, features: F) -> Vec<I>
    where
        F: for<'a> Fn(&'a I) -> RankFeatures<'a>,
    {
        let mut per_type: HashMap<String, usize> = HashMap::new();
        let mut per_tag: HashMap<String, usize> = HashMap::new();
        let mut per_day: HashMap<NaiveDate, usize> = HashMap::new();

        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let (type_key, tag_keys, day) = {
                let f = features(&item);
                let type_key = f.content_type.map(|ct| ct.to_lowercase());
                let mut tag_keys: Vec<String> = f.tags.iter().map(|t| t.to_lowercase()).collect();
                tag_keys.sort();
                tag_keys.dedup();
                (type_key, tag_keys, f.created_at.date_naive())
            };

            let type_full = match (&type_key, config.max_per_content_type) {
                (Some(key), Some(cap)) => per_type.get(key).copied().unwrap_or(0) >= cap,
                _ => false,
            };
            let tag_full = match config.max_per_tag {
                Some(cap) => tag_keys.iter().any(|t| per_tag.get(t).copied().unwrap_or(0) >= cap),
                None => false,
            };
            let day_full = match config.max_per_day {
                Some(cap) => per_day.get(&day).copied().unwrap_or(0) >= cap,
                None => false,
            };
            if type_full || tag_full || day_full {
                continue;
            }

            if let Some(key) = type_key {
                *per_type.entry(key).or_insert(0) += 1;
            }
            for tag in tag_keys {
                *per_tag.entry(tag).or_insert(0) += 1;
            }
            *per_day.entry(day).or_insert(0) += 1;
            kept.push(item);
        }

        kept
    }

    /// Weighted normalized Shannon entropy over content types, tags and
    /// creation days, in [0, 1].
    pub fn diversity_score<T: Rankable>(items: &[T], weights: &EntropyWeights) -> f32 {
        if items.is_empty() {
            return 0.0;
        }

        let mut types: HashMap<String, usize> = HashMap::new();
        let mut tags: HashMap<String, usize> = HashMap::new();
        let mut days: HashMap<NaiveDate, usize> = HashMap::new();
        for item in items {
            let f = item.features();
            if let Some(ct) = f.content_type {
                *types.entry(ct.to_lowercase()).or_insert(0) += 1;
            }
            for tag in f.tags {
                *tags.entry(tag.to_lowercase()).or_insert(0) += 1;
            }
            *days.entry(f.created_at.date_naive()).or_insert(0) += 1;
        }

        let total_weight = weights.content_type + weights.tag + weights.time_bucket;
        if total_weight <= 0.0 {
            return 0.0;
        }

        let score = weights.content_type * Self::normalized_entropy(types.values().copied())
            + weights.tag * Self::normalized_entropy(tags.values().copied())
            + weights.time_bucket * Self::normalized_entropy(days.values().copied());
        (score / total_weight).clamp(0.0, 1.0)
    }

    /// Shannon entropy divided by `log2(distinct categories)`; 0 for fewer
    /// than two categories.
    pub fn normalized_entropy(counts: impl Iterator<Item = usize>) -> f32 {
        let counts: Vec<usize> = counts.filter(|&c| c > 0).collect();
        if counts.len() < 2 {
            return 0.0;
        }

        let total: usize = counts.iter().sum();
        let entropy: f64 = counts
            .iter()
            .map(|&c| {
                let p = c as f64 / total as f64;
                -p * p.log2()
            })
            .sum();

        (entropy / (counts.len() as f64).log2()) as f32
    }
}
