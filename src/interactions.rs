//! Personalization and interaction history.
//!
//! The core never persists user state. It reads [`PersonalizationContext`]s
//! and raw [`Interaction`]s through the [`InteractionStore`] trait;
//! [`InMemoryInteractionStore`] is the reference implementation.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::errors::RecallResult;

/// Number of most recent documents a derived context lists as recent
const RECENT_INTERACTION_LIMIT: usize = 10;

/// Per-user preference state used as read-only scoring input
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalizationContext {
    pub user_id: String,
    pub preferred_tags: Vec<String>,
    pub preferred_content_types: Vec<String>,
    /// Most recent first
    pub recent_interactions: Vec<String>,
    /// Accumulated interaction weight per document id
    pub interaction_weights: BTreeMap<String, f32>,
}

impl PersonalizationContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_preferred_tags(mut self, tags: &[&str]) -> Self {
        self.preferred_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_preferred_content_types(mut self, types: &[&str]) -> Self {
        self.preferred_content_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_recent_interactions(mut self, ids: &[&str]) -> Self {
        self.recent_interactions = ids.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn prefers_content_type(&self, content_type: Option<&str>) -> bool {
        match content_type {
            Some(ct) => self
                .preferred_content_types
                .iter()
                .any(|p| p.eq_ignore_ascii_case(ct)),
            None => false,
        }
    }

    /// Number of `tags` the user prefers
    pub fn matching_tag_count(&self, tags: &[String]) -> usize {
        tags.iter()
            .filter(|tag| self.preferred_tags.iter().any(|p| p.eq_ignore_ascii_case(tag)))
            .count()
    }

    pub fn interaction_weight(&self, document_id: &str) -> f32 {
        self.interaction_weights.get(document_id).copied().unwrap_or(0.0)
    }

    /// Free-text query derived from stated preferences
    pub fn preference_query(&self) -> Option<String> {
        let terms: Vec<&str> = self
            .preferred_tags
            .iter()
            .chain(self.preferred_content_types.iter())
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
            .collect();
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(" "))
        }
    }

    /// Stable digest of the whole context, for cache keys
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

/// A single user/document interaction (view, save, share...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub document_id: String,
    /// Strength of the interaction; larger means stronger interest
    pub weight: f32,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn new(document_id: impl Into<String>, weight: f32) -> Self {
        Self {
            document_id: document_id.into(),
            weight,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn personalization_context(&self, user_id: &str) -> RecallResult<Option<PersonalizationContext>>;

    async fn interactions(&self, user_id: &str) -> RecallResult<Vec<Interaction>>;

    /// Every user that interacted with at least one of `document_ids`, with
    /// that user's full interaction history.
    async fn users_interacting_with(
        &self,
        document_ids: &[String],
    ) -> RecallResult<Vec<(String, Vec<Interaction>)>>;
}

#[derive(Debug, Default)]
struct UserRecord {
    context: Option<PersonalizationContext>,
    interactions: Vec<Interaction>,
}

#[derive(Debug, Default)]
pub struct InMemoryInteractionStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl InMemoryInteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_context(&self, context: PersonalizationContext) {
        let mut users = self.users.write().await;
        let user_id = context.user_id.clone();
        users.entry(user_id).or_default().context = Some(context);
    }

    pub async fn record(&self, user_id: &str, interaction: Interaction) {
        let mut users = self.users.write().await;
        users.entry(user_id.to_string()).or_default().interactions.push(interaction);
    }

    /// Context derived from raw history when none was set explicitly
    fn derive_context(user_id: &str, interactions: &[Interaction]) -> PersonalizationContext {
        let mut sorted: Vec<&Interaction> = interactions.iter().collect();
        sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut seen = HashSet::new();
        let recent_interactions = sorted
            .iter()
            .filter(|i| seen.insert(i.document_id.as_str()))
            .take(RECENT_INTERACTION_LIMIT)
            .map(|i| i.document_id.clone())
            .collect();

        let mut interaction_weights = BTreeMap::new();
        for interaction in interactions {
            *interaction_weights.entry(interaction.document_id.clone()).or_insert(0.0) += interaction.weight;
        }

        PersonalizationContext {
            user_id: user_id.to_string(),
            recent_interactions,
            interaction_weights,
            ..PersonalizationContext::default()
        }
    }
}

#[async_trait]
impl InteractionStore for InMemoryInteractionStore {
    async fn personalization_context(&self, user_id: &str) -> RecallResult<Option<PersonalizationContext>> {
        let users = self.users.read().await;
        Ok(users.get(user_id).and_then(|record| match &record.context {
            Some(context) => Some(context.clone()),
            None if !record.interactions.is_empty() => {
                Some(Self::derive_context(user_id, &record.interactions))
            }
            None => None,
        }))
    }

    async fn interactions(&self, user_id: &str) -> RecallResult<Vec<Interaction>> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|record| record.interactions.clone())
            .unwrap_or_default())
    }

    async fn users_interacting_with(
        &self,
        document_ids: &[String],
    ) -> RecallResult<Vec<(String, Vec<Interaction>)>> {
        let wanted: HashSet<&str> = document_ids.iter().map(|s| s.as_str()).collect();
        let users = self.users.read().await;

        let mut result: Vec<(String, Vec<Interaction>)> = users
            .iter()
            .filter(|(_, record)| {
                record
                    .interactions
                    .iter()
                    .any(|i| wanted.contains(i.document_id.as_str()))
            })
            .map(|(user, record)| (user.clone(), record.interactions.clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_context_helpers() {
        let mut context = PersonalizationContext::new("u1")
            .with_preferred_tags(&["AI", "health"])
            .with_preferred_content_types(&["article"]);
        context.interaction_weights.insert("d1".into(), 0.8);

        assert!(context.prefers_content_type(Some("Article")));
        assert!(!context.prefers_content_type(None));
        assert_eq!(context.matching_tag_count(&["ai".into(), "sports".into(), "health".into()]), 2);
        assert_eq!(context.interaction_weight("d1"), 0.8);
        assert_eq!(context.interaction_weight("d2"), 0.0);
        assert_eq!(context.preference_query().as_deref(), Some("AI health article"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = PersonalizationContext::new("u1").with_preferred_tags(&["ai"]);
        let b = PersonalizationContext::new("u1").with_preferred_tags(&["ai"]);
        let c = PersonalizationContext::new("u1").with_preferred_tags(&["art"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[tokio::test]
    async fn test_explicit_context_wins() {
        let store = InMemoryInteractionStore::new();
        store.record("u1", Interaction::new("d1", 1.0)).await;
        store
            .set_context(PersonalizationContext::new("u1").with_preferred_tags(&["ai"]))
            .await;

        let context = store.personalization_context("u1").await.unwrap().unwrap();
        assert_eq!(context.preferred_tags, vec!["ai".to_string()]);
        assert!(store.personalization_context("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_derived_context_orders_recent_first() {
        let store = InMemoryInteractionStore::new();
        let now = Utc::now();
        store
            .record("u1", Interaction { document_id: "old".into(), weight: 0.5, timestamp: now - Duration::hours(2) })
            .await;
        store
            .record("u1", Interaction { document_id: "new".into(), weight: 1.0, timestamp: now })
            .await;
        store
            .record("u1", Interaction { document_id: "old".into(), weight: 0.25, timestamp: now - Duration::hours(1) })
            .await;

        let context = store.personalization_context("u1").await.unwrap().unwrap();
        assert_eq!(context.recent_interactions, vec!["new".to_string(), "old".to_string()]);
        assert_eq!(context.interaction_weight("old"), 0.75);
    }

    #[tokio::test]
    async fn test_users_interacting_with() {
        let store = InMemoryInteractionStore::new();
        store.record("u1", Interaction::new("d1", 1.0)).await;
        store.record("u2", Interaction::new("d1", 1.0)).await;
        store.record("u2", Interaction::new("d2", 1.0)).await;
        store.record("u3", Interaction::new("d3", 1.0)).await;

        let users = store.users_interacting_with(&["d1".to_string()]).await.unwrap();
        let ids: Vec<&str> = users.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert_eq!(users[1].1.len(), 2);
    }
}
