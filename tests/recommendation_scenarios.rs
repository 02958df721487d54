//! End-to-end recommendation behaviour through the service facade.

mod common;

use std::collections::{HashMap, HashSet};

use archivist_lib::{
    Interaction, PersonalizationContext, RecommendationRequest, RecommendationResponse, RecommendationType,
    RequestContext,
};
use common::{document, harness, Harness, StaticEmbedder};

async fn seeded() -> Harness {
    let h = harness(StaticEmbedder::new(&[("rust", vec![1.0, 0.0, 0.0])]));
    let ctx = RequestContext::background();
    let docs = vec![
        document("src", "ownership and borrowing in rust", vec![1.0, 0.0, 0.0], "article", &["rust"], 1),
        document("twin", "borrowing rules in rust explained", vec![0.99, 0.05, 0.0], "article", &["rust"], 2),
        document("d1", "async runtimes in rust", vec![0.9, 0.1, 0.0], "article", &["rust", "async"], 3),
        document("d2", "neural networks for beginners", vec![0.7, 0.7, 0.0], "note", &["ai"], 4),
        document("d3", "gradient descent intuition", vec![0.0, 1.0, 0.0], "note", &["ai"], 5),
        document("d4", "photos from the trip", vec![0.0, 0.2, 1.0], "image", &["travel"], 6),
        document("d5", "rust and webassembly", vec![0.5, 0.0, 0.5], "article", &["rust", "wasm"], 8),
    ];
    for d in docs {
        h.service.index_document(&ctx, d).await.unwrap();
    }
    h
}

fn ids(response: &RecommendationResponse) -> Vec<&str> {
    response.items.iter().map(|i| i.document_id.as_str()).collect()
}

#[cfg(test)]
mod similar_tests {
    use super::*;

    #[tokio::test]
    async fn test_excluded_closest_match_never_returned() {
        let h = seeded().await;
        let ctx = RequestContext::background();

        let unfiltered = RecommendationRequest::new(RecommendationType::Similar).with_source_document("src");
        let baseline = h.service.get_recommendations(&ctx, &unfiltered).await.unwrap();
        assert_eq!(baseline.items[0].document_id, "twin");
        assert!(!ids(&baseline).contains(&"src"));

        let request = RecommendationRequest::new(RecommendationType::Similar)
            .with_source_document("src")
            .excluding(&["twin", "src"]);
        let response = h.service.get_recommendations(&ctx, &request).await.unwrap();

        assert!(!response.items.is_empty());
        assert!(!ids(&response).contains(&"twin"));
        assert!(!ids(&response).contains(&"src"));
        assert_eq!(response.items[0].document_id, "d1");
        for (i, item) in response.items.iter().enumerate() {
            assert_eq!(item.rank, i + 1);
        }
    }

    #[tokio::test]
    async fn test_cached_list_is_served_until_archive_changes() {
        let h = seeded().await;
        let ctx = RequestContext::background();
        let request = RecommendationRequest::new(RecommendationType::Similar).with_source_document("src");

        let first = h.service.get_recommendations(&ctx, &request).await.unwrap();
        let second = h.service.get_recommendations(&ctx, &request).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.items, second.items);

        h.service
            .index_document(&ctx, document("clone", "a clone", vec![1.0, 0.0, 0.0], "article", &[], 0))
            .await
            .unwrap();
        let third = h.service.get_recommendations(&ctx, &request).await.unwrap();
        assert!(!third.from_cache);
        assert_eq!(third.items[0].document_id, "clone");

        let stats = h.service.get_search_stats().await;
        assert_eq!(stats.recommendation_hits, 1);
    }
}

#[cfg(test)]
mod hybrid_tests {
    use super::*;

    async fn seed_user(h: &Harness) {
        let mut context = PersonalizationContext::new("reader")
            .with_recent_interactions(&["d2"])
            .with_preferred_tags(&["rust"])
            .with_preferred_content_types(&["article"]);
        context.interaction_weights.insert("d1".to_string(), 0.5);
        h.interactions.set_context(context).await;

        h.interactions.record("reader", Interaction::new("src", 1.0)).await;
        h.interactions.record("reader", Interaction::new("d2", 0.5)).await;
        h.interactions.record("peer", Interaction::new("src", 1.0)).await;
        h.interactions.record("peer", Interaction::new("d3", 0.8)).await;
        h.interactions.record("peer", Interaction::new("d4", 0.4)).await;
    }

    fn request(kind: RecommendationType) -> RecommendationRequest {
        RecommendationRequest::new(kind)
            .with_source_document("src")
            .with_user("reader")
            .with_max_count(50)
    }

    #[tokio::test]
    async fn test_hybrid_scores_are_max_of_weighted_strategy_scores() {
        let h = seeded().await;
        seed_user(&h).await;
        let ctx = RequestContext::background();

        let weights = [
            (RecommendationType::Similar, 0.3f32),
            (RecommendationType::Personalized, 0.4),
            (RecommendationType::Trending, 0.2),
            (RecommendationType::Collaborative, 0.1),
        ];

        let mut expected: HashMap<String, f32> = HashMap::new();
        for (kind, weight) in weights {
            let response = h.service.get_recommendations(&ctx, &request(kind)).await.unwrap();
            assert!(!response.items.is_empty(), "{} produced nothing", kind.as_str());
            for item in response.items {
                let weighted = item.score * weight;
                let best = expected.entry(item.document_id).or_insert(weighted);
                if weighted > *best {
                    *best = weighted;
                }
            }
        }

        let hybrid = h
            .service
            .get_recommendations(&ctx, &request(RecommendationType::Hybrid))
            .await
            .unwrap();

        assert_eq!(hybrid.strategies_used.len(), 4);
        assert_eq!(hybrid.items.len(), expected.len());

        let unique: HashSet<&str> = ids(&hybrid).into_iter().collect();
        assert_eq!(unique.len(), hybrid.items.len());

        for item in &hybrid.items {
            let want = expected[&item.document_id];
            assert!(
                (item.score - want).abs() < 1e-4,
                "{}: hybrid {} vs expected {}",
                item.document_id,
                item.score,
                want
            );
        }
        for pair in hybrid.items.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_collaborative_recommends_what_similar_users_touched() {
        let h = seeded().await;
        seed_user(&h).await;

        let request = RecommendationRequest::new(RecommendationType::Collaborative).with_user("reader");
        let response = h
            .service
            .get_recommendations(&RequestContext::background(), &request)
            .await
            .unwrap();

        assert_eq!(ids(&response), vec!["d3", "d4"]);
        assert!(response.items.iter().all(|i| i.strategy == RecommendationType::Collaborative));
    }

    #[tokio::test]
    async fn test_diversity_caps_each_content_type() {
        let h = seeded().await;
        let mut request = RecommendationRequest::new(RecommendationType::Trending);
        request.enable_diversity = true;

        let response = h
            .service
            .get_recommendations(&RequestContext::background(), &request)
            .await
            .unwrap();

        let mut per_type: HashMap<&str, usize> = HashMap::new();
        for item in &response.items {
            *per_type.entry(item.content_type.as_deref().unwrap_or("")).or_default() += 1;
        }
        assert!(per_type.values().all(|&n| n <= 2));
        assert_eq!(per_type["article"], 2);
    }
}
