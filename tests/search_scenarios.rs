//! End-to-end search behaviour through the service facade, with in-memory
//! collaborators.

mod common;

use archivist_lib::{RecallError, RequestContext, SearchOptions};
use common::{document, harness, vector_with_similarity, StaticEmbedder};

const HEALTHCARE_QUERY: &str = "artificial intelligence in healthcare";

fn healthcare_embedder() -> StaticEmbedder {
    StaticEmbedder::new(&[(HEALTHCARE_QUERY, vec![1.0, 0.0, 0.0])])
}

#[cfg(test)]
mod threshold_tests {
    use super::*;

    #[tokio::test]
    async fn test_min_similarity_keeps_only_close_document() {
        let h = harness(healthcare_embedder());
        let ctx = RequestContext::background();
        h.service
            .index_document(
                &ctx,
                document("close", "AI models assist clinicians in healthcare", vector_with_similarity(0.95), "article", &[], 1),
            )
            .await
            .unwrap();
        h.service
            .index_document(
                &ctx,
                document("far", "A recipe for sourdough bread", vector_with_similarity(0.5), "article", &[], 1),
            )
            .await
            .unwrap();

        let options = SearchOptions::new(HEALTHCARE_QUERY).with_top_k(10).with_min_similarity(0.7);
        let response = h.service.search(&ctx, &options).await.unwrap();

        assert_eq!(response.items.len(), 1);
        let hit = &response.items[0];
        assert_eq!(hit.document_id, "close");
        assert_eq!(hit.rank, 1);
        assert!((hit.similarity - 0.95).abs() < 1e-4);
        assert!(hit.matched_keywords.contains(&"healthcare".to_string()));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected_before_embedding() {
        let h = harness(healthcare_embedder());
        let result = h
            .service
            .search(&RequestContext::background(), &SearchOptions::new("   "))
            .await;

        assert!(matches!(result, Err(RecallError::Validation { .. })));
        assert_eq!(h.embedder.calls(), 0);
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_search_hits_query_vector_cache() {
        let h = harness(healthcare_embedder());
        let ctx = RequestContext::background();
        h.service
            .index_document(&ctx, document("close", "healthcare", vector_with_similarity(0.95), "article", &[], 1))
            .await
            .unwrap();

        let options = SearchOptions::new(HEALTHCARE_QUERY);
        let first = h.service.search(&ctx, &options).await.unwrap();
        let before = h.service.get_search_stats().await;
        let second = h.service.search(&ctx, &options).await.unwrap();
        let after = h.service.get_search_stats().await;

        assert!(!first.query_vector_cached);
        assert!(second.query_vector_cached);
        assert_eq!(after.query_vector_hits - before.query_vector_hits, 1);
        assert_eq!(after.query_vector_misses, before.query_vector_misses);
        assert_eq!(h.embedder.calls(), 1);
        let first_ids: Vec<&str> = first.items.iter().map(|i| i.document_id.as_str()).collect();
        let second_ids: Vec<&str> = second.items.iter().map(|i| i.document_id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_different_users_do_not_share_cache_entries() {
        let h = harness(healthcare_embedder());
        let ctx = RequestContext::background();

        h.service
            .search(&ctx, &SearchOptions::new(HEALTHCARE_QUERY).with_user("alice"))
            .await
            .unwrap();
        h.service
            .search(&ctx, &SearchOptions::new(HEALTHCARE_QUERY).with_user("bob"))
            .await
            .unwrap();

        let stats = h.service.get_search_stats().await;
        assert_eq!(stats.query_vector_hits, 0);
        assert_eq!(stats.query_vector_misses, 2);
    }
}

#[cfg(test)]
mod document_lifecycle_tests {
    use super::*;
    use archivist_lib::DocumentInput;

    #[tokio::test]
    async fn test_batch_index_reports_per_item_failures() {
        let h = harness(healthcare_embedder());
        let ctx = RequestContext::background();

        let inputs = vec![
            document("a", "first", vec![1.0, 0.0, 0.0], "note", &[], 0),
            DocumentInput::new("   ", Default::default()).with_id("blank"),
            document("b", "second", vec![0.0, 1.0, 0.0], "note", &[], 0),
        ];
        let report = h.service.batch_index_documents(&ctx, inputs).await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(h.service.health_check(&ctx).await.document_count, Some(2));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let h = harness(healthcare_embedder());
        let ctx = RequestContext::background();
        h.service
            .index_document(&ctx, document("a", "first draft", vec![1.0, 0.0, 0.0], "note", &[], 3))
            .await
            .unwrap();
        let original = h.service.get_document(&ctx, "a").await.unwrap();

        let mut revised = document("a", "second draft", vec![0.0, 1.0, 0.0], "note", &["edited"], 0);
        revised.metadata.created_at = chrono::Utc::now();
        h.service.update_document(&ctx, revised).await.unwrap();

        let updated = h.service.get_document(&ctx, "a").await.unwrap();
        assert_eq!(updated.content, "second draft");
        assert_eq!(updated.metadata.created_at, original.metadata.created_at);

        h.service.delete_document(&ctx, "a").await.unwrap();
        assert!(matches!(
            h.service.get_document(&ctx, "a").await,
            Err(RecallError::NotFound { .. })
        ));
        assert!(matches!(
            h.service.delete_document(&ctx, "a").await,
            Err(RecallError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_request_does_no_work() {
        let h = harness(healthcare_embedder());
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::background().with_cancellation(token);

        let result = h.service.search(&ctx, &SearchOptions::new(HEALTHCARE_QUERY)).await;
        assert!(matches!(result, Err(RecallError::Cancelled { .. })));
        assert_eq!(h.service.get_search_stats().await.query_vector_hits, 0);
    }
}
