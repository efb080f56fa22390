//! Read-only stats API. The aggregate changes only through consumed
//! lifecycle events, so there is no write route.

use std::sync::Arc;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::{AggregateStats, LifecycleAggregator};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub remembered_events: usize,
}

pub fn stats_router(aggregator: Arc<LifecycleAggregator>) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/health", get(get_health))
        .with_state(aggregator)
}

async fn get_stats(State(aggregator): State<Arc<LifecycleAggregator>>) -> Json<AggregateStats> {
    Json(aggregator.snapshot().await)
}

async fn get_health(State(aggregator): State<Arc<LifecycleAggregator>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        remembered_events: aggregator.remembered_events().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;
    use af_common::{AccountEventType, AccountLifecycleEvent, AccountSnapshot};
    use crate::{AggregatorConfig, InMemoryStatsStore};

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn aggregator() -> Arc<LifecycleAggregator> {
        Arc::new(LifecycleAggregator::new(
            Arc::new(InMemoryStatsStore::new(100)),
            AggregatorConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_stats_endpoint_returns_snapshot() {
        let aggregator = aggregator();
        aggregator
            .apply(&AccountLifecycleEvent::new(
                3,
                AccountEventType::Created,
                Utc::now(),
                AccountSnapshot::new("u", "USER", vec![]),
            ))
            .await
            .unwrap();

        let (status, json) = get_json(stats_router(aggregator), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["totalAccounts"], 1);
        assert_eq!(json["appliedEvents"], 1);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, json) = get_json(stats_router(aggregator()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "UP");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn test_stats_cannot_be_written() {
        let response = stats_router(aggregator())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
