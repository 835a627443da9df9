//! API Handlers
//!
//! HTTP request handlers for each inspector endpoint.

use axum::{extract::State, Json};

use crate::client::QueryClient;
use crate::error::{ApiError, Result};
use crate::models::{
    FocusResponse, GcResponse, HealthResponse, InvalidateRequest, InvalidateResponse,
    MutationsResponse, QueryLookupRequest, QuerySummary, StatsResponse,
};
use crate::cache::QueryState;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Engine instance under inspection
    pub client: QueryClient,
}

impl AppState {
    /// Creates a new AppState over the given client.
    pub fn new(client: QueryClient) -> Self {
        Self { client }
    }
}

/// Handler for GET /queries
///
/// Lists every cache entry, sorted by key.
pub async fn queries_handler(State(state): State<AppState>) -> Json<Vec<QuerySummary>> {
    let states = state.client.states();
    Json(states.iter().map(QuerySummary::from).collect())
}

/// Handler for POST /query
///
/// Returns the full state of one key, data included.
pub async fn query_handler(
    State(state): State<AppState>,
    Json(req): Json<QueryLookupRequest>,
) -> Result<Json<QueryState>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let key = req.key();
    state
        .client
        .cached_state(&key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(key.to_string()))
}

/// Handler for POST /invalidate
///
/// Marks every entry under the prefix stale; observed entries refetch.
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let result = state.client.invalidate(&req.prefix()).await;
    Ok(Json(InvalidateResponse {
        invalidated: result.invalidated,
        refetching: result.refetch,
    }))
}

/// Handler for POST /gc
pub async fn gc_handler(State(state): State<AppState>) -> Json<GcResponse> {
    Json(GcResponse {
        evicted: state.client.run_garbage_collection(),
    })
}

/// Handler for POST /focus
///
/// Signals that the application regained focus.
pub async fn focus_handler(State(state): State<AppState>) -> Json<FocusResponse> {
    Json(FocusResponse {
        refetching: state.client.on_focus(),
    })
}

/// Handler for GET /mutations
///
/// Pending mutations plus the most recently settled ones.
pub async fn mutations_handler(State(state): State<AppState>) -> Json<MutationsResponse> {
    Json(MutationsResponse {
        pending: state.client.pending_mutations(),
        recent: state.client.recent_mutations(),
    })
}

/// Handler for GET /stats
///
/// Returns current cache statistics.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(state.client.stats()))
}

/// Handler for GET /health
///
/// Returns health status of the server.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entities::THOUGHT_KEYS;
    use crate::keys::KeySegment;
    use crate::mutation::{MutationOptions, MutationStatus};
    use crate::repository::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> AppState {
        let config = Config {
            default_stale_time_ms: 60_000,
            ..Config::default()
        };
        AppState::new(QueryClient::new(&config, Arc::new(MemoryBackend::new())))
    }

    #[tokio::test]
    async fn test_queries_handler_lists_entries() {
        let state = state();
        state.client.set_query_data(&THOUGHT_KEYS.list(), json!([]));
        state.client.set_query_data(&THOUGHT_KEYS.detail("1"), json!({}));

        let response = queries_handler(State(state)).await;
        assert_eq!(response.len(), 2);
        assert!(response.iter().all(|row| row.has_data && !row.is_stale));
    }

    #[tokio::test]
    async fn test_query_handler_not_found() {
        let state = state();
        let req = QueryLookupRequest {
            key: vec![KeySegment::from("thoughts"), KeySegment::from("list")],
        };

        let result = query_handler(State(state), Json(req)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_query_handler_returns_single_entry() {
        let state = state();
        state.client.set_query_data(&THOUGHT_KEYS.list(), json!([]));
        state.client.set_query_data(&THOUGHT_KEYS.detail("1"), json!({"id": "1"}));
        let req = QueryLookupRequest {
            key: vec![
                KeySegment::from("thoughts"),
                KeySegment::from("detail"),
                KeySegment::from("1"),
            ],
        };

        let response = query_handler(State(state), Json(req)).await.unwrap();
        assert_eq!(response.key, THOUGHT_KEYS.detail("1"));
        assert_eq!(response.data, Some(json!({"id": "1"})));
    }

    #[tokio::test]
    async fn test_mutations_handler_lists_settled() {
        let state = state();
        state
            .client
            .mutate(async { Ok(json!({"id": "1"})) }, MutationOptions::new())
            .await
            .unwrap();

        let response = mutations_handler(State(state)).await;
        assert!(response.pending.is_empty());
        assert_eq!(response.recent.len(), 1);
        assert_eq!(response.recent[0].status, MutationStatus::Success);
    }

    #[tokio::test]
    async fn test_invalidate_handler() {
        let state = state();
        state.client.set_query_data(&THOUGHT_KEYS.list(), json!([]));
        state.client.set_query_data(&THOUGHT_KEYS.detail("1"), json!({}));

        let req = InvalidateRequest {
            prefix: vec![KeySegment::from("thoughts"), KeySegment::from("list")],
        };
        let response = invalidate_handler(State(state.clone()), Json(req))
            .await
            .unwrap();
        assert_eq!(response.invalidated, vec![THOUGHT_KEYS.list()]);
        assert!(response.refetching.is_empty());
        assert!(!state.client.query_state(&THOUGHT_KEYS.detail("1")).is_stale);
    }

    #[tokio::test]
    async fn test_invalidate_handler_rejects_empty_prefix() {
        let result =
            invalidate_handler(State(state()), Json(InvalidateRequest { prefix: vec![] })).await;
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let response = stats_handler(State(state())).await;
        assert_eq!(response.stats.hits, 0);
        assert_eq!(response.stats.misses, 0);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status, "healthy");
    }
}
