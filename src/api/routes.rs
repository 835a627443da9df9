//! API Routes
//!
//! Configures the Axum router with all inspector endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    focus_handler, gc_handler, health_handler, invalidate_handler, mutations_handler,
    queries_handler, query_handler, stats_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /health` - Health check endpoint
/// - `GET /queries` - List cache entries
/// - `POST /query` - Full state of one key
/// - `GET /stats` - Cache statistics
/// - `POST /invalidate` - Invalidate a key prefix
/// - `POST /gc` - Run garbage collection now
/// - `POST /focus` - Signal that the application regained focus
/// - `GET /mutations` - Pending and recently settled mutations
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/queries", get(queries_handler))
        .route("/query", post(query_handler))
        .route("/stats", get(stats_handler))
        .route("/invalidate", post(invalidate_handler))
        .route("/gc", post(gc_handler))
        .route("/focus", post(focus_handler))
        .route("/mutations", get(mutations_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
