//! Response DTOs for the inspector API
//!
//! Defines the structure of outgoing HTTP response bodies.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{CacheStats, QueryState, QueryStatus};
use crate::error::{QueryError, RepoError};
use crate::keys::QueryKey;
use crate::mutation::MutationRecord;

/// One row of GET /queries
#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub key: QueryKey,
    pub status: QueryStatus,
    pub has_data: bool,
    pub is_stale: bool,
    pub subscribers: usize,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Repository error category, when the last fetch failed upstream
    pub error_kind: Option<&'static str>,
}

impl From<&QueryState> for QuerySummary {
    fn from(state: &QueryState) -> Self {
        Self {
            key: state.key.clone(),
            status: state.status,
            has_data: state.data.is_some(),
            is_stale: state.is_stale,
            subscribers: state.subscriber_count,
            updated_at: state.updated_at,
            error: state.error.as_ref().map(ToString::to_string),
            error_kind: state.error.as_ref().and_then(QueryError::repo).map(RepoError::kind),
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Reads answered without waiting on a fetch
    pub hit_rate: f64,
}

impl StatsResponse {
    /// Creates a new StatsResponse from cache statistics
    pub fn new(stats: CacheStats) -> Self {
        let hit_rate = stats.hit_rate();
        Self { stats, hit_rate }
    }
}

/// Response body for POST /invalidate
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    /// Keys newly marked stale
    pub invalidated: Vec<QueryKey>,
    /// Observed keys refetching in the background
    pub refetching: Vec<QueryKey>,
}

/// Response body for POST /gc
#[derive(Debug, Clone, Serialize)]
pub struct GcResponse {
    pub evicted: usize,
}

/// Response body for POST /focus
#[derive(Debug, Clone, Serialize)]
pub struct FocusResponse {
    pub refetching: usize,
}

/// Response body for GET /mutations
#[derive(Debug, Clone, Serialize)]
pub struct MutationsResponse {
    /// In flight, oldest first
    pub pending: Vec<MutationRecord>,
    /// Settled, newest first
    pub recent: Vec<MutationRecord>,
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Crate version
    pub version: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
