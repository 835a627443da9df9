//! Error types for the sync engine
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Repository Error Enum ==
/// Failure reported by a repository adapter.
///
/// `Clone` because a single in-flight fetch result is handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    /// Network hiccup or timeout, retried with backoff
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Session missing or expired, never retried
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Payload rejected by the remote store, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Server state diverged from what the client assumed
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl RepoError {
    /// Transient errors are the only class automatic retry may act on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepoError::Transient(_))
    }

    /// Conflicts invalidate the affected keys even though the write failed.
    pub fn invalidates_cache(&self) -> bool {
        matches!(self, RepoError::Conflict(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepoError::Transient(_) => "transient",
            RepoError::Authentication(_) => "authentication",
            RepoError::Validation(_) => "validation",
            RepoError::Conflict(_) => "conflict",
        }
    }
}

// == Query Error Enum ==
/// Failure surfaced by the query executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The fetcher failed after the retry policy gave up
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// The fetch task ended without producing a result
    #[error("Fetch aborted for {0}")]
    Aborted(String),

    /// Cached data could not be decoded into the requested type
    #[error("Decode error: {0}")]
    Decode(String),
}

impl QueryError {
    pub fn repo(&self) -> Option<&RepoError> {
        match self {
            QueryError::Repo(err) => Some(err),
            _ => None,
        }
    }
}

// == Mutation Error Enum ==
/// Failure surfaced by the mutation coordinator.
///
/// By the time this reaches the caller the cache is either fully rolled back
/// or fully reconciled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// The mutation variables could not be encoded for the repository
    #[error("Encode error: {0}")]
    Encode(String),
}

impl MutationError {
    pub fn repo(&self) -> Option<&RepoError> {
        match self {
            MutationError::Repo(err) => Some(err),
            _ => None,
        }
    }
}

// == Inspector API Error Enum ==
/// Error type for the inspector HTTP API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Nothing cached under the requested key
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the inspector API.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RepoError::Transient("x".into()).is_retryable());
        assert!(!RepoError::Authentication("x".into()).is_retryable());
        assert!(!RepoError::Validation("x".into()).is_retryable());
        assert!(!RepoError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn test_only_conflict_invalidates() {
        assert!(RepoError::Conflict("x".into()).invalidates_cache());
        assert!(!RepoError::Authentication("x".into()).invalidates_cache());
        assert!(!RepoError::Validation("x".into()).invalidates_cache());
    }

    #[test]
    fn test_query_error_wraps_repo_error() {
        let err: QueryError = RepoError::Validation("bad title".into()).into();
        assert_eq!(err.to_string(), "Validation error: bad title");
        assert_eq!(err.repo().map(RepoError::kind), Some("validation"));
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("k".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::InvalidRequest("k".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
