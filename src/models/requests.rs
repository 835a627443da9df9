//! Request DTOs for the inspector API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

use crate::keys::{KeySegment, QueryKey};

/// Maximum number of segments accepted in a key or prefix.
const MAX_SEGMENTS: usize = 16;

/// Request body for POST /invalidate
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    /// Leading key segments, e.g. `["thoughts", "list"]`
    pub prefix: Vec<KeySegment>,
}

impl InvalidateRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        validate_segments(&self.prefix, "Prefix")
    }

    pub fn prefix(&self) -> QueryKey {
        QueryKey::new(self.prefix.clone())
    }
}

/// Request body for POST /query
#[derive(Debug, Clone, Deserialize)]
pub struct QueryLookupRequest {
    /// Full query key
    pub key: Vec<KeySegment>,
}

impl QueryLookupRequest {
    pub fn validate(&self) -> Option<String> {
        validate_segments(&self.key, "Key")
    }

    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.key.clone())
    }
}

fn validate_segments(segments: &[KeySegment], what: &str) -> Option<String> {
    if segments.is_empty() {
        return Some(format!("{what} cannot be empty"));
    }
    if segments.len() > MAX_SEGMENTS {
        return Some(format!(
            "{what} exceeds maximum length of {MAX_SEGMENTS} segments"
        ));
    }
    if !matches!(segments[0], KeySegment::Str(_)) {
        return Some(format!("{what} must start with an entity name"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_request_deserialize() {
        let json = r#"{"prefix": ["thoughts", "detail", 7]}"#;
        let req: InvalidateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.prefix.len(), 3);
        assert_eq!(req.prefix[2], KeySegment::Int(7));
        assert!(req.validate().is_none());
    }

    #[test]
    fn test_validate_empty_prefix() {
        let req = InvalidateRequest { prefix: vec![] };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_validate_entity_first() {
        let req: InvalidateRequest = serde_json::from_str(r#"{"prefix": [1, "list"]}"#).unwrap();
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_lookup_request_with_filter_segment() {
        let json = r#"{"key": ["thoughts", "list", {"tag": "rust"}]}"#;
        let req: QueryLookupRequest = serde_json::from_str(json).unwrap();
        assert!(req.validate().is_none());
        assert_eq!(req.key().len(), 3);
    }
}
