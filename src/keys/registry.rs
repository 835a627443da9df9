//! Key Registry Module
//!
//! Translates entity change notifications into the query-key prefixes
//! they affect.

use std::collections::HashMap;

use super::key::{KeySegment, QueryKey};

/// Qualifier used for collection queries.
pub const LIST: &str = "list";
/// Qualifier used for single-record queries.
pub const DETAIL: &str = "detail";

// == Key Registry ==
/// Route table from entity names to the key prefixes a change invalidates.
///
/// Every entity implicitly routes to its own `list` family and, when an id is
/// known, to its own `detail` key. Extra prefixes cover derived queries that
/// read the entity indirectly (aggregates, suggestions built from it).
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    extra: HashMap<String, Vec<QueryKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers additional prefixes invalidated whenever `entity` changes.
    pub fn route(&mut self, entity: impl Into<String>, prefixes: Vec<QueryKey>) -> &mut Self {
        let routes = self.extra.entry(entity.into()).or_default();
        for prefix in prefixes {
            if !routes.contains(&prefix) {
                routes.push(prefix);
            }
        }
        self
    }

    /// Prefixes affected by a change to `entity` (optionally a single record).
    ///
    /// Without an id the whole entity family is returned, since the record
    /// cannot be narrowed down.
    pub fn prefixes_for(&self, entity: &str, id: Option<&str>) -> Vec<QueryKey> {
        let family = QueryKey::entity(entity);
        let mut prefixes = match id {
            Some(id) => vec![
                family.child(LIST),
                family.child(DETAIL).child(KeySegment::from(id)),
            ],
            None => vec![family],
        };

        if let Some(extra) = self.extra.get(entity) {
            for prefix in extra {
                if !prefixes.iter().any(|p| p.is_prefix_of(prefix)) {
                    prefixes.push(prefix.clone());
                }
            }
        }
        prefixes
    }
}
