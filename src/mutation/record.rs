//! Mutation Record Module
//!
//! Bookkeeping for one mutation from optimistic apply to settlement.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::keys::QueryKey;

// == Mutation Id ==
/// Monotonic identifier, also used to tag optimistic layers in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

// == Mutation Status ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

// == Mutation Record ==
/// A mutation in flight, or recently settled.
#[derive(Debug, Clone, Serialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub target_keys: Vec<QueryKey>,
    /// Value of each patched key right before its patch; absent keys were not patched
    #[serde(skip)]
    pub snapshot_before: HashMap<QueryKey, Option<Value>>,
    pub status: MutationStatus,
    pub rollback_applied: bool,
    /// Whether any key received an optimistic patch
    pub optimistic: bool,
    pub started_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MutationRecord {
    pub fn new(id: MutationId, target_keys: Vec<QueryKey>) -> Self {
        Self {
            id,
            target_keys,
            snapshot_before: HashMap::new(),
            status: MutationStatus::Pending,
            rollback_applied: false,
            optimistic: false,
            started_at: Utc::now(),
            settled_at: None,
            error: None,
        }
    }

    /// Records the terminal state; the snapshot is no longer needed.
    pub fn settle(&mut self, status: MutationStatus, rollback_applied: bool, error: Option<String>) {
        self.status = status;
        self.rollback_applied = rollback_applied;
        self.error = error;
        self.settled_at = Some(Utc::now());
        self.snapshot_before.clear();
    }

    pub fn is_patched(&self, key: &QueryKey) -> bool {
        self.snapshot_before.contains_key(key)
    }

    /// Patched keys in target order.
    pub fn patched_keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.target_keys.iter().filter(|key| self.is_patched(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::make_key;

    #[test]
    fn test_new_record_is_pending() {
        let record = MutationRecord::new(MutationId(3), vec![make_key("thoughts", "list", None)]);
        assert_eq!(record.status, MutationStatus::Pending);
        assert!(!record.optimistic);
        assert!(!record.rollback_applied);
        assert_eq!(record.id.to_string(), "m3");
    }

    #[test]
    fn test_patched_keys_follow_target_order() {
        let list = make_key("thoughts", "list", None);
        let detail = make_key("thoughts", "detail", Some("1".into()));
        let mut record = MutationRecord::new(MutationId(1), vec![list.clone(), detail.clone()]);
        record.snapshot_before.insert(detail.clone(), None);

        assert!(!record.is_patched(&list));
        assert_eq!(record.patched_keys().collect::<Vec<_>>(), vec![&detail]);
    }

    #[test]
    fn test_settle_records_outcome() {
        let key = make_key("thoughts", "list", None);
        let mut record = MutationRecord::new(MutationId(4), vec![key.clone()]);
        record.snapshot_before.insert(key, None);

        record.settle(MutationStatus::Error, true, Some("validation".into()));

        assert_eq!(record.status, MutationStatus::Error);
        assert!(record.rollback_applied);
        assert_eq!(record.error.as_deref(), Some("validation"));
        assert!(record.settled_at.is_some());
        assert!(record.snapshot_before.is_empty());
    }

    #[test]
    fn test_record_serializes_without_snapshot() {
        let mut record = MutationRecord::new(MutationId(9), vec![make_key("a", "list", None)]);
        record
            .snapshot_before
            .insert(make_key("a", "list", None), Some(serde_json::json!([1])));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["id"], 9);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["target_keys"], serde_json::json!([["a", "list"]]));
        assert!(json.get("snapshot_before").is_none());
    }
}
