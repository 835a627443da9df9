//! Mutation Coordinator Module
//!
//! Optimistic writes: snapshot and patch, run the operation, then reconcile
//! with the server result or roll back.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::record::{MutationId, MutationRecord, MutationStatus};
use crate::cache::{mutex_lock, LayerOutcome, SharedStore};
use crate::error::{MutationError, RepoError};

/// Settled records kept for inspection.
const RECENT_CAPACITY: usize = 32;
use crate::invalidation::{InvalidationBus, MutationOutcome};
use crate::keys::QueryKey;

// == Mutation Options ==
/// Computes the optimistic value of a key from its current value.
/// Returning `None` leaves the key untouched.
pub type OptimisticFn = Arc<dyn Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync>;

/// Derives the reconciled value of a key from its pre-mutation value and the
/// server result. Returning `None` keeps the pre-mutation value.
pub type ReconcileFn =
    Arc<dyn Fn(&QueryKey, Option<&Value>, &Value) -> Option<Value> + Send + Sync>;

pub type SuccessCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&MutationError) + Send + Sync>;

/// Per-call mutation configuration.
#[derive(Clone, Default)]
pub struct MutationOptions {
    pub target_keys: Vec<QueryKey>,
    optimistic: Option<OptimisticFn>,
    reconcile: Option<ReconcileFn>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_key(mut self, key: QueryKey) -> Self {
        self.target_keys.push(key);
        self
    }

    pub fn target_keys(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.target_keys.extend(keys);
        self
    }

    pub fn optimistic<F>(mut self, patch: F) -> Self
    where
        F: Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(patch));
        self
    }

    pub fn reconcile<F>(mut self, reconcile: F) -> Self
    where
        F: Fn(&QueryKey, Option<&Value>, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.reconcile = Some(Arc::new(reconcile));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MutationError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("target_keys", &self.target_keys)
            .field("optimistic", &self.optimistic.is_some())
            .field("reconcile", &self.reconcile.is_some())
            .finish_non_exhaustive()
    }
}

// == Pending Guard ==
/// Rolls a mutation back if its future is dropped before settling.
struct PendingGuard<'a> {
    coordinator: &'a MutationCoordinator,
    id: MutationId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon(self.id);
        }
    }
}

// == Mutation Coordinator ==
pub struct MutationCoordinator {
    store: SharedStore,
    bus: InvalidationBus,
    pending: Mutex<HashMap<MutationId, MutationRecord>>,
    recent: Mutex<VecDeque<MutationRecord>>,
    next_id: AtomicU64,
}

impl fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MutationCoordinator {
    pub fn new(store: SharedStore, bus: InvalidationBus) -> Self {
        Self {
            store,
            bus,
            pending: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            next_id: AtomicU64::new(1),
        }
    }

    // == Mutate ==
    /// Runs `operation` as a mutation.
    ///
    /// With an optimistic patch, every target key is snapshotted and patched
    /// in one critical section before the operation starts. On success the
    /// patched keys are reconciled from their snapshots and the server value;
    /// on failure they are rolled back. Either way the cache is settled before
    /// this returns.
    pub async fn mutate<Fut>(&self, operation: Fut, options: MutationOptions) -> Result<Value, MutationError>
    where
        Fut: Future<Output = Result<Value, RepoError>> + Send,
    {
        let id = MutationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.begin(id, &options);

        let mut guard = PendingGuard {
            coordinator: self,
            id,
            armed: true,
        };
        let result = operation.await;
        guard.armed = false;

        match result {
            Ok(server) => {
                self.settle_success(id, &options, &server).await;
                if let Some(callback) = &options.on_success {
                    callback(&server);
                }
                Ok(server)
            }
            Err(err) => {
                let error = MutationError::from(err);
                self.settle_failure(id, &options, &error).await;
                if let Some(callback) = &options.on_error {
                    callback(&error);
                }
                Err(error)
            }
        }
    }

    /// Snapshots and patches every target key atomically, then records the
    /// mutation as pending.
    fn begin(&self, id: MutationId, options: &MutationOptions) {
        let mut record = MutationRecord::new(id, options.target_keys.clone());
        if let Some(patch) = &options.optimistic {
            let mut store = mutex_lock(&self.store, "mutation_apply");
            let now = Instant::now();
            for key in &options.target_keys {
                if let Some(before) = store.apply_optimistic(key, id, |current| patch(key, current), now) {
                    record.snapshot_before.insert(key.clone(), before);
                }
            }
            record.optimistic = !record.snapshot_before.is_empty();
        }
        debug!(
            mutation = %id,
            targets = record.target_keys.len(),
            patched = record.snapshot_before.len(),
            "mutation started"
        );
        mutex_lock(&self.pending, "pending_mutations").insert(id, record);
    }

    fn take_record(&self, id: MutationId) -> Option<MutationRecord> {
        mutex_lock(&self.pending, "pending_mutations").remove(&id)
    }

    /// Moves a settled record into the bounded history, evicting the oldest.
    fn archive(
        &self,
        mut record: MutationRecord,
        status: MutationStatus,
        rollback_applied: bool,
        error: Option<String>,
    ) {
        record.settle(status, rollback_applied, error);
        let mut recent = mutex_lock(&self.recent, "recent_mutations");
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    // == Settle Success ==
    async fn settle_success(&self, id: MutationId, options: &MutationOptions, server: &Value) {
        let Some(record) = self.take_record(id) else {
            warn!(mutation = %id, "settled mutation has no record");
            return;
        };
        {
            let mut store = mutex_lock(&self.store, "mutation_reconcile");
            let now = Instant::now();
            for key in &record.target_keys {
                if record.is_patched(key) {
                    let outcome = store.commit_optimistic(key, id, |before| match &options.reconcile {
                        Some(reconcile) => reconcile(key, before, server),
                        None => Some(server.clone()),
                    });
                    if outcome == LayerOutcome::Deferred {
                        debug!(mutation = %id, %key, "newer mutation pending, reconciled underneath");
                    }
                } else if let Some(reconcile) = &options.reconcile {
                    store.reconcile_direct(key, |current| reconcile(key, current, server), now);
                }
            }
        }
        info!(mutation = %id, "mutation succeeded");

        let target_keys = record.target_keys.clone();
        self.archive(record, MutationStatus::Success, false, None);
        self.bus
            .on_local_mutation_settled(&target_keys, &MutationOutcome::Success)
            .await;
    }

    // == Settle Failure ==
    async fn settle_failure(&self, id: MutationId, options: &MutationOptions, error: &MutationError) {
        let Some(record) = self.take_record(id) else {
            warn!(mutation = %id, "settled mutation has no record");
            return;
        };
        let rollback_applied = self.rollback(&record);
        let repo = error.repo();
        warn!(
            mutation = %id,
            %error,
            kind = repo.map(RepoError::kind),
            rollback_applied,
            "mutation failed"
        );
        self.archive(record, MutationStatus::Error, rollback_applied, Some(error.to_string()));

        if let Some(err) = repo {
            self.bus
                .on_local_mutation_settled(&options.target_keys, &MutationOutcome::Failed(err.clone()))
                .await;
        }
    }

    /// Removes every layer the mutation left. Returns true if any visible
    /// value was restored.
    fn rollback(&self, record: &MutationRecord) -> bool {
        let mut store = mutex_lock(&self.store, "mutation_rollback");
        let mut applied = false;
        for key in record.patched_keys() {
            match store.rollback_optimistic(key, record.id) {
                LayerOutcome::Applied => applied = true,
                LayerOutcome::Deferred => {
                    debug!(mutation = %record.id, %key, "rollback suppressed by newer mutation");
                }
                LayerOutcome::Missing => {}
            }
        }
        applied
    }

    /// Cleans up after a mutation whose future was dropped mid-flight.
    fn abandon(&self, id: MutationId) {
        if let Some(record) = self.take_record(id) {
            let restored = self.rollback(&record);
            warn!(mutation = %id, restored, "mutation abandoned before settling");
            self.archive(record, MutationStatus::Error, restored, Some("abandoned before settling".into()));
        }
    }

    // == Inspection ==
    /// Pending mutations, oldest first.
    pub fn pending_mutations(&self) -> Vec<MutationRecord> {
        let mut records: Vec<MutationRecord> = mutex_lock(&self.pending, "pending_mutations")
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Recently settled mutations, newest first.
    pub fn recent_mutations(&self) -> Vec<MutationRecord> {
        mutex_lock(&self.recent, "recent_mutations")
            .iter()
            .rev()
            .cloned()
            .collect()
    }
}
