//! Cache Store Module
//!
//! Main cache engine: entries keyed by query key, optimistic layers,
//! in-flight fetch markers and change notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, CacheStats, QueryState, QueryStatus};
use crate::error::QueryError;
use crate::keys::QueryKey;
use crate::mutation::MutationId;
use crate::query::{Fetcher, QueryOptions};

/// Capacity of the change notification channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Single in-flight fetch, shared by every caller waiting on the same key.
pub type FetchHandle = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

/// Store handle shared by the executor, coordinator and bus.
pub type SharedStore = Arc<Mutex<CacheStore>>;

// == Notifications ==
/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Fetching,
    Updated,
    Errored,
    Invalidated,
    Optimistic,
    RolledBack,
    Evicted,
}

/// Change notification broadcast to observers.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub key: QueryKey,
    pub kind: UpdateKind,
}

fn notify(updates: &broadcast::Sender<CacheUpdate>, key: &QueryKey, kind: UpdateKind) {
    // No receivers simply means nobody is looking.
    if updates
        .send(CacheUpdate {
            key: key.clone(),
            kind,
        })
        .is_err()
    {
        trace!(%key, ?kind, "no observers for cache update");
    }
}

// == Lookup ==
/// Result of a read against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Fresh data; no network activity needed
    Fresh(Value),
    /// Servable data that should be refreshed in the background
    Stale(Value),
    /// Nothing to serve yet
    Missing,
}

// == Optimistic Layers ==
#[derive(Debug, Clone)]
struct OptimisticLayer {
    mutation_id: MutationId,
    /// Value this layer would restore on rollback
    before: Option<Value>,
}

/// Outcome of settling one optimistic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOutcome {
    /// The layer was on top; visible data changed
    Applied,
    /// A newer layer sits on top; its restore point was updated instead
    Deferred,
    /// No layer for this mutation on this key
    Missing,
}

/// How a landed fetch result was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSettlement {
    /// Nothing changed while the fetch ran; stored as fresh data
    Stored,
    /// Invalidated while in flight; stored but left stale
    Outdated,
    /// A direct write landed while in flight; the result was discarded
    Superseded,
}

/// Result of an invalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Entries newly marked stale
    pub invalidated: Vec<QueryKey>,
    /// Observed entries among them that need a background refetch
    pub refetch: Vec<QueryKey>,
}

// == Cache Store ==
/// In-memory query cache.
#[derive(Debug)]
pub struct CacheStore {
    entries: HashMap<QueryKey, CacheEntry>,
    /// Optimistic layers per key, oldest first
    layers: HashMap<QueryKey, Vec<OptimisticLayer>>,
    in_flight: HashMap<QueryKey, FetchHandle>,
    stats: CacheStats,
    defaults: QueryOptions,
    updates: broadcast::Sender<CacheUpdate>,
}

impl CacheStore {
    // == Constructor ==
    /// Creates an empty store; `defaults` apply to entries created without options.
    pub fn new(defaults: QueryOptions) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            entries: HashMap::new(),
            layers: HashMap::new(),
            in_flight: HashMap::new(),
            stats: CacheStats::new(),
            defaults,
            updates,
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn defaults(&self) -> &QueryOptions {
        &self.defaults
    }

    /// Receives every change notification from now on.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates.subscribe()
    }

    // == Get ==
    pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn state(&self, key: &QueryKey, now: Instant) -> Option<QueryState> {
        self.entries.get(key).map(|entry| entry.state(now))
    }

    /// States of every entry, sorted by key.
    pub fn states(&self, now: Instant) -> Vec<QueryState> {
        let mut states: Vec<QueryState> =
            self.entries.values().map(|entry| entry.state(now)).collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }

    // == Lookup ==
    /// Classifies the entry for a read and records hit/miss statistics.
    pub fn lookup(&mut self, key: &QueryKey, now: Instant) -> Lookup {
        let lookup = match self.entries.get(key) {
            Some(entry) => match &entry.data {
                Some(data) if entry.is_fresh(now) => Lookup::Fresh(data.clone()),
                Some(data) => Lookup::Stale(data.clone()),
                None => Lookup::Missing,
            },
            None => Lookup::Missing,
        };
        match lookup {
            Lookup::Fresh(_) => self.stats.record_hit(),
            Lookup::Stale(_) => self.stats.record_stale_hit(),
            Lookup::Missing => self.stats.record_miss(),
        }
        lookup
    }

    // == Ensure Entry ==
    /// Returns the entry for `key`, creating it if needed.
    ///
    /// Supplied options and fetcher replace the stored ones so later
    /// background refetches use the most recent call site's settings.
    pub fn ensure_entry(
        &mut self,
        key: &QueryKey,
        options: Option<&QueryOptions>,
        fetcher: Option<&Fetcher>,
        now: Instant,
    ) -> &mut CacheEntry {
        if !self.entries.contains_key(key) {
            self.stats.set_total_entries(self.entries.len() + 1);
        }
        let defaults = &self.defaults;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            CacheEntry::new(key.clone(), options.unwrap_or(defaults).clone(), now)
        });
        if let Some(options) = options {
            entry.options = options.clone();
        }
        if let Some(fetcher) = fetcher {
            entry.fetcher = Some(fetcher.clone());
        }
        entry
    }

    // == Set ==
    /// Stores authoritative data for `key` as a direct write.
    ///
    /// While optimistic layers are pending on the key the visible data stays
    /// optimistic and the value becomes the bottom layer's restore point.
    /// Fetches already in flight for the key can no longer overwrite it.
    pub fn set(&mut self, key: &QueryKey, data: Value, now: Instant) {
        self.store_data(key, data, now);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.mark_written();
        }
    }

    fn store_data(&mut self, key: &QueryKey, data: Value, now: Instant) {
        let layered = match self.layers.get_mut(key) {
            Some(layers) => {
                if let Some(bottom) = layers.first_mut() {
                    bottom.before = Some(data.clone());
                }
                true
            }
            None => false,
        };
        let entry = self.ensure_entry(key, None, None, now);
        entry.record_success(if layered { None } else { Some(data) }, now);
        notify(&self.updates, key, UpdateKind::Updated);
    }

    // == Settle Fetch ==
    /// Generation a fetch starting now would be checked against.
    pub fn generation(&self, key: &QueryKey) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.generation)
    }

    /// Applies the result of a fetch that started under generation `started`.
    ///
    /// A direct write since then wins and the result is discarded. An
    /// invalidation since then keeps the result but leaves the entry stale.
    pub fn settle_fetch(
        &mut self,
        key: &QueryKey,
        data: Value,
        started: u64,
        now: Instant,
    ) -> FetchSettlement {
        let (generation, written) = self
            .entries
            .get(key)
            .map_or((started, 0), |entry| (entry.generation, entry.written_generation));

        if written > started {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.finish_discarded();
            }
            notify(&self.updates, key, UpdateKind::Updated);
            return FetchSettlement::Superseded;
        }

        self.store_data(key, data, now);
        if generation == started {
            return FetchSettlement::Stored;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.mark_outdated(now);
        }
        FetchSettlement::Outdated
    }

    /// Observed, stale and refetchable.
    pub fn needs_refetch(&self, key: &QueryKey, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|entry| {
            entry.subscriber_count > 0 && entry.fetcher.is_some() && entry.is_stale(now)
        })
    }

    // == Mark Fetching ==
    pub fn mark_fetching(&mut self, key: &QueryKey, now: Instant) {
        let entry = self.ensure_entry(key, None, None, now);
        entry.status = QueryStatus::Fetching;
        self.stats.record_fetch();
        notify(&self.updates, key, UpdateKind::Fetching);
    }

    // == Mark Error ==
    pub fn mark_error(&mut self, key: &QueryKey, error: QueryError, failures: u32, now: Instant) {
        let entry = self.ensure_entry(key, None, None, now);
        entry.record_error(error, failures, now);
        self.stats.record_fetch_error();
        notify(&self.updates, key, UpdateKind::Errored);
    }

    // == In-flight Fetches ==
    pub fn in_flight(&self, key: &QueryKey) -> Option<FetchHandle> {
        self.in_flight.get(key).cloned()
    }

    pub fn begin_fetch(&mut self, key: &QueryKey, handle: FetchHandle) {
        self.in_flight.insert(key.clone(), handle);
    }

    /// Clears the in-flight marker so the next call can fetch again.
    pub fn finish_fetch(&mut self, key: &QueryKey) {
        self.in_flight.remove(key);
    }

    // == Subscribers ==
    pub fn add_subscriber(&mut self, key: &QueryKey, options: &QueryOptions, now: Instant) {
        self.ensure_entry(key, Some(options), None, now).add_subscriber();
    }

    pub fn remove_subscriber(&mut self, key: &QueryKey, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.remove_subscriber(now) {
                debug!(%key, "last subscriber left, gc scheduled");
            }
        }
    }

    // == Invalidate ==
    /// Marks every entry under `prefix` stale.
    ///
    /// Unobserved entries cause no network activity; observed ones with a
    /// known fetcher are returned for background refetch.
    pub fn invalidate(&mut self, prefix: &QueryKey, now: Instant) -> Invalidation {
        let mut result = Invalidation::default();
        for (key, entry) in self.entries.iter_mut() {
            if !prefix.is_prefix_of(key) || !entry.invalidate(now) {
                continue;
            }
            self.stats.record_invalidation();
            notify(&self.updates, key, UpdateKind::Invalidated);
            if entry.subscriber_count > 0 && entry.fetcher.is_some() {
                result.refetch.push(key.clone());
            }
            result.invalidated.push(key.clone());
        }
        result.invalidated.sort();
        result.refetch.sort();
        result
    }

    /// Observed, stale entries that opted into refetch-on-focus.
    pub fn focus_candidates(&self, now: Instant) -> Vec<QueryKey> {
        self.entries
            .values()
            .filter(|entry| {
                entry.subscriber_count > 0
                    && entry.options.refetch_on_focus
                    && entry.fetcher.is_some()
                    && entry.is_stale(now)
            })
            .map(|entry| entry.key.clone())
            .collect()
    }

    // == Garbage Collection ==
    /// Evicts unobserved entries past their GC deadline.
    ///
    /// Entries under a pending optimistic layer or with a fetch in flight are
    /// kept. Returns the number of entries removed.
    pub fn run_garbage_collection(&mut self, now: Instant) -> usize {
        let doomed: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.is_collectable(now)
                    && !self.layers.contains_key(*key)
                    && !self.in_flight.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.entries.remove(key);
            self.stats.record_eviction();
            notify(&self.updates, key, UpdateKind::Evicted);
        }
        self.stats.set_total_entries(self.entries.len());
        doomed.len()
    }

    // == Optimistic Apply ==
    /// Snapshots `key` and applies `patch` in one step.
    ///
    /// Returns the snapshot, or `None` when the patch declined to touch the key.
    pub fn apply_optimistic<F>(
        &mut self,
        key: &QueryKey,
        mutation_id: MutationId,
        patch: F,
        now: Instant,
    ) -> Option<Option<Value>>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let entry = self.ensure_entry(key, None, None, now);
        let before = entry.data.clone();
        let patched = patch(before.as_ref())?;
        entry.data = Some(patched);
        entry.updated_at = Some(Utc::now());

        self.layers.entry(key.clone()).or_default().push(OptimisticLayer {
            mutation_id,
            before: before.clone(),
        });
        notify(&self.updates, key, UpdateKind::Optimistic);
        Some(before)
    }

    // == Rollback ==
    /// Undoes the layer `mutation_id` left on `key`.
    ///
    /// Only the most recent layer restores visible data. An older layer is
    /// dropped and hands its restore point to the next newer layer, so a
    /// later rollback of that layer cannot resurrect this failed value.
    pub fn rollback_optimistic(&mut self, key: &QueryKey, mutation_id: MutationId) -> LayerOutcome {
        let Some((layer, next)) = self.take_layer(key, mutation_id) else {
            return LayerOutcome::Missing;
        };
        match next {
            Some(next) => {
                next.before = layer.before;
                LayerOutcome::Deferred
            }
            None => {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.data = layer.before;
                    entry.updated_at = Some(Utc::now());
                }
                self.stats.record_rollback();
                notify(&self.updates, key, UpdateKind::RolledBack);
                LayerOutcome::Applied
            }
        }
    }

    // == Commit ==
    /// Replaces the layer `mutation_id` left on `key` with a reconciled value.
    ///
    /// `reconcile` receives the layer's restore point, never the optimistic
    /// guess; returning `None` keeps the restore point.
    pub fn commit_optimistic<F>(
        &mut self,
        key: &QueryKey,
        mutation_id: MutationId,
        reconcile: F,
    ) -> LayerOutcome
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let Some((layer, next)) = self.take_layer(key, mutation_id) else {
            return LayerOutcome::Missing;
        };
        let reconciled = reconcile(layer.before.as_ref());
        let value = reconciled.or(layer.before);
        match next {
            Some(next) => {
                next.before = value;
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.mark_written();
                }
                LayerOutcome::Deferred
            }
            None => {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.data = value;
                    entry.updated_at = Some(Utc::now());
                    entry.mark_written();
                }
                notify(&self.updates, key, UpdateKind::Updated);
                LayerOutcome::Applied
            }
        }
    }

    /// Writes a reconciled value for a key the mutation did not patch.
    ///
    /// Goes under any pending layers, like fetched data does.
    pub fn reconcile_direct<F>(&mut self, key: &QueryKey, reconcile: F, now: Instant)
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        if let Some(bottom) = self.layers.get_mut(key).and_then(|l| l.first_mut()) {
            if let Some(value) = reconcile(bottom.before.as_ref()) {
                bottom.before = Some(value);
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.mark_written();
                }
            }
            return;
        }
        let entry = self.ensure_entry(key, None, None, now);
        if let Some(value) = reconcile(entry.data.as_ref()) {
            entry.data = Some(value);
            entry.updated_at = Some(Utc::now());
            entry.mark_written();
            notify(&self.updates, key, UpdateKind::Updated);
        }
    }

    /// Removes the layer and returns it with the next newer layer, if any.
    fn take_layer(
        &mut self,
        key: &QueryKey,
        mutation_id: MutationId,
    ) -> Option<(OptimisticLayer, Option<&mut OptimisticLayer>)> {
        let layers = self.layers.get_mut(key)?;
        let pos = layers.iter().position(|l| l.mutation_id == mutation_id)?;
        let layer = layers.remove(pos);
        if layers.is_empty() {
            self.layers.remove(key);
            return Some((layer, None));
        }
        let layers = self.layers.get_mut(key)?;
        Some((layer, layers.get_mut(pos)))
    }

    /// True while any optimistic layer is pending on `key`.
    pub fn has_pending_layers(&self, key: &QueryKey) -> bool {
        self.layers.contains_key(key)
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    // == Clear ==
    /// Drops every entry, layer and in-flight marker.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.layers.clear();
        self.in_flight.clear();
        self.stats.set_total_entries(0);
    }

    // == Length ==
    /// Returns the current number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
