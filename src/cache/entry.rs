//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with freshness and GC metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::keys::QueryKey;
use crate::query::{Fetcher, QueryOptions};

// == Query Status ==
/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

// == Cache Entry ==
/// Represents a single cache entry with data and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    /// Currently visible data, including any optimistic layers
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    /// When the last successful fetch landed
    pub fetched_at: Option<Instant>,
    /// Data is fresh strictly before this instant; `None` with data means never stale
    pub stale_at: Option<Instant>,
    /// Eviction deadline once unobserved
    pub gc_at: Option<Instant>,
    pub subscriber_count: usize,
    /// Wall-clock time of the last data change, for display
    pub updated_at: Option<DateTime<Utc>>,
    /// An invalidation is waiting for its refetch to settle
    pub invalidated: bool,
    /// Consecutive failures of the last fetch, retries included
    pub fetch_failure_count: u32,
    /// Bumped by every invalidation and direct write; a fetch that started
    /// under an older generation has been overtaken
    pub(crate) generation: u64,
    /// Generation of the last direct write
    pub(crate) written_generation: u64,
    pub(crate) fetcher: Option<Fetcher>,
    pub(crate) options: QueryOptions,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an empty, idle entry scheduled for collection after `gc_time`.
    pub fn new(key: QueryKey, options: QueryOptions, now: Instant) -> Self {
        let gc_at = now.checked_add(options.gc_time);
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            stale_at: None,
            gc_at,
            subscriber_count: 0,
            updated_at: None,
            invalidated: false,
            fetch_failure_count: 0,
            generation: 0,
            written_generation: 0,
            fetcher: None,
            options,
        }
    }

    // == Freshness ==
    /// Fresh data is served without any network activity.
    ///
    /// Boundary condition: at exactly `stale_at` the entry is already stale.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.data.is_some()
            && self.fetched_at.is_some()
            && self.stale_at.map_or(true, |stale_at| now < stale_at)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        !self.is_fresh(now)
    }

    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Fetching
    }

    // == Record Success ==
    /// Records authoritative data from a fetch (or a direct `set`).
    ///
    /// `stale_at = fetched_at + stale_time`; an overflowing stale time means
    /// the data never goes stale by time alone.
    pub fn record_success(&mut self, data: Option<Value>, now: Instant) {
        if let Some(data) = data {
            self.data = Some(data);
        }
        self.status = QueryStatus::Success;
        self.error = None;
        self.fetched_at = Some(now);
        self.stale_at = now.checked_add(self.options.stale_time);
        self.updated_at = Some(Utc::now());
        self.invalidated = false;
        self.fetch_failure_count = 0;
        if self.subscriber_count == 0 {
            self.schedule_gc(now);
        }
    }

    // == Record Error ==
    /// Records a terminal fetch failure; any previous data stays servable.
    pub fn record_error(&mut self, error: QueryError, failure_count: u32, now: Instant) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.invalidated = false;
        self.fetch_failure_count = failure_count;
        if self.subscriber_count == 0 {
            self.schedule_gc(now);
        }
    }

    // == Invalidate ==
    /// Marks the entry stale right now.
    ///
    /// Returns false when a previous invalidation is still awaiting its
    /// refetch, making the repeat a no-op.
    pub fn invalidate(&mut self, now: Instant) -> bool {
        if self.invalidated {
            return false;
        }
        self.invalidated = true;
        self.generation += 1;
        // Never earlier than fetched_at, since `now` is monotonic.
        self.stale_at = Some(now);
        true
    }

    // == Generations ==
    /// Records a direct write; fetches started before it can no longer
    /// overwrite it.
    pub(crate) fn mark_written(&mut self) {
        self.generation += 1;
        self.written_generation = self.generation;
    }

    /// Stored data came from a fetch that an invalidation overtook: keep it
    /// servable but stale, with the invalidation still awaiting a refetch.
    pub(crate) fn mark_outdated(&mut self, now: Instant) {
        self.stale_at = Some(now);
        self.invalidated = true;
    }

    /// A fetch ended without storing its result.
    pub(crate) fn finish_discarded(&mut self) {
        if self.status == QueryStatus::Fetching {
            self.status = if self.data.is_some() {
                QueryStatus::Success
            } else {
                QueryStatus::Idle
            };
        }
    }

    // == Subscribers ==
    pub fn add_subscriber(&mut self) {
        self.subscriber_count += 1;
        self.gc_at = None;
    }

    /// Returns true if this removed the last subscriber.
    pub fn remove_subscriber(&mut self, now: Instant) -> bool {
        self.subscriber_count = self.subscriber_count.saturating_sub(1);
        if self.subscriber_count == 0 {
            self.schedule_gc(now);
            true
        } else {
            false
        }
    }

    fn schedule_gc(&mut self, now: Instant) {
        self.gc_at = now.checked_add(self.options.gc_time);
    }

    // == GC Eligibility ==
    /// Observed entries are never collectable.
    pub fn is_collectable(&self, now: Instant) -> bool {
        self.subscriber_count == 0 && self.gc_at.is_some_and(|gc_at| now >= gc_at)
    }
}

// == Query State ==
/// Point-in-time view of an entry handed to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct QueryState {
    pub key: QueryKey,
    pub status: QueryStatus,
    pub data: Option<Value>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<QueryError>,
    pub is_stale: bool,
    pub is_fetching: bool,
    pub subscriber_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<QueryError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

impl QueryState {
    /// State reported for a key with no entry at all.
    pub fn idle(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_stale: true,
            is_fetching: false,
            subscriber_count: 0,
            updated_at: None,
        }
    }
}

impl CacheEntry {
    pub fn state(&self, now: Instant) -> QueryState {
        QueryState {
            key: self.key.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_stale: self.is_stale(now),
            is_fetching: self.is_fetching(),
            subscriber_count: self.subscriber_count,
            updated_at: self.updated_at,
        }
    }
}
