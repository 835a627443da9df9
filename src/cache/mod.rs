//! Cache Module
//!
//! Provides the in-memory query cache with freshness, garbage collection and
//! optimistic layers.

mod entry;
mod lock;
mod stats;
mod store;


// Re-export public types
pub use entry::{CacheEntry, QueryState, QueryStatus};
pub(crate) use lock::mutex_lock;
pub use stats::CacheStats;
pub use store::{
    CacheStore, CacheUpdate, FetchHandle, FetchSettlement, Invalidation, LayerOutcome, Lookup, SharedStore,
    UpdateKind,
};
