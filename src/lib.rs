//! QuerySync - A client-side data sync and caching layer
//!
//! Caches remote query results under hierarchical keys, deduplicates
//! in-flight fetches, applies optimistic mutations with rollback and keeps
//! cached data consistent through prefix invalidation driven by local
//! mutations and pushed change events.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod entities;
pub mod error;
pub mod invalidation;
pub mod keys;
pub mod models;
pub mod mutation;
pub mod query;
pub mod repository;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheStore, QueryState, QueryStatus};
pub use client::QueryClient;
pub use config::Config;
pub use error::{MutationError, QueryError, RepoError};
pub use keys::{make_key, KeyRegistry, KeySegment, QueryKey};
pub use mutation::{MutationHandle, MutationOptions};
pub use query::{fetcher, QueryObserver, QueryOptions};
pub use repository::{ChangeEvent, ChangeFilter, ChangeType, MemoryBackend, Repository, WriteOp};
pub use tasks::spawn_gc_task;
