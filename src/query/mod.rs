//! Query Module
//!
//! Read side of the engine: fetch configuration, the executor and observers.

mod executor;
mod observer;
mod options;

pub use executor::QueryExecutor;
pub use observer::{CacheSubscription, QueryObserver};
pub use options::{fetcher, FetchFuture, Fetcher, QueryOptions, Retry, RetryPolicy, RetryPredicate};
