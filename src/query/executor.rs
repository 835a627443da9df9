//! Query Executor Module
//!
//! Resolves query keys to data: fresh hits, stale-while-revalidate and
//! deduplicated, retried fetches.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cache::{
    mutex_lock, CacheStore, FetchHandle, FetchSettlement, Lookup, QueryState, SharedStore,
};
use crate::error::{QueryError, RepoError};
use crate::keys::QueryKey;
use crate::query::{Fetcher, QueryObserver, QueryOptions};

// == Query Executor ==
/// Reads through the cache, fetching when data is missing or stale.
#[derive(Clone)]
pub struct QueryExecutor {
    store: SharedStore,
}

impl QueryExecutor {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // == Query ==
    /// Returns data for `key`.
    ///
    /// Fresh data is returned without a network call. Stale data is returned
    /// immediately while a background refetch starts. Missing data waits on
    /// the key's single in-flight fetch, shared with every concurrent caller.
    pub async fn query(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> Result<Value, QueryError> {
        let handle = {
            let mut store = mutex_lock(&self.store, "query");
            let now = Instant::now();
            store.ensure_entry(key, Some(&options), Some(&fetcher), now);
            match store.lookup(key, now) {
                Lookup::Fresh(data) => {
                    trace!(%key, "fresh cache hit");
                    return Ok(data);
                }
                Lookup::Stale(data) => {
                    debug!(%key, "serving stale data, revalidating");
                    self.ensure_fetch(&mut store, key, now);
                    return Ok(data);
                }
                Lookup::Missing => self.ensure_fetch(&mut store, key, now),
            }
        };

        match handle {
            Some(handle) => handle.await,
            None => Err(QueryError::Aborted(key.to_string())),
        }
    }

    /// [`query`](Self::query) decoding the data into `T`.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> Result<T, QueryError> {
        let data = self.query(key, fetcher, options).await?;
        serde_json::from_value(data).map_err(|err| QueryError::Decode(err.to_string()))
    }

    // == Prefetch ==
    /// Warms the cache for `key` unless fresh data is already present.
    pub async fn prefetch(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> Result<(), QueryError> {
        let handle = {
            let mut store = mutex_lock(&self.store, "prefetch");
            let now = Instant::now();
            let entry = store.ensure_entry(key, Some(&options), Some(&fetcher), now);
            if entry.is_fresh(now) {
                return Ok(());
            }
            self.ensure_fetch(&mut store, key, now)
        };
        match handle {
            Some(handle) => handle.await.map(|_| ()),
            None => Ok(()),
        }
    }

    // == Watch ==
    /// Observes `key`: subscribes, fetches if missing or stale, and keeps the
    /// entry alive until the observer is dropped.
    pub fn watch(&self, key: &QueryKey, fetcher: Fetcher, options: QueryOptions) -> QueryObserver {
        let mut store = mutex_lock(&self.store, "watch");
        let now = Instant::now();
        store.ensure_entry(key, Some(&options), Some(&fetcher), now);
        let updates = store.subscribe_updates();
        store.add_subscriber(key, &options, now);
        match store.lookup(key, now) {
            Lookup::Fresh(_) => {}
            Lookup::Stale(_) | Lookup::Missing => {
                self.ensure_fetch(&mut store, key, now);
            }
        }
        QueryObserver::new(key.clone(), self.store.clone(), updates)
    }

    // == Direct Access ==
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        let store = mutex_lock(&self.store, "get_query_data");
        store.get(key).and_then(|entry| entry.data.clone())
    }

    /// Writes data as if it had just been fetched.
    pub fn set_query_data(&self, key: &QueryKey, data: Value) {
        let mut store = mutex_lock(&self.store, "set_query_data");
        store.set(key, data, Instant::now());
    }

    pub fn state(&self, key: &QueryKey) -> QueryState {
        let store = mutex_lock(&self.store, "state");
        store
            .state(key, Instant::now())
            .unwrap_or_else(|| QueryState::idle(key.clone()))
    }

    // == Background Refetch ==
    /// Starts background fetches for `keys`; returns how many are in flight.
    pub fn refetch(&self, keys: &[QueryKey]) -> usize {
        let mut store = mutex_lock(&self.store, "refetch");
        let now = Instant::now();
        keys.iter()
            .filter(|key| self.ensure_fetch(&mut store, key, now).is_some())
            .count()
    }

    /// Forces a staleness check on observed queries that opted into it.
    pub fn on_focus(&self) -> usize {
        let mut store = mutex_lock(&self.store, "on_focus");
        let now = Instant::now();
        let keys = store.focus_candidates(now);
        let started = keys
            .iter()
            .filter(|key| self.ensure_fetch(&mut store, key, now).is_some())
            .count();
        debug!(started, "focus regained");
        started
    }

    // == Ensure Fetch ==
    /// Joins the in-flight fetch for `key` or starts one with the entry's
    /// fetcher. Returns `None` when the key has no known fetcher.
    ///
    /// The fetch runs as its own task, so dropping every waiter never cancels it.
    pub(crate) fn ensure_fetch(
        &self,
        store: &mut CacheStore,
        key: &QueryKey,
        now: Instant,
    ) -> Option<FetchHandle> {
        if let Some(handle) = store.in_flight(key) {
            trace!(%key, "joining in-flight fetch");
            return Some(handle);
        }

        let entry = store.get(key)?;
        let fetcher = entry.fetcher.clone()?;
        let options = entry.options.clone();
        store.mark_fetching(key, now);
        let started = store.generation(key);

        let task = tokio::spawn(run_fetch(
            self.clone(),
            key.clone(),
            fetcher,
            options,
            started,
        ));
        let shared_store = self.store.clone();
        let task_key = key.clone();
        let handle = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(key = %task_key, error = %err, "fetch task ended abnormally");
                    let error = QueryError::Aborted(task_key.to_string());
                    let mut store = mutex_lock(&shared_store, "fetch_aborted");
                    store.finish_fetch(&task_key);
                    store.mark_error(&task_key, error.clone(), 0, Instant::now());
                    Err(error)
                }
            }
        }
        .boxed()
        .shared();

        store.begin_fetch(key, handle.clone());
        debug!(%key, "fetch started");
        Some(handle)
    }
}

// == Fetch Loop ==
/// Runs `fetcher` under the retry policy, then settles the entry.
///
/// The in-flight marker is cleared in the same critical section that records
/// the terminal state, so a later call can always fetch again. When an
/// invalidation or a direct write overtook the fetch, observed entries get
/// one follow-up fetch instead of being marked fresh.
fn run_fetch(
    executor: QueryExecutor,
    key: QueryKey,
    fetcher: Fetcher,
    options: QueryOptions,
    started: u64,
) -> BoxFuture<'static, Result<Value, QueryError>> {
    async move {
        let mut failures = 0u32;
        let result = loop {
            let attempt = fetcher.call();
            let outcome = match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RepoError::Transient(format!(
                        "fetch timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => attempt.await,
            };

            match outcome {
                Ok(data) => break Ok(data),
                Err(err) => {
                    failures += 1;
                    if !options.retry.should_retry(failures, &err) {
                        break Err(err);
                    }
                    let delay = options.retry.delay_for(failures);
                    warn!(
                        %key,
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let mut store = mutex_lock(&executor.store, "fetch_settled");
        let now = Instant::now();
        store.finish_fetch(&key);
        match result {
            Ok(data) => {
                let settlement = store.settle_fetch(&key, data.clone(), started, now);
                let result = match settlement {
                    FetchSettlement::Stored => {
                        debug!(%key, "fetch succeeded");
                        return Ok(data);
                    }
                    FetchSettlement::Outdated => data,
                    FetchSettlement::Superseded => store
                        .get(&key)
                        .and_then(|entry| entry.data.clone())
                        .unwrap_or(data),
                };
                debug!(%key, ?settlement, "fetch overtaken by a newer change");
                if store.needs_refetch(&key, now) {
                    executor.ensure_fetch(&mut store, &key, now);
                }
                Ok(result)
            }
            Err(err) => {
                warn!(%key, error = %err, kind = err.kind(), failures, "fetch failed");
                let error = QueryError::from(err);
                store.mark_error(&key, error.clone(), failures, now);
                Err(error)
            }
        }
    }
    .boxed()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, QueryStatus};
    use crate::keys::make_key;
    use crate::query::{fetcher, Retry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn executor() -> QueryExecutor {
        QueryExecutor::new(CacheStore::new(QueryOptions::default()).into_shared())
    }

    fn counting(calls: &Arc<AtomicUsize>, value: Value) -> Fetcher {
        let calls = calls.clone();
        fetcher(move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_queries_share_one_fetch() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = make_key("thoughts", "list", None);
        let f = counting(&calls, json!(["a"]));

        let results = futures::future::join_all(
            (0..8).map(|_| executor.query(&key, f.clone(), QueryOptions::default())),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), json!(["a"]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_skips_fetcher_until_stale() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = make_key("thoughts", "detail", Some("1".into()));
        let options = QueryOptions::default().stale_time(Duration::from_secs(10));
        let f = counting(&calls, json!({"id": "1"}));

        executor.query(&key, f.clone(), options.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        executor.query(&key, f.clone(), options.clone()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let data = executor.query(&key, f.clone(), options.clone()).await.unwrap();
        assert_eq!(data, json!({"id": "1"}), "stale data is returned immediately");
        // Second stale read while the refetch is in flight joins it
        executor.query(&key, f.clone(), options).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let executor = executor();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky = fetcher(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RepoError::Transient("connection reset".into()))
                } else {
                    Ok(json!("ok"))
                }
            }
        });

        let key = make_key("trending_topics", "list", None);
        let data = executor
            .query(&key, flaky, QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(data, json!("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(executor.state(&key).status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_error_is_not_retried() {
        let executor = executor();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let denied = fetcher(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RepoError::Authentication("session expired".into()))
            }
        });

        let key = make_key("thoughts", "list", None);
        let err = executor
            .query(&key, denied, QueryOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err, QueryError::Repo(RepoError::Authentication("session expired".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let state = executor.state(&key);
        assert_eq!(state.status, QueryStatus::Error);
        assert!(!state.is_fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_clears_in_flight_marker() {
        let executor = executor();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let f = fetcher(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RepoError::Validation("bad filter".into()))
                } else {
                    Ok(json!([]))
                }
            }
        });
        let key = make_key("thoughts", "list", None);

        assert!(executor.query(&key, f.clone(), QueryOptions::default()).await.is_err());
        assert_eq!(
            executor.query(&key, f, QueryOptions::default()).await.unwrap(),
            json!([])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient_failure() {
        let executor = executor();
        let hang = fetcher(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        });
        let options = QueryOptions::default()
            .timeout(Duration::from_secs(1))
            .retry(Retry::Count(1));

        let key = make_key("voice_captures", "list", None);
        let err = executor.query(&key, hang, options).await.unwrap_err();
        assert!(matches!(err, QueryError::Repo(RepoError::Transient(_))));
        assert_eq!(executor.state(&key).status, QueryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_and_direct_access() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = make_key("content_suggestions", "list", None);
        let options = QueryOptions::default().stale_time(Duration::from_secs(60));

        executor
            .prefetch(&key, counting(&calls, json!([1])), options.clone())
            .await
            .unwrap();
        executor
            .prefetch(&key, counting(&calls, json!([1])), options)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.get_query_data(&key), Some(json!([1])));

        executor.set_query_data(&key, json!([2]));
        assert_eq!(executor.get_query_data(&key), Some(json!([2])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_as_decodes() {
        let executor = executor();
        let key = make_key("thoughts", "count", None);
        let n: u32 = executor
            .query_as(&key, fetcher(|| async { Ok(json!(3)) }), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(n, 3);

        let err = executor
            .query_as::<String>(&key, fetcher(|| async { Ok(json!(3)) }), QueryOptions::default())
            .await;
        assert!(matches!(err, Err(QueryError::Decode(_))));
    }
}
