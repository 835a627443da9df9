//! Query Observer Module
//!
//! Live view of a single query key, the engine's `use_query` surface.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{mutex_lock, CacheUpdate, QueryState, SharedStore, UpdateKind};
use crate::keys::QueryKey;

// == Cache Subscription ==
/// Keeps an entry observed; unsubscribes when dropped.
#[derive(Debug)]
pub struct CacheSubscription {
    key: QueryKey,
    store: SharedStore,
}

impl CacheSubscription {
    /// Wraps a subscriber slot that was already counted on the entry.
    pub(crate) fn new(key: QueryKey, store: SharedStore) -> Self {
        Self { key, store }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        let mut store = mutex_lock(&self.store, "unsubscribe");
        store.remove_subscriber(&self.key, Instant::now());
    }
}

// == Query Observer ==
/// Observes one key until dropped.
#[derive(Debug)]
pub struct QueryObserver {
    subscription: CacheSubscription,
    updates: broadcast::Receiver<CacheUpdate>,
}

impl QueryObserver {
    pub(crate) fn new(
        key: QueryKey,
        store: SharedStore,
        updates: broadcast::Receiver<CacheUpdate>,
    ) -> Self {
        Self {
            subscription: CacheSubscription::new(key, store),
            updates,
        }
    }

    pub fn key(&self) -> &QueryKey {
        self.subscription.key()
    }

    /// Current `{status, data, error}` view of the key.
    pub fn state(&self) -> QueryState {
        let store = mutex_lock(&self.subscription.store, "observer_state");
        store
            .state(self.key(), Instant::now())
            .unwrap_or_else(|| QueryState::idle(self.key().clone()))
    }

    // == Changed ==
    /// Waits for the next change to this key.
    ///
    /// Returns `None` once the store has gone away. A lagging receiver reports
    /// a generic update, since the current state is always re-readable.
    pub async fn changed(&mut self) -> Option<UpdateKind> {
        loop {
            match self.updates.recv().await {
                Ok(update) if &update.key == self.key() => return Some(update.kind),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key(), skipped, "observer lagged behind updates");
                    return Some(UpdateKind::Updated);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Waits until the key is not fetching and has data or an error.
    pub async fn settled(&mut self) -> QueryState {
        loop {
            let state = self.state();
            if !state.is_fetching && (state.data.is_some() || state.error.is_some()) {
                return state;
            }
            if self.changed().await.is_none() {
                return self.state();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{CacheStore, QueryStatus, UpdateKind};
    use crate::error::RepoError;
    use crate::keys::make_key;
    use crate::query::{fetcher, QueryExecutor, QueryOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn executor() -> QueryExecutor {
        QueryExecutor::new(CacheStore::new(QueryOptions::default()).into_shared())
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_fetches_and_notifies() {
        let executor = executor();
        let key = make_key("thoughts", "list", None);
        let mut observer = executor.watch(
            &key,
            fetcher(|| async { Ok(json!(["first"])) }),
            QueryOptions::default(),
        );

        assert!(observer.state().is_fetching);
        let state = observer.settled().await;
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(json!(["first"])));
        assert_eq!(state.subscriber_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_error_state() {
        let executor = executor();
        let key = make_key("thoughts", "list", None);
        let mut observer = executor.watch(
            &key,
            fetcher(|| async { Err(RepoError::Validation("bad".into())) }),
            QueryOptions::default(),
        );

        let state = observer.settled().await;
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unsubscribes_and_schedules_gc() {
        let executor = executor();
        let key = make_key("thoughts", "list", None);
        let options = QueryOptions::default().gc_time(Duration::from_secs(5));
        let mut observer = executor.watch(&key, fetcher(|| async { Ok(json!(1)) }), options);
        observer.settled().await;
        drop(observer);

        assert_eq!(executor.state(&key).subscriber_count, 0);
        let mut store = executor.store().lock().unwrap();
        let now = tokio::time::Instant::now();
        assert_eq!(store.run_garbage_collection(now + Duration::from_secs(4)), 0);
        assert_eq!(store.run_garbage_collection(now + Duration::from_secs(5)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_completes_after_all_observers_leave() {
        let executor = executor();
        let key = make_key("voice_captures", "list", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slow = fetcher(move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(["late"]))
            }
        });

        let observer = executor.watch(&key, slow, QueryOptions::default());
        drop(observer);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.get_query_data(&key), Some(json!(["late"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_filters_by_key() {
        let executor = executor();
        let watched = make_key("thoughts", "detail", Some("1".into()));
        let other = make_key("thoughts", "detail", Some("2".into()));
        let mut observer = executor.watch(
            &watched,
            fetcher(|| async { Ok(json!({"id": "1"})) }),
            QueryOptions::default().stale_time(Duration::from_secs(60)),
        );
        observer.settled().await;

        executor.set_query_data(&other, json!({"id": "2"}));
        executor.set_query_data(&watched, json!({"id": "1", "title": "edited"}));

        assert_eq!(observer.changed().await, Some(UpdateKind::Updated));
        assert_eq!(
            observer.state().data,
            Some(json!({"id": "1", "title": "edited"}))
        );
    }
}
