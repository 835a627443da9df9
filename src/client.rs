//! Query Client Module
//!
//! Owned engine instance composing the cache store, query executor,
//! mutation coordinator and invalidation bus over one repository.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{mutex_lock, CacheStats, CacheStore, Invalidation, QueryState, SharedStore};
use crate::config::Config;
use crate::entities;
use crate::error::{MutationError, QueryError, RepoError};
use crate::invalidation::{
    EventPredicate, InvalidationBus, Notice, PriorityRule, RealtimeSubscription,
};
use crate::keys::QueryKey;
use crate::mutation::{
    MutationCoordinator, MutationHandle, MutationOptions, MutationRecord,
};
use crate::query::{Fetcher, QueryExecutor, QueryObserver, QueryOptions};
use crate::repository::{ChangeFilter, RealtimeChannel, Repository, WriteOp};

struct ClientInner {
    defaults: QueryOptions,
    store: SharedStore,
    executor: QueryExecutor,
    bus: InvalidationBus,
    coordinator: Arc<MutationCoordinator>,
    repository: Arc<dyn Repository>,
    realtime: Option<Arc<dyn RealtimeChannel>>,
    channel_seq: AtomicU64,
}

// == Query Client ==
/// Cheap-to-clone handle to one engine instance.
///
/// Instances are fully independent; nothing is global.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("realtime", &self.inner.realtime.is_some())
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    // == Constructors ==
    /// Creates a client without a real-time channel.
    ///
    /// Must be called inside a tokio runtime; the invalidation queue consumer
    /// is spawned here.
    pub fn new(config: &Config, repository: Arc<dyn Repository>) -> Self {
        Self::build(config, repository, None)
    }

    /// Creates a client that can subscribe to pushed changes.
    pub fn with_realtime(
        config: &Config,
        repository: Arc<dyn Repository>,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Self {
        Self::build(config, repository, Some(realtime))
    }

    fn build(
        config: &Config,
        repository: Arc<dyn Repository>,
        realtime: Option<Arc<dyn RealtimeChannel>>,
    ) -> Self {
        let defaults = QueryOptions::from_config(config);
        let store = CacheStore::new(defaults.clone()).into_shared();
        let executor = QueryExecutor::new(store.clone());
        let bus = InvalidationBus::new(store.clone(), executor.clone(), entities::default_registry());
        bus.add_priority_rule(entities::trending_spike_rule(entities::TRENDING_SPIKE_THRESHOLD));
        let coordinator = Arc::new(MutationCoordinator::new(store.clone(), bus.clone()));

        info!(
            stale_time_ms = config.default_stale_time_ms,
            gc_time_ms = config.default_gc_time_ms,
            retries = config.default_retry_count,
            realtime = realtime.is_some(),
            "query client created"
        );

        Self {
            inner: Arc::new(ClientInner {
                defaults,
                store,
                executor,
                bus,
                coordinator,
                repository,
                realtime,
                channel_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Options derived from the client configuration.
    pub fn default_options(&self) -> QueryOptions {
        self.inner.defaults.clone()
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    // == Fetchers ==
    /// Fetcher reading `entity` rows matching `params` from the repository.
    pub fn entity_fetcher(&self, entity: &str, params: Value) -> Fetcher {
        let repository = self.inner.repository.clone();
        let entity = entity.to_string();
        Fetcher::new(move || {
            let repository = repository.clone();
            let entity = entity.clone();
            let params = params.clone();
            async move { repository.fetch(&entity, &params).await }
        })
    }

    // == Queries ==
    pub async fn query(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> Result<Value, QueryError> {
        self.inner.executor.query(key, fetcher, options).await
    }

    /// Queries `entity` through the repository with the default options.
    pub async fn query_entity(
        &self,
        key: &QueryKey,
        entity: &str,
        params: Value,
    ) -> Result<Value, QueryError> {
        let fetcher = self.entity_fetcher(entity, params);
        self.query(key, fetcher, self.default_options()).await
    }

    pub async fn query_as<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> Result<T, QueryError> {
        self.inner.executor.query_as(key, fetcher, options).await
    }

    pub async fn prefetch(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> Result<(), QueryError> {
        self.inner.executor.prefetch(key, fetcher, options).await
    }

    /// Observes `key` until the returned observer is dropped.
    pub fn watch(&self, key: &QueryKey, fetcher: Fetcher, options: QueryOptions) -> QueryObserver {
        self.inner.executor.watch(key, fetcher, options)
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.inner.executor.get_query_data(key)
    }

    pub fn set_query_data(&self, key: &QueryKey, data: Value) {
        self.inner.executor.set_query_data(key, data);
    }

    pub fn query_state(&self, key: &QueryKey) -> QueryState {
        self.inner.executor.state(key)
    }

    // == Mutations ==
    pub async fn mutate<Fut>(&self, operation: Fut, options: MutationOptions) -> Result<Value, MutationError>
    where
        Fut: Future<Output = Result<Value, RepoError>> + Send,
    {
        self.inner.coordinator.mutate(operation, options).await
    }

    /// Writes `vars` to `entity` as a mutation.
    pub async fn write_entity<V: Serialize>(
        &self,
        entity: &str,
        op: WriteOp,
        vars: &V,
        options: MutationOptions,
    ) -> Result<Value, MutationError> {
        let payload =
            serde_json::to_value(vars).map_err(|err| MutationError::Encode(err.to_string()))?;
        let repository = self.inner.repository.clone();
        let entity = entity.to_string();
        self.mutate(
            async move { repository.write(&entity, op, payload).await },
            options,
        )
        .await
    }

    /// Binds a reusable mutation to this client.
    pub fn use_mutation<V, F, Fut, O>(&self, operation: F, options: O) -> MutationHandle<V>
    where
        V: Send + 'static,
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RepoError>> + Send + 'static,
        O: Fn(&V) -> MutationOptions + Send + Sync + 'static,
    {
        MutationHandle::new(self.inner.coordinator.clone(), operation, options)
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.inner.repository.clone()
    }

    pub fn pending_mutations(&self) -> Vec<MutationRecord> {
        self.inner.coordinator.pending_mutations()
    }

    /// Recently settled mutations, newest first.
    pub fn recent_mutations(&self) -> Vec<MutationRecord> {
        self.inner.coordinator.recent_mutations()
    }

    // == Invalidation ==
    /// Marks everything under `prefix` stale; observed keys refetch.
    pub async fn invalidate(&self, prefix: &QueryKey) -> Invalidation {
        self.inner.bus.invalidate(prefix).await
    }

    /// Waits for every queued invalidation event to be processed.
    pub async fn flush(&self) {
        self.inner.bus.flush().await;
    }

    pub fn route(&self, entity: &str, prefixes: Vec<QueryKey>) {
        self.inner.bus.route(entity, prefixes);
    }

    pub fn add_priority_rule(&self, rule: PriorityRule) {
        self.inner.bus.add_priority_rule(rule);
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.bus.notices()
    }

    // == Realtime ==
    /// Subscribes to pushed changes for `entity`.
    ///
    /// Returns `None` when the client has no real-time channel.
    pub fn subscribe_realtime(
        &self,
        entity: &str,
        filter: Option<ChangeFilter>,
        predicate: Option<EventPredicate>,
    ) -> Option<RealtimeSubscription> {
        self.subscribe_realtime_with(entity, filter, predicate, Vec::new())
    }

    /// [`subscribe_realtime`](Self::subscribe_realtime) with extra prefixes
    /// invalidated on every accepted event.
    pub fn subscribe_realtime_with(
        &self,
        entity: &str,
        filter: Option<ChangeFilter>,
        predicate: Option<EventPredicate>,
        extra_prefixes: Vec<QueryKey>,
    ) -> Option<RealtimeSubscription> {
        let Some(realtime) = &self.inner.realtime else {
            warn!(entity, "no realtime channel configured");
            return None;
        };
        let seq = self.inner.channel_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let channel_id = format!("{entity}-changes-{seq}");
        let feed = realtime.subscribe(entity, filter);
        Some(RealtimeSubscription::spawn(
            channel_id,
            entity,
            feed,
            predicate,
            extra_prefixes,
            self.inner.bus.clone(),
        ))
    }

    // == Focus ==
    /// Application regained focus: refetch observed stale queries that opted in.
    pub fn on_focus(&self) -> usize {
        self.inner.executor.on_focus()
    }

    // == Housekeeping ==
    pub fn run_garbage_collection(&self) -> usize {
        let evicted = mutex_lock(&self.inner.store, "gc").run_garbage_collection(Instant::now());
        if evicted > 0 {
            debug!(evicted, "garbage collection");
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        mutex_lock(&self.inner.store, "stats").stats()
    }

    /// State of `key` if it is cached.
    pub fn cached_state(&self, key: &QueryKey) -> Option<QueryState> {
        mutex_lock(&self.inner.store, "cached_state").state(key, Instant::now())
    }

    pub fn states(&self) -> Vec<QueryState> {
        mutex_lock(&self.inner.store, "states").states(Instant::now())
    }

    // == Teardown ==
    /// Stops the invalidation queue and drops all cached data.
    pub fn teardown(&self) {
        self.inner.bus.shutdown();
        mutex_lock(&self.inner.store, "teardown").clear();
        info!("query client torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{THOUGHTS, THOUGHT_KEYS, TRENDING_KEYS};
    use crate::repository::MemoryBackend;
    use serde_json::json;

    fn client() -> (Arc<MemoryBackend>, QueryClient) {
        let backend = Arc::new(MemoryBackend::new());
        let client = QueryClient::with_realtime(&Config::default(), backend.clone(), backend.clone());
        (backend, client)
    }

    #[tokio::test]
    async fn test_query_entity_reads_through_repository() {
        let (backend, client) = client();
        backend.seed(THOUGHTS, vec![json!({"id": "1", "content": "hi"})]);

        let data = client
            .query_entity(&THOUGHT_KEYS.list(), THOUGHTS, Value::Null)
            .await
            .unwrap();
        assert_eq!(data[0]["content"], "hi");
        assert_eq!(backend.fetch_count(THOUGHTS), 1);
    }

    #[tokio::test]
    async fn test_independent_instances() {
        let (_backend, a) = client();
        let (_other, b) = client();
        a.set_query_data(&THOUGHT_KEYS.list(), json!([1]));

        assert!(a.get_query_data(&THOUGHT_KEYS.list()).is_some());
        assert!(b.get_query_data(&THOUGHT_KEYS.list()).is_none());
    }

    #[tokio::test]
    async fn test_write_entity_encodes_vars() {
        #[derive(Serialize)]
        struct NewThought {
            content: String,
        }

        let (backend, client) = client();
        let created = client
            .write_entity(
                THOUGHTS,
                WriteOp::Insert,
                &NewThought {
                    content: "draft".into(),
                },
                MutationOptions::new().target_key(THOUGHT_KEYS.list()),
            )
            .await
            .unwrap();

        assert_eq!(created["content"], "draft");
        assert_eq!(backend.records(THOUGHTS).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_without_channel() {
        let client = QueryClient::new(&Config::default(), Arc::new(MemoryBackend::new()));
        assert!(client.subscribe_realtime(THOUGHTS, None, None).is_none());
    }

    #[tokio::test]
    async fn test_subscription_channel_ids_are_unique() {
        let (_backend, client) = client();
        let a = client.subscribe_realtime(THOUGHTS, None, None).unwrap();
        let b = client.subscribe_realtime(THOUGHTS, None, None).unwrap();
        assert_ne!(a.channel_id(), b.channel_id());
        assert!(a.affected_prefixes().contains(&TRENDING_KEYS.all()));
    }

    #[tokio::test]
    async fn test_teardown_clears_cache() {
        let (_backend, client) = client();
        client.set_query_data(&THOUGHT_KEYS.list(), json!([]));
        client.teardown();

        assert!(client.states().is_empty());
        assert_eq!(client.stats().total_entries, 0);
    }
}
