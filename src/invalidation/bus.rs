//! Invalidation Bus Module
//!
//! Single inbound queue turning mutation settlements and remote change events
//! into cache invalidations, processed in arrival order.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{mutex_lock, Invalidation, SharedStore};
use crate::error::RepoError;
use crate::keys::{KeyRegistry, QueryKey};
use crate::query::QueryExecutor;
use crate::repository::ChangeEvent;

const QUEUE_CAPACITY: usize = 1024;
const NOTICE_CAPACITY: usize = 64;

// == Mutation Outcome ==
/// How a local mutation ended, as far as invalidation is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Success,
    Failed(RepoError),
}

impl MutationOutcome {
    /// Success and conflicts invalidate; other failures leave the cache alone.
    pub fn invalidates(&self) -> bool {
        match self {
            MutationOutcome::Success => true,
            MutationOutcome::Failed(err) => err.invalidates_cache(),
        }
    }
}

// == Priority Rules ==
pub type EventPredicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;
type NoticeMessage = Arc<dyn Fn(&ChangeEvent) -> String + Send + Sync>;

/// Marks some remote events as worth a user-facing notice.
#[derive(Clone)]
pub struct PriorityRule {
    pub name: String,
    pub entity: String,
    predicate: EventPredicate,
    message: NoticeMessage,
}

impl PriorityRule {
    pub fn new<P, M>(name: impl Into<String>, entity: impl Into<String>, predicate: P, message: M) -> Self
    where
        P: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
        M: Fn(&ChangeEvent) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            entity: entity.into(),
            predicate: Arc::new(predicate),
            message: Arc::new(message),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.entity == self.entity && (self.predicate)(event)
    }
}

impl fmt::Debug for PriorityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityRule")
            .field("name", &self.name)
            .field("entity", &self.entity)
            .finish_non_exhaustive()
    }
}

/// One-shot alert raised by a priority rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub rule: String,
    pub entity: String,
    pub id: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

// == Queue Events ==
enum BusEvent {
    Invalidate {
        prefixes: Vec<QueryKey>,
        ack: oneshot::Sender<Invalidation>,
    },
    Remote {
        channel_id: String,
        event: ChangeEvent,
        extra: Vec<QueryKey>,
    },
    Flush(oneshot::Sender<()>),
}

// == Processor ==
/// Queue consumer; owns the notice dedup set.
struct Processor {
    store: SharedStore,
    executor: QueryExecutor,
    registry: Arc<Mutex<KeyRegistry>>,
    rules: Arc<Mutex<Vec<PriorityRule>>>,
    raised: HashSet<(String, String, Option<String>)>,
    notices: broadcast::Sender<Notice>,
}

impl Processor {
    async fn run(mut self, mut queue: mpsc::Receiver<BusEvent>) {
        while let Some(event) = queue.recv().await {
            self.handle(event);
        }
        debug!("invalidation queue closed");
    }

    fn handle(&mut self, event: BusEvent) {
        match event {
            BusEvent::Invalidate { prefixes, ack } => {
                let result = self.invalidate(&prefixes);
                // The caller may have stopped waiting.
                let _ = ack.send(result);
            }
            BusEvent::Remote {
                channel_id,
                event,
                extra,
            } => self.remote(&channel_id, &event, extra),
            BusEvent::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    /// Marks every entry under `prefixes` stale and refetches observed ones,
    /// all in one critical section.
    fn invalidate(&self, prefixes: &[QueryKey]) -> Invalidation {
        let mut store = mutex_lock(&self.store, "bus_invalidate");
        let now = Instant::now();
        let mut merged = Invalidation::default();
        for prefix in prefixes {
            let result = store.invalidate(prefix, now);
            merged.invalidated.extend(result.invalidated);
            merged.refetch.extend(result.refetch);
        }
        merged
            .refetch
            .retain(|key| self.executor.ensure_fetch(&mut store, key, now).is_some());
        debug!(
            prefixes = prefixes.len(),
            invalidated = merged.invalidated.len(),
            refetching = merged.refetch.len(),
            "invalidation processed"
        );
        merged
    }

    fn remote(&mut self, channel_id: &str, event: &ChangeEvent, extra: Vec<QueryKey>) {
        let mut prefixes =
            mutex_lock(&self.registry, "registry").prefixes_for(&event.entity, event.id.as_deref());
        for prefix in extra {
            if !prefixes.iter().any(|p| p.is_prefix_of(&prefix)) {
                prefixes.push(prefix);
            }
        }
        debug!(
            channel = channel_id,
            entity = %event.entity,
            id = ?event.id,
            change = ?event.change_type,
            "remote change received"
        );
        self.invalidate(&prefixes);
        self.raise_notices(event);
    }

    fn raise_notices(&mut self, event: &ChangeEvent) {
        let rules = mutex_lock(&self.rules, "priority_rules").clone();
        for rule in rules.iter().filter(|rule| rule.entity == event.entity) {
            let marker = (rule.name.clone(), event.entity.clone(), event.id.clone());
            // Falling back under the threshold re-arms the rule for this row
            if !rule.matches(event) {
                if self.raised.remove(&marker) {
                    debug!(rule = %rule.name, id = ?event.id, "priority rule re-armed");
                }
                continue;
            }
            if !self.raised.insert(marker) {
                continue;
            }
            let notice = Notice {
                rule: rule.name.clone(),
                entity: event.entity.clone(),
                id: event.id.clone(),
                message: (rule.message)(event),
                raised_at: Utc::now(),
            };
            info!(rule = %notice.rule, message = %notice.message, "priority notice");
            if self.notices.send(notice).is_err() {
                debug!(rule = %rule.name, "no listeners for notice");
            }
        }
    }
}

// == Invalidation Bus ==
/// Handle to the invalidation queue; cheap to clone.
#[derive(Clone)]
pub struct InvalidationBus {
    queue: mpsc::Sender<BusEvent>,
    registry: Arc<Mutex<KeyRegistry>>,
    rules: Arc<Mutex<Vec<PriorityRule>>>,
    notices: broadcast::Sender<Notice>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for InvalidationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBus")
            .field("queued", &(QUEUE_CAPACITY - self.queue.capacity()))
            .finish_non_exhaustive()
    }
}

impl InvalidationBus {
    /// Starts the queue consumer on the current tokio runtime.
    pub fn new(store: SharedStore, executor: QueryExecutor, registry: KeyRegistry) -> Self {
        let (queue, inbound) = mpsc::channel(QUEUE_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let registry = Arc::new(Mutex::new(registry));
        let rules = Arc::new(Mutex::new(Vec::new()));

        let processor = Processor {
            store,
            executor,
            registry: registry.clone(),
            rules: rules.clone(),
            raised: HashSet::new(),
            notices: notices.clone(),
        };
        let pump = tokio::spawn(processor.run(inbound));

        Self {
            queue,
            registry,
            rules,
            notices,
            pump: Arc::new(Mutex::new(Some(pump))),
        }
    }

    // == Invalidate ==
    /// Invalidates everything under `prefix` once earlier events are processed.
    pub async fn invalidate(&self, prefix: &QueryKey) -> Invalidation {
        self.invalidate_all(vec![prefix.clone()]).await
    }

    async fn invalidate_all(&self, prefixes: Vec<QueryKey>) -> Invalidation {
        let (ack, done) = oneshot::channel();
        if self
            .queue
            .send(BusEvent::Invalidate { prefixes, ack })
            .await
            .is_err()
        {
            warn!("invalidation bus is shut down");
            return Invalidation::default();
        }
        done.await.unwrap_or_default()
    }

    // == Local Mutations ==
    pub async fn on_local_mutation_settled(
        &self,
        target_keys: &[QueryKey],
        outcome: &MutationOutcome,
    ) -> Invalidation {
        if !outcome.invalidates() || target_keys.is_empty() {
            debug!(?outcome, "mutation settled without invalidation");
            return Invalidation::default();
        }
        self.invalidate_all(target_keys.to_vec()).await
    }

    // == Remote Events ==
    /// Enqueues a pushed change; `extra` adds prefixes beyond the registry routes.
    pub async fn on_remote_event(&self, channel_id: &str, event: ChangeEvent, extra: Vec<QueryKey>) {
        let queued = BusEvent::Remote {
            channel_id: channel_id.to_string(),
            event,
            extra,
        };
        if self.queue.send(queued).await.is_err() {
            warn!(channel = channel_id, "remote event dropped, bus is shut down");
        }
    }

    /// Resolves once every event queued before the call has been processed.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.queue.send(BusEvent::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    // == Configuration ==
    pub fn add_priority_rule(&self, rule: PriorityRule) {
        debug!(rule = %rule.name, entity = %rule.entity, "priority rule added");
        mutex_lock(&self.rules, "priority_rules").push(rule);
    }

    pub fn route(&self, entity: &str, prefixes: Vec<QueryKey>) {
        mutex_lock(&self.registry, "registry").route(entity, prefixes);
    }

    pub fn prefixes_for(&self, entity: &str, id: Option<&str>) -> Vec<QueryKey> {
        mutex_lock(&self.registry, "registry").prefixes_for(entity, id)
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    // == Shutdown ==
    /// Stops the consumer; later events are dropped with a warning.
    pub fn shutdown(&self) {
        if let Some(pump) = mutex_lock(&self.pump, "bus_pump").take() {
            pump.abort();
            info!("invalidation bus stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::keys::make_key;
    use crate::query::{fetcher, QueryOptions};
    use crate::repository::ChangeType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup() -> (QueryExecutor, InvalidationBus) {
        let defaults = QueryOptions::default().stale_time(Duration::from_secs(60));
        let store = CacheStore::new(defaults).into_shared();
        let executor = QueryExecutor::new(store.clone());
        let mut registry = KeyRegistry::new();
        registry.route("thoughts", vec![QueryKey::entity("trending_topics")]);
        let bus = InvalidationBus::new(store, executor.clone(), registry);
        (executor, bus)
    }

    fn event(entity: &str, id: &str, payload: serde_json::Value) -> ChangeEvent {
        ChangeEvent::new(ChangeType::Update, entity, Some(id.to_string()), payload)
    }

    #[test]
    fn test_outcome_invalidation_policy() {
        assert!(MutationOutcome::Success.invalidates());
        assert!(MutationOutcome::Failed(RepoError::Conflict("x".into())).invalidates());
        assert!(!MutationOutcome::Failed(RepoError::Validation("x".into())).invalidates());
        assert!(!MutationOutcome::Failed(RepoError::Authentication("x".into())).invalidates());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_cache_fresh() {
        let (executor, bus) = setup();
        let key = make_key("thoughts", "list", None);
        executor.set_query_data(&key, json!([]));

        let result = bus
            .on_local_mutation_settled(
                &[key.clone()],
                &MutationOutcome::Failed(RepoError::Validation("bad".into())),
            )
            .await;
        assert!(result.invalidated.is_empty());
        assert!(!executor.state(&key).is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_event_routes_through_registry() {
        let (executor, bus) = setup();
        let detail = make_key("thoughts", "detail", Some("1".into()));
        let other = make_key("thoughts", "detail", Some("2".into()));
        let trending = make_key("trending_topics", "list", None);
        let captures = make_key("voice_captures", "list", None);
        for key in [&detail, &other, &trending, &captures] {
            executor.set_query_data(key, json!({}));
        }

        bus.on_remote_event("thoughts:1", event("thoughts", "1", json!({})), vec![])
            .await;
        bus.flush().await;

        assert!(executor.state(&detail).is_stale);
        assert!(executor.state(&trending).is_stale);
        assert!(!executor.state(&other).is_stale);
        assert!(!executor.state(&captures).is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_keys_refetch_once() {
        let (executor, bus) = setup();
        let key = make_key("thoughts", "detail", Some("1".into()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut observer = executor.watch(
            &key,
            fetcher(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({"id": "1"}))
                }
            }),
            QueryOptions::default().stale_time(Duration::from_secs(60)),
        );
        observer.settled().await;

        let first = bus.invalidate(&QueryKey::entity("thoughts")).await;
        assert_eq!(first.refetch, vec![key.clone()]);
        // Redundant while the refetch is pending
        let second = bus.invalidate(&QueryKey::entity("thoughts")).await;
        assert!(second.invalidated.is_empty());

        observer.settled().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!executor.state(&key).is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_fetch_refetches_again() {
        let (executor, bus) = setup();
        let key = make_key("thoughts", "detail", Some("1".into()));
        let server = Arc::new(Mutex::new(json!({"v": 0})));
        let calls = Arc::new(AtomicUsize::new(0));
        let (source, counter) = (server.clone(), calls.clone());
        let mut observer = executor.watch(
            &key,
            fetcher(move || {
                let (source, counter) = (source.clone(), counter.clone());
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let value = source.lock().unwrap().clone();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(value)
                }
            }),
            QueryOptions::default().stale_time(Duration::from_secs(60)),
        );
        observer.settled().await;

        // A background refetch reads v1, then the server moves on to v2
        *server.lock().unwrap() = json!({"v": 1});
        assert_eq!(executor.refetch(&[key.clone()]), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        *server.lock().unwrap() = json!({"v": 2});

        let result = bus.invalidate(&QueryKey::entity("thoughts")).await;
        assert_eq!(result.refetch, vec![key.clone()]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let state = executor.state(&key);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.data, Some(json!({"v": 2})));
        assert!(!state.is_stale);
    }

    #[tokio::test]
    async fn test_priority_notice_is_one_shot() {
        let (_executor, bus) = setup();
        let mut notices = bus.notices();
        bus.add_priority_rule(PriorityRule::new(
            "spike",
            "trending_topics",
            |event| event.field("mentions").and_then(|m| m.as_u64()) >= Some(10),
            |event| format!("{} is spiking", event.id.as_deref().unwrap_or("?")),
        ));

        bus.on_remote_event("t", event("trending_topics", "rust", json!({"mentions": 3})), vec![])
            .await;
        bus.on_remote_event("t", event("trending_topics", "rust", json!({"mentions": 12})), vec![])
            .await;
        bus.on_remote_event("t", event("trending_topics", "rust", json!({"mentions": 15})), vec![])
            .await;
        bus.flush().await;

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.message, "rust is spiking");
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_priority_notice_rearms_after_dip() {
        let (_executor, bus) = setup();
        let mut notices = bus.notices();
        bus.add_priority_rule(PriorityRule::new(
            "spike",
            "trending_topics",
            |event| event.field("mentions").and_then(|m| m.as_u64()) >= Some(10),
            |event| format!("{} is spiking", event.id.as_deref().unwrap_or("?")),
        ));

        for mentions in [12, 5, 14] {
            bus.on_remote_event(
                "t",
                event("trending_topics", "rust", json!({"mentions": mentions})),
                vec![],
            )
            .await;
        }
        // Another row's dip leaves the raised marker for "rust" alone
        bus.on_remote_event("t", event("trending_topics", "go", json!({"mentions": 1})), vec![])
            .await;
        bus.on_remote_event("t", event("trending_topics", "rust", json!({"mentions": 20})), vec![])
            .await;
        bus.flush().await;

        assert_eq!(notices.try_recv().unwrap().message, "rust is spiking");
        assert_eq!(notices.try_recv().unwrap().message, "rust is spiking");
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drops_events() {
        let (executor, bus) = setup();
        let key = make_key("thoughts", "list", None);
        executor.set_query_data(&key, json!([]));

        bus.shutdown();
        tokio::task::yield_now().await;
        let result = bus.invalidate(&QueryKey::entity("thoughts")).await;
        assert!(result.invalidated.is_empty());
    }
}
