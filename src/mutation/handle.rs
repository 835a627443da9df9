//! Mutation Handle Module
//!
//! Reusable mutation bound to an operation, the engine's `use_mutation`
//! surface.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use super::coordinator::{MutationCoordinator, MutationOptions};
use super::record::MutationStatus;
use crate::cache::mutex_lock;
use crate::error::{MutationError, RepoError};

type OperationFn<V> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<Value, RepoError>> + Send + Sync>;
type OptionsFn<V> = Arc<dyn Fn(&V) -> MutationOptions + Send + Sync>;

// == Mutation State ==
/// `{status, data, error}` of the most recent call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<Value>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<MutationError>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<MutationError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

impl Default for MutationState {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl MutationState {
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

// == Mutation Handle ==
pub struct MutationHandle<V> {
    coordinator: Arc<MutationCoordinator>,
    operation: OperationFn<V>,
    options: OptionsFn<V>,
    state: Arc<Mutex<MutationState>>,
}

impl<V> Clone for MutationHandle<V> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            operation: self.operation.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
        }
    }
}

impl<V: Send + 'static> MutationHandle<V> {
    /// Binds `operation` and per-call `options` to a coordinator.
    pub fn new<F, Fut, O>(coordinator: Arc<MutationCoordinator>, operation: F, options: O) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RepoError>> + Send + 'static,
        O: Fn(&V) -> MutationOptions + Send + Sync + 'static,
    {
        Self {
            coordinator,
            operation: Arc::new(move |vars| operation(vars).boxed()),
            options: Arc::new(options),
            state: Arc::new(Mutex::new(MutationState::default())),
        }
    }

    // == Mutate ==
    pub async fn mutate(&self, vars: V) -> Result<Value, MutationError> {
        let options = (self.options)(&vars);
        self.set_state(MutationState {
            status: MutationStatus::Pending,
            ..MutationState::default()
        });

        let result = self
            .coordinator
            .mutate((self.operation)(vars), options)
            .await;

        self.set_state(match &result {
            Ok(data) => MutationState {
                status: MutationStatus::Success,
                data: Some(data.clone()),
                error: None,
            },
            Err(err) => MutationState {
                status: MutationStatus::Error,
                data: None,
                error: Some(err.clone()),
            },
        });
        result
    }

    pub fn state(&self) -> MutationState {
        mutex_lock(&self.state, "mutation_state").clone()
    }

    /// Returns the handle to idle.
    pub fn reset(&self) {
        self.set_state(MutationState::default());
    }

    fn set_state(&self, state: MutationState) {
        *mutex_lock(&self.state, "mutation_state") = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::invalidation::InvalidationBus;
    use crate::keys::{make_key, KeyRegistry};
    use crate::mutation::patch;
    use crate::query::{QueryExecutor, QueryOptions};
    use serde_json::json;

    fn handle() -> (QueryExecutor, MutationHandle<String>) {
        let store = CacheStore::new(QueryOptions::default()).into_shared();
        let executor = QueryExecutor::new(store.clone());
        let bus = InvalidationBus::new(store.clone(), executor.clone(), KeyRegistry::new());
        let coordinator = Arc::new(MutationCoordinator::new(store, bus));
        let handle = MutationHandle::new(
            coordinator,
            |content: String| async move {
                if content.is_empty() {
                    Err(RepoError::Validation("content is required".into()))
                } else {
                    Ok(json!({"id": "1", "content": content}))
                }
            },
            |content: &String| {
                let item = json!({"id": "tmp", "content": content});
                MutationOptions::new()
                    .target_key(make_key("thoughts", "list", None))
                    .optimistic(move |_, current| patch::prepend(current, item.clone()))
            },
        );
        (executor, handle)
    }

    #[tokio::test]
    async fn test_handle_tracks_success() {
        let (_executor, handle) = handle();
        assert_eq!(handle.state().status, MutationStatus::Idle);

        handle.mutate("hello".to_string()).await.unwrap();
        let state = handle.state();
        assert_eq!(state.status, MutationStatus::Success);
        assert_eq!(state.data.unwrap()["content"], "hello");
    }

    #[tokio::test]
    async fn test_handle_tracks_error_and_resets() {
        let (executor, handle) = handle();
        let list = make_key("thoughts", "list", None);
        executor.set_query_data(&list, json!([]));

        let err = handle.mutate(String::new()).await.unwrap_err();
        let state = handle.state();
        assert_eq!(state.status, MutationStatus::Error);
        assert_eq!(state.error, Some(err));
        assert_eq!(executor.get_query_data(&list), Some(json!([])));

        handle.reset();
        assert_eq!(handle.state(), MutationState::default());
    }

    #[test]
    fn test_state_serializes_error_as_message() {
        let state = MutationState {
            status: MutationStatus::Error,
            data: None,
            error: Some(MutationError::Repo(RepoError::Conflict("stale".into()))),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "Conflict: stale");
    }
}
