//! In-Memory Backend
//!
//! Repository and change feed held entirely in process memory, with fault
//! injection for exercising retry, rollback and conflict paths.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{ChangeEvent, ChangeFilter, ChangeType, RealtimeChannel, Repository, WriteOp};
use crate::cache::mutex_lock;
use crate::error::RepoError;

const CHANGE_FEED_CAPACITY: usize = 512;

/// Synchronous remote procedure registered on the backend.
pub type Procedure = Arc<dyn Fn(&Value) -> Result<Value, RepoError> + Send + Sync>;

type WriteResult = Result<(Value, Option<ChangeEvent>), RepoError>;

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn matches_params(row: &Value, params: &Value) -> bool {
    match params.as_object() {
        Some(params) => params.iter().all(|(field, value)| row.get(field) == Some(value)),
        None => true,
    }
}

// == Backend State ==
#[derive(Default)]
struct BackendState {
    tables: HashMap<String, Vec<Value>>,
    next_id: u64,
    required: HashMap<String, Vec<String>>,
    fetch_faults: VecDeque<RepoError>,
    write_faults: VecDeque<RepoError>,
    fetch_counts: HashMap<String, usize>,
    write_counts: HashMap<String, usize>,
    procedures: HashMap<String, Procedure>,
    latency: Duration,
}

impl BackendState {
    fn check_required(&self, entity: &str, fields: &Map<String, Value>, partial: bool) -> Result<(), RepoError> {
        let Some(required) = self.required.get(entity) else {
            return Ok(());
        };
        for field in required {
            let blank = match fields.get(field) {
                Some(value) => is_blank(value),
                None => !partial,
            };
            if blank {
                return Err(RepoError::Validation(format!("{entity}.{field} is required")));
            }
        }
        Ok(())
    }

    fn insert(&mut self, entity: &str, payload: Value) -> WriteResult {
        let Value::Object(mut fields) = payload else {
            return Err(RepoError::Validation(format!("{entity} insert expects an object")));
        };
        self.check_required(entity, &fields, false)?;

        self.next_id += 1;
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.next_id.to_string());
        let table = self.tables.entry(entity.to_string()).or_default();
        if table.iter().any(|row| row_id(row) == Some(id.as_str())) {
            return Err(RepoError::Conflict(format!("{entity} {id} already exists")));
        }

        fields.insert("id".into(), Value::String(id.clone()));
        fields.insert("version".into(), json!(1));
        fields.insert("created_at".into(), json!(Utc::now().to_rfc3339()));
        let row = Value::Object(fields);
        table.push(row.clone());

        let event = ChangeEvent::new(ChangeType::Insert, entity, Some(id), row.clone());
        Ok((row, Some(event)))
    }

    fn update(&mut self, entity: &str, payload: Value) -> WriteResult {
        let Value::Object(fields) = payload else {
            return Err(RepoError::Validation(format!("{entity} update expects an object")));
        };
        self.check_required(entity, &fields, true)?;
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RepoError::Validation(format!("{entity} update requires an id")))?;

        let row = self
            .tables
            .get_mut(entity)
            .and_then(|table| table.iter_mut().find(|row| row_id(row) == Some(id.as_str())))
            .ok_or_else(|| RepoError::Validation(format!("{entity} {id} not found")))?;

        let current = row.get("version").and_then(Value::as_u64).unwrap_or(0);
        if let Some(expected) = fields.get("version").and_then(Value::as_u64) {
            if expected != current {
                return Err(RepoError::Conflict(format!(
                    "{entity} {id} is at version {current}, not {expected}"
                )));
            }
        }

        if let Some(stored) = row.as_object_mut() {
            for (field, value) in fields {
                if field != "version" {
                    stored.insert(field, value);
                }
            }
            stored.insert("version".into(), json!(current + 1));
            stored.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
        }
        let row = row.clone();

        let event = ChangeEvent::new(ChangeType::Update, entity, Some(id), row.clone());
        Ok((row, Some(event)))
    }

    fn delete(&mut self, entity: &str, payload: Value) -> WriteResult {
        let id = match &payload {
            Value::String(id) => Some(id.clone()),
            other => row_id(other).map(str::to_string),
        }
        .ok_or_else(|| RepoError::Validation(format!("{entity} delete requires an id")))?;

        let table = self.tables.get_mut(entity);
        let position = table
            .as_ref()
            .and_then(|table| table.iter().position(|row| row_id(row) == Some(id.as_str())));
        let (Some(table), Some(position)) = (table, position) else {
            return Err(RepoError::Validation(format!("{entity} {id} not found")));
        };
        let row = table.remove(position);

        let event = ChangeEvent::new(ChangeType::Delete, entity, Some(id), row.clone());
        Ok((row, Some(event)))
    }

    fn invoke(&mut self, name: &str, payload: &Value) -> WriteResult {
        let procedure = self
            .procedures
            .get(name)
            .cloned()
            .ok_or_else(|| RepoError::Validation(format!("unknown procedure {name}")))?;
        Ok((procedure(payload)?, None))
    }
}

// == Memory Backend ==
/// In-process repository with a broadcast change feed.
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("subscribers", &self.changes.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: Mutex::new(BackendState::default()),
            changes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        mutex_lock(&self.state, "memory_backend")
    }

    // == Setup ==
    /// Inserts rows without emitting change events; rows without an id get one.
    pub fn seed(&self, entity: &str, rows: Vec<Value>) {
        let mut state = self.lock();
        for mut row in rows {
            state.next_id += 1;
            let next_id = state.next_id;
            if let Some(fields) = row.as_object_mut() {
                fields
                    .entry("id")
                    .or_insert_with(|| Value::String(next_id.to_string()));
                fields.entry("version").or_insert(json!(1));
            }
            state.tables.entry(entity.to_string()).or_default().push(row);
        }
    }

    /// Rejects inserts (and updates that blank it) missing `field`.
    pub fn require(&self, entity: &str, field: &str) {
        self.lock()
            .required
            .entry(entity.to_string())
            .or_default()
            .push(field.to_string());
    }

    pub fn register_procedure<F>(&self, name: &str, procedure: F)
    where
        F: Fn(&Value) -> Result<Value, RepoError> + Send + Sync + 'static,
    {
        self.lock()
            .procedures
            .insert(name.to_string(), Arc::new(procedure));
    }

    /// Delay applied to every fetch and write.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    // == Fault Injection ==
    pub fn fail_next_fetch(&self, error: RepoError) {
        self.lock().fetch_faults.push_back(error);
    }

    pub fn fail_next_write(&self, error: RepoError) {
        self.lock().write_faults.push_back(error);
    }

    // == Inspection ==
    pub fn records(&self, entity: &str) -> Vec<Value> {
        self.lock().tables.get(entity).cloned().unwrap_or_default()
    }

    pub fn fetch_count(&self, entity: &str) -> usize {
        self.lock().fetch_counts.get(entity).copied().unwrap_or(0)
    }

    pub fn write_count(&self, entity: &str) -> usize {
        self.lock().write_counts.get(entity).copied().unwrap_or(0)
    }

    // == Emit ==
    /// Pushes a change as if another client had written it.
    ///
    /// Returns the number of live subscribers that received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        match self.changes.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("change emitted with no subscribers");
                0
            }
        }
    }
}

#[async_trait]
impl Repository for MemoryBackend {
    async fn fetch(&self, entity: &str, params: &Value) -> Result<Value, RepoError> {
        let latency = {
            let mut state = self.lock();
            *state.fetch_counts.entry(entity.to_string()).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.fetch_faults.pop_front() {
            warn!(entity, error = %error, "injected fetch failure");
            return Err(error);
        }
        let rows = state.tables.get(entity).map(Vec::as_slice).unwrap_or_default();

        if let Some(id) = params.get("id") {
            return Ok(rows
                .iter()
                .find(|row| row.get("id") == Some(id))
                .cloned()
                .unwrap_or(Value::Null));
        }
        Ok(Value::Array(
            rows.iter()
                .filter(|row| matches_params(row, params))
                .cloned()
                .collect(),
        ))
    }

    async fn write(&self, entity: &str, op: WriteOp, payload: Value) -> Result<Value, RepoError> {
        let latency = {
            let mut state = self.lock();
            *state.write_counts.entry(entity.to_string()).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (row, event) = {
            let mut state = self.lock();
            if let Some(error) = state.write_faults.pop_front() {
                warn!(entity, ?op, error = %error, "injected write failure");
                return Err(error);
            }
            match &op {
                WriteOp::Insert => state.insert(entity, payload)?,
                WriteOp::Update => state.update(entity, payload)?,
                WriteOp::Delete => state.delete(entity, payload)?,
                WriteOp::Invoke(name) => state.invoke(name, &payload)?,
            }
        };

        debug!(entity, ?op, "write applied");
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(row)
    }
}

impl RealtimeChannel for MemoryBackend {
    fn subscribe(
        &self,
        entity: &str,
        filter: Option<ChangeFilter>,
    ) -> BoxStream<'static, ChangeEvent> {
        let entity = entity.to_string();
        let receiver = self.changes.subscribe();
        stream::unfold(receiver, move |mut receiver| {
            let entity = entity.clone();
            let filter = filter.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event)
                            if event.entity == entity
                                && filter.as_ref().map_or(true, |f| f.matches(&event)) =>
                        {
                            return Some((event, receiver));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%entity, skipped, "change feed lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}
