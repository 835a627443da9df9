//! Realtime Subscription Module
//!
//! Forwards a live change feed into the invalidation bus.

use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::bus::{EventPredicate, InvalidationBus};
use crate::keys::QueryKey;
use crate::repository::ChangeEvent;

// == Realtime Subscription ==
/// Live feed for one entity; unsubscribes when dropped.
#[derive(Debug)]
pub struct RealtimeSubscription {
    channel_id: String,
    entity: String,
    affected_prefixes: Vec<QueryKey>,
    task: JoinHandle<()>,
}

impl RealtimeSubscription {
    /// Spawns the forwarding task.
    ///
    /// Events rejected by `predicate` never reach the bus. `extra` prefixes are
    /// invalidated alongside the registry routes for every accepted event.
    pub fn spawn(
        channel_id: String,
        entity: &str,
        mut feed: BoxStream<'static, ChangeEvent>,
        predicate: Option<EventPredicate>,
        extra: Vec<QueryKey>,
        bus: InvalidationBus,
    ) -> Self {
        let mut affected_prefixes = bus.prefixes_for(entity, None);
        for prefix in &extra {
            if !affected_prefixes.iter().any(|p| p.is_prefix_of(prefix)) {
                affected_prefixes.push(prefix.clone());
            }
        }

        let forward_id = channel_id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                if predicate.as_ref().map_or(true, |accept| accept(&event)) {
                    bus.on_remote_event(&forward_id, event, extra.clone()).await;
                } else {
                    trace!(channel = %forward_id, id = ?event.id, "event filtered out");
                }
            }
            debug!(channel = %forward_id, "change feed ended");
        });
        debug!(channel = %channel_id, entity, "realtime subscription started");

        Self {
            channel_id,
            entity: entity.to_string(),
            affected_prefixes,
            task,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Prefixes an accepted event may invalidate.
    pub fn affected_prefixes(&self) -> &[QueryKey] {
        &self.affected_prefixes
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.task.abort();
        debug!(channel = %self.channel_id, "realtime subscription closed");
    }
}
