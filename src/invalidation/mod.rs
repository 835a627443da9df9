//! Invalidation Module
//!
//! Local mutation settlements and pushed remote changes, mapped to cache
//! invalidations.

mod bus;
mod realtime;

pub use bus::{EventPredicate, InvalidationBus, MutationOutcome, Notice, PriorityRule};
pub use realtime::RealtimeSubscription;
