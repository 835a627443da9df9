//! Mutation Module
//!
//! Write side of the engine: optimistic mutations with exact rollback.

mod coordinator;
mod handle;
pub mod patch;
mod record;

pub use coordinator::{
    ErrorCallback, MutationCoordinator, MutationOptions, OptimisticFn, ReconcileFn,
    SuccessCallback,
};
pub use handle::{MutationHandle, MutationState};
pub use record::{MutationId, MutationRecord, MutationStatus};
