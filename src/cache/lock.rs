use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Locks the store, recovering the guard if a previous holder panicked.
///
/// Store guards are never held across an `.await`, so a poisoned lock only
/// means a panic inside synchronous cache logic.
pub(crate) fn mutex_lock<'a, T>(lock: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}
