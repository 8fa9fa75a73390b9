//! Poison-recovering lock extension traits.
//!
//! When a thread panics while holding a `Mutex`, the lock becomes "poisoned"
//! — all subsequent `.lock()` calls return `Err(PoisonError)`. The pipeline
//! scheduler runs arbitrary caller-supplied stage callbacks on its worker
//! threads, so a panicking callback must not cascade into every other stage
//! sharing the pipeline's mutex. We recover the inner data and continue.
//!
//! Usage:
//! ```ignore
//! use crate::lock_ext::MutexExt;
//!
//! let data = my_mutex.lock_poisoned();
//! ```

use std::sync::{Mutex, MutexGuard};

/// Extension trait that adds a poison-recovering method to `Mutex`.
pub trait MutexExt<T> {
    /// Acquire the mutex, recovering from a poisoned state.
    ///
    /// If the mutex was poisoned (a thread panicked while holding it),
    /// the data is recovered and a warning is logged.
    fn lock_poisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_poisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| {
            log::warn!("Recovered poisoned Mutex (a thread panicked while holding this lock)");
            e.into_inner()
        })
    }
}
