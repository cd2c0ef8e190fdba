//! Lock helper shared by every task that touches a mutex-guarded table.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquire `mutex`, recovering the guard if a previous holder panicked.
///
/// Every table in this crate is left consistent between statements, so the
/// data behind a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
