//! Synchronization primitives shared by the node and rule machinery

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

mod interrupt;

pub use interrupt::Interrupt;

/// Acquire a read guard, recovering the data if a writer panicked.
///
/// Node state stays consistent under poisoning because every write section
/// is a plain field update with no tear-prone intermediate states.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire a write guard, recovering the data if a writer panicked
pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire a mutex guard, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NODE_IDS: AtomicU64 = AtomicU64::new(1);
static EXECUTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a node instance
pub(crate) fn next_node_id() -> u64 {
    NODE_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Process-unique identifier for a single rule execution.
///
/// Busy markers are keyed by execution id so overlapping executions on the
/// same property clear their own contribution independently.
pub(crate) fn next_execution_id() -> u64 {
    EXECUTION_IDS.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_ids_are_unique() {
        let a = next_execution_id();
        let b = next_execution_id();
        assert_ne!(a, b);
    }
}
