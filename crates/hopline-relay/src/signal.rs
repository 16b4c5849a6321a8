//! Await helpers over `watch` channels used as level-triggered signals.
//!
//! Each helper drops the borrowed value before returning, so callers may
//! write to the same channel right after the await.

use tokio::sync::{mpsc, watch};

/// Resolve once the flag is `true`
pub(crate) async fn wait_true(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Resolve once the epoch differs from `epoch`
pub(crate) async fn wait_changed(rx: &mut watch::Receiver<u64>, epoch: u64) {
    let _ = rx.wait_for(|current| *current != epoch).await;
}

/// Resolve once the value reaches `target`
pub(crate) async fn wait_at_least(rx: &mut watch::Receiver<u64>, target: u64) {
    let _ = rx.wait_for(|current| *current >= target).await;
}

/// Next message of an optional source; pending forever while detached
pub(crate) async fn recv_optional(source: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match source {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Recover the guard of a poisoned lock; no invariant spans a panic here
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
