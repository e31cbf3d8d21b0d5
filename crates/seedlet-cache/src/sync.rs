//! Shared cache-sync flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once the initial cache sync finished; read by the readiness probe
#[derive(Clone, Debug, Default)]
pub struct SyncStatus(Arc<AtomicBool>);

impl SyncStatus {
    /// True once every started informer has synced
    pub fn is_synced(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Record that the initial sync finished
    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::Release);
    }
}
