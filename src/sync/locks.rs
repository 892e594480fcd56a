//! Per-feed exclusivity for refreshes and read-state changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per feed id, created on first use.
///
/// Holding a feed's guard means no other task refreshes that feed or
/// changes its articles' read state until the guard drops. Different feeds
/// never contend.
#[derive(Debug, Clone, Default)]
pub struct FeedLocks {
    locks: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl FeedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `feed_id`.
    pub async fn lock(&self, feed_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            // The map is only touched briefly and never across an await
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(feed_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of a deleted feed.
    pub fn forget(&self, feed_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(&feed_id);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
