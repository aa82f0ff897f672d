//! Per-user serialization of message handling.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async lock per user id. Holding the guard means the user's previous
/// request has finished.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(user_id).or_default().clone()
    }

    /// Lock the user, or `None` if a request for them is still running.
    pub async fn try_acquire(&self, user_id: i64) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(user_id).await.try_lock_owned().ok()
    }

    /// Wait until the user is free.
    pub async fn acquire(&self, user_id: i64) -> OwnedMutexGuard<()> {
        self.lock_for(user_id).await.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_second_request_is_refused_while_busy() {
        let locks = UserLocks::new();
        let guard = locks.try_acquire(1).await.expect("first acquire");

        assert!(locks.try_acquire(1).await.is_none());
        // Other users are unaffected
        assert!(locks.try_acquire(2).await.is_some());

        drop(guard);
        assert!(locks.try_acquire(1).await.is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = Arc::new(UserLocks::new());
        let guard = locks.acquire(7).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(7).await;
            })
        };

        sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
