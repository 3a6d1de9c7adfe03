//! Per-client concurrency limit on simultaneous tool invocations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Tracked clients at which idle entries are swept before adding another.
const PRUNE_AT: usize = 1024;

/// One semaphore per client id, created on first use and dropped again
/// once idle.
#[derive(Debug)]
pub struct ClientLimiter {
    permits_per_client: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ClientLimiter {
    pub fn new(permits_per_client: usize) -> Self {
        Self {
            permits_per_client: permits_per_client.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub fn permits_per_client(&self) -> usize {
        self.permits_per_client
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        self.semaphores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn semaphore(&self, client_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self.lock();
        if semaphores.len() >= PRUNE_AT && !semaphores.contains_key(client_id) {
            retain_busy(&mut semaphores);
        }
        semaphores
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_client)))
            .clone()
    }

    /// Wait for a slot. The permit is released when dropped.
    pub async fn acquire(&self, client_id: &str) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore(client_id).acquire_owned().await
    }

    /// Free slots for a client right now.
    pub fn available(&self, client_id: &str) -> usize {
        self.lock()
            .get(client_id)
            .map_or(self.permits_per_client, |s| s.available_permits())
    }

    /// Drop clients with no permit held and nobody waiting. Returns how
    /// many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut semaphores = self.lock();
        let before = semaphores.len();
        retain_busy(&mut semaphores);
        before - semaphores.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }
}

/// Held permits and queued waiters each keep a clone of the semaphore, so
/// a map entry that is the only reference is idle.
fn retain_busy(semaphores: &mut HashMap<String, Arc<Semaphore>>) {
    semaphores.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
}

impl Default for ClientLimiter {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clients_are_limited_independently() {
        let limiter = ClientLimiter::new(1);
        let held = limiter.acquire("a").await.unwrap();
        assert_eq!(limiter.available("a"), 0);
        assert_eq!(limiter.available("b"), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(20), limiter.acquire("a")).await;
        assert!(blocked.is_err());

        let _other = limiter.acquire("b").await.unwrap();
        drop(held);
        assert_eq!(limiter.available("a"), 1);
    }

    #[tokio::test]
    async fn idle_clients_are_pruned() {
        let limiter = ClientLimiter::new(2);
        let held = limiter.acquire("busy").await.unwrap();
        drop(limiter.acquire("idle-1").await.unwrap());
        drop(limiter.acquire("idle-2").await.unwrap());
        assert_eq!(limiter.tracked_clients(), 3);

        assert_eq!(limiter.prune_idle(), 2);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.available("busy"), 1);
        // unknown clients report a full set of slots without being tracked
        assert_eq!(limiter.available("idle-1"), 2);
        assert_eq!(limiter.tracked_clients(), 1);

        drop(held);
        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn map_stays_bounded_under_many_clients() {
        let limiter = ClientLimiter::new(1);
        for i in 0..(PRUNE_AT * 3) {
            drop(limiter.acquire(&format!("client-{i}")).await.unwrap());
        }
        assert!(limiter.tracked_clients() <= PRUNE_AT);
    }

    #[test]
    fn zero_is_raised_to_one() {
        assert_eq!(ClientLimiter::new(0).permits_per_client(), 1);
    }
}
