//! Fixed-size admission pool for relay tasks.
//!
//! Each admitted task holds one semaphore permit for its whole lifetime.
//! Admission never waits: when every permit is taken the submission is
//! rejected and the caller sheds the connection.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::PoolError;

/// Multiplier applied to the CPU count; relays spend their time blocked on I/O.
pub const RELAY_POOL_SCALE: usize = 6;

/// Default pool size: visible CPU cores times [`RELAY_POOL_SCALE`].
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    cores * RELAY_POOL_SCALE
}

/// Bounded pool of concurrently running relay tasks.
#[derive(Debug)]
pub struct WorkerPool {
    /// One permit per worker slot.
    permits: Arc<Semaphore>,
    /// Number of worker slots.
    size: usize,
    /// Set once the pool stops admitting work.
    shut_down: AtomicBool,
    /// Woken each time a task gives its slot back.
    released: Arc<Notify>,
}

/// Holds a worker slot for one running task.
struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Return the permit before waking waiters so they see the new count.
        drop(self.permit.take());
        self.released.notify_waiters();
    }
}

impl WorkerPool {
    /// Create a pool with `size` worker slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        info!(pool_size = size, "Relay worker pool created");

        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            shut_down: AtomicBool::new(false),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks currently running.
    pub fn active(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Start `task` if a worker slot is free.
    ///
    /// The task is dropped unstarted on rejection.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| PoolError::Saturated { size: self.size })?;

        let slot = Slot {
            permit: Some(permit),
            released: Arc::clone(&self.released),
        };

        tokio::spawn(async move {
            let _slot = slot;
            task.await;
        });

        Ok(())
    }

    /// Stop admitting new tasks. Running tasks are left to finish.
    ///
    /// Returns `false` if the pool was already shut down.
    pub fn shutdown(&self) -> bool {
        let first = !self.shut_down.swap(true, Ordering::AcqRel);
        if first {
            debug!(active = self.active(), "Relay worker pool shut down");
        }
        first
    }

    /// Wait until no task is running.
    ///
    /// Takes no worker slots, so the pool keeps admitting work while this
    /// waits unless it was shut down.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            released.await;
        }
    }

    /// Wait until no task is running or `timeout` elapses.
    ///
    /// Returns `true` if the pool became idle in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn test_default_pool_size_scales_cores() {
        let size = default_pool_size();
        assert!(size >= RELAY_POOL_SCALE);
        assert_eq!(size % RELAY_POOL_SCALE, 0);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (other_tx, other_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .unwrap();
        pool.submit(async move {
            let _ = other_rx.await;
        })
        .unwrap();

        assert_eq!(pool.active(), 2);
        assert_eq!(
            pool.submit(async {}),
            Err(PoolError::Saturated { size: 2 })
        );

        release_tx.send(()).unwrap();
        other_tx.send(()).unwrap();
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(pool.active(), 0);

        // Slots freed by finished tasks are reusable.
        pool.submit(async {}).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_but_lets_running_tasks_finish() {
        let pool = WorkerPool::new(4);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
            let _ = done_tx.send(());
        })
        .unwrap();

        assert!(pool.shutdown());
        assert!(!pool.shutdown());
        assert_eq!(pool.submit(async {}), Err(PoolError::ShutDown));

        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        assert!(pool.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_drain_leaves_slots_to_new_work() {
        let pool = Arc::new(WorkerPool::new(2));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = release_rx.await;
        })
        .unwrap();

        let draining = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.drain(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!draining.is_finished());
        assert_eq!(pool.active(), 1);

        let (other_tx, other_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = other_rx.await;
        })
        .unwrap();
        assert_eq!(pool.active(), 2);

        release_tx.send(()).unwrap();
        other_tx.send(()).unwrap();
        assert!(draining.await.unwrap());
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_drain_times_out_while_busy() {
        let pool = WorkerPool::new(1);
        let (_hold_tx, hold_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = hold_rx.await;
        })
        .unwrap();

        assert!(!pool.drain(Duration::from_millis(50)).await);
    }
}
