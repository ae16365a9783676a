//! TaskDispatcher - bounded pool for device operations
//!
//! `submit` only spawns; the spawned task waits for one of `pool_size`
//! semaphore permits before running the operation. Errors and panics are
//! logged at this boundary and never take the pool down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use devmgr_core::prelude::*;

/// Default concurrency ceiling
pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl TaskDispatcher {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Permits not currently held by a running operation
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue `operation`. Never blocks the caller.
    pub fn submit<F>(&self, name: impl Into<String>, operation: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let name = name.into();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!("Dispatcher closed, dropping task '{}'", name);
                return;
            };

            trace!("Task '{}' started", name);
            match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(Ok(())) => trace!("Task '{}' finished", name),
                Ok(Err(e)) => log_failure(&name, &e),
                Err(panic) => error!("Task '{}' panicked: {}", name, panic_message(&*panic)),
            }
        })
    }

    /// Stop accepting work. Queued operations that have not started are dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// Device-level failures are expected now and then; anything else is a bug
fn failure_level(e: &Error) -> tracing::Level {
    if e.is_recoverable() {
        tracing::Level::WARN
    } else {
        tracing::Level::ERROR
    }
}

fn log_failure(name: &str, e: &Error) {
    if failure_level(e) == tracing::Level::WARN {
        warn!("Task '{}' failed: {}", name, e);
    } else {
        error!("Task '{}' failed: {}", name, e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let dispatcher = TaskDispatcher::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                dispatcher.submit(format!("op-{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), Error>(())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(dispatcher.available(), 3);
    }

    fn ran_before_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn test_panic_and_error_do_not_poison_pool() {
        let dispatcher = TaskDispatcher::new(1);

        dispatcher
            .submit("panics", async {
                if ran_before_panic() {
                    panic!("device exploded");
                }
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
        dispatcher
            .submit("fails", async { Err::<(), Error>(Error::transport("no route")) })
            .await
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        dispatcher
            .submit("works", async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            })
            .await
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.available(), 1);
    }

    #[test]
    fn test_failure_level_follows_recoverability() {
        assert_eq!(failure_level(&Error::transport("offline")), tracing::Level::WARN);
        assert_eq!(failure_level(&Error::device_not_found("S1")), tracing::Level::WARN);
        assert_eq!(failure_level(&Error::AdbNotFound), tracing::Level::ERROR);
        assert_eq!(failure_level(&Error::config("bad toml")), tracing::Level::ERROR);
    }

    #[tokio::test]
    async fn test_submit_does_not_wait_for_slow_operation() {
        let dispatcher = TaskDispatcher::new(1);
        let _slow = dispatcher.submit("slow", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), Error>(())
        });

        let started = std::time::Instant::now();
        let _queued = dispatcher.submit("queued", async { Ok::<(), Error>(()) });
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_closed_dispatcher_drops_work() {
        let dispatcher = TaskDispatcher::new(2);
        dispatcher.close();
        assert!(dispatcher.is_closed());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        dispatcher
            .submit("dropped", async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
