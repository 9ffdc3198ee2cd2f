// Scheduled executor for periodic control loops (monitoring, pruning).
// Adapted for the tokio runtime; drift-free absolute scheduling.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A task that runs periodically until shut down.
pub trait ScheduledTask: Send + Sync + 'static {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;

    /// Self-termination hook; default runs forever.
    fn should_terminate(&self) -> bool {
        false
    }
}

impl<T: ScheduledTask> ScheduledTask for Arc<T> {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        (**self).run()
    }

    fn should_terminate(&self) -> bool {
        (**self).should_terminate()
    }
}

/// Handle to stop a running executor from the outside.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// Runs one [`ScheduledTask`] on a fixed interval. Failures are logged and
/// the schedule keeps going.
pub struct ScheduledExecutor {
    interval: Duration,
    task_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { flag: Arc::clone(&self.shutdown) }
    }

    /// Drive the task until shutdown or self-termination. Intended to be
    /// spawned: `tokio::spawn(executor.start(task))`.
    pub async fn start<T>(self, task: T)
    where
        T: ScheduledTask,
    {
        let interval_ms = self.interval.as_millis() as i64;
        tracing::info!("scheduled task '{}' starting, interval {:?}", self.task_name, self.interval);

        let mut next_run = Utc::now().timestamp_millis() + interval_ms;

        loop {
            if self.shutdown.load(Ordering::Relaxed) || task.should_terminate() {
                break;
            }

            let now = Utc::now().timestamp_millis();
            if now >= next_run {
                if let Err(e) = task.run().await {
                    tracing::error!("scheduled task '{}' failed: {:#}", self.task_name, e);
                }
                next_run = Utc::now().timestamp_millis() + interval_ms;
            }

            let wait_ms = next_run.saturating_sub(Utc::now().timestamp_millis());
            if wait_ms > 0 {
                // Wake at least once a second so shutdown is prompt.
                sleep(Duration::from_millis(wait_ms.min(1_000) as u64)).await;
            }
        }

        tracing::info!("scheduled task '{}' stopped", self.task_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingTask {
        counter: Arc<AtomicU32>,
        max_runs: u32,
    }

    impl ScheduledTask for CountingTask {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            Box::pin(async move {
                self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }

        fn should_terminate(&self) -> bool {
            self.counter.load(Ordering::Relaxed) >= self.max_runs
        }
    }

    #[tokio::test]
    async fn executor_runs_until_termination() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = CountingTask { counter: Arc::clone(&counter), max_runs: 3 };

        ScheduledExecutor::new("test", Duration::from_millis(20)).start(task).await;

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn shutdown_handle_stops_the_loop() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = CountingTask { counter: Arc::clone(&counter), max_runs: u32::MAX };

        let executor = ScheduledExecutor::new("test-shutdown", Duration::from_millis(10));
        let handle = executor.shutdown_handle();
        let join = tokio::spawn(executor.start(task));

        sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        join.await.expect("executor exits");

        assert!(counter.load(Ordering::Relaxed) >= 1);
    }
}
