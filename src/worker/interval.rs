use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_NEXT_TICK: Duration = Duration::from_millis(30_000);
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_millis(300_000);

/// One unit of periodic work driven by [`IntervalWorker`].
#[async_trait]
pub trait IntervalTask: Send {
    fn name(&self) -> String;

    /// Runs once before the first tick.
    async fn prepare(&mut self) -> eyre::Result<()> {
        Ok(())
    }

    async fn do_process(&mut self) -> eyre::Result<()>;

    /// Delay before the next tick. Read after every tick.
    fn next_tick(&self) -> Duration {
        DEFAULT_NEXT_TICK
    }

    fn processing_timeout(&self) -> Duration {
        DEFAULT_PROCESSING_TIMEOUT
    }
}

/// Called with the task name when a tick overruns its processing timeout.
pub type WatchdogAction = Arc<dyn Fn(&str) + Send + Sync>;

fn exit_process(name: &str) {
    tracing::error!(worker = name, "Processing timeout exceeded, exiting for supervisor restart");
    std::process::exit(1);
}

/// Runs a task's ticks strictly one after another.
///
/// A failed tick is logged and retried after the normal delay. A tick that
/// overruns the processing timeout triggers the watchdog action, which by
/// default terminates the process.
pub struct IntervalWorker<T> {
    task: Mutex<T>,
    started: AtomicBool,
    on_watchdog: WatchdogAction,
}

impl<T: IntervalTask> IntervalWorker<T> {
    pub fn new(task: T) -> Self {
        Self {
            task: Mutex::new(task),
            started: AtomicBool::new(false),
            on_watchdog: Arc::new(exit_process),
        }
    }

    pub fn with_watchdog(mut self, action: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_watchdog = Arc::new(action);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run until `shutdown` is cancelled. Calling it again while started is a no-op.
    pub async fn start(&self, shutdown: CancellationToken) -> eyre::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            let name = match self.task.try_lock() {
                Ok(task) => task.name(),
                Err(_) => "worker".to_string(),
            };
            tracing::warn!(worker = %name, "Trying to start processor twice");
            return Ok(());
        }

        let mut task = self.task.lock().await;
        let name = task.name();
        task.prepare().await?;
        tracing::info!(worker = %name, "Worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let timeout = task.processing_timeout();
            match tokio::time::timeout(timeout, task.do_process()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(worker = %name, error = %e, "Tick failed");
                }
                Err(_) => {
                    (self.on_watchdog)(&name);
                    return Err(eyre::eyre!(
                        "{} exceeded processing timeout of {}ms",
                        name,
                        timeout.as_millis()
                    ));
                }
            }

            let wait = task.next_tick();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(worker = %name, "Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        ticks: Arc<AtomicUsize>,
        prepared: Arc<AtomicUsize>,
        fail_first: bool,
        hang: bool,
        stop_after: usize,
        shutdown: CancellationToken,
    }

    impl CountingTask {
        fn new(shutdown: CancellationToken) -> Self {
            Self {
                ticks: Arc::new(AtomicUsize::new(0)),
                prepared: Arc::new(AtomicUsize::new(0)),
                fail_first: false,
                hang: false,
                stop_after: 3,
                shutdown,
            }
        }
    }

    #[async_trait]
    impl IntervalTask for CountingTask {
        fn name(&self) -> String {
            "counting".to_string()
        }

        async fn prepare(&mut self) -> eyre::Result<()> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn do_process(&mut self) -> eyre::Result<()> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if tick >= self.stop_after {
                self.shutdown.cancel();
            }
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_first && tick == 1 {
                return Err(eyre::eyre!("boom"));
            }
            Ok(())
        }

        fn next_tick(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn processing_timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    #[tokio::test]
    async fn test_ticks_until_shutdown() {
        let shutdown = CancellationToken::new();
        let task = CountingTask::new(shutdown.clone());
        let (ticks, prepared) = (task.ticks.clone(), task.prepared.clone());
        let worker = IntervalWorker::new(task);

        worker.start(shutdown).await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_tick_is_retried() {
        let shutdown = CancellationToken::new();
        let mut task = CountingTask::new(shutdown.clone());
        task.fail_first = true;
        let ticks = task.ticks.clone();
        let worker = IntervalWorker::new(task);

        worker.start(shutdown).await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let shutdown = CancellationToken::new();
        let mut task = CountingTask::new(shutdown.clone());
        task.stop_after = usize::MAX;
        let prepared = task.prepared.clone();
        let worker = Arc::new(IntervalWorker::new(task));

        let running = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.start(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.start(shutdown.clone()).await.unwrap();
        assert!(worker.is_started());

        shutdown.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_fires_on_hung_tick() {
        let shutdown = CancellationToken::new();
        let mut task = CountingTask::new(shutdown.clone());
        task.hang = true;
        task.stop_after = usize::MAX;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let worker = IntervalWorker::new(task).with_watchdog(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(worker.start(shutdown).await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
