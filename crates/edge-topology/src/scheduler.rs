//! Periodic task runner.
//!
//! Sweeps, re-evaluation and relay probing are expressed as
//! [`ScheduledTask`]s so tests can drive them directly with a fixed time and
//! the daemon can run them on tokio intervals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;

/// A unit of periodic work.
pub trait ScheduledTask: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// How often the task runs.
    fn interval(&self) -> Duration;

    /// Runs the task once at `now`.
    fn run(&self, now: DateTime<Utc>) -> BoxFuture<'_, ()>;
}

/// Collects tasks and starts them.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    tasks: Vec<Arc<dyn ScheduledTask>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.tasks.iter().map(|t| t.name()).collect();
        f.debug_struct("Scheduler").field("tasks", &names).finish()
    }
}

impl Scheduler {
    /// Creates a scheduler reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Vec::new(),
        }
    }

    /// Adds a task.
    #[must_use]
    pub fn with_task(mut self, task: Arc<dyn ScheduledTask>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no tasks were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task once, in insertion order.
    pub async fn run_once(&self) {
        let now = self.clock.now();
        for task in &self.tasks {
            task.run(now).await;
        }
    }

    /// Spawns one tokio loop per task. The first run happens immediately.
    pub fn start(self) -> SchedulerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));

        let handles = self
            .tasks
            .into_iter()
            .map(|task| {
                let running = Arc::clone(&running);
                let ticks = Arc::clone(&ticks);
                let clock = Arc::clone(&self.clock);
                info!(task = task.name(), interval = ?task.interval(), "Starting scheduled task");

                tokio::spawn(async move {
                    let mut timer = tokio::time::interval(task.interval());
                    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                    while running.load(Ordering::SeqCst) {
                        timer.tick().await;
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!(task = task.name(), "Running scheduled task");
                        task.run(clock.now()).await;
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        SchedulerHandle {
            running,
            ticks,
            handles,
        }
    }
}

/// Controls running scheduled tasks.
#[derive(Debug)]
pub struct SchedulerHandle {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Returns true until [`stop`](Self::stop) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total task runs completed across all tasks.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Stops all tasks and waits for them to exit.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles {
            handle.abort();
            // Aborted tasks report a cancellation error.
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<DateTime<Utc>>>,
    }

    impl ScheduledTask for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(10)
        }

        fn run(&self, now: DateTime<Utc>) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.seen.lock().push(now);
            })
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_run_once_uses_clock() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let task = recorder();
        let scheduler = Scheduler::new(clock.clone()).with_task(task.clone());

        scheduler.run_once().await;
        clock.advance(Duration::from_secs(60));
        scheduler.run_once().await;

        assert_eq!(
            *task.seen.lock(),
            vec![start, start + chrono::Duration::seconds(60)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ticks_and_stops() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let task = recorder();
        let handle = Scheduler::new(clock).with_task(task.clone()).start();
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.ticks(), 3);
        assert_eq!(task.seen.lock().len(), 3);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(task.seen.lock().len(), 3);
    }

    #[test]
    fn test_empty_scheduler() {
        let scheduler = Scheduler::new(Arc::new(ManualClock::new(Utc::now())));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.len(), 0);
    }
}
