//! Owned periodic background tasks.
//!
//! Queue drivers, health probes and resend loops all run on a `PeriodicTask`.
//! The owner holds the handle; stopping it (or dropping it) ends the loop.
//! Restarting is stop + spawn a new one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::{Clock, Time};

/// How often a clock-driven task checks whether its step is due.
const CLOCK_POLL: Duration = Duration::from_millis(10);

/// Handle to a spawned periodic task.
pub struct PeriodicTask {
    name: &'static str,
    cancel: watch::Sender<bool>,
    wake: Arc<Notify>,
}

impl PeriodicTask {
    /// Spawn `step` every `period`.
    ///
    /// The first run happens after one full period. Steps never overlap; a
    /// step that overruns delays the following ones.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, step: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_inner(name, period, false, Arc::new(Notify::new()), step)
    }

    /// Like [`PeriodicTask::spawn`] but also runs a step whenever `wake` is
    /// notified, e.g. by work completing elsewhere.
    pub fn spawn_with_waker<F, Fut>(
        name: &'static str,
        period: Duration,
        wake: Arc<Notify>,
        step: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_inner(name, period, false, wake, step)
    }

    /// Like [`PeriodicTask::spawn`] but runs the first step immediately.
    pub fn spawn_immediate<F, Fut>(name: &'static str, period: Duration, step: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_inner(name, period, true, Arc::new(Notify::new()), step)
    }

    /// Spawn `step` every `period` milliseconds of `clock` time.
    ///
    /// The loop polls the clock, so a simulated or manually stepped clock
    /// decides when steps run. Falling behind by more than one period skips
    /// the missed steps.
    pub fn spawn_on_clock<F, Fut>(
        name: &'static str,
        clock: Arc<dyn Clock>,
        period: Time,
        mut step: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(1);
        let mut due = clock.now().saturating_add(period);

        Self::spawn_inner(name, CLOCK_POLL, false, Arc::new(Notify::new()), move || {
            let now = clock.now();
            let run = (now >= due).then(|| {
                due = due.saturating_add(period);
                if due <= now {
                    due = now.saturating_add(period);
                }
                step()
            });
            async move {
                if let Some(run) = run {
                    run.await;
                }
            }
        })
    }

    fn spawn_inner<F, Fut>(
        name: &'static str,
        period: Duration,
        immediate: bool,
        wake: Arc<Notify>,
        mut step: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let task_wake = wake.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                // interval() completes its first tick immediately
                ticker.tick().await;
            }
            debug!(task = name, period = ?period, "Periodic task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_wake.notified() => {}
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *cancel_rx.borrow() {
                    break;
                }
                step().await;
            }

            info!(task = name, "Periodic task stopped");
        });

        Self {
            name,
            cancel: cancel_tx,
            wake,
        }
    }

    /// Run the next step now instead of waiting for the period.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Signal the task to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_running(&self) -> bool {
        !*self.cancel.borrow() && !self.cancel.is_closed()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_task(immediate: bool) -> (PeriodicTask, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let step = move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        };
        let task = if immediate {
            PeriodicTask::spawn_immediate("test", Duration::from_millis(100), step)
        } else {
            PeriodicTask::spawn("test", Duration::from_millis(100), step)
        };
        (task, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_period() {
        let (_task, count) = counting_task(false);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_runs_first_step_right_away() {
        let (_task, count) = counting_task(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_loop() {
        let (task, count) = counting_task(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        task.stop();
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_driven_task_follows_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _task = PeriodicTask::spawn_on_clock("test", clock.clone(), 100, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Runtime time passing alone does nothing
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        clock.set(100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A jump over several periods runs once and resumes from there
        clock.set(1_000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        clock.set(1_099);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        clock.set(1_100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_runs_step_early() {
        let (task, count) = counting_task(false);
        task.wake();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
