//! Timed command queue.
//!
//! Entries are scheduled against an injected [`Clock`] and dispatched by a
//! periodic tick. Two modes:
//!
//! - [`SendMode::Burst`]: every due entry starts on the tick that finds it
//!   due, independent of any other entry.
//! - [`SendMode::InOrder`]: entries sharing an ordering group run one at a
//!   time in `(time, insertion)` order; the next one starts only after the
//!   previous one has settled. Entries without a group behave as in burst
//!   mode. Different groups never wait on each other.
//!
//! Executor failures (including panics) are reported on the event channel
//! and never stop the queue or leave a group locked.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Time};
use crate::task::PeriodicTask;

/// Capacity of the queue event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Error type returned by queued executors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identifier of a queued entry, unique per queue.
pub type EntryId = u64;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Execution mode, fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    /// All due entries start immediately and independently.
    #[default]
    Burst,
    /// Entries of the same ordering group run strictly one after another.
    InOrder,
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue '{0}' has been disposed")]
    Disposed(String),
}

/// Queue timing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often the driver checks for due entries.
    pub tick_interval_ms: u64,
    /// Entries starting later than this after their planned time are
    /// reported as late.
    pub late_threshold_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            late_threshold_ms: 100,
        }
    }
}

impl QueueConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Timing of one completed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub id: EntryId,
    pub group: Option<String>,
    pub planned: Time,
    pub started: Time,
    pub finished: Time,
}

/// Notifications about dispatched entries.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Entry completed successfully.
    Executed(ExecutionReport),
    /// Entry started later than the configured threshold.
    Late {
        id: EntryId,
        planned: Time,
        started: Time,
    },
    /// Entry's executor returned an error or panicked.
    Failed {
        id: EntryId,
        group: Option<String>,
        planned: Time,
        error: String,
    },
}

/// A not-yet-dispatched entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub time: Time,
    pub group: Option<String>,
}

struct QueueEntry {
    id: EntryId,
    time: Time,
    group: Option<String>,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<(Time, EntryId), QueueEntry>,
    busy_groups: HashSet<String>,
    next_id: EntryId,
    disposed: bool,
}

/// Shared between the queue handle, its driver and in-flight entries.
struct QueueCore {
    name: String,
    mode: SendMode,
    late_threshold: Time,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    wake: Arc<Notify>,
}

impl QueueCore {
    async fn tick(self: &Arc<Self>) -> usize {
        let now = self.clock.now();

        let due = {
            let mut state = self.state.lock().await;
            if state.disposed {
                return 0;
            }

            let keys: Vec<(Time, EntryId)> = state
                .entries
                .range(..=(now, EntryId::MAX))
                .map(|(key, _)| *key)
                .collect();

            let mut due = Vec::with_capacity(keys.len());
            for key in keys {
                let blocked = match (self.mode, state.entries.get(&key).and_then(|e| e.group.as_ref())) {
                    (SendMode::InOrder, Some(group)) => state.busy_groups.contains(group),
                    _ => false,
                };
                if blocked {
                    continue;
                }
                if let Some(entry) = state.entries.remove(&key) {
                    if let (SendMode::InOrder, Some(group)) = (self.mode, &entry.group) {
                        state.busy_groups.insert(group.clone());
                    }
                    due.push(entry);
                }
            }
            due
        };

        let count = due.len();
        for entry in due {
            self.dispatch(entry);
        }
        count
    }

    fn dispatch(self: &Arc<Self>, entry: QueueEntry) {
        let core = self.clone();
        let QueueEntry {
            id,
            time: planned,
            group,
            job,
        } = entry;

        tokio::spawn(async move {
            let started = core.clock.now();
            if started - planned > core.late_threshold {
                warn!(
                    queue = %core.name,
                    id,
                    planned,
                    started,
                    delay = started - planned,
                    "Queued entry started late"
                );
                let _ = core.events.send(QueueEvent::Late {
                    id,
                    planned,
                    started,
                });
            }

            // Run in its own task so a panicking executor is caught here
            // instead of leaving the group locked.
            let outcome = tokio::spawn(job()).await;
            let finished = core.clock.now();

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_error) => Some(format!("executor panicked: {}", join_error)),
            };

            match failure {
                None => {
                    debug!(queue = %core.name, id, planned, started, finished, "Queued entry executed");
                    let _ = core.events.send(QueueEvent::Executed(ExecutionReport {
                        id,
                        group: group.clone(),
                        planned,
                        started,
                        finished,
                    }));
                }
                Some(error) => {
                    error!(queue = %core.name, id, planned, group = ?group, error = %error, "Queued entry failed");
                    let _ = core.events.send(QueueEvent::Failed {
                        id,
                        group: group.clone(),
                        planned,
                        error,
                    });
                }
            }

            if let (SendMode::InOrder, Some(group)) = (core.mode, group) {
                core.state.lock().await.busy_groups.remove(&group);
                core.wake.notify_one();
            }
        });
    }
}

/// Virtual-clock driven command queue. One per device.
pub struct TimedQueue {
    core: Arc<QueueCore>,
    tick_interval: Duration,
    driver: Mutex<Option<PeriodicTask>>,
}

impl TimedQueue {
    /// Create a queue. Nothing runs until [`TimedQueue::start`] is called or
    /// [`TimedQueue::tick`] is driven by hand.
    pub fn new(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        mode: SendMode,
        config: &QueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(QueueCore {
                name: name.into(),
                mode,
                late_threshold: config.late_threshold_ms,
                clock,
                state: Mutex::new(QueueState::default()),
                events,
                wake: Arc::new(Notify::new()),
            }),
            tick_interval: config.tick_interval(),
            driver: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn mode(&self) -> SendMode {
        self.core.mode
    }

    /// Start the periodic driver. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut driver = self.driver.lock().await;
        if driver.as_ref().is_some_and(|d| d.is_running()) {
            return;
        }

        let core = self.core.clone();
        *driver = Some(PeriodicTask::spawn_with_waker(
            "timed-queue",
            self.tick_interval,
            self.core.wake.clone(),
            move || {
                let core = core.clone();
                async move {
                    core.tick().await;
                }
            },
        ));

        info!(
            queue = %self.core.name,
            mode = ?self.core.mode,
            tick_interval = ?self.tick_interval,
            "Timed queue started"
        );
    }

    /// Dispatch every entry whose time has passed. Returns how many started.
    pub async fn tick(&self) -> usize {
        self.core.tick().await
    }

    /// Schedule `executor(arg)` at `time`. Past-due entries run on the next tick.
    pub async fn enqueue<A, F, Fut>(
        &self,
        time: Time,
        group: Option<String>,
        executor: F,
        arg: A,
    ) -> Result<EntryId, QueueError>
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let job: Job = Box::new(move || Box::pin(executor(arg)));

        let mut state = self.core.state.lock().await;
        if state.disposed {
            return Err(QueueError::Disposed(self.core.name.clone()));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            (time, id),
            QueueEntry {
                id,
                time,
                group,
                job,
            },
        );
        Ok(id)
    }

    /// Drop every pending entry scheduled strictly after `time`.
    pub async fn cancel_after(&self, time: Time) -> usize {
        self.retain(|t| t <= time).await
    }

    /// Drop every pending entry scheduled at or after `time`.
    pub async fn cancel_from_now_on(&self, time: Time) -> usize {
        self.retain(|t| t < time).await
    }

    /// Drop every pending entry.
    pub async fn clear(&self) -> usize {
        self.retain(|_| false).await
    }

    async fn retain(&self, keep: impl Fn(Time) -> bool) -> usize {
        let mut state = self.core.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|(time, _), _| keep(*time));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(queue = %self.core.name, removed, "Cancelled pending entries");
        }
        removed
    }

    /// Stop the driver and drop everything pending. Later enqueues fail.
    pub async fn dispose(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            driver.stop();
        }
        let mut state = self.core.state.lock().await;
        state.disposed = true;
        state.entries.clear();
        info!(queue = %self.core.name, "Timed queue disposed");
    }

    pub async fn len(&self) -> usize {
        self.core.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pending entries in dispatch order.
    pub async fn pending(&self) -> Vec<PendingEntry> {
        self.core
            .state
            .lock()
            .await
            .entries
            .values()
            .map(|e| PendingEntry {
                id: e.id,
                time: e.time,
                group: e.group.clone(),
            })
            .collect()
    }

    /// Subscribe to execution, lateness and failure notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.events.subscribe()
    }
}
