//! Timed queue step definitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cucumber::{given, then, when, World};
use tokio::sync::oneshot;

use onair::clock::{Clock, ManualClock};
use onair::queue::{QueueConfig, SendMode, TimedQueue};

/// Labels of entries that started and finished, in order.
#[derive(Debug, Default)]
struct Runs {
    started: Vec<String>,
    finished: Vec<String>,
}

#[derive(World)]
#[world(init = Self::new)]
pub struct QueueWorld {
    clock: Arc<ManualClock>,
    queue: Option<TimedQueue>,
    runs: Arc<StdMutex<Runs>>,
    gates: HashMap<String, oneshot::Sender<()>>,
}

impl std::fmt::Debug for QueueWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorld")
            .field("now", &self.clock.now())
            .field("runs", &self.runs)
            .finish()
    }
}

impl QueueWorld {
    fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new(0)),
            queue: None,
            runs: Arc::new(StdMutex::new(Runs::default())),
            gates: HashMap::new(),
        }
    }

    fn queue(&self) -> &TimedQueue {
        self.queue.as_ref().expect("Queue not created")
    }

    fn create(&mut self, mode: SendMode) {
        let clock: Arc<dyn Clock> = self.clock.clone();
        self.queue = Some(TimedQueue::new("scenario", clock, mode, &QueueConfig::default()));
    }

    async fn schedule(&mut self, label: String, group: Option<String>, time: i64, blocking: bool) {
        let gate = if blocking {
            let (tx, rx) = oneshot::channel::<()>();
            self.gates.insert(label.clone(), tx);
            Some(rx)
        } else {
            None
        };

        let runs = self.runs.clone();
        self.queue()
            .enqueue(
                time,
                group,
                move |label: String| async move {
                    runs.lock().unwrap().started.push(label.clone());
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    runs.lock().unwrap().finished.push(label);
                    Ok(())
                },
                label,
            )
            .await
            .expect("enqueue failed");
    }

    fn started(&self, label: &str) -> bool {
        self.runs.lock().unwrap().started.iter().any(|l| l == label)
    }

    fn finished(&self, label: &str) -> bool {
        self.runs.lock().unwrap().finished.iter().any(|l| l == label)
    }
}

/// Give dispatched entries a moment to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[given("a burst queue")]
async fn given_burst_queue(world: &mut QueueWorld) {
    world.create(SendMode::Burst);
}

#[given("an ordered queue")]
async fn given_ordered_queue(world: &mut QueueWorld) {
    world.create(SendMode::InOrder);
}

#[given(expr = "an entry {string} scheduled at {int}")]
async fn given_entry(world: &mut QueueWorld, label: String, time: i64) {
    world.schedule(label, None, time, false).await;
}

#[when(expr = "an entry {string} scheduled at {int}")]
async fn when_entry(world: &mut QueueWorld, label: String, time: i64) {
    world.schedule(label, None, time, false).await;
}

#[given(expr = "an entry {string} in group {string} scheduled at {int}")]
async fn given_grouped_entry(world: &mut QueueWorld, label: String, group: String, time: i64) {
    world.schedule(label, Some(group), time, false).await;
}

#[given(expr = "a blocking entry {string} in group {string} scheduled at {int}")]
async fn given_blocking_entry(world: &mut QueueWorld, label: String, group: String, time: i64) {
    world.schedule(label, Some(group), time, true).await;
}

#[when(expr = "the queue is cancelled from {int} on")]
async fn when_cancelled(world: &mut QueueWorld, time: i64) {
    world.queue().cancel_from_now_on(time).await;
}

#[when(expr = "the clock reaches {int}")]
async fn when_clock_reaches(world: &mut QueueWorld, time: i64) {
    world.clock.set(time);
    world.queue().tick().await;
    settle().await;
}

#[when(expr = "{string} is released")]
async fn when_released(world: &mut QueueWorld, label: String) {
    let gate = world.gates.remove(&label).expect("no such blocking entry");
    let _ = gate.send(());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !world.finished(&label) {
        assert!(tokio::time::Instant::now() < deadline, "{} never finished", label);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    settle().await;
}

#[then(expr = "the queue holds {int} entry")]
async fn then_queue_holds(world: &mut QueueWorld, count: usize) {
    assert_eq!(world.queue().len().await, count);
}

#[then(expr = "only {string} has run")]
async fn then_only_run(world: &mut QueueWorld, label: String) {
    assert_eq!(world.runs.lock().unwrap().finished, vec![label]);
}

#[then(expr = "{string} has started")]
async fn then_started(world: &mut QueueWorld, label: String) {
    assert!(world.started(&label), "{} has not started", label);
}

#[then(expr = "{string} has not started")]
async fn then_not_started(world: &mut QueueWorld, label: String) {
    assert!(!world.started(&label), "{} started early", label);
}

#[then(expr = "{string} has run")]
async fn then_has_run(world: &mut QueueWorld, label: String) {
    assert!(world.finished(&label), "{} has not run", label);
}
