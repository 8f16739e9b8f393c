//! Device runner step definitions.
//!
//! These run on the real clock with short retry and probe intervals, so
//! "eventually" steps poll until a deadline.

use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when, World};
use serde_json::json;
use tokio::sync::broadcast;

use onair::clock::{Clock, TokioClock};
use onair::device::simulated::SimulatedConnection;
use onair::events::DeviceEvent;
use onair::executor::RetryConfig;
use onair::integrations::hyperdeck::{HyperdeckCommand, HyperdeckDiffer, HyperdeckState};
use onair::monitor::MonitorConfig;
use onair::{Conductor, DeviceSettings, LayerObject, Mapping, Mappings, Snapshot};

const DEVICE_ID: &str = "deck1";

type Deck = SimulatedConnection<HyperdeckCommand, HyperdeckState>;

struct Rig {
    conductor: Conductor,
    deck: Arc<Deck>,
    events: broadcast::Receiver<DeviceEvent>,
    seen: Vec<DeviceEvent>,
}

#[derive(World)]
#[world(init = Self::new)]
pub struct RunnerWorld {
    rig: Option<Rig>,
}

impl std::fmt::Debug for RunnerWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerWorld")
            .field("running", &self.rig.is_some())
            .finish()
    }
}

impl RunnerWorld {
    fn new() -> Self {
        Self { rig: None }
    }

    fn rig(&mut self) -> &mut Rig {
        self.rig.as_mut().expect("Deck not running")
    }
}

impl Rig {
    fn now(&self) -> i64 {
        self.conductor.clock().now()
    }

    async fn handle(&self, snapshot: Snapshot) {
        let mut mappings = Mappings::new();
        mappings.insert(
            "deck".into(),
            Mapping::new(DEVICE_ID, json!({"mappingType": "transport"})),
        );
        let mut results = self.conductor.handle_snapshot(snapshot, mappings).await;
        results
            .remove(DEVICE_ID)
            .expect("deck missing from results")
            .expect("snapshot rejected");
    }

    async fn pending(&self) -> usize {
        let device = self.conductor.device(DEVICE_ID).await.expect("deck not registered");
        device.pending_commands().await.expect("deck stopped").len()
    }

    fn collect_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }
}

fn transport(time: i64, content: serde_json::Value) -> Snapshot {
    Snapshot::new(time).with_layer("deck", LayerObject::new("obj1", content))
}

fn play(time: i64, clip: &str) -> Snapshot {
    transport(
        time,
        json!({"type": "transport", "status": "play", "clipId": clip}),
    )
}

#[given("a running deck")]
async fn given_running_deck(world: &mut RunnerWorld) {
    let conductor = Conductor::new(Arc::new(TokioClock::new(0)));
    let events = conductor.subscribe();
    let deck = Arc::new(Deck::new(HyperdeckState::default()));
    let settings = DeviceSettings {
        retry: RetryConfig {
            max_attempts: 5,
            backoff_ms: 10,
        },
        monitor: MonitorConfig {
            probe_interval_ms: 50,
            probe_timeout_ms: 20,
        },
        ..Default::default()
    };
    conductor
        .add_device(DEVICE_ID, HyperdeckDiffer::new(), deck.clone(), settings)
        .await
        .expect("deck failed to start");

    world.rig = Some(Rig {
        conductor,
        deck,
        events,
        seen: Vec::new(),
    });
}

#[given(expr = "the deck rejects the next {int} sends as busy")]
async fn given_busy(world: &mut RunnerWorld, count: u32) {
    world.rig().deck.fail_next_sends(count);
}

#[when(expr = "the timeline plays clip {string} now")]
async fn when_plays_now(world: &mut RunnerWorld, clip: String) {
    let rig = world.rig();
    let now = rig.now();
    rig.handle(play(now, &clip)).await;
}

#[given(expr = "the timeline plays clip {string} in {int} seconds")]
async fn given_plays_later(world: &mut RunnerWorld, clip: String, seconds: i64) {
    let rig = world.rig();
    let time = rig.now() + seconds * 1000;
    rig.handle(play(time, &clip)).await;
}

#[given(expr = "the timeline stops the deck in {int} seconds")]
async fn given_stops_later(world: &mut RunnerWorld, seconds: i64) {
    let rig = world.rig();
    let time = rig.now() + seconds * 1000;
    rig.handle(transport(time, json!({"type": "transport", "status": "stopped"})))
        .await;
}

#[given(expr = "the deck has {int} pending commands")]
async fn given_pending(world: &mut RunnerWorld, count: usize) {
    assert_eq!(world.rig().pending().await, count);
}

#[when("the deck goes offline")]
async fn when_offline(world: &mut RunnerWorld) {
    let rig = world.rig();
    // Only events from here on count
    rig.collect_events();
    rig.seen.clear();
    rig.deck.set_reachable(false);
}

#[then(expr = "the deck eventually receives {int} command after {int} attempts")]
async fn then_receives(world: &mut RunnerWorld, commands: usize, attempts: u32) {
    let deck = world.rig().deck.clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while deck.sent_count().await != commands {
        assert!(tokio::time::Instant::now() < deadline, "deck never received {} command", commands);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(deck.send_attempts(), attempts);
}

#[then("no command error is reported")]
async fn then_no_command_error(world: &mut RunnerWorld) {
    let rig = world.rig();
    rig.collect_events();
    assert!(
        !rig.seen
            .iter()
            .any(|e| matches!(e, DeviceEvent::CommandError { .. })),
        "unexpected command error"
    );
}

#[then(expr = "the deck eventually has {int} pending commands")]
async fn then_eventually_pending(world: &mut RunnerWorld, count: usize) {
    let rig = world.rig();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while rig.pending().await != count {
        assert!(tokio::time::Instant::now() < deadline, "pending commands never reached {}", count);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[then("a resolver reset is requested")]
async fn then_resolver_reset(world: &mut RunnerWorld) {
    let rig = world.rig();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        rig.collect_events();
        if rig
            .seen
            .iter()
            .any(|e| matches!(e, DeviceEvent::ResetResolver { .. }))
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no resolver reset requested");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    rig.conductor.terminate().await;
}
