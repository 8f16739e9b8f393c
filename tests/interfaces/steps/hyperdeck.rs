//! Hyperdeck transport step definitions.

use cucumber::{given, then, when, World};
use serde_json::{json, Value};

use onair::device::{DiffContext, StateDiffer, Timed};
use onair::integrations::hyperdeck::{HyperdeckCommand, HyperdeckDiffer, HyperdeckState};
use onair::{LayerObject, Mapping, Mappings, Snapshot};

#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct HyperdeckWorld {
    differ: HyperdeckDiffer,
    current: Timed<HyperdeckState>,
    last_commands: Vec<HyperdeckCommand>,
}

impl HyperdeckWorld {
    fn new() -> Self {
        let differ = HyperdeckDiffer::new();
        let current = Timed::new(0, differ.default_state());
        Self {
            differ,
            current,
            last_commands: Vec::new(),
        }
    }

    fn apply(&mut self, time: i64, content: Value) {
        let mut mappings = Mappings::new();
        mappings.insert(
            "deck".into(),
            Mapping::new("deck1", json!({"mappingType": "transport"})),
        );
        let snapshot = Snapshot::new(time).with_layer("deck", LayerObject::new("obj", content));

        let conversion = self
            .differ
            .convert("deck1", &snapshot, &mappings)
            .expect("conversion failed");
        let next = Timed::new(time, conversion.state);
        let ctx = DiffContext {
            time,
            now: self.current.time,
            previous_time: self.current.time,
        };
        self.last_commands = self
            .differ
            .diff(&self.current, &next, &ctx)
            .expect("diff failed")
            .into_iter()
            .map(|c| c.payload)
            .collect();
        self.current = next;
    }
}

fn describe(command: &HyperdeckCommand) -> String {
    match command {
        HyperdeckCommand::Play { clip_id: Some(clip), .. } => format!("play {}", clip),
        HyperdeckCommand::Play { .. } => "play".to_string(),
        HyperdeckCommand::Record { filename: Some(name) } => format!("record {}", name),
        HyperdeckCommand::Record { .. } => "record".to_string(),
        HyperdeckCommand::Stop => "stop".to_string(),
        HyperdeckCommand::Preview => "preview".to_string(),
    }
}

#[given("a deck in its default state")]
async fn given_default_deck(world: &mut HyperdeckWorld) {
    *world = HyperdeckWorld::new();
}

#[when(expr = "the timeline plays clip {string} at {int}")]
async fn when_plays(world: &mut HyperdeckWorld, clip: String, time: i64) {
    world.apply(
        time,
        json!({"type": "transport", "status": "play", "clipId": clip}),
    );
}

#[when(expr = "the timeline records to {string} at {int}")]
async fn when_records(world: &mut HyperdeckWorld, filename: String, time: i64) {
    world.apply(
        time,
        json!({"type": "transport", "status": "record", "recordFilename": filename}),
    );
}

#[when(expr = "the timeline sets status {string} at {int}")]
async fn when_status(world: &mut HyperdeckWorld, status: String, time: i64) {
    world.apply(
        time,
        json!({"type": "transport", "status": status, "recordFilename": "take1"}),
    );
}

#[then(expr = "the commands are {string}")]
async fn then_commands(world: &mut HyperdeckWorld, expected: String) {
    let actual: Vec<String> = world.last_commands.iter().map(describe).collect();
    let expected: Vec<String> = expected.split(", ").map(str::to_string).collect();
    assert_eq!(actual, expected);
}

#[then("no commands are produced")]
async fn then_no_commands(world: &mut HyperdeckWorld) {
    assert!(
        world.last_commands.is_empty(),
        "unexpected commands: {:?}",
        world.last_commands
    );
}

#[then("diffing the current state against itself produces nothing")]
async fn then_self_diff_empty(world: &mut HyperdeckWorld) {
    let ctx = DiffContext {
        time: world.current.time,
        now: world.current.time,
        previous_time: world.current.time,
    };
    let commands = world
        .differ
        .diff(&world.current, &world.current, &ctx)
        .expect("diff failed");
    assert!(commands.is_empty());
}
