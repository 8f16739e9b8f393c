//! State history step definitions.

use std::sync::Arc;

use cucumber::{given, then, when, World};

use onair::clock::ManualClock;
use onair::device::history::StateHistory;

#[derive(World)]
#[world(init = Self::new)]
pub struct HistoryWorld {
    history: StateHistory<String>,
}

impl std::fmt::Debug for HistoryWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryWorld")
            .field("times", &self.history.times())
            .finish()
    }
}

impl HistoryWorld {
    fn new() -> Self {
        Self {
            history: StateHistory::new("default".to_string(), Arc::new(ManualClock::new(0))),
        }
    }
}

#[given("an empty state history")]
async fn given_empty_history(world: &mut HistoryWorld) {
    *world = HistoryWorld::new();
}

#[given(expr = "state {string} recorded at {int}")]
async fn given_recorded(world: &mut HistoryWorld, state: String, time: i64) {
    world.history.record(time, state);
}

#[when(expr = "state {string} supersedes at {int}")]
async fn when_supersedes(world: &mut HistoryWorld, state: String, time: i64) {
    world.history.supersede(time, state);
}

#[when(expr = "everything from {int} on is discarded")]
async fn when_discarded(world: &mut HistoryWorld, time: i64) {
    world.history.discard_from(time);
}

#[when(expr = "entries before {int} are pruned")]
async fn when_pruned(world: &mut HistoryWorld, time: i64) {
    world.history.prune_before(time);
}

#[then(expr = "the state before {int} is {string}")]
async fn then_state_before(world: &mut HistoryWorld, time: i64, expected: String) {
    assert_eq!(*world.history.state_before(time).state, expected);
}

#[then(expr = "the history holds {int} entry")]
async fn then_holds(world: &mut HistoryWorld, count: usize) {
    assert_eq!(world.history.len(), count);
}
