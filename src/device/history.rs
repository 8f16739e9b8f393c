//! Per-device state history.
//!
//! Keeps recent `(time, state)` pairs so a new snapshot can be diffed
//! against whatever was planned for the instant before it. Entries are
//! `Arc`s: a reader holding a state never sees it change.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{Clock, Time};

use super::Timed;

pub struct StateHistory<S> {
    default: Arc<S>,
    entries: BTreeMap<Time, Arc<S>>,
    clock: Arc<dyn Clock>,
}

impl<S> StateHistory<S> {
    pub fn new(default: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            default: Arc::new(default),
            entries: BTreeMap::new(),
            clock,
        }
    }

    /// Insert or replace the state at `time`.
    pub fn record(&mut self, time: Time, state: impl Into<Arc<S>>) {
        self.entries.insert(time, state.into());
    }

    /// Replace any planned future: drop entries after `time`, then record.
    pub fn supersede(&mut self, time: Time, state: impl Into<Arc<S>>) {
        self.entries.split_off(&time.saturating_add(1));
        self.record(time, state);
    }

    /// Drop entries at or after `time`.
    pub fn discard_from(&mut self, time: Time) -> usize {
        self.entries.split_off(&time).len()
    }

    /// Drop entries older than `time`, keeping the latest one at or before
    /// it so `state_before(time)` is unaffected.
    pub fn prune_before(&mut self, time: Time) -> usize {
        let Some(floor) = self.entries.range(..=time).next_back().map(|(t, _)| *t) else {
            return 0;
        };
        let kept = self.entries.split_off(&floor);
        let dropped = self.entries.len();
        self.entries = kept;
        dropped
    }

    /// Forget everything and start over from `state` at `time`.
    pub fn reset(&mut self, time: Time, state: impl Into<Arc<S>>) {
        self.entries.clear();
        self.record(time, state);
    }

    /// Latest entry at or before `time`, else the default state at time 0.
    pub fn state_before(&self, time: Time) -> Timed<S> {
        match self.entries.range(..=time).next_back() {
            Some((t, state)) => Timed::shared(*t, state.clone()),
            None => Timed::shared(0, self.default.clone()),
        }
    }

    /// State in effect now.
    pub fn current(&self) -> Timed<S> {
        self.state_before(self.clock.now())
    }

    pub fn default_state(&self) -> Arc<S> {
        self.default.clone()
    }

    pub fn times(&self) -> Vec<Time> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
