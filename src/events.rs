//! Device telemetry.
//!
//! Everything a collaborator may want to observe without taking part in
//! control flow: connectivity changes, failed commands, resolver reset
//! requests, diagnostics and timing traces. Published on a broadcast
//! channel; a slow subscriber lags and loses events, it never blocks a
//! device.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::Time;
use crate::device::{Command, CommandError, DeviceStatus};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A command as seen from outside its device: payload rendered to JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledCommand {
    pub time: Time,
    pub group: Option<String>,
    pub object_id: Option<String>,
    pub description: String,
    pub payload: Value,
}

impl ScheduledCommand {
    pub fn from_command<P: Serialize>(command: &Command<P>) -> Self {
        Self {
            time: command.time,
            group: command.group.clone(),
            object_id: command.object_id.clone(),
            description: command.context.description.clone(),
            payload: serde_json::to_value(&command.payload).unwrap_or(Value::Null),
        }
    }
}

/// One timing measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeTrace {
    pub label: String,
    /// Clock time the measured step started.
    pub started: Time,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    ConnectionChanged {
        device_id: String,
        status: DeviceStatus,
    },
    CommandError {
        device_id: String,
        #[serde(serialize_with = "serialize_display")]
        error: CommandError,
        command: ScheduledCommand,
    },
    /// The device's assumed state was reset; the timeline should be
    /// resolved again and the current snapshot resent.
    ResetResolver {
        device_id: String,
    },
    Log {
        device_id: String,
        level: LogLevel,
        message: String,
    },
    TimeTrace {
        device_id: String,
        trace: TimeTrace,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::ConnectionChanged { device_id, .. }
            | DeviceEvent::CommandError { device_id, .. }
            | DeviceEvent::ResetResolver { device_id }
            | DeviceEvent::Log { device_id, .. }
            | DeviceEvent::TimeTrace { device_id, .. } => device_id,
        }
    }
}

fn serialize_display<T: std::fmt::Display, Ser: serde::Serializer>(
    value: &T,
    serializer: Ser,
) -> Result<Ser::Ok, Ser::Error> {
    serializer.collect_str(value)
}

/// Broadcast publisher shared by every device.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<DeviceEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: DeviceEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }
}
