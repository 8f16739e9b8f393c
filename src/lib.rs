//! onair - timeline-driven playout for broadcast devices.
//!
//! Turns resolved timeline snapshots into timed, per-device commands,
//! sends them at the right instant and keeps each device's believed state
//! in line with reality across retries, disconnects and resyncs.

pub mod clock;
pub mod conductor;
pub mod config;
pub mod device;
pub mod events;
pub mod executor;
pub mod integrations;
pub mod monitor;
pub mod queue;
pub mod runner;
pub mod task;
pub mod timeline;
pub mod utils;

pub use conductor::Conductor;
pub use runner::{DeviceError, DeviceHandle, DeviceSettings, SnapshotOutcome};
pub use timeline::{LayerObject, Mapping, Mappings, Snapshot};
