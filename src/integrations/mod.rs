//! Device adapters and construction of configured devices.
//!
//! Kinds without a wire protocol in this crate (decks, graphics engines,
//! mixers, camera heads) run against a [`SimulatedConnection`], which makes a config
//! usable as a dry run of the whole timeline.

pub mod graphics;
pub mod http_send;
pub mod hyperdeck;
pub mod mixer;
pub mod ptz;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::clock::Time;
use crate::conductor::Conductor;
use crate::config::{ConnectionConfig, DeviceConfig};
use crate::device::simulated::SimulatedConnection;
use crate::device::{DeviceConnection, StateDiffer, UnhandledTagPolicy};
use crate::runner::{DeviceError, DeviceHandle, DeviceSettings};

use self::graphics::GraphicsDiffer;
use self::http_send::{HttpSendDiffer, ReqwestConnection};
use self::hyperdeck::HyperdeckDiffer;
use self::mixer::MixerDiffer;
use self::ptz::PtzDiffer;

/// Every kind [`add_configured_device`] knows.
pub const KINDS: &[&str] = &[
    hyperdeck::KIND,
    graphics::KIND,
    mixer::KIND,
    ptz::KIND,
    http_send::KIND,
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HyperdeckOptions {
    unhandled: UnhandledTagPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GraphicsOptions {
    prepare_lead_ms: Time,
    prepare_wait_ms: Time,
}

impl Default for GraphicsOptions {
    fn default() -> Self {
        Self {
            prepare_lead_ms: graphics::DEFAULT_PREPARE_LEAD,
            prepare_wait_ms: graphics::DEFAULT_PREPARE_WAIT,
        }
    }
}

fn adapter_options<T: DeserializeOwned + Default>(device: &DeviceConfig) -> Result<T, DeviceError> {
    match &device.options {
        Value::Null => Ok(T::default()),
        options => T::deserialize(options).map_err(|e| DeviceError::InvalidOptions {
            device_id: device.id.clone(),
            reason: e.to_string(),
        }),
    }
}

fn simulated<D: StateDiffer>(
    device: &DeviceConfig,
    differ: &D,
) -> Result<Arc<dyn DeviceConnection<D::Payload, D::State>>, DeviceError> {
    match device.connection {
        ConnectionConfig::Simulated => Ok(Arc::new(SimulatedConnection::<D::Payload, D::State>::new(
            differ.default_state(),
        ))),
        ConnectionConfig::Http(_) => Err(DeviceError::InvalidOptions {
            device_id: device.id.clone(),
            reason: format!("kind '{}' cannot use an http connection", device.kind),
        }),
    }
}

/// Build the adapter and connection for `device` and add it to `conductor`.
pub async fn add_configured_device(
    conductor: &Conductor,
    device: &DeviceConfig,
    settings: DeviceSettings,
) -> Result<DeviceHandle, DeviceError> {
    match device.kind.as_str() {
        hyperdeck::KIND => {
            let options: HyperdeckOptions = adapter_options(device)?;
            let differ = HyperdeckDiffer::new().with_unhandled_policy(options.unhandled);
            let connection = simulated(device, &differ)?;
            conductor.add_device(&device.id, differ, connection, settings).await
        }
        graphics::KIND => {
            let options: GraphicsOptions = adapter_options(device)?;
            let differ = GraphicsDiffer::new()
                .with_prepare_timing(options.prepare_lead_ms, options.prepare_wait_ms);
            let connection = simulated(device, &differ)?;
            conductor.add_device(&device.id, differ, connection, settings).await
        }
        mixer::KIND => {
            let differ = MixerDiffer::new();
            let connection = simulated(device, &differ)?;
            conductor.add_device(&device.id, differ, connection, settings).await
        }
        ptz::KIND => {
            let differ = PtzDiffer::new();
            let connection = simulated(device, &differ)?;
            conductor.add_device(&device.id, differ, connection, settings).await
        }
        http_send::KIND => {
            let differ = HttpSendDiffer::new();
            let connection: Arc<dyn DeviceConnection<_, _>> = match &device.connection {
                ConnectionConfig::Http(options) => Arc::new(ReqwestConnection::new(options.clone())?),
                ConnectionConfig::Simulated => simulated(device, &differ)?,
            };
            conductor.add_device(&device.id, differ, connection, settings).await
        }
        other => Err(DeviceError::UnknownKind(other.to_string())),
    }
}
