//! Conductor: owns every device and fans snapshots out to them.
//!
//! Devices are independent. A failing device never blocks or fails the
//! others; its error is returned next to the other devices' results.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::clock::{Clock, Time};
use crate::device::{ActionResult, DeviceConnection, DeviceStatus, StateDiffer};
use crate::events::{DeviceEvent, EventSink};
use crate::runner::{DeviceError, DeviceHandle, DeviceRunner, DeviceSettings, SnapshotOutcome};
use crate::timeline::{Mappings, Snapshot};

pub struct Conductor {
    clock: Arc<dyn Clock>,
    events: EventSink,
    devices: RwLock<BTreeMap<String, DeviceHandle>>,
}

impl Conductor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            events: EventSink::new(),
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Spawn and initialise a device.
    pub async fn add_device<D: StateDiffer>(
        &self,
        device_id: impl Into<String>,
        differ: D,
        connection: Arc<dyn DeviceConnection<D::Payload, D::State>>,
        settings: DeviceSettings,
    ) -> Result<DeviceHandle, DeviceError> {
        let device_id = device_id.into();
        if self.devices.read().await.contains_key(&device_id) {
            return Err(DeviceError::DuplicateDevice(device_id));
        }

        let handle = DeviceRunner::spawn(
            device_id.clone(),
            differ,
            connection,
            self.clock.clone(),
            self.events.clone(),
        );
        if let Err(e) = handle.init(settings).await {
            let _ = handle.terminate().await;
            return Err(e);
        }

        // Another add for the same id may have finished while this one
        // was initialising; the first one registered keeps the id.
        match self.devices.write().await.entry(device_id.clone()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                info!(device_id = %device_id, kind = handle.kind(), "Device added");
                return Ok(handle);
            }
        }

        warn!(device_id = %device_id, "Concurrent add lost the race, terminating");
        let _ = handle.terminate().await;
        Err(DeviceError::DuplicateDevice(device_id))
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<(), DeviceError> {
        let handle = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        handle.terminate().await?;
        info!(device_id = %device_id, "Device removed");
        Ok(())
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceHandle> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    async fn handles(&self) -> Vec<DeviceHandle> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Hand a new snapshot to every device concurrently.
    pub async fn handle_snapshot(
        &self,
        snapshot: Snapshot,
        mappings: Mappings,
    ) -> BTreeMap<String, Result<SnapshotOutcome, DeviceError>> {
        let snapshot = Arc::new(snapshot);
        let mappings = Arc::new(mappings);

        let work = self.handles().await.into_iter().map(|handle| {
            let snapshot = snapshot.clone();
            let mappings = mappings.clone();
            async move {
                let result = async {
                    handle.prepare_for_snapshot(snapshot.time).await?;
                    handle.handle_snapshot(snapshot, mappings).await
                }
                .await;
                if let Err(e) = &result {
                    warn!(device_id = %handle.device_id(), error = %e, "Snapshot rejected by device");
                }
                (handle.device_id().to_string(), result)
            }
        });

        join_all(work).await.into_iter().collect()
    }

    /// Cancel queued commands after `time` on every device.
    pub async fn cancel_after(&self, time: Time) -> usize {
        let results = join_all(self.handles().await.iter().map(|h| h.cancel_after(time))).await;
        results.into_iter().filter_map(Result::ok).sum()
    }

    pub async fn statuses(&self) -> BTreeMap<String, DeviceStatus> {
        let handles = self.handles().await;
        let statuses = join_all(handles.iter().map(|h| h.status())).await;

        handles
            .iter()
            .zip(statuses)
            .filter_map(|(handle, status)| match status {
                Ok(status) => Some((handle.device_id().to_string(), status)),
                Err(e) => {
                    warn!(device_id = %handle.device_id(), error = %e, "Status unavailable");
                    None
                }
            })
            .collect()
    }

    pub async fn execute_action(
        &self,
        device_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<ActionResult, DeviceError> {
        self.require(device_id)
            .await?
            .execute_action(action, payload)
            .await
    }

    pub async fn resync(&self, device_id: &str) -> Result<(), DeviceError> {
        self.require(device_id).await?.resync().await
    }

    async fn require(&self, device_id: &str) -> Result<DeviceHandle, DeviceError> {
        self.device(device_id)
            .await
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))
    }

    /// Telemetry from every device.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Terminate every device.
    pub async fn terminate(&self) {
        let handles: Vec<DeviceHandle> = {
            let mut devices = self.devices.write().await;
            std::mem::take(&mut *devices).into_values().collect()
        };
        for result in join_all(handles.iter().map(|h| h.terminate())).await {
            if let Err(e) = result {
                warn!(error = %e, "Device did not terminate cleanly");
            }
        }
        info!(devices = handles.len(), "Conductor terminated");
    }
}
