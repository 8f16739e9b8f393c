//! Per-device orchestration.
//!
//! Each device runs as one tokio task owning its queue, state history,
//! executor and connection monitor. The rest of the process talks to it
//! only through a [`DeviceHandle`]: requests go in over an mpsc channel,
//! replies come back on oneshots, telemetry goes out through the shared
//! [`EventSink`].
//!
//! ```text
//! DeviceHandle ──requests──▶ DeviceRunner ──commands──▶ TimedQueue ──▶ CommandExecutor ──▶ DeviceConnection
//!                                 ▲                                          │
//!                                 └──── signals (monitor, failures, resend) ─┘
//! ```

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Time};
use crate::device::{
    ActionResult, Command, CommandError, ConnectionError, ConversionError, DeviceConnection,
    DeviceStatus, DiffContext, ProgrammingError, StateDiffer, StateHistory, StatusCode, Timed,
};
use crate::events::{DeviceEvent, EventSink, LogLevel, ScheduledCommand, TimeTrace};
use crate::executor::{CommandExecutor, RetryConfig};
use crate::monitor::{ConnectionMonitor, MonitorConfig};
use crate::queue::{BoxError, PendingEntry, QueueConfig, QueueError, TimedQueue};
use crate::task::PeriodicTask;
use crate::timeline::{Mappings, Snapshot};

const REQUEST_CAPACITY: usize = 64;

/// Action id handled by every device.
pub const RESYNC_ACTION: &str = "resync";

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Programming(#[from] ProgrammingError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Device '{0}' is not initialized")]
    NotInitialized(String),

    #[error("Device '{0}' is not running")]
    ChannelClosed(String),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{0}' already exists")]
    DuplicateDevice(String),

    #[error("Unknown device kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid options for device '{device_id}': {reason}")]
    InvalidOptions { device_id: String, reason: String },
}

/// Options applied when a device is initialised.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    /// Re-send the full current state on this interval.
    pub resend_interval_ms: Option<u64>,
}

/// What handling one snapshot produced for one device.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOutcome {
    pub commands: Vec<ScheduledCommand>,
    pub warnings: Vec<ConversionError>,
}

/// Messages into a device task.
#[derive(Debug)]
pub(crate) enum DeviceRequest {
    Init {
        settings: DeviceSettings,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    PrepareForSnapshot {
        time: Time,
        reply: oneshot::Sender<()>,
    },
    HandleSnapshot {
        snapshot: Arc<Snapshot>,
        mappings: Arc<Mappings>,
        reply: oneshot::Sender<Result<SnapshotOutcome, DeviceError>>,
    },
    CancelAfter {
        time: Time,
        reply: oneshot::Sender<usize>,
    },
    Status(oneshot::Sender<DeviceStatus>),
    Pending(oneshot::Sender<Vec<PendingEntry>>),
    Resync(oneshot::Sender<Result<(), DeviceError>>),
    ExecuteAction {
        action: String,
        payload: Value,
        reply: oneshot::Sender<ActionResult>,
    },
    Terminate(oneshot::Sender<()>),

    // Internal signals
    Connectivity(bool),
    MonitorCycle,
    CommandSettled {
        command: ScheduledCommand,
        error: Option<CommandError>,
    },
    Resend,
}

/// Cloneable handle to a running device task.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device_id: Arc<str>,
    kind: &'static str,
    tx: mpsc::Sender<DeviceRequest>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DeviceRequest,
    ) -> Result<T, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| DeviceError::ChannelClosed(self.device_id.to_string()))?;
        rx.await
            .map_err(|_| DeviceError::ChannelClosed(self.device_id.to_string()))
    }

    /// Connect, read the actual device state and start background work.
    pub async fn init(&self, settings: DeviceSettings) -> Result<(), DeviceError> {
        self.request(|reply| DeviceRequest::Init { settings, reply })
            .await?
    }

    /// Drop everything planned from `time` on, ahead of a new snapshot.
    pub async fn prepare_for_snapshot(&self, time: Time) -> Result<(), DeviceError> {
        self.request(|reply| DeviceRequest::PrepareForSnapshot { time, reply })
            .await
    }

    pub async fn handle_snapshot(
        &self,
        snapshot: Arc<Snapshot>,
        mappings: Arc<Mappings>,
    ) -> Result<SnapshotOutcome, DeviceError> {
        self.request(|reply| DeviceRequest::HandleSnapshot {
            snapshot,
            mappings,
            reply,
        })
        .await?
    }

    /// Cancel queued commands after `time`. Returns how many were dropped.
    pub async fn cancel_after(&self, time: Time) -> Result<usize, DeviceError> {
        self.request(|reply| DeviceRequest::CancelAfter { time, reply })
            .await
    }

    pub async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        self.request(DeviceRequest::Status).await
    }

    /// Commands queued but not yet dispatched.
    pub async fn pending_commands(&self) -> Result<Vec<PendingEntry>, DeviceError> {
        self.request(DeviceRequest::Pending).await
    }

    pub async fn resync(&self) -> Result<(), DeviceError> {
        self.request(DeviceRequest::Resync).await?
    }

    pub async fn execute_action(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<ActionResult, DeviceError> {
        let action = action.into();
        self.request(|reply| DeviceRequest::ExecuteAction {
            action,
            payload,
            reply,
        })
        .await
    }

    /// Stop the device task. Terminating twice is fine.
    pub async fn terminate(&self) -> Result<(), DeviceError> {
        match self.request(DeviceRequest::Terminate).await {
            Ok(()) | Err(DeviceError::ChannelClosed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parts that only exist between init and terminate.
struct Active<P, S>
where
    P: Send + Sync + 'static,
    S: Send + 'static,
{
    queue: TimedQueue,
    executor: CommandExecutor<P, S>,
    monitor: ConnectionMonitor,
    resend: Option<PeriodicTask>,
}

pub struct DeviceRunner<D: StateDiffer> {
    device_id: String,
    differ: D,
    connection: Arc<dyn DeviceConnection<D::Payload, D::State>>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    history: StateHistory<D::State>,
    requests: mpsc::Receiver<DeviceRequest>,
    signals_tx: mpsc::UnboundedSender<DeviceRequest>,
    signals: mpsc::UnboundedReceiver<DeviceRequest>,
    active: Option<Active<D::Payload, D::State>>,
    connected: bool,
    resync_pending: bool,
    last_command_error: Option<String>,
}

impl<D: StateDiffer> DeviceRunner<D> {
    /// Spawn the device task. Call [`DeviceHandle::init`] before feeding it
    /// snapshots.
    pub fn spawn(
        device_id: impl Into<String>,
        differ: D,
        connection: Arc<dyn DeviceConnection<D::Payload, D::State>>,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> DeviceHandle {
        let device_id = device_id.into();
        let kind = differ.kind();
        let (tx, requests) = mpsc::channel(REQUEST_CAPACITY);
        let (signals_tx, signals) = mpsc::unbounded_channel();

        let runner = Self {
            history: StateHistory::new(differ.default_state(), clock.clone()),
            device_id: device_id.clone(),
            differ,
            connection,
            clock,
            events,
            requests,
            signals_tx,
            signals,
            active: None,
            connected: false,
            resync_pending: false,
            last_command_error: None,
        };
        tokio::spawn(runner.run());

        DeviceHandle {
            device_id: device_id.into(),
            kind,
            tx,
        }
    }

    async fn run(mut self) {
        debug!(device_id = %self.device_id, kind = self.differ.kind(), "Device task started");

        loop {
            let request = tokio::select! {
                request = self.requests.recv() => request,
                Some(signal) = self.signals.recv() => Some(signal),
            };

            let Some(request) = request else {
                // Every handle dropped
                self.shutdown().await;
                break;
            };

            if let DeviceRequest::Terminate(reply) = request {
                self.shutdown().await;
                let _ = reply.send(());
                break;
            }
            self.dispatch(request).await;
        }

        info!(device_id = %self.device_id, "Device task stopped");
    }

    async fn dispatch(&mut self, request: DeviceRequest) {
        match request {
            DeviceRequest::Init { settings, reply } => {
                let _ = reply.send(self.init(settings).await);
            }
            DeviceRequest::PrepareForSnapshot { time, reply } => {
                self.prepare_for_snapshot(time).await;
                let _ = reply.send(());
            }
            DeviceRequest::HandleSnapshot {
                snapshot,
                mappings,
                reply,
            } => {
                let _ = reply.send(self.handle_snapshot(&snapshot, &mappings).await);
            }
            DeviceRequest::CancelAfter { time, reply } => {
                let removed = match &self.active {
                    Some(active) => active.queue.cancel_after(time).await,
                    None => 0,
                };
                let _ = reply.send(removed);
            }
            DeviceRequest::Status(reply) => {
                let _ = reply.send(self.status());
            }
            DeviceRequest::Pending(reply) => {
                let pending = match &self.active {
                    Some(active) => active.queue.pending().await,
                    None => Vec::new(),
                };
                let _ = reply.send(pending);
            }
            DeviceRequest::Resync(reply) => {
                let _ = reply.send(self.resync().await);
            }
            DeviceRequest::ExecuteAction {
                action,
                payload,
                reply,
            } => {
                let _ = reply.send(self.execute_action(&action, &payload).await);
            }
            DeviceRequest::Terminate(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            DeviceRequest::Connectivity(connected) => {
                self.connectivity_changed(connected).await;
            }
            DeviceRequest::MonitorCycle => {
                if self.connected && self.resync_pending {
                    debug!(device_id = %self.device_id, "Retrying pending resync");
                    let _ = self.resync().await;
                }
            }
            DeviceRequest::CommandSettled { command, error } => {
                self.command_settled(command, error).await;
            }
            DeviceRequest::Resend => {
                self.resend().await;
            }
        }
    }

    async fn init(&mut self, settings: DeviceSettings) -> Result<(), DeviceError> {
        if self.active.is_some() {
            debug!(device_id = %self.device_id, "Device already initialized");
            return Ok(());
        }

        match self.connection.connect().await {
            Ok(()) => {
                self.connected = true;
                match self.connection.query_state().await {
                    Ok(actual) => self.history.reset(self.clock.now(), actual),
                    Err(e) => {
                        self.resync_pending = true;
                        self.log(LogLevel::Warning, format!("Could not read device state: {}", e));
                    }
                }
            }
            Err(e) => {
                // The monitor reconnects and resyncs once the device answers
                self.resync_pending = true;
                self.log(LogLevel::Warning, format!("Initial connection failed: {}", e));
            }
        }

        let queue = TimedQueue::new(
            self.device_id.clone(),
            self.clock.clone(),
            self.differ.send_mode(),
            &settings.queue,
        );
        queue.start().await;

        let monitor = ConnectionMonitor::start(
            &self.device_id,
            self.connection.clone(),
            &settings.monitor,
            self.connected,
            self.clock.clone(),
            self.signals_tx.clone(),
        );

        let resend = settings.resend_interval_ms.map(|interval| {
            let signals = self.signals_tx.clone();
            PeriodicTask::spawn_on_clock("resend", self.clock.clone(), interval as Time, move || {
                let _ = signals.send(DeviceRequest::Resend);
                async {}
            })
        });

        self.active = Some(Active {
            queue,
            executor: CommandExecutor::new(
                self.device_id.clone(),
                self.connection.clone(),
                settings.retry,
            ),
            monitor,
            resend,
        });

        info!(
            device_id = %self.device_id,
            kind = self.differ.kind(),
            connected = self.connected,
            "Device initialized"
        );
        self.emit_connection_changed();
        self.emit(DeviceEvent::ResetResolver {
            device_id: self.device_id.clone(),
        });
        Ok(())
    }

    async fn prepare_for_snapshot(&mut self, time: Time) {
        if let Some(active) = &self.active {
            active.queue.cancel_from_now_on(time).await;
        }
        self.history.discard_from(time);
    }

    #[tracing::instrument(skip_all, fields(device_id = %self.device_id, time = snapshot.time))]
    async fn handle_snapshot(
        &mut self,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<SnapshotOutcome, DeviceError> {
        let Some(active) = &self.active else {
            self.log(
                LogLevel::Warning,
                format!("Snapshot at {} ignored: device not initialized", snapshot.time),
            );
            return Ok(SnapshotOutcome::default());
        };

        let now = self.clock.now();
        let lookup = now.max(snapshot.time);
        let old = self.history.state_before(lookup);

        let started = tokio::time::Instant::now();
        let conversion = self
            .differ
            .convert(&self.device_id, snapshot, mappings)
            .inspect_err(|e| error!(error = %e, "Conversion rejected"))?;
        let convert_trace = TimeTrace {
            label: "convert".into(),
            started: now,
            duration: started.elapsed(),
        };

        let new = Timed::new(snapshot.time, conversion.state);
        let ctx = DiffContext {
            time: snapshot.time,
            now,
            previous_time: old.time,
        };

        let started = tokio::time::Instant::now();
        let commands = self
            .differ
            .diff(&old, &new, &ctx)
            .inspect_err(|e| error!(error = %e, "Diff rejected"))?;
        let diff_trace = TimeTrace {
            label: "diff".into(),
            started: now,
            duration: started.elapsed(),
        };

        let superseded = active.queue.cancel_from_now_on(lookup).await;
        let mut scheduled = Vec::with_capacity(commands.len());
        for command in commands {
            scheduled.push(ScheduledCommand::from_command(&command));
            self.enqueue(active, command).await?;
        }

        self.history.supersede(snapshot.time, new.state);
        self.history.prune_before(now);

        debug!(
            commands = scheduled.len(),
            superseded,
            warnings = conversion.warnings.len(),
            "Snapshot handled"
        );

        for warning in &conversion.warnings {
            self.log(LogLevel::Warning, warning.to_string());
        }
        for trace in [convert_trace, diff_trace] {
            self.emit(DeviceEvent::TimeTrace {
                device_id: self.device_id.clone(),
                trace,
            });
        }

        Ok(SnapshotOutcome {
            commands: scheduled,
            warnings: conversion.warnings,
        })
    }

    async fn enqueue(
        &self,
        active: &Active<D::Payload, D::State>,
        command: Command<D::Payload>,
    ) -> Result<(), DeviceError> {
        let executor = active.executor.clone();
        let signals = self.signals_tx.clone();

        active
            .queue
            .enqueue(
                command.time,
                command.group.clone(),
                move |command: Command<D::Payload>| async move {
                    let outcome = executor.execute(&command).await;
                    let error = outcome.result.err();
                    let _ = signals.send(DeviceRequest::CommandSettled {
                        command: ScheduledCommand::from_command(&command),
                        error: error.clone(),
                    });
                    match error {
                        Some(e) => Err(Box::new(e) as BoxError),
                        None => Ok(()),
                    }
                },
                command,
            )
            .await?;
        Ok(())
    }

    async fn command_settled(&mut self, command: ScheduledCommand, error: Option<CommandError>) {
        let Some(error) = error else {
            self.last_command_error = None;
            return;
        };

        warn!(
            device_id = %self.device_id,
            time = command.time,
            command = %command.description,
            error = %error,
            "Command failed"
        );
        self.last_command_error = Some(format!("{}: {}", command.description, error));
        let lost = matches!(error, CommandError::ConnectionLost(_));
        self.emit(DeviceEvent::CommandError {
            device_id: self.device_id.clone(),
            error,
            command,
        });

        if lost {
            self.connectivity_changed(false).await;
        }
    }

    async fn connectivity_changed(&mut self, connected: bool) {
        if connected == self.connected {
            return;
        }

        if !connected {
            self.connected = false;
            self.resync_pending = true;
            if let Some(active) = &self.active {
                active.monitor.set_connected(false);
                let dropped = active.queue.cancel_from_now_on(self.clock.now()).await;
                warn!(device_id = %self.device_id, dropped, "Device disconnected");
            }
            self.emit_connection_changed();
            self.emit(DeviceEvent::ResetResolver {
                device_id: self.device_id.clone(),
            });
            return;
        }

        if let Err(e) = self.connection.connect().await {
            if let Some(active) = &self.active {
                active.monitor.set_connected(false);
            }
            self.log(LogLevel::Warning, format!("Reconnect failed: {}", e));
            return;
        }

        self.connected = true;
        info!(device_id = %self.device_id, "Device reconnected");
        self.emit_connection_changed();
        let _ = self.resync().await;
    }

    /// Replace the assumed state with what the device reports, dropping
    /// everything queued from now on.
    async fn resync(&mut self) -> Result<(), DeviceError> {
        let now = self.clock.now();
        if let Some(active) = &self.active {
            active.queue.cancel_from_now_on(now).await;
        }

        match self.connection.query_state().await {
            Ok(actual) => {
                self.history.reset(now, actual);
                self.resync_pending = false;
                self.last_command_error = None;
                info!(device_id = %self.device_id, "Device resynchronized");
                self.emit(DeviceEvent::ResetResolver {
                    device_id: self.device_id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                self.resync_pending = true;
                self.log(LogLevel::Error, format!("Resync failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Re-send the whole current state as if the device were at its default.
    async fn resend(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if !self.connected {
            return;
        }

        let now = self.clock.now();
        let current = self.history.current();
        let baseline = Timed::shared(0, self.history.default_state());
        let ctx = DiffContext {
            time: now,
            now,
            previous_time: 0,
        };

        let commands = match self.differ.diff(&baseline, &current, &ctx) {
            Ok(commands) => commands,
            Err(e) => {
                self.log(LogLevel::Error, format!("Resend diff failed: {}", e));
                return;
            }
        };

        // Nothing pending is dropped. Earlier entries sort ahead of these
        // and planned ones still apply on top of the resent state.
        debug!(device_id = %self.device_id, commands = commands.len(), "Resending current state");
        for mut command in commands {
            command.time = now;
            if let Err(e) = self.enqueue(active, command).await {
                warn!(device_id = %self.device_id, error = %e, "Resend enqueue failed");
            }
        }
    }

    async fn execute_action(&mut self, action: &str, payload: &Value) -> ActionResult {
        if action == RESYNC_ACTION {
            return match self.resync().await {
                Ok(()) => ActionResult::ok(),
                Err(e) => ActionResult::error(e.to_string()),
            };
        }
        self.connection.execute_action(action, payload).await
    }

    fn status(&self) -> DeviceStatus {
        let mut messages = Vec::new();

        if self.active.is_none() {
            messages.push("Not initialized".to_string());
        }
        if !self.connected {
            messages.push("Not connected".to_string());
        }
        if self.resync_pending {
            messages.push("Waiting for resynchronization".to_string());
        }
        if let Some(error) = &self.last_command_error {
            messages.push(format!("Last command failed: {}", error));
        }

        let code = if self.active.is_none() || !self.connected {
            StatusCode::Bad
        } else if self.resync_pending || self.last_command_error.is_some() {
            StatusCode::Degraded
        } else {
            StatusCode::Good
        };

        DeviceStatus { code, messages }
    }

    async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            active.monitor.stop();
            if let Some(resend) = &active.resend {
                resend.stop();
            }
            active.queue.dispose().await;
            self.connection.disconnect().await;
        }
        self.connected = false;
    }

    fn emit_connection_changed(&self) {
        self.emit(DeviceEvent::ConnectionChanged {
            device_id: self.device_id.clone(),
            status: self.status(),
        });
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => error!(device_id = %self.device_id, "{}", message),
            LogLevel::Warning => warn!(device_id = %self.device_id, "{}", message),
            LogLevel::Info => info!(device_id = %self.device_id, "{}", message),
            LogLevel::Debug => debug!(device_id = %self.device_id, "{}", message),
        }
        self.emit(DeviceEvent::Log {
            device_id: self.device_id.clone(),
            level,
            message,
        });
    }

    fn emit(&self, event: DeviceEvent) {
        self.events.emit(event);
    }
}
