//! Device adapter contract.
//!
//! Every device kind plugs into the scheduling core through two traits:
//!
//! - [`StateDiffer`]: pure state conversion and diffing. No I/O.
//! - [`DeviceConnection`]: the I/O side. Connect, probe, read the actual
//!   device state, and send one command.
//!
//! The core (queue, history, executor, monitor, runner) only ever talks to
//! these two traits, so adding a device kind means implementing both and
//! nothing else.

pub mod history;
pub mod simulated;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Time;
use crate::queue::SendMode;
use crate::timeline::{Mappings, Snapshot};

pub use history::StateHistory;

/// Content field carrying the content kind discriminator.
pub const CONTENT_TAG: &str = "type";

// ============================================================================
// Errors
// ============================================================================

/// A timeline layer could not be mapped onto device state.
///
/// Reported as a warning; the affected sub-state keeps its default.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("Layer '{layer}': invalid mapping options: {reason}")]
    InvalidMapping { layer: String, reason: String },

    #[error("Layer '{layer}': invalid content: {reason}")]
    InvalidContent { layer: String, reason: String },
}

/// An unsupported tag value reached convert or diff.
///
/// Never swallowed: the snapshot is rejected for the device that raised it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgrammingError {
    #[error("Unknown content type '{tag}' for {device_kind} device on layer '{layer}'")]
    UnknownTag {
        device_kind: &'static str,
        layer: String,
        tag: String,
    },

    #[error("Unsupported {what} '{value}' for {device_kind} device")]
    Unsupported {
        device_kind: &'static str,
        what: &'static str,
        value: String,
    },
}

/// Outcome of sending one command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Target briefly unavailable or not ready. Retried.
    #[error("Transient command failure: {0}")]
    Transient(String),

    /// Malformed request or protocol violation. Never retried.
    #[error("Fatal command failure: {0}")]
    Fatal(String),

    /// Device went away. Handled by resynchronization, not by retry.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The referenced target vanished between attempts.
    #[error("Command target no longer exists: {0}")]
    TargetGone(String),
}

impl CommandError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CommandError::Transient(_))
    }
}

/// Connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Device did not answer within {0} ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// Commands
// ============================================================================

/// Rough effect class of a command payload, used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Stops or releases an output.
    Release,
    /// Pre-loads something with no on-air effect.
    Prepare,
    /// Starts or takes an output.
    Engage,
}

/// Implemented by adapter payload types.
pub trait CommandPhase {
    fn phase(&self) -> Phase;
}

/// Diagnostic description of why a command exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandContext {
    pub description: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl CommandContext {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            old: None,
            new: None,
        }
    }

    /// Attach the old and new sub-state for logging.
    pub fn with_change<O: Serialize, N: Serialize>(mut self, old: &O, new: &N) -> Self {
        self.old = serde_json::to_value(old).ok();
        self.new = serde_json::to_value(new).ok();
        self
    }
}

impl std::fmt::Display for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// One scheduled device command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command<P> {
    pub payload: P,
    pub context: CommandContext,
    /// Timeline object that caused the command, when there is one.
    pub object_id: Option<String>,
    /// When to execute.
    pub time: Time,
    /// Ordering group; only meaningful for `SendMode::InOrder` queues.
    pub group: Option<String>,
}

impl<P> Command<P> {
    pub fn new(time: Time, payload: P, context: CommandContext) -> Self {
        Self {
            payload,
            context,
            object_id: None,
            time,
            group: None,
        }
    }

    pub fn for_object(mut self, object_id: Option<impl Into<String>>) -> Self {
        self.object_id = object_id.map(Into::into);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Stable reorder putting release commands ahead of everything else, so a
/// resource is freed before something new is started on it.
pub fn order_release_first<P: CommandPhase>(mut commands: Vec<Command<P>>) -> Vec<Command<P>> {
    commands.sort_by_key(|c| c.payload.phase() != Phase::Release);
    commands
}

// ============================================================================
// State
// ============================================================================

/// A device state with the time it was committed for.
#[derive(Debug)]
pub struct Timed<S> {
    pub time: Time,
    pub state: Arc<S>,
}

impl<S> Timed<S> {
    pub fn new(time: Time, state: S) -> Self {
        Self {
            time,
            state: Arc::new(state),
        }
    }

    pub fn shared(time: Time, state: Arc<S>) -> Self {
        Self { time, state }
    }
}

impl<S> Clone for Timed<S> {
    fn clone(&self) -> Self {
        Self {
            time: self.time,
            state: self.state.clone(),
        }
    }
}

/// Result of converting a snapshot into device state.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion<S> {
    pub state: S,
    pub warnings: Vec<ConversionError>,
}

impl<S> Conversion<S> {
    pub fn new(state: S, warnings: Vec<ConversionError>) -> Self {
        Self { state, warnings }
    }
}

/// Times a diff needs besides the two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffContext {
    /// Time the new state takes effect.
    pub time: Time,
    /// Current clock time.
    pub now: Time,
    /// Time the previous state was committed for.
    pub previous_time: Time,
}

impl DiffContext {
    /// Earliest sensible time to pre-load something needed at `self.time`.
    ///
    /// Aims for `lead` ms early but never before `wait` ms after the previous
    /// commit, never in the past, and always strictly before `time`.
    pub fn prepare_time(&self, lead: Time, wait: Time) -> Time {
        let mut prepare = self
            .time
            .min((self.time - lead).max(self.previous_time + wait));
        if prepare < self.now {
            prepare = self.now;
        }
        if prepare >= self.time {
            prepare = self.time - 10;
        }
        prepare
    }
}

/// What an adapter does with a tag value it has no command for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledTagPolicy {
    /// Stop whatever is running on the affected resource.
    #[default]
    Stop,
    /// Leave the device alone.
    Ignore,
}

// ============================================================================
// Status and actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Good,
    Degraded,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub code: StatusCode,
    pub messages: Vec<String>,
}

impl DeviceStatus {
    pub fn good() -> Self {
        Self {
            code: StatusCode::Good,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResultCode {
    Ok,
    Error,
}

/// Reply to a device action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub code: ActionResultCode,
    pub message: Option<String>,
    pub response: Option<Value>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            code: ActionResultCode::Ok,
            message: None,
            response: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ActionResultCode::Error,
            message: Some(message.into()),
            response: None,
        }
    }

    pub fn not_found(action: &str) -> Self {
        Self::error(format!("Action '{}' not found", action))
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == ActionResultCode::Ok
    }
}

// ============================================================================
// Adapter traits
// ============================================================================

/// Pure conversion and diffing for one device kind.
pub trait StateDiffer: Send + Sync + 'static {
    type State: Clone + PartialEq + Debug + Serialize + Send + Sync + 'static;
    type Payload: Clone + Debug + Serialize + CommandPhase + Send + Sync + 'static;

    /// Short device kind name, used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Complete state of an idle device.
    fn default_state(&self) -> Self::State;

    /// Derive this device's state from a snapshot.
    ///
    /// Must be deterministic and always yield a complete state. Layers with
    /// broken mappings or content are skipped and reported as warnings.
    fn convert(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        mappings: &Mappings,
    ) -> Result<Conversion<Self::State>, ProgrammingError>;

    /// Commands that take the device from `old` to `new`.
    ///
    /// `diff(x, x)` must be empty. Release commands for a resource must
    /// precede engage commands for it.
    fn diff(
        &self,
        old: &Timed<Self::State>,
        new: &Timed<Self::State>,
        ctx: &DiffContext,
    ) -> Result<Vec<Command<Self::Payload>>, ProgrammingError>;

    fn send_mode(&self) -> SendMode {
        SendMode::Burst
    }

    fn unhandled_tag_policy(&self) -> UnhandledTagPolicy {
        UnhandledTagPolicy::Ignore
    }
}

/// I/O side of a device.
#[async_trait]
pub trait DeviceConnection<P, S>: Send + Sync
where
    P: Send + Sync + 'static,
    S: Send + 'static,
{
    async fn connect(&self) -> Result<(), ConnectionError>;

    async fn disconnect(&self);

    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), ConnectionError>;

    /// Read the actual device state.
    async fn query_state(&self) -> Result<S, ConnectionError>;

    async fn send(&self, command: &Command<P>) -> Result<(), CommandError>;

    /// Whether the thing `command` refers to still exists on the device.
    async fn target_exists(&self, _command: &Command<P>) -> bool {
        true
    }

    async fn execute_action(&self, action: &str, _payload: &Value) -> ActionResult {
        ActionResult::not_found(action)
    }
}

// ============================================================================
// Decoding helpers for adapters
// ============================================================================

/// Decode layer content tagged with a `type` field.
///
/// - Unknown tag: `ProgrammingError`.
/// - Missing tag or malformed fields: warning, `Ok(None)`.
pub fn decode_content<T: DeserializeOwned>(
    device_kind: &'static str,
    layer: &str,
    content: &Value,
    known_tags: &[&str],
    warnings: &mut Vec<ConversionError>,
) -> Result<Option<T>, ProgrammingError> {
    let Some(tag) = content.get(CONTENT_TAG).and_then(Value::as_str) else {
        warnings.push(ConversionError::InvalidContent {
            layer: layer.to_string(),
            reason: format!("missing '{}' field", CONTENT_TAG),
        });
        return Ok(None);
    };

    if !known_tags.contains(&tag) {
        return Err(ProgrammingError::UnknownTag {
            device_kind,
            layer: layer.to_string(),
            tag: tag.to_string(),
        });
    }

    match T::deserialize(content) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(e) => {
            warnings.push(ConversionError::InvalidContent {
                layer: layer.to_string(),
                reason: e.to_string(),
            });
            Ok(None)
        }
    }
}

/// Decode mapping options, recording a warning when they are malformed.
pub fn decode_mapping<T: DeserializeOwned>(
    layer: &str,
    options: &Value,
    warnings: &mut Vec<ConversionError>,
) -> Option<T> {
    match T::deserialize(options) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warnings.push(ConversionError::InvalidMapping {
                layer: layer.to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}
