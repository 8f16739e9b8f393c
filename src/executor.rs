//! Command executor: one send, with retry on transient failures.
//!
//! Failure classes (see [`CommandError`]):
//!
//! | Class            | Retried | Reported as                       |
//! |------------------|---------|-----------------------------------|
//! | `Transient`      | yes     | command error once attempts run out |
//! | `Fatal`          | no      | command error                     |
//! | `ConnectionLost` | no      | command error + connectivity loss |
//! | `TargetGone`     | no      | command error                     |
//!
//! Before every retry the connection is asked whether the command's target
//! still exists, so a deleted clip or element is not hammered with resends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::device::{Command, CommandError, DeviceConnection};

/// Retry policy for transient command failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 300,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Duration::from_millis(self.backoff_ms))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Result of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub attempts: u32,
    pub result: Result<(), CommandError>,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct CommandExecutor<P, S>
where
    P: Send + Sync + 'static,
    S: Send + 'static,
{
    device_id: String,
    connection: Arc<dyn DeviceConnection<P, S>>,
    retry: RetryConfig,
}

impl<P, S> Clone for CommandExecutor<P, S>
where
    P: Send + Sync + 'static,
    S: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            connection: self.connection.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<P, S> CommandExecutor<P, S>
where
    P: std::fmt::Debug + Send + Sync + 'static,
    S: Send + 'static,
{
    pub fn new(
        device_id: impl Into<String>,
        connection: Arc<dyn DeviceConnection<P, S>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            connection,
            retry,
        }
    }

    /// Send `command`, retrying transient failures.
    pub async fn execute(&self, command: &Command<P>) -> CommandOutcome {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > 1 && !self.connection.target_exists(command).await {
                return Err(CommandError::TargetGone(command.context.description.clone()));
            }
            self.connection.send(command).await
        })
        .retry(self.retry.backoff())
        .when(CommandError::is_transient)
        .notify(|err, delay| {
            warn!(
                device_id = %self.device_id,
                attempt = attempts.load(Ordering::SeqCst),
                delay = ?delay,
                error = %err,
                "Command failed, retrying"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        if result.is_ok() {
            debug!(
                device_id = %self.device_id,
                attempts,
                payload = ?command.payload,
                "Command sent"
            );
        }

        CommandOutcome { attempts, result }
    }
}
