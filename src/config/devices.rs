//! Per-device configuration.

use serde::Deserialize;
use serde_json::Value;

use crate::executor::RetryConfig;
use crate::integrations::http_send::HttpSendOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    /// Adapter kind, e.g. `hyperdeck` or `http_send`.
    pub kind: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Adapter-specific options.
    #[serde(default)]
    pub options: Value,
    /// Overrides the shared retry policy.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub resend_interval_ms: Option<u64>,
}

/// How the device is reached.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// In-memory device that accepts everything. Used for dry runs.
    #[default]
    Simulated,
    Http(HttpSendOptions),
}
