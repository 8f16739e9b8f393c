//! onair: playout runner
//!
//! Builds every configured device, then reads resolved timeline snapshots
//! from stdin, one JSON object per line:
//!
//! ```text
//! {"snapshot": {"time": 1700000000000, "layers": {...}}, "mappings": {...}}
//! ```
//!
//! Scheduled commands and device events are written to stdout as JSON
//! lines. After stdin closes the queued commands keep running until ctrl-c.
//!
//! ## Configuration
//! - First argument: config file path (optional)
//! - ONAIR_CONFIG: config file path (optional)
//! - ONAIR_LOG: log filter (default: info)

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use onair::clock::SystemClock;
use onair::config::Config;
use onair::integrations::add_configured_device;
use onair::utils::bootstrap::init_tracing;
use onair::{Conductor, Mappings, Snapshot};

#[derive(Debug, Deserialize)]
struct SnapshotInput {
    snapshot: Snapshot,
    #[serde(default)]
    mappings: Mappings,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let conductor = Arc::new(Conductor::new(Arc::new(SystemClock)));
    for device in &config.devices {
        if let Err(e) = add_configured_device(&conductor, device, config.device_settings(device)).await {
            error!(device_id = %device.id, kind = %device.kind, error = %e, "Device not started");
        }
    }
    info!(devices = conductor.device_ids().await.len(), "onair started");

    let mut events = conductor.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", json!({ "event": event })),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event output lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let input: SnapshotInput = match serde_json::from_str(&line) {
                    Ok(input) => input,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable snapshot");
                        continue;
                    }
                };
                for (device_id, result) in conductor.handle_snapshot(input.snapshot, input.mappings).await {
                    let output = match result {
                        Ok(outcome) => json!({
                            "device": device_id,
                            "commands": outcome.commands,
                            "warnings": outcome.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        }),
                        Err(e) => json!({ "device": device_id, "error": e.to_string() }),
                    };
                    println!("{}", output);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                conductor.terminate().await;
                printer.abort();
                return Ok(());
            }
        }
    }

    info!("Input closed, running queued commands until interrupted");
    tokio::signal::ctrl_c().await?;
    conductor.terminate().await;
    printer.abort();
    Ok(())
}
