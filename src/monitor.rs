//! Connection monitor.
//!
//! Probes a device on a fixed interval of the device clock and tells the owning runner when
//! reachability flips. Every cycle also produces a `MonitorCycle` tick so
//! the runner can retry a resynchronization that failed earlier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, Time};
use crate::device::DeviceConnection;
use crate::runner::DeviceRequest;
use crate::task::PeriodicTask;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_interval_ms: u64,
    /// A probe taking longer than this counts as unreachable.
    pub probe_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
        }
    }
}

pub struct ConnectionMonitor {
    connected: Arc<AtomicBool>,
    task: PeriodicTask,
}

impl ConnectionMonitor {
    pub(crate) fn start<P, S>(
        device_id: &str,
        connection: Arc<dyn DeviceConnection<P, S>>,
        config: &MonitorConfig,
        initially_connected: bool,
        clock: Arc<dyn Clock>,
        signals: mpsc::UnboundedSender<DeviceRequest>,
    ) -> Self
    where
        P: Send + Sync + 'static,
        S: Send + 'static,
    {
        let connected = Arc::new(AtomicBool::new(initially_connected));
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let device_id = device_id.to_string();

        let state = connected.clone();
        let task = PeriodicTask::spawn_on_clock(
            "connection-monitor",
            clock,
            config.probe_interval_ms as Time,
            move || {
                let connection = connection.clone();
                let signals = signals.clone();
                let state = state.clone();
                let device_id = device_id.clone();
                async move {
                    let reachable =
                        match tokio::time::timeout(probe_timeout, connection.probe()).await {
                            Ok(Ok(())) => true,
                            Ok(Err(e)) => {
                                debug!(device_id = %device_id, error = %e, "Probe failed");
                                false
                            }
                            Err(_) => {
                                warn!(device_id = %device_id, timeout = ?probe_timeout, "Probe timed out");
                                false
                            }
                        };

                    if state.swap(reachable, Ordering::SeqCst) != reachable {
                        info!(device_id = %device_id, reachable, "Device connectivity changed");
                        let _ = signals.send(DeviceRequest::Connectivity(reachable));
                    }
                    let _ = signals.send(DeviceRequest::MonitorCycle);
                }
            },
        );

        Self { connected, task }
    }

    /// Record a connectivity change noticed elsewhere (e.g. a failed send),
    /// so the next probe reports the opposite transition.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.task.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};
    use crate::device::simulated::SimulatedConnection;
    use async_trait::async_trait;
    use crate::device::{Command, CommandError, ConnectionError};

    fn config() -> MonitorConfig {
        MonitorConfig {
            probe_interval_ms: 1000,
            probe_timeout_ms: 200,
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(TokioClock::new(0))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceRequest>) -> Vec<DeviceRequest> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    fn transitions(requests: &[DeviceRequest]) -> Vec<bool> {
        requests
            .iter()
            .filter_map(|r| match r {
                DeviceRequest::Connectivity(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_only_transitions() {
        let conn = Arc::new(SimulatedConnection::<(), ()>::new(()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ConnectionMonitor::start("deck1", conn.clone(), &config(), true, clock(), tx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let requests = drain(&mut rx);
        assert!(transitions(&requests).is_empty());
        assert_eq!(
            requests
                .iter()
                .filter(|r| matches!(r, DeviceRequest::MonitorCycle))
                .count(),
            2
        );

        conn.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(transitions(&drain(&mut rx)), vec![false]);
        assert!(!monitor.is_connected());

        conn.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(transitions(&drain(&mut rx)), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_externally_marked_loss_is_recovered_by_probe() {
        let conn = Arc::new(SimulatedConnection::<(), ()>::new(()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ConnectionMonitor::start("deck1", conn, &config(), true, clock(), tx);

        monitor.set_connected(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transitions(&drain(&mut rx)), vec![true]);
    }

    struct HangingProbe;

    #[async_trait]
    impl DeviceConnection<(), ()> for HangingProbe {
        async fn connect(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn probe(&self) -> Result<(), ConnectionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn query_state(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn send(&self, _command: &Command<()>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_follow_device_clock() {
        let conn = Arc::new(SimulatedConnection::<(), ()>::new(()));
        let manual = Arc::new(ManualClock::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _monitor =
            ConnectionMonitor::start("deck1", conn.clone(), &config(), true, manual.clone(), tx);

        conn.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(drain(&mut rx).is_empty());

        manual.set(1000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let requests = drain(&mut rx);
        assert_eq!(transitions(&requests), vec![false]);
        assert!(requests.iter().any(|r| matches!(r, DeviceRequest::MonitorCycle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ConnectionMonitor::start("deck1", Arc::new(HangingProbe), &config(), true, clock(), tx);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(transitions(&drain(&mut rx)), vec![false]);
        monitor.stop();
    }
}
