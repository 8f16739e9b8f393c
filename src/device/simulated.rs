//! In-memory device connection with fault injection.
//!
//! Records every command it is asked to send and reports a settable
//! "actual" state. Faults are switched on from the outside:
//!
//! ```ignore
//! let conn = SimulatedConnection::new(DeckState::default());
//! conn.fail_next_sends(3);        // three transient failures, then success
//! conn.set_reachable(false);      // probes fail, sends report connection lost
//! conn.remove_target("clip-a");   // target_exists() turns false for that object
//! ```
//!
//! Used for dry runs of device kinds without a wire protocol and as the
//! connection behind most runner tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ActionResult, Command, CommandError, ConnectionError, DeviceConnection};

pub struct SimulatedConnection<P, S> {
    state: RwLock<S>,
    sent: RwLock<Vec<Command<P>>>,
    missing_targets: RwLock<HashSet<String>>,
    actions: RwLock<Vec<(String, Value)>>,
    reachable: AtomicBool,
    connected: AtomicBool,
    fail_query: AtomicBool,
    fatal_next: AtomicBool,
    transient_failures: AtomicU32,
    send_attempts: AtomicU32,
    send_delay: RwLock<Duration>,
}

impl<P, S> SimulatedConnection<P, S> {
    pub fn new(actual_state: S) -> Self {
        Self {
            state: RwLock::new(actual_state),
            sent: RwLock::new(Vec::new()),
            missing_targets: RwLock::new(HashSet::new()),
            actions: RwLock::new(Vec::new()),
            reachable: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            fail_query: AtomicBool::new(false),
            fatal_next: AtomicBool::new(false),
            transient_failures: AtomicU32::new(0),
            send_attempts: AtomicU32::new(0),
            send_delay: RwLock::new(Duration::ZERO),
        }
    }

    /// Make the next `n` sends fail with a transient error.
    pub fn fail_next_sends(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next send fail with a fatal error.
    pub fn fail_next_send_fatally(&self) {
        self.fatal_next.store(true, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_query_fails(&self, fails: bool) {
        self.fail_query.store(fails, Ordering::SeqCst);
    }

    /// Delay every send by `delay` before it completes.
    pub async fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.write().await = delay;
    }

    pub async fn remove_target(&self, object_id: impl Into<String>) {
        self.missing_targets.write().await.insert(object_id.into());
    }

    pub async fn set_actual_state(&self, state: S) {
        *self.state.write().await = state;
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }

    pub async fn received_actions(&self) -> Vec<(String, Value)> {
        self.actions.read().await.clone()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<P: Clone, S> SimulatedConnection<P, S> {
    /// Commands that were successfully sent, in send order.
    pub async fn sent(&self) -> Vec<Command<P>> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl<P, S> DeviceConnection<P, S> for SimulatedConnection<P, S>
where
    P: Clone + std::fmt::Debug + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    async fn connect(&self) -> Result<(), ConnectionError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable("simulated device offline".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::Unreachable("simulated device offline".into()))
        }
    }

    async fn query_state(&self) -> Result<S, ConnectionError> {
        if !self.reachable.load(Ordering::SeqCst) || self.fail_query.load(Ordering::SeqCst) {
            return Err(ConnectionError::Protocol("state query refused".into()));
        }
        Ok(self.state.read().await.clone())
    }

    async fn send(&self, command: &Command<P>) -> Result<(), CommandError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.send_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CommandError::ConnectionLost("simulated device offline".into()));
        }
        if self.fatal_next.swap(false, Ordering::SeqCst) {
            warn!(payload = ?command.payload, "Simulated fatal failure");
            return Err(CommandError::Fatal("simulated protocol violation".into()));
        }
        if Self::take_one(&self.transient_failures) {
            debug!(payload = ?command.payload, "Simulated transient failure");
            return Err(CommandError::Transient("simulated device busy".into()));
        }

        self.sent.write().await.push(command.clone());
        Ok(())
    }

    async fn target_exists(&self, command: &Command<P>) -> bool {
        match &command.object_id {
            Some(id) => !self.missing_targets.read().await.contains(id),
            None => true,
        }
    }

    async fn execute_action(&self, action: &str, payload: &Value) -> ActionResult {
        self.actions
            .write()
            .await
            .push((action.to_string(), payload.clone()));
        ActionResult::not_found(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CommandContext;

    fn command(object_id: &str) -> Command<&'static str> {
        Command::new(0, "go", CommandContext::new("test")).for_object(Some(object_id))
    }

    #[tokio::test]
    async fn test_records_sent_commands() {
        let conn: SimulatedConnection<&'static str, u8> = SimulatedConnection::new(0);
        conn.send(&command("a")).await.unwrap();
        conn.send(&command("b")).await.unwrap();

        let sent = conn.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].object_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_transient_failures_count_down() {
        let conn: SimulatedConnection<&'static str, u8> = SimulatedConnection::new(0);
        conn.fail_next_sends(2);

        assert!(matches!(conn.send(&command("a")).await, Err(CommandError::Transient(_))));
        assert!(matches!(conn.send(&command("a")).await, Err(CommandError::Transient(_))));
        assert!(conn.send(&command("a")).await.is_ok());
        assert_eq!(conn.send_attempts(), 3);
        assert_eq!(conn.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_unreachable_reports_connection_lost() {
        let conn: SimulatedConnection<&'static str, u8> = SimulatedConnection::new(0);
        conn.set_reachable(false);

        assert!(conn.probe().await.is_err());
        assert!(conn.connect().await.is_err());
        assert!(matches!(
            conn.send(&command("a")).await,
            Err(CommandError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_removed_target() {
        let conn: SimulatedConnection<&'static str, u8> = SimulatedConnection::new(0);
        conn.remove_target("a").await;

        assert!(!conn.target_exists(&command("a")).await);
        assert!(conn.target_exists(&command("b")).await);
    }

    #[tokio::test]
    async fn test_query_state_returns_actual_state() {
        let conn: SimulatedConnection<&'static str, u8> = SimulatedConnection::new(3);
        assert_eq!(conn.query_state().await.unwrap(), 3);

        conn.set_actual_state(7).await;
        assert_eq!(conn.query_state().await.unwrap(), 7);

        conn.set_query_fails(true);
        assert!(conn.query_state().await.is_err());
    }
}
