//! Monitor collaborator contract.
//!
//! Backend connections never mutate server status themselves; they post a
//! request to whoever owns the monitor (the main worker in a full proxy, a
//! logging task in the probe). The only producer today is the
//! ER_HOST_IS_BLOCKED handshake side effect.

use tokio::sync::mpsc;

/// Requests posted to the monitor owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Take the server out of rotation until an operator intervenes
    SetMaintenance { server: String, reason: String },
}

/// Cloneable sending half handed to backend connections
#[derive(Debug, Clone)]
pub struct MonitorSink {
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl MonitorSink {
    pub fn set_maintenance(&self, server: &str, reason: impl Into<String>) {
        // The monitor owner may already be gone during shutdown
        let _ = self.tx.send(MonitorEvent::SetMaintenance {
            server: server.to_string(),
            reason: reason.into(),
        });
    }
}

/// Create a monitor channel: the sink goes to connections, the receiver to
/// the monitor owner
pub fn channel() -> (MonitorSink, mpsc::UnboundedReceiver<MonitorEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MonitorSink { tx }, rx)
}
