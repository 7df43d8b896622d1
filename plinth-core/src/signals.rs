//! Realtime signal fan-out.
//!
//! Connected WebSocket clients receive platform signals as JSON text
//! frames. The hub is a thin wrapper over a broadcast channel; slow clients
//! that lag past the buffer miss messages rather than blocking the rest.

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

const SIGNAL_BUFFER: usize = 64;

/// Signal kind broadcast when a frontend plugin finished installing.
pub const SIGNAL_PLUGIN_INSTALLED: &str = "PLUGIN_INSTALLED";
/// Signal kind broadcast when a frontend plugin was deregistered.
pub const SIGNAL_PLUGIN_DEREGISTERED: &str = "PLUGIN_DEREGISTERED";

#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub kind: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<Signal>,
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_BUFFER);
        Self { tx }
    }

    /// Fan a signal out to every connected client. A closed channel (no
    /// clients) is not an error.
    pub fn send(&self, kind: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Signal {
            kind: kind.to_string(),
            payload,
        });
    }

    /// Plugin lifecycle signals only concern the frontend shell; backend
    /// plugin ids never reach the channel.
    pub fn send_plugin_signal(&self, kind: &str, plugin_id: &str) {
        if plugin_id.ends_with("-frontend") {
            self.send(kind, json!({ "pluginId": plugin_id }));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frontend_plugin_ids_are_broadcast() {
        let hub = SignalHub::new();
        let mut rx = hub.subscribe();
        hub.send_plugin_signal(SIGNAL_PLUGIN_INSTALLED, "catalog-frontend");

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.kind, SIGNAL_PLUGIN_INSTALLED);
        assert_eq!(signal.payload["pluginId"], "catalog-frontend");
    }

    #[tokio::test]
    async fn backend_plugin_ids_are_filtered() {
        let hub = SignalHub::new();
        let mut rx = hub.subscribe();
        hub.send_plugin_signal(SIGNAL_PLUGIN_INSTALLED, "catalog-backend");
        hub.send_plugin_signal(SIGNAL_PLUGIN_DEREGISTERED, "catalog");

        // Nothing should have been sent.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
