//! Connected automation clients.

use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use tab_relay_core::error::{RelayError, Result};

/// A message queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A JSON text frame.
    Text(String),
    /// Close the socket with the given reason.
    Close(&'static str),
}

/// The set of currently connected automation clients, keyed by client id.
///
/// At most one live client per id; a second registration with the same id is
/// rejected without disturbing the first.
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<Outbound>>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client_id: &str, tx: mpsc::UnboundedSender<Outbound>) -> Result<()> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(client_id) {
            return Err(RelayError::ClientIdInUse(client_id.to_string()));
        }
        clients.insert(client_id.to_string(), tx);
        Ok(())
    }

    pub async fn unregister(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    /// Unicast; returns false if the client is gone.
    pub async fn send(&self, client_id: &str, text: String) -> bool {
        match self.clients.read().await.get(client_id) {
            Some(tx) => tx.send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }

    pub async fn broadcast(&self, text: &str) {
        let clients = self.clients.read().await;
        let mut sent = 0;
        for tx in clients.values() {
            if tx.send(Outbound::Text(text.to_string())).is_ok() {
                sent += 1;
            }
        }
        debug!(sent, "Broadcast to clients");
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Force-close every client and empty the set.
    pub async fn disconnect_all(&self, reason: &'static str) {
        let mut clients = self.clients.write().await;
        for (client_id, tx) in clients.drain() {
            debug!(%client_id, reason, "Disconnecting client");
            let _ = tx.send(Outbound::Close(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_id_is_rejected_without_disturbing_first() {
        let set = ClientSet::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        set.register("a", tx1).await.unwrap();
        let err = set.register("a", tx2).await.unwrap_err();
        assert!(matches!(err, RelayError::ClientIdInUse(_)));

        assert!(set.send("a", "hello".into()).await);
        assert!(matches!(rx1.recv().await, Some(Outbound::Text(t)) if t == "hello"));
        assert_eq!(set.count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let set = ClientSet::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        set.register("a", tx1).await.unwrap();
        set.register("b", tx2).await.unwrap();

        set.broadcast("ev").await;
        assert!(matches!(rx1.recv().await, Some(Outbound::Text(t)) if t == "ev"));
        assert!(matches!(rx2.recv().await, Some(Outbound::Text(t)) if t == "ev"));
    }

    #[tokio::test]
    async fn disconnect_all_closes_and_clears() {
        let set = ClientSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        set.register("a", tx).await.unwrap();

        set.disconnect_all("bye").await;
        assert!(matches!(rx.recv().await, Some(Outbound::Close("bye"))));
        assert_eq!(set.count().await, 0);
        assert!(!set.send("a", "late".into()).await);
    }
}
