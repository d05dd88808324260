use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// An event on its way to a client; the transport decides the wire encoding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: JsonValue,
}

/// Outbound delivery as seen from the core
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_to_user(&self, user_id: &str, event: &str, payload: JsonValue) -> Result<()>;
    async fn send_to_socket(&self, socket_id: &str, event: &str, payload: JsonValue) -> Result<()>;
    async fn broadcast(&self, event: &str, payload: JsonValue) -> Result<()>;
}

struct Connection {
    user_id: Option<String>,
    sender: mpsc::Sender<OutboundEvent>,
}

/// Manages client connections registered by the transport layer
#[derive(Clone, Default)]
pub struct ConnectionNotifier {
    /// Maps socket_id to the channel feeding that socket
    connections: Arc<RwLock<HashMap<String, Connection>>>,
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket's outbound channel
    pub async fn register(&self, socket_id: &str, sender: mpsc::Sender<OutboundEvent>) {
        let mut connections = self.connections.write().await;
        connections.insert(
            socket_id.to_string(),
            Connection {
                user_id: None,
                sender,
            },
        );
    }

    /// Associate an authenticated user with a registered socket
    pub async fn bind_user(&self, socket_id: &str, user_id: &str) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(socket_id)
            .ok_or_else(|| anyhow!("Socket {} is not registered", socket_id))?;
        connection.user_id = Some(user_id.to_string());
        Ok(())
    }

    pub async fn unregister(&self, socket_id: &str) {
        let mut connections = self.connections.write().await;
        connections.remove(socket_id);
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections
            .values()
            .any(|c| c.user_id.as_deref() == Some(user_id))
    }
}

#[async_trait]
impl Notifier for ConnectionNotifier {
    async fn send_to_user(&self, user_id: &str, event: &str, payload: JsonValue) -> Result<()> {
        let connections = self.connections.read().await;
        let mut delivered = false;
        for connection in connections
            .values()
            .filter(|c| c.user_id.as_deref() == Some(user_id))
        {
            let message = OutboundEvent {
                event: event.to_string(),
                payload: payload.clone(),
            };
            if connection.sender.send(message).await.is_ok() {
                delivered = true;
            }
        }

        if delivered {
            Ok(())
        } else {
            Err(anyhow!("Player {} not connected", user_id))
        }
    }

    async fn send_to_socket(&self, socket_id: &str, event: &str, payload: JsonValue) -> Result<()> {
        let connections = self.connections.read().await;
        let connection = connections
            .get(socket_id)
            .ok_or_else(|| anyhow!("Socket {} not connected", socket_id))?;
        connection
            .sender
            .send(OutboundEvent {
                event: event.to_string(),
                payload,
            })
            .await
            .map_err(|_| anyhow!("Failed to send message to socket {}", socket_id))
    }

    async fn broadcast(&self, event: &str, payload: JsonValue) -> Result<()> {
        let connections = self.connections.read().await;
        for (socket_id, connection) in connections.iter() {
            let message = OutboundEvent {
                event: event.to_string(),
                payload: payload.clone(),
            };
            if connection.sender.send(message).await.is_err() {
                debug!(socket_id = %socket_id, "Dropping broadcast to closed socket");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_to_user_reaches_bound_sockets_only() {
        let notifier = ConnectionNotifier::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        notifier.register("sockA", tx_a).await;
        notifier.register("sockB", tx_b).await;
        notifier.bind_user("sockA", "u1").await.unwrap();

        notifier.send_to_user("u1", "match:found", json!({ "x": 1 })).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap().event, "match:found");
        assert!(rx_b.try_recv().is_err());

        assert!(notifier.send_to_user("u2", "match:found", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let notifier = ConnectionNotifier::new();
        let (tx, _rx) = mpsc::channel(4);
        notifier.register("sockA", tx).await;
        notifier.bind_user("sockA", "u1").await.unwrap();
        assert!(notifier.is_connected("u1").await);

        notifier.unregister("sockA").await;
        assert!(!notifier.is_connected("u1").await);
        assert!(notifier.send_to_socket("sockA", "game:end", json!({})).await.is_err());
    }
}
