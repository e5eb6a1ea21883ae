use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::observability::metrics::Metrics;

pub type ConnectionId = Uuid;

/// Serialized frame shared by every connection it is fanned out to.
pub type Payload = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubKind {
    Orders,
    Locations,
    Chat,
}

impl HubKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubKind::Orders => "orders",
            HubKind::Locations => "locations",
            HubKind::Chat => "chat",
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0} hub is not running")]
    Stopped(&'static str),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wire frame: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new<T: Serialize>(kind: &str, data: &T) -> Result<Self, HubError> {
        Ok(Self {
            kind: kind.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn encode(&self) -> Result<Payload, HubError> {
        Ok(serde_json::to_string(self)?.into())
    }
}

enum Command {
    Register {
        id: ConnectionId,
        key: Uuid,
        outbound: mpsc::Sender<Payload>,
    },
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        key: Uuid,
        payload: Payload,
    },
    Count {
        key: Uuid,
        reply: oneshot::Sender<usize>,
    },
}

/// Actor owning the key → connections registry of one live-update domain.
///
/// The registry is only touched inside [`Hub::run`]; everything else talks to
/// it through a [`HubHandle`].
pub struct Hub {
    kind: HubKind,
    commands: mpsc::Receiver<Command>,
    by_key: HashMap<Uuid, HashMap<ConnectionId, mpsc::Sender<Payload>>>,
    key_of: HashMap<ConnectionId, Uuid>,
    metrics: Metrics,
}

impl Hub {
    pub fn new(
        kind: HubKind,
        command_buffer: usize,
        connection_buffer: usize,
        metrics: Metrics,
    ) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(command_buffer.max(1));

        let hub = Self {
            kind,
            commands: receiver,
            by_key: HashMap::new(),
            key_of: HashMap::new(),
            metrics,
        };
        let handle = HubHandle {
            kind,
            commands: sender,
            connection_buffer: connection_buffer.max(1),
        };

        (hub, handle)
    }

    pub async fn run(mut self) {
        info!(hub = self.kind.as_str(), "hub started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register { id, key, outbound } => {
                    let connections = self.by_key.entry(key).or_default();
                    connections.insert(id, outbound);
                    let total = connections.len();
                    self.key_of.insert(id, key);
                    self.gauge().inc();
                    info!(hub = self.kind.as_str(), %key, connection_id = %id, total, "connection registered");
                }
                Command::Unregister { id } => {
                    if self.remove(id) {
                        info!(hub = self.kind.as_str(), connection_id = %id, "connection unregistered");
                    }
                }
                Command::Broadcast { key, payload } => self.fan_out(key, payload),
                Command::Count { key, reply } => {
                    let count = self.by_key.get(&key).map(HashMap::len).unwrap_or(0);
                    let _ = reply.send(count);
                }
            }
        }

        info!(hub = self.kind.as_str(), "hub stopped: all handles dropped");
    }

    fn fan_out(&mut self, key: Uuid, payload: Payload) {
        let Some(connections) = self.by_key.get(&key) else {
            return;
        };

        let mut dropped = Vec::new();
        for (id, outbound) in connections {
            match outbound.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(hub = self.kind.as_str(), %key, connection_id = %id, "slow connection evicted");
                    self.metrics
                        .hub_evictions_total
                        .with_label_values(&[self.kind.as_str()])
                        .inc();
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }

        debug!(
            hub = self.kind.as_str(),
            %key,
            delivered = connections.len() - dropped.len(),
            "frame broadcast"
        );

        for id in dropped {
            self.remove(id);
        }
    }

    /// Drops the connection's outbound sender, which closes its queue.
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(key) = self.key_of.remove(&id) else {
            return false;
        };

        if let Some(connections) = self.by_key.get_mut(&key) {
            connections.remove(&id);
            if connections.is_empty() {
                self.by_key.remove(&key);
            }
        }
        self.gauge().dec();
        true
    }

    fn gauge(&self) -> prometheus::IntGauge {
        self.metrics
            .hub_connections
            .with_label_values(&[self.kind.as_str()])
    }
}

#[derive(Clone)]
pub struct HubHandle {
    kind: HubKind,
    commands: mpsc::Sender<Command>,
    connection_buffer: usize,
}

impl HubHandle {
    pub fn kind(&self) -> HubKind {
        self.kind
    }

    /// Registers a new connection under `key` and returns its outbound queue.
    pub async fn register(&self, key: Uuid) -> Result<Subscriber, HubError> {
        let (outbound, receiver) = mpsc::channel(self.connection_buffer);
        let id = Uuid::new_v4();

        self.send(Command::Register { id, key, outbound }).await?;

        Ok(Subscriber {
            registration: Registration {
                id,
                key,
                hub: self.clone(),
                released: false,
            },
            receiver,
        })
    }

    /// Safe to call any number of times for the same connection.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister { id }).await
    }

    pub async fn broadcast(&self, key: Uuid, frame: &Frame) -> Result<(), HubError> {
        let payload = frame.encode()?;
        self.send(Command::Broadcast { key, payload }).await
    }

    pub async fn connection_count(&self, key: Uuid) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Count { key, reply }).await?;
        response.await.map_err(|_| HubError::Stopped(self.kind.as_str()))
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped(self.kind.as_str()))
    }
}

/// A registered connection: its identity plus the receiving end of its
/// outbound queue. The queue yields `None` once the hub drops the connection.
pub struct Subscriber {
    registration: Registration,
    receiver: mpsc::Receiver<Payload>,
}

impl Subscriber {
    pub fn id(&self) -> ConnectionId {
        self.registration.id
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (Registration, mpsc::Receiver<Payload>) {
        (self.registration, self.receiver)
    }
}

/// Keeps the connection registered until released or dropped.
pub struct Registration {
    id: ConnectionId,
    key: Uuid,
    hub: HubHandle,
    released: bool,
}

impl Registration {
    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.hub.unregister(self.id).await {
            debug!(connection_id = %self.id, key = %self.key, error = %err, "unregister after hub shutdown");
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            // best effort; a stale entry is evicted on the next broadcast to its key
            let _ = self.hub.commands.try_send(Command::Unregister { id: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use super::{Frame, Hub, HubHandle, HubKind};
    use crate::observability::metrics::Metrics;

    fn start(connection_buffer: usize) -> HubHandle {
        let (hub, handle) = Hub::new(HubKind::Orders, 64, connection_buffer, Metrics::new());
        tokio::spawn(hub.run());
        handle
    }

    fn frame(n: u32) -> Frame {
        Frame::new("order_update", &json!({ "n": n })).unwrap()
    }

    #[tokio::test]
    async fn frame_reaches_only_subscribers_of_its_key() {
        let hub = start(8);
        let order_a = Uuid::new_v4();
        let order_b = Uuid::new_v4();

        let mut a1 = hub.register(order_a).await.unwrap();
        let mut a2 = hub.register(order_a).await.unwrap();
        let mut b1 = hub.register(order_b).await.unwrap();

        hub.broadcast(order_a, &frame(1)).await.unwrap();

        let got1 = a1.recv().await.unwrap();
        let got2 = a2.recv().await.unwrap();
        assert_eq!(got1, got2);
        let parsed: serde_json::Value = serde_json::from_str(&got1).unwrap();
        assert_eq!(parsed["type"], "order_update");
        assert_eq!(parsed["data"]["n"], 1);

        let nothing = tokio::time::timeout(Duration::from_millis(50), b1.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn released_connection_gets_nothing_more() {
        let hub = start(8);
        let key = Uuid::new_v4();

        let leaving = hub.register(key).await.unwrap();
        let mut staying = hub.register(key).await.unwrap();
        let (registration, mut leaving_rx) = leaving.split();

        registration.release().await;
        hub.unregister(staying.id()).await.unwrap();
        hub.unregister(staying.id()).await.unwrap();
        hub.broadcast(key, &frame(2)).await.unwrap();

        assert!(leaving_rx.recv().await.is_none());
        assert!(staying.recv().await.is_none());
        assert_eq!(hub.connection_count(key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_queue_evicts_the_slow_connection() {
        let hub = start(1);
        let key = Uuid::new_v4();
        let mut slow = hub.register(key).await.unwrap();

        hub.broadcast(key, &frame(1)).await.unwrap();
        hub.broadcast(key, &frame(2)).await.unwrap();
        assert_eq!(hub.connection_count(key).await.unwrap(), 0);

        let first = slow.recv().await.unwrap();
        assert!(first.contains("\"n\":1"));
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_unregistered() {
        let hub = start(4);
        let key = Uuid::new_v4();
        let sub = hub.register(key).await.unwrap();
        assert_eq!(hub.connection_count(key).await.unwrap(), 1);

        drop(sub);
        assert_eq!(hub.connection_count(key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_no_op() {
        let hub = start(4);
        hub.broadcast(Uuid::new_v4(), &frame(9)).await.unwrap();
        assert_eq!(hub.connection_count(Uuid::new_v4()).await.unwrap(), 0);
    }
}
