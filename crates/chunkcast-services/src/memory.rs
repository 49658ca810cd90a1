//! In-process broker for tests and local runs.
//!
//! Routes publications to every connected client whose subscription filter
//! matches, using MQTT wildcard rules. Faults can be scheduled against the
//! N-th publication seen by the broker (counting from zero) to simulate lost
//! acknowledgments, dropped connections, duplicates, and silent loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use chunkcast_core::wire::topic_matches;
use chunkcast_core::QoS;

use crate::transport::{InboundMessage, Transport, TransportError};

/// Misbehaviour to apply to one publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never acknowledge and never deliver. The publish future stays pending.
    Stall,
    /// Fail the publish as if the connection dropped.
    Disconnect,
    /// Acknowledge and deliver twice.
    Duplicate,
    /// Acknowledge but do not deliver.
    Discard,
}

/// One publication as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub client: u64,
    pub topic: String,
    pub len: usize,
    pub qos: QoS,
}

#[derive(Default)]
struct BrokerState {
    next_client: u64,
    clients: HashMap<u64, Client>,
    faults: HashMap<usize, Fault>,
    log: Vec<PublishRecord>,
}

struct Client {
    subscriptions: Vec<String>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl BrokerState {
    fn route(&self, topic: &str, payload: &Bytes) {
        for client in self.clients.values() {
            if client.subscriptions.iter().any(|f| topic_matches(f, topic)) {
                // A client that dropped its receiver simply misses the message.
                let _ = client
                    .tx
                    .send(InboundMessage::new(topic, payload.clone()));
            }
        }
    }
}

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect a new client.
    pub fn connect(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(
            id,
            Client {
                subscriptions: Vec::new(),
                tx,
            },
        );
        tracing::debug!(client = id, "memory client connected");
        (
            MemoryTransport {
                broker: self.clone(),
                client: id,
            },
            rx,
        )
    }

    /// Schedule a fault for the `ordinal`-th publication (zero-based).
    pub fn inject(&self, ordinal: usize, fault: Fault) {
        self.lock().faults.insert(ordinal, fault);
    }

    /// Deliver a message to subscribers without going through a client.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.lock().route(topic, &payload.into());
    }

    /// Every publication accepted so far, in order.
    pub fn published(&self) -> Vec<PublishRecord> {
        self.lock().log.clone()
    }

    pub fn connected_clients(&self) -> usize {
        self.lock().clients.len()
    }
}

/// A client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client: u64,
}

impl MemoryTransport {
    pub fn client_id(&self) -> u64 {
        self.client
    }
}

impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError> {
        let fault = {
            let mut state = self.broker.lock();
            if !state.clients.contains_key(&self.client) {
                return Err(TransportError::Closed);
            }
            let ordinal = state.log.len();
            state.log.push(PublishRecord {
                client: self.client,
                topic: topic.to_string(),
                len: payload.len(),
                qos,
            });
            let fault = state.faults.remove(&ordinal);
            match fault {
                None => state.route(topic, &payload),
                Some(Fault::Duplicate) => {
                    state.route(topic, &payload);
                    state.route(topic, &payload);
                }
                Some(Fault::Stall | Fault::Disconnect | Fault::Discard) => {}
            }
            fault
        };

        match fault {
            Some(Fault::Stall) => {
                tracing::debug!(topic, "memory broker stalling publication");
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::Disconnect) => Err(TransportError::Connection(
                "connection reset by memory broker".into(),
            )),
            _ => Ok(()),
        }
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let client = state
            .clients
            .get_mut(&self.client)
            .ok_or(TransportError::Closed)?;
        if !client.subscriptions.iter().any(|f| f == filter) {
            client.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.lock().clients.remove(&self.client);
        tracing::debug!(client = self.client, "memory client disconnected");
        Ok(())
    }
}
