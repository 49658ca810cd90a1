//! Transport trait — the publish/subscribe primitives everything else uses.
//!
//! A transport is obtained from a concrete `connect` (see `MqttTransport`
//! and `MemoryBroker`), which also hands back the receiving end of the
//! inbound message channel. Inbound delivery is a channel rather than a
//! callback so that consumers decide which task owns the messages.

use std::future::Future;

use bytes::Bytes;

use chunkcast_core::QoS;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A message a service wants published in reply to an inbound one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker is unreachable or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport was shut down locally.
    #[error("transport closed")]
    Closed,

    /// The client refused the request (bad topic, oversized payload, ...).
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Publish/subscribe primitives.
///
/// `publish` resolves once the broker acknowledged the message at the
/// requested QoS: PUBACK for `AtLeastOnce`, PUBCOMP for `ExactlyOnce`, and
/// as soon as the packet is handed to the network for `AtMostOnce`. It never
/// times out on its own; callers bound the wait.
pub trait Transport: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
