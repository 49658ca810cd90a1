//! MQTT transport over rumqttc.
//!
//! rumqttc splits a connection into an `AsyncClient` (requests) and an
//! `EventLoop` (network I/O). The event loop runs on its own task and:
//!   - forwards inbound PUBLISH packets to the inbound channel
//!   - correlates outgoing publishes with PUBACK/PUBCOMP by packet id
//!   - fails every pending acknowledgment when the connection drops
//!   - re-subscribes after a reconnect (sessions are clean)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use chunkcast_core::config::BrokerConfig;
use chunkcast_core::QoS;

use crate::transport::{InboundMessage, Transport, TransportError};

/// Pause between reconnection attempts after the connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// rumqttc refuses keep-alive intervals below this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

type AckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    Down(String),
}

/// Publishes waiting for their acknowledgment.
#[derive(Default)]
struct AckTable {
    /// Handed to the client, packet id not yet assigned. FIFO matches the
    /// order in which the event loop emits `Outgoing::Publish`.
    queued: VecDeque<(QoS, AckSender)>,
    /// Sent with a packet id, waiting for PUBACK/PUBCOMP.
    inflight: HashMap<u16, AckSender>,
    /// Packet ids rumqttc will replay after reconnecting. Their waiters
    /// already failed.
    replayed: HashSet<u16>,
    /// Failed publishes still in the client's request channel. They go out
    /// after reconnecting, ahead of anything queued since.
    stale_requests: usize,
    subscriptions: Vec<(String, QoS)>,
    closing: bool,
}

impl AckTable {
    fn sent(&mut self, pkid: u16) {
        if self.replayed.remove(&pkid) {
            tracing::debug!(pkid, "replayed publish after reconnect");
            return;
        }
        if self.stale_requests > 0 {
            self.stale_requests -= 1;
            tracing::debug!(pkid, "publish from before reconnect");
            return;
        }
        match self.queued.pop_front() {
            Some((qos, waiter)) if !qos.is_acknowledged() => {
                let _ = waiter.send(Ok(()));
            }
            Some((_, waiter)) => {
                self.inflight.insert(pkid, waiter);
            }
            None => {}
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let pending = self.queued.len() + self.inflight.len();
        if pending > 0 {
            tracing::warn!(pending, reason, "failing unacknowledged publishes");
        }
        self.stale_requests += self.queued.len();
        for (_, waiter) in self.queued.drain(..) {
            let _ = waiter.send(Err(TransportError::Connection(reason.to_string())));
        }
        for (pkid, waiter) in self.inflight.drain() {
            self.replayed.insert(pkid);
            let _ = waiter.send(Err(TransportError::Connection(reason.to_string())));
        }
    }
}

fn lock(table: &Mutex<AckTable>) -> MutexGuard<'_, AckTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// A live MQTT connection.
pub struct MqttTransport {
    client: AsyncClient,
    acks: Arc<Mutex<AckTable>>,
    state: watch::Receiver<ConnState>,
    /// Keeps `queued` in the same order as the client's request channel.
    send_order: tokio::sync::Mutex<()>,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Connect and wait for CONNACK.
    ///
    /// `max_packet` bounds both incoming and outgoing packets and must fit a
    /// whole chunk plus its topic.
    pub async fn connect(
        config: &BrokerConfig,
        client_id: &str,
        max_packet: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), TransportError> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive().max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        options.set_max_packet_size(max_packet, max_packet);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(ConnState::Connecting);
        let acks = Arc::new(Mutex::new(AckTable::default()));

        let event_loop = tokio::spawn(drive(
            event_loop,
            client.clone(),
            acks.clone(),
            inbound_tx,
            state_tx,
        ));

        tracing::info!(host = %config.host, port = config.port, client_id, "connecting to broker");

        let wait = async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnState::Connected => return Ok(()),
                    ConnState::Down(reason) => {
                        return Err(TransportError::Connection(reason.clone()))
                    }
                    ConnState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        };

        let outcome = match tokio::time::timeout(config.connect_timeout(), wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Connection(format!(
                "no CONNACK from {}:{} within {}s",
                config.host,
                config.port,
                config.connect_timeout().as_secs()
            ))),
        };

        if let Err(e) = outcome {
            event_loop.abort();
            return Err(e);
        }

        tracing::info!(host = %config.host, port = config.port, "connected to broker");
        Ok((
            Self {
                client,
                acks,
                state: state_rx,
                send_order: tokio::sync::Mutex::new(()),
                event_loop,
            },
            inbound_rx,
        ))
    }

    fn ensure_up(&self) -> Result<(), TransportError> {
        match &*self.state.borrow() {
            ConnState::Connected => Ok(()),
            ConnState::Connecting => Err(TransportError::Connection("reconnecting".into())),
            ConnState::Down(reason) => Err(TransportError::Connection(reason.clone())),
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError> {
        self.ensure_up()?;
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.send_order.lock().await;
            lock(&self.acks).queued.push_back((qos, tx));
            let sent = self
                .client
                .publish_bytes(topic, to_rumqttc(qos), false, payload)
                .await;
            if let Err(e) = sent {
                lock(&self.acks).queued.pop_back();
                return Err(TransportError::Rejected(e.to_string()));
            }
        }
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, to_rumqttc(qos))
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let mut acks = lock(&self.acks);
        if !acks.subscriptions.iter().any(|(f, _)| f == filter) {
            acks.subscriptions.push((filter.to_string(), qos));
        }
        tracing::info!(filter, ?qos, "subscribed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        lock(&self.acks).closing = true;
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    acks: Arc<Mutex<AckTable>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    state: watch::Sender<ConnState>,
) {
    let mut connected_once = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    tracing::error!(%reason, "connect failed");
                    state.send_replace(ConnState::Down(reason));
                    continue;
                }
                if connected_once {
                    resubscribe(&client, &acks);
                }
                connected_once = true;
                state.send_replace(ConnState::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, len = publish.payload.len(), "inbound publish");
                let msg = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if inbound.send(msg).is_err() {
                    tracing::debug!("inbound receiver dropped, discarding message");
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&acks).sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => lock(&acks).acknowledged(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => lock(&acks).acknowledged(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("disconnect sent, stopping event loop");
                lock(&acks).fail_all("disconnected");
                state.send_replace(ConnState::Down("disconnected".into()));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                let closing = {
                    let mut table = lock(&acks);
                    table.fail_all(&reason);
                    table.closing
                };
                state.send_replace(ConnState::Down(reason.clone()));
                if closing {
                    return;
                }
                tracing::warn!(error = %reason, "broker connection lost, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn resubscribe(client: &AsyncClient, acks: &Mutex<AckTable>) {
    let subscriptions = lock(acks).subscriptions.clone();
    for (filter, qos) in subscriptions {
        // try_subscribe: awaiting here would block the loop that drains requests.
        if let Err(e) = client.try_subscribe(filter.as_str(), to_rumqttc(qos)) {
            tracing::warn!(filter = %filter, error = %e, "resubscribe failed");
        } else {
            tracing::info!(filter = %filter, "resubscribed after reconnect");
        }
    }
}
