//! End-to-end transfer tests over the in-process broker.
//!
//! Every test wires a sending client and a receiving client to one
//! `MemoryBroker`. The receiver side runs the real `SessionManager` behind a
//! `TransferService`, so messages take the same path they take in the daemon.
//! Faults are injected at the broker by publication ordinal.
//!
//! The `live` module additionally runs against a real broker when
//! `CHUNKCAST_TEST_BROKER=host:port` is set, and is skipped otherwise.

mod failures;
mod live;
mod transfer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use chunkcast_core::{QoS, Topics};
use chunkcast_services::{
    MemoryBroker, MemoryTransport, PublishOptions, ReassemblySettings, SessionHandle,
    SessionManager, TopicService, TransferEvent, TransferService, Transport,
};

// ── Harness ──────────────────────────────────────────────────────────────────

/// How long to wait for a single receiver event before failing the test.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Publish options with no pacing and a short acknowledgment timeout.
pub fn fast_options() -> PublishOptions {
    PublishOptions {
        qos: QoS::AtLeastOnce,
        chunk_delay: Duration::ZERO,
        metadata_delay: Duration::ZERO,
        ack_timeout: Duration::from_millis(200),
    }
}

pub fn settings(inactivity: Duration, grace: Duration) -> ReassemblySettings {
    ReassemblySettings {
        inactivity_timeout: inactivity,
        grace_period: grace,
        max_transfer_bytes: 0,
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>().into()
}

/// A receiving client: session manager, its handle, and the event stream.
pub struct Receiver {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Receiver {
    pub async fn start(broker: &MemoryBroker, topics: Topics, settings: ReassemblySettings) -> Self {
        let (transport, mut inbound) = broker.connect();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let (manager, handle) = SessionManager::new(
            topics.clone(),
            settings,
            Duration::from_millis(10),
            events_tx,
            shutdown_rx,
        );

        let service = Arc::new(TransferService::new(topics, handle.clone()));
        for filter in service.subscriptions() {
            transport
                .subscribe(&filter, QoS::AtLeastOnce)
                .await
                .expect("subscribe");
        }

        let manager_task = tokio::spawn(async move {
            manager.run().await.expect("session manager");
        });
        let route_task = tokio::spawn(async move {
            // Keep the transport alive for as long as we route.
            let _transport: MemoryTransport = transport;
            while let Some(msg) = inbound.recv().await {
                if service.handle_message(&msg).is_err() {
                    break;
                }
            }
        });

        Self {
            handle,
            events,
            shutdown,
            tasks: vec![manager_task, route_task],
        }
    }

    /// Next event, or panic after [`EVENT_WAIT`].
    pub async fn next_event(&mut self) -> TransferEvent {
        tokio::time::timeout(EVENT_WAIT, self.events.recv())
            .await
            .expect("timed out waiting for receiver event")
            .expect("event channel closed")
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_quiet(&mut self, wait: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(wait, self.events.recv()).await {
            panic!("unexpected event: {event:?}");
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `cond` every 10ms until it holds or `wait` elapses.
pub async fn wait_until<F: FnMut() -> bool>(wait: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
