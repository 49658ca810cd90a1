//! Transfers through a real MQTT broker.
//!
//! Set `CHUNKCAST_TEST_BROKER=host:port` to run these; they are skipped
//! otherwise.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use chunkcast_core::config::BrokerConfig;
use chunkcast_core::{encode, QoS, Topics};
use chunkcast_services::{
    ChunkPublisher, MqttTransport, PublishOptions, ReassemblySettings, SessionManager, TransferEvent, Transport,
};

use crate::{fast_options, payload, EVENT_WAIT};

fn broker_config() -> Option<BrokerConfig> {
    let addr = std::env::var("CHUNKCAST_TEST_BROKER").ok()?;
    let (host, port) = addr.rsplit_once(':')?;
    Some(BrokerConfig {
        host: host.to_string(),
        port: port.parse().ok()?,
        ..BrokerConfig::default()
    })
}

macro_rules! require_broker {
    () => {
        match broker_config() {
            Some(config) => config,
            None => {
                eprintln!("SKIP: CHUNKCAST_TEST_BROKER not set");
                return;
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Live broker
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn live_transfer_round_trip() {
    let config = require_broker!();
    let pid = std::process::id();
    // A private namespace keeps concurrent runs on a shared broker apart.
    let topics = Topics::new(format!("chunkcast-it/{pid}"));

    let (receiver, mut inbound) =
        MqttTransport::connect(&config, &format!("chunkcast-it-rx-{pid}"), 64 * 1024)
            .await
            .expect("receiver connect");
    for filter in topics.subscriptions() {
        receiver
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .expect("subscribe");
    }
    // Give the broker time to install the subscription.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let (manager, handle) = SessionManager::new(
        topics.clone(),
        ReassemblySettings::default(),
        Duration::from_millis(100),
        events_tx,
        shutdown_rx,
    );
    tokio::spawn(manager.run());
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if !handle.deliver(msg) {
                break;
            }
        }
    });

    let (sender, _) = MqttTransport::connect(&config, &format!("chunkcast-it-tx-{pid}"), 64 * 1024)
        .await
        .expect("sender connect");
    let data = payload(40_000);
    let encoded = encode(data.clone(), 16_000, "live.wav").unwrap().with_digest();
    let options = PublishOptions {
        ack_timeout: Duration::from_secs(10),
        ..fast_options()
    };
    let report = ChunkPublisher::new(&sender, topics, options)
        .publish(&encoded)
        .await
        .expect("publish");
    assert_eq!(report.chunks_sent, 3);

    let event = tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for completion")
        .expect("event channel closed");
    let TransferEvent::Completed(done) = event else {
        panic!("expected completion, got {event:?}");
    };
    assert_eq!(done.payload, data);

    let _ = shutdown.send(());
    let _ = sender.disconnect().await;
    let _ = receiver.disconnect().await;
}

#[tokio::test]
async fn live_connect_refused_is_an_error() {
    let mut config = require_broker!();
    // Nothing listens on the discard port.
    config.port = 9;
    config.connect_timeout_secs = 2;
    let result = MqttTransport::connect(&config, "chunkcast-it-refused", 1024).await;
    assert!(result.is_err());
}
