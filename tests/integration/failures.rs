//! Lost acknowledgments, dropped connections, missing chunks, and messages
//! the receiver must reject.

use std::time::Duration;

use tokio::sync::broadcast;

use chunkcast_core::{encode, Stage, Topics, TransferError, TransferKey, Violation};
use chunkcast_services::{
    AbandonReason, ChunkPublisher, Fault, MemoryBroker, PublishOptions, ReassemblySettings,
    TransferEvent,
};

use crate::{fast_options, payload, settings, wait_until, Receiver};

// ═══════════════════════════════════════════════════════════════════════════════
// Sender side
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stalled_chunk_times_out_and_receiver_abandons() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(
        &broker,
        Topics::default(),
        settings(Duration::from_millis(300), Duration::from_secs(10)),
    )
    .await;
    let (sender, _) = broker.connect();
    // ordinal 0 = meta, 1 = chunk 0, 2 = chunk 1
    broker.inject(2, Fault::Stall);

    let encoded = encode(payload(120_000), 50_000, "ring.wav").unwrap();
    let err = ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::DeliveryTimeout { .. }), "{err}");
    assert_eq!(err.stage(), Some(Stage::Chunk));
    assert_eq!(err.index(), Some(1));
    assert!(err.is_retryable());

    // Nothing after the stalled chunk was sent.
    assert_eq!(broker.published().len(), 3);

    let TransferEvent::Abandoned(abandoned) = rx.next_event().await else {
        panic!("expected abandonment");
    };
    assert_eq!(abandoned.reason, AbandonReason::Inactivity);
    assert_eq!(abandoned.received, 1);
    assert_eq!(abandoned.total, 3);
    assert_eq!(abandoned.missing, vec![1, 2]);
}

#[tokio::test]
async fn disconnect_during_metadata_is_a_connection_error() {
    let broker = MemoryBroker::new();
    let (sender, _) = broker.connect();
    broker.inject(0, Fault::Disconnect);

    let encoded = encode(payload(100), 50, "a.wav").unwrap();
    let err = ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Connection { stage: Stage::Metadata, index: None, .. }), "{err}");
}

#[tokio::test]
async fn disconnect_on_completion_marker() {
    let broker = MemoryBroker::new();
    let (sender, _) = broker.connect();
    broker.inject(3, Fault::Disconnect);

    let encoded = encode(payload(100), 50, "a.wav").unwrap();
    let err = ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Complete));
    assert_eq!(err.index(), None);
}

#[tokio::test]
async fn cancel_leaves_receiver_session_open() {
    let broker = MemoryBroker::new();
    let rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    let watcher = broker.clone();
    tokio::spawn(async move {
        // meta plus the first chunk
        wait_until(Duration::from_secs(5), || watcher.published().len() >= 2).await;
        let _ = cancel_tx.send(());
    });

    let options = PublishOptions {
        chunk_delay: Duration::from_millis(100),
        ..fast_options()
    };
    let encoded = encode(payload(1000), 100, "long.wav").unwrap();
    let err = ChunkPublisher::new(&sender, Topics::default(), options)
        .with_cancel(cancel_rx)
        .publish(&encoded)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled { .. }), "{err}");
    assert!(!err.is_retryable());
    assert!(broker.published().len() < 12);

    let handle = rx.handle.clone();
    let mut sessions = handle.snapshot().await.unwrap();
    for _ in 0..100 {
        if sessions.first().is_some_and(|s| s.received >= 1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        sessions = handle.snapshot().await.unwrap();
    }
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].filename, "long.wav");
    assert!(sessions[0].received >= 1);
    assert!(!sessions[0].completion_seen);

    assert!(handle.cancel(TransferKey::Anonymous).await.unwrap());
    assert!(handle.snapshot().await.unwrap().is_empty());
    assert!(!handle.cancel(TransferKey::Anonymous).await.unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Missing chunks
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn lost_chunk_reported_then_abandoned_after_grace() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(
        &broker,
        Topics::default(),
        settings(Duration::from_secs(10), Duration::from_millis(200)),
    )
    .await;
    let (sender, _) = broker.connect();
    broker.inject(2, Fault::Discard);

    let encoded = encode(payload(300), 100, "gap.wav").unwrap();
    // The broker acknowledged every publish, so the sender sees success.
    ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    match rx.next_event().await {
        TransferEvent::Incomplete { key, missing } => {
            assert_eq!(key, TransferKey::Anonymous);
            assert_eq!(missing, vec![1]);
        }
        other => panic!("expected incomplete, got {other:?}"),
    }

    let TransferEvent::Abandoned(abandoned) = rx.next_event().await else {
        panic!("expected abandonment");
    };
    assert_eq!(abandoned.reason, AbandonReason::GraceExpired);
    assert_eq!(abandoned.missing, vec![1]);
    assert_eq!(abandoned.filename, "gap.wav");
}

#[tokio::test]
async fn late_chunk_within_grace_completes() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(
        &broker,
        topics.clone(),
        settings(Duration::from_secs(10), Duration::from_secs(10)),
    )
    .await;
    let (sender, _) = broker.connect();
    broker.inject(2, Fault::Discard);

    let data = payload(300);
    let encoded = encode(data.clone(), 100, "gap.wav").unwrap();
    ChunkPublisher::new(&sender, topics.clone(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();
    assert!(matches!(rx.next_event().await, TransferEvent::Incomplete { .. }));

    broker.deliver(
        &topics.chunk(&TransferKey::Anonymous, 1),
        encoded.chunks[1].data.clone(),
    );
    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.payload, data);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Receiver rejections
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn out_of_range_chunk_rejected_without_disturbing_session() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;

    let data = payload(10);
    let encoded = encode(data.clone(), 4, "r.bin").unwrap();
    let key = encoded.key();
    broker.deliver(&topics.meta(), encoded.descriptor.to_json().unwrap());
    broker.deliver(&topics.chunk(&key, 3), vec![0u8; 4]);

    match rx.next_event().await {
        TransferEvent::Rejected(Violation::IndexOutOfRange { index, num_chunks, .. }) => {
            assert_eq!(index, 3);
            assert_eq!(num_chunks, 3);
        }
        other => panic!("expected out-of-range rejection, got {other:?}"),
    }

    for chunk in &encoded.chunks {
        broker.deliver(&topics.chunk(&key, chunk.index), chunk.data.clone());
    }
    broker.deliver(&topics.complete(&key), "done");
    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.payload, data);
}

#[tokio::test]
async fn wrong_length_and_orphan_chunks_rejected() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;
    let key = TransferKey::Anonymous;

    broker.deliver(&topics.chunk(&key, 0), vec![1u8; 4]);
    assert!(matches!(
        rx.next_event().await,
        TransferEvent::Rejected(Violation::NoActiveSession { .. })
    ));

    let encoded = encode(payload(10), 4, "r.bin").unwrap();
    broker.deliver(&topics.meta(), encoded.descriptor.to_json().unwrap());
    // Last chunk must be 2 bytes.
    broker.deliver(&topics.chunk(&key, 2), vec![1u8; 4]);
    match rx.next_event().await {
        TransferEvent::Rejected(Violation::LengthMismatch { index, expected, actual, .. }) => {
            assert_eq!((index, expected, actual), (2, 2, 4));
        }
        other => panic!("expected length mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_messages_rejected() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;

    broker.deliver(&topics.meta(), "{not json");
    assert!(matches!(
        rx.next_event().await,
        TransferEvent::Rejected(Violation::MalformedDescriptor(_))
    ));

    broker.deliver("esp32/sound/chunk/abc", vec![0u8; 1]);
    assert!(matches!(
        rx.next_event().await,
        TransferEvent::Rejected(Violation::MalformedTopic(_))
    ));

    let encoded = encode(payload(4), 4, "s.bin").unwrap();
    broker.deliver(&topics.meta(), encoded.descriptor.to_json().unwrap());
    broker.deliver(&topics.chunk(&TransferKey::Anonymous, 0), encoded.chunks[0].data.clone());
    broker.deliver(&topics.complete(&TransferKey::Anonymous), "finished");
    assert!(matches!(
        rx.next_event().await,
        TransferEvent::Rejected(Violation::UnexpectedSentinel { .. })
    ));

    // The whole-file topic sits under the namespace but is not part of the
    // chunked protocol.
    broker.deliver("esp32/sound", vec![0u8; 16]);
    rx.expect_quiet(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn corrupted_chunk_fails_digest() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;

    let encoded = encode(payload(8), 4, "d.bin").unwrap().with_digest();
    let key = encoded.key();
    broker.deliver(&topics.meta(), encoded.descriptor.to_json().unwrap());
    broker.deliver(&topics.chunk(&key, 0), encoded.chunks[0].data.clone());
    broker.deliver(&topics.chunk(&key, 1), vec![0xFFu8; 4]);
    broker.deliver(&topics.complete(&key), "done");

    assert!(matches!(
        rx.next_event().await,
        TransferEvent::Rejected(Violation::DigestMismatch { .. })
    ));
}

#[tokio::test]
async fn oversized_descriptor_rejected() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(
        &broker,
        Topics::default(),
        ReassemblySettings {
            max_transfer_bytes: 1000,
            ..ReassemblySettings::default()
        },
    )
    .await;
    let (sender, _) = broker.connect();

    let encoded = encode(payload(5000), 1000, "big.wav").unwrap();
    ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    match rx.next_event().await {
        TransferEvent::Rejected(Violation::TooLarge { total_size, limit }) => {
            assert_eq!((total_size, limit), (5000, 1000));
        }
        other => panic!("expected size rejection, got {other:?}"),
    }
    // Every chunk that follows has no session to land in.
    assert!(matches!(
        rx.next_event().await,
        TransferEvent::Rejected(Violation::NoActiveSession { .. })
    ));
}
