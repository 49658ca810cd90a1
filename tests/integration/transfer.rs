//! Successful transfers, including out-of-order and duplicated delivery.

use std::time::Duration;

use bytes::Bytes;

use chunkcast_core::{encode, Topics, TransferKey};
use chunkcast_services::{
    ChunkPublisher, Fault, MemoryBroker, PayloadStore, ReassemblySettings, TransferEvent,
};

use crate::{fast_options, payload, Receiver};

// ═══════════════════════════════════════════════════════════════════════════════
// Happy path
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ring_wav_arrives_intact() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    let data = payload(120_000);
    let encoded = encode(data.clone(), 50_000, "ring.wav").unwrap();
    let report = ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();
    assert_eq!(report.chunks_sent, 3);
    assert_eq!(report.bytes_sent, 120_000);

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.key, TransferKey::Anonymous);
    assert_eq!(done.descriptor.filename, "ring.wav");
    assert_eq!(done.descriptor.num_chunks, 3);
    assert_eq!(done.payload, data);
    assert_eq!(done.duplicates, 0);

    let topics: Vec<String> = broker
        .published()
        .into_iter()
        .map(|r| r.topic)
        .collect();
    assert_eq!(
        topics,
        vec![
            "esp32/sound/meta",
            "esp32/sound/chunk/0",
            "esp32/sound/chunk/1",
            "esp32/sound/chunk/2",
            "esp32/sound/complete",
        ]
    );
}

#[tokio::test]
async fn single_chunk_and_exact_multiple() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    for (len, chunk_size, expected_chunks) in [(100, 50_000, 1), (100_000, 50_000, 2)] {
        let data = payload(len);
        let encoded = encode(data.clone(), chunk_size, "clip.wav").unwrap();
        ChunkPublisher::new(&sender, Topics::default(), fast_options())
            .publish(&encoded)
            .await
            .unwrap();

        let TransferEvent::Completed(done) = rx.next_event().await else {
            panic!("expected completion for {len} bytes");
        };
        assert_eq!(done.descriptor.num_chunks, expected_chunks);
        assert_eq!(done.payload, data);
    }
}

#[tokio::test]
async fn empty_payload_completes_without_chunks() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    let encoded = encode(Bytes::new(), 1024, "silence.wav").unwrap();
    let report = ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();
    assert_eq!(report.chunks_sent, 0);
    assert_eq!(broker.published().len(), 2);

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert!(done.payload.is_empty());
    assert_eq!(done.descriptor.num_chunks, 0);
}

#[tokio::test]
async fn digest_is_checked_end_to_end() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    let data = payload(10_000);
    let encoded = encode(data.clone(), 4096, "tone.wav").unwrap().with_digest();
    ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.descriptor.blake3, encoded.descriptor.blake3);
    assert_eq!(done.payload, data);
}

#[tokio::test]
async fn custom_namespace() {
    let topics = Topics::new("lab/audio");
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    let data = payload(3000);
    let encoded = encode(data.clone(), 1000, "a.wav").unwrap();
    ChunkPublisher::new(&sender, topics, fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.payload, data);
    assert!(broker
        .published()
        .iter()
        .all(|r| r.topic.starts_with("lab/audio/")));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery order
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn duplicated_chunk_is_counted_once() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    // meta is ordinal 0, chunk 1 is ordinal 2
    broker.inject(2, Fault::Duplicate);

    let data = payload(12_000);
    let encoded = encode(data.clone(), 5000, "dup.wav").unwrap();
    ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.payload, data);
    assert_eq!(done.duplicates, 1);
}

#[tokio::test]
async fn reordered_chunks_reassemble_by_index() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;

    let data = payload(10);
    let encoded = encode(data.clone(), 4, "r.bin").unwrap();
    let key = encoded.key();

    broker.deliver(&topics.meta(), encoded.descriptor.to_json().unwrap());
    for index in [2, 0, 1, 0] {
        let chunk = &encoded.chunks[index];
        broker.deliver(&topics.chunk(&key, chunk.index), chunk.data.clone());
    }
    broker.deliver(&topics.complete(&key), "done");

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.payload, data);
    assert_eq!(done.duplicates, 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tagged transfers
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_tagged_transfers_do_not_mix() {
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender_a, _) = broker.connect();
    let (sender_b, _) = broker.connect();

    let data_a = payload(9000);
    let data_b: Bytes = vec![0xAB; 7000].into();
    let encoded_a = encode(data_a.clone(), 1000, "a.wav")
        .unwrap()
        .with_transfer_id("aaaa")
        .unwrap();
    let encoded_b = encode(data_b.clone(), 1000, "b.wav")
        .unwrap()
        .with_transfer_id("bbbb")
        .unwrap();

    let mut publisher_a = ChunkPublisher::new(&sender_a, Topics::default(), fast_options());
    let mut publisher_b = ChunkPublisher::new(&sender_b, Topics::default(), fast_options());
    let (a, b) = tokio::join!(publisher_a.publish(&encoded_a), publisher_b.publish(&encoded_b));
    a.unwrap();
    b.unwrap();

    let mut completed = Vec::new();
    for _ in 0..2 {
        match rx.next_event().await {
            TransferEvent::Completed(done) => completed.push(done),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    completed.sort_by(|x, y| x.descriptor.filename.cmp(&y.descriptor.filename));
    assert_eq!(completed[0].key, TransferKey::Id("aaaa".into()));
    assert_eq!(completed[0].payload, data_a);
    assert_eq!(completed[1].key, TransferKey::Id("bbbb".into()));
    assert_eq!(completed[1].payload, data_b);
}

#[tokio::test]
async fn new_metadata_replaces_anonymous_session() {
    let topics = Topics::default();
    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, topics.clone(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    // First session gets metadata and one chunk, then the sender restarts.
    let stale = encode(payload(8), 4, "old.bin").unwrap();
    broker.deliver(&topics.meta(), stale.descriptor.to_json().unwrap());
    broker.deliver(
        &topics.chunk(&TransferKey::Anonymous, 0),
        stale.chunks[0].data.clone(),
    );

    let data = payload(6);
    let encoded = encode(data.clone(), 4, "new.bin").unwrap();
    ChunkPublisher::new(&sender, topics, fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    assert_eq!(done.descriptor.filename, "new.bin");
    assert_eq!(done.payload, data);
    rx.expect_quiet(Duration::from_millis(100)).await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persistence
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn completed_transfer_is_written_to_store() {
    let dir = std::env::temp_dir().join(format!("chunkcast-it-store-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = PayloadStore::new(&dir);

    let broker = MemoryBroker::new();
    let mut rx = Receiver::start(&broker, Topics::default(), ReassemblySettings::default()).await;
    let (sender, _) = broker.connect();

    let data = payload(5000);
    let encoded = encode(data.clone(), 2048, "../../ring.wav").unwrap();
    ChunkPublisher::new(&sender, Topics::default(), fast_options())
        .publish(&encoded)
        .await
        .unwrap();

    let TransferEvent::Completed(done) = rx.next_event().await else {
        panic!("expected completion");
    };
    let path = store.write(&done).unwrap();
    assert_eq!(path, dir.join("ring.wav"));
    assert_eq!(std::fs::read(&path).unwrap(), data.to_vec());

    let _ = std::fs::remove_dir_all(&dir);
}
