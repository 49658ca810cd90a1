//! File transfer commands.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::broadcast;

use chunkcast_core::config::ChunkcastConfig;
use chunkcast_core::{encode, EncodedPayload, QoS, Topics, TransferError};
use chunkcast_services::{
    publish_whole, ChunkPublisher, PublishOptions, PublishReport, Transport,
};

use super::{connect, Options};

/// Pause before restarting a failed session.
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub async fn cmd_send(config: &ChunkcastConfig, args: &[&str]) -> Result<()> {
    let opts = Options::parse(
        args,
        &["--chunk-size", "--delay-ms", "--retries", "--name"],
    )?;
    let [path] = opts.positionals.as_slice() else {
        anyhow::bail!(
            "usage: chunkcast-ctl send <file> [--chunk-size N] [--delay-ms N] [--retries N] [--name NAME]"
        );
    };

    let chunk_size = opts
        .number("--chunk-size")?
        .unwrap_or(config.transfer.chunk_size);
    let retries = opts.number("--retries")?.unwrap_or(config.transfer.retries);
    let mut options = PublishOptions::from(&config.transfer);
    if let Some(ms) = opts.number("--delay-ms")? {
        options.chunk_delay = Duration::from_millis(ms);
    }

    let data = std::fs::read(path).with_context(|| format!("failed to read file: {path}"))?;
    let filename = match opts.get("--name") {
        Some(name) => name.to_string(),
        None => file_name(path),
    };
    let payload = prepare(config, Bytes::from(data), chunk_size, &filename)?;

    println!(
        "Sending {} ({} bytes) as {} chunk(s) of {} bytes",
        filename, payload.descriptor.total_size, payload.descriptor.num_chunks, chunk_size
    );
    if let Some(id) = &payload.descriptor.transfer_id {
        println!("  transfer id : {id}");
    }

    let (transport, _inbound) = connect(config, chunk_size).await?;

    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            let _ = cancel_tx.send(());
        }
    });

    let topics = Topics::new(config.topics.namespace.clone());
    let result = send_with_retries(
        &transport,
        topics,
        options,
        &payload,
        retries,
        RETRY_DELAY,
        cancel_rx,
    )
    .await;
    let _ = transport.disconnect().await;

    let report = result?;
    println!(
        "Sent {} chunk(s), {} bytes in {:.1}s",
        report.chunks_sent,
        report.bytes_sent,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

pub async fn cmd_send_whole(config: &ChunkcastConfig, args: &[&str]) -> Result<()> {
    let opts = Options::parse(args, &["--topic"])?;
    let [path] = opts.positionals.as_slice() else {
        anyhow::bail!("usage: chunkcast-ctl send-whole <file> [--topic T]");
    };
    let topic = opts
        .get("--topic")
        .unwrap_or(config.topics.whole_file.as_str());

    let data = std::fs::read(path).with_context(|| format!("failed to read file: {path}"))?;
    let len = data.len();
    let (transport, _inbound) = connect(config, len).await?;

    let result = publish_whole(
        &transport,
        topic,
        Bytes::from(data),
        QoS::AtLeastOnce,
        config.transfer.ack_timeout(),
    )
    .await;
    let _ = transport.disconnect().await;
    result?;

    println!("Published {path} ({len} bytes) on {topic}");
    Ok(())
}

/// Encode and tag a payload according to the transfer settings.
fn prepare(
    config: &ChunkcastConfig,
    data: Bytes,
    chunk_size: usize,
    filename: &str,
) -> Result<EncodedPayload, TransferError> {
    let mut payload = encode(data, chunk_size, filename)?;
    if config.transfer.include_digest {
        payload = payload.with_digest();
    }
    if config.transfer.session_ids {
        payload = payload.with_transfer_id(format!("{:016x}", rand::random::<u64>()))?;
    }
    Ok(payload)
}

/// Publish, restarting the whole session after retryable failures.
pub async fn send_with_retries<T: Transport>(
    transport: &T,
    topics: Topics,
    options: PublishOptions,
    payload: &EncodedPayload,
    retries: u32,
    retry_delay: Duration,
    cancel: broadcast::Receiver<()>,
) -> Result<PublishReport, TransferError> {
    let mut publisher = ChunkPublisher::new(transport, topics, options).with_cancel(cancel);
    let mut attempt = 0;
    loop {
        match publisher.publish(payload).await {
            Ok(report) => return Ok(report),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                eprintln!("Transfer failed: {e}");
                eprintln!("Restarting from metadata (attempt {} of {})", attempt + 1, retries + 1);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string()
}
