//! Chunk publisher — drives one transfer over a [`Transport`].
//!
//! The protocol is strictly sequential:
//!
//! 1. descriptor JSON on `<ns>/meta`, acknowledged
//! 2. each chunk on `<ns>/chunk/{index}` in index order, each acknowledged
//!    before the next is sent
//! 3. the `done` sentinel on `<ns>/complete`, acknowledged
//!
//! Any failed or overdue acknowledgment aborts the session. Nothing is
//! retried here; restarting a session is the caller's decision.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;

use chunkcast_core::config::TransferConfig;
use chunkcast_core::wire::COMPLETE_SENTINEL;
use chunkcast_core::{EncodedPayload, QoS, Stage, Topics, TransferError};

use crate::transport::{Transport, TransportError};

/// Pacing and acknowledgment settings for one publish.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub qos: QoS,
    /// Pause after each acknowledged chunk.
    pub chunk_delay: Duration,
    /// Pause after the acknowledged descriptor, before the first chunk.
    pub metadata_delay: Duration,
    /// Upper bound on each individual acknowledgment wait.
    pub ack_timeout: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for PublishOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            chunk_delay: config.chunk_delay(),
            metadata_delay: config.metadata_delay(),
            ack_timeout: config.ack_timeout(),
        }
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub chunks_sent: u32,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

pub struct ChunkPublisher<'a, T: Transport> {
    transport: &'a T,
    topics: Topics,
    options: PublishOptions,
    cancel: Option<broadcast::Receiver<()>>,
}

impl<'a, T: Transport> ChunkPublisher<'a, T> {
    pub fn new(transport: &'a T, topics: Topics, options: PublishOptions) -> Self {
        Self {
            transport,
            topics,
            options,
            cancel: None,
        }
    }

    /// Stop publishing when a value is sent on (or the sender lags) `cancel`.
    ///
    /// A closed channel never cancels.
    pub fn with_cancel(mut self, cancel: broadcast::Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn publish(&mut self, payload: &EncodedPayload) -> Result<PublishReport, TransferError> {
        let started = Instant::now();
        let descriptor = &payload.descriptor;
        descriptor.validate()?;
        let key = payload.key();

        tracing::info!(
            transfer = %key,
            filename = %descriptor.filename,
            total_size = descriptor.total_size,
            num_chunks = descriptor.num_chunks,
            chunk_size = descriptor.chunk_size,
            "publishing transfer"
        );

        let meta = descriptor
            .to_json()
            .map_err(|e| TransferError::InvalidArgument(format!("descriptor encoding: {e}")))?;
        self.send(Stage::Metadata, None, self.topics.meta(), Bytes::from(meta))
            .await?;
        self.pause(Stage::Metadata, None, self.options.metadata_delay)
            .await?;

        let mut bytes_sent = 0u64;
        for chunk in &payload.chunks {
            let topic = self.topics.chunk(&key, chunk.index);
            self.send(Stage::Chunk, Some(chunk.index), topic, chunk.data.clone())
                .await?;
            bytes_sent += chunk.len() as u64;
            tracing::debug!(
                transfer = %key,
                index = chunk.index,
                len = chunk.len(),
                "chunk acknowledged"
            );
            self.pause(Stage::Chunk, Some(chunk.index), self.options.chunk_delay)
                .await?;
        }

        self.send(
            Stage::Complete,
            None,
            self.topics.complete(&key),
            Bytes::from_static(COMPLETE_SENTINEL.as_bytes()),
        )
        .await?;

        let report = PublishReport {
            chunks_sent: payload.chunks.len() as u32,
            bytes_sent,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            transfer = %key,
            chunks = report.chunks_sent,
            bytes = report.bytes_sent,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "transfer published"
        );
        Ok(report)
    }

    async fn send(
        &mut self,
        stage: Stage,
        index: Option<u32>,
        topic: String,
        payload: Bytes,
    ) -> Result<(), TransferError> {
        let transport = self.transport;
        let ack_timeout = self.options.ack_timeout;
        let publish = transport.publish(&topic, payload, self.options.qos);
        let acked = tokio::time::timeout(ack_timeout, publish);

        let outcome = match self.cancel.as_mut() {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(TransferError::Cancelled { stage, index }),
                outcome = acked => outcome,
            },
            None => acked.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(%stage, ?index, topic = %topic, error = %e, "publish failed");
                Err(connection_error(stage, index, e))
            }
            Err(_) => {
                tracing::warn!(%stage, ?index, topic = %topic, waited_ms = ack_timeout.as_millis() as u64, "acknowledgment overdue");
                Err(TransferError::DeliveryTimeout {
                    stage,
                    index,
                    waited: ack_timeout,
                })
            }
        }
    }

    async fn pause(
        &mut self,
        stage: Stage,
        index: Option<u32>,
        delay: Duration,
    ) -> Result<(), TransferError> {
        if delay.is_zero() {
            return Ok(());
        }
        match self.cancel.as_mut() {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancelled(cancel) => Err(TransferError::Cancelled { stage, index }),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Resolves when cancellation was requested. A closed channel never resolves.
async fn cancelled(rx: &mut broadcast::Receiver<()>) {
    match rx.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
    }
}

fn connection_error(stage: Stage, index: Option<u32>, e: TransportError) -> TransferError {
    TransferError::Connection {
        stage,
        index,
        reason: e.to_string(),
    }
}

/// Publish a whole file as one message, acknowledgment required.
///
/// Failures are attributed to chunk 0.
pub async fn publish_whole<T: Transport>(
    transport: &T,
    topic: &str,
    payload: Bytes,
    qos: QoS,
    ack_timeout: Duration,
) -> Result<(), TransferError> {
    let len = payload.len();
    match tokio::time::timeout(ack_timeout, transport.publish(topic, payload, qos)).await {
        Ok(Ok(())) => {
            tracing::info!(topic, len, "whole payload published");
            Ok(())
        }
        Ok(Err(e)) => Err(connection_error(Stage::Chunk, Some(0), e)),
        Err(_) => Err(TransferError::DeliveryTimeout {
            stage: Stage::Chunk,
            index: Some(0),
            waited: ack_timeout,
        }),
    }
}
