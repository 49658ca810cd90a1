//! Consumes transfer events: completed payloads go to disk, everything else
//! is logged.

use tokio::sync::mpsc;

use chunkcast_services::{PayloadStore, TransferEvent};

pub struct EventSink {
    store: PayloadStore,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl EventSink {
    pub fn new(store: PayloadStore, events: mpsc::UnboundedReceiver<TransferEvent>) -> Self {
        Self { store, events }
    }

    /// Runs until every event sender is gone.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(dir = %self.store.output_dir().display(), "writing received payloads");
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        Ok(())
    }

    fn handle(&self, event: TransferEvent) {
        match event {
            TransferEvent::Completed(done) => match self.store.write(&done) {
                Ok(path) => tracing::info!(
                    transfer = %done.key,
                    path = %path.display(),
                    bytes = done.payload.len(),
                    duplicates = done.duplicates,
                    "transfer saved"
                ),
                Err(e) => tracing::error!(
                    transfer = %done.key,
                    filename = %done.descriptor.filename,
                    error = %e,
                    "failed to save transfer"
                ),
            },
            TransferEvent::Incomplete { key, missing } => tracing::warn!(
                transfer = %key,
                ?missing,
                "completion marker with missing chunks, waiting for retransmission"
            ),
            TransferEvent::Abandoned(a) => tracing::warn!(
                transfer = %a.key,
                filename = %a.filename,
                received = a.received,
                total = a.total,
                reason = ?a.reason,
                "transfer abandoned"
            ),
            TransferEvent::Rejected(violation) => {
                tracing::warn!(%violation, "transfer message rejected")
            }
        }
    }
}
