//! Session manager — single task owning the receive-side session table.
//!
//! Inbound transfer messages, cancellations and snapshot requests all arrive
//! as commands on one channel, so the `Reassembler` is only ever touched by
//! this task. Outcomes leave as `TransferEvent`s.

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, oneshot};

use chunkcast_core::{TransferError, TransferKey, Topics, Violation};

use crate::reassembly::{
    AbandonedTransfer, CompletedTransfer, Progress, Reassembler, ReassemblySettings,
    SessionSummary,
};
use crate::service::TopicService;
use crate::transport::{InboundMessage, OutboundMessage};

/// Outcome of a transfer, or a message that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Completed(CompletedTransfer),
    /// Completion marker arrived with chunks missing. The session stays open
    /// for the grace period.
    Incomplete { key: TransferKey, missing: Vec<u32> },
    Abandoned(AbandonedTransfer),
    Rejected(Violation),
}

enum SessionCommand {
    Inbound(InboundMessage),
    Cancel {
        key: TransferKey,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<Vec<SessionSummary>>),
}

pub struct SessionManager {
    topics: Topics,
    reassembler: Reassembler,
    sweep_interval: Duration,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<TransferEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionManager {
    pub fn new(
        topics: Topics,
        settings: ReassemblySettings,
        sweep_interval: Duration,
        events: mpsc::UnboundedSender<TransferEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, SessionHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let manager = Self {
            topics,
            reassembler: Reassembler::new(settings),
            sweep_interval,
            commands,
            events,
            shutdown,
        };
        (manager, SessionHandle { tx })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(active = self.reassembler.len(), "session manager shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    for abandoned in self.reassembler.sweep(now()) {
                        self.emit(TransferEvent::Abandoned(abandoned));
                    }
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        tracing::debug!("all session handles dropped");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Inbound(msg) => self.on_message(msg),
            SessionCommand::Cancel { key, reply } => {
                let _ = reply.send(self.reassembler.cancel(&key));
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.reassembler.snapshot(now()));
            }
        }
    }

    fn on_message(&mut self, msg: InboundMessage) {
        let topic = match self.topics.classify(&msg.topic) {
            Ok(Some(topic)) => topic,
            Ok(None) => {
                tracing::trace!(topic = %msg.topic, "not a transfer topic");
                return;
            }
            Err(violation) => {
                tracing::warn!(%violation, "dropping message");
                self.emit(TransferEvent::Rejected(violation));
                return;
            }
        };

        match self.reassembler.apply(topic, msg.payload, now()) {
            Ok(Progress::Completed(done)) => self.emit(TransferEvent::Completed(done)),
            Ok(Progress::Accepted {
                key,
                index,
                received,
                total,
            }) => {
                tracing::debug!(transfer = %key, index, received, total, "chunk stored");
            }
            Ok(_) => {}
            Err(TransferError::IncompleteTransfer { key, missing }) => {
                self.emit(TransferEvent::Incomplete { key, missing });
            }
            Err(TransferError::ProtocolViolation(violation)) => {
                tracing::warn!(topic = %msg.topic, %violation, "protocol violation");
                self.emit(TransferEvent::Rejected(violation));
            }
            Err(e) => tracing::warn!(topic = %msg.topic, error = %e, "message not applied"),
        }
    }

    fn emit(&self, event: TransferEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("transfer event receiver dropped");
        }
    }
}

/// Sessions are timed with tokio's clock so paused-time tests can drive them.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Cloneable front door to a running `SessionManager`.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Queue an inbound message. Returns false once the manager has stopped.
    pub fn deliver(&self, msg: InboundMessage) -> bool {
        self.tx.send(SessionCommand::Inbound(msg)).is_ok()
    }

    /// Discard the session for `key`. Returns whether one was active.
    pub async fn cancel(&self, key: TransferKey) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Cancel { key, reply })
            .map_err(|_| anyhow!("session manager stopped"))?;
        Ok(rx.await?)
    }

    pub async fn snapshot(&self) -> Result<Vec<SessionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Snapshot(reply))
            .map_err(|_| anyhow!("session manager stopped"))?;
        Ok(rx.await?)
    }
}

/// Routes the transfer namespace to the session manager.
pub struct TransferService {
    topics: Topics,
    handle: SessionHandle,
}

impl TransferService {
    pub fn new(topics: Topics, handle: SessionHandle) -> Self {
        Self { topics, handle }
    }
}

impl TopicService for TransferService {
    fn name(&self) -> &'static str {
        "transfers"
    }

    fn subscriptions(&self) -> Vec<String> {
        self.topics.subscriptions()
    }

    fn handle_message(&self, msg: &InboundMessage) -> Result<Vec<OutboundMessage>> {
        if !self.handle.deliver(msg.clone()) {
            return Err(anyhow!("session manager stopped"));
        }
        Ok(Vec::new())
    }
}
