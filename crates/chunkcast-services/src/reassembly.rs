//! Chunk reassembly — receiver-side session state machine.
//!
//! `Reassembler` is synchronous and owns every active session. It never reads
//! the clock: callers pass `now`, so timeouts are deterministic under test.
//! In the daemon it lives inside the session manager task and is never shared.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use chunkcast_core::config::ReceiverConfig;
use chunkcast_core::digest::Hasher;
use chunkcast_core::wire::COMPLETE_SENTINEL;
use chunkcast_core::{ChunkDescriptor, TransferError, TransferKey, TransferTopic, Violation};

/// Terminal states remembered for `Reassembler::state`.
const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ReassemblySettings {
    /// A session with no message for this long is abandoned.
    pub inactivity_timeout: Duration,
    /// After an incomplete completion marker, how long to wait for the
    /// missing chunks.
    pub grace_period: Duration,
    /// Descriptors announcing more than this are rejected. Zero disables.
    pub max_transfer_bytes: u64,
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self::from(&ReceiverConfig::default())
    }
}

impl From<&ReceiverConfig> for ReassemblySettings {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout(),
            grace_period: config.grace_period(),
            max_transfer_bytes: config.max_transfer_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No descriptor seen for this key.
    AwaitingMetadata,
    Receiving,
    Complete,
    Abandoned,
}

/// What a message did to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A descriptor opened a session. `replaced` is set when it discarded a
    /// session already in progress under the same key.
    Started { key: TransferKey, replaced: bool },
    Accepted {
        key: TransferKey,
        index: u32,
        received: u32,
        total: u32,
    },
    /// The index was already stored; the copy overwrote it.
    Duplicate { key: TransferKey, index: u32 },
    Completed(CompletedTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub key: TransferKey,
    pub descriptor: ChunkDescriptor,
    pub payload: Bytes,
    pub duplicates: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// No message within the inactivity window.
    Inactivity,
    /// A completion marker arrived early and the missing chunks never did.
    GraceExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedTransfer {
    pub key: TransferKey,
    pub filename: String,
    pub received: u32,
    pub total: u32,
    pub missing: Vec<u32>,
    pub reason: AbandonReason,
}

/// Read-only view of one active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub key: TransferKey,
    pub filename: String,
    pub received: u32,
    pub total: u32,
    pub bytes_received: u64,
    pub total_size: u64,
    pub completion_seen: bool,
    pub idle: Duration,
}

struct Session {
    descriptor: ChunkDescriptor,
    chunks: BTreeMap<u32, Bytes>,
    bytes_received: u64,
    duplicates: u32,
    started_at: Instant,
    last_activity: Instant,
    completion_seen_at: Option<Instant>,
}

impl Session {
    fn new(descriptor: ChunkDescriptor, now: Instant) -> Self {
        Self {
            descriptor,
            chunks: BTreeMap::new(),
            bytes_received: 0,
            duplicates: 0,
            started_at: now,
            last_activity: now,
            completion_seen_at: None,
        }
    }

    fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn is_full(&self) -> bool {
        self.received() == self.descriptor.num_chunks
    }

    fn missing(&self) -> Vec<u32> {
        (0..self.descriptor.num_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }
}

#[derive(Default)]
pub struct Reassembler {
    settings: ReassemblySettings,
    sessions: BTreeMap<TransferKey, Session>,
    history: VecDeque<(TransferKey, SessionState)>,
}

impl Reassembler {
    pub fn new(settings: ReassemblySettings) -> Self {
        Self {
            settings,
            sessions: BTreeMap::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn settings(&self) -> &ReassemblySettings {
        &self.settings
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn state(&self, key: &TransferKey) -> SessionState {
        if self.sessions.contains_key(key) {
            return SessionState::Receiving;
        }
        self.history
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, state)| *state)
            .unwrap_or(SessionState::AwaitingMetadata)
    }

    /// Apply a message on an already classified transfer topic.
    pub fn apply(
        &mut self,
        topic: TransferTopic,
        payload: Bytes,
        now: Instant,
    ) -> Result<Progress, TransferError> {
        match topic {
            TransferTopic::Meta => {
                let descriptor = ChunkDescriptor::from_json(&payload)?;
                self.on_metadata(descriptor, now)
            }
            TransferTopic::Chunk { key, index } => self.on_chunk(&key, index, payload, now),
            TransferTopic::Complete { key } => self.on_complete(&key, &payload, now),
        }
    }

    /// Open a session. An existing session under the same key is discarded
    /// together with its chunks.
    pub fn on_metadata(
        &mut self,
        descriptor: ChunkDescriptor,
        now: Instant,
    ) -> Result<Progress, TransferError> {
        descriptor.validate()?;
        let limit = self.settings.max_transfer_bytes;
        if limit > 0 && descriptor.total_size > limit {
            return Err(Violation::TooLarge {
                total_size: descriptor.total_size,
                limit,
            }
            .into());
        }

        let key = descriptor.key();
        tracing::info!(
            transfer = %key,
            filename = %descriptor.filename,
            total_size = descriptor.total_size,
            num_chunks = descriptor.num_chunks,
            "session started"
        );
        let replaced = match self.sessions.insert(key.clone(), Session::new(descriptor, now)) {
            Some(old) => {
                tracing::warn!(
                    transfer = %key,
                    discarded = old.received(),
                    "new descriptor replaced session in progress"
                );
                true
            }
            None => false,
        };
        Ok(Progress::Started { key, replaced })
    }

    pub fn on_chunk(
        &mut self,
        key: &TransferKey,
        index: u32,
        data: Bytes,
        now: Instant,
    ) -> Result<Progress, TransferError> {
        let session = self
            .sessions
            .get_mut(key)
            .ok_or_else(|| Violation::NoActiveSession { key: key.clone() })?;

        let num_chunks = session.descriptor.num_chunks;
        let expected = session
            .descriptor
            .expected_len(index)
            .ok_or_else(|| Violation::IndexOutOfRange {
                key: key.clone(),
                index,
                num_chunks,
            })?;
        if data.len() != expected {
            return Err(Violation::LengthMismatch {
                key: key.clone(),
                index,
                expected,
                actual: data.len(),
            }
            .into());
        }

        session.last_activity = now;
        let len = data.len() as u64;
        if let Some(previous) = session.chunks.insert(index, data) {
            session.bytes_received -= previous.len() as u64;
            session.bytes_received += len;
            session.duplicates += 1;
            tracing::debug!(transfer = %key, index, "duplicate chunk overwritten");
            return Ok(Progress::Duplicate {
                key: key.clone(),
                index,
            });
        }
        session.bytes_received += len;

        if session.completion_seen_at.is_some() && session.is_full() {
            tracing::info!(transfer = %key, index, "last missing chunk arrived after completion marker");
            return self.finish(key, now);
        }

        Ok(Progress::Accepted {
            key: key.clone(),
            index,
            received: session.received(),
            total: num_chunks,
        })
    }

    /// Handle the completion marker. Missing chunks leave the session open
    /// for the grace period and are reported as `IncompleteTransfer`.
    pub fn on_complete(
        &mut self,
        key: &TransferKey,
        payload: &[u8],
        now: Instant,
    ) -> Result<Progress, TransferError> {
        if payload != COMPLETE_SENTINEL.as_bytes() {
            return Err(Violation::UnexpectedSentinel {
                key: key.clone(),
                payload: String::from_utf8_lossy(payload).into_owned(),
            }
            .into());
        }
        let session = self
            .sessions
            .get_mut(key)
            .ok_or_else(|| Violation::NoActiveSession { key: key.clone() })?;

        session.last_activity = now;
        if !session.is_full() {
            session.completion_seen_at = Some(now);
            let missing = session.missing();
            tracing::warn!(
                transfer = %key,
                missing = missing.len(),
                grace_secs = self.settings.grace_period.as_secs(),
                "completion marker before all chunks"
            );
            return Err(TransferError::IncompleteTransfer {
                key: key.clone(),
                missing,
            });
        }
        self.finish(key, now)
    }

    fn finish(&mut self, key: &TransferKey, now: Instant) -> Result<Progress, TransferError> {
        let session = self
            .sessions
            .remove(key)
            .ok_or_else(|| Violation::NoActiveSession { key: key.clone() })?;
        let descriptor = session.descriptor;

        let mut assembled = BytesMut::with_capacity(session.bytes_received as usize);
        let mut hasher = Hasher::new();
        for data in session.chunks.values() {
            assembled.extend_from_slice(data);
            hasher.update(data);
        }

        let actual = assembled.len() as u64;
        if actual != descriptor.total_size {
            self.remember(key, SessionState::Abandoned);
            return Err(Violation::SizeMismatch {
                key: key.clone(),
                expected: descriptor.total_size,
                actual,
            }
            .into());
        }
        if let Some(expected) = &descriptor.blake3 {
            let actual = hasher.finalize_hex();
            if !expected.eq_ignore_ascii_case(&actual) {
                self.remember(key, SessionState::Abandoned);
                return Err(Violation::DigestMismatch {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual,
                }
                .into());
            }
        }

        self.remember(key, SessionState::Complete);
        let elapsed = now.saturating_duration_since(session.started_at);
        tracing::info!(
            transfer = %key,
            filename = %descriptor.filename,
            bytes = actual,
            duplicates = session.duplicates,
            elapsed_ms = elapsed.as_millis() as u64,
            "transfer complete"
        );
        Ok(Progress::Completed(CompletedTransfer {
            key: key.clone(),
            descriptor,
            payload: assembled.freeze(),
            duplicates: session.duplicates,
            elapsed,
        }))
    }

    /// Abandon sessions that have gone quiet or outlived their grace period.
    pub fn sweep(&mut self, now: Instant) -> Vec<AbandonedTransfer> {
        let settings = &self.settings;
        let expired: Vec<(TransferKey, AbandonReason)> = self
            .sessions
            .iter()
            .filter_map(|(key, s)| {
                // Once the marker is in, every message restarts the grace window.
                let grace_over = s.completion_seen_at.is_some()
                    && now.saturating_duration_since(s.last_activity) >= settings.grace_period;
                if grace_over {
                    return Some((key.clone(), AbandonReason::GraceExpired));
                }
                if now.saturating_duration_since(s.last_activity) >= settings.inactivity_timeout {
                    return Some((key.clone(), AbandonReason::Inactivity));
                }
                None
            })
            .collect();

        let mut abandoned = Vec::with_capacity(expired.len());
        for (key, reason) in expired {
            if let Some(session) = self.sessions.remove(&key) {
                tracing::warn!(
                    transfer = %key,
                    filename = %session.descriptor.filename,
                    received = session.received(),
                    total = session.descriptor.num_chunks,
                    ?reason,
                    "session abandoned"
                );
                abandoned.push(AbandonedTransfer {
                    missing: session.missing(),
                    received: session.received(),
                    total: session.descriptor.num_chunks,
                    filename: session.descriptor.filename,
                    key: key.clone(),
                    reason,
                });
                self.remember(&key, SessionState::Abandoned);
            }
        }
        abandoned
    }

    /// Discard a session. Returns whether one existed.
    pub fn cancel(&mut self, key: &TransferKey) -> bool {
        match self.sessions.remove(key) {
            Some(session) => {
                tracing::info!(transfer = %key, received = session.received(), "session cancelled");
                self.remember(key, SessionState::Abandoned);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, now: Instant) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|(key, s)| SessionSummary {
                key: key.clone(),
                filename: s.descriptor.filename.clone(),
                received: s.received(),
                total: s.descriptor.num_chunks,
                bytes_received: s.bytes_received,
                total_size: s.descriptor.total_size,
                completion_seen: s.completion_seen_at.is_some(),
                idle: now.saturating_duration_since(s.last_activity),
            })
            .collect()
    }

    fn remember(&mut self, key: &TransferKey, state: SessionState) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((key.clone(), state));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
