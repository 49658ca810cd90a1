//! Error taxonomy for chunked transfers.
//!
//! Sender-side failures carry the [`Stage`] and chunk index at which they
//! happened. Receiver-side problems that do not abort a session are reported
//! as [`Violation`]s wrapped in [`TransferError::ProtocolViolation`].

use std::fmt;
use std::time::Duration;

use crate::wire::TransferKey;

/// Step of the publish protocol an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Metadata,
    Chunk,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::Metadata => "metadata",
            Stage::Chunk => "chunk",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Formats ` (index N)` when an index is known, nothing otherwise.
struct AtIndex<'a>(&'a Option<u32>);

impl fmt::Display for AtIndex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(i) => write!(f, " (index {i})"),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("connection error at {stage}{}: {reason}", AtIndex(.index))]
    Connection {
        stage: Stage,
        index: Option<u32>,
        reason: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("delivery not acknowledged within {}ms at {stage}{}", .waited.as_millis(), AtIndex(.index))]
    DeliveryTimeout {
        stage: Stage,
        index: Option<u32>,
        waited: Duration,
    },

    #[error("incomplete transfer {key}: missing {} chunk(s) {missing:?}", .missing.len())]
    IncompleteTransfer { key: TransferKey, missing: Vec<u32> },

    #[error("protocol violation: {0}")]
    ProtocolViolation(Violation),

    #[error("transfer cancelled at {stage}{}", AtIndex(.index))]
    Cancelled { stage: Stage, index: Option<u32> },
}

impl TransferError {
    /// The stage this error is attributed to, if it came from the publisher.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            TransferError::Connection { stage, .. }
            | TransferError::DeliveryTimeout { stage, .. }
            | TransferError::Cancelled { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The chunk index this error is attributed to, if any.
    pub fn index(&self) -> Option<u32> {
        match self {
            TransferError::Connection { index, .. }
            | TransferError::DeliveryTimeout { index, .. }
            | TransferError::Cancelled { index, .. } => *index,
            TransferError::ProtocolViolation(v) => v.index(),
            _ => None,
        }
    }

    /// Whether restarting the whole session could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Connection { .. } | TransferError::DeliveryTimeout { .. }
        )
    }
}

impl From<Violation> for TransferError {
    fn from(v: Violation) -> Self {
        TransferError::ProtocolViolation(v)
    }
}

/// A message the receiver could not apply to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("chunk index {index} out of range for {num_chunks} chunk(s) in {key}")]
    IndexOutOfRange {
        key: TransferKey,
        index: u32,
        num_chunks: u32,
    },

    #[error("chunk {index} of {key} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        key: TransferKey,
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("no active session for {key}")]
    NoActiveSession { key: TransferKey },

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("unexpected completion payload on {key}: {payload:?}")]
    UnexpectedSentinel { key: TransferKey, payload: String },

    #[error("reassembled {key} is {actual} bytes, descriptor says {expected}")]
    SizeMismatch {
        key: TransferKey,
        expected: u64,
        actual: u64,
    },

    #[error("digest mismatch for {key}: expected {expected}, got {actual}")]
    DigestMismatch {
        key: TransferKey,
        expected: String,
        actual: String,
    },

    #[error("transfer of {total_size} bytes exceeds limit of {limit} bytes")]
    TooLarge { total_size: u64, limit: u64 },
}

impl Violation {
    pub fn index(&self) -> Option<u32> {
        match self {
            Violation::IndexOutOfRange { index, .. } | Violation::LengthMismatch { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }
}
