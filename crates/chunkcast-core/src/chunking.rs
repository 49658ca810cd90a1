//! Chunk encoding — splitting a payload into fixed-size chunks and
//! describing it with a ChunkDescriptor.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::digest::{self, Hasher};
use crate::error::{TransferError, Violation};
use crate::wire::{valid_transfer_id, TransferKey};

/// Chunk size used when none is configured (50 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Metadata describing one transfer. Sent as JSON on the metadata topic
/// before any chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub total_size: u64,
    pub num_chunks: u32,
    pub chunk_size: u32,
    pub filename: String,

    /// Separates overlapping transfers. Absent on the legacy wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,

    /// Hex BLAKE3 digest of the whole payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blake3: Option<String>,
}

impl ChunkDescriptor {
    pub fn key(&self) -> TransferKey {
        TransferKey::from_transfer_id(self.transfer_id.as_deref())
    }

    /// Expected length of chunk `index`, or `None` if the index is out of range.
    ///
    /// Every chunk is `chunk_size` bytes except the last, which holds the
    /// remainder.
    pub fn expected_len(&self, index: u32) -> Option<usize> {
        if index >= self.num_chunks {
            return None;
        }
        let start = u64::from(index) * u64::from(self.chunk_size);
        let remaining = self.total_size.saturating_sub(start);
        Some(remaining.min(u64::from(self.chunk_size)) as usize)
    }

    /// Check the descriptor's internal consistency.
    pub fn validate(&self) -> Result<(), Violation> {
        let bad = |msg: String| Err(Violation::MalformedDescriptor(msg));

        if self.chunk_size == 0 {
            return bad("chunk_size must be positive".into());
        }
        let expected = num_chunks_for(self.total_size, self.chunk_size);
        if u64::from(self.num_chunks) != expected {
            return bad(format!(
                "num_chunks is {} but {} bytes in {}-byte chunks needs {}",
                self.num_chunks, self.total_size, self.chunk_size, expected
            ));
        }
        if self.filename.trim().is_empty() {
            return bad("filename is empty".into());
        }
        if let Some(id) = &self.transfer_id {
            if !valid_transfer_id(id) {
                return bad(format!("transfer_id {id:?} is not a single topic level"));
            }
        }
        if let Some(d) = &self.blake3 {
            if d.len() != 64 || !d.chars().all(|c| c.is_ascii_hexdigit()) {
                return bad(format!("blake3 digest {d:?} is not 64 hex characters"));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate a metadata message.
    pub fn from_json(payload: &[u8]) -> Result<Self, Violation> {
        let descriptor: ChunkDescriptor = serde_json::from_slice(payload)
            .map_err(|e| Violation::MalformedDescriptor(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// `ceil(total_size / chunk_size)`, zero for an empty payload.
pub fn num_chunks_for(total_size: u64, chunk_size: u32) -> u64 {
    total_size.div_ceil(u64::from(chunk_size))
}

/// One contiguous slice of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A payload split into chunks, ready to publish.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub descriptor: ChunkDescriptor,
    pub chunks: Vec<Chunk>,
}

impl EncodedPayload {
    /// Tag this transfer with an identifier, moving it onto per-transfer topics.
    pub fn with_transfer_id(mut self, id: impl Into<String>) -> Result<Self, TransferError> {
        let id = id.into();
        if !valid_transfer_id(&id) {
            return Err(TransferError::InvalidArgument(format!(
                "transfer_id {id:?} must be a single topic level without wildcards"
            )));
        }
        self.descriptor.transfer_id = Some(id);
        Ok(self)
    }

    /// Attach the BLAKE3 digest of the payload to the descriptor.
    pub fn with_digest(mut self) -> Self {
        let mut hasher = Hasher::new();
        for chunk in &self.chunks {
            hasher.update(&chunk.data);
        }
        self.descriptor.blake3 = Some(hasher.finalize_hex());
        self
    }

    pub fn key(&self) -> TransferKey {
        self.descriptor.key()
    }
}

/// Split `payload` into `chunk_size` pieces.
///
/// Chunks come back in index order and concatenate to exactly `payload`.
/// Slicing is zero-copy. An empty payload yields zero chunks.
pub fn encode(
    payload: Bytes,
    chunk_size: usize,
    filename: &str,
) -> Result<EncodedPayload, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidArgument(
            "chunk_size must be greater than zero".into(),
        ));
    }
    let chunk_size_u32 = u32::try_from(chunk_size).map_err(|_| {
        TransferError::InvalidArgument(format!("chunk_size {chunk_size} exceeds u32::MAX"))
    })?;
    if filename.trim().is_empty() {
        return Err(TransferError::InvalidArgument("filename is empty".into()));
    }

    let total_size = payload.len() as u64;
    let num_chunks = u32::try_from(num_chunks_for(total_size, chunk_size_u32)).map_err(|_| {
        TransferError::InvalidArgument(format!(
            "{total_size} bytes in {chunk_size}-byte chunks exceeds the chunk index space"
        ))
    })?;

    let chunks = (0..num_chunks)
        .map(|index| {
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            Chunk {
                index,
                data: payload.slice(start..end),
            }
        })
        .collect();

    Ok(EncodedPayload {
        descriptor: ChunkDescriptor {
            total_size,
            num_chunks,
            chunk_size: chunk_size_u32,
            filename: filename.to_string(),
            transfer_id: None,
            blake3: None,
        },
        chunks,
    })
}

/// Digest a payload the same way `EncodedPayload::with_digest` does.
pub fn payload_digest(payload: &[u8]) -> String {
    digest::hash_hex(payload)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
