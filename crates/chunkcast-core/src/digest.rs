//! BLAKE3 payload digests.
//!
//! The sender may attach the hex digest of the whole payload to the
//! descriptor; the receiver recomputes it over the reassembled bytes.

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex-encoded BLAKE3 digest, as carried in the descriptor.
pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(hash(data))
}

/// Incremental BLAKE3 hasher for payloads held as separate chunks.
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize_hex(&self) -> String {
        hex::encode(self.0.finalize().as_bytes())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
