//! chunkcast-core — wire format, chunk encoding, errors, and configuration.
//! All other chunkcast crates depend on this one.

pub mod chunking;
pub mod config;
pub mod digest;
pub mod error;
pub mod wire;

pub use chunking::{encode, Chunk, ChunkDescriptor, EncodedPayload};
pub use error::{Stage, TransferError, Violation};
pub use wire::{QoS, Topics, TransferKey, TransferTopic};
