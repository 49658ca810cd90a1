//! chunkcast-services — transports, the chunk publisher, the reassembler,
//! and the topic services the daemon hosts.

pub mod device;
pub mod memory;
pub mod mqtt;
pub mod publisher;
pub mod reassembly;
pub mod service;
pub mod session_manager;
pub mod store;
pub mod transport;

pub use device::{ColorService, HexColor, LampCommand, LampService};
pub use memory::{Fault, MemoryBroker, MemoryTransport, PublishRecord};
pub use mqtt::MqttTransport;
pub use publisher::{publish_whole, ChunkPublisher, PublishOptions, PublishReport};
pub use reassembly::{
    AbandonReason, AbandonedTransfer, CompletedTransfer, Progress, Reassembler,
    ReassemblySettings, SessionState, SessionSummary,
};
pub use service::TopicService;
pub use session_manager::{SessionHandle, SessionManager, TransferEvent, TransferService};
pub use store::PayloadStore;
pub use transport::{InboundMessage, OutboundMessage, Transport, TransportError};
