//! Service trait for topic-driven services.
//!
//! The daemon owns the transport and routes each inbound message to every
//! service whose filter matches its topic. Services never publish directly;
//! they return the replies they want sent.

use anyhow::Result;

use crate::transport::{InboundMessage, OutboundMessage};

/// Trait for services that react to messages on a set of topics.
///
/// Intentionally minimal. Services that need to do slow work hand the
/// message to their own task and return no replies.
pub trait TopicService: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Topic filters (MQTT wildcards allowed) this service subscribes to.
    fn subscriptions(&self) -> Vec<String>;

    /// Handle a message whose topic matched one of `subscriptions`.
    fn handle_message(&self, msg: &InboundMessage) -> Result<Vec<OutboundMessage>>;
}
