//! Wire layout — topics, QoS levels, and the completion sentinel.
//!
//! A transfer under namespace `ns` uses three kinds of topic:
//!
//!   `ns/meta`                 JSON ChunkDescriptor
//!   `ns/chunk/{index}`        raw chunk bytes
//!   `ns/complete`             the sentinel `done`
//!
//! When the descriptor carries a `transfer_id`, chunk and completion topics
//! gain an extra level (`ns/chunk/{id}/{index}`, `ns/complete/{id}`) so that
//! overlapping transfers never share a topic. Metadata always travels on
//! `ns/meta`.

use std::fmt;

use crate::error::Violation;

/// Payload of the completion marker.
pub const COMPLETE_SENTINEL: &str = "done";

/// Default namespace, matching the devices this protocol was first used with.
pub const DEFAULT_NAMESPACE: &str = "esp32/sound";

// ── QoS ───────────────────────────────────────────────────────────────────────

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget. No acknowledgment.
    AtMostOnce = 0,
    /// Acknowledged by PUBACK. Duplicates possible.
    AtLeastOnce = 1,
    /// Four-way handshake ending in PUBCOMP.
    ExactlyOnce = 2,
}

impl QoS {
    /// Whether the broker acknowledges publications at this level.
    pub fn is_acknowledged(self) -> bool {
        self >= QoS::AtLeastOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(WireError::UnknownQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(q: QoS) -> u8 {
        q as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown QoS level: {0}")]
    UnknownQoS(u8),
}

// ── Transfer keys ─────────────────────────────────────────────────────────────

/// Identifies one transfer session on the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransferKey {
    /// Legacy transfers without an identifier. One at a time per namespace.
    Anonymous,
    /// Transfers whose descriptor carries a `transfer_id`.
    Id(String),
}

impl TransferKey {
    pub fn from_transfer_id(id: Option<&str>) -> Self {
        match id {
            Some(id) => TransferKey::Id(id.to_string()),
            None => TransferKey::Anonymous,
        }
    }

    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            TransferKey::Anonymous => None,
            TransferKey::Id(id) => Some(id),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKey::Anonymous => f.write_str("<anonymous>"),
            TransferKey::Id(id) => f.write_str(id),
        }
    }
}

// ── Topics ────────────────────────────────────────────────────────────────────

/// A topic inside a transfer namespace, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTopic {
    Meta,
    Chunk { key: TransferKey, index: u32 },
    Complete { key: TransferKey },
}

/// Topic layout for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn meta(&self) -> String {
        format!("{}/meta", self.namespace)
    }

    pub fn chunk(&self, key: &TransferKey, index: u32) -> String {
        match key {
            TransferKey::Anonymous => format!("{}/chunk/{index}", self.namespace),
            TransferKey::Id(id) => format!("{}/chunk/{id}/{index}", self.namespace),
        }
    }

    pub fn complete(&self, key: &TransferKey) -> String {
        match key {
            TransferKey::Anonymous => format!("{}/complete", self.namespace),
            TransferKey::Id(id) => format!("{}/complete/{id}", self.namespace),
        }
    }

    /// Filters covering every topic of every transfer in this namespace.
    ///
    /// `<ns>/#` would also match `<ns>` itself, which deployments use for
    /// whole-file publication, so each protocol level is subscribed instead.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.meta(),
            format!("{}/chunk/#", self.namespace),
            format!("{}/complete/#", self.namespace),
        ]
    }

    /// Classify an inbound topic.
    ///
    /// `Ok(None)` means the topic is outside this namespace or not part of
    /// the transfer protocol. A topic that looks like a transfer topic but
    /// cannot be parsed is a violation.
    pub fn classify(&self, topic: &str) -> Result<Option<TransferTopic>, Violation> {
        let rest = match topic
            .strip_prefix(self.namespace.as_str())
            .and_then(|r| r.strip_prefix('/'))
        {
            Some(rest) => rest,
            None => return Ok(None),
        };

        let levels: Vec<&str> = rest.split('/').collect();
        let malformed = || Violation::MalformedTopic(topic.to_string());

        match levels.as_slice() {
            ["meta"] => Ok(Some(TransferTopic::Meta)),
            ["chunk", index] => Ok(Some(TransferTopic::Chunk {
                key: TransferKey::Anonymous,
                index: index.parse().map_err(|_| malformed())?,
            })),
            ["chunk", id, index] if valid_transfer_id(id) => Ok(Some(TransferTopic::Chunk {
                key: TransferKey::Id(id.to_string()),
                index: index.parse().map_err(|_| malformed())?,
            })),
            ["complete"] => Ok(Some(TransferTopic::Complete {
                key: TransferKey::Anonymous,
            })),
            ["complete", id] if valid_transfer_id(id) => Ok(Some(TransferTopic::Complete {
                key: TransferKey::Id(id.to_string()),
            })),
            ["chunk", ..] | ["complete", ..] | ["meta", ..] => Err(malformed()),
            _ => Ok(None),
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Transfer ids occupy exactly one topic level and may not contain wildcards.
pub fn valid_transfer_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '+', '#'])
}

/// MQTT topic-filter matching.
///
/// `+` matches exactly one level, `#` (last level only) matches any number of
/// remaining levels including none, so `a/#` matches `a` itself.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
