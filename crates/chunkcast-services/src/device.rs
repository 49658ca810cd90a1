//! Device simulators — a lamp that acknowledges commands and a color sink.
//!
//! Both keep their state in an explicit object behind a mutex. The dispatcher
//! may call them from any task.

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use bytes::Bytes;

use chunkcast_core::config::TopicsConfig;
use chunkcast_core::QoS;

use crate::service::TopicService;
use crate::transport::{InboundMessage, OutboundMessage};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Lamp ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampCommand {
    On,
    Off,
}

impl LampCommand {
    /// Parse a command payload. Case and surrounding whitespace are ignored.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(payload).trim().to_ascii_uppercase();
        match text.as_str() {
            "ON" | "1" | "TRUE" => Some(LampCommand::On),
            "OFF" | "0" | "FALSE" => Some(LampCommand::Off),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LampCommand::On => "ON",
            LampCommand::Off => "OFF",
        }
    }
}

pub struct LampService {
    command_topic: String,
    ack_topic: String,
    on: Mutex<bool>,
}

impl LampService {
    pub fn new(command_topic: impl Into<String>, ack_topic: impl Into<String>) -> Self {
        Self {
            command_topic: command_topic.into(),
            ack_topic: ack_topic.into(),
            on: Mutex::new(false),
        }
    }

    pub fn from_config(topics: &TopicsConfig) -> Self {
        Self::new(topics.lamp_command.clone(), topics.lamp_ack.clone())
    }

    pub fn is_on(&self) -> bool {
        *lock(&self.on)
    }

    pub fn apply(&self, command: LampCommand) {
        *lock(&self.on) = command == LampCommand::On;
    }
}

impl TopicService for LampService {
    fn name(&self) -> &'static str {
        "lamp"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![self.command_topic.clone()]
    }

    fn handle_message(&self, msg: &InboundMessage) -> Result<Vec<OutboundMessage>> {
        let Some(command) = LampCommand::parse(&msg.payload) else {
            tracing::warn!(
                topic = %msg.topic,
                payload = %String::from_utf8_lossy(&msg.payload),
                "unknown lamp command ignored"
            );
            return Ok(Vec::new());
        };

        self.apply(command);
        tracing::info!(state = command.as_str(), "lamp switched");

        Ok(vec![OutboundMessage {
            topic: self.ack_topic.clone(),
            payload: Bytes::from_static(command.as_str().as_bytes()),
            qos: QoS::AtMostOnce,
        }])
    }
}

// ── Color ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl HexColor {
    /// Accepts exactly six uppercase hex digits, e.g. `FF8800`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != 6
            || !payload
                .iter()
                .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b))
        {
            return None;
        }
        let bytes = hex::decode(payload).ok()?;
        Some(Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        })
    }
}

impl std::fmt::Display for HexColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

pub struct ColorService {
    topic: String,
    last: Mutex<Option<HexColor>>,
}

impl ColorService {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            last: Mutex::new(None),
        }
    }

    pub fn from_config(topics: &TopicsConfig) -> Self {
        Self::new(topics.color.clone())
    }

    pub fn last_color(&self) -> Option<HexColor> {
        *lock(&self.last)
    }
}

impl TopicService for ColorService {
    fn name(&self) -> &'static str {
        "color"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![self.topic.clone()]
    }

    fn handle_message(&self, msg: &InboundMessage) -> Result<Vec<OutboundMessage>> {
        match HexColor::parse(&msg.payload) {
            Some(color) => {
                *lock(&self.last) = Some(color);
                tracing::info!(%color, r = color.r, g = color.g, b = color.b, "color received");
            }
            None => tracing::warn!(
                payload = %String::from_utf8_lossy(&msg.payload),
                "invalid color ignored, expected RRGGBB"
            ),
        }
        Ok(Vec::new())
    }
}
