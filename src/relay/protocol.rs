//! Relay Channel Wire Protocol
//!
//! One JSON object per WebSocket text frame: `{"event": ..., "message": ...}`.
//! The userscript in the wild speaks an older vocabulary (`send-user-message`,
//! `stream-message`, ...), which is accepted on input and can be selected for
//! output with [`WireDialect::Legacy`].

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// core -> producer: type `message` into the UI and submit it
    #[serde(alias = "send-user-message")]
    StartGeneration {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<String>,
    },
    /// core -> producer: open a fresh conversation
    #[serde(alias = "new-chat")]
    ResetSession,
    /// producer -> core: full text of the answer so far
    #[serde(alias = "stream-message")]
    FragmentUpdate {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<String>,
    },
    /// producer -> core: the answer is finished
    #[serde(alias = "message-complete")]
    GenerationComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<String>,
    },
}

impl RelayMessage {
    pub fn start(prompt: impl Into<String>, generation: impl Into<String>) -> Self {
        RelayMessage::StartGeneration { message: prompt.into(), generation: Some(generation.into()) }
    }

    pub fn event_name(&self, dialect: WireDialect) -> &'static str {
        match (self, dialect) {
            (RelayMessage::StartGeneration { .. }, WireDialect::Canonical) => "start-generation",
            (RelayMessage::StartGeneration { .. }, WireDialect::Legacy) => "send-user-message",
            (RelayMessage::ResetSession, WireDialect::Canonical) => "reset-session",
            (RelayMessage::ResetSession, WireDialect::Legacy) => "new-chat",
            (RelayMessage::FragmentUpdate { .. }, WireDialect::Canonical) => "fragment-update",
            (RelayMessage::FragmentUpdate { .. }, WireDialect::Legacy) => "stream-message",
            (RelayMessage::GenerationComplete { .. }, WireDialect::Canonical) => "generation-complete",
            (RelayMessage::GenerationComplete { .. }, WireDialect::Legacy) => "message-complete",
        }
    }
}

/// Which event names the relay emits towards the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireDialect {
    #[default]
    Canonical,
    Legacy,
}

impl WireDialect {
    pub fn encode(self, message: &RelayMessage) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(message)?;
        if let Value::Object(map) = &mut value {
            map.insert("event".to_string(), Value::String(message.event_name(self).to_string()));
        }
        serde_json::to_string(&value)
    }
}

impl FromStr for WireDialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "canonical" => Ok(WireDialect::Canonical),
            "legacy" | "tampermonkey" => Ok(WireDialect::Legacy),
            other => bail!("Unknown wire dialect '{}' (expected 'canonical' or 'legacy')", other),
        }
    }
}

/// An inbound frame after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    /// Connection handshake sent by the userscript on open
    Hello(String),
    Fragment { text: String, generation: Option<String> },
    Complete { text: Option<String>, generation: Option<String> },
}

pub fn parse_producer_frame(frame: &str) -> RelayResult<ProducerEvent> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| RelayError::MalformedEvent(format!("invalid JSON: {}", e)))?;

    if value.get("event").is_none() {
        if value.get("type").and_then(Value::as_str) == Some("connected") {
            let note = value.get("message").and_then(Value::as_str).unwrap_or_default();
            return Ok(ProducerEvent::Hello(note.to_string()));
        }
        return Err(RelayError::MalformedEvent("missing 'event' field".to_string()));
    }

    let message: RelayMessage = serde_json::from_value(value)
        .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;

    match message {
        RelayMessage::FragmentUpdate { message, generation } => Ok(ProducerEvent::Fragment { text: message, generation }),
        RelayMessage::GenerationComplete { message, generation } => Ok(ProducerEvent::Complete { text: message, generation }),
        other => Err(RelayError::MalformedEvent(format!(
            "'{}' is not a producer event",
            other.event_name(WireDialect::Canonical)
        ))),
    }
}
