//! Envelopes exchanged between Convoy instances over the broker

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{new_id, now_millis};

/// Payload category of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    /// Text typed by a user and addressed to the peer network
    User,
    /// Presence protocol traffic; `action` says which step
    Broadcast,
    /// Task output republished back to the instance that asked for it
    AgentReply,
    System,
    #[serde(other)]
    Other,
}

/// Presence protocol steps carried by `BROADCAST` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastAction {
    RollcallRequest,
    RollcallAck,
    InstanceCount,
    PresenceAnnounce,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<BroadcastAction>,
    pub sender_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl PeerEnvelope {
    fn new(
        envelope_type: EnvelopeType,
        action: Option<BroadcastAction>,
        sender_id: &str,
        payload: Value,
    ) -> Self {
        Self {
            envelope_type,
            action,
            sender_id: sender_id.to_string(),
            message_id: new_id(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// User text addressed to the peer network
    pub fn user(sender_id: &str, text: &str) -> Self {
        Self::new(EnvelopeType::User, None, sender_id, Value::String(text.to_string()))
    }

    pub fn broadcast(sender_id: &str, action: BroadcastAction, payload: Value) -> Self {
        Self::new(EnvelopeType::Broadcast, Some(action), sender_id, payload)
    }

    /// Task output sent back to the peers after a forwarded mention
    pub fn agent_reply(sender_id: &str, message: &str, in_reply_to: Option<&str>) -> Self {
        Self::new(
            EnvelopeType::AgentReply,
            None,
            sender_id,
            json!({ "message": message, "inReplyTo": in_reply_to }),
        )
    }

    /// Text carried by the payload: the payload itself when it is a string,
    /// else a nested `message` or `text` field.
    pub fn payload_text(&self) -> Option<&str> {
        match &self.payload {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| map.get("text").and_then(Value::as_str)),
            _ => None,
        }
    }

    pub fn is_from(&self, instance_id: &str) -> bool {
        self.sender_id == instance_id
    }
}
