//! Peer presence and mention forwarding
//!
//! `PeerBridge` is a plain state machine: the coordinator feeds it broker
//! events and executes the `BridgeEffect`s it returns. Only the bridge
//! touches the instance registry.

use convoy_protocol::{
    now_millis, BroadcastAction, BrokerState, ConversationMessage, EnvelopeType, NoticeLevel,
    PeerEnvelope, Presence, SayVariant,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::liveness::LivenessCounters;
use crate::router::{parse_address, Address};

pub const ROLE_CLIENT: &str = "client";
const ROLLCALL_REQUEST_TYPE: &str = "ack_nack_rollcall";

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEffect {
    Publish(PeerEnvelope),
    /// Text from a peer to hand to the local task
    Inject { text: String },
    Notice { level: NoticeLevel, text: String },
}

/// A forwarded mention waiting for the local task to answer
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteRequest {
    sender_id: String,
    message_id: String,
}

pub struct PeerBridge {
    instance_id: String,
    role: String,
    marker: String,
    instance_count: u32,
    roll_call_complete: bool,
    pending_remote_reply: Option<RemoteRequest>,
}

impl PeerBridge {
    pub fn new(
        instance_id: impl Into<String>,
        role: impl Into<String>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            role: role.into(),
            marker: marker.into(),
            instance_count: 0,
            roll_call_complete: false,
            pending_remote_reply: None,
        }
    }

    pub fn presence(&self, broker: BrokerState) -> Presence {
        Presence {
            instance_count: self.instance_count,
            roll_call_complete: self.roll_call_complete,
            broker,
        }
    }

    #[cfg(test)]
    pub fn awaiting_remote_reply(&self) -> bool {
        self.pending_remote_reply.is_some()
    }

    // -- Connection lifecycle ---------------------------------------------

    pub fn on_connected(&mut self) -> Vec<BridgeEffect> {
        info!(
            component = "peer_bridge",
            event = "peer.rollcall_request",
            instance_id = %self.instance_id,
            "Broker connected, starting rollcall"
        );
        vec![BridgeEffect::Publish(PeerEnvelope::broadcast(
            &self.instance_id,
            BroadcastAction::RollcallRequest,
            json!({
                "instanceId": self.instance_id,
                "role": self.role,
                "requestType": ROLLCALL_REQUEST_TYPE,
            }),
        ))]
    }

    /// Registry is only meaningful while connected.
    pub fn on_disconnected(&mut self) {
        self.instance_count = 0;
        self.roll_call_complete = false;
    }

    pub fn presence_announce(&self) -> PeerEnvelope {
        PeerEnvelope::broadcast(
            &self.instance_id,
            BroadcastAction::PresenceAnnounce,
            json!({
                "id": self.instance_id,
                "role": self.role,
                "timestamp": now_millis(),
            }),
        )
    }

    // -- Inbound envelopes ------------------------------------------------

    pub fn handle_envelope(&mut self, env: &PeerEnvelope) -> Vec<BridgeEffect> {
        match env.envelope_type {
            EnvelopeType::Broadcast => self.handle_broadcast(env),
            EnvelopeType::AgentReply => self.handle_agent_reply(env),
            _ => self.handle_mention(env),
        }
    }

    fn handle_broadcast(&mut self, env: &PeerEnvelope) -> Vec<BridgeEffect> {
        let Some(action) = env.action else {
            debug!(
                component = "peer_bridge",
                event = "peer.broadcast_without_action",
                sender_id = %env.sender_id,
                "Ignoring broadcast without action"
            );
            return Vec::new();
        };

        match action {
            BroadcastAction::RollcallRequest => {
                if env.is_from(&self.instance_id) {
                    return Vec::new();
                }
                debug!(
                    component = "peer_bridge",
                    event = "peer.rollcall_ack_sent",
                    to = %env.sender_id,
                    "Acknowledging rollcall"
                );
                vec![BridgeEffect::Publish(PeerEnvelope::broadcast(
                    &self.instance_id,
                    BroadcastAction::RollcallAck,
                    json!({ "instanceId": self.instance_id, "role": self.role }),
                ))]
            }
            BroadcastAction::RollcallAck => {
                // The broker fans our own acks back to us
                if env.is_from(&self.instance_id) {
                    return Vec::new();
                }
                self.instance_count += 1;
                self.roll_call_complete = true;
                info!(
                    component = "peer_bridge",
                    event = "peer.rollcall_ack",
                    from = %env.sender_id,
                    instance_count = self.instance_count,
                    "Peer answered rollcall"
                );
                Vec::new()
            }
            BroadcastAction::InstanceCount => {
                match count_from_payload(&env.payload) {
                    Some(count) => self.instance_count = count,
                    None => debug!(
                        component = "peer_bridge",
                        event = "peer.instance_count_malformed",
                        payload = %env.payload,
                        "Ignoring instance count without a number"
                    ),
                }
                Vec::new()
            }
            BroadcastAction::PresenceAnnounce => {
                if env.is_from(&self.instance_id) {
                    return Vec::new();
                }
                let role = env
                    .payload
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                info!(
                    component = "peer_bridge",
                    event = "peer.presence_announce",
                    from = %env.sender_id,
                    role = %role,
                    "Peer announced presence"
                );
                vec![BridgeEffect::Notice {
                    level: NoticeLevel::Info,
                    text: format!("Peer {} ({}) is online", env.sender_id, role),
                }]
            }
            BroadcastAction::Unknown => {
                debug!(
                    component = "peer_bridge",
                    event = "peer.unknown_action",
                    sender_id = %env.sender_id,
                    "Ignoring unknown broadcast action"
                );
                Vec::new()
            }
        }
    }

    fn handle_agent_reply(&mut self, env: &PeerEnvelope) -> Vec<BridgeEffect> {
        if env.is_from(&self.instance_id) {
            return Vec::new();
        }
        let Some(text) = env.payload_text() else {
            return Vec::new();
        };
        vec![BridgeEffect::Notice {
            level: NoticeLevel::Info,
            text: format!("Reply from {}: {}", env.sender_id, text),
        }]
    }

    fn handle_mention(&mut self, env: &PeerEnvelope) -> Vec<BridgeEffect> {
        if env.is_from(&self.instance_id) {
            return Vec::new();
        }
        let Some(text) = env.payload_text() else {
            debug!(
                component = "peer_bridge",
                event = "peer.payload_without_text",
                sender_id = %env.sender_id,
                "Ignoring envelope without text"
            );
            return Vec::new();
        };

        let cleaned = match strip_mention(text, &self.marker) {
            Some(cleaned) if !cleaned.is_empty() => cleaned,
            _ => return Vec::new(),
        };

        info!(
            component = "peer_bridge",
            event = "peer.mention_forwarded",
            from = %env.sender_id,
            "Forwarding peer mention to local task"
        );
        self.pending_remote_reply = Some(RemoteRequest {
            sender_id: env.sender_id.clone(),
            message_id: env.message_id.clone(),
        });
        vec![BridgeEffect::Inject { text: cleaned }]
    }

    // -- Outbound replies ---------------------------------------------------

    /// If a peer is waiting on us and `msg` is finished task output, build the
    /// envelope that carries it back.
    pub fn take_remote_reply(&mut self, msg: &ConversationMessage) -> Option<PeerEnvelope> {
        if msg.partial || self.pending_remote_reply.is_none() {
            return None;
        }
        if !matches!(
            msg.say_variant(),
            Some(SayVariant::Text | SayVariant::CompletionResult)
        ) || msg.text().trim().is_empty()
        {
            return None;
        }

        let request = self.pending_remote_reply.take()?;
        let body = format!("{} {}", self.marker, msg.text().trim());
        let in_reply_to = (!request.message_id.is_empty()).then_some(request.message_id.as_str());
        debug!(
            component = "peer_bridge",
            event = "peer.reply_published",
            to = %request.sender_id,
            "Republishing task output to peers"
        );
        Some(PeerEnvelope::agent_reply(&self.instance_id, &body, in_reply_to))
    }

    pub fn status_summary(&self, broker: BrokerState, liveness: LivenessCounters) -> String {
        format!(
            "Peers: {} instance(s), rollcall {}, pings {} / acks {} / nacks {}, broker {}",
            self.instance_count,
            if self.roll_call_complete { "complete" } else { "pending" },
            liveness.pings_sent,
            liveness.acks,
            liveness.nacks,
            broker.as_str(),
        )
    }
}

/// Remove the mention marker wherever it appears (case-insensitive).
/// `None` when the text does not mention us at all.
fn strip_mention(text: &str, marker: &str) -> Option<String> {
    if marker.is_empty() {
        return None;
    }
    let addressed = parse_address(text, marker);
    if addressed.address == Address::Peer {
        return Some(addressed.body.to_string());
    }

    let lower = text.to_ascii_lowercase();
    let needle = marker.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut rest = 0;
    let mut found = false;
    for (idx, _) in lower.match_indices(&needle) {
        out.push_str(&text[rest..idx]);
        rest = idx + needle.len();
        found = true;
    }
    if !found {
        return None;
    }
    out.push_str(&text[rest..]);
    Some(out.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn count_from_payload(payload: &Value) -> Option<u32> {
    let value = match payload {
        Value::Object(map) => map.get("count").or_else(|| map.get("instanceCount"))?,
        other => other,
    };
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "@swarm";

    fn bridge(id: &str) -> PeerBridge {
        PeerBridge::new(id, ROLE_CLIENT, MARKER)
    }

    fn published(effects: Vec<BridgeEffect>) -> Vec<PeerEnvelope> {
        effects
            .into_iter()
            .filter_map(|e| match e {
                BridgeEffect::Publish(env) => Some(env),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn rollcall_between_two_instances() {
        let mut a = bridge("A");
        let mut b = bridge("B");

        let request = published(a.on_connected()).remove(0);
        assert_eq!(request.action, Some(BroadcastAction::RollcallRequest));
        assert_eq!(request.payload["requestType"], ROLLCALL_REQUEST_TYPE);
        assert_eq!(request.payload["role"], "client");

        // broker echoes A's own request back to A
        assert!(a.handle_envelope(&request).is_empty());

        let ack = published(b.handle_envelope(&request)).remove(0);
        assert_eq!(ack.action, Some(BroadcastAction::RollcallAck));
        assert_eq!(ack.sender_id, "B");

        // B sees its own ack come back and must not count it
        assert!(b.handle_envelope(&ack).is_empty());
        assert_eq!(b.presence(BrokerState::Connected).instance_count, 0);

        a.handle_envelope(&ack);
        let presence = a.presence(BrokerState::Connected);
        assert_eq!(presence.instance_count, 1);
        assert!(presence.roll_call_complete);
    }

    #[test]
    fn repeated_acks_count_until_instance_count_arrives() {
        let mut a = bridge("A");
        let ack = |from: &str| {
            PeerEnvelope::broadcast(from, BroadcastAction::RollcallAck, json!({"instanceId": from}))
        };

        a.handle_envelope(&ack("B"));
        a.handle_envelope(&ack("B"));
        a.handle_envelope(&ack("C"));
        a.handle_envelope(&ack("A"));
        let presence = a.presence(BrokerState::Connected);
        assert_eq!(presence.instance_count, 3);
        assert!(presence.roll_call_complete);

        a.handle_envelope(&PeerEnvelope::broadcast(
            "S",
            BroadcastAction::InstanceCount,
            json!({"count": 2}),
        ));
        let presence = a.presence(BrokerState::Connected);
        assert_eq!(presence.instance_count, 2);
        assert!(presence.roll_call_complete);
    }

    #[test]
    fn instance_count_accepts_several_shapes() {
        let mut a = bridge("A");
        for (payload, expected) in [
            (json!({"count": 4}), 4),
            (json!({"instanceCount": 2}), 2),
            (json!(7), 7),
        ] {
            a.handle_envelope(&PeerEnvelope::broadcast(
                "S",
                BroadcastAction::InstanceCount,
                payload,
            ));
            assert_eq!(a.presence(BrokerState::Connected).instance_count, expected);
        }

        a.handle_envelope(&PeerEnvelope::broadcast(
            "S",
            BroadcastAction::InstanceCount,
            json!({"count": "many"}),
        ));
        assert_eq!(a.presence(BrokerState::Connected).instance_count, 7);
    }

    #[test]
    fn disconnect_resets_registry() {
        let mut a = bridge("A");
        a.handle_envelope(&PeerEnvelope::broadcast(
            "B",
            BroadcastAction::RollcallAck,
            json!({}),
        ));
        a.on_disconnected();
        let presence = a.presence(BrokerState::Disconnected);
        assert_eq!(presence.instance_count, 0);
        assert!(!presence.roll_call_complete);
    }

    #[test]
    fn mention_is_forwarded_without_marker() {
        let mut a = bridge("A");
        let effects = a.handle_envelope(&PeerEnvelope::user("B", "@swarm do X"));
        assert_eq!(
            effects,
            vec![BridgeEffect::Inject {
                text: "do X".into()
            }]
        );
        assert!(a.awaiting_remote_reply());
    }

    #[test]
    fn marker_inside_text_is_stripped() {
        let mut a = bridge("A");
        let mut env = PeerEnvelope::user("B", "");
        env.payload = json!({"message": "please @SWARM check the build"});
        assert_eq!(
            a.handle_envelope(&env),
            vec![BridgeEffect::Inject {
                text: "please check the build".into()
            }]
        );
    }

    #[test]
    fn own_and_unmarked_messages_are_not_forwarded() {
        let mut a = bridge("A");
        assert!(a.handle_envelope(&PeerEnvelope::user("A", "@swarm do X")).is_empty());
        assert!(a.handle_envelope(&PeerEnvelope::user("B", "no mention")).is_empty());
        assert!(a.handle_envelope(&PeerEnvelope::user("B", "@swarm   ")).is_empty());
        assert!(!a.awaiting_remote_reply());
    }

    #[test]
    fn malformed_envelopes_are_ignored() {
        let mut a = bridge("A");
        let mut no_action = PeerEnvelope::broadcast("B", BroadcastAction::RollcallAck, json!({}));
        no_action.action = None;
        assert!(a.handle_envelope(&no_action).is_empty());

        let mut no_text = PeerEnvelope::user("B", "");
        no_text.payload = json!({"count": 1});
        assert!(a.handle_envelope(&no_text).is_empty());
        assert_eq!(a.presence(BrokerState::Connected).instance_count, 0);
    }

    #[test]
    fn task_output_is_republished_once() {
        let mut a = bridge("A");
        let request = PeerEnvelope::user("B", "@swarm do X");
        a.handle_envelope(&request);

        let streaming = ConversationMessage::say(5, SayVariant::Text, Some("wor"), true);
        assert!(a.take_remote_reply(&streaming).is_none());
        let started = ConversationMessage::say(6, SayVariant::ApiReqStarted, Some("{}"), false);
        assert!(a.take_remote_reply(&started).is_none());

        let done = ConversationMessage::say(7, SayVariant::CompletionResult, Some("done"), false);
        let reply = a.take_remote_reply(&done).expect("reply envelope");
        assert_eq!(reply.envelope_type, EnvelopeType::AgentReply);
        assert_eq!(reply.payload_text(), Some("@swarm done"));
        assert_eq!(reply.payload["inReplyTo"], request.message_id.as_str());

        assert!(a.take_remote_reply(&done).is_none());
    }

    #[test]
    fn agent_replies_are_shown_not_forwarded() {
        let mut b = bridge("B");
        let reply = PeerEnvelope::agent_reply("A", "@swarm done", None);
        let effects = b.handle_envelope(&reply);
        assert!(matches!(
            &effects[..],
            [BridgeEffect::Notice { level: NoticeLevel::Info, text }] if text.contains("@swarm done")
        ));
        assert!(!b.awaiting_remote_reply());
    }

    #[test]
    fn presence_announce_from_peer_is_a_notice() {
        let mut a = bridge("A");
        let b = bridge("B");
        let announce = b.presence_announce();
        assert_eq!(announce.payload["id"], "B");
        assert_eq!(a.handle_envelope(&announce).len(), 1);
        let own = a.presence_announce();
        assert!(a.handle_envelope(&own).is_empty());
        assert_eq!(a.presence(BrokerState::Connected).instance_count, 0);
    }

    #[test]
    fn status_summary_mentions_counters() {
        let a = bridge("A");
        let summary = a.status_summary(
            BrokerState::Error,
            LivenessCounters {
                pings_sent: 2,
                acks: 1,
                nacks: 0,
            },
        );
        assert!(summary.contains("0 instance(s)"));
        assert!(summary.contains("pings 2 / acks 1"));
        assert!(summary.contains("broker error"));
    }
}
