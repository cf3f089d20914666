//! Convoy → Panel messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from Convoy to UI panels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    // Full state sync
    #[serde(rename_all = "camelCase")]
    Snapshot {
        instance_id: String,
        ui: UiState,
        messages: Vec<ConversationMessage>,
        presence: Presence,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_outgoing: Option<String>,
    },

    // Incremental updates
    MessageUpdated {
        message: ConversationMessage,
    },
    UiState {
        ui: UiState,
    },
    Presence {
        presence: Presence,
    },
    HistoryCleared,
    ClearInput,

    // Output channel
    Notice {
        level: NoticeLevel,
        text: String,
    },

    Liveness {
        kind: LivenessKind,
        from: String,
    },

    // Errors
    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::ServerMessage;
    use crate::types::*;

    #[test]
    fn roundtrip_snapshot() {
        let msg = ServerMessage::Snapshot {
            instance_id: "self".into(),
            ui: UiState::default(),
            messages: vec![ConversationMessage::say(
                1,
                SayVariant::ApiReqStarted,
                None,
                false,
            )],
            presence: Presence {
                instance_count: 2,
                roll_call_complete: true,
                broker: BrokerState::Connected,
            },
            pending_outgoing: None,
        };

        let json = serde_json::to_string(&msg).expect("serialize");
        let reparsed: ServerMessage = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerMessage::Snapshot {
                instance_id,
                messages,
                presence,
                ..
            } => {
                assert_eq!(instance_id, "self");
                assert_eq!(messages.len(), 1);
                assert_eq!(presence.instance_count, 2);
                assert_eq!(presence.broker, BrokerState::Connected);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn notice_wire_shape() {
        let msg = ServerMessage::Notice {
            level: NoticeLevel::Warning,
            text: "broker unreachable".into(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "notice");
        assert_eq!(json["level"], "warning");
    }
}
