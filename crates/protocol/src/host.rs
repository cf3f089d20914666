//! Task host ↔ Convoy messages

use serde::{Deserialize, Serialize};

use crate::types::{AskResponse, AskVariant, ConversationMessage, MessageKind, SayVariant};

/// Messages sent from the task host to Convoy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Ask {
        ts: u64,
        ask: AskVariant,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        partial: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Say {
        ts: u64,
        say: SayVariant,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        partial: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },

    // Task lifecycle
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        task_id: String,
    },
    TaskCleared,

    /// Full history resync (e.g. after the panel reloads)
    State {
        messages: Vec<ConversationMessage>,
    },

    /// UI navigation side channel; not part of the conversation
    Action {
        action: String,
    },
}

impl HostMessage {
    /// The conversation entry carried by an `ask` or `say` message
    pub fn into_conversation_message(self) -> Option<ConversationMessage> {
        match self {
            HostMessage::Ask {
                ts,
                ask,
                text,
                partial,
                images,
            } => Some(ConversationMessage {
                ts,
                kind: MessageKind::Ask { ask },
                text,
                partial,
                images,
            }),
            HostMessage::Say {
                ts,
                say,
                text,
                partial,
                images,
            } => Some(ConversationMessage {
                ts,
                kind: MessageKind::Say { say },
                text,
                partial,
                images,
            }),
            _ => None,
        }
    }
}

/// Messages sent from Convoy to the task host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WebviewMessage {
    #[serde(rename_all = "camelCase")]
    AskResponse {
        ask_response: AskResponse,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },
    NewTask {
        text: String,
        #[serde(default)]
        images: Vec<String>,
    },
    ClearTask,
    /// UI navigation side channel; carried through untouched
    Action {
        action: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ask_parses_into_conversation_message() {
        let raw = r#"{"type":"ask","ts":42,"ask":"tool","text":"{\"tool\":\"newFileCreated\"}","partial":false}"#;
        let msg: HostMessage = serde_json::from_str(raw).expect("deserialize");
        let entry = msg.into_conversation_message().expect("conversation entry");
        assert_eq!(entry.ts, 42);
        assert_eq!(entry.ask_variant(), Some(AskVariant::Tool));
        assert!(!entry.partial);
    }

    #[test]
    fn task_started_uses_camel_case_fields() {
        let msg: HostMessage =
            serde_json::from_str(r#"{"type":"taskStarted","taskId":"t-1"}"#).expect("deserialize");
        assert!(matches!(msg, HostMessage::TaskStarted { ref task_id } if task_id == "t-1"));
        assert!(msg.into_conversation_message().is_none());
    }

    #[test]
    fn action_frames_parse() {
        let msg: HostMessage =
            serde_json::from_str(r#"{"type":"action","action":"chatButtonClicked"}"#)
                .expect("deserialize");
        assert!(matches!(
            msg,
            HostMessage::Action { ref action } if action == "chatButtonClicked"
        ));
        assert!(msg.into_conversation_message().is_none());
    }

    #[test]
    fn ask_response_wire_shape() {
        let msg = WebviewMessage::AskResponse {
            ask_response: AskResponse::MessageResponse,
            text: Some("yes".into()),
            images: vec![],
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "askResponse");
        assert_eq!(json["askResponse"], "messageResponse");
        assert_eq!(json["text"], "yes");
        assert!(json["images"].as_array().is_some_and(|a| a.is_empty()));
    }
}
