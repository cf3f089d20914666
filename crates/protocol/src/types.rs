//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Prompt variants the task host can raise while waiting on the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskVariant {
    ApiReqFailed,
    MistakeLimitReached,
    AutoApprovalMaxReqReached,
    Followup,
    PlanModeRespond,
    Tool,
    BrowserActionLaunch,
    Command,
    CommandOutput,
    UseMcpServer,
    CompletionResult,
    ResumeTask,
    ResumeCompletedTask,
    NewTask,
    Condense,
    /// Anything a newer host sends that this build does not know
    #[serde(other)]
    Unknown,
}

/// Informational emissions from the task host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayVariant {
    Text,
    /// An API request to the model has been issued and not yet answered
    ApiReqStarted,
    CompletionResult,
    UserFeedback,
    Error,
    CommandOutput,
    Tool,
    #[serde(other)]
    Unknown,
}

/// Message kind plus its variant.
///
/// Serialized flat into the owning message: `{"type":"ask","ask":"tool"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    Ask { ask: AskVariant },
    Say { say: SayVariant },
}

/// One entry of the conversation history. `ts` doubles as the message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub ts: u64,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ConversationMessage {
    pub fn ask(ts: u64, ask: AskVariant, text: Option<&str>, partial: bool) -> Self {
        Self {
            ts,
            kind: MessageKind::Ask { ask },
            text: text.map(str::to_string),
            partial,
            images: Vec::new(),
        }
    }

    pub fn say(ts: u64, say: SayVariant, text: Option<&str>, partial: bool) -> Self {
        Self {
            ts,
            kind: MessageKind::Say { say },
            text: text.map(str::to_string),
            partial,
            images: Vec::new(),
        }
    }

    /// The ask variant, if this is a prompt
    pub fn ask_variant(&self) -> Option<AskVariant> {
        match self.kind {
            MessageKind::Ask { ask } => Some(ask),
            MessageKind::Say { .. } => None,
        }
    }

    /// The say variant, if this is an informational emission
    pub fn say_variant(&self) -> Option<SayVariant> {
        match self.kind {
            MessageKind::Say { say } => Some(say),
            MessageKind::Ask { .. } => None,
        }
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Interactive panel state derived from the conversation tail.
///
/// Never persisted; recomputed whenever the history changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub pending_ask: Option<AskVariant>,
    pub buttons_enabled: bool,
    pub primary_label: Option<String>,
    pub secondary_label: Option<String>,
    pub input_disabled: bool,
    pub is_loading: bool,
}

/// Reply kinds accepted by the task host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AskResponse {
    MessageResponse,
    YesButtonClicked,
    NoButtonClicked,
}

/// Broker transport state, as shown to panels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    /// No usable broker address; stays this way for the whole run
    Disabled,
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl BrokerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Disabled => "disabled",
            BrokerState::Disconnected => "disconnected",
            BrokerState::Connecting => "connecting",
            BrokerState::Connected => "connected",
            BrokerState::Error => "error",
        }
    }
}

/// Peer presence as known to this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub instance_count: u32,
    pub roll_call_complete: bool,
    pub broker: BrokerState,
}

/// Severity of a notice shown in a panel's output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Same-host liveness probe kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessKind {
    Ping,
    Ack,
    Nack,
}
