//! Outbound routing of user input
//!
//! Every reply the user produces (typed text, a button press, a forwarded
//! mention) goes through `MessageRouter`, which decides between the local
//! task host and the peer network and returns the effects to execute.

use convoy_protocol::{AskResponse, AskVariant, PeerEnvelope, UiState, WebviewMessage};
use tracing::{debug, warn};

use crate::chat_state::{LABEL_REJECT, LABEL_START_NEW_TASK};

/// Text sent when the user cancels; the host treats it like any other reply.
pub const CANCEL_TEXT: &str = "cancel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Peer,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressed<'a> {
    pub address: Address,
    /// Text with the marker removed (peer) or untouched (local)
    pub body: &'a str,
}

/// Split user input into its destination and body.
///
/// Input addresses the peer network when it starts with `marker`, compared
/// ASCII case-insensitively.
pub fn parse_address<'a>(text: &'a str, marker: &str) -> Addressed<'a> {
    let is_peer = !marker.is_empty()
        && text
            .get(..marker.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(marker));

    if is_peer {
        Addressed {
            address: Address::Peer,
            body: text[marker.len()..].trim(),
        }
    } else {
        Addressed {
            address: Address::Local,
            body: text,
        }
    }
}

/// IO the caller performs on the router's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEffect {
    /// Publish to the peer network
    Publish(PeerEnvelope),
    /// Send to the task host
    Host(WebviewMessage),
    /// Drop whatever is typed in the panel's input box
    ClearInput,
}

pub struct MessageRouter {
    instance_id: String,
    marker: String,
    pending_outgoing: Option<String>,
}

impl MessageRouter {
    pub fn new(instance_id: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            marker: marker.into(),
            pending_outgoing: None,
        }
    }

    /// Text sent optimistically that the host has not answered yet
    pub fn pending_outgoing(&self) -> Option<&str> {
        self.pending_outgoing.as_deref()
    }

    /// The host produced a new message; the optimistic entry is superseded.
    pub fn settle_outgoing(&mut self) {
        self.pending_outgoing = None;
    }

    /// Route text typed by the user (or injected by stubborn mode).
    pub fn handle_send(
        &mut self,
        text: &str,
        images: Vec<String>,
        task_active: bool,
        ui: &mut UiState,
    ) -> Vec<RouteEffect> {
        let text = text.trim();
        if text.is_empty() && images.is_empty() {
            return Vec::new();
        }

        if parse_address(text, &self.marker).address == Address::Peer {
            debug!(
                component = "router",
                event = "router.peer_send",
                "Routing message to peer network"
            );
            return vec![
                RouteEffect::Publish(PeerEnvelope::user(&self.instance_id, text)),
                RouteEffect::ClearInput,
            ];
        }

        let mut effects = Vec::with_capacity(2);
        if !task_active {
            self.pending_outgoing = Some(text.to_string());
            effects.push(RouteEffect::Host(WebviewMessage::NewTask {
                text: text.to_string(),
                images,
            }));
        } else if ui.pending_ask.is_some() {
            self.pending_outgoing = Some(text.to_string());
            effects.push(RouteEffect::Host(reply(
                AskResponse::MessageResponse,
                Some(text.to_string()),
                images,
            )));
        } else {
            warn!(
                component = "router",
                event = "router.no_pending_prompt",
                "Task is busy and no prompt is pending, message not sent"
            );
        }

        effects.push(RouteEffect::ClearInput);
        optimistic_reset(ui);
        effects
    }

    /// Text that arrived from a peer mention. Starts a task when none is
    /// running, otherwise answers through the reply path unconditionally.
    pub fn inject_remote(
        &mut self,
        text: &str,
        task_active: bool,
        ui: &mut UiState,
    ) -> Vec<RouteEffect> {
        let effect = if task_active {
            RouteEffect::Host(reply(
                AskResponse::MessageResponse,
                Some(text.to_string()),
                Vec::new(),
            ))
        } else {
            RouteEffect::Host(WebviewMessage::NewTask {
                text: text.to_string(),
                images: Vec::new(),
            })
        };
        optimistic_reset(ui);
        vec![effect]
    }

    pub fn handle_primary(
        &mut self,
        text: Option<String>,
        images: Vec<String>,
        ui: &mut UiState,
    ) -> Vec<RouteEffect> {
        let Some(ask) = ui.pending_ask.filter(|_| ui.buttons_enabled) else {
            debug!(
                component = "router",
                event = "router.primary_ignored",
                "Primary button pressed with no active prompt"
            );
            return Vec::new();
        };

        let message = match ask {
            AskVariant::CompletionResult
            | AskVariant::ResumeCompletedTask
            | AskVariant::NewTask => WebviewMessage::ClearTask,
            _ => reply(AskResponse::YesButtonClicked, non_empty(text), images),
        };
        self.finish_button(message, ui)
    }

    pub fn handle_secondary(
        &mut self,
        text: Option<String>,
        images: Vec<String>,
        ui: &mut UiState,
    ) -> Vec<RouteEffect> {
        if ui.pending_ask.is_none() || !ui.buttons_enabled {
            return Vec::new();
        }
        let message = match ui.secondary_label.as_deref() {
            Some(LABEL_START_NEW_TASK) => WebviewMessage::ClearTask,
            Some(LABEL_REJECT) => reply(AskResponse::NoButtonClicked, non_empty(text), images),
            _ => return Vec::new(),
        };
        self.finish_button(message, ui)
    }

    pub fn handle_cancel(&mut self, ui: &mut UiState) -> Vec<RouteEffect> {
        let message = reply(
            AskResponse::MessageResponse,
            Some(CANCEL_TEXT.to_string()),
            Vec::new(),
        );
        self.finish_button(message, ui)
    }

    fn finish_button(&mut self, message: WebviewMessage, ui: &mut UiState) -> Vec<RouteEffect> {
        optimistic_reset(ui);
        vec![RouteEffect::Host(message), RouteEffect::ClearInput]
    }
}

fn reply(ask_response: AskResponse, text: Option<String>, images: Vec<String>) -> WebviewMessage {
    WebviewMessage::AskResponse {
        ask_response,
        text,
        images,
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

/// Lock the panel until the host's next message supersedes this state.
fn optimistic_reset(ui: &mut UiState) {
    ui.input_disabled = true;
    ui.pending_ask = None;
    ui.buttons_enabled = false;
    ui.is_loading = true;
}
