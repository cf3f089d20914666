//! Pure UI-state derivation
//!
//! Which prompt is pending, what the two buttons say and whether the input
//! box accepts text are all a function of the conversation tail plus the
//! retry policy: `derive(previous, history, policy) -> Derivation`.
//! No IO, no timers. The coordinator schedules whatever the derivation asks for.

use convoy_protocol::{AskVariant, ConversationMessage, MessageKind, SayVariant, UiState};
use tracing::debug;

/// Text injected by stubborn mode after the task claims completion.
pub const CONFIRMATION_PROMPT: &str = "Are you sure you completed all the requested work? \
Double-check every step, verify the result, and only finish once nothing is left to do.";

/// Prefix used to recognise earlier confirmation rounds in the history.
const CONFIRMATION_PREFIX: &str = "Are you sure you completed all";

pub const LABEL_START_NEW_TASK: &str = "Start New Task";
pub const LABEL_REJECT: &str = "Reject";

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub stubborn_mode: bool,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            stubborn_mode: false,
            max_attempts: 3,
        }
    }
}

/// A synthetic user reply the caller should submit after the configured delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoReply {
    /// `ts` of the completion message that triggered it
    pub message_ts: u64,
    pub text: String,
    /// 1-based attempt number this reply represents
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AutoReply {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub state: UiState,
    pub auto_reply: Option<AutoReply>,
    /// The panel should drop whatever is typed in the input box
    pub clear_input: bool,
}

// ---------------------------------------------------------------------------
// Rule table — one row per ask variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buttons {
    Always,
    WhenFinal,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    AlwaysDisabled,
    AlwaysEnabled,
    DisabledWhilePartial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primary {
    None,
    Fixed(&'static str),
    /// "Save" for file edits/creations, "Approve" for anything else
    ToolApproval,
    /// Stubborn counter or "Start New Task"
    Completion,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    variant: AskVariant,
    buttons: Buttons,
    primary: Primary,
    secondary: Option<&'static str>,
    input: Input,
}

const fn rule(
    variant: AskVariant,
    buttons: Buttons,
    primary: Primary,
    secondary: Option<&'static str>,
    input: Input,
) -> Rule {
    Rule {
        variant,
        buttons,
        primary,
        secondary,
        input,
    }
}

const RULES: &[Rule] = &[
    rule(
        AskVariant::ApiReqFailed,
        Buttons::Always,
        Primary::Fixed("Retry"),
        Some(LABEL_START_NEW_TASK),
        Input::AlwaysDisabled,
    ),
    rule(
        AskVariant::MistakeLimitReached,
        Buttons::WhenFinal,
        Primary::Fixed("Proceed Anyways"),
        Some(LABEL_START_NEW_TASK),
        Input::AlwaysEnabled,
    ),
    rule(
        AskVariant::AutoApprovalMaxReqReached,
        Buttons::Always,
        Primary::Fixed("Proceed"),
        Some(LABEL_START_NEW_TASK),
        Input::AlwaysDisabled,
    ),
    rule(
        AskVariant::Followup,
        Buttons::Never,
        Primary::None,
        None,
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::PlanModeRespond,
        Buttons::Never,
        Primary::None,
        None,
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::Tool,
        Buttons::WhenFinal,
        Primary::ToolApproval,
        Some(LABEL_REJECT),
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::BrowserActionLaunch,
        Buttons::WhenFinal,
        Primary::Fixed("Approve"),
        Some(LABEL_REJECT),
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::Command,
        Buttons::WhenFinal,
        Primary::Fixed("Run Command"),
        Some(LABEL_REJECT),
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::CommandOutput,
        Buttons::Always,
        Primary::Fixed("Proceed While Running"),
        None,
        Input::AlwaysEnabled,
    ),
    rule(
        AskVariant::UseMcpServer,
        Buttons::WhenFinal,
        Primary::Fixed("Approve"),
        Some(LABEL_REJECT),
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::CompletionResult,
        Buttons::WhenFinal,
        Primary::Completion,
        None,
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::ResumeTask,
        Buttons::Always,
        Primary::Fixed("Resume Task"),
        None,
        Input::AlwaysEnabled,
    ),
    rule(
        AskVariant::ResumeCompletedTask,
        Buttons::Always,
        Primary::Fixed(LABEL_START_NEW_TASK),
        None,
        Input::AlwaysEnabled,
    ),
    rule(
        AskVariant::NewTask,
        Buttons::WhenFinal,
        Primary::Fixed("Start New Task with Context"),
        None,
        Input::DisabledWhilePartial,
    ),
    rule(
        AskVariant::Condense,
        Buttons::WhenFinal,
        Primary::Fixed("Condense Conversation"),
        None,
        Input::DisabledWhilePartial,
    ),
];

fn rule_for(variant: AskVariant) -> Option<&'static Rule> {
    RULES.iter().find(|r| r.variant == variant)
}

// ---------------------------------------------------------------------------
// derive() — the pure core
// ---------------------------------------------------------------------------

/// Recompute panel state after the history changed.
///
/// Only the newest message (and, for one case, the one before it) matters.
/// `Say` messages and unknown ask variants keep `previous` as it was.
pub fn derive(
    previous: &UiState,
    history: &[ConversationMessage],
    policy: &RetryPolicy,
) -> Derivation {
    let mut state = previous.clone();
    let mut auto_reply = None;
    let mut clear_input = false;

    let Some(last) = history.last() else {
        return Derivation {
            state: UiState::default(),
            auto_reply: None,
            clear_input: false,
        };
    };
    let second_last = history.len().checked_sub(2).and_then(|i| history.get(i));

    match last.kind {
        MessageKind::Ask { ask } => match rule_for(ask) {
            Some(rule) => {
                let earlier = &history[..history.len() - 1];
                let (next, reply) = apply_rule(rule, last, earlier, policy);
                state = next;
                auto_reply = reply;
            }
            None => {
                debug!(
                    component = "chat_state",
                    event = "chat_state.unknown_ask",
                    ts = last.ts,
                    "Unknown ask variant, keeping previous UI state"
                );
            }
        },
        MessageKind::Say {
            say: SayVariant::ApiReqStarted,
        } => {
            // The user let a running command continue; the next request is in
            // flight and nothing can be answered until it returns.
            if second_last.and_then(ConversationMessage::ask_variant)
                == Some(AskVariant::CommandOutput)
            {
                state.input_disabled = true;
                state.pending_ask = None;
                state.buttons_enabled = false;
                clear_input = true;
            }
        }
        MessageKind::Say { .. } => {}
    }

    state.is_loading = is_loading(&state, history);

    Derivation {
        state,
        auto_reply,
        clear_input,
    }
}

fn apply_rule(
    rule: &Rule,
    message: &ConversationMessage,
    earlier: &[ConversationMessage],
    policy: &RetryPolicy,
) -> (UiState, Option<AutoReply>) {
    let partial = message.partial;

    let buttons_enabled = match rule.buttons {
        Buttons::Always => true,
        Buttons::WhenFinal => !partial,
        Buttons::Never => false,
    };
    let input_disabled = match rule.input {
        Input::AlwaysDisabled => true,
        Input::AlwaysEnabled => false,
        Input::DisabledWhilePartial => partial,
    };

    let mut auto_reply = None;
    let primary_label = match rule.primary {
        Primary::None => None,
        Primary::Fixed(label) => Some(label.to_string()),
        Primary::ToolApproval => Some(tool_primary_label(message.text()).to_string()),
        Primary::Completion => {
            let attempts = confirmation_attempts(earlier);
            if policy.stubborn_mode && attempts < policy.max_attempts {
                let attempt = attempts + 1;
                if !partial {
                    auto_reply = Some(AutoReply {
                        message_ts: message.ts,
                        text: CONFIRMATION_PROMPT.to_string(),
                        attempt,
                        max_attempts: policy.max_attempts,
                    });
                }
                Some(format!("Stubborn {}/{}", attempt, policy.max_attempts))
            } else {
                Some(LABEL_START_NEW_TASK.to_string())
            }
        }
    };

    let state = UiState {
        pending_ask: Some(rule.variant),
        buttons_enabled,
        primary_label,
        secondary_label: rule.secondary.map(str::to_string),
        input_disabled,
        is_loading: false,
    };
    (state, auto_reply)
}

/// "Save" when the tool edits or creates a file, otherwise "Approve".
fn tool_primary_label(text: &str) -> &'static str {
    let tool = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("tool").and_then(|t| t.as_str()).map(str::to_string));
    match tool.as_deref() {
        Some("editedExistingFile") | Some("newFileCreated") => "Save",
        _ => "Approve",
    }
}

/// Earlier confirmation rounds: followup asks carrying the confirmation prompt.
pub fn confirmation_attempts(history: &[ConversationMessage]) -> u32 {
    history
        .iter()
        .filter(|m| m.ask_variant() == Some(AskVariant::Followup))
        .filter(|m| m.text().trim_start().starts_with(CONFIRMATION_PREFIX))
        .count() as u32
}

fn is_loading(state: &UiState, history: &[ConversationMessage]) -> bool {
    let request_in_flight = matches!(
        history.last().map(|m| m.kind),
        Some(MessageKind::Say {
            say: SayVariant::ApiReqStarted
        })
    );
    let streaming_followup = history
        .iter()
        .rev()
        .find(|m| m.ask_variant().is_some())
        .is_some_and(|m| m.ask_variant() == Some(AskVariant::Followup) && m.partial);

    request_in_flight || (state.input_disabled && !state.buttons_enabled) || streaming_followup
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(ts: u64, variant: AskVariant, partial: bool) -> ConversationMessage {
        ConversationMessage::ask(ts, variant, None, partial)
    }

    fn derive_single(variant: AskVariant, partial: bool) -> Derivation {
        derive(
            &UiState::default(),
            &[ask(1, variant, partial)],
            &RetryPolicy::default(),
        )
    }

    fn labels(d: &Derivation) -> (bool, Option<&str>, Option<&str>) {
        (
            d.state.buttons_enabled,
            d.state.primary_label.as_deref(),
            d.state.secondary_label.as_deref(),
        )
    }

    #[test]
    fn final_messages_match_rule_table() {
        let expected: &[(AskVariant, bool, Option<&str>, Option<&str>)] = &[
            (AskVariant::ApiReqFailed, true, Some("Retry"), Some("Start New Task")),
            (
                AskVariant::MistakeLimitReached,
                true,
                Some("Proceed Anyways"),
                Some("Start New Task"),
            ),
            (
                AskVariant::AutoApprovalMaxReqReached,
                true,
                Some("Proceed"),
                Some("Start New Task"),
            ),
            (AskVariant::Followup, false, None, None),
            (AskVariant::PlanModeRespond, false, None, None),
            (AskVariant::Tool, true, Some("Approve"), Some("Reject")),
            (AskVariant::BrowserActionLaunch, true, Some("Approve"), Some("Reject")),
            (AskVariant::Command, true, Some("Run Command"), Some("Reject")),
            (AskVariant::CommandOutput, true, Some("Proceed While Running"), None),
            (AskVariant::UseMcpServer, true, Some("Approve"), Some("Reject")),
            (AskVariant::CompletionResult, true, Some("Start New Task"), None),
            (AskVariant::ResumeTask, true, Some("Resume Task"), None),
            (AskVariant::ResumeCompletedTask, true, Some("Start New Task"), None),
            (AskVariant::NewTask, true, Some("Start New Task with Context"), None),
            (AskVariant::Condense, true, Some("Condense Conversation"), None),
        ];

        assert_eq!(expected.len(), RULES.len(), "every rule row is covered");

        for &(variant, buttons, primary, secondary) in expected {
            let d = derive_single(variant, false);
            assert_eq!(
                labels(&d),
                (buttons, primary, secondary),
                "variant {:?}",
                variant
            );
            assert_eq!(d.state.pending_ask, Some(variant));
            assert!(d.auto_reply.is_none());
        }
    }

    #[test]
    fn partial_messages_keep_buttons_disabled() {
        let always_enabled = [
            AskVariant::CommandOutput,
            AskVariant::ResumeTask,
            AskVariant::ResumeCompletedTask,
            AskVariant::ApiReqFailed,
            AskVariant::AutoApprovalMaxReqReached,
        ];

        for rule in RULES {
            let d = derive_single(rule.variant, true);
            if always_enabled.contains(&rule.variant) {
                assert!(d.state.buttons_enabled, "{:?} stays enabled", rule.variant);
            } else {
                assert!(!d.state.buttons_enabled, "{:?} partial", rule.variant);
            }
        }
    }

    #[test]
    fn input_rules_follow_partial_flag() {
        assert!(derive_single(AskVariant::ApiReqFailed, false).state.input_disabled);
        assert!(!derive_single(AskVariant::MistakeLimitReached, true).state.input_disabled);
        assert!(!derive_single(AskVariant::CommandOutput, true).state.input_disabled);
        assert!(!derive_single(AskVariant::ResumeTask, false).state.input_disabled);
        assert!(derive_single(AskVariant::Tool, true).state.input_disabled);
        assert!(!derive_single(AskVariant::Tool, false).state.input_disabled);
        assert!(derive_single(AskVariant::Followup, true).state.input_disabled);
        assert!(!derive_single(AskVariant::Followup, false).state.input_disabled);
    }

    #[test]
    fn tool_edits_ask_to_save() {
        let history = [ConversationMessage::ask(
            1,
            AskVariant::Tool,
            Some(r#"{"tool":"editedExistingFile","path":"src/lib.rs"}"#),
            false,
        )];
        let d = derive(&UiState::default(), &history, &RetryPolicy::default());
        assert_eq!(d.state.primary_label.as_deref(), Some("Save"));

        let history = [ConversationMessage::ask(
            1,
            AskVariant::Tool,
            Some(r#"{"tool":"readFile"}"#),
            false,
        )];
        let d = derive(&UiState::default(), &history, &RetryPolicy::default());
        assert_eq!(d.state.primary_label.as_deref(), Some("Approve"));

        let history = [ConversationMessage::ask(1, AskVariant::Tool, Some("not json"), false)];
        let d = derive(&UiState::default(), &history, &RetryPolicy::default());
        assert_eq!(d.state.primary_label.as_deref(), Some("Approve"));
    }

    #[test]
    fn stubborn_mode_labels_and_schedules_reply() {
        let policy = RetryPolicy {
            stubborn_mode: true,
            max_attempts: 3,
        };
        let history = [ask(10, AskVariant::CompletionResult, false)];
        let d = derive(&UiState::default(), &history, &policy);

        assert_eq!(d.state.primary_label.as_deref(), Some("Stubborn 1/3"));
        let reply = d.auto_reply.expect("auto reply requested");
        assert_eq!(reply.text, CONFIRMATION_PROMPT);
        assert_eq!(reply.message_ts, 10);
        assert_eq!(reply.attempt, 1);
        assert!(!reply.is_final_attempt());
    }

    #[test]
    fn stubborn_mode_waits_for_final_message() {
        let policy = RetryPolicy {
            stubborn_mode: true,
            max_attempts: 3,
        };
        let d = derive(
            &UiState::default(),
            &[ask(10, AskVariant::CompletionResult, true)],
            &policy,
        );
        assert_eq!(d.state.primary_label.as_deref(), Some("Stubborn 1/3"));
        assert!(d.auto_reply.is_none());
        assert!(!d.state.buttons_enabled);
    }

    #[test]
    fn stubborn_mode_counts_previous_rounds() {
        let policy = RetryPolicy {
            stubborn_mode: true,
            max_attempts: 3,
        };
        let history = vec![
            ask(1, AskVariant::CompletionResult, false),
            ConversationMessage::ask(2, AskVariant::Followup, Some(CONFIRMATION_PROMPT), false),
            ask(3, AskVariant::CompletionResult, false),
            ConversationMessage::say(4, SayVariant::UserFeedback, Some(CONFIRMATION_PROMPT), false),
            ConversationMessage::ask(5, AskVariant::Followup, Some(CONFIRMATION_PROMPT), false),
            ConversationMessage::ask(6, AskVariant::Followup, Some("unrelated question"), false),
            ask(7, AskVariant::CompletionResult, false),
        ];
        let d = derive(&UiState::default(), &history, &policy);
        assert_eq!(d.state.primary_label.as_deref(), Some("Stubborn 3/3"));
        assert!(d.auto_reply.expect("last attempt").is_final_attempt());
    }

    #[test]
    fn echoed_feedback_is_not_a_confirmation_round() {
        let policy = RetryPolicy {
            stubborn_mode: true,
            max_attempts: 3,
        };
        let history = vec![
            ask(1, AskVariant::CompletionResult, false),
            ConversationMessage::say(2, SayVariant::UserFeedback, Some(CONFIRMATION_PROMPT), false),
            ask(3, AskVariant::CompletionResult, false),
        ];
        assert_eq!(confirmation_attempts(&history), 0);
        let d = derive(&UiState::default(), &history, &policy);
        assert_eq!(d.state.primary_label.as_deref(), Some("Stubborn 1/3"));
    }

    #[test]
    fn stubborn_mode_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            stubborn_mode: true,
            max_attempts: 1,
        };
        let history = vec![
            ConversationMessage::ask(1, AskVariant::Followup, Some(CONFIRMATION_PROMPT), false),
            ask(2, AskVariant::CompletionResult, false),
        ];
        let d = derive(&UiState::default(), &history, &policy);
        assert_eq!(d.state.primary_label.as_deref(), Some("Start New Task"));
        assert!(d.auto_reply.is_none());
    }

    #[test]
    fn stubborn_mode_off_never_schedules() {
        let d = derive_single(AskVariant::CompletionResult, false);
        assert_eq!(d.state.primary_label.as_deref(), Some("Start New Task"));
        assert!(d.auto_reply.is_none());
    }

    #[test]
    fn unknown_ask_keeps_previous_state() {
        let previous = derive_single(AskVariant::Command, false).state;
        let history = [
            ask(1, AskVariant::Command, false),
            ask(2, AskVariant::Unknown, false),
        ];
        let d = derive(&previous, &history, &RetryPolicy::default());
        assert_eq!(d.state, previous);
    }

    #[test]
    fn say_messages_keep_previous_state() {
        let previous = derive_single(AskVariant::Tool, false).state;
        let history = [
            ask(1, AskVariant::Tool, false),
            ConversationMessage::say(2, SayVariant::Text, Some("thinking"), true),
        ];
        let d = derive(&previous, &history, &RetryPolicy::default());
        assert_eq!(d.state.pending_ask, Some(AskVariant::Tool));
        assert!(d.state.buttons_enabled);
        assert!(!d.clear_input);
    }

    #[test]
    fn request_started_after_command_output_locks_input() {
        let previous = derive_single(AskVariant::CommandOutput, false).state;
        let history = [
            ask(1, AskVariant::CommandOutput, false),
            ConversationMessage::say(2, SayVariant::ApiReqStarted, None, false),
        ];
        let d = derive(&previous, &history, &RetryPolicy::default());
        assert!(d.state.input_disabled);
        assert!(!d.state.buttons_enabled);
        assert_eq!(d.state.pending_ask, None);
        assert!(d.clear_input);
        assert!(d.state.is_loading);
    }

    #[test]
    fn loading_rules() {
        // request in flight
        let history = [ConversationMessage::say(1, SayVariant::ApiReqStarted, None, false)];
        let d = derive(&UiState::default(), &history, &RetryPolicy::default());
        assert!(d.state.is_loading);

        // streaming followup
        assert!(derive_single(AskVariant::Followup, true).state.is_loading);
        // answered followup waits on the user, not the model
        assert!(!derive_single(AskVariant::Followup, false).state.is_loading);
        // input locked with nothing to click
        assert!(derive_single(AskVariant::Tool, true).state.is_loading);
        assert!(!derive_single(AskVariant::ApiReqFailed, false).state.is_loading);
    }

    #[test]
    fn empty_history_resets_state() {
        let previous = derive_single(AskVariant::Tool, false).state;
        let d = derive(&previous, &[], &RetryPolicy::default());
        assert_eq!(d.state, UiState::default());
    }
}
