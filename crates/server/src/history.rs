//! Conversation history kept by the coordinator
//!
//! Messages are keyed by `ts`. Streaming updates for a partial entry
//! overwrite it in place; once an entry is final it never changes again.

use convoy_protocol::ConversationMessage;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New `ts`, appended (or inserted in `ts` order)
    Appended,
    /// Existing partial entry updated, still streaming
    Updated,
    /// Existing partial entry received its final content
    Completed,
    /// Duplicate of what we already hold
    Unchanged,
    /// Conflicts with an existing entry; dropped
    Rejected,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            MergeOutcome::Appended | MergeOutcome::Updated | MergeOutcome::Completed
        )
    }
}

#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<ConversationMessage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replace everything with a resync from the host.
    pub fn replace(&mut self, mut messages: Vec<ConversationMessage>) {
        messages.sort_by_key(|m| m.ts);
        messages.dedup_by_key(|m| m.ts);
        self.messages = messages;
    }

    pub fn apply(&mut self, incoming: ConversationMessage) -> MergeOutcome {
        // Streaming updates almost always hit the tail, so search from the back
        let Some(idx) = self.messages.iter().rposition(|m| m.ts == incoming.ts) else {
            let at = self.messages.partition_point(|m| m.ts < incoming.ts);
            self.messages.insert(at, incoming);
            return MergeOutcome::Appended;
        };

        let existing = &mut self.messages[idx];
        if existing.kind != incoming.kind {
            warn!(
                component = "history",
                event = "history.kind_conflict",
                ts = incoming.ts,
                existing = ?existing.kind,
                incoming = ?incoming.kind,
                "Message changed kind or variant, ignoring update"
            );
            return MergeOutcome::Rejected;
        }

        if !existing.partial {
            if *existing != incoming {
                warn!(
                    component = "history",
                    event = "history.final_reopened",
                    ts = incoming.ts,
                    "Update for a finished message, ignoring"
                );
                return MergeOutcome::Rejected;
            }
            return MergeOutcome::Unchanged;
        }

        if *existing == incoming {
            return MergeOutcome::Unchanged;
        }

        let completed = !incoming.partial;
        existing.text = incoming.text;
        existing.images = incoming.images;
        existing.partial = incoming.partial;

        if completed {
            MergeOutcome::Completed
        } else {
            MergeOutcome::Updated
        }
    }
}
