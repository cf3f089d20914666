//! Panel → Convoy messages

use serde::{Deserialize, Serialize};

use crate::types::LivenessKind;

/// Messages sent from a UI panel to Convoy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Text typed into the input box, with any attached images
    Send {
        text: String,
        #[serde(default)]
        images: Vec<String>,
    },

    // Prompt buttons
    PrimaryButton {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },
    SecondaryButton {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },
    Cancel,

    // Peer network
    ConnectToPeers,

    /// Same-host liveness probe
    Liveness {
        kind: LivenessKind,
        from: String,
    },

    /// Navigation action passed through to the task host as-is
    Action {
        action: String,
    },
}
