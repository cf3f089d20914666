//! Commands processed by the coordinator actor

use convoy_protocol::{ClientMessage, HostMessage, ServerMessage};
use tokio::sync::{broadcast, oneshot};

use crate::scheduler::TimerKey;

pub enum CoordinatorCommand {
    /// A message from the task host socket
    Host(HostMessage),
    /// A message from a UI panel
    Panel(ClientMessage),
    TimerFired {
        key: TimerKey,
        generation: u64,
    },
    /// Attach a panel: full snapshot plus a live update stream
    Subscribe {
        reply: oneshot::Sender<PanelSubscription>,
    },
    Shutdown,
}

pub struct PanelSubscription {
    pub snapshot: ServerMessage,
    pub rx: broadcast::Receiver<ServerMessage>,
}
