//! Coordinator actor
//!
//! A single tokio task owns the conversation history, the derived UI state,
//! the router, the peer bridge and all timers. Host messages, panel actions,
//! broker events and timer firings are processed one at a time. Readers that
//! only need a summary (health checks) go through a lock-free `ArcSwap`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use convoy_protocol::{
    BrokerState, ClientMessage, EnvelopeType, HostMessage, NoticeLevel, PeerEnvelope, Presence,
    ServerMessage, UiState, WebviewMessage,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnection, BrokerEvent};
use crate::chat_state::{derive, AutoReply, RetryPolicy};
use crate::command::{CoordinatorCommand, PanelSubscription};
use crate::history::History;
use crate::liveness::LivenessChannel;
use crate::peer_bridge::{BridgeEffect, PeerBridge};
use crate::router::{MessageRouter, RouteEffect};
use crate::scheduler::{Scheduler, TimerKey};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    pub role: String,
    pub mention_marker: String,
    pub policy: RetryPolicy,
    pub auto_reply_delay: Duration,
    pub status_confirm_delay: Duration,
    pub status_final_delay: Duration,
}

/// Summary readable without going through the actor
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub instance_id: String,
    pub ui: UiState,
    pub presence: Presence,
    pub message_count: usize,
    pub task_active: bool,
}

/// Handle to the running coordinator (cheap to Clone).
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::Sender<CoordinatorCommand>,
    snapshot: Arc<ArcSwap<CoordinatorSnapshot>>,
    host_tx: broadcast::Sender<WebviewMessage>,
}

impl CoordinatorHandle {
    pub async fn send(&self, cmd: CoordinatorCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "coordinator",
                event = "coordinator.closed",
                "Coordinator channel closed, command dropped"
            );
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<CoordinatorSnapshot> {
        self.snapshot.load_full()
    }

    /// Attach a UI panel. `None` once the coordinator has stopped.
    pub async fn subscribe_panel(&self) -> Option<PanelSubscription> {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorCommand::Subscribe { reply }).await;
        rx.await.ok()
    }

    /// Messages addressed to the task host.
    pub fn subscribe_host(&self) -> broadcast::Receiver<WebviewMessage> {
        self.host_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        self.send(CoordinatorCommand::Shutdown).await;
    }
}

pub fn spawn(
    config: CoordinatorConfig,
    broker: BrokerConnection,
    broker_events: mpsc::Receiver<BrokerEvent>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (host_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let (panel_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

    let broker_state = broker.state();
    let bridge = PeerBridge::new(&config.instance_id, &config.role, &config.mention_marker);
    let initial = CoordinatorSnapshot {
        instance_id: config.instance_id.clone(),
        ui: UiState::default(),
        presence: bridge.presence(broker_state),
        message_count: 0,
        task_active: false,
    };
    let snapshot = Arc::new(ArcSwap::from_pointee(initial));

    let coordinator = Coordinator {
        router: MessageRouter::new(&config.instance_id, &config.mention_marker),
        liveness: LivenessChannel::new(&config.instance_id),
        scheduler: Scheduler::new(command_tx.clone()),
        bridge,
        broker,
        broker_state,
        history: History::new(),
        ui: UiState::default(),
        task_active: false,
        auto_reply: None,
        last_auto_reply_ts: None,
        host_tx: host_tx.clone(),
        panel_tx,
        snapshot: snapshot.clone(),
        config,
    };
    let task = tokio::spawn(coordinator.run(command_rx, broker_events));

    (
        CoordinatorHandle {
            command_tx,
            snapshot,
            host_tx,
        },
        task,
    )
}

struct Coordinator {
    config: CoordinatorConfig,
    history: History,
    ui: UiState,
    task_active: bool,
    router: MessageRouter,
    bridge: PeerBridge,
    liveness: LivenessChannel,
    broker: BrokerConnection,
    broker_state: BrokerState,
    scheduler: Scheduler,
    /// Confirmation reply waiting on its timer
    auto_reply: Option<AutoReply>,
    /// Completion message an auto-reply was already requested for
    last_auto_reply_ts: Option<u64>,
    host_tx: broadcast::Sender<WebviewMessage>,
    panel_tx: broadcast::Sender<ServerMessage>,
    snapshot: Arc<ArcSwap<CoordinatorSnapshot>>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<CoordinatorCommand>,
        mut broker_events: mpsc::Receiver<BrokerEvent>,
    ) {
        info!(
            component = "coordinator",
            event = "coordinator.started",
            instance_id = %self.config.instance_id,
            broker = self.broker_state.as_str(),
            "Coordinator started"
        );

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(CoordinatorCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(event) = broker_events.recv() => self.handle_broker_event(event),
            }
        }

        self.scheduler.cancel_all();
        self.broker.stop().await;
        info!(
            component = "coordinator",
            event = "coordinator.stopped",
            "Coordinator stopped"
        );
    }

    fn handle_command(&mut self, cmd: CoordinatorCommand) {
        match cmd {
            CoordinatorCommand::Host(msg) => self.handle_host(msg),
            CoordinatorCommand::Panel(msg) => self.handle_panel(msg),
            CoordinatorCommand::TimerFired { key, generation } => {
                if self.scheduler.complete(key, generation) {
                    self.handle_timer(key);
                }
            }
            CoordinatorCommand::Subscribe { reply } => {
                let rx = self.panel_tx.subscribe();
                let _ = reply.send(PanelSubscription {
                    snapshot: self.full_snapshot(),
                    rx,
                });
            }
            CoordinatorCommand::Shutdown => {}
        }
        self.publish_snapshot();
    }

    // -- Task host ------------------------------------------------------------

    fn handle_host(&mut self, msg: HostMessage) {
        match msg {
            HostMessage::TaskStarted { task_id } => {
                info!(
                    component = "coordinator",
                    event = "task.started",
                    task_id = %task_id,
                    "Task started"
                );
                self.task_active = true;
            }
            HostMessage::TaskCleared => {
                info!(
                    component = "coordinator",
                    event = "task.cleared",
                    "Task cleared"
                );
                self.task_active = false;
                self.history.clear();
                self.cancel_auto_reply();
                self.last_auto_reply_ts = None;
                self.router.settle_outgoing();
                self.ui = UiState::default();
                self.to_panels(ServerMessage::HistoryCleared);
                self.to_panels(ServerMessage::UiState {
                    ui: self.ui.clone(),
                });
            }
            HostMessage::State { messages } => {
                self.task_active = !messages.is_empty();
                self.history.replace(messages);
                self.cancel_auto_reply();
                self.router.settle_outgoing();
                self.rederive();
                self.to_panels(self.full_snapshot());
            }
            HostMessage::Action { action } => {
                debug!(
                    component = "coordinator",
                    event = "host.action_ignored",
                    action = %action,
                    "Navigation action from host ignored"
                );
            }
            other => {
                let Some(message) = other.into_conversation_message() else {
                    return;
                };
                if !self.history.apply(message.clone()).changed() {
                    return;
                }
                self.task_active = true;
                self.router.settle_outgoing();
                if self
                    .auto_reply
                    .as_ref()
                    .is_some_and(|pending| pending.message_ts != message.ts)
                {
                    self.cancel_auto_reply();
                }

                if let Some(reply) = self.bridge.take_remote_reply(&message) {
                    self.publish(reply);
                }
                self.to_panels(ServerMessage::MessageUpdated { message });
                self.rederive();
            }
        }
    }

    fn rederive(&mut self) {
        let derivation = derive(&self.ui, self.history.messages(), &self.config.policy);
        if derivation.clear_input {
            self.to_panels(ServerMessage::ClearInput);
        }
        if derivation.state != self.ui {
            self.ui = derivation.state;
            self.to_panels(ServerMessage::UiState {
                ui: self.ui.clone(),
            });
        }
        if let Some(reply) = derivation.auto_reply {
            self.request_auto_reply(reply);
        }
    }

    fn request_auto_reply(&mut self, reply: AutoReply) {
        if self.last_auto_reply_ts == Some(reply.message_ts) {
            return;
        }
        self.last_auto_reply_ts = Some(reply.message_ts);

        info!(
            component = "coordinator",
            event = "stubborn.scheduled",
            attempt = reply.attempt,
            max_attempts = reply.max_attempts,
            "Scheduling confirmation reply"
        );
        if reply.is_final_attempt() {
            self.notice(
                NoticeLevel::Warning,
                format!(
                    "Stubborn mode: final confirmation attempt ({}/{})",
                    reply.attempt, reply.max_attempts
                ),
            );
        }
        self.auto_reply = Some(reply);
        self.scheduler
            .schedule(TimerKey::AutoReply, self.config.auto_reply_delay);
    }

    fn cancel_auto_reply(&mut self) {
        if self.auto_reply.take().is_some() {
            self.scheduler.cancel(TimerKey::AutoReply);
        }
    }

    // -- Panels ---------------------------------------------------------------

    fn handle_panel(&mut self, msg: ClientMessage) {
        let effects = match msg {
            ClientMessage::Send { text, images } => {
                self.cancel_auto_reply();
                self.router
                    .handle_send(&text, images, self.task_active, &mut self.ui)
            }
            ClientMessage::PrimaryButton { text, images } => {
                self.cancel_auto_reply();
                self.router.handle_primary(text, images, &mut self.ui)
            }
            ClientMessage::SecondaryButton { text, images } => {
                self.cancel_auto_reply();
                self.router.handle_secondary(text, images, &mut self.ui)
            }
            ClientMessage::Cancel => {
                self.cancel_auto_reply();
                self.router.handle_cancel(&mut self.ui)
            }
            ClientMessage::ConnectToPeers => {
                self.connect_to_peers();
                return;
            }
            ClientMessage::Liveness { kind, from } => {
                if from == self.config.instance_id {
                    return;
                }
                if let Some((kind, from)) = self.liveness.receive(kind, &from) {
                    self.to_panels(ServerMessage::Liveness { kind, from });
                }
                return;
            }
            ClientMessage::Action { action } => {
                self.to_host(WebviewMessage::Action { action });
                return;
            }
        };
        self.apply_route_effects(effects);
    }

    fn apply_route_effects(&mut self, effects: Vec<RouteEffect>) {
        if effects.is_empty() {
            return;
        }
        for effect in effects {
            match effect {
                RouteEffect::Publish(envelope) => self.publish(envelope),
                RouteEffect::Host(message) => self.to_host(message),
                RouteEffect::ClearInput => self.to_panels(ServerMessage::ClearInput),
            }
        }
        self.to_panels(ServerMessage::UiState {
            ui: self.ui.clone(),
        });
    }

    fn connect_to_peers(&mut self) {
        info!(
            component = "coordinator",
            event = "peers.manual_connect",
            broker = self.broker_state.as_str(),
            "Manual peer reconnect"
        );
        let announce = self.bridge.presence_announce();
        self.publish(announce);
        self.broker.reconnect();

        let (kind, from) = self.liveness.ping();
        self.to_panels(ServerMessage::Liveness { kind, from });

        self.notice(NoticeLevel::Info, "Connecting to peers...".to_string());
        self.scheduler
            .schedule(TimerKey::StatusConfirm, self.config.status_confirm_delay);
        self.scheduler
            .schedule(TimerKey::StatusFinal, self.config.status_final_delay);
    }

    // -- Timers ---------------------------------------------------------------

    fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::AutoReply => {
                let Some(reply) = self.auto_reply.take() else {
                    return;
                };
                info!(
                    component = "coordinator",
                    event = "stubborn.sent",
                    attempt = reply.attempt,
                    "Sending confirmation reply"
                );
                let effects =
                    self.router
                        .handle_send(&reply.text, Vec::new(), self.task_active, &mut self.ui);
                self.apply_route_effects(effects);
            }
            TimerKey::StatusConfirm | TimerKey::StatusFinal => {
                let summary = self
                    .bridge
                    .status_summary(self.broker_state, self.liveness.counters());
                self.notice(NoticeLevel::Info, summary);
            }
        }
    }

    // -- Broker ---------------------------------------------------------------

    fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::StateChanged(state) => {
                let previous = std::mem::replace(&mut self.broker_state, state);
                debug!(
                    component = "coordinator",
                    event = "broker.state",
                    from = previous.as_str(),
                    to = state.as_str(),
                    "Broker state changed"
                );
                if state == BrokerState::Connected && previous != BrokerState::Connected {
                    let effects = self.bridge.on_connected();
                    self.apply_bridge_effects(effects);
                } else if previous == BrokerState::Connected && state != BrokerState::Connected {
                    self.bridge.on_disconnected();
                }
                self.push_presence();
            }
            BrokerEvent::Envelope { envelope, .. } => {
                let before = self.bridge.presence(self.broker_state);
                let effects = self.bridge.handle_envelope(&envelope);
                self.apply_bridge_effects(effects);
                if self.bridge.presence(self.broker_state) != before {
                    self.push_presence();
                }
            }
            BrokerEvent::Diagnostic(text) => self.notice(NoticeLevel::Warning, text),
            BrokerEvent::ReconnectExhausted { attempts } => self.notice(
                NoticeLevel::Warning,
                format!(
                    "Peer broker unreachable after {attempts} attempts. Use connect to retry."
                ),
            ),
        }
        self.publish_snapshot();
    }

    fn apply_bridge_effects(&mut self, effects: Vec<BridgeEffect>) {
        for effect in effects {
            match effect {
                BridgeEffect::Publish(envelope) => self.publish(envelope),
                BridgeEffect::Notice { level, text } => self.notice(level, text),
                BridgeEffect::Inject { text } => {
                    self.cancel_auto_reply();
                    let effects = self
                        .router
                        .inject_remote(&text, self.task_active, &mut self.ui);
                    self.apply_route_effects(effects);
                }
            }
        }
    }

    fn publish(&mut self, envelope: PeerEnvelope) {
        let user_visible = envelope.envelope_type == EnvelopeType::User;
        if let Err(e) = self.broker.publish(envelope) {
            warn!(
                component = "coordinator",
                event = "peer.publish_dropped",
                error = %e,
                broker = self.broker_state.as_str(),
                "Envelope dropped"
            );
            if user_visible {
                self.notice(
                    NoticeLevel::Warning,
                    format!("Not connected to peers ({e}), message not sent"),
                );
            }
        }
    }

    // -- Outputs --------------------------------------------------------------

    fn to_host(&self, message: WebviewMessage) {
        if self.host_tx.send(message).is_err() {
            warn!(
                component = "coordinator",
                event = "host.not_connected",
                "No task host connected, message dropped"
            );
        }
    }

    fn to_panels(&self, message: ServerMessage) {
        // No receivers just means no panel is open
        let _ = self.panel_tx.send(message);
    }

    fn notice(&self, level: NoticeLevel, text: String) {
        self.to_panels(ServerMessage::Notice { level, text });
    }

    fn push_presence(&self) {
        self.to_panels(ServerMessage::Presence {
            presence: self.bridge.presence(self.broker_state),
        });
    }

    fn full_snapshot(&self) -> ServerMessage {
        ServerMessage::Snapshot {
            instance_id: self.config.instance_id.clone(),
            ui: self.ui.clone(),
            messages: self.history.messages().to_vec(),
            presence: self.bridge.presence(self.broker_state),
            pending_outgoing: self.router.pending_outgoing().map(str::to_string),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(CoordinatorSnapshot {
            instance_id: self.config.instance_id.clone(),
            ui: self.ui.clone(),
            presence: self.bridge.presence(self.broker_state),
            message_count: self.history.messages().len(),
            task_active: self.task_active,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerCommand;
    use crate::chat_state::CONFIRMATION_PROMPT;
    use convoy_protocol::{AskResponse, AskVariant, BroadcastAction, SayVariant};
    use serde_json::json;
    use tokio::sync::watch;
    use tokio::time::Instant;

    struct Harness {
        handle: CoordinatorHandle,
        task: JoinHandle<()>,
        host_rx: broadcast::Receiver<WebviewMessage>,
        broker_tx: mpsc::Sender<BrokerEvent>,
        broker_commands: mpsc::UnboundedReceiver<BrokerCommand>,
        _broker_state: watch::Sender<BrokerState>,
    }

    fn config(policy: RetryPolicy) -> CoordinatorConfig {
        CoordinatorConfig {
            instance_id: "self-id".into(),
            role: "client".into(),
            mention_marker: "@swarm".into(),
            policy,
            auto_reply_delay: Duration::from_secs(2),
            status_confirm_delay: Duration::from_secs(3),
            status_final_delay: Duration::from_secs(10),
        }
    }

    /// The coordinator starts out seeing a disconnected broker; `broker` is
    /// what publishes are checked against.
    fn harness(policy: RetryPolicy, broker: BrokerState) -> Harness {
        let (connection, broker_commands, broker_state) =
            BrokerConnection::detached(BrokerState::Disconnected);
        let (broker_tx, broker_rx) = mpsc::channel(16);
        let (handle, task) = spawn(config(policy), connection, broker_rx);
        broker_state.send_replace(broker);
        let host_rx = handle.subscribe_host();
        Harness {
            handle,
            task,
            host_rx,
            broker_tx,
            broker_commands,
            _broker_state: broker_state,
        }
    }

    impl Harness {
        async fn host(&self, msg: HostMessage) {
            self.handle.send(CoordinatorCommand::Host(msg)).await;
        }

        async fn panel(&self, msg: ClientMessage) {
            self.handle.send(CoordinatorCommand::Panel(msg)).await;
        }

        async fn broker(&self, event: BrokerEvent) {
            self.broker_tx.send(event).await.expect("coordinator alive");
        }

        /// Round trip through the actor; everything sent before is processed.
        async fn settle(&self) -> PanelSubscription {
            self.handle.subscribe_panel().await.expect("coordinator alive")
        }

        fn published(&mut self) -> Vec<PeerEnvelope> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.broker_commands.try_recv() {
                if let BrokerCommand::Publish(env) = cmd {
                    out.push(env);
                }
            }
            out
        }
    }

    fn ask(ts: u64, ask: AskVariant, text: Option<&str>, partial: bool) -> HostMessage {
        HostMessage::Ask {
            ts,
            ask,
            text: text.map(str::to_string),
            partial,
            images: vec![],
        }
    }

    fn say(ts: u64, say: SayVariant, text: Option<&str>, partial: bool) -> HostMessage {
        HostMessage::Say {
            ts,
            say,
            text: text.map(str::to_string),
            partial,
            images: vec![],
        }
    }

    fn started() -> HostMessage {
        HostMessage::TaskStarted {
            task_id: "task-1".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_mode_sends_confirmation_after_delay() {
        let mut h = harness(
            RetryPolicy {
                stubborn_mode: true,
                max_attempts: 3,
            },
            BrokerState::Disabled,
        );
        h.host(started()).await;
        h.host(ask(1, AskVariant::CompletionResult, Some("done"), false))
            .await;
        h.settle().await;

        let snap = h.handle.snapshot();
        assert_eq!(snap.ui.primary_label.as_deref(), Some("Stubborn 1/3"));
        assert!(h.host_rx.try_recv().is_err());

        let start = Instant::now();
        let reply = h.host_rx.recv().await.expect("confirmation reply");
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(
            reply,
            WebviewMessage::AskResponse {
                ask_response: AskResponse::MessageResponse,
                text: Some(CONFIRMATION_PROMPT.to_string()),
                images: vec![],
            }
        );

        // the same completion message never triggers a second reply
        h.host(ask(1, AskVariant::CompletionResult, Some("done"), false))
            .await;
        h.settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.host_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_message_cancels_pending_confirmation() {
        let mut h = harness(
            RetryPolicy {
                stubborn_mode: true,
                max_attempts: 3,
            },
            BrokerState::Disabled,
        );
        h.host(started()).await;
        h.host(ask(1, AskVariant::CompletionResult, Some("done"), false))
            .await;
        h.host(say(2, SayVariant::Text, Some("one more thing"), false))
            .await;
        h.settle().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.host_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn final_attempt_warns_before_sending() {
        let h = harness(
            RetryPolicy {
                stubborn_mode: true,
                max_attempts: 1,
            },
            BrokerState::Disabled,
        );
        let mut panel = h.settle().await.rx;
        h.host(started()).await;
        h.host(ask(1, AskVariant::CompletionResult, Some("done"), false))
            .await;
        h.settle().await;

        let mut saw_warning = false;
        while let Ok(msg) = panel.try_recv() {
            if let ServerMessage::Notice {
                level: NoticeLevel::Warning,
                text,
            } = msg
            {
                saw_warning |= text.contains("final confirmation attempt (1/1)");
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn peer_addressed_input_is_published_not_answered() {
        let mut h = harness(RetryPolicy::default(), BrokerState::Connected);
        h.broker(BrokerEvent::StateChanged(BrokerState::Connected))
            .await;
        h.host(started()).await;
        h.host(ask(1, AskVariant::Followup, Some("which file?"), false))
            .await;
        h.settle().await;
        let rollcall = h.published();
        assert_eq!(rollcall.len(), 1);
        assert_eq!(rollcall[0].action, Some(BroadcastAction::RollcallRequest));

        h.panel(ClientMessage::Send {
            text: "@swarm hello".into(),
            images: vec![],
        })
        .await;
        h.settle().await;

        let published = h.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].envelope_type, EnvelopeType::User);
        assert_eq!(published[0].payload_text(), Some("@swarm hello"));
        assert!(h.host_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mention_starts_task_and_reply_goes_back() {
        let mut h = harness(RetryPolicy::default(), BrokerState::Connected);
        h.broker(BrokerEvent::Envelope {
            destination: "/topic/messages".into(),
            envelope: PeerEnvelope::user("peer-B", "@swarm do X"),
        })
        .await;
        h.settle().await;

        assert_eq!(
            h.host_rx.try_recv().expect("new task"),
            WebviewMessage::NewTask {
                text: "do X".into(),
                images: vec![],
            }
        );
        assert!(h.host_rx.try_recv().is_err());

        h.host(started()).await;
        h.host(say(1, SayVariant::ApiReqStarted, Some("{}"), false))
            .await;
        h.host(say(2, SayVariant::CompletionResult, Some("X is done"), false))
            .await;
        h.settle().await;

        let published = h.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].envelope_type, EnvelopeType::AgentReply);
        assert_eq!(published[0].payload_text(), Some("@swarm X is done"));
    }

    #[tokio::test]
    async fn own_mentions_are_not_reinjected() {
        let mut h = harness(RetryPolicy::default(), BrokerState::Connected);
        h.broker(BrokerEvent::Envelope {
            destination: "/topic/messages".into(),
            envelope: PeerEnvelope::user("self-id", "@swarm do X"),
        })
        .await;
        h.settle().await;
        assert!(h.host_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rollcall_ack_updates_presence_and_disconnect_resets() {
        let h = harness(RetryPolicy::default(), BrokerState::Connected);
        h.broker(BrokerEvent::StateChanged(BrokerState::Connected))
            .await;
        h.broker(BrokerEvent::Envelope {
            destination: "/topic/status".into(),
            envelope: PeerEnvelope::broadcast(
                "peer-B",
                BroadcastAction::RollcallAck,
                json!({"instanceId": "peer-B", "role": "client"}),
            ),
        })
        .await;
        h.settle().await;

        let presence = h.handle.snapshot().presence;
        assert_eq!(presence.instance_count, 1);
        assert!(presence.roll_call_complete);
        assert_eq!(presence.broker, BrokerState::Connected);

        h.broker(BrokerEvent::StateChanged(BrokerState::Error)).await;
        h.settle().await;
        let presence = h.handle.snapshot().presence;
        assert_eq!(presence.instance_count, 0);
        assert!(!presence.roll_call_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_to_peers_reports_status_twice() {
        let mut h = harness(RetryPolicy::default(), BrokerState::Connected);
        let mut panel = h.settle().await.rx;
        h.panel(ClientMessage::ConnectToPeers).await;
        h.settle().await;

        let commands: Vec<_> = std::iter::from_fn(|| h.broker_commands.try_recv().ok()).collect();
        assert!(matches!(
            &commands[..],
            [BrokerCommand::Publish(env), BrokerCommand::Reconnect]
                if env.action == Some(BroadcastAction::PresenceAnnounce)
        ));

        tokio::time::sleep(Duration::from_secs(11)).await;
        h.settle().await;

        let mut summaries = 0;
        let mut pinged = false;
        while let Ok(msg) = panel.try_recv() {
            match msg {
                ServerMessage::Notice { text, .. } if text.starts_with("Peers:") => summaries += 1,
                ServerMessage::Liveness { kind, .. } => {
                    pinged |= kind == convoy_protocol::LivenessKind::Ping
                }
                _ => {}
            }
        }
        assert_eq!(summaries, 2);
        assert!(pinged);
    }

    #[tokio::test]
    async fn task_cleared_resets_state() {
        let h = harness(RetryPolicy::default(), BrokerState::Disabled);
        h.host(started()).await;
        h.host(ask(1, AskVariant::Tool, Some("{}"), false)).await;
        h.settle().await;
        assert!(h.handle.snapshot().ui.buttons_enabled);

        h.host(HostMessage::TaskCleared).await;
        let sub = h.settle().await;
        let snap = h.handle.snapshot();
        assert!(!snap.task_active);
        assert_eq!(snap.message_count, 0);
        assert_eq!(snap.ui, UiState::default());
        assert!(matches!(
            sub.snapshot,
            ServerMessage::Snapshot { ref messages, .. } if messages.is_empty()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_timers() {
        let mut h = harness(
            RetryPolicy {
                stubborn_mode: true,
                max_attempts: 3,
            },
            BrokerState::Disabled,
        );
        h.host(started()).await;
        h.host(ask(1, AskVariant::CompletionResult, Some("done"), false))
            .await;
        h.settle().await;

        h.handle.shutdown().await;
        (&mut h.task).await.expect("coordinator exits cleanly");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.host_rx.try_recv().is_err());
        assert!(h.handle.subscribe_panel().await.is_none());
    }

    #[tokio::test]
    async fn navigation_actions_bypass_the_router() {
        let mut h = harness(RetryPolicy::default(), BrokerState::Disabled);
        h.host(started()).await;
        h.host(ask(1, AskVariant::Tool, None, false)).await;
        h.host(HostMessage::Action {
            action: "chatButtonClicked".into(),
        })
        .await;
        h.settle().await;
        let snap = h.handle.snapshot();
        assert_eq!(snap.message_count, 1);
        assert_eq!(snap.ui.pending_ask, Some(AskVariant::Tool));

        h.panel(ClientMessage::Action {
            action: "settingsButtonClicked".into(),
        })
        .await;
        h.settle().await;
        assert_eq!(
            h.host_rx.try_recv().expect("action forwarded"),
            WebviewMessage::Action {
                action: "settingsButtonClicked".into()
            }
        );
        assert!(h.host_rx.try_recv().is_err());
        assert_eq!(h.handle.snapshot().ui.pending_ask, Some(AskVariant::Tool));
    }
}
