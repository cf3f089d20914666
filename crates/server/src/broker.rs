//! Peer broker connection
//!
//! One `BrokerConnection` per process. It owns a driver task that dials the
//! broker (STOMP over WebSocket), reports state changes and inbound envelopes
//! on an event channel, and reconnects a bounded number of times before
//! waiting for a manual retry.

use std::time::Duration;

use convoy_protocol::{BrokerState, PeerEnvelope};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::stomp::{Command, Frame, StompError};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long `stop` waits for the driver to send DISCONNECT before aborting it.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker address: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("malformed frame: {0}")]
    Stomp(#[from] StompError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed by broker")]
    Closed,

    #[error("not connected")]
    NotConnected,
}

impl BrokerError {
    /// The broker answered but broke the protocol, as opposed to the
    /// transport failing underneath us.
    fn is_protocol(&self) -> bool {
        matches!(self, BrokerError::Protocol(_) | BrokerError::Stomp(_))
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: Option<String>,
    /// Destinations subscribed on connect
    pub topics: Vec<String>,
    pub publish_destination: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    /// Zero disables outgoing heart-beats
    pub heartbeat: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            topics: vec!["/topic/status".into(), "/topic/messages".into()],
            publish_destination: "/app/publish".into(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    StateChanged(BrokerState),
    Envelope {
        destination: String,
        envelope: PeerEnvelope,
    },
    /// One-off message for the user's output channel
    Diagnostic(String),
    ReconnectExhausted {
        attempts: u32,
    },
}

#[derive(Debug)]
pub enum BrokerCommand {
    Publish(PeerEnvelope),
    Reconnect,
    Stop,
}

/// Accept only `ws://` and `wss://` addresses with a host.
pub fn validate_broker_url(raw: Option<&str>) -> Result<Url, BrokerError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BrokerError::InvalidUrl("no broker address configured".into()))?;

    let url = Url::parse(raw).map_err(|e| BrokerError::InvalidUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(BrokerError::InvalidUrl(format!(
            "must use ws:// or wss://, got {}://",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(BrokerError::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

pub struct BrokerConnection {
    command_tx: mpsc::UnboundedSender<BrokerCommand>,
    state_rx: watch::Receiver<BrokerState>,
    task: Option<JoinHandle<()>>,
}

impl BrokerConnection {
    /// Validate the address and spawn the driver. An unusable address leaves
    /// the connection permanently `Disabled` and queues one diagnostic.
    pub fn start(config: BrokerConfig, events: mpsc::Sender<BrokerEvent>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let url = match validate_broker_url(config.url.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    component = "broker",
                    event = "broker.disabled",
                    error = %e,
                    "Peer broker disabled"
                );
                let (_state_tx, state_rx) = watch::channel(BrokerState::Disabled);
                let _ = events.try_send(BrokerEvent::Diagnostic(format!(
                    "Peer network disabled: {e}"
                )));
                return Self {
                    command_tx,
                    state_rx,
                    task: None,
                };
            }
        };

        let (state_tx, state_rx) = watch::channel(BrokerState::Disconnected);
        let driver = Driver {
            url,
            config,
            events,
            commands: command_rx,
            state: state_tx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            command_tx,
            state_rx,
            task: Some(task),
        }
    }

    pub fn state(&self) -> BrokerState {
        *self.state_rx.borrow()
    }

    /// At-most-once: dropped unless currently connected.
    pub fn publish(&self, envelope: PeerEnvelope) -> Result<(), BrokerError> {
        if self.state() != BrokerState::Connected {
            return Err(BrokerError::NotConnected);
        }
        self.command_tx
            .send(BrokerCommand::Publish(envelope))
            .map_err(|_| BrokerError::NotConnected)
    }

    /// Manual retry. No-op while connected or disabled.
    pub fn reconnect(&self) {
        if self.state() == BrokerState::Disabled {
            debug!(
                component = "broker",
                event = "broker.reconnect_disabled",
                "Reconnect requested but broker is disabled"
            );
            return;
        }
        let _ = self.command_tx.send(BrokerCommand::Reconnect);
    }

    pub async fn stop(&mut self) {
        let _ = self.command_tx.send(BrokerCommand::Stop);
        let Some(mut task) = self.task.take() else {
            return;
        };
        if timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!(
                component = "broker",
                event = "broker.stop_forced",
                "Driver did not stop in time, aborting"
            );
            task.abort();
        }
    }

    /// A connection with no driver; the returned receiver sees every
    /// command and the sender drives the reported state.
    #[cfg(test)]
    pub fn detached(
        state: BrokerState,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<BrokerCommand>,
        watch::Sender<BrokerState>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state);
        (
            Self {
                command_tx,
                state_rx,
                task: None,
            },
            command_rx,
            state_tx,
        )
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// -- Driver -------------------------------------------------------------------

enum SessionEnd {
    Stopped,
    Closed,
}

enum Wait {
    Retry,
    Stop,
}

struct Driver {
    url: Url,
    config: BrokerConfig,
    events: mpsc::Sender<BrokerEvent>,
    commands: mpsc::UnboundedReceiver<BrokerCommand>,
    state: watch::Sender<BrokerState>,
}

impl Driver {
    async fn run(mut self) {
        let max_attempts = self.config.max_reconnect_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.set_state(BrokerState::Connecting).await;
            info!(
                component = "broker",
                event = "broker.connecting",
                url = %self.url,
                attempt = attempts,
                max_attempts,
                "Connecting to peer broker"
            );

            let mut established = false;
            match self.session(&mut established).await {
                Ok(SessionEnd::Stopped) => {
                    self.set_state(BrokerState::Disconnected).await;
                    return;
                }
                Ok(SessionEnd::Closed) => {
                    info!(
                        component = "broker",
                        event = "broker.closed",
                        "Peer broker closed the connection"
                    );
                    self.set_state(BrokerState::Disconnected).await;
                }
                Err(e) => {
                    warn!(
                        component = "broker",
                        event = "broker.session_failed",
                        error = %e,
                        attempt = attempts,
                        "Peer broker connection failed"
                    );
                    let next = if e.is_protocol() {
                        BrokerState::Disconnected
                    } else {
                        BrokerState::Error
                    };
                    self.set_state(next).await;
                }
            }
            if self.events.is_closed() {
                return;
            }

            if established {
                attempts = 0;
            }

            if attempts >= max_attempts {
                warn!(
                    component = "broker",
                    event = "broker.reconnect_exhausted",
                    attempts,
                    "Giving up on peer broker until a manual reconnect"
                );
                self.set_state(BrokerState::Disconnected).await;
                self.emit(BrokerEvent::ReconnectExhausted { attempts }).await;
                match self.wait(None).await {
                    Wait::Retry => attempts = 0,
                    Wait::Stop => return,
                }
            } else {
                match self.wait(Some(self.config.reconnect_delay)).await {
                    Wait::Retry => {}
                    Wait::Stop => return,
                }
            }
        }
    }

    /// Sit out a delay (or forever) while offline, still serving commands.
    async fn wait(&mut self, delay: Option<Duration>) -> Wait {
        let delay_fut = async {
            match delay {
                Some(d) => sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(delay_fut);

        loop {
            tokio::select! {
                _ = &mut delay_fut => return Wait::Retry,
                cmd = self.commands.recv() => match cmd {
                    Some(BrokerCommand::Reconnect) => return Wait::Retry,
                    Some(BrokerCommand::Publish(_)) => warn!(
                        component = "broker",
                        event = "broker.publish_dropped",
                        "Not connected, envelope dropped"
                    ),
                    Some(BrokerCommand::Stop) | None => return Wait::Stop,
                },
            }
        }
    }

    async fn session(&mut self, established: &mut bool) -> Result<SessionEnd, BrokerError> {
        let connect_timeout = self.config.connect_timeout;
        let (stream, _response) = timeout(connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| BrokerError::Timeout(connect_timeout))??;
        let (mut writer, mut reader) = stream.split();

        let host = self.url.host_str().unwrap_or("localhost");
        let heartbeat_ms = u64::try_from(self.config.heartbeat.as_millis()).unwrap_or(u64::MAX);
        writer
            .send(Message::Text(Frame::connect(host, heartbeat_ms).encode().into()))
            .await?;

        let connected = timeout(connect_timeout, await_connected(&mut reader))
            .await
            .map_err(|_| BrokerError::Timeout(connect_timeout))??;
        debug!(
            component = "broker",
            event = "broker.stomp_connected",
            version = connected.get("version").unwrap_or("?"),
            "STOMP session established"
        );

        for (idx, topic) in self.config.topics.iter().enumerate() {
            let frame = Frame::subscribe(&format!("sub-{idx}"), topic);
            writer.send(Message::Text(frame.encode().into())).await?;
        }

        *established = true;
        self.set_state(BrokerState::Connected).await;

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat.max(Duration::from_millis(100)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let send_heartbeats = !self.config.heartbeat.is_zero();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(BrokerCommand::Publish(envelope)) => {
                        let body = serde_json::to_string(&envelope)?;
                        let frame = Frame::send(&self.config.publish_destination, body);
                        writer.send(Message::Text(frame.encode().into())).await?;
                    }
                    Some(BrokerCommand::Reconnect) => {
                        debug!(
                            component = "broker",
                            event = "broker.reconnect_noop",
                            "Already connected"
                        );
                    }
                    Some(BrokerCommand::Stop) | None => {
                        let _ = writer
                            .send(Message::Text(Frame::disconnect().encode().into()))
                            .await;
                        let _ = writer.close().await;
                        return Ok(SessionEnd::Stopped);
                    }
                },

                _ = heartbeat.tick(), if send_heartbeats => {
                    writer.send(Message::Text("\n".to_string().into())).await?;
                }

                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Some(frame) = Frame::decode(text.as_str())? else {
                            continue;
                        };
                        match frame.command {
                            Command::Message => self.deliver(frame).await,
                            Command::Error => {
                                return Err(BrokerError::Protocol(error_text(&frame)));
                            }
                            other => debug!(
                                component = "broker",
                                event = "broker.frame_ignored",
                                command = %other,
                                "Ignoring frame"
                            ),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    async fn deliver(&self, frame: Frame) {
        let destination = frame.get("destination").unwrap_or_default().to_string();
        match serde_json::from_str::<PeerEnvelope>(&frame.body) {
            Ok(envelope) => {
                self.emit(BrokerEvent::Envelope {
                    destination,
                    envelope,
                })
                .await
            }
            Err(e) => debug!(
                component = "broker",
                event = "broker.envelope_malformed",
                destination = %destination,
                error = %e,
                "Ignoring undecodable envelope"
            ),
        }
    }

    async fn set_state(&self, next: BrokerState) {
        if *self.state.borrow() == next {
            return;
        }
        self.state.send_replace(next);
        self.emit(BrokerEvent::StateChanged(next)).await;
    }

    async fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).await.is_err() {
            debug!(
                component = "broker",
                event = "broker.events_closed",
                "Event receiver gone"
            );
        }
    }
}

async fn await_connected(reader: &mut WsReader) -> Result<Frame, BrokerError> {
    while let Some(incoming) = reader.next().await {
        match incoming? {
            Message::Text(text) => match Frame::decode(text.as_str())? {
                Some(frame) if frame.command == Command::Connected => return Ok(frame),
                Some(frame) if frame.command == Command::Error => {
                    return Err(BrokerError::Protocol(error_text(&frame)));
                }
                _ => {}
            },
            Message::Close(_) => return Err(BrokerError::Closed),
            _ => {}
        }
    }
    Err(BrokerError::Closed)
}

fn error_text(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) if frame.body.is_empty() => message.to_string(),
        Some(message) => format!("{message}: {}", frame.body),
        None => frame.body.clone(),
    }
}
