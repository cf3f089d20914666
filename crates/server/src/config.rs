//! Configuration
//!
//! Layered: built-in defaults, then `<data_dir>/config.toml`, then CLI flags
//! (which also pick up `CONVOY_*` environment variables through clap).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerConfig;
use crate::chat_state::RetryPolicy;
use crate::coordinator::CoordinatorConfig;
use crate::peer_bridge::ROLE_CLIENT;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:4710";
pub const DEFAULT_MENTION_MARKER: &str = "@swarm";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub broker: BrokerSection,
    pub chat: ChatSection,
    pub peers: PeersSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// `ws://` or `wss://` address; unset disables the peer network
    pub url: Option<String>,
    pub status_topic: String,
    pub messages_topic: String,
    pub publish_destination: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub heartbeat_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let defaults = BrokerConfig::default();
        let mut topics = defaults.topics.into_iter();
        Self {
            url: None,
            status_topic: topics.next().unwrap_or_default(),
            messages_topic: topics.next().unwrap_or_default(),
            publish_destination: defaults.publish_destination,
            reconnect_delay_ms: millis(defaults.reconnect_delay),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            connect_timeout_ms: millis(defaults.connect_timeout),
            heartbeat_ms: millis(defaults.heartbeat),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub stubborn_mode: bool,
    pub max_attempts: u32,
    pub auto_reply_delay_ms: u64,
}

impl Default for ChatSection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            stubborn_mode: policy.stubborn_mode,
            max_attempts: policy.max_attempts,
            auto_reply_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersSection {
    pub mention_marker: String,
    pub role: String,
    pub status_confirm_delay_ms: u64,
    pub status_final_delay_ms: u64,
}

impl Default for PeersSection {
    fn default() -> Self {
        Self {
            mention_marker: DEFAULT_MENTION_MARKER.to_string(),
            role: ROLE_CLIENT.to_string(),
            status_confirm_delay_ms: 500,
            status_final_delay_ms: 10_000,
        }
    }
}

/// Values given on the command line; `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub broker_url: Option<String>,
    pub stubborn: Option<bool>,
    pub max_attempts: Option<u32>,
    pub mention_marker: Option<String>,
}

impl Config {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(listen) = overrides.listen {
            self.server.listen = listen;
        }
        if let Some(url) = overrides.broker_url {
            self.broker.url = Some(url);
        }
        if let Some(stubborn) = overrides.stubborn {
            self.chat.stubborn_mode = stubborn;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.chat.max_attempts = max_attempts;
        }
        if let Some(marker) = overrides.mention_marker {
            self.peers.mention_marker = marker;
        }
    }

    /// The broker address is deliberately not checked here: a bad one
    /// disables the peer network instead of refusing to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.chat.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "chat.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.peers.mention_marker.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "peers.mention_marker",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "server.listen",
                reason: e.to_string(),
            })
    }

    pub fn render(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            url: self.broker.url.clone(),
            topics: vec![
                self.broker.status_topic.clone(),
                self.broker.messages_topic.clone(),
            ],
            publish_destination: self.broker.publish_destination.clone(),
            reconnect_delay: Duration::from_millis(self.broker.reconnect_delay_ms),
            max_reconnect_attempts: self.broker.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            heartbeat: Duration::from_millis(self.broker.heartbeat_ms),
        }
    }

    pub fn coordinator_config(&self, instance_id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            instance_id: instance_id.to_string(),
            role: self.peers.role.clone(),
            mention_marker: self.peers.mention_marker.trim().to_string(),
            policy: RetryPolicy {
                stubborn_mode: self.chat.stubborn_mode,
                max_attempts: self.chat.max_attempts,
            },
            auto_reply_delay: Duration::from_millis(self.chat.auto_reply_delay_ms),
            status_confirm_delay: Duration::from_millis(self.peers.status_confirm_delay_ms),
            status_final_delay: Duration::from_millis(self.peers.status_final_delay_ms),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
