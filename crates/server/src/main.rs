//! Convoy
//!
//! Sits between an agentic task engine and its UI panels: derives what the
//! panel may do from the conversation, routes replies to the local task or to
//! peer instances, and keeps a presence view of those peers over a broker.

mod broker;
mod chat_state;
mod cmd_init;
mod cmd_status;
mod command;
mod config;
mod coordinator;
mod history;
mod liveness;
mod logging;
mod paths;
mod peer_bridge;
mod router;
mod scheduler;
mod state;
mod stomp;
mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{routing::get, Router};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::BrokerConnection;
use crate::config::{Config, Overrides};
use crate::state::AppState;
use crate::websocket::{health_handler, host_ws_handler, ui_ws_handler};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const BROKER_EVENT_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "convoy", version, about = "Task panel coordinator with peer routing")]
struct Cli {
    /// Data directory (default: ~/.convoy)
    #[arg(long, global = true, env = "CONVOY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run Convoy (default)
    Start(StartArgs),
    /// Create the data dir and a default config
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved config and probe a running instance
    Status,
}

#[derive(Args, Default)]
struct StartArgs {
    /// Address to serve /host, /ui and /health on
    #[arg(long, env = "CONVOY_LISTEN")]
    listen: Option<String>,

    /// Peer broker address (ws:// or wss://)
    #[arg(long, env = "CONVOY_BROKER_URL")]
    broker_url: Option<String>,

    /// Keep asking the task to double-check before it may finish
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    stubborn: Option<bool>,

    /// Confirmation rounds in stubborn mode
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Prefix that addresses a message to the peer network
    #[arg(long)]
    mention_marker: Option<String>,
}

impl From<StartArgs> for Overrides {
    fn from(args: StartArgs) -> Self {
        Overrides {
            listen: args.listen,
            broker_url: args.broker_url,
            stubborn: args.stubborn,
            max_attempts: args.max_attempts,
            mention_marker: args.mention_marker,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref())?;

    match cli.command.unwrap_or(Command::Start(StartArgs::default())) {
        Command::Start(args) => start(args).await,
        Command::Init { force } => cmd_init::run(&data_dir, force),
        Command::Status => {
            let config = Config::load(&paths::config_path())?;
            cmd_status::run(&data_dir, &config).await
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let mut config = Config::load(&paths::config_path())?;
    config.apply(args.into());
    config.validate()?;
    let addr = config.listen_addr()?;

    let instance_id = convoy_protocol::new_id();
    let _logging = logging::init_logging(&paths::log_dir(), &instance_id)?;
    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        instance_id = %instance_id,
        listen = %addr,
        "Starting Convoy"
    );

    let (events_tx, events_rx) = mpsc::channel(BROKER_EVENT_CAPACITY);
    let broker = BrokerConnection::start(config.broker_config(), events_tx);
    let (coordinator, coordinator_task) =
        coordinator::spawn(config.coordinator_config(&instance_id), broker, events_rx);

    let state = Arc::new(AppState::new(coordinator.clone()));
    let app = Router::new()
        .route("/host", get(host_ws_handler))
        .route("/ui", get(ui_ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Convoy {VERSION} listening on {addr} (instance {instance_id})");
    info!(
        component = "server",
        event = "server.listening",
        listen = %addr,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    let _ = coordinator_task.await;
    info!(
        component = "server",
        event = "server.stopped",
        "Convoy stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
