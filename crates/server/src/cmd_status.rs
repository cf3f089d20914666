//! `convoy status` — show the resolved config and check if Convoy is running.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::broker::validate_broker_url;
use crate::config::Config;
use crate::paths;
use crate::VERSION;

pub async fn run(data_dir: &Path, config: &Config) -> anyhow::Result<()> {
    println!();
    println!("  Convoy v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let config_path = paths::config_path_in(data_dir);
    if config_path.exists() {
        println!("  Config: {}", config_path.display());
    } else {
        println!("  Config: defaults (no {})", config_path.display());
    }

    println!("  Listen: {}", config.server.listen);
    match validate_broker_url(config.broker.url.as_deref()) {
        Ok(url) => println!("  Broker: {url}"),
        Err(e) => println!("  Broker: disabled ({e})"),
    }
    println!(
        "  Stubborn mode: {} (max {} attempts)",
        if config.chat.stubborn_mode { "on" } else { "off" },
        config.chat.max_attempts
    );
    println!("  Mention marker: {}", config.peers.mention_marker);

    let url = health_url(config.listen_addr()?);
    match check_health(&url).await {
        Ok(body) => {
            println!("  Health: OK ({url})");
            if let Some(broker) = body.get("broker").and_then(Value::as_str) {
                let peers = body.get("instanceCount").and_then(Value::as_u64).unwrap_or(0);
                println!("  Peers: {peers} (broker {broker})");
            }
        }
        Err(e) => {
            println!("  Health: unreachable ({e})");
            println!();
            println!("  Convoy is not running.");
            println!("  Start with: convoy start");
        }
    }

    println!();
    Ok(())
}

/// Wildcard binds are probed on loopback.
fn health_url(listen: SocketAddr) -> String {
    let host = match listen {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => "127.0.0.1".to_string(),
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => "[::1]".to_string(),
        SocketAddr::V4(v4) => v4.ip().to_string(),
        SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
    };
    format!("http://{}:{}/health", host, listen.port())
}

async fn check_health(url: &str) -> anyhow::Result<Value> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .build()?;
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    Ok(body)
}
