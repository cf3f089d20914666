//! File logging for the `convoy` process.
//!
//! Everything goes to `<data_dir>/logs/convoy.log`. Stdout stays free for the
//! CLI's own output.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn,tungstenite=warn";
const LOG_FILE: &str = "convoy.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

/// Logging knobs read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogSettings {
    filter: String,
    format: LogFormat,
    truncate: bool,
}

impl LogSettings {
    /// `CONVOY_LOG_FILTER` wins over `RUST_LOG`; an unparsable filter falls
    /// back to the default rather than failing startup.
    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = ["CONVOY_LOG_FILTER", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .find(|value| EnvFilter::try_new(value).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let format = match lookup("CONVOY_LOG_FORMAT") {
            Some(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        Self {
            filter,
            format,
            truncate: lookup("CONVOY_TRUNCATE_LOG_ON_START").as_deref() == Some("1"),
        }
    }
}

/// Keeps the non-blocking writer flushing; drop it and buffered lines are lost.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

pub fn init_logging(log_dir: &Path, instance_id: &str) -> anyhow::Result<LoggingGuard> {
    let settings = LogSettings::resolve(|key| std::env::var(key).ok());

    std::fs::create_dir_all(log_dir)?;
    let log_path: PathBuf = log_dir.join(LOG_FILE);
    if settings.truncate {
        std::fs::File::create(&log_path)?;
    }

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));
    let registry = tracing_subscriber::registry().with(EnvFilter::try_new(&settings.filter)?);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);
    match settings.format {
        LogFormat::Pretty => registry.with(layer.with_ansi(false).pretty()).try_init()?,
        LogFormat::Json => registry
            .with(layer.json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        instance_id = %instance_id,
        log_path = %log_path.display(),
        format = ?settings.format,
        filter = %settings.filter,
    );

    Ok(LoggingGuard { _writer: guard })
}
