//! Central path resolution for Convoy data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CONVOY_DATA_DIR` env > `~/.convoy`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => match std::env::var_os("CONVOY_DATA_DIR") {
            Some(env_val) if !env_val.is_empty() => PathBuf::from(env_val),
            _ => dirs::home_dir()
                .context("HOME directory not found; pass --data-dir")?
                .join(".convoy"),
        },
    };

    let mut guard = DATA_DIR
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Current data directory; `~/.convoy` if `init_data_dir` was never called.
pub fn data_dir() -> PathBuf {
    let guard = DATA_DIR
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".convoy")
    })
}

pub fn config_path() -> PathBuf {
    config_path_in(&data_dir())
}

pub fn log_dir() -> PathBuf {
    log_dir_in(&data_dir())
}

pub fn config_path_in(dir: &Path) -> PathBuf {
    dir.join("config.toml")
}

pub fn log_dir_in(dir: &Path) -> PathBuf {
    dir.join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    ensure_dirs_in(&data_dir())
}

pub fn ensure_dirs_in(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(log_dir_in(dir))
}
