//! Configuration and usage-snapshot files.
//!
//! Configuration is one pretty-printed JSON document; a `.bak` sibling of
//! the previous contents is written before every overwrite. The usage
//! snapshot is rewritten on a 5-minute cadence via write-temp-then-rename so
//! a crash never leaves a torn file, and a corrupt or missing snapshot loads
//! as an empty store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigFile;
use crate::counters::{CounterStore, UsageSnapshot};
use crate::error::{Result, SwitchboardError};

pub const USAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub fn load_config(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw = fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&raw)?)
}

/// Persists the configuration document, preserving the previous contents as
/// a `.bak` sibling first.
pub fn save_config(path: impl AsRef<Path>, config: &ConfigFile) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|err| {
            SwitchboardError::Config(format!("backup {}: {err}", backup.display()))
        })?;
    }
    let payload = serde_json::to_vec_pretty(config)?;
    write_atomic(path, &payload)
}

/// Loads the usage snapshot, tolerating absence and corruption: both start
/// the store empty.
pub fn load_usage_snapshot(path: impl AsRef<Path>) -> UsageSnapshot {
    let path = path.as_ref();
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return UsageSnapshot::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "usage snapshot unreadable; starting empty");
            return UsageSnapshot::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "usage snapshot corrupt; starting empty");
            UsageSnapshot::default()
        }
    }
}

pub fn save_usage_snapshot(path: impl AsRef<Path>, snapshot: &UsageSnapshot) -> Result<()> {
    let payload = serde_json::to_vec(snapshot)?;
    write_atomic(path.as_ref(), &payload)
}

/// Periodic usage flush. Runs until the process exits; one failed write is
/// logged and retried at the next tick.
pub async fn run_usage_flush(counters: Arc<CounterStore>, path: PathBuf) {
    let mut ticker = tokio::time::interval(USAGE_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup import is not
    // instantly overwritten by an empty store racing the config build.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = counters.export();
        if let Err(err) = save_usage_snapshot(&path, &snapshot) {
            tracing::warn!(path = %path.display(), error = %err, "usage snapshot write failed");
        } else {
            tracing::debug!(
                path = %path.display(),
                scopes = snapshot.scopes.len(),
                "usage snapshot written"
            );
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)?;
    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(err.into())
        }
    }
}
