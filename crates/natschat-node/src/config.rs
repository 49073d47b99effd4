use anyhow::{Context, Result};
use natschat_mesh::broker::NatsOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Optional `<profile>/config.toml`. Command-line flags take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub connect_timeout_secs: u64,
    pub max_reconnects: usize,
    /// Messages kept per session while no client is attached.
    pub backlog_limit: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            max_reconnects: 10,
            backlog_limit: 1024,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Everything a daemon instance needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub profile_dir: PathBuf,
    pub socket_path: PathBuf,
    pub nats_url: String,
    pub connect_timeout: Duration,
    pub max_reconnects: usize,
    pub backlog_limit: usize,
}

impl DaemonConfig {
    pub fn new(profile_dir: PathBuf, socket_path: PathBuf, nats_url: String, file: FileConfig) -> Self {
        Self {
            profile_dir,
            socket_path,
            nats_url,
            connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            max_reconnects: file.max_reconnects,
            backlog_limit: file.backlog_limit.max(1),
        }
    }

    pub fn nats_options(&self) -> NatsOptions {
        NatsOptions {
            connect_timeout: self.connect_timeout,
            max_reconnects: self.max_reconnects,
        }
    }
}
