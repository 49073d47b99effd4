use anyhow::{Context, Result, bail};
use natschat_mesh::broker::MemoryHub;
use natschat_mesh::identity::Identity;
use natschat_node::config::{DaemonConfig, FileConfig};
use natschat_node::daemon::Daemon;
use natschat_node::handler::DaemonState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// A daemon with a fresh profile, running in-process on a [`MemoryHub`].
pub struct TestDaemon {
    pub address: String,
    pub profile: PathBuf,
    pub socket_path: PathBuf,
    hub: MemoryHub,
    state: Option<Arc<DaemonState>>,
    task: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl TestDaemon {
    /// Generate an identity and bring a daemon online for it.
    pub async fn spawn(hub: &MemoryHub) -> Result<Self> {
        super::init_tracing();
        let dir = TempDir::new()?;
        let profile = dir.path().join("profile");
        let identity = Identity::generate(&profile).context("failed to generate identity")?;

        let mut daemon = Self {
            address: identity.address,
            socket_path: dir.path().join("natschat.sock"),
            profile,
            hub: hub.clone(),
            state: None,
            task: None,
            _dir: dir,
        };
        daemon.online().await?;
        Ok(daemon)
    }

    pub fn config(&self) -> DaemonConfig {
        DaemonConfig::new(
            self.profile.clone(),
            self.socket_path.clone(),
            "memory://".to_string(),
            FileConfig::default(),
        )
    }

    /// Start (or restart) the daemon for this profile.
    pub async fn online(&mut self) -> Result<()> {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            bail!("daemon for {} is still running", self.address);
        }
        let identity = Identity::load(&self.profile)?;
        let daemon = Daemon::start(&self.config(), identity, Arc::new(self.hub.connect())).await?;
        self.state = Some(daemon.state().clone());
        self.task = Some(tokio::spawn(daemon.run()));
        Ok(())
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        self.state.as_ref().expect("daemon was started")
    }

    /// Wait for the daemon task to finish after going offline.
    pub async fn wait_stopped(&mut self, timeout: Duration) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        tokio::time::timeout(timeout, task)
            .await
            .context("daemon did not stop in time")?
            .context("daemon task panicked")?;
        Ok(())
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            state.shutdown.cancel();
        }
    }
}
