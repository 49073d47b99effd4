use anyhow::{Context, Result};
use clap::Parser;
use natschat::client::default_socket_path;
use natschat::protocol::{CloseReason, ErrorCode};
use natschat_mesh::broker::NatsBroker;
use natschat_mesh::identity::{Identity, IdentityError};
use natschat_mesh::profile_dir::{config_path, default_profile_dir};
use natschat_node::config::{DaemonConfig, FileConfig};
use natschat_node::daemon::{self, Daemon, OnlineError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "nats-chat daemon")]
struct Args {
    /// Profile directory holding the key pair (default: $NATSCHAT_HOME or ~/.natschat).
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Path to the Unix socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// NATS server URL, e.g. nats://127.0.0.1:4222.
    #[arg(long)]
    nats_url: String,

    /// Seconds to wait for the initial NATS connection.
    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Reconnect attempts after the NATS connection drops.
    #[arg(long)]
    max_reconnects: Option<usize>,

    /// Messages kept per chat while no client has it open.
    #[arg(long)]
    backlog_limit: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "natschat_node=info,natschat_mesh=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(error_code(&e).exit_code())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let profile_dir = match args.profile {
        Some(p) => p,
        None => default_profile_dir()?,
    };
    let socket_path = args
        .socket
        .unwrap_or_else(|| default_socket_path(&profile_dir));

    let mut file = FileConfig::load(&config_path(&profile_dir))?;
    if let Some(secs) = args.connect_timeout_secs {
        file.connect_timeout_secs = secs;
    }
    if let Some(n) = args.max_reconnects {
        file.max_reconnects = n;
    }
    if let Some(n) = args.backlog_limit {
        file.backlog_limit = n;
    }
    let config = DaemonConfig::new(profile_dir, socket_path, args.nats_url, file);

    let identity = Identity::load(&config.profile_dir).context("failed to load identity")?;
    tracing::info!(address = %identity.address, "identity loaded");

    // fail fast before dialing the broker
    daemon::ensure_offline(&config.socket_path).await?;

    let broker = NatsBroker::connect(&config.nats_url, &config.nats_options())
        .await
        .map_err(OnlineError::from)?;
    let daemon = Daemon::start(&config, identity, Arc::new(broker)).await?;

    let state = daemon.state().clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("received shutdown signal");
        state.go_offline(CloseReason::Offline).await;
    });

    daemon.run().await;
    tracing::info!("natschat-node shut down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(err = %e, "SIGTERM handler unavailable");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

/// Map a startup failure to the code the CLI reports.
fn error_code(err: &anyhow::Error) -> ErrorCode {
    if let Some(e) = err.downcast_ref::<OnlineError>() {
        return e.to_error_code();
    }
    match err.downcast_ref::<IdentityError>() {
        Some(IdentityError::NotFound { .. }) => ErrorCode::NotFound,
        Some(IdentityError::Io { .. }) => ErrorCode::IoFailure,
        Some(_) => ErrorCode::InvalidRequest,
        None => ErrorCode::Internal,
    }
}
