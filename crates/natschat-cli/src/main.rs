mod chat;
mod run;
mod term;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use natschat::client::{DaemonClient, DaemonError, default_socket_path};
use natschat::protocol::{ErrorCode, Request, StatusInfo};
use natschat_mesh::broker::BrokerError;
use natschat_mesh::identity::{Identity, IdentityError};
use natschat_mesh::profile_dir::{daemon_log_path, default_profile_dir, ensure_profile_dir};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// How long `online` waits for a spawned daemon to answer.
const ONLINE_TIMEOUT: Duration = Duration::from_secs(30);
const ONLINE_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "nats-chat", version, about = "Encrypted peer-to-peer chat over NATS")]
struct Cli {
    /// Profile directory (default: $NATSCHAT_HOME or ~/.natschat).
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    /// Path to the daemon's Unix socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new key pair.
    Generate {
        /// Directory to write the keys to (default: the profile directory).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print this profile's address.
    Address,
    /// Start the daemon.
    Online {
        /// NATS server URL, e.g. nats://127.0.0.1:4222.
        #[arg(long)]
        nats_url: String,
        /// Run in the foreground (default: background).
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon.
    Offline,
    /// Show the daemon's broker connection and chats.
    Status,
    /// Start a chat with a peer.
    Createchat {
        /// The peer's address.
        #[arg(long)]
        recepient: String,
    },
    /// Remove a chat, closing it wherever it is open.
    Rmchat {
        /// The peer's address.
        #[arg(long)]
        recepient: String,
    },
    /// Chat interactively: stdin lines are sent, messages are printed.
    Openchat {
        /// The peer's address. May be omitted when only one chat exists.
        #[arg(long)]
        recepient: Option<String>,
    },
    /// Relay one conversation directly over NATS, without a daemon.
    Run {
        /// The peer's public.pem.
        #[arg(long)]
        recepient_key: PathBuf,
        /// NATS server URL.
        #[arg(long)]
        nats_url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let profile = match cli.profile {
        Some(p) => p,
        None => default_profile_dir()?,
    };
    let socket_path = cli
        .socket
        .unwrap_or_else(|| default_socket_path(&profile));

    match cli.command {
        Command::Generate { out } => {
            let dir = out.unwrap_or_else(|| profile.clone());
            let identity = Identity::generate(&dir)?;
            println!("{}", identity.address);
            Ok(())
        }
        Command::Address => {
            let identity = Identity::load(&profile)?;
            println!("{}", identity.address);
            Ok(())
        }
        Command::Online {
            nats_url,
            foreground,
        } => cmd_online(&profile, &socket_path, &nats_url, foreground).await,
        Command::Offline => {
            let mut client = DaemonClient::connect(&socket_path).await?;
            client.request(Request::Offline).await?;
            println!("Daemon offline.");
            Ok(())
        }
        Command::Status => {
            let mut client = DaemonClient::connect(&socket_path).await?;
            let data = client
                .request(Request::Status)
                .await?
                .ok_or_else(|| anyhow!("daemon returned no status"))?;
            print_status(&serde_json::from_value(data)?);
            Ok(())
        }
        Command::Createchat { recepient } => {
            let mut client = DaemonClient::connect(&socket_path).await?;
            client
                .request(Request::CreateChat {
                    recepient: recepient.clone(),
                })
                .await?;
            println!("Chat with {recepient} created.");
            Ok(())
        }
        Command::Rmchat { recepient } => {
            let mut client = DaemonClient::connect(&socket_path).await?;
            client
                .request(Request::RemoveChat {
                    recepient: recepient.clone(),
                })
                .await?;
            println!("Chat with {recepient} removed.");
            Ok(())
        }
        Command::Openchat { recepient } => chat::open_chat(&socket_path, recepient).await,
        Command::Run {
            recepient_key,
            nats_url,
        } => run::run(&profile, &recepient_key, &nats_url).await,
    }
}

async fn cmd_online(
    profile: &Path,
    socket_path: &Path,
    nats_url: &str,
    foreground: bool,
) -> Result<()> {
    if DaemonClient::connect(socket_path).await.is_ok() {
        return Err(DaemonError {
            code: ErrorCode::AlreadyOnline,
            message: format!("a daemon is already online at {}", socket_path.display()),
        }
        .into());
    }

    let node_bin = find_node_binary();
    let mut cmd = std::process::Command::new(&node_bin);
    cmd.arg("--profile")
        .arg(profile)
        .arg("--socket")
        .arg(socket_path)
        .arg("--nats-url")
        .arg(nats_url);

    if foreground {
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {}", node_bin.display()))?;
        return exit_status_result(status);
    }

    ensure_profile_dir(profile)
        .with_context(|| format!("failed to create {}", profile.display()))?;
    let log_path = daemon_log_path(profile);
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(log);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // keep terminal signals aimed at the CLI away from the daemon
        cmd.process_group(0);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", node_bin.display()))?;

    let deadline = tokio::time::Instant::now() + ONLINE_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait()? {
            exit_status_result(status)
                .with_context(|| format!("daemon exited, see {}", log_path.display()))?;
            bail!("daemon exited before coming online, see {}", log_path.display());
        }
        if let Ok(client) = DaemonClient::connect(socket_path).await {
            println!("Online as {} (pid {}).", client.address(), child.id());
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "daemon did not come online within {}s, see {}",
                ONLINE_TIMEOUT.as_secs(),
                log_path.display()
            );
        }
        tokio::time::sleep(ONLINE_POLL).await;
    }
}

/// Turn the daemon's exit status back into the error it reported.
fn exit_status_result(status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    match status.code().and_then(ErrorCode::from_exit_code) {
        Some(code) => Err(DaemonError {
            code,
            message: format!("daemon failed to start ({code})"),
        }
        .into()),
        None => bail!("daemon exited with {status}"),
    }
}

fn find_node_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let candidate = dir.join("natschat-node");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("natschat-node")
}

fn print_status(status: &StatusInfo) {
    let link = if status.connected {
        "connected"
    } else {
        "disconnected"
    };
    println!("address: {}", status.address);
    println!("nats:    {} ({link})", status.nats_url);
    println!("chats:   {}", status.sessions.len());
    for s in &status.sessions {
        let peer_state = match s.peer_online {
            Some(true) => "online",
            Some(false) => "offline",
            None => "unknown",
        };
        println!(
            "  {}  {}  backlog {}  peer {}",
            s.peer,
            if s.attached { "open" } else { "idle" },
            s.backlog,
            peer_state
        );
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let code = if let Some(e) = err.downcast_ref::<DaemonError>() {
        e.code
    } else if let Some(e) = err.downcast_ref::<IdentityError>() {
        match e {
            IdentityError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            IdentityError::NotFound { .. } => ErrorCode::NotFound,
            IdentityError::Io { .. } => ErrorCode::IoFailure,
            _ => ErrorCode::InvalidRequest,
        }
    } else if let Some(e) = err.downcast_ref::<BrokerError>() {
        match e {
            BrokerError::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            _ => ErrorCode::IoFailure,
        }
    } else if err.downcast_ref::<std::io::Error>().is_some() {
        ErrorCode::IoFailure
    } else {
        ErrorCode::Internal
    };
    code.exit_code()
}
