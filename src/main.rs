//! agent-relay: PTY supervisor for interactive agent sessions
//!
//! Spawns one agent CLI (claude, codex, etc.) per conversation inside a
//! pseudo-terminal, decides when the agent's screen output is worth
//! delivering, and exposes a Unix socket for creating agents, routing
//! commands and streaming events.
//!
//! Usage:
//!   agent-relay --socket /tmp/agent-relay.sock -- claude --model opus

mod detector;
mod error;
mod inject;
mod orchestrator;
mod protocol;
mod pty;
mod registry;
mod session;
mod socket;

use anyhow::Result;
use clap::Parser;
use orchestrator::{Orchestrator, OrchestratorCommand};
use protocol::{AgentEvent, Config};
use pty::PtySpawner;
use socket::SocketServer;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Events buffered per subscriber before the slowest one starts losing them
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// PTY supervisor for interactive agent sessions
#[derive(Parser, Debug)]
#[command(name = "agent-relay")]
#[command(about = "PTY supervisor for interactive agent sessions")]
#[command(version)]
struct Args {
    /// Unix socket path (default: /tmp/agent-relay.sock or /tmp/agent-relay/{WORKSPACE_ID}/control.sock)
    #[arg(short, long)]
    socket: Option<String>,

    /// Working directory for spawned agents
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Milliseconds between periodic output checks
    #[arg(long, default_value = "5000")]
    check_interval_ms: u64,

    /// Milliseconds after user input before forcing an output check
    #[arg(long, default_value = "3000")]
    settle_delay_ms: u64,

    /// Milliseconds after spawn before typing the task
    #[arg(long, default_value = "2000")]
    startup_delay_ms: u64,

    /// Milliseconds between typed text and the submit key
    #[arg(long, default_value = "50")]
    submit_delay_ms: u64,

    /// Pending characters required before output is considered for delivery
    #[arg(long, default_value = "1000")]
    flush_threshold: usize,

    /// Minimum change in normalized length for a delivery
    #[arg(long, default_value = "50")]
    noise_threshold: usize,

    /// Conversation history entries kept per agent
    #[arg(long, default_value = "20")]
    history_max: usize,

    /// Seconds without activity before the sweep removes an agent
    #[arg(long, default_value = "3600")]
    stale_after_secs: u64,

    /// Seconds of silence before an active agent is logged as stale
    #[arg(long, default_value = "600")]
    silence_warn_secs: u64,

    /// Seconds between stale sweeps
    #[arg(long, default_value = "300")]
    sweep_interval_secs: u64,

    /// Terminal rows for spawned agents
    #[arg(long, default_value = "50")]
    rows: u16,

    /// Terminal columns for spawned agents
    #[arg(long, default_value = "200")]
    cols: u16,

    /// Print agent events as JSON lines to stdout
    #[arg(long)]
    json_output: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Agent command to run per conversation (after --)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    fn into_config(self) -> Config {
        let workspace_id = std::env::var("WORKSPACE_ID")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let socket_path = self.socket.unwrap_or_else(|| match workspace_id {
            Some(id) => format!("/tmp/agent-relay/{}/control.sock", id),
            None => "/tmp/agent-relay.sock".to_string(),
        });

        Config {
            socket_path,
            command: self.command,
            workdir: self.workdir,
            check_interval: Duration::from_millis(self.check_interval_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            submit_delay: Duration::from_millis(self.submit_delay_ms),
            flush_threshold: self.flush_threshold,
            noise_threshold: self.noise_threshold,
            history_max: self.history_max,
            stale_after: Duration::from_secs(self.stale_after_secs),
            silence_warn: Duration::from_secs(self.silence_warn_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            rows: self.rows,
            cols: self.cols,
            json_output: self.json_output,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = args.into_config();

    info!("agent-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Command: {:?}", config.command);
    info!("Socket: {}", config.socket_path);
    info!("Terminal size: {}x{}", config.cols, config.rows);

    // Create channels
    // Broadcast channel for agent events (socket subscribers and stdout mirror)
    let (events_tx, _events_rx) = broadcast::channel::<AgentEvent>(EVENT_CHANNEL_CAPACITY);
    let (commands_tx, commands_rx) = mpsc::channel::<OrchestratorCommand>(64);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    let socket_path = config.socket_path.clone();
    let json_output = config.json_output;

    let spawner = PtySpawner::new(config.submit_delay);
    let (orchestrator, receivers) =
        Orchestrator::new(config, Box::new(spawner), events_tx.clone());

    // Start socket server
    let socket_server = SocketServer::new(
        socket_path.clone(),
        commands_tx,
        events_tx.clone(),
        shutdown_tx.clone(),
    );
    let socket_shutdown = shutdown_tx.clone();
    let socket_handle = tokio::spawn(async move {
        if let Err(e) = socket_server.run().await {
            error!("Socket server error: {}", e);
            let _ = socket_shutdown.send(()).await;
        }
    });

    // Mirror events to stdout
    let output_handle = json_output.then(|| {
        let events_rx = events_tx.subscribe();
        tokio::spawn(print_events(events_rx))
    });

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let signal_handle = tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(()).await;
    });

    orchestrator.run(receivers, commands_rx, shutdown_rx).await;

    // Cleanup
    info!("Shutting down...");

    // Clean up socket
    let _ = std::fs::remove_file(&socket_path);

    // Abort background tasks
    socket_handle.abort();
    signal_handle.abort();
    if let Some(handle) = output_handle {
        // Let the final completion events drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    }

    info!("Goodbye!");
    Ok(())
}

/// Write every agent event as a JSON line to stdout
async fn print_events(mut events_rx: broadcast::Receiver<AgentEvent>) {
    let mut stdout = tokio::io::stdout();
    loop {
        match events_rx.recv().await {
            Ok(event) => {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if stdout.write_all(json.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Stdout mirror lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
