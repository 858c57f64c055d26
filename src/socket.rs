//! Unix domain socket server for controlling agents.
//!
//! Provides a socket interface at `/tmp/agent-relay.sock` or
//! `/tmp/agent-relay/{WORKSPACE_ID}/control.sock` that accepts:
//! - JSON-framed agent commands (create, send, kill, list, sweep)
//! - Event subscriptions
//! - Shutdown commands
//!
//! After a `subscribe` request the connection stays open and streams every
//! agent event (output, completion, errors) back to the client.

use crate::orchestrator::OrchestratorCommand;
use crate::protocol::{AgentEvent, ControlRequest, ControlResponse};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Socket server for control requests
pub struct SocketServer {
    /// Path to the Unix socket
    socket_path: String,
    /// Channel into the orchestrator loop
    commands_tx: mpsc::Sender<OrchestratorCommand>,
    /// Outbound agent events, subscribed per connection
    events_tx: broadcast::Sender<AgentEvent>,
    /// Shutdown signal
    shutdown_tx: mpsc::Sender<()>,
}

impl SocketServer {
    /// Create a new socket server
    pub fn new(
        socket_path: String,
        commands_tx: mpsc::Sender<OrchestratorCommand>,
        events_tx: broadcast::Sender<AgentEvent>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            socket_path,
            commands_tx,
            events_tx,
            shutdown_tx,
        }
    }

    /// Start the socket server
    pub async fn run(self) -> Result<()> {
        // Remove existing socket if present
        let path = Path::new(&self.socket_path);
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory {:?}", parent))?;
        }

        // Bind the socket
        let listener = UnixListener::bind(&self.socket_path)
            .context(format!("Failed to bind socket at {}", self.socket_path))?;

        // Set socket permissions (0600 - owner only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, perms) {
                warn!("Failed to set socket permissions: {}", e);
            }
        }

        info!("Socket server listening at {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let commands_tx = self.commands_tx.clone();
                    let events_tx = self.events_tx.clone();
                    let shutdown_tx = self.shutdown_tx.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, commands_tx, events_tx, shutdown_tx).await
                        {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single client connection
///
/// Requests are answered in order. Once subscribed, agent events are
/// interleaved with responses until the client disconnects.
async fn handle_connection(
    stream: UnixStream,
    commands_tx: mpsc::Sender<OrchestratorCommand>,
    events_tx: broadcast::Sender<AgentEvent>,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let mut events_rx: Option<broadcast::Receiver<AgentEvent>> = None;

    debug!("New client connection");

    loop {
        tokio::select! {
            // Handle incoming requests from client
            result = reader.read_line(&mut line) => {
                let bytes_read = result?;

                if bytes_read == 0 {
                    debug!("Client disconnected");
                    break;
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    line.clear();
                    continue;
                }

                let response = match serde_json::from_str::<ControlRequest>(trimmed) {
                    Ok(ControlRequest::Subscribe) => {
                        // Subscribe before acknowledging so no event slips between
                        events_rx = Some(events_tx.subscribe());
                        debug!("Client subscribed to agent events");
                        ControlResponse::Subscribed
                    }
                    Ok(request) => handle_request(request, &commands_tx, &shutdown_tx).await,
                    Err(e) => ControlResponse::Error {
                        message: format!("Invalid JSON: {}", e),
                    },
                };

                write_json(&mut writer, &response).await?;
                line.clear();

                if matches!(response, ControlResponse::ShutdownAck) {
                    return Ok(());
                }
            }

            // Forward agent events to subscribed clients
            result = next_event(&mut events_rx) => {
                match result {
                    Ok(event) => {
                        write_json(&mut writer, &event).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event subscriber lagged by {} events - some agent output was not forwarded", n);
                        // Tell the client what it missed; the records keep the full output
                        let notice = ControlResponse::Error {
                            message: format!("Subscriber lagged: {} events dropped", n),
                        };
                        write_json(&mut writer, &notice).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Wait for the next event, or forever when not subscribed
async fn next_event(
    events_rx: &mut Option<broadcast::Receiver<AgentEvent>>,
) -> Result<AgentEvent, broadcast::error::RecvError> {
    match events_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_json<T: serde::Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Handle a single request
async fn handle_request(
    request: ControlRequest,
    commands_tx: &mpsc::Sender<OrchestratorCommand>,
    shutdown_tx: &mpsc::Sender<()>,
) -> ControlResponse {
    let result = match request {
        ControlRequest::CreateAgent {
            conversation_id,
            task,
        } => {
            info!("Create agent request for conversation {}", conversation_id);
            ask(commands_tx, |reply| OrchestratorCommand::CreateAgent {
                conversation_id,
                task,
                reply,
            })
            .await
            .map(|agent_id| ControlResponse::AgentCreated { agent_id })
        }

        ControlRequest::SendCommand { agent_id, command } => {
            debug!("Send command request for agent {}", agent_id);
            ask(commands_tx, |reply| OrchestratorCommand::SendCommand {
                agent_id,
                command,
                reply,
            })
            .await
            .map(|sent| match sent {
                Ok(()) => ControlResponse::Ok,
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            })
        }

        ControlRequest::KillAgent { agent_id } => {
            ask(commands_tx, |reply| OrchestratorCommand::KillAgent {
                agent_id,
                reply,
            })
            .await
            .map(|killed| ControlResponse::Killed {
                count: usize::from(killed),
            })
        }

        ControlRequest::KillConversation { conversation_id } => {
            ask(commands_tx, |reply| OrchestratorCommand::KillConversation {
                conversation_id,
                reply,
            })
            .await
            .map(|count| ControlResponse::Killed { count })
        }

        ControlRequest::KillAll => ask(commands_tx, |reply| OrchestratorCommand::KillAll { reply })
            .await
            .map(|count| ControlResponse::Killed { count }),

        ControlRequest::ListAgents { conversation_id } => {
            ask(commands_tx, |reply| OrchestratorCommand::ListAgents {
                conversation_id,
                reply,
            })
            .await
            .map(|agents| ControlResponse::Agents { agents })
        }

        ControlRequest::Sweep { max_idle_secs } => ask(commands_tx, |reply| {
            OrchestratorCommand::Sweep {
                max_idle: max_idle_secs.map(Duration::from_secs),
                reply,
            }
        })
        .await
        .map(|count| ControlResponse::Swept { count }),

        ControlRequest::Subscribe => Ok(ControlResponse::Subscribed),

        ControlRequest::Shutdown => {
            info!("Shutdown requested via socket");
            let _ = shutdown_tx.send(()).await;
            Ok(ControlResponse::ShutdownAck)
        }
    };

    result.unwrap_or_else(|message| ControlResponse::Error { message })
}

/// Send a command into the orchestrator loop and wait for its answer
async fn ask<T>(
    commands_tx: &mpsc::Sender<OrchestratorCommand>,
    build: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
) -> Result<T, String> {
    let (reply_tx, reply_rx) = oneshot::channel();
    commands_tx
        .send(build(reply_tx))
        .await
        .map_err(|_| "Orchestrator channel closed".to_string())?;
    reply_rx
        .await
        .map_err(|_| "Orchestrator dropped the request".to_string())
}
