//! Injection logic for delivering input to an agent's terminal.
//!
//! Handles:
//! - Typing text, waiting for the CLI to take it, then pressing Enter
//! - Sending named control keys as-is
//! - Keeping every text/Enter pair for one process contiguous

use crate::protocol::AgentCommand;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-process injector. Commands are applied strictly in arrival order.
pub struct Injector {
    /// Agent this injector writes for (log context)
    agent_id: String,
    /// Channel for sending data to the PTY writer
    pty_tx: mpsc::Sender<Vec<u8>>,
    /// Delay between text and the submit key
    submit_delay: Duration,
}

impl Injector {
    pub fn new(agent_id: String, pty_tx: mpsc::Sender<Vec<u8>>, submit_delay: Duration) -> Self {
        Self {
            agent_id,
            pty_tx,
            submit_delay,
        }
    }

    /// Run until the command channel or the PTY writer closes
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<AgentCommand>) {
        while let Some(command) = rx.recv().await {
            if let Err(e) = self.inject(command).await {
                warn!("Injector for {} stopping: {}", self.agent_id, e);
                break;
            }
        }
        debug!("Injector for {} exiting", self.agent_id);
    }

    async fn inject(&self, command: AgentCommand) -> Result<()> {
        match command {
            AgentCommand::Text(text) => {
                let text = sanitize_for_injection(&text);
                debug!(
                    "Typing {} bytes into {}: {}",
                    text.len(),
                    self.agent_id,
                    preview(&text)
                );

                // Write content without Enter, give the CLI time to take it, then submit
                self.send(text.into_bytes()).await?;
                tokio::time::sleep(self.submit_delay).await;
                self.send(vec![0x0d]).await?;
            }
            AgentCommand::Control(key) => {
                debug!("Sending {:?} to {}", key, self.agent_id);
                self.send(key.as_bytes().to_vec()).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.pty_tx
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))
    }
}

/// Sanitize text for injection (remove control characters)
pub fn sanitize_for_injection(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}
