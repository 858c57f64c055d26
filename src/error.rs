//! Error types shared by the session, detector and orchestrator layers.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by agent sessions
#[derive(Debug, Error)]
pub enum SessionError {
    /// The child process could not be created
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// Input was sent to a process that has already exited
    #[error("session for agent {0} is no longer running")]
    SessionInactive(String),

    /// Buffer classification failed; callers fall back to flushing
    #[error("output detection failed: {0}")]
    DetectionTransient(String),

    /// An active session has been silent for too long
    #[error("agent {agent_id} produced no output for {}s", idle.as_secs())]
    StaleSessionTimeout { agent_id: String, idle: Duration },

    /// No agent is registered under the given id
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The request could not be turned into an agent command
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl SessionError {
    pub fn spawn(command: &str, reason: impl ToString) -> Self {
        Self::Spawn {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}
