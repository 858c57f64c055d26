//! Process session seam between the orchestrator and a running agent CLI.
//!
//! The orchestrator never touches OS handles directly. It spawns sessions
//! through a `SessionSpawner`, writes through `ProcessSession`, and hears
//! back through the `SessionEventSink` handed to each spawn.

use crate::error::SessionError;
use crate::protocol::{ControlKey, ExitInfo};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// What to launch for one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

/// Identifies one process binding of an agent.
///
/// The generation changes on every (re)spawn so messages from a previous
/// process can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub agent_id: String,
    pub generation: u64,
}

/// Notification from a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw bytes read from the terminal
    Output(Vec<u8>),
    /// The child exited; sent exactly once, after the last output chunk
    Exited(ExitInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub key: SessionKey,
    pub event: SessionEvent,
}

/// Channel end given to a session for reporting back to the orchestrator
#[derive(Debug, Clone)]
pub struct SessionEventSink {
    key: SessionKey,
    tx: mpsc::Sender<SessionMessage>,
}

impl SessionEventSink {
    pub fn new(key: SessionKey, tx: mpsc::Sender<SessionMessage>) -> Self {
        Self { key, tx }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Deliver an output chunk from a blocking reader thread.
    /// Returns false once the orchestrator has gone away.
    pub fn output(&self, data: Vec<u8>) -> bool {
        self.send(SessionEvent::Output(data))
    }

    /// Deliver the exit notification from a blocking reader thread
    pub fn exited(&self, exit: ExitInfo) -> bool {
        self.send(SessionEvent::Exited(exit))
    }

    fn send(&self, event: SessionEvent) -> bool {
        self.tx
            .blocking_send(SessionMessage {
                key: self.key.clone(),
                event,
            })
            .is_ok()
    }
}

/// A live process attached to a terminal
pub trait ProcessSession: Send {
    /// Type `text`, then press Enter after the submit delay
    fn write_text(&self, text: &str) -> Result<(), SessionError>;

    /// Send a named key without the submit pattern
    fn write_control(&self, key: ControlKey) -> Result<(), SessionError>;

    /// Request termination. No-op once the process has exited.
    fn kill(&self);

    fn is_running(&self) -> bool;

    /// How the process ended, once it has been reaped
    fn exit_info(&self) -> Option<ExitInfo>;
}

/// Factory for process sessions
pub trait SessionSpawner: Send {
    fn spawn(
        &self,
        request: &SpawnRequest,
        sink: SessionEventSink,
    ) -> Result<Box<dyn ProcessSession>, SessionError>;
}
