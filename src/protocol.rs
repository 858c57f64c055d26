//! Protocol types for agent-relay communication.
//!
//! Defines the JSON message format for control requests, responses,
//! outbound agent events, and the runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Request sent to the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Start a supervised session for a conversation
    CreateAgent {
        conversation_id: String,
        task: String,
    },
    /// Send text or a reserved control token to an agent
    SendCommand { agent_id: String, command: String },
    /// Kill one agent and forget it
    KillAgent { agent_id: String },
    /// Kill every agent bound to a conversation
    KillConversation { conversation_id: String },
    /// Kill every agent
    KillAll,
    /// List agents for a conversation
    ListAgents { conversation_id: String },
    /// Run the stale sweep now
    Sweep {
        #[serde(default)]
        max_idle_secs: Option<u64>,
    },
    /// Stream agent events on this connection
    Subscribe,
    /// Graceful shutdown request
    Shutdown,
}

/// Response sent back through the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    AgentCreated { agent_id: String },
    Ok,
    Killed { count: usize },
    Agents { agents: Vec<AgentSnapshot> },
    Swept { count: usize },
    Subscribed,
    ShutdownAck,
    Error { message: String },
}

/// Events emitted to external collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of output judged ready for delivery (uncleaned)
    AgentOutput {
        agent_id: String,
        conversation_id: String,
        text: String,
    },
    /// The agent's process exited on its own
    AgentComplete {
        agent_id: String,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        full_output: String,
    },
    /// Spawn or runtime failure
    AgentError { agent_id: String, error: String },
}

impl AgentEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentEvent::AgentOutput { agent_id, .. }
            | AgentEvent::AgentComplete { agent_id, .. }
            | AgentEvent::AgentError { agent_id, .. } => agent_id,
        }
    }
}

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Active,
    Completed,
    Terminated,
    Error,
}

impl AgentState {
    /// Whether the agent counts towards the one-per-conversation limit
    pub fn is_live(self) -> bool {
        matches!(self, AgentState::Initializing | AgentState::Active)
    }
}

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// One turn of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

/// Named keys that can be sent without the text-then-submit pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Escape,
    Enter,
    Exit,
    Up,
    Down,
    Left,
    Right,
}

impl ControlKey {
    /// Parse a reserved token (`ESCAPE`, `ENTER`, ...)
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "ESCAPE" => Some(ControlKey::Escape),
            "ENTER" => Some(ControlKey::Enter),
            "EXIT" => Some(ControlKey::Exit),
            "UP" => Some(ControlKey::Up),
            "DOWN" => Some(ControlKey::Down),
            "LEFT" => Some(ControlKey::Left),
            "RIGHT" => Some(ControlKey::Right),
            _ => None,
        }
    }

    /// Bytes written to the terminal for this key
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            ControlKey::Escape => b"\x1b",
            ControlKey::Enter => b"\r",
            ControlKey::Exit => b"/exit\r",
            ControlKey::Up => b"\x1b[A",
            ControlKey::Down => b"\x1b[B",
            ControlKey::Right => b"\x1b[C",
            ControlKey::Left => b"\x1b[D",
        }
    }
}

/// A command routed to an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    Text(String),
    Control(ControlKey),
}

impl AgentCommand {
    /// Reserved tokens become control keys; anything else is literal text.
    pub fn parse(command: &str) -> Self {
        match ControlKey::from_token(command.trim()) {
            Some(key) => AgentCommand::Control(key),
            None => AgentCommand::Text(command.to_string()),
        }
    }
}

/// Serializable view of an agent record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub conversation_id: String,
    pub task: String,
    pub state: AgentState,
    pub pending_len: usize,
    pub recent_lines: Vec<String>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
    pub started_at: u64,
    pub last_activity_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

/// Configuration for the supervisor
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket path
    pub socket_path: String,
    /// Agent CLI and its fixed arguments (e.g., ["claude", "--model", "opus"])
    pub command: Vec<String>,
    /// Working directory for spawned agents
    pub workdir: Option<PathBuf>,
    /// Periodic output-check interval
    pub check_interval: Duration,
    /// Delay after user input before forcing a check
    pub settle_delay: Duration,
    /// Delay after spawn before typing the task
    pub startup_delay: Duration,
    /// Delay between typed text and the submit key
    pub submit_delay: Duration,
    /// Minimum pending characters before a flush is considered
    pub flush_threshold: usize,
    /// Minimum normalized length change for a flush
    pub noise_threshold: usize,
    /// Maximum conversation history entries per agent
    pub history_max: usize,
    /// Idle bound after which the sweep removes an agent
    pub stale_after: Duration,
    /// Silence after which an active agent is logged as stale
    pub silence_warn: Duration,
    /// How often the stale sweep runs
    pub sweep_interval: Duration,
    /// PTY rows for spawned agents
    pub rows: u16,
    /// PTY columns for spawned agents
    pub cols: u16,
    /// Whether to print events as JSON lines on stdout
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/agent-relay.sock".to_string(),
            command: vec![],
            workdir: None,
            check_interval: Duration::from_millis(5000),
            settle_delay: Duration::from_millis(3000),
            startup_delay: Duration::from_millis(2000),
            submit_delay: Duration::from_millis(50),
            flush_threshold: 1000,
            noise_threshold: 50,
            history_max: 20,
            stale_after: Duration::from_secs(3600),
            silence_warn: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
            rows: 50,
            cols: 200,
            json_output: false,
        }
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_deserialization() {
        let req: ControlRequest = serde_json::from_str(
            r#"{"type":"create_agent","conversation_id":"chat1","task":"list files"}"#,
        )
        .unwrap();
        match req {
            ControlRequest::CreateAgent {
                conversation_id,
                task,
            } => {
                assert_eq!(conversation_id, "chat1");
                assert_eq!(task, "list files");
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let req: ControlRequest = serde_json::from_str(r#"{"type":"sweep"}"#).unwrap();
        assert!(matches!(
            req,
            ControlRequest::Sweep {
                max_idle_secs: None
            }
        ));
    }

    #[test]
    fn test_agent_event_serialization() {
        let event = AgentEvent::AgentComplete {
            agent_id: "a1".to_string(),
            exit_code: Some(0),
            signal: None,
            full_output: "done".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"agent_complete\""));
        assert!(json.contains("\"exit_code\":0"));
        assert!(!json.contains("signal"));
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            AgentCommand::parse("ESCAPE"),
            AgentCommand::Control(ControlKey::Escape)
        );
        assert_eq!(
            AgentCommand::parse(" UP "),
            AgentCommand::Control(ControlKey::Up)
        );
        // Unrecognized tokens are literal text
        assert_eq!(
            AgentCommand::parse("escape"),
            AgentCommand::Text("escape".to_string())
        );
        assert_eq!(
            AgentCommand::parse("PAGEUP"),
            AgentCommand::Text("PAGEUP".to_string())
        );
    }

    #[test]
    fn test_control_key_bytes() {
        assert_eq!(ControlKey::Enter.as_bytes(), b"\r");
        assert_eq!(ControlKey::Left.as_bytes(), b"\x1b[D");
        assert!(ControlKey::Exit.as_bytes().ends_with(b"\r"));
    }

    #[test]
    fn test_live_states() {
        assert!(AgentState::Initializing.is_live());
        assert!(AgentState::Active.is_live());
        assert!(!AgentState::Completed.is_live());
        assert!(!AgentState::Terminated.is_live());
        assert!(!AgentState::Error.is_live());
    }
}
