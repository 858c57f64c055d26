//! In-memory table of agents keyed by agent id and by conversation.
//!
//! The registry is the single owner of agent records. Other components
//! mutate them only through `update` (which stamps activity) and `modify`.

use crate::detector;
use crate::protocol::{
    current_timestamp_ms, AgentSnapshot, AgentState, ExitInfo, HistoryEntry, Speaker,
};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Non-blank lines kept for quick inspection
const RECENT_LINES_MAX: usize = 10;

/// Characters of raw output scanned when rebuilding recent lines
const RECENT_LINES_SCAN_CHARS: usize = 4000;

/// One supervised attempt at running the agent CLI for a task
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub conversation_id: String,
    pub task: String,
    pub state: AgentState,
    /// Everything the current process has emitted
    pub raw_output: String,
    /// Output accumulated since the last flush
    pub pending: String,
    /// Normalized form of the last flushed buffer
    pub last_flushed_normalized: String,
    pub recent_lines: VecDeque<String>,
    pub history: VecDeque<HistoryEntry>,
    /// Guards against overlapping detection passes
    pub flush_check_active: bool,
    pub started_at: u64,
    pub last_activity_at: u64,
    pub completed_at: Option<u64>,
    pub exit: Option<ExitInfo>,
    /// Monotonic twin of `last_activity_at`, used for staleness
    pub last_activity: Instant,
    /// When the process last produced output
    pub last_output: Instant,
}

impl Agent {
    fn new(conversation_id: &str, task: &str) -> Self {
        let now_ms = current_timestamp_ms();
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            task: task.to_string(),
            state: AgentState::Initializing,
            raw_output: String::new(),
            pending: String::new(),
            last_flushed_normalized: String::new(),
            recent_lines: VecDeque::with_capacity(RECENT_LINES_MAX),
            history: VecDeque::new(),
            flush_check_active: false,
            started_at: now_ms,
            last_activity_at: now_ms,
            completed_at: None,
            exit: None,
            last_activity: now,
            last_output: now,
        }
    }

    /// Append process output to both the raw log and the pending buffer
    pub fn append_output(&mut self, text: &str) {
        self.raw_output.push_str(text);
        self.pending.push_str(text);
        self.last_output = Instant::now();
        self.refresh_recent_lines();
    }

    /// Take the pending buffer for delivery, remembering its normalized form
    pub fn take_pending(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        // An unnormalizable buffer still counts as flushed; compare against nothing next time
        self.last_flushed_normalized = detector::normalize(&pending).unwrap_or_default();
        pending
    }

    /// Clear per-process output state ahead of a respawn
    pub fn reset_for_restart(&mut self, task: &str) {
        self.task = task.to_string();
        self.state = AgentState::Initializing;
        self.raw_output.clear();
        self.pending.clear();
        self.last_flushed_normalized.clear();
        self.recent_lines.clear();
        self.flush_check_active = false;
        self.completed_at = None;
        self.exit = None;
        self.started_at = current_timestamp_ms();
        self.last_output = Instant::now();
    }

    fn refresh_recent_lines(&mut self) {
        let tail = detector::tail_window(&self.raw_output, RECENT_LINES_SCAN_CHARS);
        let Ok(clean) = detector::strip_ansi(tail) else {
            return;
        };
        let lines: Vec<String> = clean
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(RECENT_LINES_MAX);
        self.recent_lines = lines.into_iter().skip(skip).collect();
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            task: self.task.clone(),
            state: self.state,
            pending_len: self.pending.chars().count(),
            recent_lines: self.recent_lines.iter().cloned().collect(),
            history: self.history.iter().cloned().collect(),
            exit: self.exit,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            completed_at: self.completed_at,
        }
    }
}

/// Registry of all agents
pub struct AgentRegistry {
    agents: HashMap<String, Agent>,
    /// Agent ids per conversation, oldest first
    by_conversation: HashMap<String, Vec<String>>,
    history_max: usize,
}

impl AgentRegistry {
    pub fn new(history_max: usize) -> Self {
        Self {
            agents: HashMap::new(),
            by_conversation: HashMap::new(),
            history_max,
        }
    }

    /// Create a new agent in `Initializing`
    pub fn create(&mut self, conversation_id: &str, task: &str) -> &Agent {
        let agent = Agent::new(conversation_id, task);
        let id = agent.id.clone();
        debug!("Registered agent {} for conversation {}", id, conversation_id);

        self.by_conversation
            .entry(conversation_id.to_string())
            .or_default()
            .push(id.clone());
        self.agents.entry(id).or_insert(agent)
    }

    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    /// The live (`Initializing`/`Active`) agent for a conversation, newest first
    pub fn get_active_by_conversation(&self, conversation_id: &str) -> Option<&Agent> {
        self.conversation_agents(conversation_id)
            .rev()
            .find(|agent| agent.state.is_live())
    }

    /// Apply a change to an agent and stamp its activity time
    pub fn update<R>(&mut self, agent_id: &str, f: impl FnOnce(&mut Agent) -> R) -> Option<R> {
        let agent = self.agents.get_mut(agent_id)?;
        let result = f(agent);
        agent.last_activity = Instant::now();
        agent.last_activity_at = current_timestamp_ms();
        Some(result)
    }

    /// Apply bookkeeping that is not agent activity (detection passes,
    /// timer cleanup); leaves the idle clock alone.
    pub fn modify<R>(&mut self, agent_id: &str, f: impl FnOnce(&mut Agent) -> R) -> Option<R> {
        self.agents.get_mut(agent_id).map(f)
    }

    pub fn delete(&mut self, agent_id: &str) -> Option<Agent> {
        let agent = self.agents.remove(agent_id)?;
        if let Some(ids) = self.by_conversation.get_mut(&agent.conversation_id) {
            ids.retain(|id| id != agent_id);
            if ids.is_empty() {
                self.by_conversation.remove(&agent.conversation_id);
            }
        }
        debug!("Removed agent {}", agent_id);
        Some(agent)
    }

    /// Agents of a conversation that can still take commands:
    /// live ones, and completed ones that restart on the next message.
    pub fn list_active_by_conversation(&self, conversation_id: &str) -> Vec<&Agent> {
        self.conversation_agents(conversation_id)
            .filter(|agent| agent.state.is_live() || agent.state == AgentState::Completed)
            .collect()
    }

    /// Every agent id recorded for a conversation, oldest first
    pub fn ids_for_conversation(&self, conversation_id: &str) -> Vec<String> {
        self.by_conversation
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Append a turn to the most recent agent of a conversation,
    /// evicting the oldest entries beyond the bound.
    pub fn append_history(&mut self, conversation_id: &str, speaker: Speaker, text: &str) -> bool {
        let Some(agent_id) = self
            .by_conversation
            .get(conversation_id)
            .and_then(|ids| ids.last())
        else {
            return false;
        };
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };

        agent.history.push_back(HistoryEntry {
            speaker,
            text: text.to_string(),
            timestamp: current_timestamp_ms(),
        });
        while agent.history.len() > self.history_max {
            agent.history.pop_front();
        }
        true
    }

    /// Delete agents idle for longer than `max_idle`; returns how many went
    pub fn sweep_stale(&mut self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .agents
            .values()
            .filter(|agent| agent.last_activity.elapsed() > max_idle)
            .map(|agent| agent.id.clone())
            .collect();

        for id in &stale {
            self.delete(id);
        }

        if !stale.is_empty() {
            info!("Swept {} stale agents", stale.len());
        }
        stale.len()
    }

    /// Live agents whose process has been silent for longer than `silence`
    pub fn silent_agents(&self, silence: Duration) -> Vec<&Agent> {
        self.agents
            .values()
            .filter(|agent| agent.state.is_live() && agent.last_output.elapsed() > silence)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn conversation_agents<'a>(
        &'a self,
        conversation_id: &str,
    ) -> impl DoubleEndedIterator<Item = &'a Agent> + 'a {
        self.by_conversation
            .get(conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.agents.get(id))
    }
}
