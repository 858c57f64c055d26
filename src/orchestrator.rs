//! Session orchestration: binds agents to process sessions and decides
//! when their output is delivered.
//!
//! Everything runs on one cooperative loop. Process output, exits, timers
//! and control commands arrive as messages and each handler finishes its
//! read-modify-write of an agent before the next message is taken, so the
//! registry needs no locking.

use crate::detector::{self, DetectionInput, FlushDecision, Thresholds, PROCESSING_TAIL_CHARS};
use crate::error::SessionError;
use crate::protocol::{
    AgentCommand, AgentEvent, AgentSnapshot, AgentState, Config, ExitInfo, Speaker,
    current_timestamp_ms,
};
use crate::registry::AgentRegistry;
use crate::session::{
    ProcessSession, SessionEvent, SessionEventSink, SessionKey, SessionMessage, SessionSpawner,
    SpawnRequest,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Timer-driven work for the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// Re-evaluate an agent's pending output
    CheckOutput(SessionKey),
    /// Startup grace elapsed; type the task into the session
    DeliverTask(SessionKey),
}

/// Requests from the control surface, answered over a oneshot
#[derive(Debug)]
pub enum OrchestratorCommand {
    CreateAgent {
        conversation_id: String,
        task: String,
        reply: oneshot::Sender<String>,
    },
    SendCommand {
        agent_id: String,
        command: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    KillAgent {
        agent_id: String,
        reply: oneshot::Sender<bool>,
    },
    KillConversation {
        conversation_id: String,
        reply: oneshot::Sender<usize>,
    },
    KillAll {
        reply: oneshot::Sender<usize>,
    },
    ListAgents {
        conversation_id: String,
        reply: oneshot::Sender<Vec<AgentSnapshot>>,
    },
    Sweep {
        max_idle: Option<Duration>,
        reply: oneshot::Sender<usize>,
    },
}

/// Receiving ends drained by `Orchestrator::run`
pub struct LoopReceivers {
    pub session_rx: mpsc::Receiver<SessionMessage>,
    pub loop_rx: mpsc::Receiver<LoopEvent>,
}

/// The live process bound to an agent, with its timers
struct Binding {
    generation: u64,
    session: Box<dyn ProcessSession>,
    check_timer: Option<JoinHandle<()>>,
    settle_timer: Option<JoinHandle<()>>,
    startup_timer: Option<JoinHandle<()>>,
    /// Commands received before the task was typed, sent right after it
    queued: Vec<AgentCommand>,
    /// Bytes of an incomplete UTF-8 sequence carried to the next chunk
    utf8_carry: Vec<u8>,
}

impl Binding {
    fn cancel_timers(&mut self) {
        for timer in [
            self.check_timer.take(),
            self.settle_timer.take(),
            self.startup_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }
}

/// Flush decision function, replaceable in tests
type Classifier = for<'a> fn(&DetectionInput<'a>, Thresholds) -> Result<FlushDecision, SessionError>;

pub struct Orchestrator {
    config: Config,
    thresholds: Thresholds,
    classify: Classifier,
    registry: AgentRegistry,
    spawner: Box<dyn SessionSpawner>,
    bindings: HashMap<String, Binding>,
    next_generation: u64,
    events_tx: broadcast::Sender<AgentEvent>,
    session_tx: mpsc::Sender<SessionMessage>,
    loop_tx: mpsc::Sender<LoopEvent>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        spawner: Box<dyn SessionSpawner>,
        events_tx: broadcast::Sender<AgentEvent>,
    ) -> (Self, LoopReceivers) {
        let (session_tx, session_rx) = mpsc::channel(256);
        let (loop_tx, loop_rx) = mpsc::channel(64);
        let thresholds = Thresholds {
            flush_threshold: config.flush_threshold,
            noise_threshold: config.noise_threshold,
        };

        let orchestrator = Self {
            registry: AgentRegistry::new(config.history_max),
            config,
            thresholds,
            classify: detector::classify_buffer,
            spawner,
            bindings: HashMap::new(),
            next_generation: 0,
            events_tx,
            session_tx,
            loop_tx,
        };
        (
            orchestrator,
            LoopReceivers {
                session_rx,
                loop_rx,
            },
        )
    }

    /// Run the event loop until shutdown is requested
    pub async fn run(
        mut self,
        mut receivers: LoopReceivers,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Orchestrator loop started");
        let period = self.config.sweep_interval;
        let mut sweep_interval = interval_at(Instant::now() + period, period);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }

                Some(command) = commands.recv() => {
                    self.handle_command(command);
                }

                Some(message) = receivers.session_rx.recv() => {
                    self.handle_session_message(message);
                }

                Some(event) = receivers.loop_rx.recv() => {
                    self.handle_loop_event(event);
                }

                _ = sweep_interval.tick() => {
                    let max_idle = self.config.stale_after;
                    self.sweep(max_idle);
                }
            }
        }

        let killed = self.kill_all();
        info!("Orchestrator stopped, killed {} agents", killed);
    }

    fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::CreateAgent {
                conversation_id,
                task,
                reply,
            } => {
                let _ = reply.send(self.create_agent(&conversation_id, &task));
            }
            OrchestratorCommand::SendCommand {
                agent_id,
                command,
                reply,
            } => {
                let _ = reply.send(self.send_command(&agent_id, &command));
            }
            OrchestratorCommand::KillAgent { agent_id, reply } => {
                let _ = reply.send(self.kill_agent(&agent_id));
            }
            OrchestratorCommand::KillConversation {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.kill_all_for_conversation(&conversation_id));
            }
            OrchestratorCommand::KillAll { reply } => {
                let _ = reply.send(self.kill_all());
            }
            OrchestratorCommand::ListAgents {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.get_active_agents_for_conversation(&conversation_id));
            }
            OrchestratorCommand::Sweep { max_idle, reply } => {
                let max_idle = max_idle.unwrap_or(self.config.stale_after);
                let _ = reply.send(self.sweep(max_idle));
            }
        }
    }

    /// Start a supervised session for a conversation, replacing any live one.
    ///
    /// Spawn failures are reported through an `agent_error` event; the
    /// record stays in `Error` state for inspection.
    pub fn create_agent(&mut self, conversation_id: &str, task: &str) -> String {
        self.terminate_live_agents(conversation_id, None);

        let agent_id = self.registry.create(conversation_id, task).id.clone();
        self.registry
            .append_history(conversation_id, Speaker::User, task);
        info!("Created agent {} for conversation {}", agent_id, conversation_id);

        let _ = self.start_session(&agent_id);
        agent_id
    }

    /// Route a command to an agent. A completed agent is restarted with the
    /// command as its new task instead of being written to.
    pub fn send_command(&mut self, agent_id: &str, command: &str) -> Result<(), SessionError> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| SessionError::UnknownAgent(agent_id.to_string()))?;
        if command.trim().is_empty() {
            return Err(SessionError::InvalidCommand("empty command".to_string()));
        }
        let conversation_id = agent.conversation_id.clone();

        self.settle_dead_binding(agent_id);
        let state = self
            .registry
            .get(agent_id)
            .map(|agent| agent.state)
            .ok_or_else(|| SessionError::UnknownAgent(agent_id.to_string()))?;

        let live = self
            .bindings
            .get(agent_id)
            .map(|binding| binding.session.is_running())
            .unwrap_or(false);

        let parsed = AgentCommand::parse(command);

        if state == AgentState::Completed || state == AgentState::Error || !live {
            return match parsed {
                AgentCommand::Text(text) => self.restart_agent(agent_id, &text),
                AgentCommand::Control(key) => {
                    debug!("Dropping {:?} for agent {} without a process", key, agent_id);
                    Err(SessionError::SessionInactive(agent_id.to_string()))
                }
            };
        }

        let Some(binding) = self.bindings.get_mut(agent_id) else {
            return Err(SessionError::SessionInactive(agent_id.to_string()));
        };

        if binding.startup_timer.is_some() {
            debug!("Agent {} has not received its task yet, queueing {:?}", agent_id, parsed);
            binding.queued.push(parsed.clone());
        } else {
            write_command(binding.session.as_ref(), &parsed)?;
        }
        if let AgentCommand::Text(text) = &parsed {
            self.registry
                .append_history(&conversation_id, Speaker::User, text);
        }

        self.registry.update(agent_id, |_| ());
        self.schedule_settle_check(agent_id);
        Ok(())
    }

    /// Kill an agent's process and forget the agent
    pub fn kill_agent(&mut self, agent_id: &str) -> bool {
        self.terminate_agent(agent_id).is_some()
    }

    /// Kill and remove an agent, returning its final record
    fn terminate_agent(&mut self, agent_id: &str) -> Option<AgentSnapshot> {
        self.unbind(agent_id);
        let mut agent = self.registry.delete(agent_id)?;
        agent.state = AgentState::Terminated;
        let snapshot = agent.snapshot();
        info!(
            "Terminated agent {} of conversation {} ({} history entries, {} pending chars)",
            agent_id,
            snapshot.conversation_id,
            snapshot.history.len(),
            snapshot.pending_len
        );
        Some(snapshot)
    }

    /// Kill every live agent of a conversation other than `keep`
    fn terminate_live_agents(&mut self, conversation_id: &str, keep: Option<&str>) {
        let live: Vec<String> = self
            .registry
            .ids_for_conversation(conversation_id)
            .into_iter()
            .filter(|id| Some(id.as_str()) != keep)
            .filter(|id| {
                self.registry
                    .get(id)
                    .map(|agent| agent.state.is_live())
                    .unwrap_or(false)
            })
            .collect();
        for id in live {
            info!(
                "Conversation {} already has live agent {}, terminating it",
                conversation_id, id
            );
            self.kill_agent(&id);
        }
    }

    pub fn kill_all_for_conversation(&mut self, conversation_id: &str) -> usize {
        self.registry
            .ids_for_conversation(conversation_id)
            .iter()
            .filter(|id| self.kill_agent(id))
            .count()
    }

    pub fn kill_all(&mut self) -> usize {
        let ids = self.registry.ids();
        let count = ids.iter().filter(|id| self.kill_agent(id)).count();

        // Bindings whose record is already gone
        let orphans: Vec<String> = self.bindings.keys().cloned().collect();
        for id in orphans {
            self.unbind(&id);
        }
        count
    }

    pub fn get_active_agents_for_conversation(&self, conversation_id: &str) -> Vec<AgentSnapshot> {
        self.registry
            .list_active_by_conversation(conversation_id)
            .into_iter()
            .map(|agent| agent.snapshot())
            .collect()
    }

    /// Remove agents idle longer than `max_idle` and stop their processes.
    /// Live agents that have gone quiet are only logged.
    pub fn sweep(&mut self, max_idle: Duration) -> usize {
        for agent in self.registry.silent_agents(self.config.silence_warn) {
            let err = SessionError::StaleSessionTimeout {
                agent_id: agent.id.clone(),
                idle: agent.last_output.elapsed(),
            };
            warn!(
                "{} (last line: {:?})",
                err,
                agent.recent_lines.back().map(String::as_str).unwrap_or("")
            );
        }

        let count = self.registry.sweep_stale(max_idle);

        let orphans: Vec<String> = self
            .bindings
            .keys()
            .filter(|id| !self.registry.contains(id))
            .cloned()
            .collect();
        for id in orphans {
            self.unbind(&id);
        }
        count
    }

    pub fn handle_session_message(&mut self, message: SessionMessage) {
        let SessionMessage { key, event } = message;
        if !self.is_current(&key) {
            debug!(
                "Ignoring {} from stale binding {}#{}",
                event_kind(&event),
                key.agent_id,
                key.generation
            );
            return;
        }

        match event {
            SessionEvent::Output(data) => self.record_output(&key.agent_id, &data),
            SessionEvent::Exited(exit) => self.handle_exit(&key.agent_id, exit),
        }
    }

    pub fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::CheckOutput(key) => {
                if self.is_current(&key) {
                    self.check_output(&key.agent_id, false);
                }
            }
            LoopEvent::DeliverTask(key) => {
                if self.is_current(&key) {
                    self.deliver_task(&key.agent_id);
                }
            }
        }
    }

    /// Run one detection pass and flush if warranted
    fn check_output(&mut self, agent_id: &str, forced: bool) {
        let thresholds = self.thresholds;
        let classify = self.classify;
        let decision = self.registry.modify(agent_id, |agent| {
            if agent.flush_check_active {
                return None;
            }
            agent.flush_check_active = true;

            let input = DetectionInput {
                pending: &agent.pending,
                raw_tail: detector::tail_window(&agent.raw_output, PROCESSING_TAIL_CHARS),
                last_flushed_normalized: &agent.last_flushed_normalized,
                forced,
            };
            let decision = match classify(&input, thresholds) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("{}; flushing agent {} anyway", e, agent.id);
                    FlushDecision {
                        should_flush: !agent.pending.is_empty(),
                        reason: "detection failed, flushing unconditionally".to_string(),
                    }
                }
            };

            let flushed = decision.should_flush.then(|| agent.take_pending());
            agent.flush_check_active = false;
            Some((decision, flushed, agent.conversation_id.clone()))
        });

        let Some(Some((decision, flushed, conversation_id))) = decision else {
            return;
        };
        debug!(
            "Output check for {}: flush={} ({})",
            agent_id, decision.should_flush, decision.reason
        );

        if let Some(text) = flushed {
            if let Ok(clean) = detector::strip_ansi(&text) {
                let clean = clean.trim();
                if !clean.is_empty() {
                    self.registry
                        .append_history(&conversation_id, Speaker::Agent, clean);
                }
            }
            info!("Flushing {} chars from agent {}", text.chars().count(), agent_id);
            self.emit(AgentEvent::AgentOutput {
                agent_id: agent_id.to_string(),
                conversation_id,
                text,
            });
        }
    }

    fn record_output(&mut self, agent_id: &str, data: &[u8]) {
        let Some(binding) = self.bindings.get_mut(agent_id) else {
            return;
        };
        let text = decode_utf8_chunk(&mut binding.utf8_carry, data);
        if text.is_empty() {
            return;
        }
        self.registry
            .update(agent_id, |agent| agent.append_output(&text));
    }

    fn handle_exit(&mut self, agent_id: &str, exit: ExitInfo) {
        if let Some(mut binding) = self.bindings.remove(agent_id) {
            binding.cancel_timers();
            if !binding.utf8_carry.is_empty() {
                let tail = String::from_utf8_lossy(&binding.utf8_carry).to_string();
                self.registry
                    .update(agent_id, |agent| agent.append_output(&tail));
            }
        }

        self.check_output(agent_id, true);

        let full_output = self.registry.update(agent_id, |agent| {
            agent.state = AgentState::Completed;
            agent.exit = Some(exit);
            agent.completed_at = Some(current_timestamp_ms());
            agent.raw_output.clone()
        });

        let Some(full_output) = full_output else {
            return;
        };
        info!(
            "Agent {} completed (code {:?}, signal {:?})",
            agent_id, exit.code, exit.signal
        );
        self.emit(AgentEvent::AgentComplete {
            agent_id: agent_id.to_string(),
            exit_code: exit.code,
            signal: exit.signal,
            full_output,
        });
    }

    /// Run the exit path for a process that is gone but whose exit message
    /// has not been handled yet
    fn settle_dead_binding(&mut self, agent_id: &str) {
        let Some(exit) = self
            .bindings
            .get(agent_id)
            .filter(|binding| !binding.session.is_running())
            .map(|binding| binding.session.exit_info().unwrap_or_default())
        else {
            return;
        };
        debug!("Agent {} exited before its exit was handled", agent_id);
        self.handle_exit(agent_id, exit);
    }

    /// Restart a finished agent in place, keeping its conversation history
    fn restart_agent(&mut self, agent_id: &str, task: &str) -> Result<(), SessionError> {
        info!("Restarting agent {} with new task", agent_id);
        if let Some(conversation_id) = self
            .registry
            .get(agent_id)
            .map(|agent| agent.conversation_id.clone())
        {
            self.terminate_live_agents(&conversation_id, Some(agent_id));
        }
        self.unbind(agent_id);
        self.registry
            .update(agent_id, |agent| agent.reset_for_restart(task));
        self.start_session(agent_id)
    }

    /// Spawn a process for an agent in `Initializing` and bind it
    fn start_session(&mut self, agent_id: &str) -> Result<(), SessionError> {
        self.next_generation += 1;
        let key = SessionKey {
            agent_id: agent_id.to_string(),
            generation: self.next_generation,
        };

        let spawned = self.spawn_request().and_then(|request| {
            let sink = SessionEventSink::new(key.clone(), self.session_tx.clone());
            self.spawner.spawn(&request, sink)
        });

        let session = match spawned {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to start agent {}: {}", agent_id, e);
                self.registry
                    .update(agent_id, |agent| agent.state = AgentState::Error);
                self.emit(AgentEvent::AgentError {
                    agent_id: agent_id.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let check_timer = self.spawn_check_timer(key.clone());
        let startup_timer = self.spawn_delayed(self.config.startup_delay, LoopEvent::DeliverTask(key.clone()));
        self.bindings.insert(
            agent_id.to_string(),
            Binding {
                generation: key.generation,
                session,
                check_timer: Some(check_timer),
                settle_timer: None,
                startup_timer: Some(startup_timer),
                queued: Vec::new(),
                utf8_carry: Vec::new(),
            },
        );
        self.registry
            .update(agent_id, |agent| agent.state = AgentState::Active);
        info!("Agent {} active (generation {})", agent_id, key.generation);
        Ok(())
    }

    fn spawn_request(&self) -> Result<SpawnRequest, SessionError> {
        let (command, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| SessionError::spawn("", "no agent command configured"))?;
        Ok(SpawnRequest {
            command: command.clone(),
            args: args.to_vec(),
            workdir: self.config.workdir.clone(),
            rows: self.config.rows,
            cols: self.config.cols,
        })
    }

    fn deliver_task(&mut self, agent_id: &str) {
        let Some(task) = self.registry.get(agent_id).map(|agent| agent.task.clone()) else {
            return;
        };
        let Some(binding) = self.bindings.get_mut(agent_id) else {
            return;
        };
        binding.startup_timer = None;
        let queued = std::mem::take(&mut binding.queued);

        if let Err(e) = binding.session.write_text(&task) {
            warn!("Could not deliver task to agent {}: {}", agent_id, e);
            return;
        }
        debug!("Delivered task to agent {}", agent_id);
        for command in &queued {
            if let Err(e) = write_command(binding.session.as_ref(), command) {
                warn!("Could not deliver queued input to agent {}: {}", agent_id, e);
                break;
            }
        }
        self.schedule_settle_check(agent_id);
    }

    /// Force a check once the agent has had time to react to input
    fn schedule_settle_check(&mut self, agent_id: &str) {
        let Some(generation) = self.bindings.get(agent_id).map(|b| b.generation) else {
            return;
        };
        let key = SessionKey {
            agent_id: agent_id.to_string(),
            generation,
        };
        let timer = self.spawn_delayed(self.config.settle_delay, LoopEvent::CheckOutput(key));
        if let Some(binding) = self.bindings.get_mut(agent_id) {
            if let Some(previous) = binding.settle_timer.replace(timer) {
                previous.abort();
            }
        }
    }

    fn spawn_check_timer(&self, key: SessionKey) -> JoinHandle<()> {
        let loop_tx = self.loop_tx.clone();
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if loop_tx
                    .send(LoopEvent::CheckOutput(key.clone()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    fn spawn_delayed(&self, delay: Duration, event: LoopEvent) -> JoinHandle<()> {
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = loop_tx.send(event).await;
        })
    }

    /// Drop an agent's process binding: cancel timers and kill the process
    fn unbind(&mut self, agent_id: &str) {
        if let Some(mut binding) = self.bindings.remove(agent_id) {
            binding.cancel_timers();
            binding.session.kill();
            debug!("Unbound agent {} (generation {})", agent_id, binding.generation);
        }
        self.registry
            .modify(agent_id, |agent| agent.flush_check_active = false);
    }

    fn is_current(&self, key: &SessionKey) -> bool {
        self.bindings
            .get(&key.agent_id)
            .map(|binding| binding.generation == key.generation)
            .unwrap_or(false)
    }

    fn emit(&self, event: AgentEvent) {
        debug!("Emitting event for agent {}", event.agent_id());
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    #[cfg(test)]
    fn registry(&self) -> &AgentRegistry {
        &self.registry
    }
}

fn write_command(session: &dyn ProcessSession, command: &AgentCommand) -> Result<(), SessionError> {
    match command {
        AgentCommand::Text(text) => session.write_text(text),
        AgentCommand::Control(key) => session.write_control(*key),
    }
}

fn event_kind(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Output(_) => "output",
        SessionEvent::Exited(_) => "exit",
    }
}

/// Decode a chunk of terminal output, holding back a trailing incomplete
/// UTF-8 sequence until the next chunk arrives
fn decode_utf8_chunk(carry: &mut Vec<u8>, data: &[u8]) -> String {
    carry.extend_from_slice(data);
    let mut out = String::new();
    let mut rest: &[u8] = carry;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[bad..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }

    let remaining = rest.to_vec();
    *carry = remaining;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlKey;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        spawns: Vec<(SpawnRequest, SessionKey)>,
        writes: Vec<(SessionKey, AgentCommand)>,
        kills: Vec<SessionKey>,
        running: HashMap<SessionKey, Arc<AtomicBool>>,
        exits: HashMap<SessionKey, ExitInfo>,
        fail_next: bool,
    }

    #[derive(Clone, Default)]
    struct FakeSpawner {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeSpawner {
        fn last_key(&self) -> SessionKey {
            self.state.lock().unwrap().spawns.last().unwrap().1.clone()
        }

        fn spawn_count(&self) -> usize {
            self.state.lock().unwrap().spawns.len()
        }

        fn writes(&self) -> Vec<AgentCommand> {
            self.state
                .lock()
                .unwrap()
                .writes
                .iter()
                .map(|(_, c)| c.clone())
                .collect()
        }

        /// The process is gone; its exit message has not been handled yet
        fn mark_exited(&self, key: &SessionKey, code: i32) {
            let mut state = self.state.lock().unwrap();
            state.exits.insert(
                key.clone(),
                ExitInfo {
                    code: Some(code),
                    signal: None,
                },
            );
            if let Some(flag) = state.running.get(key) {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    struct FakeSession {
        key: SessionKey,
        running: Arc<AtomicBool>,
        state: Arc<Mutex<FakeState>>,
    }

    impl ProcessSession for FakeSession {
        fn write_text(&self, text: &str) -> Result<(), SessionError> {
            self.record(AgentCommand::Text(text.to_string()))
        }

        fn write_control(&self, key: ControlKey) -> Result<(), SessionError> {
            self.record(AgentCommand::Control(key))
        }

        fn kill(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.state.lock().unwrap().kills.push(self.key.clone());
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn exit_info(&self) -> Option<ExitInfo> {
            self.state.lock().unwrap().exits.get(&self.key).copied()
        }
    }

    impl FakeSession {
        fn record(&self, command: AgentCommand) -> Result<(), SessionError> {
            if !self.is_running() {
                return Err(SessionError::SessionInactive(self.key.agent_id.clone()));
            }
            self.state
                .lock()
                .unwrap()
                .writes
                .push((self.key.clone(), command));
            Ok(())
        }
    }

    impl SessionSpawner for FakeSpawner {
        fn spawn(
            &self,
            request: &SpawnRequest,
            sink: SessionEventSink,
        ) -> Result<Box<dyn ProcessSession>, SessionError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next {
                state.fail_next = false;
                return Err(SessionError::spawn(&request.command, "command not found"));
            }
            let key = sink.key().clone();
            let running = Arc::new(AtomicBool::new(true));
            state.spawns.push((request.clone(), key.clone()));
            state.running.insert(key.clone(), Arc::clone(&running));
            Ok(Box::new(FakeSession {
                key,
                running,
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        spawner: FakeSpawner,
        events: broadcast::Receiver<AgentEvent>,
        _receivers: LoopReceivers,
    }

    impl Harness {
        fn new() -> Self {
            let spawner = FakeSpawner::default();
            let (events_tx, events) = broadcast::channel(64);
            let config = Config {
                command: vec!["claude".to_string(), "--verbose".to_string()],
                ..Config::default()
            };
            let (orchestrator, receivers) =
                Orchestrator::new(config, Box::new(spawner.clone()), events_tx);
            Self {
                orchestrator,
                spawner,
                events,
                _receivers: receivers,
            }
        }

        fn output(&mut self, key: &SessionKey, text: &str) {
            self.orchestrator.handle_session_message(SessionMessage {
                key: key.clone(),
                event: SessionEvent::Output(text.as_bytes().to_vec()),
            });
        }

        fn exit(&mut self, key: &SessionKey, code: i32) {
            self.spawner.mark_exited(key, code);
            self.orchestrator.handle_session_message(SessionMessage {
                key: key.clone(),
                event: SessionEvent::Exited(ExitInfo {
                    code: Some(code),
                    signal: None,
                }),
            });
        }

        fn deliver_task(&mut self, key: &SessionKey) {
            self.orchestrator
                .handle_loop_event(LoopEvent::DeliverTask(key.clone()));
        }

        fn live_ids(&self, conversation_id: &str) -> Vec<String> {
            self.orchestrator
                .get_active_agents_for_conversation(conversation_id)
                .into_iter()
                .filter(|a| a.state.is_live())
                .map(|a| a.id)
                .collect()
        }

        fn check(&mut self, key: &SessionKey) {
            self.orchestrator
                .handle_loop_event(LoopEvent::CheckOutput(key.clone()));
        }

        fn drain_events(&mut self) -> Vec<AgentEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn state(&self, agent_id: &str) -> AgentState {
            self.orchestrator.registry().get(agent_id).unwrap().state
        }
    }

    fn listing(lines: usize) -> String {
        (0..lines)
            .map(|i| format!("drwxr-xr-x  4 user  staff  128 Jan  1 12:00 directory_{:03}\r\n", i))
            .collect()
    }

    #[tokio::test]
    async fn test_create_spawns_configured_command() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "list files");

        assert_eq!(h.state(&id), AgentState::Active);
        let state = h.spawner.state.lock().unwrap();
        let (request, key) = &state.spawns[0];
        assert_eq!(request.command, "claude");
        assert_eq!(request.args, vec!["--verbose".to_string()]);
        assert_eq!(key.agent_id, id);
    }

    #[tokio::test]
    async fn test_single_live_agent_per_conversation() {
        let mut h = Harness::new();
        let first = h.orchestrator.create_agent("chat1", "one");
        let first_key = h.spawner.last_key();
        let second = h.orchestrator.create_agent("chat1", "two");
        let other = h.orchestrator.create_agent("chat2", "three");

        assert!(h.orchestrator.registry().get(&first).is_none());
        assert!(h.spawner.state.lock().unwrap().kills.contains(&first_key));

        let live: Vec<_> = h
            .orchestrator
            .get_active_agents_for_conversation("chat1")
            .into_iter()
            .filter(|a| a.state.is_live())
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second);
        assert_eq!(h.state(&other), AgentState::Active);
    }

    #[tokio::test]
    async fn test_task_delivered_after_startup() {
        let mut h = Harness::new();
        h.orchestrator.create_agent("chat1", "list files");
        let key = h.spawner.last_key();
        assert!(h.spawner.writes().is_empty());

        h.orchestrator
            .handle_loop_event(LoopEvent::DeliverTask(key));
        assert_eq!(
            h.spawner.writes(),
            vec![AgentCommand::Text("list files".to_string())]
        );
    }

    #[tokio::test]
    async fn test_animation_then_listing_flushes_once() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "list files");
        let key = h.spawner.last_key();

        for secs in 1..=4 {
            h.output(&key, &format!("\r\x1b[2KExploring... ({}s · esc to interrupt)", secs));
            h.check(&key);
            assert!(h.drain_events().is_empty());
        }

        let body = listing(25);
        assert!(body.chars().count() >= 1200);
        h.output(&key, &body);
        h.check(&key);
        h.check(&key);

        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::AgentOutput {
                agent_id,
                conversation_id,
                text,
            } => {
                assert_eq!(agent_id, &id);
                assert_eq!(conversation_id, "chat1");
                assert!(text.ends_with(&body));
                assert!(text.contains("esc to interrupt"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let agent = h.orchestrator.registry().get(&id).unwrap();
        assert!(agent.pending.is_empty());
    }

    #[tokio::test]
    async fn test_flushes_partition_output() {
        let mut h = Harness::new();
        h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();

        let first = listing(20);
        let second = listing(40).replace("directory", "file");
        let tail = "all done\r\n";
        h.output(&key, &first);
        h.check(&key);
        h.output(&key, &second);
        h.check(&key);
        h.output(&key, tail);
        h.exit(&key, 0);

        let flushed: String = h
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                AgentEvent::AgentOutput { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(flushed, format!("{}{}{}", first, second, tail));
    }

    #[tokio::test]
    async fn test_exit_forces_final_flush_and_completes() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "say bye");
        let key = h.spawner.last_key();

        h.output(&key, "bye\r\n");
        h.check(&key);
        assert!(h.drain_events().is_empty());

        h.exit(&key, 0);
        let events = h.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::AgentOutput { text, .. } if text == "bye\r\n"));
        assert!(matches!(
            &events[1],
            AgentEvent::AgentComplete { exit_code: Some(0), full_output, .. } if full_output == "bye\r\n"
        ));

        let agent = h.orchestrator.registry().get(&id).unwrap();
        assert_eq!(agent.state, AgentState::Completed);
        assert_eq!(agent.exit.unwrap().code, Some(0));

        // Late timer for the old binding is ignored
        h.check(&key);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_restarts_completed_agent() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "first task");
        let key = h.spawner.last_key();
        h.output(&key, "Continue? (y/n)\r\n");
        h.exit(&key, 0);
        let history_before = h.orchestrator.registry().get(&id).unwrap().history.clone();
        h.drain_events();

        h.orchestrator.send_command(&id, "y").unwrap();

        assert_eq!(h.spawner.spawn_count(), 2);
        let new_key = h.spawner.last_key();
        assert_eq!(new_key.agent_id, id);
        assert_ne!(new_key.generation, key.generation);

        let agent = h.orchestrator.registry().get(&id).unwrap();
        assert_eq!(agent.state, AgentState::Active);
        assert_eq!(agent.task, "y");
        assert_eq!(agent.history, history_before);
        assert!(agent.raw_output.is_empty());
        // Nothing was written to the dead session
        assert!(h.spawner.writes().is_empty());

        // Output from the old process no longer lands on the agent
        h.output(&key, "ghost output");
        assert!(h.orchestrator.registry().get(&id).unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_send_command_forwards_to_live_session() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();
        h.deliver_task(&key);

        h.orchestrator.send_command(&id, "run the tests").unwrap();
        h.orchestrator.send_command(&id, "ESCAPE").unwrap();
        h.orchestrator.send_command(&id, "DOWN").unwrap();

        assert_eq!(
            h.spawner.writes(),
            vec![
                AgentCommand::Text("task".to_string()),
                AgentCommand::Text("run the tests".to_string()),
                AgentCommand::Control(ControlKey::Escape),
                AgentCommand::Control(ControlKey::Down),
            ]
        );

        let history: Vec<String> = h
            .orchestrator
            .registry()
            .get(&id)
            .unwrap()
            .history
            .iter()
            .map(|entry| entry.text.clone())
            .collect();
        assert_eq!(history, vec!["task".to_string(), "run the tests".to_string()]);
    }

    #[tokio::test]
    async fn test_control_key_to_completed_agent_is_rejected() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();
        h.exit(&key, 0);

        let err = h.orchestrator.send_command(&id, "ENTER").unwrap_err();
        assert!(matches!(err, SessionError::SessionInactive(_)));
        assert_eq!(h.spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_input_during_startup_follows_task() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "list files");
        let key = h.spawner.last_key();

        h.orchestrator.send_command(&id, "and sort them").unwrap();
        h.orchestrator.send_command(&id, "ENTER").unwrap();
        assert!(h.spawner.writes().is_empty());

        h.deliver_task(&key);
        assert_eq!(
            h.spawner.writes(),
            vec![
                AgentCommand::Text("list files".to_string()),
                AgentCommand::Text("and sort them".to_string()),
                AgentCommand::Control(ControlKey::Enter),
            ]
        );

        // Once the task is out, input goes straight through
        h.orchestrator.send_command(&id, "thanks").unwrap();
        assert_eq!(h.spawner.writes().len(), 4);
    }

    #[tokio::test]
    async fn test_restart_replaces_newer_live_agent() {
        let mut h = Harness::new();
        let first = h.orchestrator.create_agent("chat1", "one");
        let first_key = h.spawner.last_key();
        h.exit(&first_key, 0);

        let second = h.orchestrator.create_agent("chat1", "two");
        let second_key = h.spawner.last_key();
        assert_eq!(h.live_ids("chat1"), vec![second.clone()]);

        h.orchestrator.send_command(&first, "again").unwrap();

        assert_eq!(h.live_ids("chat1"), vec![first.clone()]);
        assert!(h.orchestrator.registry().get(&second).is_none());
        assert!(h.spawner.state.lock().unwrap().kills.contains(&second_key));
    }

    #[tokio::test]
    async fn test_restart_flushes_exit_not_yet_handled() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "compute");
        let key = h.spawner.last_key();
        h.output(&key, "final answer: 42\r\n");
        h.check(&key);
        assert!(h.drain_events().is_empty());

        // Process is gone but its exit message is still queued
        h.spawner.mark_exited(&key, 0);
        h.orchestrator.send_command(&id, "next").unwrap();

        let events = h.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            AgentEvent::AgentOutput { text, .. } if text == "final answer: 42\r\n"
        ));
        assert!(matches!(
            &events[1],
            AgentEvent::AgentComplete { exit_code: Some(0), full_output, .. }
                if full_output == "final answer: 42\r\n"
        ));
        assert_eq!(h.state(&id), AgentState::Active);
        assert_eq!(h.spawner.spawn_count(), 2);

        // The queued exit arrives for the old binding and is ignored
        h.orchestrator.handle_session_message(SessionMessage {
            key,
            event: SessionEvent::Exited(ExitInfo {
                code: Some(0),
                signal: None,
            }),
        });
        assert!(h.drain_events().is_empty());
        assert_eq!(h.state(&id), AgentState::Active);
    }

    #[tokio::test]
    async fn test_send_command_restarts_errored_agent() {
        let mut h = Harness::new();
        h.spawner.state.lock().unwrap().fail_next = true;
        let id = h.orchestrator.create_agent("chat1", "task");
        assert_eq!(h.state(&id), AgentState::Error);
        h.drain_events();

        h.orchestrator.send_command(&id, "retry").unwrap();

        assert_eq!(h.state(&id), AgentState::Active);
        assert_eq!(h.spawner.spawn_count(), 1);
        assert_eq!(h.spawner.last_key().agent_id, id);
        assert_eq!(h.orchestrator.registry().get(&id).unwrap().task, "retry");
        assert!(h.drain_events().is_empty());
    }

    fn failing_classifier(
        _input: &DetectionInput<'_>,
        _thresholds: Thresholds,
    ) -> Result<FlushDecision, SessionError> {
        Err(SessionError::DetectionTransient(
            "pattern failed to compile".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_detection_failure_flushes_anyway() {
        let mut h = Harness::new();
        h.orchestrator.classify = failing_classifier;
        let id = h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();

        h.output(&key, "short reply\r\n");
        h.check(&key);
        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::AgentOutput { agent_id, text, .. } if agent_id == &id && text == "short reply\r\n"
        ));

        // Nothing pending, nothing to deliver
        h.check(&key);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_terminated_record() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();
        h.output(&key, "working");

        let snapshot = h.orchestrator.terminate_agent(&id).unwrap();
        assert_eq!(snapshot.state, AgentState::Terminated);
        assert_eq!(snapshot.pending_len, "working".len());
        assert!(h.orchestrator.registry().get(&id).is_none());
        assert!(h.orchestrator.terminate_agent(&id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let mut h = Harness::new();
        let err = h.orchestrator.send_command("nope", "hi").unwrap_err();
        assert!(matches!(err, SessionError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_blank_command_rejected() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "task");
        let err = h.orchestrator.send_command(&id, "  \n").unwrap_err();
        assert!(matches!(err, SessionError::InvalidCommand(_)));
        assert_eq!(h.state(&id), AgentState::Active);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error() {
        let mut h = Harness::new();
        h.spawner.state.lock().unwrap().fail_next = true;
        let id = h.orchestrator.create_agent("chat1", "task");

        assert_eq!(h.state(&id), AgentState::Error);
        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::AgentError { agent_id, error } if agent_id == &id && error.contains("command not found")
        ));
    }

    #[tokio::test]
    async fn test_kill_removes_agent_and_ignores_late_exit() {
        let mut h = Harness::new();
        let id = h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();

        assert!(h.orchestrator.kill_agent(&id));
        assert!(!h.orchestrator.kill_agent(&id));
        assert!(h.orchestrator.registry().get(&id).is_none());

        h.exit(&key, 143);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_kill_conversation_and_all() {
        let mut h = Harness::new();
        h.orchestrator.create_agent("chat1", "a");
        let key = h.spawner.last_key();
        h.exit(&key, 0);
        h.orchestrator.create_agent("chat1", "b");
        h.orchestrator.create_agent("chat2", "c");

        assert_eq!(h.orchestrator.kill_all_for_conversation("chat1"), 2);
        assert_eq!(h.orchestrator.kill_all(), 1);
        assert!(h.orchestrator.registry().is_empty());
        assert!(h.orchestrator.bindings.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_kills_stale_sessions() {
        let mut h = Harness::new();
        h.orchestrator.create_agent("chat1", "task");
        let key = h.spawner.last_key();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(h.orchestrator.sweep(Duration::from_millis(1)), 1);
        assert!(h.orchestrator.bindings.is_empty());
        assert!(h.spawner.state.lock().unwrap().kills.contains(&key));
    }

    #[test]
    fn test_decode_utf8_chunk_across_boundary() {
        let bytes = "héllo ✻".as_bytes();
        let mut carry = Vec::new();
        let split = bytes.len() - 1;
        let first = decode_utf8_chunk(&mut carry, &bytes[..split]);
        assert_eq!(first, "héllo ");
        assert_eq!(carry.len(), 2);
        let second = decode_utf8_chunk(&mut carry, &bytes[split..]);
        assert_eq!(second, "✻");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_utf8_chunk_invalid_bytes() {
        let mut carry = Vec::new();
        assert_eq!(decode_utf8_chunk(&mut carry, b"a\xffb"), "a\u{FFFD}b");
        assert!(carry.is_empty());
    }
}
