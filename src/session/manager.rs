//! Session Supervisor
//!
//! Registry of agent sessions keyed by id (one per tab). Lifecycle
//! operations on an id are serialized by that session's process lock;
//! status reads and stdin writes never wait on it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::events::{Notice, StatusChange};
use super::process::{ManagedProcess, StdinWriter};
use super::state::{SessionInfo, SessionState, SessionStatus};
use crate::config::{AgentConfig, PipelineConfig};
use crate::error::PipelineError;
use crate::router::OutputRouter;

/// Capacity of the status change broadcast channel
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// One registered session
struct SessionSlot {
    state: Mutex<SessionState>,
    /// Stdin of the running generation; locked after `state`, never across an await
    input: Mutex<Option<StdinWriter>>,
    /// Held for the whole of every lifecycle operation on this session
    process: tokio::sync::Mutex<Option<ManagedProcess>>,
}

impl SessionSlot {
    fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
            input: Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Detach and close the current stdin writer
    fn close_input(&self) {
        if let Some(writer) = self.input.lock().take() {
            writer.close();
        }
    }
}

/// Result of a successful cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// The process ignored the interrupt and had to be killed
    pub forced: bool,
    /// Generation of the respawned process
    pub generation: u64,
    /// PID of the respawned process
    pub pid: u32,
}

/// Owns every agent subprocess
pub struct SessionSupervisor {
    sessions: Arc<DashMap<String, Arc<SessionSlot>>>,
    router: Arc<OutputRouter>,
    agent: AgentConfig,
    grace_period: Duration,
    max_sessions: usize,
    next_generation: AtomicU64,
    status_tx: broadcast::Sender<StatusChange>,
}

impl SessionSupervisor {
    pub fn new(config: &PipelineConfig, router: Arc<OutputRouter>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(DashMap::new()),
            router,
            agent: config.agent.clone(),
            grace_period: config.grace_period(),
            max_sessions: config.max_sessions,
            next_generation: AtomicU64::new(1),
            status_tx,
        }
    }

    pub fn router(&self) -> &Arc<OutputRouter> {
        &self.router
    }

    /// Subscribe to status transitions of every session
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Spawn the agent in `working_directory` and register it under `session_id`.
    ///
    /// An id whose session is terminated is replaced; a live one is rejected.
    /// On spawn failure nothing stays registered and a session error notice is emitted.
    pub async fn create_session(
        &self,
        session_id: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Result<SessionInfo, SessionError> {
        let session_id = session_id.into();
        let working_directory = working_directory.into();

        // Check capacity before taking a shard lock in `entry`
        if !self.sessions.contains_key(&session_id) && self.sessions.len() >= self.max_sessions {
            self.cleanup_terminal_sessions();
            if self.sessions.len() >= self.max_sessions {
                return Err(SessionError::MaxSessionsReached(self.max_sessions));
            }
        }

        let slot = Arc::new(SessionSlot::new(SessionState::new(
            &session_id,
            &working_directory,
            env.clone(),
        )));
        let mut process = slot.process.lock().await;

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().state.lock().is_terminal() {
                    return Err(SessionError::SessionExists(session_id));
                }
                debug!("Replacing terminated session {}", session_id);
                entry.insert(Arc::clone(&slot));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&slot));
            }
        }

        let lane = self.router.open_lane(&session_id);
        let generation = self.next_generation();
        lane.arm(generation);

        match ManagedProcess::spawn(
            &session_id,
            generation,
            &self.agent,
            &working_directory,
            &env,
            Arc::clone(&self.router),
        ) {
            Ok(spawned) => {
                let (old_status, session_info) = {
                    let mut state = slot.state.lock();
                    let old = state.set_running(spawned.pid, generation);
                    *slot.input.lock() = Some(spawned.writer());
                    (old, SessionInfo::from(&*state))
                };
                *process = Some(spawned);
                self.publish(&session_id, old_status, SessionStatus::Running);
                info!("Created session: {}", session_id);
                Ok(session_info)
            }
            Err(err) => {
                let old_status = slot.state.lock().set_terminated(Some(err.to_string()));
                self.router.close_lane(&session_id);
                self.sessions
                    .remove_if(&session_id, |_, registered| Arc::ptr_eq(registered, &slot));
                self.publish(&session_id, old_status, SessionStatus::Terminated);

                error!("Failed to create session {}: {}", session_id, err);
                self.router
                    .notify(&session_id, Notice::session_error(&session_id, &err));
                Err(SessionError::Spawn {
                    session_id,
                    source: err,
                })
            }
        }
    }

    /// Write a line of input to the agent.
    ///
    /// Returns `Ok(false)` when the input was dropped because the session
    /// was not running or the write failed. Input is never queued. The
    /// write does not hold the lifecycle lock; a cancel or destroy that
    /// starts meanwhile aborts it and the input is dropped.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<bool, SessionError> {
        let slot = self.slot(session_id)?;

        let (status, writer) = {
            let state = slot.state.lock();
            (state.status, slot.input.lock().clone())
        };
        if status != SessionStatus::Running {
            self.drop_input(session_id, format!("session is {}", status));
            return Ok(false);
        }
        let Some(writer) = writer else {
            self.drop_input(session_id, "agent input is closed");
            return Ok(false);
        };

        match writer.write_line(text).await {
            Ok(()) => {
                debug!("Sent {} bytes to session {}", text.len(), session_id);
                Ok(true)
            }
            Err(_) if writer.is_closed() => {
                self.drop_input(session_id, "agent input was closed mid-write");
                Ok(false)
            }
            Err(e) => {
                self.drop_input(session_id, format!("agent stdin closed ({})", e));
                Ok(false)
            }
        }
    }

    /// Close the agent's stdin and wait up to `wait` for it to exit and its
    /// output to reach the lane. Returns true if the agent exited in time.
    ///
    /// Later input is dropped; the session stays registered until destroyed.
    pub async fn end_input(&self, session_id: &str, wait: Duration) -> Result<bool, SessionError> {
        let slot = self.slot(session_id)?;
        slot.close_input();

        let mut process = slot.process.lock().await;
        match process.as_mut() {
            Some(process) => {
                let exited = process.finish_output(wait).await;
                info!("Closed input of session {} (exited: {})", session_id, exited);
                Ok(exited)
            }
            None => Ok(false),
        }
    }

    /// Interrupt the agent and respawn it in the same working directory.
    ///
    /// The session's lane is muted while the old process dies and re-armed
    /// with the new generation before the replacement starts. If the
    /// respawn fails the session is left terminated.
    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome, SessionError> {
        let slot = self.slot(session_id)?;
        let mut process = slot.process.lock().await;

        if !self.is_registered(session_id, &slot) {
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        }

        let (working_directory, env, old_status) = {
            let mut state = slot.state.lock();
            if state.is_terminal() {
                return Err(SessionError::SessionNotActive(
                    session_id.to_string(),
                    state.status,
                ));
            }
            let old = state.set_status(SessionStatus::Cancelling);
            if let Some(writer) = slot.input.lock().take() {
                writer.close();
            }
            (state.working_directory.clone(), state.env.clone(), old)
        };
        self.publish(session_id, old_status, SessionStatus::Cancelling);
        info!("Cancelling session: {}", session_id);

        let lane = self.router.lane(session_id);
        if let Some(lane) = &lane {
            lane.mute();
        }

        let mut forced = false;
        if let Some(mut old) = process.take() {
            forced = self.stop(session_id, &mut old).await;
        }

        let generation = self.next_generation();
        if let Some(lane) = &lane {
            lane.arm(generation);
        }

        match ManagedProcess::spawn(
            session_id,
            generation,
            &self.agent,
            &working_directory,
            &env,
            Arc::clone(&self.router),
        ) {
            Ok(spawned) => {
                let pid = spawned.pid;
                let old_status = {
                    let mut state = slot.state.lock();
                    let old = state.set_running(pid, generation);
                    *slot.input.lock() = Some(spawned.writer());
                    old
                };
                *process = Some(spawned);
                self.publish(session_id, old_status, SessionStatus::Running);
                info!("Session {} restarted (generation {})", session_id, generation);
                Ok(CancelOutcome {
                    forced,
                    generation,
                    pid,
                })
            }
            Err(err) => {
                if let Some(lane) = &lane {
                    lane.mute();
                }
                let old_status = slot.state.lock().set_terminated(Some(err.to_string()));
                self.publish(session_id, old_status, SessionStatus::Terminated);
                error!("Failed to restart session {}: {}", session_id, err);
                Err(SessionError::RespawnFailed {
                    session_id: session_id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Terminate and unregister a session. Returns false if it did not exist.
    ///
    /// The session stays registered until its process is dead, so
    /// `live_pids` never hides a running agent.
    pub async fn destroy_session(&self, session_id: &str) -> bool {
        let Ok(slot) = self.slot(session_id) else {
            return false;
        };
        slot.close_input();

        // Waits out any in-flight spawn or cancel
        let mut process = slot.process.lock().await;
        if let Some(mut running) = process.take() {
            if let Err(e) = running.kill().await {
                error!("Error killing process for session {}: {}", session_id, e);
            }
        }

        let old_status = {
            let mut state = slot.state.lock();
            slot.input.lock().take();
            state.set_terminated(None)
        };

        // The id may already belong to a newer session; its lane is not ours
        let removed = self
            .sessions
            .remove_if(session_id, |_, registered| Arc::ptr_eq(registered, &slot))
            .is_some();
        if removed {
            self.router.close_lane(session_id);
        }

        let was_live = old_status != SessionStatus::Terminated;
        if was_live {
            self.publish(session_id, old_status, SessionStatus::Terminated);
        }
        if removed || was_live {
            info!("Destroyed session: {}", session_id);
        }
        removed || was_live
    }

    /// Destroy every registered session, including ones mid-cancel
    pub async fn teardown_all(&self) {
        let session_ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        info!("Tearing down {} sessions...", session_ids.len());

        join_all(session_ids.iter().map(|id| self.destroy_session(id))).await;

        info!("All sessions torn down");
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|s| s.state.lock().status)
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|s| SessionInfo::from(&*s.state.lock()))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|s| SessionInfo::from(&*s.state.lock()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// PIDs of every registered session with a process
    pub fn live_pids(&self) -> Vec<u32> {
        self.sessions
            .iter()
            .filter_map(|s| s.state.lock().pid)
            .collect()
    }

    /// Unregister sessions left terminated by a failed respawn
    pub fn cleanup_terminal_sessions(&self) -> usize {
        let terminal_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.state.lock().is_terminal())
            .map(|s| s.key().clone())
            .collect();

        let mut removed = 0;
        for id in terminal_ids {
            if self
                .sessions
                .remove_if(&id, |_, slot| slot.state.lock().is_terminal())
                .is_some()
            {
                self.router.close_lane(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleaned up {} terminated sessions", removed);
        }
        removed
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    fn is_registered(&self, session_id: &str, slot: &Arc<SessionSlot>) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| Arc::ptr_eq(s.value(), slot))
            .unwrap_or(false)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop a process for restart; returns true if it had to be killed
    async fn stop(&self, session_id: &str, process: &mut ManagedProcess) -> bool {
        match process.terminate(self.grace_period).await {
            Ok(false) => false,
            Ok(true) => {
                let timeout = PipelineError::InterruptTimeout {
                    session_id: session_id.to_string(),
                    grace_ms: self.grace_period.as_millis() as u64,
                };
                warn!("{}; killed pid {}", timeout, process.pid);
                true
            }
            Err(e) => {
                error!("Error stopping process for session {}: {}", session_id, e);
                if let Err(e) = process.kill().await {
                    error!("Error killing process for session {}: {}", session_id, e);
                }
                true
            }
        }
    }

    fn drop_input(&self, session_id: &str, reason: impl std::fmt::Display) {
        warn!("Dropped input for session {}: {}", session_id, reason);
        self.router.notify(session_id, Notice::input_dropped(reason));
    }

    fn publish(&self, session_id: &str, old_status: SessionStatus, new_status: SessionStatus) {
        debug!("Session {}: {} -> {}", session_id, old_status, new_status);
        // No subscribers is fine
        let _ = self.status_tx.send(StatusChange {
            session_id: session_id.to_string(),
            old_status,
            new_status,
        });
    }
}

/// Session supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to start session {session_id}: {source}")]
    Spawn {
        session_id: String,
        source: PipelineError,
    },

    #[error("Failed to restart session {session_id}: {source}")]
    RespawnFailed {
        session_id: String,
        source: PipelineError,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Maximum sessions reached: {0}")]
    MaxSessionsReached(usize),

    #[error("Session {0} is {1}")]
    SessionNotActive(String, SessionStatus),
}

impl SessionError {
    /// Errors the user is told about with a notice
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::RespawnFailed { .. })
    }
}

impl From<SessionError> for String {
    fn from(err: SessionError) -> Self {
        err.to_string()
    }
}
