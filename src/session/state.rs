//! Session State Management
//!
//! Lifecycle status and launch context of individual agent sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Subprocess is being spawned
    Starting,
    /// Subprocess is live and accepting input
    Running,
    /// Interrupt sent; waiting to respawn
    Cancelling,
    /// No live subprocess; needs explicit recreation
    Terminated,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Complete state of a single session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Unique session identifier (one per tab)
    pub id: String,
    /// Working directory captured at creation, reused on every respawn
    pub working_directory: PathBuf,
    /// Extra environment captured at creation
    pub env: Vec<(String, String)>,
    /// Current status
    pub status: SessionStatus,
    /// Process ID if running
    pub pid: Option<u32>,
    /// Bumped on every spawn; tags output chunks
    pub generation: u64,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session last changed state
    pub last_activity: DateTime<Utc>,
    /// Error message if terminated by a failure
    pub error_message: Option<String>,
}

impl SessionState {
    /// Create a new session state
    pub fn new(
        id: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: id.into(),
            working_directory: working_directory.into(),
            env,
            status: SessionStatus::Starting,
            pid: None,
            generation: 0,
            created_at: now,
            last_activity: now,
            error_message: None,
        }
    }

    /// Update status, returning the previous one
    pub fn set_status(&mut self, status: SessionStatus) -> SessionStatus {
        let old_status = self.status;
        self.status = status;
        self.last_activity = Utc::now();
        old_status
    }

    /// Mark session as running with a freshly spawned process
    pub fn set_running(&mut self, pid: u32, generation: u64) -> SessionStatus {
        self.pid = Some(pid);
        self.generation = generation;
        self.error_message = None;
        self.set_status(SessionStatus::Running)
    }

    /// Mark session as terminated, optionally recording why
    pub fn set_terminated(&mut self, error: Option<String>) -> SessionStatus {
        self.pid = None;
        if error.is_some() {
            self.error_message = error;
        }
        self.set_status(SessionStatus::Terminated)
    }

    /// Check if session can receive input
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Check if session is terminal (finished)
    pub fn is_terminal(&self) -> bool {
        self.status == SessionStatus::Terminated
    }

    /// Get session age in seconds
    pub fn duration_secs(&self) -> i64 {
        (self.last_activity - self.created_at).num_seconds()
    }
}

/// Serializable session info for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub working_directory: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub generation: u64,
    pub created_at: String,
    pub last_activity: String,
    pub error_message: Option<String>,
    pub duration_secs: i64,
}

impl From<&SessionState> for SessionInfo {
    fn from(state: &SessionState) -> Self {
        Self {
            id: state.id.clone(),
            working_directory: state.working_directory.display().to_string(),
            status: state.status,
            pid: state.pid,
            generation: state.generation,
            created_at: state.created_at.to_rfc3339(),
            last_activity: state.last_activity.to_rfc3339(),
            error_message: state.error_message.clone(),
            duration_secs: state.duration_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_creation() {
        let state = SessionState::new("test-123", "/path/to/project", Vec::new());
        assert_eq!(state.id, "test-123");
        assert_eq!(state.status, SessionStatus::Starting);
        assert!(!state.is_active());
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_session_status_transitions() {
        let mut state = SessionState::new("test", "/path", Vec::new());

        let old = state.set_running(12345, 1);
        assert_eq!(old, SessionStatus::Starting);
        assert_eq!(state.pid, Some(12345));
        assert!(state.is_active());

        state.set_status(SessionStatus::Cancelling);
        assert!(!state.is_active());

        state.set_terminated(Some("respawn failed".to_string()));
        assert!(state.pid.is_none());
        assert!(state.is_terminal());
        assert_eq!(state.error_message.as_deref(), Some("respawn failed"));
    }

    #[test]
    fn test_info_snapshot() {
        let mut state = SessionState::new("tab", "/work", vec![("K".into(), "V".into())]);
        state.set_running(7, 3);
        let info = SessionInfo::from(&state);
        assert_eq!(info.working_directory, "/work");
        assert_eq!(info.generation, 3);
        assert_eq!(info.status, SessionStatus::Running);
        assert_eq!(SessionStatus::Cancelling.to_string(), "cancelling");
    }
}
