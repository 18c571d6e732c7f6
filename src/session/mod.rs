//! Session Management Module
//!
//! Agent subprocess lifecycle, one session per tab:
//! - Concurrent registry with per-session serialized lifecycle operations
//! - Process groups so interrupts reach the agent's children
//! - Generation-tagged output so a restarted agent never mixes with the old one

pub mod events;
pub mod manager;
pub mod process;
pub mod state;

pub use events::{ChannelSink, DisplayEvent, DisplayPayload, DisplaySink, Notice, NoticeKind, StatusChange};
pub use manager::{CancelOutcome, SessionError, SessionSupervisor};
pub use state::{SessionInfo, SessionState, SessionStatus};
