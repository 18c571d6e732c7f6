//! Cancellation Controller
//!
//! Turns a user cancel into the ordered sequence that leaves the tab clean:
//! stop playback, drop formatter state, restart the agent, then tell the user.

use log::{error, info};
use std::sync::Arc;

use crate::error::PipelineResult;
use crate::router::OutputRouter;
use crate::session::events::Notice;
use crate::session::manager::{CancelOutcome, SessionError, SessionSupervisor};

pub struct CancellationController {
    supervisor: Arc<SessionSupervisor>,
    router: Arc<OutputRouter>,
}

impl CancellationController {
    pub fn new(supervisor: Arc<SessionSupervisor>) -> Self {
        let router = Arc::clone(supervisor.router());
        Self { supervisor, router }
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Cancel whatever the session is doing and restart its agent.
    ///
    /// Nothing formatted before the cancel is displayed after it. On a
    /// failed respawn the session is left terminated and the user gets an
    /// error notice.
    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome, SessionError> {
        if let Some(lane) = self.router.lane(session_id) {
            lane.mute();
            let dropped = lane.playback().clear();
            lane.reset_formatter();
            info!("Cancel on session {}: dropped {} queued items", session_id, dropped);
        }

        match self.supervisor.cancel(session_id).await {
            Ok(outcome) => {
                self.router.notify(session_id, Notice::cancelled());
                Ok(outcome)
            }
            Err(err) => {
                if err.is_user_visible() {
                    self.router
                        .notify(session_id, Notice::session_error(session_id, &err));
                }
                error!("Cancel of session {} failed: {}", session_id, err);
                Err(err)
            }
        }
    }

    /// Show everything queued for the session now
    pub fn skip(&self, session_id: &str) -> PipelineResult<usize> {
        self.router.skip(session_id)
    }
}
