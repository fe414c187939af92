use chrono::Utc;
use log::{debug, info, warn};

use crate::domains::sessions::db_sessions::{SessionMethods, StatusChange};
use crate::domains::sessions::entity::{Session, SessionStatus};
use crate::domains::sessions::errors::{SessionError, SessionResult};
use crate::domains::sessions::service::SessionManager;
use crate::infrastructure::database::is_constraint_violation;

impl SessionManager {
    /// Brings recorded statuses in line with the filesystem and running agents.
    ///
    /// Returns the number of transitions applied. Per-session failures are
    /// logged and skipped so one broken record never blocks the rest.
    pub async fn reconcile(&self, sessions: &[Session]) -> usize {
        let mut transitions = 0;
        for session in sessions {
            match self.reconcile_one(session).await {
                Ok(true) => transitions += 1,
                Ok(false) => {}
                Err(e) => warn!("Reconcile failed for session {}: {e}", session.id),
            }
        }
        transitions
    }

    async fn reconcile_one(&self, session: &Session) -> SessionResult<bool> {
        if session.status == SessionStatus::Completed {
            return Ok(false);
        }
        let Some(worktree) = session.worktree() else {
            return Ok(false);
        };
        let exists = worktree.is_dir();

        if !exists && session.is_live() {
            info!(
                "Worktree {} for session {} is gone, abandoning",
                worktree.display(),
                session.id
            );
            return match self.close(&session.id, SessionStatus::Abandoned) {
                Ok(_) => Ok(true),
                Err(SessionError::InvalidTransition { .. }) => Ok(false),
                Err(e) => Err(e),
            };
        }

        if exists && session.status == SessionStatus::Abandoned {
            let change = StatusChange::to(SessionStatus::Idle).touched(Utc::now());
            return match self
                .db
                .transition_session(&session.id, &[SessionStatus::Abandoned], &change)
            {
                Ok(applied) => {
                    if applied {
                        info!(
                            "Worktree for abandoned session {} reappeared, marking idle",
                            session.id
                        );
                    }
                    Ok(applied)
                }
                Err(e) if is_constraint_violation(&e) => {
                    warn!(
                        "Not reviving session {}: branch '{}' already has a live session",
                        session.id, session.branch
                    );
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            };
        }

        let Some(detector) = self.detector.as_ref() else {
            return Ok(false);
        };
        if !exists || !session.is_live() {
            return Ok(false);
        }

        let running = detector.is_agent_running(worktree).await;
        let change = match (session.status, running) {
            (SessionStatus::Idle, true) => {
                StatusChange::to(SessionStatus::Active).touched(Utc::now())
            }
            (SessionStatus::Active, false) => StatusChange::to(SessionStatus::Idle),
            _ => return Ok(false),
        };

        let applied = self
            .db
            .transition_session(&session.id, &[session.status], &change)?;
        if applied {
            debug!(
                "Agent {} in {}, session {} now {}",
                if running { "detected" } else { "gone" },
                worktree.display(),
                session.id,
                change.status
            );
        }
        Ok(applied)
    }
}
