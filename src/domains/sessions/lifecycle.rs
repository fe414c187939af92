use anyhow::anyhow;
use chrono::Utc;
use log::info;

use crate::domains::issues::IssueStatus;
use crate::domains::sessions::db_sessions::{SessionMethods, StatusChange};
use crate::domains::sessions::entity::{Session, SessionStatus};
use crate::domains::sessions::errors::{SessionError, SessionResult};
use crate::domains::sessions::service::SessionManager;
use crate::infrastructure::database::is_constraint_violation;

impl SessionManager {
    /// Moves a live session to Idle, Completed or Abandoned.
    pub fn close(&self, session_id: &str, target: SessionStatus) -> SessionResult<Session> {
        self.close_with_outcome(session_id, target, None)
    }

    pub(crate) fn close_with_outcome(
        &self,
        session_id: &str,
        target: SessionStatus,
        outcome: Option<&str>,
    ) -> SessionResult<Session> {
        if target == SessionStatus::Active {
            return Err(anyhow!("cannot close session {session_id} into {target}").into());
        }

        let session = self.get_session(session_id)?;
        if session.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                id: session.id,
                status: session.status,
            });
        }

        // Stale purge decisions rely on an accurate commit count
        self.refresh_snapshot_quietly(&session);

        let mut change = StatusChange::to(target);
        if target.is_terminal() {
            change = change.ended(Utc::now());
        }
        if let Some(outcome) = outcome {
            change = change.with_outcome(outcome);
        }

        if !self
            .db
            .transition_session(session_id, &SessionStatus::LIVE, &change)?
        {
            let current = self.get_session(session_id)?;
            return Err(SessionError::InvalidTransition {
                id: current.id,
                status: current.status,
            });
        }

        info!(
            "Session {session_id} ({}) moved {} -> {target}",
            session.branch, session.status
        );

        match target {
            SessionStatus::Completed => {
                self.cascade_issue(&session, IssueStatus::Done, Some(IssueStatus::InProgress))
            }
            SessionStatus::Abandoned => {
                self.cascade_issue(&session, IssueStatus::Open, Some(IssueStatus::InProgress))
            }
            _ => {}
        }

        self.get_session(session_id)
    }

    /// Brings a Completed or Abandoned session back as Idle.
    pub fn reactivate(&self, session_id: &str) -> SessionResult<Session> {
        let session = self.get_session(session_id)?;
        if session.status.is_live() {
            return Err(SessionError::AlreadyLive {
                id: session.id,
                status: session.status,
            });
        }

        if !session.worktree().is_some_and(|p| p.is_dir()) {
            return Err(SessionError::MissingWorktree {
                id: session.id,
                path: session.worktree_path,
            });
        }

        let change = StatusChange::to(SessionStatus::Idle).touched(Utc::now());
        let applied = match self
            .db
            .transition_session(session_id, &SessionStatus::TERMINAL, &change)
        {
            Ok(applied) => applied,
            Err(e) if is_constraint_violation(&e) => {
                return Err(SessionError::DuplicateSession {
                    project_id: session.project_id,
                    branch: session.branch,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !applied {
            let current = self.get_session(session_id)?;
            return Err(SessionError::AlreadyLive {
                id: current.id,
                status: current.status,
            });
        }

        info!("Session {session_id} ({}) reactivated", session.branch);
        self.cascade_issue(&session, IssueStatus::InProgress, None);

        self.get_session(session_id)
    }
}
