use chrono::Utc;
use log::{info, warn};
use serde::Serialize;

use crate::domains::git::operations::is_valid_branch_name;
use crate::domains::issues::{IssueMethods, IssueStatus};
use crate::domains::projects::Project;
use crate::domains::sessions::db_sessions::{SessionMethods, StatusChange};
use crate::domains::sessions::entity::{Session, SessionStatus};
use crate::domains::sessions::errors::{SessionError, SessionResult};
use crate::domains::sessions::service::SessionManager;
use crate::domains::worktree::{DeleteOptions, TerminalHandle};
use crate::infrastructure::database::is_constraint_violation;

#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub session: Session,
    pub resumed: bool,
    pub handle: Option<TerminalHandle>,
    // Set when the session exists but its terminal could not be opened
    pub terminal_error: Option<String>,
}

impl SessionManager {
    /// Starts a session on `branch`, or resumes the idle one already there.
    pub fn launch(
        &self,
        project_id: &str,
        branch: &str,
        issue_id: Option<&str>,
    ) -> SessionResult<LaunchOutcome> {
        if !is_valid_branch_name(branch) {
            return Err(SessionError::InvalidBranch(branch.to_string()));
        }
        let project = self.get_project(project_id)?;

        if let Some(issue_id) = issue_id {
            let issue = self
                .db
                .get_issue(issue_id)?
                .ok_or_else(|| SessionError::IssueNotFound(issue_id.to_string()))?;
            if issue.project_id != project.id {
                return Err(SessionError::IssueProjectMismatch {
                    issue_id: issue.id,
                    project_id: project.id,
                });
            }
        }

        match self.db.find_live_session(&project.id, branch)? {
            Some(existing) if existing.status == SessionStatus::Active => {
                Err(SessionError::AlreadyActive {
                    session_id: existing.id,
                    branch: existing.branch,
                })
            }
            Some(existing) => self.resume(existing),
            None => self.start(&project, branch, issue_id),
        }
    }

    fn resume(&self, session: Session) -> SessionResult<LaunchOutcome> {
        let Some(worktree) = session.worktree().filter(|p| p.is_dir()) else {
            return Err(SessionError::MissingWorktree {
                id: session.id,
                path: session.worktree_path,
            });
        };

        let change = StatusChange::to(SessionStatus::Active).touched(Utc::now());
        if !self
            .db
            .transition_session(&session.id, &[SessionStatus::Idle], &change)?
        {
            let current = self.get_session(&session.id)?;
            return Err(match current.status {
                SessionStatus::Active => SessionError::AlreadyActive {
                    session_id: current.id,
                    branch: current.branch,
                },
                status => SessionError::InvalidTransition {
                    id: current.id,
                    status,
                },
            });
        }

        // Only the caller that won the transition starts an agent
        let handle = match self.provider.open(worktree) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to open terminal for session {}: {e}", session.id);
                let revert = StatusChange::to(SessionStatus::Idle);
                if let Err(revert_err) =
                    self.db
                        .transition_session(&session.id, &[SessionStatus::Active], &revert)
                {
                    warn!(
                        "Failed to return session {} to idle: {revert_err}",
                        session.id
                    );
                }
                return Err(e.into());
            }
        };

        info!(
            "Resumed session {} on '{}' in {}",
            session.id,
            session.branch,
            worktree.display()
        );

        Ok(LaunchOutcome {
            session: self.get_session(&session.id)?,
            resumed: true,
            handle: Some(handle),
            terminal_error: None,
        })
    }

    fn start(
        &self,
        project: &Project,
        branch: &str,
        issue_id: Option<&str>,
    ) -> SessionResult<LaunchOutcome> {
        self.db
            .delete_stale_sessions(Some(&project.id), Some(branch), self.stale_threshold_secs)?;

        let worktree_path = match self
            .provider
            .create(&project.path, branch, &project.base_branch)
        {
            Ok(path) => path,
            Err(e) => {
                // A concurrent launch may have claimed the same worktree first
                if self.db.find_live_session(&project.id, branch)?.is_some() {
                    return Err(SessionError::DuplicateSession {
                        project_id: project.id.clone(),
                        branch: branch.to_string(),
                    });
                }
                return Err(e.into());
            }
        };

        let session = Session::new(
            &project.id,
            branch,
            worktree_path.clone(),
            issue_id.map(str::to_string),
            SessionStatus::Active,
        );

        if let Err(e) = self.db.create_session(&session) {
            if is_constraint_violation(&e) {
                // The winner owns this worktree now; leave it in place
                return Err(SessionError::DuplicateSession {
                    project_id: project.id.clone(),
                    branch: branch.to_string(),
                });
            }
            self.roll_back_worktree(project, &worktree_path, branch);
            return Err(e.into());
        }

        info!(
            "Started session {} on '{branch}' at {}",
            session.id,
            worktree_path.display()
        );

        self.cascade_issue(&session, IssueStatus::InProgress, None);

        let (handle, terminal_error) = match self.provider.open(&worktree_path) {
            Ok(handle) => (Some(handle), None),
            Err(e) => {
                warn!("Failed to open terminal for session {}: {e}", session.id);
                (None, Some(e.to_string()))
            }
        };

        Ok(LaunchOutcome {
            session: self.get_session(&session.id)?,
            resumed: false,
            handle,
            terminal_error,
        })
    }

    fn roll_back_worktree(&self, project: &Project, worktree_path: &std::path::Path, branch: &str) {
        // Reused worktrees may still back a historical record
        match self
            .db
            .list_sessions_by_worktree_paths(&[worktree_path.to_path_buf()])
        {
            Ok(records) if !records.is_empty() => {
                info!(
                    "Keeping worktree {} referenced by {} existing record(s)",
                    worktree_path.display(),
                    records.len()
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Could not check references to {}, keeping it: {e}",
                    worktree_path.display()
                );
                return;
            }
        }

        let opts = DeleteOptions {
            force: true,
            delete_branch: false,
            branch: Some(branch.to_string()),
        };
        if let Err(e) = self.provider.delete(&project.path, worktree_path, &opts) {
            warn!(
                "Failed to roll back worktree {}: {e}",
                worktree_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Barrier};

    use anyhow::anyhow;

    use super::*;
    use crate::domains::git::CliGitAdapter;
    use crate::domains::projects::ProjectMethods;
    use crate::domains::sessions::entity::SessionFilter;
    use crate::domains::sessions::test_support::TestEnv;
    use crate::domains::worktree::provider::MockWorktreeProvider;

    fn handle_for(path: &std::path::Path) -> TerminalHandle {
        TerminalHandle {
            worktree_path: path.to_path_buf(),
            pid: None,
            command: format!("cd {} && claude", path.display()),
            opened_at: Utc::now(),
        }
    }

    fn manager_with(env: &TestEnv, provider: MockWorktreeProvider) -> SessionManager {
        SessionManager::new(
            env.db.clone(),
            Arc::new(CliGitAdapter::new()),
            Arc::new(provider),
        )
    }

    #[test]
    fn launch_creates_worktree_and_marks_issue_in_progress() {
        let env = TestEnv::new();
        let issue = env.create_issue(IssueStatus::Open);

        let outcome = env
            .manager
            .launch(&env.project.id, "feature/login", Some(&issue.id))
            .unwrap();
        assert!(!outcome.resumed);
        assert_eq!(outcome.session.status, SessionStatus::Active);
        assert_eq!(
            outcome.session.worktree_path,
            env.temp.path().canonicalize().unwrap().join("widgets-feature-login")
        );
        assert!(outcome.session.worktree_path.is_dir());
        assert!(outcome.handle.unwrap().command.ends_with("&& claude"));
        assert!(outcome.terminal_error.is_none());
        assert_eq!(env.issue_status(&issue.id), IssueStatus::InProgress);
    }

    #[test]
    fn launch_resumes_idle_session() {
        let env = TestEnv::new();
        let first = env.launch("feature/x");
        env.manager.close(&first.id, SessionStatus::Idle).unwrap();

        let outcome = env
            .manager
            .launch(&env.project.id, "feature/x", None)
            .unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.session.id, first.id);
        assert_eq!(outcome.session.status, SessionStatus::Active);
        assert!(outcome.session.last_active_at >= first.last_active_at);
    }

    #[test]
    fn launch_on_active_branch_is_rejected() {
        let env = TestEnv::new();
        let first = env.launch("feature/x");

        match env.manager.launch(&env.project.id, "feature/x", None) {
            Err(SessionError::AlreadyActive { session_id, .. }) => {
                assert_eq!(session_id, first.id)
            }
            other => panic!("expected AlreadyActive, got {other:?}"),
        }
    }

    #[test]
    fn resume_with_missing_worktree_does_not_fall_through_to_create() {
        let env = TestEnv::new();
        let first = env.launch("feature/x");
        env.manager.close(&first.id, SessionStatus::Idle).unwrap();
        std::fs::remove_dir_all(&first.worktree_path).unwrap();

        assert!(matches!(
            env.manager.launch(&env.project.id, "feature/x", None),
            Err(SessionError::MissingWorktree { .. })
        ));
        let all = env
            .db
            .list_sessions(&SessionFilter::for_project(&env.project.id))
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn launch_validates_inputs() {
        let env = TestEnv::new();
        assert!(matches!(
            env.manager.launch(&env.project.id, "bad branch", None),
            Err(SessionError::InvalidBranch(_))
        ));
        assert!(matches!(
            env.manager.launch("nope", "feature/x", None),
            Err(SessionError::ProjectNotFound(_))
        ));
        assert!(matches!(
            env.manager.launch(&env.project.id, "feature/x", Some("missing")),
            Err(SessionError::IssueNotFound(_))
        ));

        let other = env
            .db
            .get_or_create_project(&env.temp.path().join("other"), None)
            .unwrap();
        let mut foreign = crate::domains::issues::Issue::new(&other.id, "Elsewhere");
        foreign.status = IssueStatus::Open;
        env.db.create_issue(&foreign).unwrap();
        assert!(matches!(
            env.manager.launch(&env.project.id, "feature/x", Some(&foreign.id)),
            Err(SessionError::IssueProjectMismatch { .. })
        ));
    }

    #[test]
    fn relaunch_purges_short_lived_empty_history() {
        let env = TestEnv::new();
        let first = env.launch("feature/x");
        env.manager
            .close(&first.id, SessionStatus::Abandoned)
            .unwrap();

        let second = env.launch("feature/x");
        assert_ne!(first.id, second.id);
        assert!(env.db.get_session(&first.id).unwrap().is_none());
    }

    #[test]
    fn relaunch_keeps_history_with_commits() {
        let env = TestEnv::new();
        let first = env.launch("feature/x");
        crate::domains::sessions::test_support::commit_file(
            &first.worktree_path,
            "work.txt",
            "work",
            "real work",
        );
        env.manager
            .close(&first.id, SessionStatus::Completed)
            .unwrap();

        let second = env.launch("feature/x");
        assert_eq!(second.worktree_path, first.worktree_path, "worktree reused");
        assert!(env.db.get_session(&first.id).unwrap().is_some());
    }

    #[test]
    fn terminal_failure_is_reported_not_fatal() {
        let env = TestEnv::new();
        let worktree = env.temp.path().join("widgets-feature-x");
        std::fs::create_dir_all(&worktree).unwrap();

        let mut provider = MockWorktreeProvider::new();
        let created = worktree.clone();
        provider
            .expect_create()
            .returning(move |_, _, _| Ok(created.clone()));
        provider
            .expect_open()
            .returning(|_| Err(anyhow!("no terminal available")));

        let manager = manager_with(&env, provider);
        let outcome = manager.launch(&env.project.id, "feature/x", None).unwrap();
        assert_eq!(outcome.session.status, SessionStatus::Active);
        assert!(outcome.handle.is_none());
        assert_eq!(
            outcome.terminal_error.as_deref(),
            Some("no terminal available")
        );
    }

    #[test]
    fn resume_that_loses_the_transition_opens_no_terminal() {
        let env = TestEnv::new();
        let session = env.launch("feature/x");
        // Snapshot taken while idle; another launch has since activated it
        let mut stale = session.clone();
        stale.status = SessionStatus::Idle;

        let mut provider = MockWorktreeProvider::new();
        provider.expect_open().never();
        let manager = manager_with(&env, provider);

        match manager.resume(stale) {
            Err(SessionError::AlreadyActive { session_id, .. }) => {
                assert_eq!(session_id, session.id)
            }
            other => panic!("expected AlreadyActive, got {other:?}"),
        }
    }

    #[test]
    fn resume_terminal_failure_leaves_session_idle() {
        let env = TestEnv::new();
        let session = env.launch("feature/x");
        env.manager.close(&session.id, SessionStatus::Idle).unwrap();

        let mut provider = MockWorktreeProvider::new();
        provider
            .expect_open()
            .times(1)
            .returning(|_| Err(anyhow!("no terminal available")));
        let manager = manager_with(&env, provider);

        assert!(manager.launch(&env.project.id, "feature/x", None).is_err());
        assert_eq!(
            env.manager.get_session(&session.id).unwrap().status,
            SessionStatus::Idle
        );
    }

    #[test]
    fn provider_failure_creates_no_record() {
        let env = TestEnv::new();
        let mut provider = MockWorktreeProvider::new();
        provider
            .expect_create()
            .returning(|_, _, _| Err(anyhow!("disk full")));

        let manager = manager_with(&env, provider);
        let err = manager
            .launch(&env.project.id, "feature/x", None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Infrastructure(_)));
        assert!(env
            .db
            .list_sessions(&SessionFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn concurrent_launches_leave_one_live_session() {
        let env = TestEnv::new();
        let worktree: PathBuf = env.temp.path().join("widgets-feature-x");
        std::fs::create_dir_all(&worktree).unwrap();

        let mut provider = MockWorktreeProvider::new();
        let created = worktree.clone();
        provider
            .expect_create()
            .returning(move |_, _, _| Ok(created.clone()));
        provider
            .expect_open()
            .returning(|path| Ok(handle_for(path)));
        // No delete expectation: losing a race must not remove the winner's worktree
        let manager = manager_with(&env, provider);

        let barrier = Barrier::new(4);
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    let barrier = &barrier;
                    let project_id = env.project.id.clone();
                    scope.spawn(move || {
                        barrier.wait();
                        manager.launch(&project_id, "feature/x", None)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(
                result,
                Err(SessionError::DuplicateSession { .. }) | Err(SessionError::AlreadyActive { .. })
            ));
        }

        let live = env
            .db
            .list_sessions(
                &SessionFilter::for_project(&env.project.id).with_statuses(&SessionStatus::LIVE),
            )
            .unwrap();
        assert_eq!(live.len(), 1);
    }
}
