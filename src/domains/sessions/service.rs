use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, info, warn};
use serde::Serialize;

use crate::domains::git::GitAdapter;
use crate::domains::issues::{IssueMethods, IssueStatus};
use crate::domains::projects::{Project, ProjectMethods};
use crate::domains::sessions::db_sessions::SessionMethods;
use crate::domains::sessions::entity::{
    CloseCheck, CloseWarning, CloseWarningKind, ConflictState, GitSnapshot, Session,
    SessionFilter, SessionStatus,
};
use crate::domains::sessions::errors::{SessionError, SessionResult};
use crate::domains::sessions::process_detection::ProcessDetector;
use crate::domains::worktree::{DeleteOptions, WorktreeProvider};
use crate::infrastructure::database::{is_constraint_violation, Database};

pub const DEFAULT_STALE_THRESHOLD_SECS: i64 = 60;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub projects: usize,
    pub discovered: usize,
    pub transitions: usize,
}

/// Entry point for session lifecycle operations.
///
/// Holds no session state of its own; every call reads the record store.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) db: Database,
    pub(crate) git: Arc<dyn GitAdapter>,
    pub(crate) provider: Arc<dyn WorktreeProvider>,
    pub(crate) detector: Option<Arc<dyn ProcessDetector>>,
    pub(crate) stale_threshold_secs: i64,
}

impl SessionManager {
    pub fn new(
        db: Database,
        git: Arc<dyn GitAdapter>,
        provider: Arc<dyn WorktreeProvider>,
    ) -> Self {
        Self {
            db,
            git,
            provider,
            detector: None,
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProcessDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_stale_threshold(mut self, secs: i64) -> Self {
        self.stale_threshold_secs = secs;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn git(&self) -> &Arc<dyn GitAdapter> {
        &self.git
    }

    pub fn provider(&self) -> &Arc<dyn WorktreeProvider> {
        &self.provider
    }

    pub fn get_session(&self, session_id: &str) -> SessionResult<Session> {
        self.db
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn get_project(&self, project_id: &str) -> SessionResult<Project> {
        self.db
            .get_project(project_id)?
            .ok_or_else(|| SessionError::ProjectNotFound(project_id.to_string()))
    }

    pub(crate) fn project_for(&self, session: &Session) -> SessionResult<Project> {
        self.get_project(&session.project_id)
    }

    /// Lists sessions after reconciling them against the filesystem and processes.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> SessionResult<Vec<Session>> {
        let candidates = self.db.list_sessions(&SessionFilter {
            project_id: filter.project_id.clone(),
            statuses: None,
        })?;
        let transitions = self.reconcile(&candidates).await;
        if transitions > 0 {
            debug!("list_sessions: reconciliation applied {transitions} transition(s)");
        }
        Ok(self.db.list_sessions(filter)?)
    }

    pub(crate) fn snapshot_for(&self, worktree: &Path, base: &str) -> anyhow::Result<GitSnapshot> {
        let (ahead, behind) = self.git.ahead_behind(worktree, base)?;
        Ok(GitSnapshot {
            last_commit_hash: self.git.last_commit_hash(worktree)?,
            last_commit_message: self.git.last_commit_message(worktree)?,
            commit_count: ahead,
            is_dirty: self.git.is_dirty(worktree)?,
            ahead_count: ahead,
            behind_count: behind,
        })
    }

    /// Best-effort refresh of the git-derived fields; `None` when nothing could be read.
    pub fn refresh_git_snapshot(&self, session_id: &str) -> SessionResult<Option<GitSnapshot>> {
        let session = self.get_session(session_id)?;
        Ok(self.refresh_snapshot_quietly(&session))
    }

    pub(crate) fn refresh_snapshot_quietly(&self, session: &Session) -> Option<GitSnapshot> {
        let worktree = session.worktree().filter(|p| p.is_dir())?;
        let project = match self.project_for(session) {
            Ok(project) => project,
            Err(e) => {
                warn!("Skipping git refresh for session {}: {e}", session.id);
                return None;
            }
        };

        let snapshot = match self.snapshot_for(worktree, &project.base_branch) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to read git state for session {}: {e}", session.id);
                return None;
            }
        };

        if let Err(e) = self.db.update_git_snapshot(&session.id, &snapshot) {
            warn!("Failed to persist git state for session {}: {e}", session.id);
            return None;
        }
        Some(snapshot)
    }

    pub fn close_check(&self, session_id: &str) -> SessionResult<CloseCheck> {
        let session = self.get_session(session_id)?;
        let project = self.project_for(&session)?;
        let worktree = session.worktree().filter(|p| p.is_dir());

        let (is_dirty, ahead_count, behind_count) = match worktree {
            Some(path) => match self.snapshot_for(path, &project.base_branch) {
                Ok(snapshot) => (snapshot.is_dirty, snapshot.ahead_count, snapshot.behind_count),
                Err(e) => {
                    warn!("close_check: falling back to stored git state for {session_id}: {e}");
                    (session.is_dirty, session.ahead_count, session.behind_count)
                }
            },
            None => (false, session.ahead_count, session.behind_count),
        };

        let worktree_exists = worktree.is_some();
        let base = &project.base_branch;
        let mut warnings = Vec::new();
        if is_dirty {
            warnings.push(CloseWarning {
                kind: CloseWarningKind::Dirty,
                message: "worktree has uncommitted changes".to_string(),
            });
        }
        if ahead_count > 0 {
            warnings.push(CloseWarning {
                kind: CloseWarningKind::Unmerged,
                message: format!("{ahead_count} commit(s) not merged into {base}"),
            });
        }
        if behind_count > 0 {
            warnings.push(CloseWarning {
                kind: CloseWarningKind::Behind,
                message: format!("{behind_count} commit(s) behind {base}"),
            });
        }
        if session.conflict_state != ConflictState::None {
            warnings.push(CloseWarning {
                kind: CloseWarningKind::Conflict,
                message: format!(
                    "unresolved {} in {}",
                    session.conflict_state.as_str(),
                    session.conflict_files.join(", ")
                ),
            });
        }

        Ok(CloseCheck {
            session_id: session.id,
            branch: session.branch,
            base_branch: project.base_branch,
            worktree_exists,
            is_dirty,
            ahead_count,
            behind_count,
            conflict_state: session.conflict_state,
            ready_to_close: !is_dirty
                && ahead_count == 0
                && session.conflict_state == ConflictState::None,
            warnings,
        })
    }

    /// Removes the worktree (keeping the branch) and abandons a live session.
    pub fn delete_worktree(&self, session_id: &str, force: bool) -> SessionResult<Session> {
        let session = self.get_session(session_id)?;
        let project = self.project_for(&session)?;

        if let Some(worktree) = session.worktree() {
            self.refresh_snapshot_quietly(&session);
            let opts = DeleteOptions {
                force,
                delete_branch: false,
                branch: Some(session.branch.clone()),
            };
            self.provider.delete(&project.path, worktree, &opts)?;
            self.db.clear_worktree_path(&session.id)?;
            info!(
                "Deleted worktree {} for session {}",
                worktree.display(),
                session.id
            );
        }

        if session.is_live() {
            match self.close(&session.id, SessionStatus::Abandoned) {
                Ok(_) | Err(SessionError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.get_session(session_id)
    }

    /// Registers Idle sessions for worktrees that exist on disk but have no record.
    pub fn discover_worktrees(&self, project_id: &str) -> SessionResult<Vec<Session>> {
        let project = self.get_project(project_id)?;
        let worktrees = self.git.list_worktrees(&project.path)?;

        let candidates: Vec<_> = worktrees
            .into_iter()
            .filter(|wt| !wt.is_primary && wt.path.is_dir())
            .filter_map(|wt| wt.branch.map(|branch| (wt.path, branch)))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let paths: Vec<PathBuf> = candidates.iter().map(|(path, _)| path.clone()).collect();
        let known: HashSet<PathBuf> = self
            .db
            .list_sessions_by_worktree_paths(&paths)?
            .into_iter()
            .map(|s| s.worktree_path)
            .collect();

        let mut discovered = Vec::new();
        for (path, branch) in candidates {
            if known.contains(&path) {
                continue;
            }

            let mut session = Session::new(
                &project.id,
                &branch,
                path.clone(),
                None,
                SessionStatus::Idle,
            );
            session.discovered = true;

            match self.db.create_session(&session) {
                Ok(()) => {
                    info!(
                        "Discovered worktree {} on branch '{branch}'",
                        path.display()
                    );
                    self.refresh_snapshot_quietly(&session);
                    discovered.push(session);
                }
                Err(e) if is_constraint_violation(&e) => {
                    debug!(
                        "Skipping discovered worktree {}: branch '{branch}' already has a live session",
                        path.display()
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(discovered)
    }

    /// Discovery followed by reconciliation, for every registered project.
    pub async fn reconcile_all(&self) -> SessionResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for project in self.db.list_projects()? {
            report.projects += 1;
            match self.discover_worktrees(&project.id) {
                Ok(found) => report.discovered += found.len(),
                Err(e) => warn!("Worktree discovery failed for project {}: {e}", project.id),
            }

            let sessions = self.db.list_sessions(&SessionFilter::for_project(&project.id))?;
            report.transitions += self.reconcile(&sessions).await;
        }

        info!(
            "reconcile_all: projects={} discovered={} transitions={}",
            report.projects, report.discovered, report.transitions
        );
        Ok(report)
    }

    pub fn purge_stale_sessions(&self) -> SessionResult<usize> {
        Ok(self
            .db
            .delete_stale_sessions(None, None, self.stale_threshold_secs)?)
    }

    pub(crate) fn cascade_issue(
        &self,
        session: &Session,
        target: IssueStatus,
        only_from: Option<IssueStatus>,
    ) {
        let Some(issue_id) = session.issue_id.as_deref() else {
            return;
        };

        let result = self.apply_issue_status(issue_id, target, only_from);

        match result {
            Ok(true) => info!(
                "Issue {issue_id} moved to {} after session {} changed",
                target.as_str(),
                session.id
            ),
            Ok(false) => {}
            Err(e) => warn!(
                "Failed to update issue {issue_id} for session {}: {e}",
                session.id
            ),
        }
    }

    fn apply_issue_status(
        &self,
        issue_id: &str,
        target: IssueStatus,
        only_from: Option<IssueStatus>,
    ) -> anyhow::Result<bool> {
        let issue = self
            .db
            .get_issue(issue_id)?
            .ok_or_else(|| anyhow!("issue {issue_id} not found"))?;
        if only_from.is_some_and(|required| issue.status != required) || issue.status == target {
            return Ok(false);
        }
        self.db.update_issue_status(issue_id, target)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::test_support::{commit_file, TestEnv};

    #[test]
    fn close_check_reports_dirty_and_unmerged_work() {
        let env = TestEnv::new();
        let session = env.launch("feature/x");
        let wt = session.worktree_path.clone();

        let clean = env.manager.close_check(&session.id).unwrap();
        assert!(clean.ready_to_close);
        assert!(clean.warnings.is_empty());

        commit_file(&wt, "work.txt", "done", "feature work");
        std::fs::write(wt.join("scratch.txt"), "wip").unwrap();

        let check = env.manager.close_check(&session.id).unwrap();
        assert!(!check.ready_to_close);
        assert!(check.is_dirty);
        assert_eq!(check.ahead_count, 1);
        let kinds: Vec<_> = check.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![CloseWarningKind::Dirty, CloseWarningKind::Unmerged]);
    }

    #[test]
    fn refresh_git_snapshot_counts_commits_ahead_of_base() {
        let env = TestEnv::new();
        let session = env.launch("feature/x");
        commit_file(&session.worktree_path, "a.txt", "a", "first");
        commit_file(&session.worktree_path, "b.txt", "b", "second");

        let snapshot = env
            .manager
            .refresh_git_snapshot(&session.id)
            .unwrap()
            .expect("worktree exists");
        assert_eq!(snapshot.commit_count, 2);
        assert_eq!(snapshot.last_commit_message, "second");

        let stored = env.manager.get_session(&session.id).unwrap();
        assert_eq!(stored.commit_count, 2);
        assert_eq!(stored.last_commit_hash, snapshot.last_commit_hash);
    }

    #[test]
    fn delete_worktree_abandons_live_session_and_keeps_branch() {
        let env = TestEnv::new();
        let issue = env.create_issue(IssueStatus::InProgress);
        let session = env.launch_for_issue("feature/x", &issue.id);
        let wt = session.worktree_path.clone();

        let updated = env.manager.delete_worktree(&session.id, false).unwrap();
        assert_eq!(updated.status, SessionStatus::Abandoned);
        assert!(updated.worktree().is_none());
        assert!(!wt.exists());
        assert!(crate::domains::git::branches::branch_exists(&env.repo, "feature/x").unwrap());
        assert_eq!(env.issue_status(&issue.id), IssueStatus::Open);
    }

    #[test]
    fn discover_registers_unknown_worktrees_once() {
        let env = TestEnv::new();
        let wt = env.temp.path().join("widgets-manual");
        crate::domains::sessions::test_support::run_git(
            &env.repo,
            &["worktree", "add", "-b", "manual", wt.to_str().unwrap()],
        );
        let tracked = env.launch("feature/x");

        let found = env.manager.discover_worktrees(&env.project.id).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].branch, "manual");
        assert!(found[0].discovered);
        assert_eq!(found[0].status, SessionStatus::Idle);
        assert_ne!(found[0].worktree_path, tracked.worktree_path);

        assert!(env
            .manager
            .discover_worktrees(&env.project.id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_sessions_reconciles_before_reading() {
        let env = TestEnv::new();
        let session = env.launch("feature/x");
        std::fs::remove_dir_all(&session.worktree_path).unwrap();

        let listed = env
            .manager
            .list_sessions(&SessionFilter::for_project(&env.project.id))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SessionStatus::Abandoned);
    }

    #[tokio::test]
    async fn reconcile_all_discovers_then_reconciles() {
        let env = TestEnv::new();
        let wt = env.temp.path().join("widgets-manual");
        crate::domains::sessions::test_support::run_git(
            &env.repo,
            &["worktree", "add", "-b", "manual", wt.to_str().unwrap()],
        );
        let gone = env.launch("feature/gone");
        std::fs::remove_dir_all(&gone.worktree_path).unwrap();

        let report = env.manager.reconcile_all().await.unwrap();
        assert_eq!(report.projects, 1);
        assert_eq!(report.discovered, 1);
        assert_eq!(report.transitions, 1);

        let second = env.manager.reconcile_all().await.unwrap();
        assert_eq!(second.discovered, 0);
        assert_eq!(second.transitions, 0);
    }

    #[test]
    fn purge_stale_sessions_removes_short_lived_history() {
        let env = TestEnv::new();
        let session = env.launch("feature/x");
        env.manager
            .close(&session.id, SessionStatus::Abandoned)
            .unwrap();

        assert_eq!(env.manager.purge_stale_sessions().unwrap(), 1);
        assert!(matches!(
            env.manager.get_session(&session.id),
            Err(SessionError::NotFound(_))
        ));
    }
}
