use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use git2::{MergeOptions as GitMergeOptions, Oid, Repository};
use log::{debug, info, warn};
use tokio::task;

use crate::domains::git::operations::resolve_branch_oid;
use crate::domains::git::{extract_owner_repo, GitAdapter, PullRequestCreator};
use crate::domains::merge::lock;
use crate::domains::merge::types::{
    MergeOptions, MergeOutcome, MergeState, SyncOptions, SyncOutcome, SyncStrategy,
};
use crate::domains::projects::Project;
use crate::domains::sessions::{
    ConflictState, Session, SessionError, SessionManager, SessionMethods, SessionResult,
    SessionStatus,
};
use crate::domains::worktree::DeleteOptions;

const SYNC_LABEL: &str = "sync_session";
const MERGE_LABEL: &str = "merge_session";
const CONFLICT_SAMPLE_LIMIT: usize = 20;
const DIRTY_SAMPLE_LIMIT: usize = 5;
const PR_REMOTE: &str = "origin";
const SYNC_REMOTE: &str = "origin";

struct SessionContext {
    session: Session,
    project: Project,
    worktree: PathBuf,
}

enum SyncAttempt {
    UpToDate { ahead: u32 },
    Dirty(Vec<String>),
    Applied { ahead: u32, behind: u32 },
    Conflicted {
        files: Vec<String>,
        error: String,
        ahead: u32,
        behind: u32,
    },
    Failed(anyhow::Error),
}

enum MergeAttempt {
    Dirty(Vec<String>),
    PullRequest(String),
    Predicted(MergeState),
    Merged,
    Conflicted { files: Vec<String>, error: String },
    Failed(anyhow::Error),
}

/// Brings base-branch changes into sessions and lands sessions on the base branch.
pub struct MergeService {
    manager: SessionManager,
    pr: Arc<dyn PullRequestCreator>,
}

impl MergeService {
    pub fn new(manager: SessionManager, pr: Arc<dyn PullRequestCreator>) -> Self {
        Self { manager, pr }
    }

    fn context(&self, session_id: &str) -> SessionResult<SessionContext> {
        let session = self.manager.get_session(session_id)?;
        let project = self.manager.get_project(&session.project_id)?;
        let Some(worktree) = session.worktree().filter(|p| p.is_dir()).map(Path::to_path_buf)
        else {
            return Err(SessionError::MissingWorktree {
                id: session.id,
                path: session.worktree_path,
            });
        };
        Ok(SessionContext {
            session,
            project,
            worktree,
        })
    }

    pub async fn sync(&self, session_id: &str, opts: SyncOptions) -> SessionResult<SyncOutcome> {
        let _guard =
            lock::try_acquire(session_id).ok_or_else(|| SessionError::Busy(session_id.into()))?;
        let ctx = self.context(session_id)?;
        let db = self.manager.db();

        info!(
            "{SYNC_LABEL}: syncing '{}' with '{}' using {}",
            ctx.session.branch,
            ctx.project.base_branch,
            opts.strategy.as_str()
        );

        let git = Arc::clone(self.manager.git());
        let worktree = ctx.worktree.clone();
        let base = ctx.project.base_branch.clone();
        let attempt = blocking(move || attempt_sync(git.as_ref(), &worktree, &base, opts)).await?;

        let mut outcome = SyncOutcome {
            session_id: ctx.session.id.clone(),
            already_synced: false,
            ahead: 0,
            behind: 0,
            conflicts: Vec::new(),
            conflict_state: ctx.session.conflict_state,
        };

        match attempt {
            SyncAttempt::UpToDate { ahead } => {
                debug!("{SYNC_LABEL}: '{}' already contains base", ctx.session.branch);
                // Resolved by hand since the last conflicting sync
                if ctx.session.conflict_state != ConflictState::None {
                    db.update_conflict_state(&ctx.session.id, ConflictState::None, &[], "")?;
                    info!(
                        "{SYNC_LABEL}: '{}' no longer conflicts, clearing {}",
                        ctx.session.branch,
                        ctx.session.conflict_state.as_str()
                    );
                    outcome.conflict_state = ConflictState::None;
                }
                outcome.already_synced = true;
                outcome.ahead = ahead;
            }
            SyncAttempt::Dirty(paths) => {
                return Err(SessionError::DirtyWorktree {
                    id: ctx.session.id,
                    paths,
                });
            }
            SyncAttempt::Applied { ahead, behind } => {
                db.record_sync(&ctx.session.id, ahead, behind, Utc::now())?;
                db.update_conflict_state(&ctx.session.id, ConflictState::None, &[], "")?;
                info!(
                    "{SYNC_LABEL}: '{}' synced (ahead {ahead}, behind {behind})",
                    ctx.session.branch
                );
                outcome.ahead = ahead;
                outcome.behind = behind;
                outcome.conflict_state = ConflictState::None;
            }
            SyncAttempt::Conflicted {
                files,
                error,
                ahead,
                behind,
            } => {
                warn!(
                    "{SYNC_LABEL}: '{}' conflicts with '{}' in {}",
                    ctx.session.branch,
                    ctx.project.base_branch,
                    files.join(", ")
                );
                db.update_conflict_state(
                    &ctx.session.id,
                    ConflictState::SyncConflict,
                    &files,
                    &error,
                )?;
                db.record_sync(&ctx.session.id, ahead, behind, Utc::now())?;
                outcome.ahead = ahead;
                outcome.behind = behind;
                outcome.conflicts = files;
                outcome.conflict_state = ConflictState::SyncConflict;
            }
            SyncAttempt::Failed(e) => {
                self.record_failure(&ctx.session, &e);
                return Err(e.into());
            }
        }

        Ok(outcome)
    }

    pub async fn merge(&self, session_id: &str, opts: MergeOptions) -> SessionResult<MergeOutcome> {
        let _guard =
            lock::try_acquire(session_id).ok_or_else(|| SessionError::Busy(session_id.into()))?;
        let ctx = self.context(session_id)?;
        let db = self.manager.db();
        let mut outcome = MergeOutcome::new(
            &ctx.session.id,
            &ctx.session.branch,
            &ctx.project.base_branch,
        );
        outcome.conflict_state = ctx.session.conflict_state;

        info!(
            "{MERGE_LABEL}: '{}' into '{}' (strategy={}, create_pr={}, dry_run={}, cleanup={})",
            ctx.session.branch,
            ctx.project.base_branch,
            opts.strategy.as_str(),
            opts.create_pr,
            opts.dry_run,
            opts.cleanup
        );

        let git = Arc::clone(self.manager.git());
        let pr = Arc::clone(&self.pr);
        let worktree = ctx.worktree.clone();
        let project_path = ctx.project.path.clone();
        let branch = ctx.session.branch.clone();
        let base = ctx.project.base_branch.clone();
        let attempt = blocking(move || {
            attempt_merge(
                git.as_ref(),
                pr.as_ref(),
                &project_path,
                &worktree,
                &branch,
                &base,
                opts,
            )
        })
        .await?;

        match attempt {
            MergeAttempt::Dirty(paths) => {
                return Err(SessionError::DirtyWorktree {
                    id: ctx.session.id,
                    paths,
                });
            }
            MergeAttempt::PullRequest(url) => {
                info!("{MERGE_LABEL}: opened pull request {url}");
                outcome.pr_url = Some(url);
            }
            MergeAttempt::Predicted(state) => {
                outcome.conflicts = state.conflicting_paths.clone();
                outcome.predicted = Some(state);
            }
            MergeAttempt::Conflicted { files, error } => {
                warn!(
                    "{MERGE_LABEL}: '{}' conflicts with '{}' in {}",
                    ctx.session.branch,
                    ctx.project.base_branch,
                    files.join(", ")
                );
                db.update_conflict_state(
                    &ctx.session.id,
                    ConflictState::MergeConflict,
                    &files,
                    &error,
                )?;
                outcome.conflicts = files;
                outcome.conflict_state = ConflictState::MergeConflict;
            }
            MergeAttempt::Failed(e) => {
                self.record_failure(&ctx.session, &e);
                return Err(e.into());
            }
            MergeAttempt::Merged => {
                db.update_conflict_state(&ctx.session.id, ConflictState::None, &[], "")?;
                outcome.merged = true;
                outcome.conflict_state = ConflictState::None;
                self.manager.refresh_git_snapshot(&ctx.session.id)?;

                if opts.cleanup {
                    self.clean_up(&ctx, opts.force)?;
                    outcome.cleaned_up = true;
                }
            }
        }

        Ok(outcome)
    }

    fn clean_up(&self, ctx: &SessionContext, force: bool) -> SessionResult<()> {
        let opts = DeleteOptions {
            force,
            delete_branch: true,
            branch: Some(ctx.session.branch.clone()),
        };
        self.manager
            .provider()
            .delete(&ctx.project.path, &ctx.worktree, &opts)?;
        self.manager.db().clear_worktree_path(&ctx.session.id)?;

        match self
            .manager
            .close_with_outcome(&ctx.session.id, SessionStatus::Completed, Some("merged"))
        {
            Ok(_) | Err(SessionError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }

        info!(
            "{MERGE_LABEL}: cleaned up worktree {} for '{}'",
            ctx.worktree.display(),
            ctx.session.branch
        );
        Ok(())
    }

    fn record_failure(&self, session: &Session, error: &anyhow::Error) {
        warn!("Git operation failed for session {}: {error:#}", session.id);
        if let Err(e) = self.manager.db().update_conflict_state(
            &session.id,
            session.conflict_state,
            &session.conflict_files,
            &error.to_string(),
        ) {
            warn!("Failed to record error for session {}: {e}", session.id);
        }
    }
}

async fn blocking<T, F>(work: F) -> SessionResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow!("git task panicked: {e}"))?;
    Ok(result?)
}

fn attempt_sync(
    git: &dyn GitAdapter,
    worktree: &Path,
    base: &str,
    opts: SyncOptions,
) -> Result<SyncAttempt> {
    if let Err(e) = git.fetch(worktree) {
        warn!("{SYNC_LABEL}: fetch failed, syncing against local '{base}': {e}");
    }
    let target = git.sync_target(worktree, base, SYNC_REMOTE)?;
    let base = target.as_str();
    debug!("{SYNC_LABEL}: integrating {base}");

    let (ahead, behind) = git.ahead_behind(worktree, base)?;
    if behind == 0 {
        return Ok(SyncAttempt::UpToDate { ahead });
    }

    if !opts.force && git.is_dirty(worktree)? {
        return Ok(SyncAttempt::Dirty(
            git.dirty_paths(worktree, DIRTY_SAMPLE_LIMIT)?,
        ));
    }

    let applied = match opts.strategy {
        SyncStrategy::Merge => git.merge(worktree, base),
        SyncStrategy::Rebase => git.rebase(worktree, base),
    };

    match applied {
        Ok(()) => {
            let (ahead, behind) = git.ahead_behind(worktree, base)?;
            Ok(SyncAttempt::Applied { ahead, behind })
        }
        Err(e) => {
            let files = git.conflicted_files(worktree).unwrap_or_default();
            abort_in_progress(git, worktree);
            if files.is_empty() {
                return Ok(SyncAttempt::Failed(e));
            }
            let (ahead, behind) = git.ahead_behind(worktree, base)?;
            Ok(SyncAttempt::Conflicted {
                files,
                error: e.to_string(),
                ahead,
                behind,
            })
        }
    }
}

fn attempt_merge(
    git: &dyn GitAdapter,
    pr: &dyn PullRequestCreator,
    project_path: &Path,
    worktree: &Path,
    branch: &str,
    base: &str,
    opts: MergeOptions,
) -> Result<MergeAttempt> {
    if !opts.force && git.is_dirty(worktree)? {
        return Ok(MergeAttempt::Dirty(
            git.dirty_paths(worktree, DIRTY_SAMPLE_LIMIT)?,
        ));
    }

    if opts.create_pr {
        git.push(worktree, branch)?;
        let remote = git.remote_url(worktree, PR_REMOTE)?;
        let (owner, repo) = extract_owner_repo(&remote)
            .ok_or_else(|| anyhow!("Remote '{remote}' is not a GitHub repository"))?;
        return Ok(MergeAttempt::PullRequest(
            pr.open_pull_request(&owner, &repo, branch)?,
        ));
    }

    if opts.dry_run {
        let repo = Repository::open(project_path).with_context(|| {
            format!("Failed to open git repository at {}", project_path.display())
        })?;
        let session_oid = resolve_branch_oid(&repo, branch)?;
        let base_oid = resolve_branch_oid(&repo, base)?;
        return Ok(MergeAttempt::Predicted(compute_merge_state(
            &repo,
            session_oid,
            base_oid,
            branch,
            base,
        )?));
    }

    let checked_out = git.current_branch(project_path)?;
    if checked_out != base {
        return Ok(MergeAttempt::Failed(anyhow!(
            "Primary checkout {} is on '{checked_out}', expected '{base}'",
            project_path.display()
        )));
    }

    if opts.strategy == SyncStrategy::Rebase {
        if let Err(e) = git.rebase(worktree, base) {
            let files = git.conflicted_files(worktree).unwrap_or_default();
            abort_in_progress(git, worktree);
            return Ok(if files.is_empty() {
                MergeAttempt::Failed(e)
            } else {
                MergeAttempt::Conflicted {
                    files,
                    error: e.to_string(),
                }
            });
        }
    }

    // After a rebase this fast-forwards
    match git.merge(project_path, branch) {
        Ok(()) => Ok(MergeAttempt::Merged),
        Err(e) => {
            let files = git.conflicted_files(project_path).unwrap_or_default();
            abort_in_progress(git, project_path);
            Ok(if files.is_empty() {
                MergeAttempt::Failed(e)
            } else {
                MergeAttempt::Conflicted {
                    files,
                    error: e.to_string(),
                }
            })
        }
    }
}

fn abort_in_progress(git: &dyn GitAdapter, path: &Path) {
    if git.is_rebase_in_progress(path).unwrap_or(false) {
        if let Err(e) = git.rebase_abort(path) {
            warn!("Failed to abort rebase in {}: {e}", path.display());
        }
    } else if git.is_merge_in_progress(path).unwrap_or(false) {
        if let Err(e) = git.merge_abort(path) {
            warn!("Failed to abort merge in {}: {e}", path.display());
        }
    }
}

/// Simulates merging `session_oid` into `base_oid` without touching any checkout.
pub fn compute_merge_state(
    repo: &Repository,
    session_oid: Oid,
    base_oid: Oid,
    branch: &str,
    base: &str,
) -> Result<MergeState> {
    if !commits_ahead(repo, session_oid, base_oid)? {
        return Ok(MergeState {
            has_conflicts: false,
            conflicting_paths: Vec::new(),
            is_up_to_date: true,
        });
    }

    let session_commit = repo
        .find_commit(session_oid)
        .with_context(|| format!("Failed to find commit {session_oid} for branch '{branch}'"))?;
    let base_commit = repo
        .find_commit(base_oid)
        .with_context(|| format!("Failed to find commit {base_oid} for base '{base}'"))?;

    let mut merge_opts = GitMergeOptions::new();
    merge_opts.fail_on_conflict(false);

    let index = repo
        .merge_commits(&base_commit, &session_commit, Some(&merge_opts))
        .with_context(|| format!("Failed to simulate merge of '{branch}' into '{base}'"))?;

    let has_conflicts = index.has_conflicts();
    let conflicting_paths = if has_conflicts {
        collect_conflicting_paths(&index)?
    } else {
        Vec::new()
    };

    Ok(MergeState {
        has_conflicts,
        conflicting_paths,
        is_up_to_date: false,
    })
}

fn commits_ahead(repo: &Repository, session_oid: Oid, base_oid: Oid) -> Result<bool> {
    if session_oid == base_oid {
        return Ok(false);
    }

    let mut revwalk = repo.revwalk()?;
    revwalk.push(session_oid)?;
    revwalk.hide(base_oid).ok();

    Ok(revwalk.next().is_some())
}

fn collect_conflicting_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let conflicts = index
        .conflicts()
        .context("Failed to read merge conflicts")?;

    for conflict in conflicts.take(CONFLICT_SAMPLE_LIMIT) {
        let conflict = conflict?;
        let path = conflict
            .our
            .as_ref()
            .and_then(index_entry_path)
            .or_else(|| conflict.their.as_ref().and_then(index_entry_path))
            .or_else(|| conflict.ancestor.as_ref().and_then(index_entry_path));

        if let Some(path) = path {
            seen.insert(path);
        }
    }

    Ok(seen.into_iter().collect())
}

fn index_entry_path(entry: &git2::IndexEntry) -> Option<String> {
    std::str::from_utf8(entry.path.as_ref())
        .ok()
        .map(|s| s.trim_end_matches(char::from(0)).to_string())
}
