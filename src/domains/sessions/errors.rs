use crate::domains::sessions::entity::SessionStatus;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("project {0} not found")]
    ProjectNotFound(String),
    #[error("issue {0} not found")]
    IssueNotFound(String),
    #[error("issue {issue_id} does not belong to project {project_id}")]
    IssueProjectMismatch {
        issue_id: String,
        project_id: String,
    },
    #[error("session {id} is already {status}")]
    InvalidTransition { id: String, status: SessionStatus },
    #[error("session {id} is {status}, not completed or abandoned")]
    AlreadyLive { id: String, status: SessionStatus },
    #[error("session {session_id} is already active on branch '{branch}'")]
    AlreadyActive { session_id: String, branch: String },
    #[error("a live session already exists for project {project_id} on branch '{branch}'")]
    DuplicateSession { project_id: String, branch: String },
    #[error("session {id} has uncommitted changes{}", format_paths(.paths))]
    DirtyWorktree { id: String, paths: Vec<String> },
    #[error("session {id} has no worktree on disk{}", format_path(.path))]
    MissingWorktree { id: String, path: PathBuf },
    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),
    #[error("an operation is already running for session {0}")]
    Busy(String),
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

fn format_paths(paths: &[String]) -> String {
    if paths.is_empty() {
        String::new()
    } else {
        format!(": {}", paths.join(", "))
    }
}

fn format_path(path: &Path) -> String {
    if path.as_os_str().is_empty() {
        String::new()
    } else {
        format!(" at {}", path.display())
    }
}
