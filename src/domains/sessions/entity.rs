use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub issue_id: Option<String>,
    pub branch: String,
    // Empty once the worktree has been cleaned up
    pub worktree_path: PathBuf,
    pub status: SessionStatus,
    pub outcome: String,
    pub conflict_state: ConflictState,
    pub conflict_files: Vec<String>,
    pub last_commit_hash: String,
    pub last_commit_message: String,
    pub commit_count: u32,
    pub is_dirty: bool,
    pub ahead_count: u32,
    pub behind_count: u32,
    pub last_error: String,
    // Created by worktree discovery rather than a launch
    pub discovered: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        project_id: &str,
        branch: &str,
        worktree_path: PathBuf,
        issue_id: Option<String>,
        status: SessionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            project_id: project_id.to_string(),
            issue_id,
            branch: branch.to_string(),
            worktree_path,
            status,
            outcome: String::new(),
            conflict_state: ConflictState::None,
            conflict_files: Vec::new(),
            last_commit_hash: String::new(),
            last_commit_message: String::new(),
            commit_count: 0,
            is_dirty: false,
            ahead_count: 0,
            behind_count: 0,
            last_error: String::new(),
            discovered: false,
            started_at: now,
            ended_at: None,
            last_active_at: Some(now),
            last_sync_at: None,
            updated_at: now,
        }
    }

    /// The worktree path, or `None` when the session has been cleaned up.
    pub fn worktree(&self) -> Option<&Path> {
        if self.worktree_path.as_os_str().is_empty() {
            None
        } else {
            Some(self.worktree_path.as_path())
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub const LIVE: [SessionStatus; 2] = [SessionStatus::Active, SessionStatus::Idle];
    pub const TERMINAL: [SessionStatus; 2] = [SessionStatus::Completed, SessionStatus::Abandoned];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "idle" => Ok(SessionStatus::Idle),
            "completed" => Ok(SessionStatus::Completed),
            "abandoned" => Ok(SessionStatus::Abandoned),
            _ => Err(format!("Invalid session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    #[default]
    None,
    SyncConflict,
    MergeConflict,
}

impl ConflictState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictState::None => "none",
            ConflictState::SyncConflict => "sync_conflict",
            ConflictState::MergeConflict => "merge_conflict",
        }
    }
}

impl FromStr for ConflictState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(ConflictState::None),
            "sync_conflict" => Ok(ConflictState::SyncConflict),
            "merge_conflict" => Ok(ConflictState::MergeConflict),
            _ => Err(format!("Invalid conflict state: {s}")),
        }
    }
}

/// Filter for listing sessions; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project_id: Option<String>,
    pub statuses: Option<Vec<SessionStatus>>,
}

impl SessionFilter {
    pub fn for_project(project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            statuses: None,
        }
    }

    pub fn with_statuses(mut self, statuses: &[SessionStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }
}

/// Git-derived fields refreshed opportunistically from the worktree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitSnapshot {
    pub last_commit_hash: String,
    pub last_commit_message: String,
    pub commit_count: u32,
    pub is_dirty: bool,
    pub ahead_count: u32,
    pub behind_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloseWarningKind {
    Dirty,
    Unmerged,
    Behind,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseWarning {
    pub kind: CloseWarningKind,
    pub message: String,
}

/// Readiness report shown before a session is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseCheck {
    pub session_id: String,
    pub branch: String,
    pub base_branch: String,
    pub worktree_exists: bool,
    pub is_dirty: bool,
    pub ahead_count: u32,
    pub behind_count: u32,
    pub conflict_state: ConflictState,
    pub ready_to_close: bool,
    pub warnings: Vec<CloseWarning>,
}
