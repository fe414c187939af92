use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domains::sessions::ConflictState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    #[default]
    Merge,
    Rebase,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Merge => "merge",
            SyncStrategy::Rebase => "rebase",
        }
    }
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(SyncStrategy::Merge),
            "rebase" => Ok(SyncStrategy::Rebase),
            _ => Err(format!("Invalid sync strategy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub strategy: SyncStrategy,
    // Skip the uncommitted-changes refusal
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub session_id: String,
    pub already_synced: bool,
    pub ahead: u32,
    pub behind: u32,
    pub conflicts: Vec<String>,
    pub conflict_state: ConflictState,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub strategy: SyncStrategy,
    pub force: bool,
    pub create_pr: bool,
    pub cleanup: bool,
    pub dry_run: bool,
}

/// Predicted result of merging a session branch, computed in memory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MergeState {
    pub has_conflicts: bool,
    pub conflicting_paths: Vec<String>,
    pub is_up_to_date: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub session_id: String,
    pub branch: String,
    pub base_branch: String,
    pub merged: bool,
    pub pr_url: Option<String>,
    pub conflicts: Vec<String>,
    pub conflict_state: ConflictState,
    pub predicted: Option<MergeState>,
    pub cleaned_up: bool,
}

impl MergeOutcome {
    pub(crate) fn new(session_id: &str, branch: &str, base_branch: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            merged: false,
            pr_url: None,
            conflicts: Vec::new(),
            conflict_state: ConflictState::None,
            predicted: None,
            cleaned_up: false,
        }
    }
}
