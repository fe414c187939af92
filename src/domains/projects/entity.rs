use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_BASE_BRANCH: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(path: PathBuf, base_branch: Option<&str>) -> Self {
        let now = Utc::now();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("project")
            .to_string();
        let base_branch = base_branch
            .map(str::trim)
            .filter(|branch| !branch.is_empty())
            .unwrap_or(DEFAULT_BASE_BRANCH)
            .to_string();

        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name,
            path,
            base_branch,
            created_at: now,
            updated_at: now,
        }
    }
}
