pub mod adapter;
pub mod branches;
pub mod github_cli;
pub mod operations;
pub mod repository;
pub mod worktrees;

pub use adapter::{CliGitAdapter, DiffStat, GitAdapter, WorktreeInfo};
pub use github_cli::{GitHubCli, PullRequestCreator};
pub use repository::extract_owner_repo;
