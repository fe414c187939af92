pub mod git;
pub mod issues;
pub mod merge;
pub mod projects;
pub mod sessions;
pub mod worktree;
