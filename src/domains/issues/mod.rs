pub mod db_issues;
pub mod entity;

pub use db_issues::IssueMethods;
pub use entity::{issue_to_branch, Issue, IssueStatus};
