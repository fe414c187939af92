pub mod handles;
pub mod provider;

pub use handles::{TerminalHandle, TerminalHandleStore};
pub use provider::{
    launch_command, worktree_path_for, DeleteOptions, GitWorktreeProvider, WorktreeProvider,
};
