use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use pm_sessions::domains::merge::SyncStrategy;
use pm_sessions::domains::sessions::SessionStatus;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// pm - agent sessions on git worktrees
#[derive(Debug, Parser)]
#[command(
    name = "pm",
    about = "pm - agent sessions on git worktrees",
    version = VERSION,
    help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}

EXAMPLES:
    pm launch feature/login             # Start or resume a session in the current repo
    pm launch --issue <ID>              # Branch named after the issue title
    pm sync <SESSION> --strategy rebase # Bring base-branch changes into a session
    pm merge <SESSION> --cleanup        # Land the session and remove its worktree
    pm list --all                       # Sessions across every project
"
)]
pub struct Cli {
    /// Project directory. Defaults to the current working directory.
    #[arg(long, global = true, value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// SQLite database path, overriding settings and PM_DB_PATH.
    #[arg(long, global = true, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Settings file. Defaults to <config_dir>/pm/config.toml.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a session on a branch, or resume its idle session
    Launch {
        /// Branch name; derived from the issue title when omitted
        branch: Option<String>,
        #[arg(long)]
        issue: Option<String>,
    },
    /// Move a live session to idle, completed or abandoned
    Close {
        session_id: String,
        #[arg(long, value_enum, default_value_t = CloseTarget::Completed)]
        to: CloseTarget,
    },
    /// Bring a completed or abandoned session back as idle
    Reactivate { session_id: String },
    /// Merge or rebase base-branch changes into a session
    Sync {
        session_id: String,
        #[arg(long, value_enum, default_value_t = StrategyArg::Merge)]
        strategy: StrategyArg,
        #[arg(long)]
        force: bool,
    },
    /// Land a session on the base branch or open a pull request
    Merge {
        session_id: String,
        #[arg(long, value_enum, default_value_t = StrategyArg::Merge)]
        strategy: StrategyArg,
        #[arg(long)]
        force: bool,
        /// Push the branch and open a pull request instead of merging locally
        #[arg(long, conflicts_with = "dry_run")]
        pr: bool,
        /// Remove the worktree and branch after a clean merge
        #[arg(long)]
        cleanup: bool,
        /// Report predicted conflicts without touching any checkout
        #[arg(long)]
        dry_run: bool,
    },
    /// Discover worktrees and reconcile every project's sessions
    Reconcile,
    /// List sessions of the current project
    List {
        #[arg(long)]
        all: bool,
        #[arg(long, value_enum)]
        status: Vec<StatusArg>,
    },
    /// Show one session
    Show { session_id: String },
    /// Report whether a session can be closed without losing work
    CloseCheck { session_id: String },
    /// Register untracked worktrees of the current project as idle sessions
    Discover,
    /// Remove a session's worktree, keeping its branch
    DeleteWorktree {
        session_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Delete short-lived terminal sessions that produced no commits
    PurgeStale,
    /// Manage issues of the current project
    Issue {
        #[command(subcommand)]
        command: IssueCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum IssueCommand {
    New { title: String },
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CloseTarget {
    Idle,
    Completed,
    Abandoned,
}

impl From<CloseTarget> for SessionStatus {
    fn from(target: CloseTarget) -> Self {
        match target {
            CloseTarget::Idle => SessionStatus::Idle,
            CloseTarget::Completed => SessionStatus::Completed,
            CloseTarget::Abandoned => SessionStatus::Abandoned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    Merge,
    Rebase,
}

impl From<StrategyArg> for SyncStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::Merge => SyncStrategy::Merge,
            StrategyArg::Rebase => SyncStrategy::Rebase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Active,
    Idle,
    Completed,
    Abandoned,
}

impl From<StatusArg> for SessionStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Active => SessionStatus::Active,
            StatusArg::Idle => SessionStatus::Idle,
            StatusArg::Completed => SessionStatus::Completed,
            StatusArg::Abandoned => SessionStatus::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_from<I, T>(itr: I) -> Cli
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString>,
    {
        let iter = std::iter::once(std::ffi::OsString::from("pm"))
            .chain(itr.into_iter().map(Into::into));
        Cli::parse_from(iter)
    }

    #[test]
    fn parses_launch_with_issue_and_global_flags() {
        let cli = parse_from(["launch", "--issue", "i-1", "--project", "/src/widgets"]);
        assert_eq!(
            cli.project.as_deref(),
            Some(std::path::Path::new("/src/widgets"))
        );
        match cli.command {
            Command::Launch { branch, issue } => {
                assert!(branch.is_none());
                assert_eq!(issue.as_deref(), Some("i-1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn close_defaults_to_completed() {
        match parse_from(["close", "s1"]).command {
            Command::Close { session_id, to } => {
                assert_eq!(session_id, "s1");
                assert_eq!(SessionStatus::from(to), SessionStatus::Completed);
            }
            other => panic!("unexpected command {other:?}"),
        }
        match parse_from(["close", "s1", "--to", "abandoned"]).command {
            Command::Close { to, .. } => assert_eq!(to, CloseTarget::Abandoned),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_merge_flags() {
        match parse_from(["merge", "s1", "--strategy", "rebase", "--cleanup"]).command {
            Command::Merge {
                strategy,
                cleanup,
                pr,
                dry_run,
                ..
            } => {
                assert_eq!(SyncStrategy::from(strategy), SyncStrategy::Rebase);
                assert!(cleanup);
                assert!(!pr);
                assert!(!dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn pr_and_dry_run_are_exclusive() {
        let err = Cli::try_parse_from(["pm", "merge", "s1", "--pr", "--dry-run"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn list_accepts_repeated_status() {
        match parse_from(["list", "--status", "active", "--status", "idle"]).command {
            Command::List { all, status } => {
                assert!(!all);
                assert_eq!(status, vec![StatusArg::Active, StatusArg::Idle]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn help_template_contains_examples() {
        use clap::CommandFactory;
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("EXAMPLES:"));
        assert!(help.contains("pm merge <SESSION> --cleanup"));
    }

    #[test]
    fn version_flag_triggers_display_version() {
        let err = Cli::try_parse_from(["pm", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
