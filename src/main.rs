mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::{json, Value};

use cli::{Cli, Command, IssueCommand};
use pm_sessions::domains::git::{CliGitAdapter, GitHubCli};
use pm_sessions::domains::issues::{issue_to_branch, Issue, IssueMethods};
use pm_sessions::domains::merge::{MergeOptions, MergeService, SyncOptions};
use pm_sessions::domains::projects::{Project, ProjectMethods};
use pm_sessions::domains::sessions::{
    LsofProcessDetector, SessionFilter, SessionManager, SessionStatus,
};
use pm_sessions::domains::worktree::{GitWorktreeProvider, TerminalHandleStore};
use pm_sessions::infrastructure::config::{FileSettingsRepository, Settings, SettingsRepository};
use pm_sessions::infrastructure::database::Database;
use pm_sessions::infrastructure::logging;

fn load_settings(config: Option<PathBuf>) -> Result<Settings> {
    let path = match config {
        Some(path) => path,
        None => FileSettingsRepository::default_path().map_err(|e| anyhow!(e))?,
    };
    let mut settings = FileSettingsRepository::new(path)
        .load()
        .map_err(|e| anyhow!(e))?;
    settings.apply_env_overrides();
    Ok(settings)
}

fn build_manager(settings: &Settings, db_path: Option<PathBuf>) -> Result<SessionManager> {
    let db = Database::new(db_path.or_else(|| settings.database_path.clone()))?;

    let handles_path = match &settings.terminal_state_path {
        Some(path) => path.clone(),
        None => TerminalHandleStore::default_path()?,
    };
    let provider = GitWorktreeProvider::new(
        TerminalHandleStore::new(handles_path),
        &settings.agent_command,
        settings.spawn_agent,
    );

    let mut manager = SessionManager::new(db, Arc::new(CliGitAdapter::new()), Arc::new(provider))
        .with_stale_threshold(settings.stale_session_threshold_secs);

    if settings.process_detection {
        match LsofProcessDetector::detect(settings.agent_process_names.clone()) {
            Some(detector) => manager = manager.with_detector(Arc::new(detector)),
            None => log::info!("Process detection unavailable; activity is not inferred"),
        }
    }

    Ok(manager)
}

/// Top level of the git repository containing `dir`.
fn repository_root(dir: Option<&Path>) -> Result<PathBuf> {
    let start = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let repo = git2::Repository::discover(&start)
        .with_context(|| format!("{} is not inside a git repository", start.display()))?;
    let workdir = repo
        .workdir()
        .ok_or_else(|| anyhow!("{} is a bare repository", start.display()))?;
    Ok(workdir.canonicalize()?)
}

fn register_project(cli: &Cli, db: &Database, settings: &Settings) -> Result<Project> {
    let root = repository_root(cli.project.as_deref())?;
    db.get_or_create_project(&root, Some(&settings.default_base_branch))
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

async fn run(cli: Cli) -> Result<Value> {
    let settings = load_settings(cli.config.clone())?;
    let manager = build_manager(&settings, cli.db.clone())?;
    let db = manager.db().clone();

    match &cli.command {
        Command::Launch { branch, issue } => {
            let project = register_project(&cli, &db, &settings)?;
            let branch = match (branch, issue) {
                (Some(branch), _) => branch.clone(),
                (None, Some(issue_id)) => {
                    let issue = db
                        .get_issue(issue_id)?
                        .ok_or_else(|| anyhow!("issue {issue_id} not found"))?;
                    issue_to_branch(&issue.title)
                }
                (None, None) => return Err(anyhow!("a branch or --issue is required")),
            };
            to_json(manager.launch(&project.id, &branch, issue.as_deref())?)
        }
        Command::Close { session_id, to } => {
            to_json(manager.close(session_id, SessionStatus::from(*to))?)
        }
        Command::Reactivate { session_id } => to_json(manager.reactivate(session_id)?),
        Command::Sync {
            session_id,
            strategy,
            force,
        } => {
            let service = MergeService::new(manager.clone(), Arc::new(GitHubCli::new()));
            let opts = SyncOptions {
                strategy: (*strategy).into(),
                force: *force,
            };
            to_json(service.sync(session_id, opts).await?)
        }
        Command::Merge {
            session_id,
            strategy,
            force,
            pr,
            cleanup,
            dry_run,
        } => {
            let service = MergeService::new(manager.clone(), Arc::new(GitHubCli::new()));
            let opts = MergeOptions {
                strategy: (*strategy).into(),
                force: *force,
                create_pr: *pr,
                cleanup: *cleanup,
                dry_run: *dry_run,
            };
            to_json(service.merge(session_id, opts).await?)
        }
        Command::Reconcile => to_json(manager.reconcile_all().await?),
        Command::List { all, status } => {
            let mut filter = if *all {
                SessionFilter::default()
            } else {
                let root = repository_root(cli.project.as_deref())?;
                match db.get_project_by_path(&root)? {
                    Some(project) => SessionFilter::for_project(&project.id),
                    None => return Ok(json!([])),
                }
            };
            if !status.is_empty() {
                let statuses: Vec<SessionStatus> = status.iter().map(|s| (*s).into()).collect();
                filter = filter.with_statuses(&statuses);
            }
            to_json(manager.list_sessions(&filter).await?)
        }
        Command::Show { session_id } => to_json(manager.get_session(session_id)?),
        Command::CloseCheck { session_id } => to_json(manager.close_check(session_id)?),
        Command::Discover => {
            let project = register_project(&cli, &db, &settings)?;
            to_json(manager.discover_worktrees(&project.id)?)
        }
        Command::DeleteWorktree { session_id, force } => {
            to_json(manager.delete_worktree(session_id, *force)?)
        }
        Command::PurgeStale => Ok(json!({ "purged": manager.purge_stale_sessions()? })),
        Command::Issue { command } => {
            let project = register_project(&cli, &db, &settings)?;
            match command {
                IssueCommand::New { title } => {
                    let issue = Issue::new(&project.id, title);
                    db.create_issue(&issue)?;
                    to_json(issue)
                }
                IssueCommand::List => to_json(db.list_issues(&project.id)?),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init_logging();
    let cli = Cli::parse();
    log::debug!("Running {:?}", cli.command);

    match run(cli).await {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: failed to render output: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
