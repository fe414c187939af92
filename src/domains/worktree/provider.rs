use super::handles::{TerminalHandle, TerminalHandleStore};
use crate::domains::git::branches::{branch_exists, delete_branch};
use crate::domains::git::operations::{has_uncommitted_changes, is_valid_branch_name};
use crate::domains::git::worktrees::{
    create_worktree_from_base, is_worktree_registered, prune_worktrees, remove_worktree,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub force: bool,
    pub delete_branch: bool,
    pub branch: Option<String>,
}

/// Creates, opens and deletes session worktrees together with their agent terminal.
#[cfg_attr(test, mockall::automock)]
pub trait WorktreeProvider: Send + Sync {
    fn create(&self, project_path: &Path, branch: &str, base: &str) -> Result<PathBuf>;
    fn delete(&self, project_path: &Path, worktree_path: &Path, opts: &DeleteOptions)
        -> Result<()>;
    fn open(&self, worktree_path: &Path) -> Result<TerminalHandle>;
}

/// `<project_path>-<branch with '/' replaced by '-'>`
pub fn worktree_path_for(project_path: &Path, branch: &str) -> PathBuf {
    let dir_name = project_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = branch.replace('/', "-");
    project_path.with_file_name(format!("{dir_name}-{suffix}"))
}

pub fn launch_command(worktree_path: &Path, agent_command: &str) -> String {
    format!(
        "cd {} && {}",
        shell_words::quote(&worktree_path.to_string_lossy()),
        agent_command
    )
}

pub struct GitWorktreeProvider {
    handles: TerminalHandleStore,
    agent_command: String,
    spawn_agent: bool,
}

impl GitWorktreeProvider {
    pub fn new(handles: TerminalHandleStore, agent_command: &str, spawn_agent: bool) -> Self {
        Self {
            handles,
            agent_command: agent_command.to_string(),
            spawn_agent,
        }
    }

    pub fn handles(&self) -> &TerminalHandleStore {
        &self.handles
    }

    fn spawn_agent_in(&self, worktree_path: &Path) -> Result<u32> {
        let argv = shell_words::split(&self.agent_command)
            .with_context(|| format!("Invalid agent command '{}'", self.agent_command))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("Agent command is empty"))?;

        let child = Command::new(program)
            .args(args)
            .current_dir(worktree_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start agent '{program}'"))?;

        Ok(child.id())
    }
}

impl WorktreeProvider for GitWorktreeProvider {
    fn create(&self, project_path: &Path, branch: &str, base: &str) -> Result<PathBuf> {
        if !is_valid_branch_name(branch) {
            bail!("Invalid branch name '{branch}'");
        }

        let worktree_path = worktree_path_for(project_path, branch);
        if worktree_path.exists() {
            if is_worktree_registered(project_path, &worktree_path)? {
                info!(
                    "Reusing existing worktree for '{branch}' at {}",
                    worktree_path.display()
                );
                return Ok(worktree_path);
            }
            bail!(
                "Path {} already exists and is not a worktree of {}",
                worktree_path.display(),
                project_path.display()
            );
        }

        create_worktree_from_base(project_path, branch, &worktree_path, base)?;
        Ok(worktree_path)
    }

    fn delete(
        &self,
        project_path: &Path,
        worktree_path: &Path,
        opts: &DeleteOptions,
    ) -> Result<()> {
        let exists = worktree_path.exists();
        if exists && !opts.force && has_uncommitted_changes(worktree_path).unwrap_or(false) {
            bail!(
                "Worktree {} has uncommitted changes; use force to delete",
                worktree_path.display()
            );
        }

        if let Some(handle) = self.handles.get(worktree_path)? {
            if let Some(pid) = handle.pid.filter(|pid| process_alive(*pid)) {
                info!("Stopping agent process {pid} for {}", worktree_path.display());
                terminate(pid);
            }
        }

        if exists {
            remove_worktree(project_path, worktree_path)?;
        } else {
            info!(
                "Worktree {} already gone, pruning registry",
                worktree_path.display()
            );
        }

        if let Err(e) = prune_worktrees(project_path) {
            warn!("Failed to prune worktrees in {}: {e}", project_path.display());
        }

        if opts.delete_branch {
            if let Some(branch) = opts.branch.as_deref() {
                if branch_exists(project_path, branch)? {
                    delete_branch(project_path, branch)?;
                }
            }
        }

        self.handles.remove(worktree_path)?;
        Ok(())
    }

    fn open(&self, worktree_path: &Path) -> Result<TerminalHandle> {
        if !worktree_path.is_dir() {
            bail!("Worktree {} does not exist", worktree_path.display());
        }

        if let Some(existing) = self.handles.get(worktree_path)? {
            if existing.pid.is_some_and(process_alive) {
                info!(
                    "Reattaching to running agent {:?} in {}",
                    existing.pid,
                    worktree_path.display()
                );
                return Ok(existing);
            }
        }

        let pid = if self.spawn_agent {
            Some(self.spawn_agent_in(worktree_path)?)
        } else {
            None
        };

        let handle = TerminalHandle {
            worktree_path: worktree_path.to_path_buf(),
            pid,
            command: launch_command(worktree_path, &self.agent_command),
            opened_at: Utc::now(),
        };
        self.handles.put(&handle)?;
        info!(
            "Opened terminal for {} (pid {:?})",
            worktree_path.display(),
            handle.pid
        );
        Ok(handle)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    unsafe {
        if libc::kill(pid, 0) == 0 {
            true
        } else {
            matches!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::EPERM)
            )
        }
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return;
    };
    if unsafe { libc::kill(pid_t, libc::SIGTERM) } == -1 {
        warn!(
            "Failed to SIGTERM process {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_git(path: &Path, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(path)
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
    }

    fn init_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        run_git(path, &["init"]);
        run_git(path, &["config", "user.email", "test@example.com"]);
        run_git(path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "initial").unwrap();
        run_git(path, &["add", "."]);
        run_git(path, &["commit", "-m", "Initial commit"]);
        run_git(path, &["branch", "-M", "main"]);
    }

    fn provider(temp: &TempDir, command: &str, spawn: bool) -> GitWorktreeProvider {
        GitWorktreeProvider::new(
            TerminalHandleStore::new(temp.path().join("terminals.json")),
            command,
            spawn,
        )
    }

    #[test]
    fn worktree_path_flattens_branch() {
        assert_eq!(
            worktree_path_for(Path::new("/src/widgets"), "feature/login"),
            PathBuf::from("/src/widgets-feature-login")
        );
    }

    #[test]
    fn launch_command_quotes_path() {
        assert_eq!(
            launch_command(Path::new("/src/my widgets"), "claude"),
            "cd '/src/my widgets' && claude"
        );
    }

    #[test]
    fn create_reuses_registered_worktree() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let provider = provider(&temp, "claude", false);

        let first = provider.create(&repo, "feature/x", "main").unwrap();
        assert_eq!(first, temp.path().join("widgets-feature-x"));
        let second = provider.create(&repo, "feature/x", "main").unwrap();
        assert_eq!(first, second);

        assert!(provider.create(&repo, "bad name", "main").is_err());
    }

    #[test]
    fn create_refuses_foreign_directory() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        std::fs::create_dir_all(temp.path().join("widgets-feature-x")).unwrap();

        let err = provider(&temp, "claude", false)
            .create(&repo, "feature/x", "main")
            .unwrap_err();
        assert!(err.to_string().contains("not a worktree"));
    }

    #[test]
    fn open_records_printable_command_without_spawning() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let provider = provider(&temp, "claude --resume", false);
        let wt = provider.create(&repo, "feature/x", "main").unwrap();

        let handle = provider.open(&wt).unwrap();
        assert_eq!(handle.pid, None);
        assert!(handle.command.ends_with("&& claude --resume"));
        assert_eq!(provider.handles().get(&wt).unwrap(), Some(handle));

        assert!(provider.open(&temp.path().join("missing")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn open_reattaches_to_live_agent_and_delete_stops_it() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let provider = provider(&temp, "sleep 30", true);
        let wt = provider.create(&repo, "feature/x", "main").unwrap();

        let first = provider.open(&wt).unwrap();
        let pid = first.pid.expect("agent spawned");
        let again = provider.open(&wt).unwrap();
        assert_eq!(again.pid, Some(pid));

        provider
            .delete(
                &repo,
                &wt,
                &DeleteOptions {
                    force: true,
                    delete_branch: true,
                    branch: Some("feature/x".into()),
                },
            )
            .unwrap();
        assert!(!wt.exists());
        assert!(!branch_exists(&repo, "feature/x").unwrap());
        assert!(provider.handles().get(&wt).unwrap().is_none());
    }

    #[test]
    fn delete_refuses_dirty_worktree_unless_forced() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let provider = provider(&temp, "claude", false);
        let wt = provider.create(&repo, "feature/x", "main").unwrap();
        std::fs::write(wt.join("scratch.txt"), "wip").unwrap();

        let opts = DeleteOptions::default();
        assert!(provider.delete(&repo, &wt, &opts).is_err());
        assert!(wt.exists());

        provider
            .delete(&repo, &wt, &DeleteOptions { force: true, ..opts })
            .unwrap();
        assert!(!wt.exists());
        assert!(branch_exists(&repo, "feature/x").unwrap(), "branch kept");
    }

    #[cfg(unix)]
    #[test]
    fn refused_delete_leaves_agent_running() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let provider = provider(&temp, "sleep 30", true);
        let wt = provider.create(&repo, "feature/x", "main").unwrap();
        let pid = provider.open(&wt).unwrap().pid.expect("agent spawned");
        std::fs::write(wt.join("scratch.txt"), "wip").unwrap();

        assert!(provider.delete(&repo, &wt, &DeleteOptions::default()).is_err());
        assert!(process_alive(pid));
        assert!(provider.handles().get(&wt).unwrap().is_some());

        provider
            .delete(
                &repo,
                &wt,
                &DeleteOptions {
                    force: true,
                    ..DeleteOptions::default()
                },
            )
            .unwrap();
        assert!(!wt.exists());
    }

    #[test]
    fn delete_of_missing_worktree_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let provider = provider(&temp, "claude", false);

        provider
            .delete(&repo, &temp.path().join("widgets-gone"), &DeleteOptions::default())
            .unwrap();
    }
}
