use super::operations;
use anyhow::{anyhow, Context, Result};
use git2::Repository;
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffStat {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    // `None` for detached or bare entries
    pub branch: Option<String>,
    pub is_primary: bool,
}

/// Stateless git primitives used by the session services.
///
/// Paths are either a worktree or the project's primary checkout. Revisions
/// are local branch names or full `refs/...` names.
pub trait GitAdapter: Send + Sync {
    fn is_dirty(&self, path: &Path) -> Result<bool>;
    fn dirty_paths(&self, path: &Path, limit: usize) -> Result<Vec<String>>;
    /// `(ahead, behind)` of HEAD relative to `base`.
    fn ahead_behind(&self, path: &Path, base: &str) -> Result<(u32, u32)>;
    fn diff(&self, path: &Path, base: &str) -> Result<String>;
    fn diff_stat(&self, path: &Path, base: &str) -> Result<DiffStat>;
    fn diff_name_only(&self, path: &Path, base: &str) -> Result<Vec<String>>;
    fn merge(&self, path: &Path, branch: &str) -> Result<()>;
    fn rebase(&self, path: &Path, onto: &str) -> Result<()>;
    fn has_conflicts(&self, path: &Path) -> Result<bool>;
    fn conflicted_files(&self, path: &Path) -> Result<Vec<String>>;
    fn is_merge_in_progress(&self, path: &Path) -> Result<bool>;
    fn is_rebase_in_progress(&self, path: &Path) -> Result<bool>;
    fn merge_abort(&self, path: &Path) -> Result<()>;
    fn rebase_abort(&self, path: &Path) -> Result<()>;
    fn current_branch(&self, path: &Path) -> Result<String>;
    fn last_commit_hash(&self, path: &Path) -> Result<String>;
    fn last_commit_message(&self, path: &Path) -> Result<String>;
    fn fetch(&self, path: &Path) -> Result<()>;
    /// Base revision to sync against after a fetch.
    fn sync_target(&self, path: &Path, base: &str, remote: &str) -> Result<String>;
    fn push(&self, path: &Path, branch: &str) -> Result<()>;
    fn remote_url(&self, path: &Path, remote: &str) -> Result<String>;
    fn list_worktrees(&self, path: &Path) -> Result<Vec<WorktreeInfo>>;
}

/// `GitAdapter` backed by the git CLI for mutating commands and libgit2 for reads.
#[derive(Debug, Clone, Default)]
pub struct CliGitAdapter;

impl CliGitAdapter {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn run_git<I, S>(current_dir: &Path, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    log::debug!("git: running {args:?} in {}", current_dir.display());

    let output = Command::new("git")
        .args(&args)
        .current_dir(current_dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("Failed to execute git command: {args:?}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    log::error!(
        "git: command failed {args:?}, status: {:?}, stderr: {stderr}",
        output.status.code()
    );

    let message = if stderr.is_empty() {
        stdout.trim().to_string()
    } else {
        stderr
    };
    Err(anyhow!(message))
}

fn merge_base_range(base: &str) -> String {
    format!("{base}...HEAD")
}

pub fn parse_numstat(output: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split('\t');
        let added = parts.next().unwrap_or("-");
        let removed = parts.next().unwrap_or("-");
        stat.files_changed += 1;
        // Binary files report "-"
        stat.insertions += added.parse::<u32>().unwrap_or(0);
        stat.deletions += removed.parse::<u32>().unwrap_or(0);
    }
    stat
}

pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                is_primary: worktrees.is_empty(),
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(short.to_string());
            }
        }
    }

    if let Some(done) = current {
        worktrees.push(done);
    }
    worktrees
}

impl GitAdapter for CliGitAdapter {
    fn is_dirty(&self, path: &Path) -> Result<bool> {
        operations::has_uncommitted_changes(path)
    }

    fn dirty_paths(&self, path: &Path, limit: usize) -> Result<Vec<String>> {
        operations::uncommitted_sample_paths(path, limit)
    }

    fn ahead_behind(&self, path: &Path, base: &str) -> Result<(u32, u32)> {
        operations::ahead_behind(path, base)
    }

    fn diff(&self, path: &Path, base: &str) -> Result<String> {
        run_git(path, ["diff", merge_base_range(base).as_str()])
    }

    fn diff_stat(&self, path: &Path, base: &str) -> Result<DiffStat> {
        let output = run_git(path, ["diff", "--numstat", merge_base_range(base).as_str()])?;
        Ok(parse_numstat(&output))
    }

    fn diff_name_only(&self, path: &Path, base: &str) -> Result<Vec<String>> {
        let output = run_git(path, ["diff", "--name-only", merge_base_range(base).as_str()])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn merge(&self, path: &Path, branch: &str) -> Result<()> {
        run_git(path, ["merge", "--no-edit", branch]).map(|_| ())
    }

    fn rebase(&self, path: &Path, onto: &str) -> Result<()> {
        run_git(path, ["rebase", onto]).map(|_| ())
    }

    fn has_conflicts(&self, path: &Path) -> Result<bool> {
        operations::has_conflicts(path)
    }

    fn conflicted_files(&self, path: &Path) -> Result<Vec<String>> {
        operations::conflicted_paths(path)
    }

    fn is_merge_in_progress(&self, path: &Path) -> Result<bool> {
        operations::is_merge_in_progress(path)
    }

    fn is_rebase_in_progress(&self, path: &Path) -> Result<bool> {
        operations::is_rebase_in_progress(path)
    }

    fn merge_abort(&self, path: &Path) -> Result<()> {
        run_git(path, ["merge", "--abort"]).map(|_| ())
    }

    fn rebase_abort(&self, path: &Path) -> Result<()> {
        run_git(path, ["rebase", "--abort"]).map(|_| ())
    }

    fn current_branch(&self, path: &Path) -> Result<String> {
        super::repository::get_current_branch(path)
    }

    fn last_commit_hash(&self, path: &Path) -> Result<String> {
        operations::last_commit(path).map(|(hash, _)| hash)
    }

    fn last_commit_message(&self, path: &Path) -> Result<String> {
        operations::last_commit(path).map(|(_, message)| message)
    }

    fn fetch(&self, path: &Path) -> Result<()> {
        let repo = Repository::open(path)?;
        if repo.remotes()?.is_empty() {
            log::debug!("git: no remotes configured for {}, skipping fetch", path.display());
            return Ok(());
        }
        run_git(path, ["fetch", "--quiet"]).map(|_| ())
    }

    fn sync_target(&self, path: &Path, base: &str, remote: &str) -> Result<String> {
        operations::sync_target(path, base, remote)
    }

    fn push(&self, path: &Path, branch: &str) -> Result<()> {
        run_git(path, ["push", "--set-upstream", "origin", branch]).map(|_| ())
    }

    fn remote_url(&self, path: &Path, remote: &str) -> Result<String> {
        let repo = Repository::open(path)?;
        let remote_ref = repo
            .find_remote(remote)
            .with_context(|| format!("Remote '{remote}' not found"))?;
        remote_ref
            .url()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Remote '{remote}' has no valid URL"))
    }

    fn list_worktrees(&self, path: &Path) -> Result<Vec<WorktreeInfo>> {
        let output = run_git(path, ["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&output))
    }
}
