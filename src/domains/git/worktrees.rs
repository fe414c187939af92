use super::branches::branch_exists;
use super::repository::get_commit_hash;
use anyhow::{anyhow, Context, Result};
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use std::path::{Path, PathBuf};

/// Adds a worktree for `branch_name` at `worktree_path`.
///
/// An existing local branch is checked out as-is; otherwise the branch is
/// created from the tip of `base_branch`.
pub fn create_worktree_from_base(
    repo_path: &Path,
    branch_name: &str,
    worktree_path: &Path,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let repo = Repository::open(repo_path)?;

    let branch = if branch_exists(repo_path, branch_name)? {
        log::info!("Reusing existing branch '{branch_name}' for new worktree");
        repo.find_branch(branch_name, BranchType::Local)?
    } else {
        let base_commit_hash = get_commit_hash(repo_path, base_branch).map_err(|e| {
            anyhow!("Base branch '{base_branch}' does not exist in the repository: {e}")
        })?;
        log::info!("Creating branch '{branch_name}' from {base_commit_hash} ({base_branch})");
        let base_commit = repo.find_commit(git2::Oid::from_str(&base_commit_hash)?)?;
        repo.branch(branch_name, &base_commit, false)?
    };
    let branch_ref = branch.into_reference();

    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));

    let name = worktree_name(worktree_path, branch_name);
    repo.worktree(&name, worktree_path, Some(&opts))
        .with_context(|| {
            format!(
                "Failed to add worktree for '{branch_name}' at {}",
                worktree_path.display()
            )
        })?;

    log::info!("Created worktree at: {}", worktree_path.display());
    Ok(())
}

// Worktree admin names cannot contain path separators
fn worktree_name(worktree_path: &Path, branch_name: &str) -> String {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| branch_name.replace('/', "-"))
}

pub fn remove_worktree(repo_path: &Path, worktree_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let canonical_target = canonical(worktree_path);

    let worktrees = repo.worktrees()?;
    for wt_name in worktrees.iter().flatten() {
        let Ok(wt) = repo.find_worktree(wt_name) else {
            continue;
        };
        if canonical(wt.path()) != canonical_target && wt.path() != worktree_path {
            continue;
        }

        // Removing the directory first makes the worktree prunable
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)
                .map_err(|e| anyhow!("Failed to remove worktree directory: {e}"))?;
        }

        if let Err(e) = wt.prune(Some(&mut WorktreePruneOptions::new())) {
            log::warn!("Failed to prune worktree from git registry: {e}");
        }
        return Ok(());
    }

    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)?;
        Ok(())
    } else {
        Err(anyhow!("Worktree not found: {}", worktree_path.display()))
    }
}

pub fn prune_worktrees(repo_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let worktrees = repo.worktrees()?;

    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            if wt.validate().is_err() {
                wt.prune(Some(&mut WorktreePruneOptions::new()))?;
            }
        }
    }

    Ok(())
}

pub fn is_worktree_registered(repo_path: &Path, worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    let target = canonical(worktree_path);

    let worktrees = repo.worktrees()?;
    Ok(worktrees
        .iter()
        .flatten()
        .filter_map(|name| repo.find_worktree(name).ok())
        .any(|wt| canonical(wt.path()) == target))
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::repository::get_current_branch;
    use std::process::Command;
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

    #[test]
    fn creates_and_removes_worktree_for_new_branch() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let wt = temp.path().join("repo-feature-x");

        create_worktree_from_base(&repo, "feature/x", &wt, "main").unwrap();
        assert!(wt.join("README.md").exists());
        assert_eq!(get_current_branch(&wt).unwrap(), "feature/x");
        assert!(is_worktree_registered(&repo, &wt).unwrap());

        remove_worktree(&repo, &wt).unwrap();
        assert!(!wt.exists());
        assert!(!is_worktree_registered(&repo, &wt).unwrap());
        assert!(branch_exists(&repo, "feature/x").unwrap(), "branch kept");
    }

    #[test]
    fn existing_branch_is_checked_out_not_recreated() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        run_git(&repo, &["checkout", "-b", "feature/x"]);
        std::fs::write(repo.join("work.txt"), "kept").unwrap();
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", "prior work"]);
        run_git(&repo, &["checkout", "main"]);

        let wt = temp.path().join("repo-feature-x");
        create_worktree_from_base(&repo, "feature/x", &wt, "main").unwrap();
        assert!(wt.join("work.txt").exists(), "prior commits survive");
    }

    #[test]
    fn missing_base_branch_is_reported() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);

        let err = create_worktree_from_base(&repo, "feature/x", &temp.path().join("wt"), "develop")
            .unwrap_err();
        assert!(err.to_string().contains("develop"));
    }
}
