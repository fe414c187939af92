use anyhow::{anyhow, Context, Result};
use git2::{Oid, Repository, RepositoryState, Status, StatusOptions};
use std::collections::BTreeSet;
use std::path::Path;

fn worktree_statuses(repo: &Repository) -> Result<git2::Statuses<'_>> {
    // Include untracked files; recurse into untracked dirs
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    Ok(repo.statuses(Some(&mut opts))?)
}

pub fn has_uncommitted_changes(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;
    let statuses = worktree_statuses(&repo)?;
    let dirty = !statuses.is_empty();
    log::debug!(
        "has_uncommitted_changes: path={} entries={}",
        worktree_path.display(),
        statuses.len()
    );
    Ok(dirty)
}

pub fn uncommitted_sample_paths(worktree_path: &Path, limit: usize) -> Result<Vec<String>> {
    let repo = Repository::open(worktree_path)?;
    let statuses = worktree_statuses(&repo)?;
    let mut out = Vec::new();
    for entry in statuses.iter() {
        out.push(entry.path().unwrap_or("<unknown>").to_string());
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

pub fn conflicted_paths(worktree_path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(worktree_path)?;
    let statuses = worktree_statuses(&repo)?;

    let paths: BTreeSet<String> = statuses
        .iter()
        .filter(|entry| entry.status().contains(Status::CONFLICTED))
        .filter_map(|entry| entry.path().map(str::to_string))
        .collect();

    Ok(paths.into_iter().collect())
}

pub fn has_conflicts(worktree_path: &Path) -> Result<bool> {
    Ok(!conflicted_paths(worktree_path)?.is_empty())
}

pub fn is_merge_in_progress(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;
    Ok(repo.state() == RepositoryState::Merge)
}

pub fn is_rebase_in_progress(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;
    Ok(matches!(
        repo.state(),
        RepositoryState::Rebase | RepositoryState::RebaseInteractive | RepositoryState::RebaseMerge
    ))
}

pub fn resolve_branch_oid(repo: &Repository, branch: &str) -> Result<Oid> {
    let reference_name = if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    };
    let reference = repo
        .find_reference(&reference_name)
        .with_context(|| format!("Failed to resolve reference '{reference_name}'"))?;

    reference
        .resolve()?
        .target()
        .ok_or_else(|| anyhow!("Reference '{reference_name}' has no target"))
}

/// Commits on HEAD not on `base`, and commits on `base` not on HEAD.
pub fn ahead_behind(worktree_path: &Path, base_branch: &str) -> Result<(u32, u32)> {
    let repo = Repository::open(worktree_path)?;
    let head = repo
        .head()
        .context("worktree has no HEAD")?
        .target()
        .ok_or_else(|| anyhow!("HEAD has no target"))?;
    let base = resolve_branch_oid(&repo, base_branch)?;
    let (ahead, behind) = repo.graph_ahead_behind(head, base)?;
    Ok((
        u32::try_from(ahead).unwrap_or(u32::MAX),
        u32::try_from(behind).unwrap_or(u32::MAX),
    ))
}

/// Revision a sync should integrate: `refs/remotes/<remote>/<base>` when the
/// remote copy has everything local `base` has, otherwise local `base`.
pub fn sync_target(worktree_path: &Path, base_branch: &str, remote: &str) -> Result<String> {
    let repo = Repository::open(worktree_path)?;
    let remote_ref = format!("refs/remotes/{remote}/{base_branch}");
    let Ok(remote_oid) = resolve_branch_oid(&repo, &remote_ref) else {
        return Ok(base_branch.to_string());
    };
    let Ok(local_oid) = resolve_branch_oid(&repo, base_branch) else {
        return Ok(remote_ref);
    };

    if remote_oid == local_oid || repo.graph_descendant_of(remote_oid, local_oid)? {
        Ok(remote_ref)
    } else {
        // Local base has unpublished commits
        Ok(base_branch.to_string())
    }
}

pub fn last_commit(worktree_path: &Path) -> Result<(String, String)> {
    let repo = Repository::open(worktree_path)?;
    let commit = repo.head()?.peel_to_commit()?;
    let message = commit.summary().unwrap_or_default().to_string();
    Ok((commit.id().to_string(), message))
}

pub fn is_valid_branch_name(branch: &str) -> bool {
    if branch.is_empty() || branch.len() > 255 {
        return false;
    }

    if branch.contains("..") || branch.contains("//") || branch.ends_with(".lock") {
        return false;
    }

    for part in branch.split('/') {
        if part.is_empty() || part.starts_with('.') || part.ends_with('.') {
            return false;
        }
    }

    branch
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn run_git(path: &Path, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(path)
            .args(args)
            .output()
            .expect("failed to execute git command");
        assert!(
            output.status.success(),
            "git {:?} failed\nstdout: {}\nstderr: {}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo(path: &Path) {
        run_git(path, &["init"]);
        run_git(path, &["config", "user.email", "test@example.com"]);
        run_git(path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "initial").unwrap();
        run_git(path, &["add", "README.md"]);
        run_git(path, &["commit", "-m", "Initial commit"]);
        run_git(path, &["branch", "-M", "main"]);
    }

    fn commit_file(path: &Path, name: &str, contents: &str, message: &str) {
        std::fs::write(path.join(name), contents).unwrap();
        run_git(path, &["add", name]);
        run_git(path, &["commit", "-m", message]);
    }

    #[test]
    fn branch_name_validation() {
        assert!(is_valid_branch_name("feature/login-form"));
        assert!(is_valid_branch_name("fix_1.2"));

        assert!(!is_valid_branch_name(""));
        assert!(!is_valid_branch_name("/leading"));
        assert!(!is_valid_branch_name("trailing/"));
        assert!(!is_valid_branch_name("a//b"));
        assert!(!is_valid_branch_name("a..b"));
        assert!(!is_valid_branch_name("topic.lock"));
        assert!(!is_valid_branch_name("has space"));
        assert!(!is_valid_branch_name("feature/.hidden"));
    }

    #[test]
    fn dirty_detection_includes_untracked_files() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        assert!(!has_uncommitted_changes(temp.path()).unwrap());

        std::fs::write(temp.path().join("notes.txt"), "draft").unwrap();
        assert!(has_uncommitted_changes(temp.path()).unwrap());
        assert_eq!(
            uncommitted_sample_paths(temp.path(), 5).unwrap(),
            vec!["notes.txt".to_string()]
        );
    }

    #[test]
    fn ahead_behind_counts_both_directions() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        run_git(temp.path(), &["checkout", "-b", "feature/x"]);
        commit_file(temp.path(), "a.txt", "a", "feature work");
        run_git(temp.path(), &["checkout", "main"]);
        commit_file(temp.path(), "b.txt", "b", "main work 1");
        commit_file(temp.path(), "c.txt", "c", "main work 2");
        run_git(temp.path(), &["checkout", "feature/x"]);

        assert_eq!(ahead_behind(temp.path(), "main").unwrap(), (1, 2));

        let (hash, message) = last_commit(temp.path()).unwrap();
        assert_eq!(hash.len(), 40);
        assert_eq!(message, "feature work");
    }

    #[test]
    fn sync_target_prefers_remote_copy_unless_local_is_ahead() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        let origin = temp.path().join("origin.git");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        assert_eq!(sync_target(&repo, "main", "origin").unwrap(), "main");

        run_git(temp.path(), &["init", "--bare", origin.to_str().unwrap()]);
        run_git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]);
        run_git(&repo, &["push", "origin", "main"]);
        assert_eq!(
            sync_target(&repo, "main", "origin").unwrap(),
            "refs/remotes/origin/main"
        );

        commit_file(&repo, "local.txt", "l", "unpublished");
        assert_eq!(sync_target(&repo, "main", "origin").unwrap(), "main");
    }

    #[test]
    fn conflicts_are_listed_during_a_failed_merge() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        run_git(temp.path(), &["checkout", "-b", "feature/x"]);
        commit_file(temp.path(), "README.md", "feature", "feature edit");
        run_git(temp.path(), &["checkout", "main"]);
        commit_file(temp.path(), "README.md", "main", "main edit");
        run_git(temp.path(), &["checkout", "feature/x"]);

        let status = Command::new("git")
            .current_dir(temp.path())
            .args(["merge", "main"])
            .output()
            .unwrap()
            .status;
        assert!(!status.success());

        assert!(is_merge_in_progress(temp.path()).unwrap());
        assert!(!is_rebase_in_progress(temp.path()).unwrap());
        assert!(has_conflicts(temp.path()).unwrap());
        assert_eq!(
            conflicted_paths(temp.path()).unwrap(),
            vec!["README.md".to_string()]
        );
    }
}
