use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use crate::domains::git::CliGitAdapter;
use crate::domains::issues::{Issue, IssueMethods, IssueStatus};
use crate::domains::projects::{Project, ProjectMethods};
use crate::domains::sessions::entity::Session;
use crate::domains::sessions::process_detection::ProcessDetector;
use crate::domains::sessions::service::SessionManager;
use crate::domains::worktree::{GitWorktreeProvider, TerminalHandleStore};
use crate::infrastructure::database::Database;

pub fn run_git(path: &Path, args: &[&str]) {
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

pub fn init_repo(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    run_git(path, &["init"]);
    run_git(path, &["config", "user.email", "test@example.com"]);
    run_git(path, &["config", "user.name", "Test User"]);
    std::fs::write(path.join("README.md"), "initial\n").unwrap();
    run_git(path, &["add", "README.md"]);
    run_git(path, &["commit", "-m", "Initial commit"]);
    // Repositories used in tests track "main" like production defaults
    run_git(path, &["branch", "-M", "main"]);
}

pub fn commit_file(path: &Path, name: &str, contents: &str, message: &str) {
    let file_path = path.join(name);
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(file_path, contents).unwrap();
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", message]);
}

/// A git repository registered as a project, with a file-backed store.
pub struct TestEnv {
    pub temp: TempDir,
    pub db: Database,
    pub repo: PathBuf,
    pub project: Project,
    pub manager: SessionManager,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("widgets");
        init_repo(&repo);
        let repo = repo.canonicalize().unwrap();

        let db = Database::new(Some(temp.path().join("pm.db"))).unwrap();
        let project = db.get_or_create_project(&repo, None).unwrap();

        let provider = GitWorktreeProvider::new(
            TerminalHandleStore::new(temp.path().join("terminals.json")),
            "claude",
            false,
        );
        let manager = SessionManager::new(
            db.clone(),
            Arc::new(CliGitAdapter::new()),
            Arc::new(provider),
        );

        Self {
            temp,
            db,
            repo,
            project,
            manager,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProcessDetector>) -> Self {
        self.manager = self.manager.with_detector(detector);
        self
    }

    pub fn create_issue(&self, status: IssueStatus) -> Issue {
        let mut issue = Issue::new(&self.project.id, "Add login form");
        issue.status = status;
        self.db.create_issue(&issue).unwrap();
        issue
    }

    pub fn issue_status(&self, issue_id: &str) -> IssueStatus {
        self.db.get_issue(issue_id).unwrap().unwrap().status
    }

    pub fn launch(&self, branch: &str) -> Session {
        self.manager
            .launch(&self.project.id, branch, None)
            .unwrap()
            .session
    }

    pub fn launch_for_issue(&self, branch: &str, issue_id: &str) -> Session {
        self.manager
            .launch(&self.project.id, branch, Some(issue_id))
            .unwrap()
            .session
    }
}
