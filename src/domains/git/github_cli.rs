use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use log::{debug, info};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        current_dir: Option<&Path>,
        env: &[(&str, &str)],
    ) -> io::Result<CommandOutput>;
}

/// Opens a pull request for a pushed branch and returns its URL.
#[cfg_attr(test, mockall::automock)]
pub trait PullRequestCreator: Send + Sync {
    fn open_pull_request(&self, owner: &str, repo: &str, branch: &str) -> anyhow::Result<String>;
}

#[derive(Debug)]
pub enum GitHubCliError {
    NotInstalled,
    CommandFailed {
        program: String,
        args: Vec<String>,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    Io(io::Error),
    Json(serde_json::Error),
    InvalidOutput(String),
}

impl std::fmt::Display for GitHubCliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitHubCliError::NotInstalled => write!(f, "GitHub CLI (gh) is not installed."),
            GitHubCliError::CommandFailed {
                program,
                status,
                stderr,
                ..
            } => write!(
                f,
                "Command `{program}` failed with status {status:?}: {}",
                stderr.trim()
            ),
            GitHubCliError::Io(err) => write!(f, "IO error: {err}"),
            GitHubCliError::Json(err) => write!(f, "JSON error: {err}"),
            GitHubCliError::InvalidOutput(msg) => write!(f, "Invalid CLI output: {msg}"),
        }
    }
}

impl std::error::Error for GitHubCliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitHubCliError::Io(err) => Some(err),
            GitHubCliError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GitHubCliError {
    fn from(value: serde_json::Error) -> Self {
        GitHubCliError::Json(value)
    }
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        current_dir: Option<&Path>,
        env: &[(&str, &str)],
    ) -> io::Result<CommandOutput> {
        let mut cmd = StdCommand::new(program);
        cmd.args(args);
        if let Some(dir) = current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd.output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub struct GitHubCli<R: CommandRunner = SystemCommandRunner> {
    runner: R,
    program: String,
}

impl GitHubCli<SystemCommandRunner> {
    pub fn new() -> Self {
        Self {
            runner: SystemCommandRunner,
            program: resolve_github_cli_program(),
        }
    }
}

impl Default for GitHubCli<SystemCommandRunner> {
    fn default() -> Self {
        Self::new()
    }
}

const GH_ENV: [(&str, &str); 2] = [("GH_PROMPT_DISABLED", "1"), ("NO_COLOR", "1")];

impl<R: CommandRunner> GitHubCli<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            program: "gh".to_string(),
        }
    }

    pub fn ensure_installed(&self) -> Result<(), GitHubCliError> {
        match self.runner.run(&self.program, &["--version"], None, &[]) {
            Ok(output) if output.success() => {
                info!("GitHub CLI detected: {}", output.stdout.trim());
                Ok(())
            }
            Ok(output) => {
                debug!(
                    "GitHub CLI version command failed with status {:?}: stderr={}",
                    output.status, output.stderr
                );
                Err(GitHubCliError::NotInstalled)
            }
            Err(err) => Err(map_runner_error(err)),
        }
    }

    pub fn create_pull_request(
        &self,
        repository: &str,
        branch_name: &str,
    ) -> Result<String, GitHubCliError> {
        let args_vec = vec![
            "pr".to_string(),
            "create".to_string(),
            "--repo".to_string(),
            repository.to_string(),
            "--head".to_string(),
            branch_name.to_string(),
            "--title".to_string(),
            branch_name.to_string(),
            "--body".to_string(),
            String::new(),
        ];
        let arg_refs: Vec<&str> = args_vec.iter().map(|s| s.as_str()).collect();

        let output = self
            .runner
            .run(&self.program, &arg_refs, None, &GH_ENV)
            .map_err(map_runner_error)?;

        if !output.success() {
            if let Some(existing_url) = self.view_existing_pr(repository, branch_name)? {
                info!("Reusing existing PR for branch '{branch_name}': {existing_url}");
                return Ok(existing_url);
            }
            return Err(command_failure(&self.program, &args_vec, output));
        }

        let combined = combine_output(&output);
        extract_pr_url(&combined)
            .inspect(|url| info!("Created PR for branch '{branch_name}': {url}"))
            .ok_or_else(|| {
                GitHubCliError::InvalidOutput(format!(
                    "gh pr create did not report a pull request URL: {}",
                    combined.trim()
                ))
            })
    }

    fn view_existing_pr(
        &self,
        repository: &str,
        branch_name: &str,
    ) -> Result<Option<String>, GitHubCliError> {
        let args = [
            "pr", "view", branch_name, "--repo", repository, "--json", "url",
        ];
        let output = self
            .runner
            .run(&self.program, &args, None, &GH_ENV)
            .map_err(map_runner_error)?;

        if !output.success() {
            debug!("gh pr view failed, no existing PR for '{branch_name}'");
            return Ok(None);
        }

        let clean_output = strip_ansi_codes(&output.stdout);
        let response: PrViewResponse = serde_json::from_str(clean_output.trim())?;
        Ok(Some(response.url))
    }
}

impl<R: CommandRunner> PullRequestCreator for GitHubCli<R> {
    fn open_pull_request(&self, owner: &str, repo: &str, branch: &str) -> anyhow::Result<String> {
        let url = self.create_pull_request(&format!("{owner}/{repo}"), branch)?;
        Ok(url)
    }
}

fn map_runner_error(err: io::Error) -> GitHubCliError {
    if err.kind() == io::ErrorKind::NotFound {
        GitHubCliError::NotInstalled
    } else {
        GitHubCliError::Io(err)
    }
}

fn command_failure(program: &str, args: &[String], output: CommandOutput) -> GitHubCliError {
    GitHubCliError::CommandFailed {
        program: program.to_string(),
        args: args.to_vec(),
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

fn resolve_github_cli_program() -> String {
    if let Ok(custom) = env::var("GITHUB_CLI_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            log::info!("[GitHubCli] Using GITHUB_CLI_PATH override: {trimmed}");
            return trimmed.to_string();
        }
    }

    match which::which("gh") {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(_) => {
            let fallback = ["/opt/homebrew/bin", "/usr/local/bin"]
                .iter()
                .map(|dir| PathBuf::from(dir).join("gh"))
                .find(|candidate| candidate.exists());
            match fallback {
                Some(path) => path.to_string_lossy().to_string(),
                None => {
                    log::warn!("[GitHubCli] Falling back to plain 'gh' - binary may not be found");
                    "gh".to_string()
                }
            }
        }
    }
}

fn combine_output(output: &CommandOutput) -> String {
    if output.stderr.is_empty() {
        output.stdout.clone()
    } else if output.stdout.is_empty() {
        output.stderr.clone()
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    }
}

fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for ch in chars.by_ref() {
                    if ch.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn extract_pr_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| "()[]{}<>,.;".contains(c)))
        .find(|cleaned| cleaned.starts_with("https://") && cleaned.contains("/pull/"))
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct PrViewResponse {
    url: String,
}
