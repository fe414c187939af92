use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Answers whether an agent process is running with its cwd inside a worktree.
///
/// Detection failures count as "not running".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessDetector: Send + Sync {
    async fn is_agent_running(&self, worktree_path: &Path) -> bool;
}

/// Finds agent processes by executable name (`pgrep -x`, or `/proc/*/comm` on
/// Linux) and resolves their cwd through `/proc/<pid>/cwd` or `lsof`.
#[derive(Debug, Clone)]
pub struct LsofProcessDetector {
    agent_names: Vec<String>,
}

impl LsofProcessDetector {
    pub fn new(agent_names: Vec<String>) -> Self {
        Self { agent_names }
    }

    /// Returns `None` when this platform offers no way to inspect processes.
    pub fn detect(agent_names: Vec<String>) -> Option<Self> {
        let can_list = which::which("pgrep").is_ok() || procfs_available();
        let can_resolve_cwd = which::which("lsof").is_ok() || procfs_available();
        if can_list && can_resolve_cwd && !agent_names.is_empty() {
            Some(Self::new(agent_names))
        } else {
            debug!("Process detection unavailable: pgrep/lsof and /proc are missing");
            None
        }
    }

    async fn agent_pids(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        for name in &self.agent_names {
            match pgrep_exact(name).await {
                Some(found) => pids.extend(found),
                None => pids.extend(procfs_pids_named(name).await),
            }
        }
        let own = std::process::id();
        pids.retain(|pid| *pid != own);
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

#[async_trait]
impl ProcessDetector for LsofProcessDetector {
    async fn is_agent_running(&self, worktree_path: &Path) -> bool {
        let target = worktree_path
            .canonicalize()
            .unwrap_or_else(|_| worktree_path.to_path_buf());

        for pid in self.agent_pids().await {
            let Some(cwd) = process_cwd(pid).await else {
                continue;
            };
            if cwd_within(&cwd, &target) {
                debug!(
                    "Agent process {pid} running in {} (cwd {})",
                    target.display(),
                    cwd.display()
                );
                return true;
            }
        }
        false
    }
}

fn procfs_available() -> bool {
    cfg!(target_os = "linux") && Path::new("/proc/self/cwd").exists()
}

pub(crate) fn cwd_within(cwd: &Path, worktree: &Path) -> bool {
    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    cwd.starts_with(worktree)
}

async fn pgrep_exact(name: &str) -> Option<Vec<u32>> {
    // pgrep exits 1 when nothing matches
    let output = Command::new("pgrep").args(["-x", name]).output().await.ok()?;
    match output.status.code() {
        Some(0) => Some(parse_pids(&String::from_utf8_lossy(&output.stdout))),
        Some(1) => Some(Vec::new()),
        _ => None,
    }
}

fn parse_pids(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse::<u32>().ok())
        .collect()
}

async fn procfs_pids_named(name: &str) -> Vec<u32> {
    if !procfs_available() {
        return Vec::new();
    }
    let name = name.to_string();
    tokio::task::spawn_blocking(move || {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
                let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
                (comm.trim() == name).then_some(pid)
            })
            .collect()
    })
    .await
    .unwrap_or_default()
}

async fn process_cwd(pid: u32) -> Option<PathBuf> {
    if procfs_available() {
        if let Ok(target) = tokio::fs::read_link(format!("/proc/{pid}/cwd")).await {
            return Some(target);
        }
    }

    let output = Command::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_lsof_cwd(&String::from_utf8_lossy(&output.stdout))
}

/// Picks the `n<path>` field out of `lsof -Fn` output.
pub(crate) fn parse_lsof_cwd(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .find_map(|line| line.strip_prefix('n'))
        .filter(|path| !path.is_empty() && !path.starts_with(' '))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_field_output_yields_cwd() {
        let output = "p4242\nfcwd\nn/work/widgets-feature-x\n";
        assert_eq!(
            parse_lsof_cwd(output),
            Some(PathBuf::from("/work/widgets-feature-x"))
        );
        assert_eq!(parse_lsof_cwd("p4242\nfcwd\n"), None);
    }

    #[test]
    fn pid_parsing_skips_noise() {
        assert_eq!(parse_pids("12\n 34 \nabc\n"), vec![12, 34]);
    }

    #[test]
    fn cwd_match_is_component_wise() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let wt = root.join("repo-feature");
        let nested = wt.join("src");
        let sibling = root.join("repo-feature-2");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        assert!(cwd_within(&wt, &wt));
        assert!(cwd_within(&nested, &wt));
        assert!(!cwd_within(&sibling, &wt));
    }

    #[tokio::test]
    #[cfg(target_family = "unix")]
    async fn detects_process_running_inside_worktree() {
        let inside = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();

        let Some(detector) = LsofProcessDetector::detect(vec!["sleep".to_string()]) else {
            return;
        };

        let mut child = Command::new("sleep")
            .arg("30")
            .current_dir(inside.path())
            .spawn()
            .expect("spawn sleep");
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert!(detector.is_agent_running(inside.path()).await);
        assert!(!detector.is_agent_running(outside.path()).await);

        child.kill().await.ok();
    }

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn resolves_cwd_of_own_process() {
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        let resolved = process_cwd(std::process::id()).await.unwrap();
        assert_eq!(resolved.canonicalize().unwrap(), cwd);
    }

    #[tokio::test]
    async fn unknown_agent_names_never_match() {
        let temp = tempfile::tempdir().unwrap();
        let detector = LsofProcessDetector::new(vec!["pm-no-such-agent".to_string()]);
        assert!(!detector.is_agent_running(temp.path()).await);
    }
}
