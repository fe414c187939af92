use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Opaque reference to the agent terminal attached to a worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalHandle {
    pub worktree_path: PathBuf,
    // `None` when the agent was not spawned by us
    pub pid: Option<u32>,
    pub command: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HandleFile {
    #[serde(default)]
    handles: BTreeMap<String, TerminalHandle>,
}

/// JSON side-table of terminal handles keyed by worktree path.
pub struct TerminalHandleStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl TerminalHandleStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir().context("Failed to get data directory")?;
        Ok(data_dir.join("pm").join("terminals.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HandleFile> {
        if !self.path.exists() {
            return Ok(HandleFile::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read terminal state {}", self.path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(file) => Ok(file),
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable terminal state {}: {e}",
                    self.path.display()
                );
                Ok(HandleFile::default())
            }
        }
    }

    fn save(&self, file: &HandleFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write terminal state {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn key(worktree_path: &Path) -> String {
        worktree_path.to_string_lossy().into_owned()
    }

    pub fn get(&self, worktree_path: &Path) -> Result<Option<TerminalHandle>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.handles.remove(&Self::key(worktree_path)))
    }

    pub fn put(&self, handle: &TerminalHandle) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        file.handles
            .insert(Self::key(&handle.worktree_path), handle.clone());
        self.save(&file)
    }

    pub fn remove(&self, worktree_path: &Path) -> Result<Option<TerminalHandle>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        let removed = file.handles.remove(&Self::key(worktree_path));
        if removed.is_some() {
            self.save(&file)?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<TerminalHandle>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.handles.into_values().collect())
    }
}
