use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domains::projects::DEFAULT_BASE_BRANCH;
use crate::domains::sessions::DEFAULT_STALE_THRESHOLD_SECS;
use crate::infrastructure::logging::parse_bool;

const DB_PATH_ENV: &str = "PM_DB_PATH";
const AGENT_COMMAND_ENV: &str = "PM_AGENT_COMMAND";
const DISABLE_DETECTION_ENV: &str = "PM_DISABLE_PROCESS_DETECTION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: Option<PathBuf>,
    pub default_base_branch: String,
    pub agent_command: String,
    pub agent_process_names: Vec<String>,
    // Record a printable launch command instead of starting the agent
    pub spawn_agent: bool,
    pub stale_session_threshold_secs: i64,
    pub process_detection: bool,
    pub terminal_state_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: None,
            default_base_branch: DEFAULT_BASE_BRANCH.to_string(),
            agent_command: "claude".to_string(),
            agent_process_names: vec!["claude".to_string()],
            spawn_agent: false,
            stale_session_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            process_detection: true,
            terminal_state_path: None,
        }
    }
}

impl Settings {
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(DB_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(command) = lookup(AGENT_COMMAND_ENV).filter(|v| !v.trim().is_empty()) {
            self.agent_command = command;
        }
        if let Some(value) = lookup(DISABLE_DETECTION_ENV) {
            match parse_bool(&value) {
                Some(disabled) => self.process_detection = !disabled,
                None => log::warn!("Ignoring invalid {DISABLE_DETECTION_ENV} value '{value}'"),
            }
        }
    }
}

pub trait SettingsRepository: Send + Sync {
    fn load(&self) -> Result<Settings, String>;
    fn save(&self, settings: &Settings) -> Result<(), String>;
}

/// TOML settings file, `<config_dir>/pm/config.toml` by default.
pub struct FileSettingsRepository {
    settings_path: PathBuf,
}

impl FileSettingsRepository {
    pub fn new(settings_path: PathBuf) -> Self {
        Self { settings_path }
    }

    pub fn default_path() -> Result<PathBuf, String> {
        dirs::config_dir()
            .map(|dir| dir.join("pm").join("config.toml"))
            .ok_or_else(|| "Failed to get config directory".to_string())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

impl SettingsRepository for FileSettingsRepository {
    fn load(&self) -> Result<Settings, String> {
        if !self.settings_path.exists() {
            return Ok(Settings::default());
        }

        let contents = match fs::read_to_string(&self.settings_path) {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!(
                    "Failed to read settings file {}: {e}; using defaults",
                    self.settings_path.display()
                );
                return Ok(Settings::default());
            }
        };

        Ok(toml::from_str(&contents).unwrap_or_else(|e| {
            log::warn!(
                "Invalid settings file {}: {e}; using defaults",
                self.settings_path.display()
            );
            Settings::default()
        }))
    }

    fn save(&self, settings: &Settings) -> Result<(), String> {
        log::debug!("Saving settings to: {}", self.settings_path.display());

        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {e}"))?;
        }

        let contents = toml::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;

        fs::write(&self.settings_path, contents).map_err(|e| {
            format!(
                "Failed to write settings file {}: {e}",
                self.settings_path.display()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let repo = FileSettingsRepository::new(temp.path().join("config.toml"));
        assert_eq!(repo.load().unwrap(), Settings::default());
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "agent_command = \"aider --yes\"\nstale_session_threshold_secs = 120\n",
        )
        .unwrap();

        let settings = FileSettingsRepository::new(path).load().unwrap();
        assert_eq!(settings.agent_command, "aider --yes");
        assert_eq!(settings.stale_session_threshold_secs, 120);
        assert_eq!(settings.default_base_branch, "main");
        assert!(settings.process_detection);
    }

    #[test]
    fn unreadable_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "agent_command = [not toml").unwrap();

        let settings = FileSettingsRepository::new(path).load().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let temp = TempDir::new().unwrap();
        let repo = FileSettingsRepository::new(temp.path().join("nested").join("config.toml"));
        let settings = Settings {
            database_path: Some(PathBuf::from("/var/lib/pm/pm.db")),
            spawn_agent: true,
            agent_process_names: vec!["claude".into(), "node".into()],
            ..Settings::default()
        };

        repo.save(&settings).unwrap();
        assert_eq!(repo.load().unwrap(), settings);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            (DB_PATH_ENV, "/tmp/override.db"),
            (AGENT_COMMAND_ENV, "codex"),
            (DISABLE_DETECTION_ENV, "true"),
        ]);
        let mut settings = Settings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            settings.database_path,
            Some(PathBuf::from("/tmp/override.db"))
        );
        assert_eq!(settings.agent_command, "codex");
        assert!(!settings.process_detection);
    }

    #[test]
    fn invalid_override_is_ignored() {
        let mut settings = Settings::default();
        settings.apply_overrides(|key| (key == DISABLE_DETECTION_ENV).then(|| "sometimes".into()));
        assert!(settings.process_detection);
    }
}
