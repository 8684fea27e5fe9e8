//! Configuration handling for unitwave
//!
//! Configuration is stored in `.unitwave/config.toml` (workspace) and
//! `~/.config/unitwave/config.toml` (global). The workspace file is layered
//! over the global one key by key; keys absent from both take their defaults.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::UnitId;
use crate::runtime::DegradationMode;

/// Environment variable overriding the global config directory
pub const CONFIG_HOME_ENV: &str = "UNITWAVE_CONFIG_HOME";

/// Name of the workspace directory
pub const WORKSPACE_DIR: &str = ".unitwave";

const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Loader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Units running at the same time within one wave
    pub max_concurrency: usize,

    /// Consecutive failures that open a unit's breaker
    pub circuit_breaker_threshold: u32,

    /// Seconds after which an open breaker closes again (off when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_cooldown_secs: Option<u64>,

    pub degradation_mode: DegradationMode,

    /// Days an unused metadata cache row is kept
    pub cache_retention_days: u32,

    /// Days persisted error records are kept
    pub error_retention_days: u32,

    pub unit_timeout_secs: u64,

    /// Wall-clock budget for a whole load (unbounded when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_budget_secs: Option<u64>,

    /// Interpreter used to run unit sources
    pub shell: String,

    /// Units to load, in tie-break order (empty means every discovered unit)
    pub enabled: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: None,
            degradation_mode: DegradationMode::Graceful,
            cache_retention_days: 30,
            error_retention_days: 7,
            unit_timeout_secs: 10,
            startup_budget_secs: None,
            shell: "bash".to_string(),
            enabled: vec![],
        }
    }
}

impl Settings {
    /// Checks value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.unit_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "unit_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.startup_budget_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "startup_budget_secs must be at least 1 when set".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".to_string()));
        }
        self.enabled_units()?;
        Ok(())
    }

    /// Parses the `enabled` list into unit IDs
    pub fn enabled_units(&self) -> Result<Vec<UnitId>, ConfigError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(self.enabled.len());
        for raw in &self.enabled {
            let id: UnitId = raw
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("enabled: {}", e)))?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "enabled: '{}' listed more than once",
                    id
                )));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn startup_budget(&self) -> Option<Duration> {
        self.startup_budget_secs.map(Duration::from_secs)
    }

    pub fn breaker_cooldown(&self) -> Option<Duration> {
        self.circuit_breaker_cooldown_secs.map(Duration::from_secs)
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_retention_days) * SECS_PER_DAY)
    }

    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.error_retention_days) * SECS_PER_DAY)
    }
}

/// Combined configuration (global + workspace)
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub workspace_root: Option<PathBuf>,
}

impl Config {
    /// Loads configuration for a specific workspace
    pub fn for_workspace(workspace_root: &Path) -> Result<Self> {
        let global = Self::global_config_dir()
            .map(|dir| dir.join("config.toml"))
            .map(|path| read_table(&path, "global"))
            .transpose()?
            .flatten();
        let local = read_table(&Self::workspace_config_path(workspace_root), "workspace")?;

        let settings = layer(global, local)?;

        Ok(Self {
            settings,
            workspace_root: Some(workspace_root.to_path_buf()),
        })
    }

    /// Returns the global config directory
    pub fn global_config_dir() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_HOME_ENV) {
            return Some(PathBuf::from(dir));
        }
        ProjectDirs::from("dev", "unitwave", "unitwave").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns the path of the workspace config file
    pub fn workspace_config_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(WORKSPACE_DIR).join("config.toml")
    }

    /// Finds the workspace root by looking for `.unitwave/` from `start` upward
    pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();

        loop {
            if current.join(WORKSPACE_DIR).is_dir() {
                return Some(current);
            }

            if !current.pop() {
                return None;
            }
        }
    }

    /// Returns the workspace root, or an error if not in a workspace
    pub fn require_workspace_root(&self) -> Result<&Path> {
        self.workspace_root
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Not in a unitwave workspace. Run 'unitwave init' first."))
    }

    /// Saves the workspace configuration
    pub fn save_workspace(&self) -> Result<()> {
        let root = self.require_workspace_root()?;
        let config_path = Self::workspace_config_path(root);

        let content =
            toml::to_string_pretty(&self.settings).context("Failed to serialize workspace config")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write workspace config: {}", config_path.display()))
    }
}

/// Reads a TOML file as a raw table, None if it does not exist
fn read_table(path: &Path, layer: &str) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} config: {}", layer, path.display()))?;

    let table = content
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse(e.to_string()))
        .with_context(|| format!("Failed to parse {} config: {}", layer, path.display()))?;

    Ok(Some(table))
}

/// Merges the workspace table over the global one and validates the result
fn layer(global: Option<toml::Table>, local: Option<toml::Table>) -> Result<Settings> {
    let mut merged = global.unwrap_or_default();
    if let Some(local) = local {
        merged.extend(local);
    }

    let settings: Settings = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
        .context("Failed to parse configuration")?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(s: &str) -> Option<toml::Table> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.circuit_breaker_threshold, 3);
        assert_eq!(settings.degradation_mode, DegradationMode::Graceful);
        assert_eq!(settings.cache_retention(), Duration::from_secs(30 * 86_400));
        assert_eq!(settings.startup_budget(), None);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parse_workspace_config() {
        let toml = r#"
max_concurrency = 8
degradation_mode = "safe"
startup_budget_secs = 5
enabled = ["logging", "fzf"]
"#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.max_concurrency, 8);
        assert_eq!(settings.degradation_mode, DegradationMode::Safe);
        assert_eq!(settings.startup_budget(), Some(Duration::from_secs(5)));
        assert_eq!(settings.unit_timeout_secs, 10);
        assert_eq!(settings.enabled_units().unwrap().len(), 2);
    }

    #[test]
    fn workspace_layer_wins_per_key() {
        let settings = layer(
            table("max_concurrency = 2\nshell = \"zsh\""),
            table("max_concurrency = 6"),
        )
        .unwrap();

        assert_eq!(settings.max_concurrency, 6);
        assert_eq!(settings.shell, "zsh");
        assert_eq!(settings.circuit_breaker_threshold, 3);
    }

    #[test]
    fn invalid_values_rejected() {
        for bad in [
            "max_concurrency = 0",
            "circuit_breaker_threshold = 0",
            "unit_timeout_secs = 0",
            "startup_budget_secs = 0",
            "enabled = [\"bad id\"]",
            "enabled = [\"a\", \"a\"]",
        ] {
            let err = layer(None, table(bad)).unwrap_err();
            assert!(
                err.downcast_ref::<ConfigError>().is_some(),
                "{bad} should be a config error, got {err:#}"
            );
        }
    }

    #[test]
    fn unknown_mode_is_parse_error() {
        let err = layer(None, table("degradation_mode = \"degraded\"")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn find_workspace_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(WORKSPACE_DIR)).unwrap();

        let sub_dir = dir.path().join("sub").join("dir");
        fs::create_dir_all(&sub_dir).unwrap();

        let root = Config::find_workspace_root(&sub_dir);
        assert_eq!(root.as_deref(), Some(dir.path()));
    }

    #[test]
    fn missing_files_give_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = layer(
            None,
            read_table(&Config::workspace_config_path(dir.path()), "workspace").unwrap(),
        )
        .unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(WORKSPACE_DIR)).unwrap();

        let mut config = Config {
            settings: Settings::default(),
            workspace_root: Some(dir.path().to_path_buf()),
        };
        config.settings.enabled = vec!["logging".to_string()];
        config.save_workspace().unwrap();

        let local = read_table(&Config::workspace_config_path(dir.path()), "workspace").unwrap();
        let settings = layer(None, local).unwrap();
        assert_eq!(settings.enabled, vec!["logging".to_string()]);
    }

    #[test]
    fn config_not_in_workspace() {
        let config = Config {
            settings: Settings::default(),
            workspace_root: None,
        };
        assert!(config.require_workspace_root().is_err());
    }
}
