//! Workspace management
//!
//! Handles workspace initialization, unit discovery, and the paths of
//! everything persisted under `.unitwave/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

use super::config::{Config, WORKSPACE_DIR};
use super::MetadataStore;
use crate::domain::UnitId;

/// Extension of unit source files
pub const UNIT_EXT: &str = "unit";

/// Extension of fallback routines next to a unit source
pub const FALLBACK_EXT: &str = "fallback";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Not in a unitwave workspace. Run 'unitwave init' first.")]
    NotInWorkspace,

    #[error("No source file for unit '{0}'")]
    MissingSource(UnitId),
}

/// A unit source file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSource {
    pub id: UnitId,
    pub path: PathBuf,

    /// Sibling `<id>.fallback` file, if present
    pub fallback: Option<PathBuf>,
}

/// A `.unit` file whose name is not a valid unit ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidUnitFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Enabled units split into those with a source file and those without
#[derive(Debug, Default)]
pub struct EnabledUnits {
    pub sources: Vec<UnitSource>,
    pub missing: Vec<UnitId>,

    /// Unit files that could not be enabled because of their name
    pub invalid: Vec<InvalidUnitFile>,
}

/// A unitwave workspace
pub struct Workspace {
    root: PathBuf,
    config: Config,
}

impl Workspace {
    /// Opens an existing workspace at the given path
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.join(WORKSPACE_DIR).is_dir() {
            return Err(WorkspaceError::NotInWorkspace.into());
        }

        let config = Config::for_workspace(&root)?;

        Ok(Self { root, config })
    }

    /// Opens the workspace containing `start` or one of its parents
    pub fn discover(start: &Path) -> Result<Self> {
        let root = Config::find_workspace_root(start).ok_or(WorkspaceError::NotInWorkspace)?;

        Self::open(root)
    }

    /// Initializes a new workspace at the given path
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir = root.join(WORKSPACE_DIR);

        for sub in [dir.join("units"), dir.join(".cache")] {
            fs::create_dir_all(&sub)
                .with_context(|| format!("Failed to create directory: {}", sub.display()))?;
        }

        let config_path = Config::workspace_config_path(&root);
        if !config_path.exists() {
            let default_config = r#"# unitwave configuration

# Units running at the same time within one wave
max_concurrency = 4

# Consecutive failures before a unit's circuit breaker opens
circuit_breaker_threshold = 3

# full, graceful, minimal or safe
degradation_mode = "graceful"

# Days an unused metadata cache entry is kept
cache_retention_days = 30

# Seconds a single unit may run before it counts as failed
unit_timeout_secs = 10

# Units to load, in order (empty loads every file in units/)
enabled = []
"#;
            fs::write(&config_path, default_config)
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        let gitignore_path = dir.join(".gitignore");
        if !gitignore_path.exists() {
            let gitignore = r#"# Metadata cache (regenerated from unit sources)
.cache/

# Per-machine load results
status.json
errors.jsonl
"#;
            fs::write(&gitignore_path, gitignore).with_context(|| {
                format!("Failed to write .gitignore: {}", gitignore_path.display())
            })?;
        }

        Self::open(root)
    }

    /// Returns the workspace root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the .unitwave directory path
    pub fn dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Returns the directory holding unit sources
    pub fn units_dir(&self) -> PathBuf {
        self.dir().join("units")
    }

    /// Returns the metadata cache database path
    pub fn cache_path(&self) -> PathBuf {
        self.dir().join(".cache").join("metadata.db")
    }

    /// Returns the path of the last persisted status report
    pub fn status_path(&self) -> PathBuf {
        self.dir().join("status.json")
    }

    /// Returns the path of the persisted error log
    pub fn errors_path(&self) -> PathBuf {
        self.dir().join("errors.jsonl")
    }

    /// Opens the metadata cache, in memory if the file is unusable
    pub fn metadata_store(&self) -> Result<MetadataStore> {
        MetadataStore::open_or_memory(&self.cache_path())
    }

    /// Lists every unit source in `units/`, sorted by file name
    pub fn discover_units(&self) -> Result<Vec<UnitSource>> {
        Ok(self.scan_units()?.0)
    }

    fn scan_units(&self) -> Result<(Vec<UnitSource>, Vec<InvalidUnitFile>)> {
        let dir = self.units_dir();
        if !dir.is_dir() {
            return Ok((vec![], vec![]));
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to read units directory: {}", dir.display()))?
        {
            let path = entry
                .with_context(|| format!("Failed to read units directory: {}", dir.display()))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == UNIT_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut sources = Vec::with_capacity(paths.len());
        let mut invalid = Vec::new();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping unit file with a non UTF-8 name");
                invalid.push(InvalidUnitFile {
                    path,
                    reason: "file name is not valid UTF-8".to_string(),
                });
                continue;
            };
            let id = match UnitId::new(stem) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unit file with an invalid name");
                    invalid.push(InvalidUnitFile {
                        reason: e.to_string(),
                        path,
                    });
                    continue;
                }
            };
            let fallback = path.with_extension(FALLBACK_EXT);
            sources.push(UnitSource {
                id,
                fallback: fallback.is_file().then_some(fallback),
                path,
            });
        }

        Ok((sources, invalid))
    }

    /// Resolves the enabled-unit list against the files on disk
    ///
    /// With an empty `enabled` setting every discovered unit is enabled in
    /// file-name order. Otherwise the configured order is kept and listed
    /// IDs without a file are reported as missing.
    pub fn enabled_units(&self) -> Result<EnabledUnits> {
        let (discovered, invalid) = self.scan_units()?;
        let enabled = self.config.settings.enabled_units()?;

        if enabled.is_empty() {
            return Ok(EnabledUnits {
                sources: discovered,
                missing: vec![],
                invalid,
            });
        }

        let mut result = EnabledUnits::default();
        for id in enabled {
            match discovered.iter().find(|s| s.id == id) {
                Some(source) => result.sources.push(source.clone()),
                None => result.missing.push(id),
            }
        }
        Ok(result)
    }

    /// Returns a relative path from the workspace root
    pub fn relative_path(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(|p| p.to_path_buf())
    }
}
