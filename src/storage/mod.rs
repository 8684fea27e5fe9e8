//! # Storage Layer
//!
//! Persistence for unitwave workspaces.
//!
//! ## Storage Formats
//!
//! | Data | Format | Location |
//! |------|--------|----------|
//! | Unit sources | Shell + comment header | `.unitwave/units/{id}.unit` |
//! | Fallbacks | Shell | `.unitwave/units/{id}.fallback` |
//! | Config | TOML | `.unitwave/config.toml` |
//! | Metadata cache | SQLite (auto-regenerated) | `.unitwave/.cache/metadata.db` |
//! | Error log | JSONL | `.unitwave/errors.jsonl` |
//! | Last report | JSON | `.unitwave/status.json` |
//!
//! ## Concurrency Safety
//!
//! - [`MetadataStore`] uses SQLite in WAL mode
//! - The error log is appended under an exclusive `fs2` lock
//!
//! ## Key Types
//!
//! - [`Workspace`] - Entry point for accessing a unitwave workspace
//! - [`MetadataStore`] - Fingerprint-keyed cache of unit declarations
//! - [`Config`] - Workspace and global configuration

mod cache;
mod config;
mod workspace;

pub use cache::{CacheError, CacheStats, LookupStats, MetadataStore};
pub use config::{Config, ConfigError, Settings, CONFIG_HOME_ENV, WORKSPACE_DIR};
pub use workspace::{
    EnabledUnits, InvalidUnitFile, UnitSource, Workspace, WorkspaceError, FALLBACK_EXT, UNIT_EXT,
};
