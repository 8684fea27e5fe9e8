//! SQLite metadata cache
//!
//! The cache sits in `.unitwave/.cache/metadata.db` and stores one row per
//! unit: the fingerprint of the source it was extracted from plus the
//! extracted declaration. A row is only served while its fingerprint matches
//! the live source; anything else (absent, stale, undecodable) is a miss and
//! triggers a fresh extraction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::domain::{extract, Metadata, ParseError, UnitClass, UnitId};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode cache row: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupted cache row for '{0}': {1}")]
    Corrupt(String, String),
}

/// Lookup counters for the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub hits: usize,
    pub misses: usize,
    pub refreshed: usize,
}

/// Persisted cache summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub oldest_use: Option<i64>,
    pub newest_use: Option<i64>,
}

/// Persistent cache of extracted unit metadata keyed by unit ID
pub struct MetadataStore {
    /// Path to the SQLite database (None when running in memory)
    db_path: Option<PathBuf>,

    /// Database connection
    conn: Connection,

    stats: LookupStats,
}

impl MetadataStore {
    /// Schema version - bump when schema changes to force rebuild
    const SCHEMA_VERSION: i32 = 1;

    /// Creates or opens the cache database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create cache directory: {}", dir.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open cache database: {}", db_path.display()))?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .with_context(|| format!("Cache database unusable: {}", db_path.display()))?;

        let mut store = Self {
            db_path: Some(db_path.to_path_buf()),
            conn,
            stats: LookupStats::default(),
        };
        store.ensure_schema()?;

        Ok(store)
    }

    /// Creates a cache that lives only for this process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cache")?;
        let mut store = Self {
            db_path: None,
            conn,
            stats: LookupStats::default(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Opens the on-disk cache, falling back to memory if it is unusable
    ///
    /// An unreadable cache only costs re-extraction, so it never fails a load.
    pub fn open_or_memory(db_path: &Path) -> Result<Self> {
        match Self::open(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                tracing::warn!(path = %db_path.display(), error = %format!("{e:#}"), "metadata cache unavailable, using in-memory cache");
                Self::in_memory()
            }
        }
    }

    /// Ensures the schema is up to date
    fn ensure_schema(&mut self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version != Self::SCHEMA_VERSION {
            self.create_schema()?;
        }

        Ok(())
    }

    /// Gets the current schema version
    fn get_schema_version(&self) -> Result<i32> {
        let result: Option<i32> = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .optional()?;

        Ok(result.unwrap_or(0))
    }

    /// Creates the schema from scratch
    fn create_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "
            DROP TABLE IF EXISTS unit_metadata;

            CREATE TABLE unit_metadata (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                version TEXT NOT NULL,
                dependencies TEXT NOT NULL,
                class TEXT NOT NULL,
                provides TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL
            );

            CREATE INDEX idx_unit_metadata_last_used ON unit_metadata(last_used);
            ",
        )?;

        self.conn.execute(
            &format!("PRAGMA user_version = {}", Self::SCHEMA_VERSION),
            [],
        )?;

        Ok(())
    }

    /// Returns the cached entry for a unit, if present and decodable
    pub fn lookup(&self, unit_id: &UnitId) -> Result<Option<Metadata>, CacheError> {
        let row: Option<(String, String, String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT id, fingerprint, version, dependencies, class, provides
                 FROM unit_metadata WHERE id = ?1",
                params![unit_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, fingerprint, version, dependencies, class, provides)) = row else {
            return Ok(None);
        };

        let corrupt = |what: String| CacheError::Corrupt(unit_id.to_string(), what);

        let id = UnitId::new(id).map_err(|e| corrupt(e.to_string()))?;
        let dependencies: Vec<UnitId> =
            serde_json::from_str(&dependencies).map_err(|e| corrupt(e.to_string()))?;
        let class: UnitClass = class
            .parse()
            .map_err(|c| corrupt(format!("unknown class '{c}'")))?;
        let provides: Vec<String> =
            serde_json::from_str(&provides).map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(Metadata {
            id,
            version,
            dependencies,
            class,
            provides,
            fingerprint,
        }))
    }

    /// Returns cached metadata for `unit_id`, extracting from `source` on a miss
    ///
    /// A cached row is returned only if its fingerprint equals `fingerprint`.
    /// On a miss the source is parsed and the row overwritten. Cache I/O
    /// problems are logged and otherwise ignored.
    pub fn get_or_extract(
        &mut self,
        unit_id: &UnitId,
        source: &str,
        fingerprint: &str,
    ) -> Result<Metadata, ParseError> {
        let cached = match self.lookup(unit_id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(unit = %unit_id, error = %e, "treating unreadable cache entry as a miss");
                None
            }
        };

        let stale = match cached {
            Some(meta) if meta.fingerprint == fingerprint && &meta.id == unit_id => {
                self.stats.hits += 1;
                tracing::debug!(unit = %unit_id, "metadata cache hit");
                if let Err(e) = self.touch(unit_id) {
                    tracing::warn!(unit = %unit_id, error = %e, "failed to update cache timestamp");
                }
                return Ok(meta);
            }
            Some(_) => true,
            None => false,
        };

        self.stats.misses += 1;
        if stale {
            self.stats.refreshed += 1;
        }
        tracing::debug!(unit = %unit_id, stale, "metadata cache miss, extracting");

        let mut meta = match extract(source) {
            Ok(meta) => meta,
            Err(e) => {
                if let Err(err) = self.invalidate(unit_id) {
                    tracing::warn!(unit = %unit_id, error = %err, "failed to drop cache entry");
                }
                return Err(e);
            }
        };
        if &meta.id != unit_id {
            return Err(ParseError::IdMismatch {
                expected: unit_id.clone(),
                declared: meta.id,
            });
        }
        // Store under the caller's fingerprint so the next lookup compares like with like
        meta.fingerprint = fingerprint.to_string();

        if let Err(e) = self.store(&meta) {
            tracing::warn!(unit = %unit_id, error = %e, "failed to persist metadata");
        }

        Ok(meta)
    }

    /// Writes (or overwrites) the row for a unit
    pub fn store(&self, meta: &Metadata) -> Result<(), CacheError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR REPLACE INTO unit_metadata
                (id, fingerprint, version, dependencies, class, provides, cached_at, last_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                meta.id.as_str(),
                meta.fingerprint,
                meta.version,
                serde_json::to_string(&meta.dependencies)?,
                meta.class.as_str(),
                serde_json::to_string(&meta.provides)?,
                now,
            ],
        )?;
        Ok(())
    }

    /// Records that a row was used this session
    fn touch(&self, unit_id: &UnitId) -> Result<(), CacheError> {
        self.conn.execute(
            "UPDATE unit_metadata SET last_used = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), unit_id.as_str()],
        )?;
        Ok(())
    }

    /// Forces the next lookup for a unit to re-extract
    pub fn invalidate(&self, unit_id: &UnitId) -> Result<bool, CacheError> {
        let removed = self.conn.execute(
            "DELETE FROM unit_metadata WHERE id = ?1",
            params![unit_id.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Evicts rows not used within `retention`
    pub fn prune(&self, retention: Duration) -> Result<usize, CacheError> {
        let retention_secs = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(retention_secs);
        let removed = self.conn.execute(
            "DELETE FROM unit_metadata WHERE last_used < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!(removed, "pruned expired metadata cache entries");
        }
        Ok(removed)
    }

    /// Removes every row
    pub fn clear(&self) -> Result<usize, CacheError> {
        Ok(self.conn.execute("DELETE FROM unit_metadata", [])?)
    }

    /// Summarises the persisted rows
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let (entries, oldest_use, newest_use): (i64, Option<i64>, Option<i64>) =
            self.conn.query_row(
                "SELECT COUNT(*), MIN(last_used), MAX(last_used) FROM unit_metadata",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        Ok(CacheStats {
            entries: usize::try_from(entries).unwrap_or(0),
            oldest_use,
            newest_use,
        })
    }

    /// Lookup counters since the store was opened
    pub fn lookup_stats(&self) -> LookupStats {
        self.stats
    }

    /// Returns the database path, or None for an in-memory cache
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    #[cfg(test)]
    fn set_last_used(&self, unit_id: &UnitId, timestamp: i64) {
        self.conn
            .execute(
                "UPDATE unit_metadata SET last_used = ?1 WHERE id = ?2",
                params![timestamp, unit_id.as_str()],
            )
            .unwrap();
    }
}
