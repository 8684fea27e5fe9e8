//! Error-context log
//!
//! Every non-fatal problem during a load becomes exactly one
//! [`ErrorContext`]. The in-memory [`ErrorLog`] is shared by all workers of
//! a session and only ever appended to. [`ErrorJournal`] persists records
//! to `.unitwave/errors.jsonl`, one JSON object per line, so that `unitwave
//! errors` can show them after the session ended.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::domain::UnitId;

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad declaration header
    ParseError,
    /// Enabled unit without a readable source
    SourceUnavailable,
    /// Declared dependency absent from the enabled set
    UnresolvedDependency,
    /// A dependency was excluded before scheduling
    DependencyExcluded,
    /// Member of a dependency cycle
    Cycle,
    /// Failure inside a unit's initialization
    UnitExecution,
    /// Attempt intercepted by an open breaker
    CircuitOpen,
    /// A dependency did not succeed at run time
    DependencyNotMet,
    /// Session cancelled before completion
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::UnresolvedDependency => "unresolved_dependency",
            ErrorKind::DependencyExcluded => "dependency_excluded",
            ErrorKind::Cycle => "cycle",
            ErrorKind::UnitExecution => "unit_execution",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::DependencyNotMet => "dependency_not_met",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discover,
    Extract,
    Resolve,
    Schedule,
    Execute,
    Fallback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discover => "discover",
            Phase::Extract => "extract",
            Phase::Resolve => "resolve",
            Phase::Schedule => "schedule",
            Phase::Execute => "execute",
            Phase::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// None for session-level events
    pub unit_id: Option<UnitId>,

    pub kind: ErrorKind,

    pub phase: Phase,

    pub message: String,

    pub timestamp: DateTime<Utc>,

    /// Diagnostic key/value pairs captured with the error
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshot: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Creates a record attributed to a unit
    pub fn unit(unit_id: UnitId, kind: ErrorKind, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            unit_id: Some(unit_id),
            kind,
            phase,
            message: message.into(),
            timestamp: Utc::now(),
            snapshot: BTreeMap::new(),
        }
    }

    /// Creates a session-level record
    pub fn session(kind: ErrorKind, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            unit_id: None,
            kind,
            phase,
            message: message.into(),
            timestamp: Utc::now(),
            snapshot: BTreeMap::new(),
        }
    }

    /// Adds a snapshot entry
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.snapshot.insert(key.into(), value.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit_id {
            Some(id) => write!(f, "[{}] {} ({}): {}", self.phase, id, self.kind, self.message),
            None => write!(f, "[{}] session ({}): {}", self.phase, self.kind, self.message),
        }
    }
}

/// Append-only, thread-safe log shared by every worker of a session
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<ErrorContext>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ErrorContext>> {
        // A panicking writer cannot leave a half-pushed Vec behind
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record
    pub fn record(&self, ctx: ErrorContext) {
        tracing::debug!(kind = %ctx.kind, phase = %ctx.phase, unit = ?ctx.unit_id.as_ref().map(UnitId::as_str), "{}", ctx.message);
        self.lock().push(ctx);
    }

    /// Returns a copy of every record in append order
    pub fn entries(&self) -> Vec<ErrorContext> {
        self.lock().clone()
    }

    /// Returns the records attributed to one unit
    pub fn for_unit(&self, unit_id: &UnitId) -> Vec<ErrorContext> {
        self.lock()
            .iter()
            .filter(|e| e.unit_id.as_ref() == Some(unit_id))
            .cloned()
            .collect()
    }

    /// Counts records of one kind
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// JSONL persistence for error records
pub struct ErrorJournal {
    path: PathBuf,
}

impl ErrorJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends records to the journal
    pub fn append(&self, entries: &[ErrorContext]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open error journal: {}", self.path.display()))?;

        file.lock_exclusive()
            .context("Failed to acquire write lock on error journal")?;

        let mut writer = BufWriter::new(&file);
        for entry in entries {
            let line = serde_json::to_string(entry).context("Failed to serialize error record")?;
            writeln!(writer, "{}", line).context("Failed to write error record")?;
        }
        writer.flush().context("Failed to flush error journal")?;

        // Lock is released when file is dropped
        Ok(())
    }

    /// Reads every record, skipping lines that fail to parse
    pub fn read_all(&self) -> Result<Vec<ErrorContext>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open error journal: {}", self.path.display()))?;

        file.lock_shared()
            .context("Failed to acquire read lock on error journal")?;

        let reader = BufReader::new(&file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(line = line_num + 1, error = %e, "skipping unreadable error record");
                }
            }
        }

        Ok(entries)
    }

    /// Returns the newest `limit` records, optionally for one unit
    pub fn tail(&self, limit: usize, unit: Option<&UnitId>) -> Result<Vec<ErrorContext>> {
        let mut entries: Vec<_> = self
            .read_all()?
            .into_iter()
            .filter(|e| unit.is_none() || e.unit_id.as_ref() == unit)
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    /// Drops records older than `retention`, returning how many were removed
    pub fn prune(&self, retention: Duration) -> Result<usize> {
        let entries = self.read_all()?;
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (keep, dropped): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.timestamp >= cutoff);
        if dropped.is_empty() {
            return Ok(0);
        }

        let temp_path = self.path.with_extension("jsonl.tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

            file.lock_exclusive()
                .context("Failed to acquire write lock on error journal")?;

            let mut writer = BufWriter::new(&file);
            for entry in &keep {
                let line = serde_json::to_string(entry).context("Failed to serialize error record")?;
                writeln!(writer, "{}", line).context("Failed to write error record")?;
            }
            writer.flush().context("Failed to flush error journal")?;
        }

        // Atomic rename
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        Ok(dropped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[test]
    fn log_is_append_only_across_threads() {
        let log = ErrorLog::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        log.record(ErrorContext::unit(
                            id(&format!("u{i}")),
                            ErrorKind::UnitExecution,
                            Phase::Execute,
                            format!("attempt {j}"),
                        ));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(log.len(), 200);
        assert_eq!(log.for_unit(&id("u3")).len(), 25);
        assert_eq!(log.count(ErrorKind::UnitExecution), 200);
    }

    #[test]
    fn log_survives_poisoning() {
        let log = ErrorLog::new();
        let poisoner = log.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison");
        })
        .join();

        log.record(ErrorContext::session(ErrorKind::Cancelled, Phase::Schedule, "late"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn display_includes_unit_and_kind() {
        let ctx = ErrorContext::unit(id("fzf"), ErrorKind::Cycle, Phase::Resolve, "cycle [fzf]");
        assert_eq!(ctx.to_string(), "[resolve] fzf (cycle): cycle [fzf]");

        let session = ErrorContext::session(ErrorKind::Cancelled, Phase::Schedule, "budget");
        assert!(session.to_string().contains("session"));
    }

    #[test]
    fn journal_append_and_read() {
        let dir = TempDir::new().unwrap();
        let journal = ErrorJournal::new(dir.path().join("errors.jsonl"));

        assert!(journal.read_all().unwrap().is_empty());

        let first = ErrorContext::unit(id("a"), ErrorKind::ParseError, Phase::Extract, "no id")
            .with("path", "units/a.unit");
        journal.append(&[first.clone()]).unwrap();
        journal
            .append(&[ErrorContext::unit(id("b"), ErrorKind::Cycle, Phase::Resolve, "loop")])
            .unwrap();

        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert_eq!(entries[0].snapshot["path"], "units/a.unit");
    }

    #[test]
    fn journal_skips_corrupted_lines() {
        let dir = TempDir::new().unwrap();
        let journal = ErrorJournal::new(dir.path().join("errors.jsonl"));
        journal
            .append(&[ErrorContext::unit(id("a"), ErrorKind::Cycle, Phase::Resolve, "x")])
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(journal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn journal_tail_filters_by_unit() {
        let dir = TempDir::new().unwrap();
        let journal = ErrorJournal::new(dir.path().join("errors.jsonl"));
        let entries: Vec<_> = (0..5)
            .map(|i| {
                let unit = if i % 2 == 0 { "even" } else { "odd" };
                ErrorContext::unit(id(unit), ErrorKind::UnitExecution, Phase::Execute, format!("{i}"))
            })
            .collect();
        journal.append(&entries).unwrap();

        let tail = journal.tail(2, None).unwrap();
        assert_eq!(tail.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(), vec!["3", "4"]);

        let even = journal.tail(10, Some(&id("even"))).unwrap();
        assert_eq!(even.len(), 3);
    }

    #[test]
    fn journal_prune_by_age() {
        let dir = TempDir::new().unwrap();
        let journal = ErrorJournal::new(dir.path().join("errors.jsonl"));

        let mut old = ErrorContext::unit(id("old"), ErrorKind::Cycle, Phase::Resolve, "old");
        old.timestamp = Utc::now() - chrono::Duration::days(10);
        let fresh = ErrorContext::unit(id("new"), ErrorKind::Cycle, Phase::Resolve, "new");
        journal.append(&[old, fresh.clone()]).unwrap();

        let removed = journal.prune(Duration::from_secs(7 * 86_400)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(journal.read_all().unwrap(), vec![fresh]);
        assert_eq!(journal.prune(Duration::from_secs(7 * 86_400)).unwrap(), 0);
    }
}
