//! Status report of a load

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{UnitClass, UnitId};
use crate::runtime::DegradationMode;

/// Final outcome of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Blocked by an open breaker with no fallback
    SkippedOpen,
    /// Not permitted by the degradation mode
    SkippedDegraded,
    /// A dependency did not succeed, or the session was cancelled
    NotAttempted,
    /// Removed before scheduling
    Excluded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::SkippedOpen => "skipped-open",
            Outcome::SkippedDegraded => "skipped-degraded",
            Outcome::NotAttempted => "not-attempted",
            Outcome::Excluded => "excluded",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub id: UnitId,

    /// None for units that never reached a wave
    pub wave: Option<usize>,

    /// None when the declaration could not be read
    pub class: Option<UnitClass>,

    pub outcome: Outcome,

    #[serde(default)]
    pub fallback_used: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A breaker left open at the end of a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBreaker {
    pub unit_id: UnitId,
    pub consecutive_failures: u32,
    pub has_fallback: bool,
}

/// Queryable snapshot of a finished load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: DegradationMode,
    pub cancelled: bool,
    pub waves: Vec<Vec<UnitId>>,

    /// Scheduled units in wave order, then excluded units in enabled order
    pub units: Vec<UnitStatus>,

    pub open_breakers: Vec<OpenBreaker>,
    pub error_count: usize,
}

impl StatusReport {
    /// Returns the entry for a unit
    pub fn unit(&self, id: &UnitId) -> Option<&UnitStatus> {
        self.units.iter().find(|u| &u.id == id)
    }

    pub fn outcome_of(&self, id: &UnitId) -> Option<Outcome> {
        self.unit(id).map(|u| u.outcome)
    }

    /// Counts units per outcome
    pub fn summary(&self) -> BTreeMap<Outcome, usize> {
        let mut counts = BTreeMap::new();
        for unit in &self.units {
            *counts.entry(unit.outcome).or_insert(0) += 1;
        }
        counts
    }

    /// Returns true if every unit succeeded
    pub fn is_clean(&self) -> bool {
        self.units.iter().all(|u| u.outcome == Outcome::Succeeded)
    }

    /// Returns the IDs with a given outcome, in report order
    pub fn with_outcome(&self, outcome: Outcome) -> Vec<&UnitId> {
        self.units
            .iter()
            .filter(|u| u.outcome == outcome)
            .map(|u| &u.id)
            .collect()
    }

    /// Writes the report as JSON (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write report: {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename report to {}", path.display()))
    }

    /// Loads the last saved report, None if there is none
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read report: {}", path.display()))?;
        let report = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse report: {}", path.display()))?;
        Ok(Some(report))
    }
}
