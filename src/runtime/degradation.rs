//! Degradation modes
//!
//! The mode is a session-wide switch deciding which unit classes are
//! attempted at all. It is consulted before the circuit breaker, so a unit
//! skipped by the mode never touches its breaker counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::UnitClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    /// Every class, including experimental units
    Full,
    /// Everything except experimental units
    #[default]
    Graceful,
    /// Core and standard units only
    Minimal,
    /// Core units only
    Safe,
}

impl DegradationMode {
    /// Returns true if a unit of `class` may be attempted in this mode
    pub fn allows(self, class: UnitClass) -> bool {
        match self {
            DegradationMode::Full => true,
            DegradationMode::Graceful => class != UnitClass::Experimental,
            DegradationMode::Minimal => matches!(class, UnitClass::Core | UnitClass::Standard),
            DegradationMode::Safe => class == UnitClass::Core,
        }
    }

    /// Classes attempted in this mode, strongest first
    pub fn allowed_classes(self) -> Vec<UnitClass> {
        UnitClass::all()
            .into_iter()
            .filter(|c| self.allows(*c))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationMode::Full => "full",
            DegradationMode::Graceful => "graceful",
            DegradationMode::Minimal => "minimal",
            DegradationMode::Safe => "safe",
        }
    }
}

impl fmt::Display for DegradationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DegradationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(DegradationMode::Full),
            "graceful" => Ok(DegradationMode::Graceful),
            "minimal" => Ok(DegradationMode::Minimal),
            "safe" => Ok(DegradationMode::Safe),
            other => Err(format!(
                "Unknown degradation mode '{}' (expected full, graceful, minimal or safe)",
                other
            )),
        }
    }
}
