//! Unit identity and declaration model
//!
//! A unit is an independently authored startup item. Its identity is a
//! short name (`fzf`, `secure-history`, `osint.search`) and its declaration
//! carries a version, dependency names, a class tag, and the capabilities it
//! publishes once it has loaded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a unit id
const MAX_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum IdError {
    #[error("Unit ID is empty")]
    Empty,

    #[error("Unit ID too long ({0} chars, max 64): '{1}'")]
    TooLong(usize, String),

    #[error("Invalid unit ID '{0}': only ASCII letters, digits, '-', '_' and '.' are allowed")]
    InvalidChars(String),
}

/// Unit ID: a validated, case-sensitive name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId(String);

impl UnitId {
    /// Creates a unit ID, validating its characters
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > MAX_ID_LEN {
            return Err(IdError::TooLong(id.len(), id));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(IdError::InvalidChars(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UnitId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

impl TryFrom<String> for UnitId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.0
    }
}

impl AsRef<str> for UnitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Class tag deciding which degradation modes may attempt a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitClass {
    /// Always attempted, even in safe mode
    Core,
    /// Attempted in every mode except safe
    Standard,
    /// Default for untagged units
    #[default]
    Optional,
    /// Attempted only in full mode
    Experimental,
}

impl UnitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitClass::Core => "core",
            UnitClass::Standard => "standard",
            UnitClass::Optional => "optional",
            UnitClass::Experimental => "experimental",
        }
    }

    pub fn all() -> [UnitClass; 4] {
        [
            UnitClass::Core,
            UnitClass::Standard,
            UnitClass::Optional,
            UnitClass::Experimental,
        ]
    }
}

impl fmt::Display for UnitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "core" => Ok(UnitClass::Core),
            "standard" => Ok(UnitClass::Standard),
            "optional" => Ok(UnitClass::Optional),
            "experimental" => Ok(UnitClass::Experimental),
            other => Err(other.to_string()),
        }
    }
}

/// Static declaration of a unit, extracted from its source header
///
/// This is the projection that the metadata cache persists. Two values
/// extracted from the same source compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: UnitId,

    pub version: String,

    /// Declared dependencies in declaration order, without duplicates
    pub dependencies: Vec<UnitId>,

    #[serde(default)]
    pub class: UnitClass,

    /// Capabilities published when the unit succeeds
    #[serde(default)]
    pub provides: Vec<String>,

    /// Content fingerprint of the source this was extracted from
    pub fingerprint: String,
}

/// A unit enabled for this session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub metadata: Metadata,

    /// Position in the enabled-unit list (tie-break only)
    pub position: usize,
}

impl Unit {
    pub fn new(metadata: Metadata, position: usize) -> Self {
        Self { metadata, position }
    }

    pub fn id(&self) -> &UnitId {
        &self.metadata.id
    }

    pub fn dependencies(&self) -> &[UnitId] {
        &self.metadata.dependencies
    }

    pub fn class(&self) -> UnitClass {
        self.metadata.class
    }
}
