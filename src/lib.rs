//! unitwave - dependency-ordered, wave-parallel loading of shell units
//!
//! A unit is a script with a declaration header naming its dependencies.
//! unitwave extracts those declarations (through a fingerprinted cache),
//! orders the units into waves, runs each wave concurrently, and contains
//! failures with per-unit circuit breakers, fallbacks and degradation
//! modes.

pub mod cli;
pub mod diagnostics;
pub mod domain;
pub mod runtime;
pub mod session;
pub mod storage;

pub use diagnostics::{ErrorContext, ErrorKind, StatusReport};
pub use domain::{Metadata, Unit, UnitClass, UnitId};
pub use session::{Session, SessionError, SessionOptions, UnitInput, WorkspaceInputs};
