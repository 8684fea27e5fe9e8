//! Domain models for unitwave
//!
//! Contains unit declarations and the dependency scheduling logic,
//! without any I/O concerns.

mod declaration;
mod graph;
mod unit;

pub use declaration::{extract, fingerprint, ParseError, DEFAULT_VERSION};
pub use graph::{
    Cycle, CycleError, DependencyGraph, Excluded, ExclusionReason, GraphBuild, Resolution,
    ScheduleError, Wave,
};
pub use unit::{IdError, Metadata, Unit, UnitClass, UnitId};
