//! Diagnostics: error records and status reports
//!
//! Nothing that goes wrong while loading units aborts the session. Problems
//! are recorded here and surfaced afterwards through the report and the
//! persisted error journal.

mod log;
mod report;

pub use log::{ErrorContext, ErrorJournal, ErrorKind, ErrorLog, Phase};
pub use report::{OpenBreaker, Outcome, StatusReport, UnitStatus};
