//! # Runtime
//!
//! Everything that happens once the waves are known: the session context
//! units write into, the bodies that run, the resilience layer around each
//! attempt, and the engine driving the waves.
//!
//! ## Key Types
//!
//! - [`Engine`] - Runs waves with bounded concurrency and a commit barrier
//! - [`Resilience`] - Circuit breakers, fallbacks and degradation mode
//! - [`SessionContext`] / [`UnitScope`] - Shared state with staged writes
//! - [`UnitBody`] - Initialization routine of a unit

mod body;
mod breaker;
mod context;
mod degradation;
mod engine;
mod resilience;

pub use body::{from_async, from_fn, ScriptBody, UnitBody, UnitFailure, UnitRegistry, UNIT_ID_ENV};
pub use breaker::{BreakerState, BreakerStatus, BreakerTable};
pub use context::{SessionContext, StagedWrites, UnitScope};
pub use degradation::DegradationMode;
pub use engine::{Engine, EngineOptions, EngineRun};
pub use resilience::{guarded, AttemptResult, Resilience};
