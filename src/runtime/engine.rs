//! Wave execution engine
//!
//! Each wave is a fan-out/fan-in stage. Eligible units are spawned onto a
//! [`JoinSet`], at most `max_concurrency` of them holding a permit at once.
//! The engine then waits for every task of the wave (the commit barrier),
//! merges the staged writes of succeeded units into the session context in
//! declaration order, and only then starts the next wave.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::body::{UnitBody, UnitRegistry};
use super::context::{SessionContext, UnitScope};
use super::resilience::{AttemptResult, Resilience};
use crate::diagnostics::{ErrorContext, ErrorKind, ErrorLog, Outcome, Phase, UnitStatus};
use crate::domain::{ScheduleError, Unit, UnitId, Wave};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub max_concurrency: usize,
    pub unit_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            unit_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of running every wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRun {
    /// One entry per scheduled unit, in wave order
    pub units: Vec<UnitStatus>,
    pub cancelled: bool,
}

impl EngineRun {
    pub fn outcome_of(&self, unit_id: &UnitId) -> Option<Outcome> {
        self.units.iter().find(|u| &u.id == unit_id).map(|u| u.outcome)
    }
}

/// What a spawned unit task hands back at the barrier
struct TaskReport {
    unit_id: UnitId,
    scope: UnitScope,
    /// None if cancelled before finishing
    result: Option<AttemptResult>,
}

pub struct Engine {
    resilience: Arc<Resilience>,
    context: Arc<SessionContext>,
    errors: ErrorLog,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        resilience: Arc<Resilience>,
        context: Arc<SessionContext>,
        errors: ErrorLog,
        options: EngineOptions,
    ) -> Self {
        Self {
            resilience,
            context,
            errors,
            options: EngineOptions {
                max_concurrency: options.max_concurrency.max(1),
                ..options
            },
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Runs the waves in order
    ///
    /// Returns an error only when the waves disagree with the unit table,
    /// which is a bookkeeping failure of the caller.
    pub async fn run(
        &self,
        waves: &[Wave],
        units: &HashMap<UnitId, Unit>,
        bodies: &UnitRegistry,
        cancel: &CancellationToken,
    ) -> Result<EngineRun, ScheduleError> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency));
        let mut outcomes: HashMap<UnitId, Outcome> = HashMap::new();
        let mut statuses = Vec::new();

        for (index, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                for unit_id in wave {
                    let unit = lookup(units, unit_id)?;
                    outcomes.insert(unit_id.clone(), Outcome::NotAttempted);
                    statuses.push(status(unit, index, Outcome::NotAttempted, "session cancelled"));
                }
                continue;
            }

            tracing::info!(wave = index, units = wave.len(), "wave started");
            let mut settled: HashMap<UnitId, UnitStatus> = HashMap::new();
            let mut tasks = JoinSet::new();

            for unit_id in wave {
                let unit = lookup(units, unit_id)?;

                if let Some(dependency) = unmet_dependency(unit, &outcomes)? {
                    self.errors.record(
                        ErrorContext::unit(
                            unit_id.clone(),
                            ErrorKind::DependencyNotMet,
                            Phase::Schedule,
                            format!("dependency '{}' did not succeed", dependency),
                        )
                        .with("dependency", dependency),
                    );
                    settled.insert(
                        unit_id.clone(),
                        status(
                            unit,
                            index,
                            Outcome::NotAttempted,
                            format!("dependency '{}' did not succeed", dependency),
                        ),
                    );
                    continue;
                }

                if !self.resilience.feature_available(unit_id, unit.class()) {
                    tracing::debug!(unit = %unit_id, class = %unit.class(), "skipped by degradation mode");
                    settled.insert(
                        unit_id.clone(),
                        status(
                            unit,
                            index,
                            Outcome::SkippedDegraded,
                            format!(
                                "class '{}' not attempted in {} mode",
                                unit.class(),
                                self.resilience.degradation_mode()
                            ),
                        ),
                    );
                    continue;
                }

                let Some(body) = bodies.get(unit_id) else {
                    self.errors.record(ErrorContext::unit(
                        unit_id.clone(),
                        ErrorKind::UnitExecution,
                        Phase::Execute,
                        "no body registered",
                    ));
                    settled.insert(
                        unit_id.clone(),
                        status(unit, index, Outcome::Failed, "no body registered"),
                    );
                    continue;
                };

                tracing::debug!(unit = %unit_id, wave = index, "dispatching unit");
                self.spawn(&mut tasks, unit_id.clone(), body, &semaphore, cancel);
            }

            // Commit barrier: every dispatched unit reaches a terminal state here
            let mut finished: HashMap<UnitId, (UnitScope, Option<AttemptResult>)> = HashMap::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(report) => {
                        finished.insert(report.unit_id, (report.scope, report.result));
                    }
                    Err(e) => tracing::error!(error = %e, "unit task lost"),
                }
            }

            for unit_id in wave {
                if settled.contains_key(unit_id) {
                    continue;
                }
                let unit = lookup(units, unit_id)?;
                let entry = match finished.remove(unit_id) {
                    Some((scope, Some(result))) => {
                        if result.outcome == Outcome::Succeeded {
                            let mut staged = scope.take_staged();
                            for name in &unit.metadata.provides {
                                if !staged.capabilities.contains(name) {
                                    staged.capabilities.push(name.clone());
                                }
                            }
                            self.context.commit(unit_id, staged);
                        }
                        UnitStatus {
                            id: unit_id.clone(),
                            wave: Some(index),
                            class: Some(unit.class()),
                            outcome: result.outcome,
                            fallback_used: result.fallback_used,
                            detail: result.detail,
                        }
                    }
                    Some((_, None)) => status(unit, index, Outcome::NotAttempted, "session cancelled"),
                    None => status(unit, index, Outcome::NotAttempted, "unit task lost"),
                };
                settled.insert(unit_id.clone(), entry);
            }

            for unit_id in wave {
                if let Some(entry) = settled.remove(unit_id) {
                    outcomes.insert(unit_id.clone(), entry.outcome);
                    statuses.push(entry);
                }
            }
            tracing::info!(wave = index, "wave finished");
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            let skipped = statuses
                .iter()
                .filter(|s| s.outcome == Outcome::NotAttempted && s.detail.as_deref() == Some("session cancelled"))
                .count();
            tracing::warn!(units = skipped, "load cancelled");
            self.errors.record(
                ErrorContext::session(
                    ErrorKind::Cancelled,
                    Phase::Schedule,
                    format!("load cancelled, {} unit(s) not attempted", skipped),
                )
                .with("not_attempted", skipped),
            );
        }

        Ok(EngineRun {
            units: statuses,
            cancelled,
        })
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<TaskReport>,
        unit_id: UnitId,
        body: Arc<dyn UnitBody>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        let scope = self.context.scope(unit_id.clone());
        let resilience = Arc::clone(&self.resilience);
        let errors = self.errors.clone();
        let semaphore = Arc::clone(semaphore);
        let cancel = cancel.clone();
        let timeout = self.options.unit_timeout;

        tasks.spawn(async move {
            let attempt = async {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire() => permit.ok()?,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = resilience.execute(&unit_id, body.as_ref(), &scope, timeout, &errors) => Some(result),
                }
            };

            let result = match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(unit = %unit_id, "unit task panicked outside its body");
                    None
                }
            };

            TaskReport {
                unit_id,
                scope,
                result,
            }
        });
    }
}

fn lookup<'a>(units: &'a HashMap<UnitId, Unit>, unit_id: &UnitId) -> Result<&'a Unit, ScheduleError> {
    units
        .get(unit_id)
        .ok_or_else(|| ScheduleError::Bookkeeping(format!("wave lists unknown unit '{}'", unit_id)))
}

/// Returns the first dependency that did not succeed
fn unmet_dependency<'a>(
    unit: &'a Unit,
    outcomes: &HashMap<UnitId, Outcome>,
) -> Result<Option<&'a UnitId>, ScheduleError> {
    for dependency in unit.dependencies() {
        match outcomes.get(dependency) {
            Some(Outcome::Succeeded) => {}
            Some(_) => return Ok(Some(dependency)),
            None => {
                return Err(ScheduleError::Bookkeeping(format!(
                    "'{}' scheduled before its dependency '{}'",
                    unit.id(),
                    dependency
                )))
            }
        }
    }
    Ok(None)
}

fn status(unit: &Unit, wave: usize, outcome: Outcome, detail: impl Into<String>) -> UnitStatus {
    UnitStatus {
        id: unit.id().clone(),
        wave: Some(wave),
        class: Some(unit.class()),
        outcome,
        fallback_used: false,
        detail: Some(detail.into()),
    }
}
