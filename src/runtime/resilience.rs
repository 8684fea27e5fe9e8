//! Resilience layer
//!
//! Wraps every unit attempt: the circuit breaker decides whether the body
//! runs at all, a registered fallback stands in while the breaker is open,
//! and the degradation mode decides which classes are attempted.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;

use super::body::{panic_message, UnitBody, UnitFailure};
use super::breaker::{BreakerState, BreakerStatus, BreakerTable};
use super::context::UnitScope;
use super::degradation::DegradationMode;
use crate::diagnostics::{ErrorContext, ErrorKind, ErrorLog, Outcome, Phase};
use crate::domain::{UnitClass, UnitId};

/// Result of one attempt through the resilience layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub outcome: Outcome,
    pub fallback_used: bool,
    pub detail: Option<String>,
}

impl AttemptResult {
    fn succeeded(fallback_used: bool) -> Self {
        Self {
            outcome: Outcome::Succeeded,
            fallback_used,
            detail: fallback_used.then(|| "fallback succeeded".to_string()),
        }
    }

    fn failed(fallback_used: bool, failure: &UnitFailure) -> Self {
        Self {
            outcome: Outcome::Failed,
            fallback_used,
            detail: Some(failure.to_string()),
        }
    }
}

/// Breaker table, fallback registry and degradation mode of one scheduler
pub struct Resilience {
    breakers: BreakerTable,
    fallbacks: DashMap<UnitId, Arc<dyn UnitBody>>,
    mode: RwLock<DegradationMode>,
}

impl Resilience {
    pub fn new(threshold: u32, cooldown: Option<Duration>, mode: DegradationMode) -> Self {
        Self {
            breakers: BreakerTable::new(threshold, cooldown),
            fallbacks: DashMap::new(),
            mode: RwLock::new(mode),
        }
    }

    pub fn breakers(&self) -> &BreakerTable {
        &self.breakers
    }

    /// Registers the routine run instead of a unit while its breaker is open
    pub fn register_fallback(&self, unit_id: UnitId, body: Arc<dyn UnitBody>) {
        self.fallbacks.insert(unit_id, body);
    }

    pub fn unregister_fallback(&self, unit_id: &UnitId) -> bool {
        self.fallbacks.remove(unit_id).is_some()
    }

    pub fn has_fallback(&self, unit_id: &UnitId) -> bool {
        self.fallbacks.contains_key(unit_id)
    }

    fn fallback(&self, unit_id: &UnitId) -> Option<Arc<dyn UnitBody>> {
        self.fallbacks.get(unit_id).map(|f| Arc::clone(f.value()))
    }

    pub fn set_degradation_mode(&self, mode: DegradationMode) {
        let mut current = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        let previous = *current;
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "degradation mode changed");
            *current = mode;
        }
    }

    pub fn degradation_mode(&self) -> DegradationMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if the current mode permits attempting a unit of `class`
    ///
    /// Breaker state is not consulted.
    pub fn feature_available(&self, _unit_id: &UnitId, class: UnitClass) -> bool {
        self.degradation_mode().allows(class)
    }

    /// Closes a unit's breaker by hand
    pub fn reset(&self, unit_id: &UnitId) -> bool {
        self.breakers.reset(unit_id)
    }

    /// Currently open breakers
    pub fn open_breakers(&self) -> Vec<BreakerState> {
        self.breakers.open_breakers()
    }

    /// Runs one attempt of a unit
    ///
    /// With the breaker closed the body runs and its result feeds the
    /// breaker. With the breaker open the body is not invoked: the fallback
    /// runs if one is registered, otherwise the unit is skipped. Open-state
    /// attempts never change the failure counter.
    pub async fn execute(
        &self,
        unit_id: &UnitId,
        body: &dyn UnitBody,
        scope: &UnitScope,
        timeout: Duration,
        errors: &ErrorLog,
    ) -> AttemptResult {
        if !self.breakers.allows(unit_id) {
            return self.blocked(unit_id, scope, timeout, errors).await;
        }

        match guarded(body, scope, timeout).await {
            Ok(()) => {
                self.breakers.record_success(unit_id);
                AttemptResult::succeeded(false)
            }
            Err(failure) => {
                let status = self.breakers.record_failure(unit_id);
                let failures = self
                    .breakers
                    .state(unit_id)
                    .map_or(0, |s| s.consecutive_failures);
                tracing::warn!(unit = %unit_id, error = %failure, failures, "unit failed");
                errors.record(
                    ErrorContext::unit(
                        unit_id.clone(),
                        ErrorKind::UnitExecution,
                        Phase::Execute,
                        failure.to_string(),
                    )
                    .with("consecutive_failures", failures)
                    .with("threshold", self.breakers.threshold())
                    .with("breaker", if status == BreakerStatus::Open { "open" } else { "closed" }),
                );
                AttemptResult::failed(false, &failure)
            }
        }
    }

    async fn blocked(
        &self,
        unit_id: &UnitId,
        scope: &UnitScope,
        timeout: Duration,
        errors: &ErrorLog,
    ) -> AttemptResult {
        let fallback = self.fallback(unit_id);
        let failures = self
            .breakers
            .state(unit_id)
            .map_or(0, |s| s.consecutive_failures);

        errors.record(
            ErrorContext::unit(
                unit_id.clone(),
                ErrorKind::CircuitOpen,
                Phase::Execute,
                "circuit breaker open, attempt not made",
            )
            .with("consecutive_failures", failures)
            .with("has_fallback", fallback.is_some()),
        );

        let Some(fallback) = fallback else {
            tracing::debug!(unit = %unit_id, "breaker open, no fallback");
            return AttemptResult {
                outcome: Outcome::SkippedOpen,
                fallback_used: false,
                detail: Some("circuit breaker open".to_string()),
            };
        };

        tracing::debug!(unit = %unit_id, "breaker open, running fallback");
        match guarded(fallback.as_ref(), scope, timeout).await {
            Ok(()) => AttemptResult::succeeded(true),
            Err(failure) => {
                tracing::warn!(unit = %unit_id, error = %failure, "fallback failed");
                errors.record(ErrorContext::unit(
                    unit_id.clone(),
                    ErrorKind::UnitExecution,
                    Phase::Fallback,
                    failure.to_string(),
                ));
                AttemptResult::failed(true, &failure)
            }
        }
    }
}

/// Runs a body with a timeout, turning panics into failures
pub async fn guarded(
    body: &dyn UnitBody,
    scope: &UnitScope,
    timeout: Duration,
) -> Result<(), UnitFailure> {
    let attempt = AssertUnwindSafe(body.init(scope)).catch_unwind();
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(UnitFailure::Panicked(panic_message(payload.as_ref()))),
        Err(_) => Err(UnitFailure::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::body::{from_async, from_fn};
    use crate::runtime::SessionContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn counting_failure(calls: Arc<AtomicUsize>) -> Arc<dyn UnitBody> {
        from_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UnitFailure::failed("boom"))
        })
    }

    async fn attempt(
        layer: &Resilience,
        unit: &UnitId,
        body: &dyn UnitBody,
        errors: &ErrorLog,
    ) -> AttemptResult {
        let ctx = SessionContext::new();
        let scope = ctx.scope(unit.clone());
        layer.execute(unit, body, &scope, TIMEOUT, errors).await
    }

    #[tokio::test]
    async fn threshold_opens_and_fallback_takes_over() {
        let layer = Resilience::new(3, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("x");
        let calls = Arc::new(AtomicUsize::new(0));
        let body = counting_failure(Arc::clone(&calls));

        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fallback_calls);
        layer.register_fallback(
            x.clone(),
            from_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        for _ in 0..3 {
            let result = attempt(&layer, &x, body.as_ref(), &errors).await;
            assert_eq!(result.outcome, Outcome::Failed);
        }
        assert_eq!(layer.breakers().status(&x), BreakerStatus::Open);

        let fourth = attempt(&layer, &x, body.as_ref(), &errors).await;
        assert_eq!(fourth.outcome, Outcome::Succeeded);
        assert!(fourth.fallback_used);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(layer.breakers().state(&x).unwrap().consecutive_failures, 3);

        assert_eq!(errors.count(ErrorKind::UnitExecution), 3);
        assert_eq!(errors.count(ErrorKind::CircuitOpen), 1);
    }

    #[tokio::test]
    async fn open_without_fallback_is_skipped() {
        let layer = Resilience::new(1, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("x");
        let calls = Arc::new(AtomicUsize::new(0));
        let body = counting_failure(Arc::clone(&calls));

        attempt(&layer, &x, body.as_ref(), &errors).await;
        let second = attempt(&layer, &x, body.as_ref(), &errors).await;

        assert_eq!(second.outcome, Outcome::SkippedOpen);
        assert!(!second.fallback_used);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(layer.open_breakers().len(), 1);
    }

    #[tokio::test]
    async fn failing_fallback_reports_failed() {
        let layer = Resilience::new(1, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("x");
        let body = counting_failure(Arc::new(AtomicUsize::new(0)));
        layer.register_fallback(x.clone(), from_fn(|_| Err(UnitFailure::failed("also broken"))));

        attempt(&layer, &x, body.as_ref(), &errors).await;
        let result = attempt(&layer, &x, body.as_ref(), &errors).await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.fallback_used);
        assert_eq!(result.detail.as_deref(), Some("also broken"));
        assert_eq!(layer.breakers().state(&x).unwrap().consecutive_failures, 1);

        let fallback_errors: Vec<_> = errors
            .entries()
            .into_iter()
            .filter(|e| e.phase == Phase::Fallback)
            .collect();
        assert_eq!(fallback_errors.len(), 1);
    }

    #[tokio::test]
    async fn reset_lets_body_run_again() {
        let layer = Resilience::new(1, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("x");
        let calls = Arc::new(AtomicUsize::new(0));
        let body = counting_failure(Arc::clone(&calls));

        attempt(&layer, &x, body.as_ref(), &errors).await;
        assert!(layer.reset(&x));
        attempt(&layer, &x, body.as_ref(), &errors).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let layer = Resilience::new(2, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("x");
        let fail = counting_failure(Arc::new(AtomicUsize::new(0)));
        let ok = from_fn(|_| Ok(()));

        attempt(&layer, &x, fail.as_ref(), &errors).await;
        attempt(&layer, &x, ok.as_ref(), &errors).await;
        attempt(&layer, &x, fail.as_ref(), &errors).await;
        assert_eq!(layer.breakers().status(&x), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let layer = Resilience::new(1, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("slow");
        let body = from_async(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let ctx = SessionContext::new();
        let scope = ctx.scope(x.clone());
        let result = layer
            .execute(&x, body.as_ref(), &scope, Duration::from_millis(20), &errors)
            .await;

        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.detail.unwrap().contains("timed out"));
        assert_eq!(layer.breakers().status(&x), BreakerStatus::Open);
    }

    #[tokio::test]
    async fn blocking_body_still_times_out() {
        let layer = Resilience::new(1, None, DegradationMode::Graceful);
        let errors = ErrorLog::new();
        let x = id("stuck");
        let body = from_fn(|_| {
            std::thread::sleep(Duration::from_millis(1000));
            Ok(())
        });

        let ctx = SessionContext::new();
        let scope = ctx.scope(x.clone());
        let started = std::time::Instant::now();
        let result = layer
            .execute(&x, body.as_ref(), &scope, Duration::from_millis(100), &errors)
            .await;

        assert!(started.elapsed() < Duration::from_millis(800));
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.detail.unwrap().contains("timed out"));
        assert_eq!(layer.breakers().status(&x), BreakerStatus::Open);
        assert_eq!(errors.count(ErrorKind::UnitExecution), 1);
    }

    #[tokio::test]
    async fn panic_is_caught() {
        let ctx = SessionContext::new();
        let scope = ctx.scope(id("p"));
        let body = from_fn(|_| panic!("kaboom"));

        let err = guarded(body.as_ref(), &scope, TIMEOUT).await.unwrap_err();
        assert_eq!(err, UnitFailure::Panicked("kaboom".to_string()));
    }

    #[test]
    fn safe_mode_ignores_breaker_state() {
        let layer = Resilience::new(1, None, DegradationMode::Graceful);
        let x = id("x");
        layer.breakers().record_failure(&x);

        layer.set_degradation_mode(DegradationMode::Safe);
        assert!(!layer.feature_available(&x, UnitClass::Optional));
        assert!(layer.feature_available(&x, UnitClass::Core));

        layer.set_degradation_mode(DegradationMode::Full);
        assert!(layer.feature_available(&x, UnitClass::Experimental));
    }

    #[test]
    fn fallback_registration() {
        let layer = Resilience::new(3, None, DegradationMode::Graceful);
        let x = id("x");
        assert!(!layer.has_fallback(&x));
        layer.register_fallback(x.clone(), from_fn(|_| Ok(())));
        assert!(layer.has_fallback(&x));
        assert!(layer.unregister_fallback(&x));
        assert!(!layer.has_fallback(&x));
    }
}
