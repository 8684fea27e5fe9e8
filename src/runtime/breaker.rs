//! Per-unit circuit breakers
//!
//! Two states per unit. `Closed` lets attempts through and counts
//! consecutive failures; reaching the threshold opens the breaker. `Open`
//! intercepts every attempt until the breaker is reset by hand or, when a
//! cooldown is configured, until the cooldown has elapsed.
//!
//! The table lives as long as the [`Resilience`](super::Resilience) layer
//! that owns it. It is never persisted.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::domain::UnitId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
}

#[derive(Debug, Clone)]
pub struct BreakerState {
    pub unit_id: UnitId,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,

    /// Monotonic open time used for the cooldown
    opened_instant: Option<Instant>,
}

impl BreakerState {
    fn new(unit_id: UnitId, threshold: u32) -> Self {
        Self {
            unit_id,
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            threshold,
            last_failure_time: None,
            opened_at: None,
            opened_instant: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == BreakerStatus::Open
    }

    fn close(&mut self) {
        self.status = BreakerStatus::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_instant = None;
    }
}

/// Breaker state of every unit seen by one resilience layer
#[derive(Debug)]
pub struct BreakerTable {
    states: DashMap<UnitId, BreakerState>,
    threshold: u32,
    cooldown: Option<Duration>,
}

impl BreakerTable {
    /// Creates a table; a threshold of 0 is treated as 1
    pub fn new(threshold: u32, cooldown: Option<Duration>) -> Self {
        Self {
            states: DashMap::new(),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Returns true if an attempt may run
    ///
    /// An open breaker whose cooldown has elapsed is closed here.
    pub fn allows(&self, unit_id: &UnitId) -> bool {
        let Some(mut state) = self.states.get_mut(unit_id) else {
            return true;
        };
        if !state.is_open() {
            return true;
        }

        let expired = match (self.cooldown, state.opened_instant) {
            (Some(cooldown), Some(opened)) => opened.elapsed() >= cooldown,
            _ => false,
        };
        if expired {
            state.close();
            tracing::info!(unit = %unit_id, "circuit breaker closed after cooldown");
            return true;
        }

        false
    }

    /// Records a successful attempt
    pub fn record_success(&self, unit_id: &UnitId) {
        if let Some(mut state) = self.states.get_mut(unit_id) {
            state.consecutive_failures = 0;
        }
    }

    /// Records a failed attempt, returning the resulting status
    pub fn record_failure(&self, unit_id: &UnitId) -> BreakerStatus {
        let mut state = self
            .states
            .entry(unit_id.clone())
            .or_insert_with(|| BreakerState::new(unit_id.clone(), self.threshold));

        if state.is_open() {
            return BreakerStatus::Open;
        }

        state.consecutive_failures += 1;
        state.last_failure_time = Some(Utc::now());

        if state.consecutive_failures >= state.threshold {
            state.status = BreakerStatus::Open;
            state.opened_at = Some(Utc::now());
            state.opened_instant = Some(Instant::now());
            tracing::warn!(
                unit = %unit_id,
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
        }

        state.status
    }

    /// Closes a unit's breaker and clears its counter
    ///
    /// Returns true if the breaker was open.
    pub fn reset(&self, unit_id: &UnitId) -> bool {
        match self.states.get_mut(unit_id) {
            Some(mut state) => {
                let was_open = state.is_open();
                state.close();
                if was_open {
                    tracing::info!(unit = %unit_id, "circuit breaker reset");
                }
                was_open
            }
            None => false,
        }
    }

    /// Returns a copy of a unit's state
    pub fn state(&self, unit_id: &UnitId) -> Option<BreakerState> {
        self.states.get(unit_id).map(|s| s.value().clone())
    }

    pub fn status(&self, unit_id: &UnitId) -> BreakerStatus {
        self.states
            .get(unit_id)
            .map_or(BreakerStatus::Closed, |s| s.status)
    }

    /// Returns every open breaker, sorted by unit ID
    pub fn open_breakers(&self) -> Vec<BreakerState> {
        let mut open: Vec<_> = self
            .states
            .iter()
            .filter(|s| s.is_open())
            .map(|s| s.value().clone())
            .collect();
        open.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[test]
    fn opens_at_threshold() {
        let table = BreakerTable::new(3, None);
        let x = id("x");

        assert!(table.allows(&x));
        assert_eq!(table.record_failure(&x), BreakerStatus::Closed);
        assert_eq!(table.record_failure(&x), BreakerStatus::Closed);
        assert_eq!(table.record_failure(&x), BreakerStatus::Open);
        assert!(!table.allows(&x));

        let state = table.state(&x).unwrap();
        assert_eq!(state.consecutive_failures, 3);
        assert!(state.opened_at.is_some());
    }

    #[test]
    fn failures_while_open_do_not_count() {
        let table = BreakerTable::new(1, None);
        let x = id("x");
        table.record_failure(&x);
        table.record_failure(&x);
        assert_eq!(table.state(&x).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn success_resets_counter() {
        let table = BreakerTable::new(3, None);
        let x = id("x");
        table.record_failure(&x);
        table.record_failure(&x);
        table.record_success(&x);
        table.record_failure(&x);
        table.record_failure(&x);

        assert_eq!(table.status(&x), BreakerStatus::Closed);
        assert_eq!(table.state(&x).unwrap().consecutive_failures, 2);
    }

    #[test]
    fn manual_reset() {
        let table = BreakerTable::new(1, None);
        let x = id("x");
        table.record_failure(&x);
        assert!(!table.allows(&x));

        assert!(table.reset(&x));
        assert!(table.allows(&x));
        assert_eq!(table.state(&x).unwrap().consecutive_failures, 0);
        assert!(!table.reset(&x));
        assert!(!table.reset(&id("unknown")));
    }

    #[test]
    fn cooldown_closes_breaker() {
        let table = BreakerTable::new(1, Some(Duration::from_millis(20)));
        let x = id("x");
        table.record_failure(&x);
        assert!(!table.allows(&x));

        thread::sleep(Duration::from_millis(40));
        assert!(table.allows(&x));
        assert_eq!(table.status(&x), BreakerStatus::Closed);
    }

    #[test]
    fn without_cooldown_stays_open() {
        let table = BreakerTable::new(1, None);
        let x = id("x");
        table.record_failure(&x);
        thread::sleep(Duration::from_millis(10));
        assert!(!table.allows(&x));
    }

    #[test]
    fn open_breakers_sorted() {
        let table = BreakerTable::new(1, None);
        for name in ["zeta", "alpha", "mid"] {
            table.record_failure(&id(name));
        }
        table.reset(&id("mid"));

        let open: Vec<_> = table
            .open_breakers()
            .into_iter()
            .map(|s| s.unit_id.to_string())
            .collect();
        assert_eq!(open, vec!["alpha", "zeta"]);
    }

    #[test]
    fn units_are_independent_across_threads() {
        let table = Arc::new(BreakerTable::new(5, None));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let unit = id(&format!("u{i}"));
                    for _ in 0..(i % 6) {
                        table.record_failure(&unit);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8 {
            let unit = id(&format!("u{i}"));
            let expected_open = i % 6 >= 5;
            assert_eq!(table.status(&unit) == BreakerStatus::Open, expected_open, "u{i}");
        }
    }

    #[test]
    fn zero_threshold_is_one() {
        let table = BreakerTable::new(0, None);
        assert_eq!(table.threshold(), 1);
    }
}
