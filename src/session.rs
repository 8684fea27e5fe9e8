//! Session orchestration
//!
//! A [`Session`] owns one scheduler's worth of state: the metadata cache,
//! the resilience layer (breakers, fallbacks, mode) and the context of the
//! most recent load. Nothing here is global, so independent sessions never
//! interfere.
//!
//! Loading runs the whole pipeline: declarations are read through the
//! cache, the graph is built and resolved, the waves are executed, and every
//! unit ends up with exactly one entry in the returned [`StatusReport`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::{
    ErrorContext, ErrorKind, ErrorLog, OpenBreaker, Outcome, Phase, StatusReport, UnitStatus,
};
use crate::domain::{
    fingerprint, DependencyGraph, ExclusionReason, Excluded, ScheduleError, Unit, UnitClass,
    UnitId, Wave,
};
use crate::runtime::{
    DegradationMode, Engine, EngineOptions, Resilience, ScriptBody, SessionContext, UnitBody,
    UnitRegistry,
};
use crate::storage::{MetadataStore, Settings, Workspace, WorkspaceError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Clone)]
enum Source {
    Text(String),
    Unavailable(String),
}

/// One enabled unit handed to a session
#[derive(Clone)]
pub struct UnitInput {
    pub id: UnitId,
    source: Source,
    body: Option<Arc<dyn UnitBody>>,
    fallback: Option<Arc<dyn UnitBody>>,
}

impl UnitInput {
    pub fn new(id: UnitId, source: impl Into<String>, body: Arc<dyn UnitBody>) -> Self {
        Self {
            id,
            source: Source::Text(source.into()),
            body: Some(body),
            fallback: None,
        }
    }

    /// An enabled unit whose source cannot be read
    pub fn unavailable(id: UnitId, reason: impl Into<String>) -> Self {
        Self {
            id,
            source: Source::Unavailable(reason.into()),
            body: None,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn UnitBody>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Enabled units of a workspace plus the unit files that could not be enabled
#[derive(Clone, Default)]
pub struct WorkspaceInputs {
    pub units: Vec<UnitInput>,

    /// Records for files rejected during discovery
    pub rejected: Vec<ErrorContext>,
}

/// Builds the inputs for every enabled unit of a workspace
///
/// Sources run through `shell`; a sibling fallback file becomes the
/// unit's fallback.
pub fn workspace_inputs(workspace: &Workspace) -> Result<WorkspaceInputs> {
    let enabled = workspace.enabled_units()?;
    let shell = &workspace.config().settings.shell;
    let mut inputs = Vec::with_capacity(enabled.sources.len() + enabled.missing.len());

    for source in enabled.sources {
        let input = match fs::read_to_string(&source.path) {
            Ok(text) => UnitInput::new(
                source.id,
                text,
                Arc::new(ScriptBody::new(&source.path, shell.as_str())),
            ),
            Err(e) => UnitInput::unavailable(
                source.id,
                format!("cannot read {}: {}", source.path.display(), e),
            ),
        };
        inputs.push(match source.fallback {
            Some(path) => input.with_fallback(Arc::new(ScriptBody::new(path, shell.as_str()))),
            None => input,
        });
    }

    for id in enabled.missing {
        let reason = WorkspaceError::MissingSource(id.clone()).to_string();
        inputs.push(UnitInput::unavailable(id, reason));
    }

    let rejected = enabled
        .invalid
        .into_iter()
        .map(|file| {
            ErrorContext::session(
                ErrorKind::ParseError,
                Phase::Discover,
                format!("unit file has an invalid name: {}", file.reason),
            )
            .with("path", file.path.display())
        })
        .collect();

    Ok(WorkspaceInputs {
        units: inputs,
        rejected,
    })
}

/// Knobs of a session, usually taken from [`Settings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub mode: DegradationMode,
    pub max_concurrency: usize,
    pub unit_timeout: Duration,
    pub startup_budget: Option<Duration>,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Option<Duration>,
    pub cache_retention: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            mode: settings.degradation_mode,
            max_concurrency: settings.max_concurrency,
            unit_timeout: settings.unit_timeout(),
            startup_budget: settings.startup_budget(),
            breaker_threshold: settings.circuit_breaker_threshold,
            breaker_cooldown: settings.breaker_cooldown(),
            cache_retention: settings.cache_retention(),
        }
    }
}

/// Resolved schedule of a load, before anything runs
#[derive(Debug, Clone)]
pub struct Plan {
    pub waves: Vec<Wave>,
    pub units: HashMap<UnitId, Unit>,

    /// Units removed before scheduling, in enabled order
    pub excluded: Vec<UnitStatus>,
}

impl Plan {
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

pub struct Session {
    options: SessionOptions,
    resilience: Arc<Resilience>,
    store: MetadataStore,
    context: Arc<SessionContext>,
    errors: ErrorLog,
    last_inputs: Vec<UnitInput>,
    last_rejected: Vec<ErrorContext>,
}

impl Session {
    /// Creates a session, pruning expired cache rows
    pub fn new(options: SessionOptions, store: MetadataStore) -> Self {
        if let Err(e) = store.prune(options.cache_retention) {
            tracing::warn!(error = %e, "failed to prune metadata cache");
        }

        let resilience = Arc::new(Resilience::new(
            options.breaker_threshold,
            options.breaker_cooldown,
            options.mode,
        ));

        Self {
            options,
            resilience,
            store,
            context: SessionContext::new(),
            errors: ErrorLog::new(),
            last_inputs: vec![],
            last_rejected: vec![],
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.resilience
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Committed state of the most recent load
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Error records of the most recent load
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Resolves the schedule without running anything
    pub fn plan(&mut self, inputs: &[UnitInput]) -> Result<Plan, SessionError> {
        self.prepare(inputs, &ErrorLog::new())
    }

    /// Loads the given units and returns the report
    ///
    /// Only a scheduler bookkeeping failure is returned as an error. Every
    /// other problem is recorded and reflected in the report.
    pub async fn load(&mut self, inputs: Vec<UnitInput>) -> Result<StatusReport, SessionError> {
        self.run_load(inputs, vec![]).await
    }

    /// Loads a workspace, recording the files rejected during discovery
    pub async fn load_workspace(
        &mut self,
        inputs: WorkspaceInputs,
    ) -> Result<StatusReport, SessionError> {
        self.run_load(inputs.units, inputs.rejected).await
    }

    /// Runs the previous load again with a fresh context
    ///
    /// Breaker state and fallbacks carry over.
    pub async fn reload(&mut self) -> Result<StatusReport, SessionError> {
        let inputs = self.last_inputs.clone();
        let rejected = self.last_rejected.clone();
        self.run_load(inputs, rejected).await
    }

    async fn run_load(
        &mut self,
        inputs: Vec<UnitInput>,
        rejected: Vec<ErrorContext>,
    ) -> Result<StatusReport, SessionError> {
        let started_at = Utc::now();
        let errors = ErrorLog::new();
        for ctx in &rejected {
            errors.record(ErrorContext {
                timestamp: started_at,
                ..ctx.clone()
            });
        }
        let context = SessionContext::new();
        let cancel = CancellationToken::new();

        tracing::info!(
            units = inputs.len(),
            mode = %self.resilience.degradation_mode(),
            "load started"
        );

        let watchdog = self.options.startup_budget.map(|budget| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                tracing::warn!(budget_secs = budget.as_secs_f64(), "startup budget exhausted, cancelling load");
                token.cancel();
            })
        });

        let plan = match self.prepare(&inputs, &errors) {
            Ok(plan) => plan,
            Err(e) => {
                if let Some(watchdog) = &watchdog {
                    watchdog.abort();
                }
                return Err(e);
            }
        };

        let mut registry = UnitRegistry::new();
        for input in &inputs {
            if let Some(body) = &input.body {
                registry.register(input.id.clone(), Arc::clone(body));
            }
            match &input.fallback {
                Some(fallback) => self
                    .resilience
                    .register_fallback(input.id.clone(), Arc::clone(fallback)),
                None => {
                    self.resilience.unregister_fallback(&input.id);
                }
            }
        }

        let engine = Engine::new(
            Arc::clone(&self.resilience),
            Arc::clone(&context),
            errors.clone(),
            EngineOptions {
                max_concurrency: self.options.max_concurrency,
                unit_timeout: self.options.unit_timeout,
            },
        );
        let run = engine.run(&plan.waves, &plan.units, &registry, &cancel).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        let run = run?;

        let mut units = run.units;
        units.extend(plan.excluded);

        let open_breakers = self
            .resilience
            .open_breakers()
            .into_iter()
            .map(|state| OpenBreaker {
                has_fallback: self.resilience.has_fallback(&state.unit_id),
                unit_id: state.unit_id,
                consecutive_failures: state.consecutive_failures,
            })
            .collect();

        let report = StatusReport {
            started_at,
            finished_at: Utc::now(),
            mode: self.resilience.degradation_mode(),
            cancelled: run.cancelled,
            waves: plan.waves,
            units,
            open_breakers,
            error_count: errors.len(),
        };

        let summary = report.summary();
        tracing::info!(
            succeeded = summary.get(&Outcome::Succeeded).copied().unwrap_or(0),
            errors = report.error_count,
            cancelled = report.cancelled,
            "load finished"
        );

        self.context = context;
        self.errors = errors;
        self.last_inputs = inputs;
        self.last_rejected = rejected;
        Ok(report)
    }

    fn prepare(&mut self, inputs: &[UnitInput], errors: &ErrorLog) -> Result<Plan, SessionError> {
        let mut units = Vec::with_capacity(inputs.len());
        let mut rejected = HashSet::new();
        let mut seen = HashSet::new();
        let mut exclusions: HashMap<UnitId, (Option<UnitClass>, String)> = HashMap::new();

        for (position, input) in inputs.iter().enumerate() {
            if !seen.insert(input.id.clone()) {
                errors.record(ErrorContext::unit(
                    input.id.clone(),
                    ErrorKind::ParseError,
                    Phase::Discover,
                    "unit enabled more than once, later entry ignored",
                ));
                continue;
            }

            let text = match &input.source {
                Source::Text(text) => text,
                Source::Unavailable(reason) => {
                    errors.record(ErrorContext::unit(
                        input.id.clone(),
                        ErrorKind::SourceUnavailable,
                        Phase::Discover,
                        reason.clone(),
                    ));
                    rejected.insert(input.id.clone());
                    exclusions.insert(input.id.clone(), (None, format!("source unavailable: {reason}")));
                    continue;
                }
            };

            let fp = fingerprint(text);
            match self.store.get_or_extract(&input.id, text, &fp) {
                Ok(metadata) => units.push(Unit::new(metadata, position)),
                Err(e) => {
                    errors.record(
                        ErrorContext::unit(input.id.clone(), ErrorKind::ParseError, Phase::Extract, e.to_string())
                            .with("fingerprint", &fp),
                    );
                    rejected.insert(input.id.clone());
                    exclusions.insert(input.id.clone(), (None, format!("parse error: {e}")));
                }
            }
        }

        let classes: HashMap<UnitId, UnitClass> =
            units.iter().map(|u| (u.id().clone(), u.class())).collect();

        let build = DependencyGraph::build_with_rejected(&units, &rejected);
        let resolution = build.graph.resolve()?;

        for excluded in build.excluded.iter().chain(&resolution.excluded) {
            let detail = record_exclusion(excluded, errors);
            exclusions.insert(
                excluded.unit.clone(),
                (classes.get(&excluded.unit).copied(), detail),
            );
        }

        let waves = build.graph.partition_waves(&resolution.order)?;
        let scheduled: HashSet<&UnitId> = resolution.order.iter().collect();
        let unit_table: HashMap<UnitId, Unit> = units
            .into_iter()
            .filter(|u| scheduled.contains(u.id()))
            .map(|u| (u.id().clone(), u))
            .collect();

        let mut listed = HashSet::new();
        let excluded = inputs
            .iter()
            .filter(|input| listed.insert(input.id.clone()))
            .filter_map(|input| {
                let (class, detail) = exclusions.remove(&input.id)?;
                Some(UnitStatus {
                    id: input.id.clone(),
                    wave: None,
                    class,
                    outcome: Outcome::Excluded,
                    fallback_used: false,
                    detail: Some(detail),
                })
            })
            .collect();

        tracing::debug!(
            waves = waves.len(),
            scheduled = unit_table.len(),
            "schedule resolved"
        );

        Ok(Plan {
            waves,
            units: unit_table,
            excluded,
        })
    }
}

/// Records one exclusion and returns its report detail
fn record_exclusion(excluded: &Excluded, errors: &ErrorLog) -> String {
    let unit = excluded.unit.clone();
    let (ctx, detail) = match &excluded.reason {
        ExclusionReason::Unresolved { missing } => {
            let names: Vec<&str> = missing.iter().map(UnitId::as_str).collect();
            let detail = format!("depends on units that are not enabled: {}", names.join(", "));
            (
                ErrorContext::unit(unit, ErrorKind::UnresolvedDependency, Phase::Resolve, detail.clone())
                    .with("missing", names.join(",")),
                detail,
            )
        }
        ExclusionReason::DependencyExcluded { dependency } => {
            let detail = format!("dependency '{}' was excluded", dependency);
            (
                ErrorContext::unit(unit, ErrorKind::DependencyExcluded, Phase::Resolve, detail.clone())
                    .with("dependency", dependency),
                detail,
            )
        }
        ExclusionReason::Cycle(cycle) => {
            let detail = format!("member of dependency cycle {}", cycle);
            (
                ErrorContext::unit(unit, ErrorKind::Cycle, Phase::Resolve, detail.clone())
                    .with("cycle", cycle),
                detail,
            )
        }
    };
    errors.record(ctx);
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{from_async, from_fn, UnitFailure, UnitScope};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn session() -> Session {
        session_with(SessionOptions::default())
    }

    fn session_with(options: SessionOptions) -> Session {
        Session::new(options, MetadataStore::in_memory().unwrap())
    }

    fn header(name: &str, deps: &str) -> String {
        format!("# unit: {name}\n# dependencies: {deps}\n# class: core\n")
    }

    fn ok(name: &str, deps: &str) -> UnitInput {
        UnitInput::new(id(name), header(name, deps), from_fn(|_| Ok(())))
    }

    #[tokio::test]
    async fn reference_waves() {
        let mut session = session();
        let report = session
            .load(vec![
                ok("A", ""),
                ok("B", "A"),
                ok("C", "A"),
                ok("D", "B C"),
                ok("E", ""),
            ])
            .await
            .unwrap();

        assert_eq!(
            report.waves,
            vec![
                vec![id("A"), id("E")],
                vec![id("B"), id("C")],
                vec![id("D")]
            ]
        );
        assert!(report.is_clean());
        assert_eq!(report.unit(&id("D")).unwrap().wave, Some(2));
        assert_eq!(report.error_count, 0);
    }

    #[tokio::test]
    async fn unresolved_dependency_records_exactly_one_error() {
        let mut session = session();
        let report = session
            .load(vec![ok("base", ""), ok("orphan", "base ghost"), ok("other", "base")])
            .await
            .unwrap();

        assert_eq!(report.outcome_of(&id("orphan")), Some(Outcome::Excluded));
        assert_eq!(report.outcome_of(&id("base")), Some(Outcome::Succeeded));
        assert_eq!(report.outcome_of(&id("other")), Some(Outcome::Succeeded));
        assert_eq!(session.errors().count(ErrorKind::UnresolvedDependency), 1);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.unit(&id("orphan")).unwrap().wave, None);
    }

    #[tokio::test]
    async fn parse_error_cascades_as_dependency_excluded() {
        let mut session = session();
        let report = session
            .load(vec![
                UnitInput::new(id("broken"), "# version: 1.0\n", from_fn(|_| Ok(()))),
                ok("user", "broken"),
                ok("fine", ""),
            ])
            .await
            .unwrap();

        assert_eq!(report.outcome_of(&id("broken")), Some(Outcome::Excluded));
        assert_eq!(report.outcome_of(&id("user")), Some(Outcome::Excluded));
        assert_eq!(report.outcome_of(&id("fine")), Some(Outcome::Succeeded));

        let errors = session.errors();
        assert_eq!(errors.count(ErrorKind::ParseError), 1);
        assert_eq!(errors.count(ErrorKind::DependencyExcluded), 1);
        assert_eq!(errors.count(ErrorKind::UnresolvedDependency), 0);
    }

    #[tokio::test]
    async fn unavailable_source_is_excluded() {
        let mut session = session();
        let report = session
            .load(vec![UnitInput::unavailable(id("gone"), "no file"), ok("here", "")])
            .await
            .unwrap();

        let gone = report.unit(&id("gone")).unwrap();
        assert_eq!(gone.outcome, Outcome::Excluded);
        assert_eq!(gone.class, None);
        assert_eq!(session.errors().count(ErrorKind::SourceUnavailable), 1);
    }

    #[tokio::test]
    async fn cycles_excluded_with_full_membership() {
        let mut session = session();
        let report = session
            .load(vec![
                ok("a", "b"),
                ok("b", "a"),
                ok("c", "a"),
                ok("d", ""),
                ok("self", "self"),
            ])
            .await
            .unwrap();

        for name in ["a", "b", "c", "self"] {
            assert_eq!(report.outcome_of(&id(name)), Some(Outcome::Excluded), "{name}");
        }
        assert_eq!(report.outcome_of(&id("d")), Some(Outcome::Succeeded));

        let cycle_records: Vec<_> = session
            .errors()
            .entries()
            .into_iter()
            .filter(|e| e.kind == ErrorKind::Cycle)
            .collect();
        assert_eq!(cycle_records.len(), 3);
        let a = cycle_records.iter().find(|e| e.unit_id == Some(id("a"))).unwrap();
        assert_eq!(a.snapshot["cycle"], "[a, b]");
        assert_eq!(session.errors().count(ErrorKind::DependencyExcluded), 1);
    }

    #[tokio::test]
    async fn excluded_units_follow_enabled_order() {
        let mut session = session();
        let report = session
            .load(vec![ok("z", "ghost"), ok("ok", ""), ok("y", "ghost")])
            .await
            .unwrap();

        let ids: Vec<_> = report.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["ok", "z", "y"]);
    }

    #[tokio::test]
    async fn breaker_persists_across_reload_and_fallback_takes_over() {
        let mut session = session();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky = UnitInput::new(
            id("X"),
            header("X", ""),
            from_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(UnitFailure::failed("boom"))
            }),
        )
        .with_fallback(from_fn(|scope| {
            scope.set("X_MODE", "fallback");
            Ok(())
        }));

        let first = session.load(vec![flaky, ok("Y", "X")]).await.unwrap();
        assert_eq!(first.outcome_of(&id("X")), Some(Outcome::Failed));
        assert_eq!(first.outcome_of(&id("Y")), Some(Outcome::NotAttempted));

        session.reload().await.unwrap();
        let third = session.reload().await.unwrap();
        assert_eq!(third.open_breakers.len(), 1);
        assert_eq!(third.open_breakers[0].consecutive_failures, 3);
        assert!(third.open_breakers[0].has_fallback);

        let fourth = session.reload().await.unwrap();
        let x = fourth.unit(&id("X")).unwrap();
        assert_eq!(x.outcome, Outcome::Succeeded);
        assert!(x.fallback_used);
        assert_eq!(fourth.outcome_of(&id("Y")), Some(Outcome::Succeeded));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(session.context().var("X_MODE").as_deref(), Some("fallback"));
        assert_eq!(
            session.resilience().breakers().state(&id("X")).unwrap().consecutive_failures,
            3
        );
    }

    #[tokio::test]
    async fn reload_uses_fresh_context() {
        let mut session = session();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let unit = UnitInput::new(
            id("a"),
            header("a", ""),
            from_fn(move |scope| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if scope.var("RUN").is_some() {
                    return Err(UnitFailure::failed("saw previous session state"));
                }
                scope.set("RUN", n.to_string());
                Ok(())
            }),
        );

        session.load(vec![unit]).await.unwrap();
        let report = session.reload().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(session.context().var("RUN").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn startup_budget_cancels_load() {
        let mut session = session_with(SessionOptions {
            startup_budget: Some(Duration::from_millis(50)),
            ..SessionOptions::default()
        });
        let slow = UnitInput::new(
            id("slow"),
            header("slow", ""),
            from_async(|_: UnitScope| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );

        let report = session.load(vec![slow, ok("after", "slow")]).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.outcome_of(&id("slow")), Some(Outcome::NotAttempted));
        assert_eq!(report.outcome_of(&id("after")), Some(Outcome::NotAttempted));
        assert_eq!(session.errors().count(ErrorKind::Cancelled), 1);
        assert!(report.open_breakers.is_empty());
    }

    #[tokio::test]
    async fn safe_mode_attempts_only_core() {
        let mut session = session_with(SessionOptions {
            mode: DegradationMode::Safe,
            ..SessionOptions::default()
        });
        let optional = UnitInput::new(id("extra"), "# unit: extra\n", from_fn(|_| Ok(())));

        let report = session.load(vec![ok("core1", ""), optional]).await.unwrap();

        assert_eq!(report.mode, DegradationMode::Safe);
        assert_eq!(report.outcome_of(&id("core1")), Some(Outcome::Succeeded));
        assert_eq!(report.outcome_of(&id("extra")), Some(Outcome::SkippedDegraded));
        assert_eq!(report.error_count, 0);
    }

    #[tokio::test]
    async fn second_load_hits_cache() {
        let mut session = session();
        session.load(vec![ok("a", ""), ok("b", "a")]).await.unwrap();
        session.reload().await.unwrap();

        let stats = session.store().lookup_stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn duplicate_input_is_recorded_once() {
        let mut session = session();
        let report = session.load(vec![ok("a", ""), ok("a", "")]).await.unwrap();

        assert_eq!(report.units.len(), 1);
        assert_eq!(report.error_count, 1);
    }

    #[test]
    fn plan_does_not_run_bodies() {
        let mut session = session();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let unit = UnitInput::new(
            id("a"),
            header("a", ""),
            from_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let plan = session.plan(&[unit, ok("b", "a"), ok("c", "ghost")]).unwrap();

        assert_eq!(plan.waves, vec![vec![id("a")], vec![id("b")]]);
        assert_eq!(plan.unit_count(), 2);
        assert_eq!(plan.excluded.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn options_from_settings() {
        let settings = Settings {
            max_concurrency: 9,
            startup_budget_secs: Some(3),
            ..Settings::default()
        };
        let options = SessionOptions::from(&settings);
        assert_eq!(options.max_concurrency, 9);
        assert_eq!(options.startup_budget, Some(Duration::from_secs(3)));
        assert_eq!(options.mode, DegradationMode::Graceful);
    }

    #[test]
    fn workspace_inputs_cover_missing_and_fallbacks() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut ws = Workspace::init(dir.path()).unwrap();
        fs::write(ws.units_dir().join("a.unit"), "# unit: a\n").unwrap();
        fs::write(ws.units_dir().join("a.fallback"), "true\n").unwrap();
        ws.config_mut().settings.enabled = vec!["a".to_string(), "ghost".to_string()];

        let inputs = workspace_inputs(&ws).unwrap();
        assert_eq!(inputs.units.len(), 2);
        assert!(inputs.units[0].fallback.is_some());
        assert!(matches!(inputs.units[1].source, Source::Unavailable(_)));
        assert!(inputs.rejected.is_empty());
    }

    #[tokio::test]
    async fn invalid_unit_file_is_recorded_on_every_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();
        fs::write(ws.units_dir().join("good.unit"), "# unit: good\n# class: core\n").unwrap();
        fs::write(ws.units_dir().join("bad name.unit"), "# unit: bad\n").unwrap();

        let inputs = workspace_inputs(&ws).unwrap();
        assert_eq!(inputs.units.len(), 1);
        assert_eq!(inputs.rejected.len(), 1);

        let mut session = session();
        let report = session.load_workspace(inputs).await.unwrap();
        assert_eq!(report.error_count, 1);
        let entries = session.errors().entries();
        assert_eq!(entries[0].kind, ErrorKind::ParseError);
        assert_eq!(entries[0].phase, Phase::Discover);
        assert_eq!(entries[0].unit_id, None);
        assert!(entries[0].snapshot["path"].ends_with("bad name.unit"));

        let again = session.reload().await.unwrap();
        assert_eq!(again.error_count, 1);
    }

    #[tokio::test]
    async fn dropped_fallback_is_unregistered() {
        let mut session = session();
        let failing = || {
            UnitInput::new(
                id("X"),
                header("X", ""),
                from_fn(|_| Err(UnitFailure::failed("boom"))),
            )
        };

        session
            .load(vec![failing().with_fallback(from_fn(|_| Ok(())))])
            .await
            .unwrap();
        assert!(session.resilience().has_fallback(&id("X")));

        session.load(vec![failing()]).await.unwrap();
        let report = session.load(vec![failing()]).await.unwrap();

        assert!(!session.resilience().has_fallback(&id("X")));
        assert_eq!(report.open_breakers.len(), 1);
        assert!(!report.open_breakers[0].has_fallback);
    }
}
