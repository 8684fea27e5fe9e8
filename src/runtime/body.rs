//! Unit bodies
//!
//! A body is the initialization routine of a unit. The engine only knows the
//! [`UnitBody`] trait; the CLI runs unit sources through [`ScriptBody`] and
//! tests use [`from_fn`] / [`from_async`].
//!
//! Script protocol: the source runs as `<shell> <file>` with the visible
//! session variables in its environment. Lines of stdout that are JSON
//! directives stage writes:
//!
//! ```text
//! {"set": {"key": "EDITOR", "value": "vim"}}
//! {"provide": "editor"}
//! ```
//!
//! Everything else on stdout is ignored. Directives only count when the
//! process exits successfully.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use super::context::UnitScope;
use crate::domain::UnitId;

/// Environment variable carrying the running unit's ID
pub const UNIT_ID_ENV: &str = "UNITWAVE_UNIT";

/// Bytes of stderr kept in a failure message
const STDERR_TAIL: usize = 512;

/// Why a unit body did not succeed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitFailure {
    #[error("{0}")]
    Failed(String),

    #[error("exited with {}{}", exit_status(.code), stderr_suffix(.stderr))]
    Exit { code: Option<i32>, stderr: String },

    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("failed to start: {0}")]
    Spawn(String),

    #[error("invalid directive: {0}")]
    Protocol(String),
}

impl UnitFailure {
    pub fn failed(message: impl Into<String>) -> Self {
        UnitFailure::Failed(message.into())
    }
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Initialization routine of a unit
#[async_trait]
pub trait UnitBody: Send + Sync {
    /// Runs the unit, staging its writes into `scope`
    async fn init(&self, scope: &UnitScope) -> Result<(), UnitFailure>;
}

/// Synchronous body, run on the blocking pool so it may block freely
struct FnBody<F>(Arc<F>);

#[async_trait]
impl<F> UnitBody for FnBody<F>
where
    F: Fn(&UnitScope) -> Result<(), UnitFailure> + Send + Sync + 'static,
{
    async fn init(&self, scope: &UnitScope) -> Result<(), UnitFailure> {
        let f = Arc::clone(&self.0);
        let scope = scope.clone();
        match tokio::task::spawn_blocking(move || (*f)(&scope)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(UnitFailure::Panicked(panic_message(e.into_panic().as_ref()))),
            Err(e) => Err(UnitFailure::failed(format!("blocking task failed: {e}"))),
        }
    }
}

struct AsyncFnBody<F>(F);

#[async_trait]
impl<F, Fut> UnitBody for AsyncFnBody<F>
where
    F: Fn(UnitScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), UnitFailure>> + Send + 'static,
{
    async fn init(&self, scope: &UnitScope) -> Result<(), UnitFailure> {
        (self.0)(scope.clone()).await
    }
}

/// Wraps a synchronous closure as a body
///
/// The closure runs on tokio's blocking pool, so timeouts and cancellation
/// still apply while it blocks. A timed out closure keeps running on its
/// thread; its staged writes are discarded.
pub fn from_fn<F>(f: F) -> Arc<dyn UnitBody>
where
    F: Fn(&UnitScope) -> Result<(), UnitFailure> + Send + Sync + 'static,
{
    Arc::new(FnBody(Arc::new(f)))
}

/// Wraps an async closure as a body
pub fn from_async<F, Fut>(f: F) -> Arc<dyn UnitBody>
where
    F: Fn(UnitScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), UnitFailure>> + Send + 'static,
{
    Arc::new(AsyncFnBody(f))
}

/// Extracts the message of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Directive {
    Set { key: String, value: String },
    Provide(String),
}

/// Body that runs a unit source file through a shell
#[derive(Debug, Clone)]
pub struct ScriptBody {
    path: PathBuf,
    shell: String,
}

impl ScriptBody {
    pub fn new(path: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl UnitBody for ScriptBody {
    async fn init(&self, scope: &UnitScope) -> Result<(), UnitFailure> {
        // kill_on_drop: a timeout or cancellation drops this future and the child with it
        let output = Command::new(&self.shell)
            .arg(&self.path)
            .envs(scope.visible_vars())
            .env(UNIT_ID_ENV, scope.unit_id().as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UnitFailure::Spawn(format!("{} {}: {}", self.shell, self.path.display(), e)))?;

        if !output.status.success() {
            return Err(UnitFailure::Exit {
                code: output.status.code(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for directive in parse_directives(&stdout) {
            match directive {
                Directive::Set { key, value } => {
                    if !is_valid_var_name(&key) {
                        return Err(UnitFailure::Protocol(format!("invalid variable name '{key}'")));
                    }
                    if value.contains('\0') {
                        return Err(UnitFailure::Protocol(format!("value of '{key}' contains NUL")));
                    }
                    scope.set(key, value);
                }
                Directive::Provide(name) => scope.provide(name),
            }
        }

        Ok(())
    }
}

fn parse_directives(stdout: &str) -> impl Iterator<Item = Directive> + '_ {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(directive) => Some(directive),
            Err(e) => {
                tracing::debug!(line, error = %e, "ignoring non-directive output");
                None
            }
        })
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

/// Bodies available to a session, keyed by unit
#[derive(Clone, Default)]
pub struct UnitRegistry {
    bodies: HashMap<UnitId, Arc<dyn UnitBody>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit_id: UnitId, body: Arc<dyn UnitBody>) {
        self.bodies.insert(unit_id, body);
    }

    pub fn get(&self, unit_id: &UnitId) -> Option<Arc<dyn UnitBody>> {
        self.bodies.get(unit_id).cloned()
    }

    pub fn contains(&self, unit_id: &UnitId) -> bool {
        self.bodies.contains_key(unit_id)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SessionContext;
    use std::fs;
    use tempfile::TempDir;

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> ScriptBody {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        ScriptBody::new(path, "sh")
    }

    #[test]
    fn directive_parsing() {
        let out = "hello\n{\"set\":{\"key\":\"A\",\"value\":\"1\"}}\n  {\"provide\":\"x\"}\n{broken\n";
        let directives: Vec<_> = parse_directives(out).collect();
        assert_eq!(directives.len(), 2);
        assert!(matches!(&directives[0], Directive::Set { key, value } if key == "A" && value == "1"));
        assert!(matches!(&directives[1], Directive::Provide(name) if name == "x"));
    }

    #[test]
    fn var_names() {
        assert!(is_valid_var_name("EDITOR"));
        assert!(is_valid_var_name("_x1"));
        assert!(!is_valid_var_name("1X"));
        assert!(!is_valid_var_name("A=B"));
        assert!(!is_valid_var_name(""));
    }

    #[test]
    fn failure_messages() {
        let exit = UnitFailure::Exit {
            code: Some(2),
            stderr: "boom".to_string(),
        };
        assert_eq!(exit.to_string(), "exited with status 2: boom");
        assert_eq!(
            UnitFailure::Exit { code: None, stderr: String::new() }.to_string(),
            "exited with a signal"
        );
        assert_eq!(UnitFailure::Timeout(Duration::from_millis(1500)).to_string(), "timed out after 1.5s");
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let long = "x".repeat(2000);
        let t = tail(&long);
        assert!(t.starts_with("..."));
        assert_eq!(t.len(), STDERR_TAIL + 3);
    }

    #[tokio::test]
    async fn closure_bodies_stage_writes() {
        let ctx = SessionContext::new();
        let scope = ctx.scope(id("a"));

        let sync_body = from_fn(|scope| {
            scope.set("A", "1");
            Ok(())
        });
        sync_body.init(&scope).await.unwrap();

        let async_body = from_async(|scope: UnitScope| async move {
            tokio::task::yield_now().await;
            scope.provide("cap");
            Ok(())
        });
        async_body.init(&scope).await.unwrap();

        let staged = scope.take_staged();
        assert_eq!(staged.vars, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(staged.capabilities, vec!["cap".to_string()]);
    }

    #[tokio::test]
    async fn script_sets_vars_and_sees_committed_state() {
        let dir = TempDir::new().unwrap();
        let ctx = SessionContext::new();
        let base = ctx.scope(id("base"));
        base.set("GREETING", "hi");
        ctx.commit(base.unit_id(), base.take_staged());

        let body = script(
            &dir,
            "echo.unit",
            "echo '{\"set\":{\"key\":\"SEEN\",\"value\":\"'\"$GREETING-$UNITWAVE_UNIT\"'\"}}'\n\
             echo '{\"provide\":\"echo\"}'\n\
             echo 'plain output'\n",
        );
        let scope = ctx.scope(id("echo"));
        body.init(&scope).await.unwrap();

        assert_eq!(scope.var("SEEN").as_deref(), Some("hi-echo"));
        assert_eq!(scope.take_staged().capabilities, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn script_nonzero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let body = script(&dir, "bad.unit", "echo oops >&2\nexit 3\n");
        let ctx = SessionContext::new();

        let err = body.init(&ctx.scope(id("bad"))).await.unwrap_err();
        assert_eq!(
            err,
            UnitFailure::Exit {
                code: Some(3),
                stderr: "oops".to_string()
            }
        );
    }

    #[tokio::test]
    async fn script_invalid_var_name_fails() {
        let dir = TempDir::new().unwrap();
        let body = script(
            &dir,
            "odd.unit",
            "echo '{\"set\":{\"key\":\"A=B\",\"value\":\"1\"}}'\n",
        );
        let ctx = SessionContext::new();

        let err = body.init(&ctx.scope(id("odd"))).await.unwrap_err();
        assert!(matches!(err, UnitFailure::Protocol(_)));
    }

    #[tokio::test]
    async fn missing_shell_is_spawn_failure() {
        let body = ScriptBody::new("/nonexistent.unit", "/definitely/not/a/shell");
        let ctx = SessionContext::new();

        let err = body.init(&ctx.scope(id("x"))).await.unwrap_err();
        assert!(matches!(err, UnitFailure::Spawn(_)));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = UnitRegistry::new();
        assert!(registry.is_empty());
        registry.register(id("a"), from_fn(|_| Ok(())));
        assert!(registry.contains(&id("a")));
        assert!(registry.get(&id("b")).is_none());
        assert_eq!(registry.len(), 1);
    }
}
