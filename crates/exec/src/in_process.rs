//! In-process backend.
//!
//! Runs code on the host's own interpreter. Fast, no isolation.
//! Timeouts race the evaluation (on a blocking worker) against a timer:
//! on expiry the result is discarded and the engine's interrupt flag is
//! raised so the abandoned evaluation unwinds at its next progress
//! checkpoint. State lives behind one lock, so a follow-up run waits for
//! the interrupted evaluation to finish unwinding, then proceeds against
//! intact state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Scope, AST};
use tokio::runtime::Handle;

use cm_domain::deps::{InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};
use cm_domain::{Capability, ExecutionResult};
use cm_storage::StorageAccess;

use crate::engine::{build_engine, seed_scope, NsContext};
use crate::executor::Executor;
use crate::resources::{ResourceOptions, Resources};
use crate::value::dynamic_to_json;

const CAPABILITIES: &[Capability] = &[Capability::Timeout, Capability::Reset];

const DEFAULT_TIMEOUT_SEC: f64 = 30.0;

struct InterpState {
    engine: Engine,
    scope: Scope<'static>,
    /// Script-defined functions accumulated across runs.
    fn_lib: AST,
    ctx: NsContext,
}

pub struct InProcessExecutor {
    options: ResourceOptions,
    default_timeout: f64,
    state: Mutex<Option<Arc<std::sync::Mutex<InterpState>>>>,
    interrupt: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl InProcessExecutor {
    pub fn new(options: ResourceOptions) -> Self {
        Self {
            options,
            default_timeout: DEFAULT_TIMEOUT_SEC,
            state: Mutex::new(None),
            interrupt: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_default_timeout(mut self, seconds: f64) -> Self {
        self.default_timeout = seconds;
        self
    }

    fn state_cell(&self) -> Result<Arc<std::sync::Mutex<InterpState>>> {
        self.state
            .lock()
            .clone()
            .ok_or_else(|| Error::Unavailable("executor not started".into()))
    }

    fn build_state(&self, resources: Arc<Resources>) -> InterpState {
        let ctx = NsContext::new(
            resources,
            Handle::current(),
            self.options.modules_dir.clone(),
        );
        let mut engine = build_engine(&ctx);
        let interrupt = self.interrupt.clone();
        engine.on_progress(move |_| {
            if interrupt.load(Ordering::Relaxed) {
                Some("interrupted".into())
            } else {
                None
            }
        });
        let mut scope = Scope::new();
        seed_scope(&mut scope, &ctx);
        InterpState {
            engine,
            scope,
            fn_lib: AST::empty(),
            ctx,
        }
    }

    pub fn resources(&self) -> Option<Arc<Resources>> {
        self.state
            .lock()
            .as_ref()
            .map(|cell| match cell.lock() {
                Ok(state) => state.ctx.resources.clone(),
                Err(poisoned) => poisoned.into_inner().ctx.resources.clone(),
            })
    }

    /// Start against an already-built resource set. The multi-session
    /// server uses this so sessions share registries and stores while
    /// keeping isolated interpreter state.
    pub fn start_with_resources(&self, resources: Arc<Resources>) {
        let state = self.build_state(resources);
        *self.state.lock() = Some(Arc::new(std::sync::Mutex::new(state)));
        self.closed.store(false, Ordering::SeqCst);
    }
}

fn run_sync(
    cell: &std::sync::Mutex<InterpState>,
    interrupt: &AtomicBool,
    code: &str,
) -> ExecutionResult {
    let mut guard = match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    interrupt.store(false, Ordering::SeqCst);
    let state = &mut *guard;
    state.ctx.take_stdout();

    let ast = match state.engine.compile(code) {
        Ok(ast) => ast,
        Err(e) => {
            return ExecutionResult {
                value: None,
                stdout: String::new(),
                error: Some(format!("parse error: {e}")),
                elapsed_ms: 0.0,
            };
        }
    };

    // Functions defined in earlier runs stay callable.
    let combined = state.fn_lib.merge(&ast);
    let outcome = state
        .engine
        .eval_ast_with_scope::<Dynamic>(&mut state.scope, &combined);
    let stdout = state.ctx.take_stdout();

    match outcome {
        Ok(value) => {
            state.fn_lib = state.fn_lib.merge(&ast.clone_functions_only());
            let value = if value.is_unit() {
                None
            } else {
                Some(dynamic_to_json(&value))
            };
            ExecutionResult {
                value,
                stdout,
                error: None,
                elapsed_ms: 0.0,
            }
        }
        Err(e) => ExecutionResult {
            value: None,
            stdout,
            error: Some(e.to_string()),
            elapsed_ms: 0.0,
        },
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    fn supported_capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn start(&self, storage_access: Option<StorageAccess>) -> Result<()> {
        let resources = match storage_access {
            Some(access) => Resources::from_access(&access, &self.options).await?,
            None => Resources::scratch(&self.options).await?,
        };
        let state = self.build_state(Arc::new(resources));
        *self.state.lock() = Some(Arc::new(std::sync::Mutex::new(state)));
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, code: &str, timeout: Option<f64>) -> Result<ExecutionResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(ExecutionResult::err("executor is closed"));
        }
        let cell = self.state_cell()?;
        let interrupt = self.interrupt.clone();
        let code = code.to_string();
        let timeout = timeout.unwrap_or(self.default_timeout);

        let task = tokio::task::spawn_blocking(move || run_sync(&cell, &interrupt, &code));
        match tokio::time::timeout(Duration::from_secs_f64(timeout), task).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) => Ok(ExecutionResult::err(format!(
                "evaluation thread failed: {join_err}"
            ))),
            Err(_) => {
                // Discard the worker's eventual result; the interrupt flag
                // unwinds it at the next progress checkpoint.
                self.interrupt.store(true, Ordering::SeqCst);
                Ok(ExecutionResult::err(Error::Timeout(timeout).to_string()))
            }
        }
    }

    async fn reset(&self) -> Result<()> {
        let cell = self.state_cell()?;
        let interrupt = self.interrupt.clone();
        tokio::task::spawn_blocking(move || {
            interrupt.store(true, Ordering::SeqCst);
            let mut guard = match cell.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            interrupt.store(false, Ordering::SeqCst);
            let ctx = guard.ctx.clone();
            let mut scope = Scope::new();
            seed_scope(&mut scope, &ctx);
            guard.scope = scope;
            guard.fn_lib = AST::empty();
            guard.ctx.take_stdout();
        })
        .await
        .map_err(|e| Error::Internal(format!("reset task failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(resources) = self.resources() {
            resources.registry.close().await;
        }
        *self.state.lock() = None;
        Ok(())
    }

    async fn install_deps(&self, packages: &[String]) -> Result<InstallReport> {
        let resources = self
            .resources()
            .ok_or_else(|| Error::Unavailable("executor not started".into()))?;
        resources.deps.install(packages).await
    }

    async fn uninstall_deps(&self, packages: &[String]) -> Result<RemoveReport> {
        let resources = self
            .resources()
            .ok_or_else(|| Error::Unavailable("executor not started".into()))?;
        resources.deps.uninstall(packages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_storage::{FileStorage, StorageBackend};

    async fn started_executor(dir: &std::path::Path) -> InProcessExecutor {
        let storage = FileStorage::new(dir);
        let executor = InProcessExecutor::new(ResourceOptions::default());
        executor
            .start(Some(storage.serializable_access()))
            .await
            .unwrap();
        executor
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn variables_persist_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor.run("let x = 42;", None).await.unwrap();
        assert!(r.success(), "{:?}", r.error);
        assert_eq!(r.value, None);

        let r = executor.run("x * 2", None).await.unwrap();
        assert_eq!(r.value, Some(serde_json::json!(84)));

        executor.reset().await.unwrap();
        let r = executor.run("x", None).await.unwrap();
        let err = r.error.unwrap();
        assert!(err.contains("x"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn functions_persist_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        executor
            .run("fn double(n) { n * 2 }", None)
            .await
            .unwrap();
        let r = executor.run("double(21)", None).await.unwrap();
        assert_eq!(r.value, Some(serde_json::json!(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stdout_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor.run("print(\"hello\"); 7", None).await.unwrap();
        assert_eq!(r.stdout, "hello\n");
        assert_eq!(r.value, Some(serde_json::json!(7)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_discards_but_session_survives() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor
            .run("let n = 0; loop { n += 1; }", Some(0.1))
            .await
            .unwrap();
        assert!(r.error.unwrap().contains("timed out"));

        let r = executor.run("1 + 1", Some(5.0)).await.unwrap();
        assert!(r.success(), "{:?}", r.error);
        assert_eq!(r.value, Some(serde_json::json!(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skills_create_and_invoke_via_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor
            .run(
                r#"skills.create("triple", "fn run(n) { n * 3 }", "Triple a number")"#,
                None,
            )
            .await
            .unwrap();
        assert!(r.success(), "{:?}", r.error);

        let r = executor
            .run(r#"skills.invoke("triple", #{ n: 10 })"#, None)
            .await
            .unwrap();
        assert!(r.success(), "{:?}", r.error);
        assert_eq!(r.value, Some(serde_json::json!(30)));

        let r = executor
            .run(r#"skills.invoke("nonexistent")"#, None)
            .await
            .unwrap();
        assert!(r.error.unwrap().contains("not found"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn artifacts_round_trip_via_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor
            .run(r#"artifacts.save("d.json", #{ k: 1 }, "desc")"#, None)
            .await
            .unwrap();
        assert!(r.success(), "{:?}", r.error);

        let r = executor.run(r#"artifacts.load("d.json")"#, None).await.unwrap();
        assert_eq!(r.value, Some(serde_json::json!({"k": 1})));

        let r = executor
            .run(r#"artifacts.delete("d.json")"#, None)
            .await
            .unwrap();
        assert_eq!(r.value, Some(serde_json::json!(true)));

        let r = executor
            .run(r#"artifacts.exists("d.json")"#, None)
            .await
            .unwrap();
        assert_eq!(r.value, Some(serde_json::json!(false)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cli_echo_tool_via_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tools")).unwrap();
        std::fs::write(
            dir.path().join("tools/echo.yaml"),
            "name: echo\nargs: \"{text}\"\nrecipes:\n  echo:\n    args: \"{text}\"\n",
        )
        .unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor
            .run(r#"tools.invoke("echo", "echo", #{ text: "hi" })"#, None)
            .await
            .unwrap();
        assert!(r.success(), "{:?}", r.error);
        assert_eq!(r.value, Some(serde_json::json!("hi")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_tool_call_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;

        let r = executor
            .run(r#"tools.call("nonexistent", #{})"#, None)
            .await
            .unwrap();
        assert!(r.error.unwrap().contains("not found"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_post_close_runs_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;
        executor.close().await.unwrap();
        executor.close().await.unwrap();
        let r = executor.run("1", None).await.unwrap();
        assert!(!r.success());
    }
}
