//! The agent-facing session.
//!
//! A session owns exactly one executor and a view of the storage that
//! backs the injected namespaces. `run` never raises for user-code
//! failure; callers read the error out of the result.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use cm_domain::config::SessionConfig;
use cm_domain::deps::{DepSpec, InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};
use cm_domain::skill::Skill;
use cm_domain::tool::Tool;
use cm_domain::ExecutionResult;
use cm_exec::Executor;
use cm_storage::StorageBackend;

pub struct SessionBuilder {
    storage: Arc<dyn StorageBackend>,
    executor: Box<dyn Executor>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(storage: Arc<dyn StorageBackend>, executor: Box<dyn Executor>) -> Self {
        Self {
            storage,
            executor,
            config: SessionConfig::default(),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the executor against the storage's access descriptor and,
    /// when configured, install the declared dependencies.
    pub async fn start(self) -> Result<Session> {
        let access = self.storage.serializable_access();
        self.executor.start(Some(access)).await?;

        let session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            storage: self.storage,
            executor: self.executor,
            config: self.config,
            created_at: Utc::now(),
            execution_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        if session.config.sync_deps_on_start {
            let report = session.sync_deps().await?;
            tracing::info!(
                installed = report.installed.len(),
                already_present = report.already_present.len(),
                failed = report.failed.len(),
                "synced declared dependencies"
            );
        }

        tracing::info!(session_id = %session.session_id, "session started");
        Ok(session)
    }
}

pub struct Session {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    executor: Box<dyn Executor>,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    execution_count: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    /// Evaluate `code` with the injected namespaces available. Always
    /// returns a result; failures land in `error`.
    pub async fn run(&self, code: &str, timeout: Option<f64>) -> ExecutionResult {
        if self.closed.load(Ordering::SeqCst) {
            return ExecutionResult::err("session is closed");
        }
        let timeout = timeout.or(Some(self.config.default_timeout_sec));

        let start = Instant::now();
        let mut result = match self.executor.run(code, timeout).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::err(e.to_string()),
        };
        if result.elapsed_ms == 0.0 {
            result.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        }
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Clear interpreter state; the four namespaces survive.
    pub async fn reset(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("session is closed".into()));
        }
        self.executor.reset().await
    }

    /// Close the executor. Idempotent; later `run`s return an error
    /// result, never a success.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(session_id = %self.session_id, "session closing");
        self.executor.close().await
    }

    // ── Tool and skill passthroughs ─────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let specs = self.storage.tool_store().list().await?;
        Ok(specs.iter().map(|s| s.to_tool()).collect())
    }

    pub async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        let tools = self.list_tools().await?;
        let query = query.to_lowercase();
        Ok(tools
            .into_iter()
            .filter(|t| {
                t.name.to_lowercase().contains(&query)
                    || t.description.to_lowercase().contains(&query)
            })
            .take(limit)
            .collect())
    }

    pub async fn list_skills(&self) -> Result<Vec<Skill>> {
        self.storage.skill_store().list().await
    }

    pub async fn get_skill(&self, name: &str) -> Result<Option<Skill>> {
        self.storage.skill_store().get(name).await
    }

    pub async fn search_skills(&self, query: &str, limit: usize) -> Result<Vec<Skill>> {
        let skills = self.list_skills().await?;
        let query = query.to_lowercase();
        Ok(skills
            .into_iter()
            .filter(|s| {
                s.name.to_lowercase().contains(&query)
                    || s.description.to_lowercase().contains(&query)
            })
            .take(limit)
            .collect())
    }

    // ── Dependency management ───────────────────────────────────────

    pub async fn list_deps(&self) -> Result<Vec<DepSpec>> {
        self.storage.deps_store().list().await
    }

    /// Record a dependency and install it into the executor environment.
    pub async fn add_dep(&self, spec: &str) -> Result<InstallReport> {
        cm_domain::deps::validate_dep_spec(spec)?;
        self.executor.install_deps(&[spec.to_string()]).await
    }

    pub async fn remove_dep(&self, spec: &str) -> Result<RemoveReport> {
        self.executor.uninstall_deps(&[spec.to_string()]).await
    }

    /// Install everything the deps store declares.
    pub async fn sync_deps(&self) -> Result<InstallReport> {
        let declared: Vec<String> = self
            .storage
            .deps_store()
            .list()
            .await?
            .into_iter()
            .map(|d| d.0)
            .collect();
        if declared.is_empty() {
            return Ok(InstallReport::default());
        }
        self.executor.install_deps(&declared).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_exec::{InProcessExecutor, ResourceOptions};
    use cm_storage::FileStorage;

    async fn session(dir: &std::path::Path) -> Session {
        let storage = Arc::new(FileStorage::new(dir));
        let executor = Box::new(InProcessExecutor::new(ResourceOptions::default()));
        SessionBuilder::new(storage, executor).start().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_reports_timing_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;

        let r = session.run("40 + 2", None).await;
        assert!(r.success(), "{:?}", r.error);
        assert_eq!(r.value, Some(serde_json::json!(42)));
        assert!(r.elapsed_ms > 0.0);
        assert_eq!(session.execution_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_survives_runs_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;

        assert!(session.run("let x = 42;", None).await.success());
        assert_eq!(
            session.run("x * 2", None).await.value,
            Some(serde_json::json!(84))
        );
        session.reset().await.unwrap();
        assert!(!session.run("x", None).await.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;

        session.close().await.unwrap();
        session.close().await.unwrap();
        let r = session.run("1", None).await;
        assert_eq!(r.error.as_deref(), Some("session is closed"));
        assert!(session.reset().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skill_created_in_run_is_visible_via_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;

        let r = session
            .run(
                r#"skills.create("triple", "fn run(n) { n * 3 }", "Triple a number")"#,
                None,
            )
            .await;
        assert!(r.success(), "{:?}", r.error);

        let skills = session.list_skills().await.unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "triple");
        let hits = session.search_skills("triple", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deps_passthrough_records_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;

        let report = session.add_dep("time-utils").await.unwrap();
        assert_eq!(report.installed, ["time-utils"]);
        assert_eq!(session.list_deps().await.unwrap().len(), 1);
        assert!(session.add_dep("-rf").await.is_err());

        let report = session.remove_dep("time-utils").await.unwrap();
        assert_eq!(report.removed, ["time-utils"]);
    }
}
