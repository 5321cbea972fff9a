//! The `PackageInstaller` capability and the deps coordinator.
//!
//! A dependency is a Rhai module package the interpreter imports through
//! its module resolver. The store records intent; the installer makes the
//! package available in the executor's environment.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use cm_domain::config::InstallerConfig;
use cm_domain::deps::{validate_dep_spec, DepSpec, InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};
use cm_storage::DepsStore;

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, specs: &[DepSpec]) -> InstallReport;
    async fn uninstall(&self, specs: &[DepSpec]) -> RemoveReport;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process installer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shells out to the configured installer command:
/// `<command> install <spec> [--dest <modules_dir>]`.
pub struct ProcessInstaller {
    config: InstallerConfig,
    /// Serializes installer runs; package managers dislike concurrency.
    gate: tokio::sync::Mutex<()>,
}

impl ProcessInstaller {
    pub fn new(config: InstallerConfig) -> Self {
        Self {
            config,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    async fn run_subcommand(&self, subcommand: &str, spec: &DepSpec) -> Result<()> {
        validate_dep_spec(&spec.0)?;
        let (program, fixed_args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| Error::Misconfigured("empty installer command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(fixed_args)
            .arg(subcommand)
            .arg(&spec.0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.modules_dir {
            cmd.arg("--dest").arg(dir);
        }

        let timeout = Duration::from_secs(self.config.timeout_sec);
        let child = cmd
            .spawn()
            .map_err(|e| Error::call_failed(&spec.0, format!("installer spawn failed: {e}")))?;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(timeout.as_secs_f64()))?
            .map_err(|e| Error::call_failed(&spec.0, format!("installer failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::call_failed(
                &spec.0,
                format!("installer exit {}: {}", output.status.code().unwrap_or(-1), stderr.trim()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PackageInstaller for ProcessInstaller {
    async fn install(&self, specs: &[DepSpec]) -> InstallReport {
        let _gate = self.gate.lock().await;
        let mut report = InstallReport::default();
        for spec in specs {
            match self.run_subcommand("install", spec).await {
                Ok(()) => report.installed.push(spec.0.clone()),
                Err(e) => {
                    tracing::warn!(package = %spec, error = %e, "package install failed");
                    report.failed.push(spec.0.clone());
                }
            }
        }
        report
    }

    async fn uninstall(&self, specs: &[DepSpec]) -> RemoveReport {
        let _gate = self.gate.lock().await;
        let mut report = RemoveReport::default();
        for spec in specs {
            match self.run_subcommand("uninstall", spec).await {
                Ok(()) => report.removed.push(spec.0.clone()),
                Err(e) => {
                    tracing::warn!(package = %spec, error = %e, "package uninstall failed");
                    report.failed.push(spec.0.clone());
                }
            }
        }
        report
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording installer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records installs without touching any environment. The default when
/// no package manager is configured, and the test double.
#[derive(Default)]
pub struct NullInstaller {
    installed: Mutex<HashSet<String>>,
}

impl NullInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> Vec<String> {
        let mut v: Vec<String> = self.installed.lock().iter().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl PackageInstaller for NullInstaller {
    async fn install(&self, specs: &[DepSpec]) -> InstallReport {
        let mut report = InstallReport::default();
        let mut installed = self.installed.lock();
        for spec in specs {
            if validate_dep_spec(&spec.0).is_err() {
                report.failed.push(spec.0.clone());
            } else if installed.insert(spec.0.clone()) {
                report.installed.push(spec.0.clone());
            } else {
                report.already_present.push(spec.0.clone());
            }
        }
        report
    }

    async fn uninstall(&self, specs: &[DepSpec]) -> RemoveReport {
        let mut report = RemoveReport::default();
        let mut installed = self.installed.lock();
        for spec in specs {
            if installed.remove(&spec.0) {
                report.removed.push(spec.0.clone());
            } else {
                report.not_found.push(spec.0.clone());
            }
        }
        report
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deps coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Couples the declared-deps store with the installer capability.
///
/// Agent-initiated mutation goes through the `runtime` methods, which
/// honor the administrative disable flag. Session-level sync and the
/// container's system endpoints use the unchecked methods.
pub struct DepsManager {
    store: Arc<dyn DepsStore>,
    installer: Arc<dyn PackageInstaller>,
    allow_runtime: bool,
}

impl DepsManager {
    pub fn new(
        store: Arc<dyn DepsStore>,
        installer: Arc<dyn PackageInstaller>,
        allow_runtime: bool,
    ) -> Self {
        Self {
            store,
            installer,
            allow_runtime,
        }
    }

    pub fn runtime_allowed(&self) -> bool {
        self.allow_runtime
    }

    fn check_runtime(&self) -> Result<()> {
        if self.allow_runtime {
            Ok(())
        } else {
            Err(Error::Unavailable(
                "runtime dependency modification disabled".into(),
            ))
        }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.store.list().await?.into_iter().map(|d| d.0).collect())
    }

    /// Record and install one package (agent path).
    pub async fn add_runtime(&self, spec: &str) -> Result<InstallReport> {
        self.check_runtime()?;
        self.add(spec).await
    }

    /// Remove one package (agent path). Last-writer-wins on the store
    /// record regardless of installer outcome.
    pub async fn remove_runtime(&self, spec: &str) -> Result<bool> {
        self.check_runtime()?;
        self.remove(spec).await
    }

    pub async fn add(&self, spec: &str) -> Result<InstallReport> {
        let spec = DepSpec(spec.to_string());
        validate_dep_spec(&spec.0)?;
        self.store.add(&spec).await?;
        Ok(self.installer.install(std::slice::from_ref(&spec)).await)
    }

    pub async fn remove(&self, spec: &str) -> Result<bool> {
        let spec = DepSpec(spec.to_string());
        let was_recorded = self.store.remove(&spec).await?;
        let report = self.installer.uninstall(std::slice::from_ref(&spec)).await;
        Ok(was_recorded || !report.removed.is_empty())
    }

    /// Install every declared package.
    pub async fn sync(&self) -> Result<InstallReport> {
        let specs = self.store.list().await?;
        Ok(self.installer.install(&specs).await)
    }

    /// System-level batch install (records then installs).
    pub async fn install(&self, packages: &[String]) -> Result<InstallReport> {
        let mut combined = InstallReport::default();
        for pkg in packages {
            match self.add(pkg).await {
                Ok(report) => {
                    combined.installed.extend(report.installed);
                    combined.already_present.extend(report.already_present);
                    combined.failed.extend(report.failed);
                }
                Err(e) => {
                    tracing::warn!(package = %pkg, error = %e, "failed to install package");
                    combined.failed.push(pkg.clone());
                }
            }
        }
        Ok(combined)
    }

    /// System-level batch uninstall.
    pub async fn uninstall(&self, packages: &[String]) -> Result<RemoveReport> {
        let mut combined = RemoveReport::default();
        for pkg in packages {
            if pkg.starts_with('-') {
                tracing::warn!(package = %pkg, "rejecting package name starting with '-'");
                combined.failed.push(pkg.clone());
                continue;
            }
            let spec = DepSpec(pkg.clone());
            let recorded = self.store.remove(&spec).await.unwrap_or(false);
            let report = self.installer.uninstall(std::slice::from_ref(&spec)).await;
            if !report.removed.is_empty() || recorded {
                combined.removed.push(pkg.clone());
            } else if !report.failed.is_empty() {
                combined.failed.push(pkg.clone());
            } else {
                combined.not_found.push(pkg.clone());
            }
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_storage::FileDepsStore;

    fn manager(allow_runtime: bool) -> (tempfile::TempDir, DepsManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDepsStore::new(dir.path().join("deps")));
        let installer = Arc::new(NullInstaller::new());
        (dir, DepsManager::new(store, installer, allow_runtime))
    }

    #[tokio::test]
    async fn add_records_and_installs() {
        let (_dir, deps) = manager(true);
        let report = deps.add_runtime("time-utils>=0.3").await.unwrap();
        assert_eq!(report.installed, ["time-utils>=0.3"]);
        assert_eq!(deps.list().await.unwrap(), ["time-utils>=0.3"]);

        let again = deps.add_runtime("time-utils>=0.3").await.unwrap();
        assert_eq!(again.already_present, ["time-utils>=0.3"]);
    }

    #[tokio::test]
    async fn runtime_disable_blocks_agent_paths_only() {
        let (_dir, deps) = manager(false);
        let err = deps.add_runtime("pkg").await.unwrap_err();
        assert!(err.to_string().contains("runtime dependency modification disabled"));
        assert!(deps.remove_runtime("pkg").await.is_err());

        // System-level path ignores the flag.
        let report = deps.install(&["pkg".to_string()]).await.unwrap();
        assert_eq!(report.installed, ["pkg"]);
    }

    #[tokio::test]
    async fn uninstall_reports_not_found() {
        let (_dir, deps) = manager(true);
        let report = deps.uninstall(&["ghost".to_string()]).await.unwrap();
        assert_eq!(report.not_found, ["ghost"]);

        let report = deps.uninstall(&["-rf".to_string()]).await.unwrap();
        assert_eq!(report.failed, ["-rf"]);
    }
}
