//! The executor contract every backend implements.

use async_trait::async_trait;

use cm_domain::deps::{InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};
use cm_domain::{Capability, ExecutionResult};
use cm_storage::StorageAccess;

#[async_trait]
pub trait Executor: Send + Sync {
    fn supported_capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.supported_capabilities().contains(&capability)
    }

    /// Acquire interpreter resources. `storage_access` tells the backend
    /// where tools/skills/artifacts/deps live; `None` means a scratch
    /// environment.
    async fn start(&self, storage_access: Option<StorageAccess>) -> Result<()>;

    /// Evaluate `code`. User-code failure lands in the result's `error`
    /// field; an `Err` return means the executor itself is unusable
    /// (not started, interpreter gone).
    async fn run(&self, code: &str, timeout: Option<f64>) -> Result<ExecutionResult>;

    /// Clear session state while keeping the executor usable.
    async fn reset(&self) -> Result<()>;

    /// Release interpreter resources. Idempotent.
    async fn close(&self) -> Result<()>;

    async fn install_deps(&self, _packages: &[String]) -> Result<InstallReport> {
        Err(Error::Unavailable(
            "this backend does not support dependency installation".into(),
        ))
    }

    async fn uninstall_deps(&self, _packages: &[String]) -> Result<RemoveReport> {
        Err(Error::Unavailable(
            "this backend does not support dependency removal".into(),
        ))
    }
}
