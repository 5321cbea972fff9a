//! Sub-store traits and the unified backend protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use cm_domain::artifact::{ArtifactData, ArtifactMeta};
use cm_domain::deps::DepSpec;
use cm_domain::error::Result;
use cm_domain::skill::Skill;
use cm_domain::tool::ToolSpec;

use crate::access::StorageAccess;

/// Tool descriptor persistence.
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ToolSpec>>;
    async fn get(&self, name: &str) -> Result<Option<ToolSpec>>;
    async fn save(&self, spec: &ToolSpec) -> Result<()>;
    /// Returns true when the tool was present.
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn exists(&self, name: &str) -> Result<bool>;
}

/// Skill source persistence.
#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Skill>>;
    async fn get(&self, name: &str) -> Result<Option<Skill>>;
    async fn save(&self, skill: &Skill) -> Result<()>;
    /// Returns true when the skill was present.
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Bulk save; stores with cheaper batch paths override this.
    async fn save_batch(&self, skills: &[Skill]) -> Result<()> {
        for skill in skills {
            self.save(skill).await?;
        }
        Ok(())
    }
}

/// Named blob persistence with sidecar metadata.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ArtifactMeta>>;
    async fn load(&self, name: &str) -> Result<ArtifactData>;
    async fn meta(&self, name: &str) -> Result<Option<ArtifactMeta>>;
    async fn save(
        &self,
        name: &str,
        data: ArtifactData,
        description: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()>;
    /// Returns true when the artifact was present.
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Root for raw file I/O from user code (file backend) or the key
    /// prefix for display (KV backend).
    fn display_path(&self) -> String;
}

/// Declared-dependency persistence. Installation is the installer's job;
/// this only records intent.
#[async_trait]
pub trait DepsStore: Send + Sync {
    async fn list(&self) -> Result<Vec<DepSpec>>;
    /// Returns false when the spec was already recorded.
    async fn add(&self, spec: &DepSpec) -> Result<bool>;
    /// Returns true when the spec was present.
    async fn remove(&self, spec: &DepSpec) -> Result<bool>;
}

/// Unified storage backend: four lazily created, idempotent sub-stores
/// plus a serializable access descriptor for cross-process handoff.
pub trait StorageBackend: Send + Sync {
    fn tool_store(&self) -> Arc<dyn ToolStore>;
    fn skill_store(&self) -> Arc<dyn SkillStore>;
    fn artifact_store(&self) -> Arc<dyn ArtifactStore>;
    fn deps_store(&self) -> Arc<dyn DepsStore>;
    fn serializable_access(&self) -> StorageAccess;
}
