//! The host-side resource set an executor serves to user code.

use std::sync::Arc;

use cm_domain::config::InstallerConfig;
use cm_domain::error::Result;
use cm_skills::SkillLibrary;
use cm_storage::{
    FileArtifactStore, FileDepsStore, FileSkillStore, FileStorage, FileToolStore,
    RedisArtifactStore, RedisDepsStore, RedisSkillStore, RedisToolStore, StorageAccess,
    StorageBackend,
};
use cm_tools::{registry_from_store, ToolRegistry};
use cm_vector::{Embedder, FileVectorIndex, HashEmbedder, RedisVectorIndex, VectorIndex};

use crate::installer::{DepsManager, NullInstaller, PackageInstaller, ProcessInstaller};

/// Name of the embedding cache file kept next to the skills directory.
const VECTOR_INDEX_FILE: &str = ".vector_index.json";

/// Everything the four namespaces are backed by.
pub struct Resources {
    pub registry: Arc<ToolRegistry>,
    pub skills: Arc<SkillLibrary>,
    pub artifacts: Arc<dyn cm_storage::ArtifactStore>,
    pub deps: Arc<DepsManager>,
    /// Keeps scratch storage alive for resource sets not backed by a
    /// caller-provided location.
    _scratch: Option<tempfile::TempDir>,
}

/// Knobs for building a [`Resources`] from an access descriptor.
pub struct ResourceOptions {
    pub embedder: Arc<dyn Embedder>,
    pub installer: Arc<dyn PackageInstaller>,
    pub allow_runtime_deps: bool,
    /// Directory the interpreter's module resolver imports from.
    pub modules_dir: Option<std::path::PathBuf>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            embedder: Arc::new(HashEmbedder::default()),
            installer: Arc::new(NullInstaller::new()),
            allow_runtime_deps: true,
            modules_dir: None,
        }
    }
}

impl ResourceOptions {
    /// Use a process-shaped installer per the given config.
    pub fn with_installer_config(mut self, config: InstallerConfig) -> Self {
        self.modules_dir = config.modules_dir.clone();
        self.installer = Arc::new(ProcessInstaller::new(config));
        self
    }
}

impl Resources {
    /// Build from a serializable access descriptor. This is the path
    /// out-of-process executors and the container server take: they
    /// receive where storage lives, never a live backend object.
    pub async fn from_access(access: &StorageAccess, options: &ResourceOptions) -> Result<Self> {
        match access {
            StorageAccess::File {
                tools_path,
                skills_path,
                artifacts_path,
                deps_path,
            } => {
                let registry = match tools_path {
                    Some(path) => {
                        let store = FileToolStore::new(path);
                        registry_from_store(&store, Some(options.embedder.clone())).await?
                    }
                    None => Arc::new(ToolRegistry::new(Some(options.embedder.clone()))),
                };

                std::fs::create_dir_all(skills_path)?;
                let skill_store = Arc::new(FileSkillStore::new(skills_path));
                let index: Arc<dyn VectorIndex> = Arc::new(FileVectorIndex::open(
                    skills_path.join(VECTOR_INDEX_FILE),
                    options.embedder.clone(),
                )?);
                let skills = Arc::new(SkillLibrary::new(
                    skill_store,
                    Some(index),
                    options.embedder.clone(),
                ));
                skills.refresh().await?;

                std::fs::create_dir_all(artifacts_path)?;
                let artifacts: Arc<dyn cm_storage::ArtifactStore> =
                    Arc::new(FileArtifactStore::new(artifacts_path));

                let deps_store = Arc::new(FileDepsStore::new(deps_path));
                let deps = Arc::new(DepsManager::new(
                    deps_store,
                    options.installer.clone(),
                    options.allow_runtime_deps,
                ));

                Ok(Self {
                    registry,
                    skills,
                    artifacts,
                    deps,
                    _scratch: None,
                })
            }
            StorageAccess::Kv {
                url,
                tools_prefix,
                skills_prefix,
                artifacts_prefix,
                deps_prefix,
            } => {
                let client = redis::Client::open(url.as_str())
                    .map_err(|e| cm_domain::error::Error::Storage(format!("redis: {e}")))?;
                let conn = client
                    .get_connection_manager()
                    .await
                    .map_err(|e| cm_domain::error::Error::Storage(format!("redis: {e}")))?;

                let tool_store = RedisToolStore::new(conn.clone(), tools_prefix.clone());
                let registry =
                    registry_from_store(&tool_store, Some(options.embedder.clone())).await?;

                let skill_store = Arc::new(RedisSkillStore::new(conn.clone(), skills_prefix.clone()));
                // Prefer the KV store's vector-search extension; fall back
                // to a transient index when the module is unavailable.
                let index: Arc<dyn VectorIndex> = match RedisVectorIndex::open(
                    client,
                    options.embedder.clone(),
                    skills_prefix,
                    "skills_idx",
                )
                .await
                {
                    Ok(index) => Arc::new(index),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "vector search module unavailable, using in-memory index"
                        );
                        Arc::new(FileVectorIndex::in_memory(options.embedder.clone()))
                    }
                };
                let skills = Arc::new(SkillLibrary::new(
                    skill_store,
                    Some(index),
                    options.embedder.clone(),
                ));
                skills.refresh().await?;

                let artifacts: Arc<dyn cm_storage::ArtifactStore> = Arc::new(
                    RedisArtifactStore::new(conn.clone(), artifacts_prefix.clone()),
                );

                let deps_store = Arc::new(RedisDepsStore::new(conn, deps_prefix.clone()));
                let deps = Arc::new(DepsManager::new(
                    deps_store,
                    options.installer.clone(),
                    options.allow_runtime_deps,
                ));

                Ok(Self {
                    registry,
                    skills,
                    artifacts,
                    deps,
                    _scratch: None,
                })
            }
        }
    }

    /// Scratch resource set over a throwaway directory, used when an
    /// executor is started with no storage access at all.
    pub async fn scratch(options: &ResourceOptions) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let storage = FileStorage::new(dir.path());
        let access = storage.serializable_access();
        let mut resources = Self::from_access(&access, options).await?;
        resources._scratch = Some(dir);
        Ok(resources)
    }
}
