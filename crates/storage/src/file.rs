//! File-backed storage.
//!
//! Layout under the base directory:
//!
//! ```text
//! tools/<name>.yaml
//! skills/<name>.rhai
//! artifacts/<name>            (blob; may nest under subdirectories)
//! artifacts/.index.json       (sidecar metadata, one entry per artifact)
//! deps/packages.txt           (one package spec per line)
//! ```
//!
//! Directories are created on first read and first write, so a freshly
//! pointed-at empty base never crashes. Corrupt entries are skipped with
//! a log line. All writes are temp-file + rename.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use cm_domain::artifact::{validate_store_name, ArtifactData, ArtifactMeta};
use cm_domain::deps::DepSpec;
use cm_domain::error::{Error, Result};
use cm_domain::skill::{validate_skill_name, Skill};
use cm_domain::tool::ToolSpec;

use crate::access::StorageAccess;
use crate::traits::{ArtifactStore, DepsStore, SkillStore, StorageBackend, ToolStore};

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("path has no parent: {}", path.display())))?;
    ensure_dir(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .map_err(|e| Error::Storage(format!("persist {}: {e}", path.display())))?;
    Ok(())
}

/// Flat store names: traversal-free and without separators.
fn validate_flat_name(name: &str) -> Result<()> {
    validate_store_name(name)?;
    if name.contains('/') {
        return Err(Error::invalid_name(name, "name must not contain '/'"));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FileToolStore {
    dir: PathBuf,
}

impl FileToolStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn tool_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yaml"))
    }
}

#[async_trait]
impl ToolStore for FileToolStore {
    async fn list(&self) -> Result<Vec<ToolSpec>> {
        ensure_dir(&self.dir)?;
        let mut specs = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        entries.sort();
        for path in entries {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable tool file, skipping");
                    continue;
                }
            };
            match serde_yaml::from_str::<ToolSpec>(&raw) {
                Ok(spec) if !spec.name.is_empty() => specs.push(spec),
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "tool file missing 'name', skipping");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unparseable tool file, skipping");
                }
            }
        }
        Ok(specs)
    }

    async fn get(&self, name: &str) -> Result<Option<ToolSpec>> {
        validate_flat_name(name)?;
        let path = self.tool_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&raw)?))
    }

    async fn save(&self, spec: &ToolSpec) -> Result<()> {
        validate_flat_name(&spec.name)?;
        atomic_write(&self.tool_path(&spec.name), serde_yaml::to_string(spec)?.as_bytes())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_flat_name(name)?;
        let path = self.tool_path(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_flat_name(name)?;
        Ok(self.tool_path(name).exists())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FileSkillStore {
    dir: PathBuf,
}

impl FileSkillStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn skill_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.rhai"))
    }
}

#[async_trait]
impl SkillStore for FileSkillStore {
    async fn list(&self) -> Result<Vec<Skill>> {
        ensure_dir(&self.dir)?;
        let mut skills = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "rhai"))
            .collect();
        entries.sort();
        for path in entries {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable skill file, skipping");
                    continue;
                }
            };
            match Skill::parse(&name, &raw) {
                Ok(skill) => skills.push(skill),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid skill file, skipping");
                }
            }
        }
        Ok(skills)
    }

    async fn get(&self, name: &str) -> Result<Option<Skill>> {
        validate_skill_name(name)?;
        let path = self.skill_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(Skill::parse(name, &raw)?))
    }

    async fn save(&self, skill: &Skill) -> Result<()> {
        validate_skill_name(&skill.name)?;
        atomic_write(&self.skill_path(&skill.name), skill.render().as_bytes())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_skill_name(name)?;
        let path = self.skill_path(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_skill_name(name)?;
        Ok(self.skill_path(name).exists())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const INDEX_FILE: &str = ".index.json";

pub struct FileArtifactStore {
    dir: PathBuf,
    index: Mutex<()>,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_index(&self) -> Result<BTreeMap<String, ArtifactMeta>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt artifact index, treating as empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_index(&self, index: &BTreeMap<String, ArtifactMeta>) -> Result<()> {
        atomic_write(&self.index_path(), serde_json::to_vec_pretty(index)?.as_slice())
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn list(&self) -> Result<Vec<ArtifactMeta>> {
        ensure_dir(&self.dir)?;
        let _guard = self.index.lock();
        Ok(self.read_index()?.into_values().collect())
    }

    async fn load(&self, name: &str) -> Result<ArtifactData> {
        validate_store_name(name)?;
        let _guard = self.index.lock();
        let index = self.read_index()?;
        let meta = index
            .get(name)
            .ok_or_else(|| Error::not_found("artifact", name))?;
        let bytes = std::fs::read(self.blob_path(name))?;
        Ok(ArtifactData::from_bytes(meta.kind, bytes))
    }

    async fn meta(&self, name: &str) -> Result<Option<ArtifactMeta>> {
        validate_store_name(name)?;
        let _guard = self.index.lock();
        Ok(self.read_index()?.get(name).cloned())
    }

    async fn save(
        &self,
        name: &str,
        data: ArtifactData,
        description: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        validate_store_name(name)?;
        ensure_dir(&self.dir)?;
        let bytes = data.to_bytes();

        let _guard = self.index.lock();
        atomic_write(&self.blob_path(name), &bytes)?;
        let mut index = self.read_index()?;
        index.insert(
            name.to_string(),
            ArtifactMeta {
                name: name.to_string(),
                description: description.to_string(),
                kind: data.kind(),
                created_at: Utc::now(),
                metadata,
                size: bytes.len() as u64,
            },
        );
        self.write_index(&index)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_store_name(name)?;
        let _guard = self.index.lock();
        let mut index = self.read_index()?;
        if index.remove(name).is_none() {
            return Ok(false);
        }
        let blob = self.blob_path(name);
        if blob.exists() {
            std::fs::remove_file(blob)?;
        }
        self.write_index(&index)?;
        Ok(true)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_store_name(name)?;
        let _guard = self.index.lock();
        Ok(self.read_index()?.contains_key(name))
    }

    fn display_path(&self) -> String {
        self.dir.display().to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FileDepsStore {
    dir: PathBuf,
}

impl FileDepsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn list_path(&self) -> PathBuf {
        self.dir.join("packages.txt")
    }

    fn read(&self) -> Result<Vec<DepSpec>> {
        let path = self.list_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(std::fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| DepSpec(l.to_string()))
            .collect())
    }

    fn write(&self, deps: &[DepSpec]) -> Result<()> {
        let text: String = deps.iter().map(|d| format!("{d}\n")).collect();
        atomic_write(&self.list_path(), text.as_bytes())
    }
}

#[async_trait]
impl DepsStore for FileDepsStore {
    async fn list(&self) -> Result<Vec<DepSpec>> {
        ensure_dir(&self.dir)?;
        self.read()
    }

    async fn add(&self, spec: &DepSpec) -> Result<bool> {
        cm_domain::deps::validate_dep_spec(&spec.0)?;
        ensure_dir(&self.dir)?;
        let mut deps = self.read()?;
        if deps.contains(spec) {
            return Ok(false);
        }
        deps.push(spec.clone());
        self.write(&deps)?;
        Ok(true)
    }

    async fn remove(&self, spec: &DepSpec) -> Result<bool> {
        ensure_dir(&self.dir)?;
        let mut deps = self.read()?;
        let before = deps.len();
        deps.retain(|d| d != spec && d.package_name() != spec.0);
        if deps.len() == before {
            return Ok(false);
        }
        self.write(&deps)?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-backed [`StorageBackend`] rooted at a base directory.
pub struct FileStorage {
    base: PathBuf,
    tools: Mutex<Option<Arc<FileToolStore>>>,
    skills: Mutex<Option<Arc<FileSkillStore>>>,
    artifacts: Mutex<Option<Arc<FileArtifactStore>>>,
    deps: Mutex<Option<Arc<FileDepsStore>>>,
}

impl FileStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            tools: Mutex::new(None),
            skills: Mutex::new(None),
            artifacts: Mutex::new(None),
            deps: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.base
    }
}

impl StorageBackend for FileStorage {
    fn tool_store(&self) -> Arc<dyn ToolStore> {
        self.tools
            .lock()
            .get_or_insert_with(|| Arc::new(FileToolStore::new(self.base.join("tools"))))
            .clone()
    }

    fn skill_store(&self) -> Arc<dyn SkillStore> {
        self.skills
            .lock()
            .get_or_insert_with(|| Arc::new(FileSkillStore::new(self.base.join("skills"))))
            .clone()
    }

    fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts
            .lock()
            .get_or_insert_with(|| Arc::new(FileArtifactStore::new(self.base.join("artifacts"))))
            .clone()
    }

    fn deps_store(&self) -> Arc<dyn DepsStore> {
        self.deps
            .lock()
            .get_or_insert_with(|| Arc::new(FileDepsStore::new(self.base.join("deps"))))
            .clone()
    }

    fn serializable_access(&self) -> StorageAccess {
        let tools_path = self.base.join("tools");
        StorageAccess::File {
            tools_path: tools_path.exists().then_some(tools_path),
            skills_path: self.base.join("skills"),
            artifacts_path: self.base.join("artifacts"),
            deps_path: self.base.join("deps"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn fresh_layout_reads_empty() {
        let (_dir, storage) = store();
        assert!(storage.tool_store().list().await.unwrap().is_empty());
        assert!(storage.skill_store().list().await.unwrap().is_empty());
        assert!(storage.artifact_store().list().await.unwrap().is_empty());
        assert!(storage.deps_store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn skill_round_trip_keeps_description() {
        let (_dir, storage) = store();
        let skill = Skill {
            name: "triple".into(),
            description: "Triple a number".into(),
            parameters: vec![],
            source: "fn run(n) { n * 3 }".into(),
        };
        storage.skill_store().save(&skill).await.unwrap();

        let loaded = storage.skill_store().get("triple").await.unwrap().unwrap();
        assert_eq!(loaded.description, "Triple a number");
        assert_eq!(loaded.parameters.len(), 1);
        assert!(storage.skill_store().exists("triple").await.unwrap());
        assert!(storage.skill_store().delete("triple").await.unwrap());
        assert!(!storage.skill_store().delete("triple").await.unwrap());
    }

    #[tokio::test]
    async fn artifact_round_trip_per_kind() {
        let (_dir, storage) = store();
        let artifacts = storage.artifact_store();

        artifacts
            .save("raw.bin", ArtifactData::Bytes(vec![1, 2, 3]), "", BTreeMap::new())
            .await
            .unwrap();
        artifacts
            .save("note.txt", ArtifactData::Text("hi".into()), "", BTreeMap::new())
            .await
            .unwrap();
        artifacts
            .save(
                "d.json",
                ArtifactData::Json(serde_json::json!({"k": 1})),
                "desc",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            artifacts.load("raw.bin").await.unwrap(),
            ArtifactData::Bytes(vec![1, 2, 3])
        );
        assert_eq!(
            artifacts.load("note.txt").await.unwrap(),
            ArtifactData::Text("hi".into())
        );
        assert_eq!(
            artifacts.load("d.json").await.unwrap(),
            ArtifactData::Json(serde_json::json!({"k": 1}))
        );

        let metas = artifacts.list().await.unwrap();
        assert_eq!(metas.len(), 3);
        assert!(artifacts.delete("d.json").await.unwrap());
        assert!(!artifacts.exists("d.json").await.unwrap());
        assert!(matches!(
            artifacts.load("d.json").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn artifact_names_may_nest_but_not_traverse() {
        let (_dir, storage) = store();
        let artifacts = storage.artifact_store();
        artifacts
            .save(
                "reports/q1.json",
                ArtifactData::Json(serde_json::json!([1])),
                "",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert!(artifacts.exists("reports/q1.json").await.unwrap());

        for bad in ["../escape", "/abs", "a\\b"] {
            let err = artifacts
                .save(bad, ArtifactData::Text("x".into()), "", BTreeMap::new())
                .await;
            assert!(matches!(err, Err(Error::InvalidName { .. })), "{bad}");
        }
    }

    #[tokio::test]
    async fn corrupt_tool_file_is_skipped() {
        let (dir, storage) = store();
        std::fs::create_dir_all(dir.path().join("tools")).unwrap();
        std::fs::write(dir.path().join("tools/bad.yaml"), ": not yaml :\n- {").unwrap();
        std::fs::write(
            dir.path().join("tools/good.yaml"),
            "name: echo\nargs: \"{text}\"\n",
        )
        .unwrap();
        let specs = storage.tool_store().list().await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
    }

    #[tokio::test]
    async fn deps_store_records_and_removes() {
        let (_dir, storage) = store();
        let deps = storage.deps_store();
        assert!(deps.add(&DepSpec("pkg>=1.0".into())).await.unwrap());
        assert!(!deps.add(&DepSpec("pkg>=1.0".into())).await.unwrap());
        assert!(deps.add(&DepSpec("other".into())).await.unwrap());
        assert_eq!(deps.list().await.unwrap().len(), 2);
        // Removal by bare package name also matches the constrained spec.
        assert!(deps.remove(&DepSpec("pkg".into())).await.unwrap());
        assert_eq!(deps.list().await.unwrap().len(), 1);
        assert!(deps.add(&DepSpec("-bad".into())).await.is_err());
    }

    #[tokio::test]
    async fn serializable_access_reports_paths() {
        let (dir, storage) = store();
        match storage.serializable_access() {
            StorageAccess::File {
                tools_path,
                skills_path,
                ..
            } => {
                assert!(tools_path.is_none());
                assert_eq!(skills_path, dir.path().join("skills"));
            }
            StorageAccess::Kv { .. } => panic!("expected file access"),
        }
    }
}
