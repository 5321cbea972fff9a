//! Redis-backed storage.
//!
//! One connection, one configurable key prefix. Sub-store layout:
//!
//! ```text
//! {prefix}:tools:<name>      JSON-encoded tool descriptor
//! {prefix}:skills:<name>     JSON-encoded skill record
//! {prefix}:artifacts:<name>  hash { meta: JSON, data: bytes }
//! {prefix}:deps              set of package specs
//! ```
//!
//! Artifact writes land in a single multi-field HSET so readers never see
//! a blob without its metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use cm_domain::artifact::{validate_store_name, ArtifactData, ArtifactMeta};
use cm_domain::deps::DepSpec;
use cm_domain::error::{Error, Result};
use cm_domain::skill::{validate_skill_name, Skill};
use cm_domain::tool::ToolSpec;

use crate::access::StorageAccess;
use crate::traits::{ArtifactStore, DepsStore, SkillStore, StorageBackend, ToolStore};

fn storage_err(e: redis::RedisError) -> Error {
    Error::Storage(format!("redis: {e}"))
}

async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(conn)
            .await
            .map_err(storage_err)?;
        keys.extend(batch);
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    keys.sort();
    Ok(keys)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RedisToolStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisToolStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }
}

#[async_trait]
impl ToolStore for RedisToolStore {
    async fn list(&self) -> Result<Vec<ToolSpec>> {
        let mut conn = self.conn.clone();
        let keys = scan_keys(&mut conn, &format!("{}:*", self.prefix)).await?;
        let mut specs = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.map_err(storage_err)?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<ToolSpec>(&raw) {
                Ok(spec) => specs.push(spec),
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt tool record, skipping");
                }
            }
        }
        Ok(specs)
    }

    async fn get(&self, name: &str) -> Result<Option<ToolSpec>> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(name)).await.map_err(storage_err)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, spec: &ToolSpec) -> Result<()> {
        validate_store_name(&spec.name)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(self.key(&spec.name), serde_json::to_string(spec)?)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(name)).await.map_err(storage_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.key(name)).await.map_err(storage_err)?;
        Ok(exists)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RedisSkillStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisSkillStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }
}

#[async_trait]
impl SkillStore for RedisSkillStore {
    async fn list(&self) -> Result<Vec<Skill>> {
        let mut conn = self.conn.clone();
        let keys = scan_keys(&mut conn, &format!("{}:*", self.prefix)).await?;
        let mut skills = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.map_err(storage_err)?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<Skill>(&raw) {
                Ok(skill) => skills.push(skill),
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt skill record, skipping");
                }
            }
        }
        Ok(skills)
    }

    async fn get(&self, name: &str) -> Result<Option<Skill>> {
        validate_skill_name(name)?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(name)).await.map_err(storage_err)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, skill: &Skill) -> Result<()> {
        validate_skill_name(&skill.name)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(self.key(&skill.name), serde_json::to_string(skill)?)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_skill_name(name)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(name)).await.map_err(storage_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_skill_name(name)?;
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.key(name)).await.map_err(storage_err)?;
        Ok(exists)
    }

    async fn save_batch(&self, skills: &[Skill]) -> Result<()> {
        let mut pipe = redis::pipe();
        for skill in skills {
            validate_skill_name(&skill.name)?;
            pipe.set(self.key(&skill.name), serde_json::to_string(skill)?);
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_err)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const FIELD_META: &str = "meta";
const FIELD_DATA: &str = "data";

pub struct RedisArtifactStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisArtifactStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }
}

#[async_trait]
impl ArtifactStore for RedisArtifactStore {
    async fn list(&self) -> Result<Vec<ArtifactMeta>> {
        let mut conn = self.conn.clone();
        let keys = scan_keys(&mut conn, &format!("{}:*", self.prefix)).await?;
        let mut metas = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.hget(&key, FIELD_META).await.map_err(storage_err)?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<ArtifactMeta>(&raw) {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt artifact metadata, skipping");
                }
            }
        }
        Ok(metas)
    }

    async fn load(&self, name: &str) -> Result<ArtifactData> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let meta: Option<String> = conn
            .hget(self.key(name), FIELD_META)
            .await
            .map_err(storage_err)?;
        let meta: ArtifactMeta =
            serde_json::from_str(&meta.ok_or_else(|| Error::not_found("artifact", name))?)?;
        let data: Vec<u8> = conn
            .hget(self.key(name), FIELD_DATA)
            .await
            .map_err(storage_err)?;
        Ok(ArtifactData::from_bytes(meta.kind, data))
    }

    async fn meta(&self, name: &str) -> Result<Option<ArtifactMeta>> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(self.key(name), FIELD_META)
            .await
            .map_err(storage_err)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        name: &str,
        data: ArtifactData,
        description: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        validate_store_name(name)?;
        let bytes = data.to_bytes();
        let meta = ArtifactMeta {
            name: name.to_string(),
            description: description.to_string(),
            kind: data.kind(),
            created_at: Utc::now(),
            metadata,
            size: bytes.len() as u64,
        };
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.key(name))
            .arg(FIELD_META)
            .arg(serde_json::to_string(&meta)?)
            .arg(FIELD_DATA)
            .arg(bytes)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(name)).await.map_err(storage_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_store_name(name)?;
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.key(name)).await.map_err(storage_err)?;
        Ok(exists)
    }

    fn display_path(&self) -> String {
        self.prefix.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RedisDepsStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisDepsStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key: prefix.into(),
        }
    }
}

#[async_trait]
impl DepsStore for RedisDepsStore {
    async fn list(&self) -> Result<Vec<DepSpec>> {
        let mut conn = self.conn.clone();
        let mut specs: Vec<String> = conn.smembers(&self.key).await.map_err(storage_err)?;
        specs.sort();
        Ok(specs.into_iter().map(DepSpec).collect())
    }

    async fn add(&self, spec: &DepSpec) -> Result<bool> {
        cm_domain::deps::validate_dep_spec(&spec.0)?;
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(&self.key, &spec.0).await.map_err(storage_err)?;
        Ok(added > 0)
    }

    async fn remove(&self, spec: &DepSpec) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(&self.key, &spec.0).await.map_err(storage_err)?;
        if removed > 0 {
            return Ok(true);
        }
        // Also match records by bare package name.
        let members: Vec<String> = conn.smembers(&self.key).await.map_err(storage_err)?;
        let matching: Vec<&String> = members
            .iter()
            .filter(|m| DepSpec((*m).clone()).package_name() == spec.0)
            .collect();
        if matching.is_empty() {
            return Ok(false);
        }
        let _: () = conn.srem(&self.key, matching).await.map_err(storage_err)?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// KV-backed [`StorageBackend`] over one Redis connection.
pub struct RedisStorage {
    conn: ConnectionManager,
    url: String,
    prefix: String,
    tools: Mutex<Option<Arc<RedisToolStore>>>,
    skills: Mutex<Option<Arc<RedisSkillStore>>>,
    artifacts: Mutex<Option<Arc<RedisArtifactStore>>>,
    deps: Mutex<Option<Arc<RedisDepsStore>>>,
}

impl RedisStorage {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage_err)?;
        let conn = client.get_connection_manager().await.map_err(storage_err)?;
        Ok(Self::with_connection(conn, url, prefix))
    }

    pub fn with_connection(
        conn: ConnectionManager,
        url: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            url: url.into(),
            prefix: prefix.into(),
            tools: Mutex::new(None),
            skills: Mutex::new(None),
            artifacts: Mutex::new(None),
            deps: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl StorageBackend for RedisStorage {
    fn tool_store(&self) -> Arc<dyn ToolStore> {
        self.tools
            .lock()
            .get_or_insert_with(|| {
                Arc::new(RedisToolStore::new(
                    self.conn.clone(),
                    format!("{}:tools", self.prefix),
                ))
            })
            .clone()
    }

    fn skill_store(&self) -> Arc<dyn SkillStore> {
        self.skills
            .lock()
            .get_or_insert_with(|| {
                Arc::new(RedisSkillStore::new(
                    self.conn.clone(),
                    format!("{}:skills", self.prefix),
                ))
            })
            .clone()
    }

    fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts
            .lock()
            .get_or_insert_with(|| {
                Arc::new(RedisArtifactStore::new(
                    self.conn.clone(),
                    format!("{}:artifacts", self.prefix),
                ))
            })
            .clone()
    }

    fn deps_store(&self) -> Arc<dyn DepsStore> {
        self.deps
            .lock()
            .get_or_insert_with(|| {
                Arc::new(RedisDepsStore::new(
                    self.conn.clone(),
                    format!("{}:deps", self.prefix),
                ))
            })
            .clone()
    }

    fn serializable_access(&self) -> StorageAccess {
        StorageAccess::Kv {
            url: self.url.clone(),
            tools_prefix: format!("{}:tools", self.prefix),
            skills_prefix: format!("{}:skills", self.prefix),
            artifacts_prefix: format!("{}:artifacts", self.prefix),
            deps_prefix: format!("{}:deps", self.prefix),
        }
    }
}
