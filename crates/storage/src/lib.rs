//! Storage backends for tools, skills, artifacts, and declared deps.
//!
//! A backend exposes four lazily created sub-stores behind one protocol
//! plus a serializable access descriptor so out-of-process executors can
//! reach the same data without a live object.

pub mod access;
pub mod file;
pub mod redis;
pub mod traits;

pub use access::StorageAccess;
pub use file::{FileArtifactStore, FileDepsStore, FileSkillStore, FileStorage, FileToolStore};
pub use redis::{
    RedisArtifactStore, RedisDepsStore, RedisSkillStore, RedisStorage, RedisToolStore,
};
pub use traits::{ArtifactStore, DepsStore, SkillStore, StorageBackend, ToolStore};
