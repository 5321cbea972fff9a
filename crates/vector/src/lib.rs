//! Skill embedding cache and similarity search.
//!
//! - [`embedder`] — the `Embedder` capability plus hash and HTTP impls.
//! - [`index`] — the `VectorIndex` trait, id hygiene, scoring math.
//! - [`file`] — JSON-file-persisted index (default for file storage).
//! - [`redis`] — RediSearch-backed index for KV deployments.

pub mod embedder;
pub mod file;
pub mod index;
pub mod redis;

pub use embedder::{Embedder, HashEmbedder, HttpEmbedder, ModelInfo};
pub use file::FileVectorIndex;
pub use index::{SearchHit, VectorIndex};
pub use redis::RedisVectorIndex;
