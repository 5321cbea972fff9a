//! File-backed vector index.
//!
//! Persists all records plus the producing model's info as one JSON
//! document, rewritten atomically (temp file + rename) on every mutation.
//! Search runs in memory; with the record counts a skill library sees,
//! brute-force cosine is the right tool.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use cm_domain::error::{Error, Result};

use crate::embedder::{Embedder, ModelInfo};
use crate::index::{
    combine_scores, cosine_distance, validate_index_id, SearchHit, VectorIndex,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    desc_vector: Vec<f32>,
    code_vector: Vec<f32>,
    content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    model: ModelInfo,
    records: HashMap<String, IndexRecord>,
}

pub struct FileVectorIndex {
    embedder: Arc<dyn Embedder>,
    /// None keeps the index memory-only (used as the transient fallback).
    path: Option<PathBuf>,
    records: Mutex<HashMap<String, IndexRecord>>,
}

impl FileVectorIndex {
    /// Open (or create) the index at `path`. When the persisted model's
    /// dimension disagrees with the embedder's, all records are dropped
    /// and the new model info written.
    pub fn open(path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.into();
        let mut records = HashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<IndexFile>(&raw) {
                Ok(file) => {
                    if file.model.dimension == embedder.dimension() {
                        records = file.records;
                    } else {
                        tracing::info!(
                            stored_dimension = file.model.dimension,
                            current_dimension = embedder.dimension(),
                            "embedding model changed, clearing vector index"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "corrupt vector index, starting fresh");
                }
            }
        }

        let index = Self {
            embedder,
            path: Some(path),
            records: Mutex::new(records),
        };
        index.persist()?;
        Ok(index)
    }

    /// Memory-only index; nothing touches disk.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            path: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = IndexFile {
            model: self.embedder.model_info(),
            records: self.records.lock().clone(),
        };
        let dir = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("index path has no parent: {}", path.display())))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_vec_pretty(&file)?.as_slice())?;
        tmp.persist(path)
            .map_err(|e| Error::Storage(format!("persist index: {e}")))?;
        Ok(())
    }

    fn knn(
        &self,
        query: &[f32],
        side: impl Fn(&IndexRecord) -> &[f32],
        k: usize,
    ) -> HashMap<String, f64> {
        let records = self.records.lock();
        let mut distances: Vec<(String, f64)> = records
            .iter()
            .map(|(id, rec)| (id.clone(), cosine_distance(query, side(rec))))
            .collect();
        distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        distances.truncate(k);
        distances.into_iter().collect()
    }
}

#[async_trait]
impl VectorIndex for FileVectorIndex {
    async fn add(
        &self,
        id: &str,
        description: &str,
        source: &str,
        content_hash: &str,
    ) -> Result<()> {
        validate_index_id(id)?;

        if self.records.lock().get(id).map(|r| r.content_hash.as_str()) == Some(content_hash) {
            return Ok(());
        }

        let vectors = self
            .embedder
            .embed(&[description.to_string(), source.to_string()])
            .await?;
        let [desc_vector, code_vector]: [Vec<f32>; 2] = vectors
            .try_into()
            .map_err(|_| Error::Internal("embedder returned wrong vector count".into()))?;

        self.records.lock().insert(
            id.to_string(),
            IndexRecord {
                desc_vector,
                code_vector,
                content_hash: content_hash.to_string(),
            },
        );
        self.persist()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        validate_index_id(id)?;
        let removed = self.records.lock().remove(id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        desc_weight: f64,
        code_weight: f64,
    ) -> Result<Vec<SearchHit>> {
        let count = self.records.lock().len();
        if count == 0 || limit == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed_query(query).await?;
        let k = (2 * limit).min(count);
        let desc = self.knn(&query_vec, |r| &r.desc_vector, k);
        let code = self.knn(&query_vec, |r| &r.code_vector, k);
        Ok(combine_scores(&desc, &code, limit, desc_weight, code_weight))
    }

    async fn content_hash(&self, id: &str) -> Result<Option<String>> {
        validate_index_id(id)?;
        Ok(self.records.lock().get(id).map(|r| r.content_hash.clone()))
    }

    fn model_info(&self) -> ModelInfo {
        self.embedder.model_info()
    }

    async fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        self.persist()
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embedder wrapper that counts embed calls, for cache-contract tests.
    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_info(&self) -> ModelInfo {
            self.inner.model_info()
        }
    }

    fn counting(dim: usize) -> Arc<CountingEmbedder> {
        Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(dim),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn add_is_hash_gated() {
        let embedder = counting(16);
        let index = FileVectorIndex::in_memory(embedder.clone());

        index.add("s", "desc", "src", "h1").await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        // Same hash: no embedding, no write.
        index.add("s", "desc", "src", "h1").await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        // Changed hash: exactly one more embedding pass.
        index.add("s", "desc2", "src", "h2").await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn warm_start_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index =
            FileVectorIndex::open(&path, Arc::new(HashEmbedder::new(16)) as Arc<dyn Embedder>)
                .unwrap();
        index.add("s", "desc", "src", "h1").await.unwrap();
        drop(index);

        let reopened =
            FileVectorIndex::open(&path, Arc::new(HashEmbedder::new(16)) as Arc<dyn Embedder>)
                .unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        assert_eq!(
            reopened.content_hash("s").await.unwrap(),
            Some("h1".to_string())
        );
    }

    #[tokio::test]
    async fn dimension_change_clears_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index =
            FileVectorIndex::open(&path, Arc::new(HashEmbedder::new(16)) as Arc<dyn Embedder>)
                .unwrap();
        index.add("s", "desc", "src", "h1").await.unwrap();
        drop(index);

        let reopened =
            FileVectorIndex::open(&path, Arc::new(HashEmbedder::new(32)) as Arc<dyn Embedder>)
                .unwrap();
        assert_eq!(reopened.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn search_ranks_exact_content_first() {
        let index = FileVectorIndex::in_memory(Arc::new(HashEmbedder::new(64)));
        index
            .add("scan", "scan the network", "fn run() {}", "h1")
            .await
            .unwrap();
        index
            .add("parse", "parse a csv file", "fn run(path) {}", "h2")
            .await
            .unwrap();

        let hits = index.search("scan the network", 10, 1.0, 0.0).await.unwrap();
        assert_eq!(hits[0].id, "scan");
        assert!(hits[0].score > hits[1].score);
        for h in &hits {
            assert!((0.0..=1.0).contains(&h.score));
        }
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let index = FileVectorIndex::in_memory(Arc::new(HashEmbedder::new(16)));
        index.add("s", "d", "c", "h").await.unwrap();
        assert!(index.remove("s").await.unwrap());
        assert!(!index.remove("s").await.unwrap());
    }
}
