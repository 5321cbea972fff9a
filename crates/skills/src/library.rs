//! Skill library — coordinates the skill store (source of truth for
//! source text) with a vector index (cached embeddings for search).

use std::sync::Arc;

use cm_domain::error::{Error, Result};
use cm_domain::skill::Skill;
use cm_storage::SkillStore;
use cm_vector::index::cosine_similarity;
use cm_vector::{Embedder, VectorIndex};

/// Weights for the two-sided similarity search.
const DESC_WEIGHT: f64 = 0.7;
const CODE_WEIGHT: f64 = 0.3;

pub struct SkillLibrary {
    store: Arc<dyn SkillStore>,
    index: Option<Arc<dyn VectorIndex>>,
    embedder: Arc<dyn Embedder>,
}

impl SkillLibrary {
    pub fn new(
        store: Arc<dyn SkillStore>,
        index: Option<Arc<dyn VectorIndex>>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
        }
    }

    /// Index every persisted skill. Content-hash gating makes this cheap
    /// on warm starts: unchanged skills are not re-embedded.
    pub async fn refresh(&self) -> Result<usize> {
        let skills = self.store.list().await?;
        if let Some(index) = &self.index {
            for skill in &skills {
                if let Err(e) = index
                    .add(
                        &skill.name,
                        &skill.description,
                        &skill.source,
                        &skill.content_hash(),
                    )
                    .await
                {
                    tracing::warn!(skill = %skill.name, error = %e, "failed to index skill");
                }
            }
        }
        tracing::info!(skills_count = skills.len(), "skill library refreshed");
        Ok(skills.len())
    }

    /// Validate, persist, and index a new skill built from parts.
    pub async fn create(&self, name: &str, source: &str, description: &str) -> Result<Skill> {
        crate::validate::validate_skill(name, source)?;
        let skill = Skill {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
            source: source.to_string(),
        };
        self.add(skill).await
    }

    /// Persist and index. Saving an existing name is full replacement.
    pub async fn add(&self, skill: Skill) -> Result<Skill> {
        crate::validate::validate_skill(&skill.name, &skill.source)?;
        // Normalize so the stored text and the indexed hash agree.
        let skill = skill.normalized()?;
        self.store.save(&skill).await?;
        if let Some(index) = &self.index {
            index
                .add(
                    &skill.name,
                    &skill.description,
                    &skill.source,
                    &skill.content_hash(),
                )
                .await?;
        }
        Ok(skill)
    }

    /// Delete from both the store and the index.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.store.delete(name).await?;
        if let Some(index) = &self.index {
            if let Err(e) = index.remove(name).await {
                tracing::warn!(skill = %name, error = %e, "failed to remove skill from index");
            }
        }
        Ok(removed)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Skill>> {
        self.store.get(name).await
    }

    pub async fn list(&self) -> Result<Vec<Skill>> {
        self.store.list().await
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.store.exists(name).await
    }

    /// Semantic search. Ids in the index that no longer resolve in the
    /// store are filtered out, which masks stale index entries.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Skill>> {
        match &self.index {
            Some(index) => {
                let hits = index.search(query, limit, DESC_WEIGHT, CODE_WEIGHT).await?;
                let mut skills = Vec::with_capacity(hits.len());
                for hit in hits {
                    if let Some(skill) = self.store.get(&hit.id).await? {
                        skills.push(skill);
                    }
                }
                Ok(skills)
            }
            None => self.fallback_search(query, limit).await,
        }
    }

    /// Transient in-memory cosine search over description+code
    /// embeddings, used when no vector index is configured.
    async fn fallback_search(&self, query: &str, limit: usize) -> Result<Vec<Skill>> {
        let skills = self.store.list().await?;
        if skills.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed_query(query).await?;

        let mut scored = Vec::with_capacity(skills.len());
        for skill in skills {
            let vectors = self
                .embedder
                .embed(&[skill.description.clone(), skill.source.clone()])
                .await?;
            let desc_sim = (cosine_similarity(&query_vec, &vectors[0]) + 1.0) / 2.0;
            let code_sim = (cosine_similarity(&query_vec, &vectors[1]) + 1.0) / 2.0;
            scored.push((DESC_WEIGHT * desc_sim + CODE_WEIGHT * code_sim, skill));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, s)| s).collect())
    }

    /// Resolve a skill or fail with `NotFound`, for invoke paths.
    pub async fn require(&self, name: &str) -> Result<Skill> {
        self.get(name)
            .await?
            .ok_or_else(|| Error::not_found("skill", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cm_storage::{FileSkillStore, StorageBackend};
    use cm_vector::{FileVectorIndex, HashEmbedder, ModelInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn library(
        dir: &std::path::Path,
    ) -> (Arc<CountingEmbedder>, SkillLibrary) {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(32),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(FileSkillStore::new(dir.join("skills")));
        let index: Arc<dyn VectorIndex> = Arc::new(FileVectorIndex::in_memory(embedder.clone()));
        (
            embedder.clone(),
            SkillLibrary::new(store, Some(index), embedder),
        )
    }

    #[tokio::test]
    async fn create_then_invoke_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (_e, lib) = library(dir.path());

        let skill = lib
            .create("triple", "fn run(n) { n * 3 }", "Triple a number")
            .await
            .unwrap();
        assert_eq!(skill.name, "triple");
        assert_eq!(lib.require("triple").await.unwrap().description, "Triple a number");
        assert!(lib.require("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn double_add_embeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let (embedder, lib) = library(dir.path());

        let skill = lib
            .create("triple", "fn run(n) { n * 3 }", "Triple")
            .await
            .unwrap();
        let after_first = embedder.calls.load(Ordering::SeqCst);
        lib.add(skill.clone()).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), after_first);

        // Description change forces exactly one more embedding pass.
        let mut changed = skill;
        changed.description = "Triples a number".into();
        // Strip the old header so the new description takes effect.
        changed.source = "fn run(n) { n * 3 }".into();
        lib.add(changed).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), after_first + 1);
    }

    #[tokio::test]
    async fn warm_start_does_not_re_embed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = cm_storage::FileStorage::new(dir.path());
        let embedder: Arc<CountingEmbedder> = Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(32),
            calls: AtomicUsize::new(0),
        });
        let index_path = dir.path().join("index.json");

        {
            let index: Arc<dyn VectorIndex> = Arc::new(
                FileVectorIndex::open(&index_path, embedder.clone() as Arc<dyn Embedder>).unwrap(),
            );
            let lib = SkillLibrary::new(storage.skill_store(), Some(index), embedder.clone());
            lib.create("triple", "fn run(n) { n * 3 }", "Triple")
                .await
                .unwrap();
            lib.refresh().await.unwrap();
        }
        let calls_before = embedder.calls.load(Ordering::SeqCst);

        // Reopen against the unchanged store: no skill is re-embedded.
        let index: Arc<dyn VectorIndex> = Arc::new(
            FileVectorIndex::open(&index_path, embedder.clone() as Arc<dyn Embedder>).unwrap(),
        );
        let lib = SkillLibrary::new(storage.skill_store(), Some(index), embedder.clone());
        lib.refresh().await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn stale_index_entries_are_masked() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(HashEmbedder::new(32));
        let store = Arc::new(FileSkillStore::new(dir.path().join("skills")));
        let index = Arc::new(FileVectorIndex::in_memory(embedder.clone()));
        let lib = SkillLibrary::new(
            store,
            Some(index.clone() as Arc<dyn VectorIndex>),
            embedder,
        );

        lib.create("real_skill", "fn run() { 1 }", "a real skill")
            .await
            .unwrap();
        // Simulate an index entry whose skill was deleted out-of-band.
        index
            .add("ghost", "a ghost skill", "fn run() { 2 }", "h")
            .await
            .unwrap();

        let results = lib.search("skill", 10).await.unwrap();
        let names: Vec<_> = results.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"real_skill"));
        assert!(!names.contains(&"ghost"));
    }

    #[tokio::test]
    async fn fallback_search_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(HashEmbedder::new(32));
        let store = Arc::new(FileSkillStore::new(dir.path().join("skills")));
        let lib = SkillLibrary::new(store, None, embedder);

        lib.create("triple", "fn run(n) { n * 3 }", "Triple a number")
            .await
            .unwrap();
        lib.create("greet", "fn run(name) { \"hi \" + name }", "Greet someone")
            .await
            .unwrap();

        let results = lib.search("Triple a number", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "triple");
    }

    #[tokio::test]
    async fn remove_deletes_from_store_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let (_e, lib) = library(dir.path());
        lib.create("gone", "fn run() { 0 }", "soon gone").await.unwrap();
        assert!(lib.remove("gone").await.unwrap());
        assert!(!lib.remove("gone").await.unwrap());
        assert!(lib.get("gone").await.unwrap().is_none());
    }
}
