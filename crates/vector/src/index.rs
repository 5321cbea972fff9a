//! Vector index interface and shared scoring math.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cm_domain::error::{Error, Result};

use crate::embedder::ModelInfo;

/// Maximum id length accepted by any index.
pub const MAX_ID_LENGTH: usize = 128;

/// One search hit: skill id plus combined weighted score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

/// Per-skill embedding cache keyed by content hash.
///
/// The caching contract: `add` is a no-op when the stored hash for `id`
/// equals `content_hash`; otherwise both vectors are recomputed and stored
/// atomically together with the hash.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(&self, id: &str, description: &str, source: &str, content_hash: &str)
        -> Result<()>;

    /// Returns true when the id was present.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn search(
        &self,
        query: &str,
        limit: usize,
        desc_weight: f64,
        code_weight: f64,
    ) -> Result<Vec<SearchHit>>;

    async fn content_hash(&self, id: &str) -> Result<Option<String>>;

    fn model_info(&self) -> ModelInfo;

    async fn clear(&self) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// Ids must be conservative identifiers, bounded, and free of characters
/// that would break KV key syntax.
pub fn validate_index_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return Err(Error::invalid_name(id, "id must be 1-128 bytes"));
    }
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return Err(Error::invalid_name(id, "empty id"));
    };
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::invalid_name(id, "id must match [A-Za-z_][A-Za-z0-9_]*"));
    }
    if id.chars().any(|c| ":{}[]".contains(c)) {
        return Err(Error::invalid_name(id, "id contains unsafe characters"));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Cosine distance as KNN engines report it: 0 = identical, 2 = opposite.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

/// Map a cosine distance to similarity, clamped into `[0, 1]`.
pub fn distance_to_similarity(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Merge per-side KNN distances into combined weighted hits. Candidates
/// present on only one side contribute 0 for the missing side.
pub fn combine_scores(
    desc_distances: &std::collections::HashMap<String, f64>,
    code_distances: &std::collections::HashMap<String, f64>,
    limit: usize,
    desc_weight: f64,
    code_weight: f64,
) -> Vec<SearchHit> {
    let mut combined: std::collections::HashMap<&str, (f64, f64)> =
        std::collections::HashMap::new();
    for (id, d) in desc_distances {
        combined.entry(id).or_default().0 = distance_to_similarity(*d);
    }
    for (id, d) in code_distances {
        combined.entry(id).or_default().1 = distance_to_similarity(*d);
    }

    let mut hits: Vec<SearchHit> = combined
        .into_iter()
        .map(|(id, (desc_sim, code_sim))| SearchHit {
            id: id.to_string(),
            score: desc_weight * desc_sim + code_weight * code_sim,
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn id_hygiene() {
        assert!(validate_index_id("skill_1").is_ok());
        assert!(validate_index_id("_x").is_ok());
        assert!(validate_index_id("").is_err());
        assert!(validate_index_id("9x").is_err());
        assert!(validate_index_id("a:b").is_err());
        assert!(validate_index_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn distance_mapping_clamps() {
        assert_eq!(distance_to_similarity(0.0), 1.0);
        assert_eq!(distance_to_similarity(2.0), 0.0);
        assert_eq!(distance_to_similarity(2.5), 0.0);
        assert!((distance_to_similarity(1.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn missing_side_contributes_zero() {
        let mut desc = HashMap::new();
        desc.insert("only_desc".to_string(), 0.0);
        let code = HashMap::new();
        let hits = combine_scores(&desc, &code, 10, 0.7, 0.3);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn scores_bounded_and_sorted_with_unit_weights() {
        let mut desc = HashMap::new();
        let mut code = HashMap::new();
        desc.insert("a".to_string(), 0.1);
        desc.insert("b".to_string(), 1.5);
        code.insert("a".to_string(), 0.4);
        code.insert("c".to_string(), 0.2);
        let hits = combine_scores(&desc, &code, 10, 0.6, 0.4);
        for h in &hits {
            assert!((0.0..=1.0).contains(&h.score));
        }
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
