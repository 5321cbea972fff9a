//! Redis-backed vector index using the RediSearch module.
//!
//! Each skill is one hash holding both vectors (FLOAT32 little-endian),
//! the content hash, and the skill id as a tag field. Model info lives in
//! a metadata key outside the indexed prefix so it never counts as a
//! document. Requires a Redis build with RediSearch (redis-stack).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use cm_domain::error::{Error, Result};

use crate::embedder::{Embedder, ModelInfo};
use crate::index::{combine_scores, validate_index_id, SearchHit, VectorIndex};

const FIELD_DESC_VECTOR: &str = "desc_vector";
const FIELD_CODE_VECTOR: &str = "code_vector";
const FIELD_CONTENT_HASH: &str = "content_hash";
const FIELD_SKILL_ID: &str = "skill_id";

const META_KEY_NAME: &str = "model_name";
const META_KEY_DIMENSION: &str = "dimension";
const META_KEY_VERSION: &str = "version";

fn storage_err(e: redis::RedisError) -> Error {
    Error::Storage(format!("redis: {e}"))
}

fn is_unknown_index(e: &redis::RedisError) -> bool {
    let msg = e.to_string();
    msg.contains("Unknown Index name") || msg.contains("Unknown index name") || msg.contains("no such index")
}

fn vector_bytes(vector: &[f32], dimension: usize) -> Result<Vec<u8>> {
    if vector.len() != dimension {
        return Err(Error::Internal(format!(
            "vector dimension mismatch: expected {dimension}, got {}",
            vector.len()
        )));
    }
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

pub struct RedisVectorIndex {
    conn: ConnectionManager,
    embedder: Arc<dyn Embedder>,
    index_name: String,
    doc_prefix: String,
    metadata_key: String,
}

impl RedisVectorIndex {
    /// Connect and validate the stored model. A dimension mismatch clears
    /// the index before the new model info is written.
    pub async fn open(
        client: redis::Client,
        embedder: Arc<dyn Embedder>,
        prefix: &str,
        index_name: &str,
    ) -> Result<Self> {
        let conn = client
            .get_connection_manager()
            .await
            .map_err(storage_err)?;
        let index = Self {
            conn,
            embedder,
            index_name: index_name.to_string(),
            doc_prefix: format!("{prefix}:{index_name}"),
            metadata_key: format!("__vectorindex_meta__:{index_name}"),
        };
        index.validate_or_clear_model().await?;
        index.ensure_index_exists().await?;
        Ok(index)
    }

    fn doc_key(&self, id: &str) -> String {
        format!("{}:{id}", self.doc_prefix)
    }

    async fn stored_model_info(&self) -> Result<Option<ModelInfo>> {
        let mut conn = self.conn.clone();
        let data: HashMap<String, String> =
            conn.hgetall(&self.metadata_key).await.map_err(storage_err)?;
        let (Some(name), Some(dimension)) =
            (data.get(META_KEY_NAME), data.get(META_KEY_DIMENSION))
        else {
            return Ok(None);
        };
        let dimension: usize = dimension
            .parse()
            .map_err(|_| Error::Storage(format!("bad stored dimension: {dimension}")))?;
        Ok(Some(ModelInfo {
            name: name.clone(),
            dimension,
            version: data.get(META_KEY_VERSION).cloned().unwrap_or_else(|| "1".into()),
        }))
    }

    async fn validate_or_clear_model(&self) -> Result<()> {
        let current = self.embedder.model_info();
        if let Some(stored) = self.stored_model_info().await? {
            if stored.dimension != current.dimension {
                tracing::info!(
                    stored_dimension = stored.dimension,
                    current_dimension = current.dimension,
                    index = %self.index_name,
                    "embedding model changed, clearing vector index"
                );
                self.clear().await?;
            }
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                &self.metadata_key,
                &[
                    (META_KEY_NAME, current.name.as_str()),
                    (META_KEY_DIMENSION, &current.dimension.to_string()),
                    (META_KEY_VERSION, current.version.as_str()),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn ensure_index_exists(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        match redis::cmd("FT.INFO")
            .arg(&self.index_name)
            .query_async::<redis::Value>(&mut conn)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if is_unknown_index(&e) => {}
            Err(e) => return Err(storage_err(e)),
        }

        let dim = self.embedder.dimension().to_string();
        let mut cmd = redis::cmd("FT.CREATE");
        cmd.arg(&self.index_name)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(format!("{}:", self.doc_prefix))
            .arg("SCHEMA");
        for field in [FIELD_DESC_VECTOR, FIELD_CODE_VECTOR] {
            cmd.arg(field)
                .arg("VECTOR")
                .arg("HNSW")
                .arg(6)
                .arg("TYPE")
                .arg("FLOAT32")
                .arg("DIM")
                .arg(&dim)
                .arg("DISTANCE_METRIC")
                .arg("COSINE");
        }
        cmd.arg(FIELD_CONTENT_HASH).arg("TEXT");
        cmd.arg(FIELD_SKILL_ID).arg("TAG");

        cmd.query_async::<()>(&mut conn).await.map_err(storage_err)
    }

    async fn knn(&self, field: &str, query_bytes: &[u8], k: usize) -> Result<HashMap<String, f64>> {
        let mut conn = self.conn.clone();
        let query = format!("*=>[KNN {k} @{field} $vec AS dist]");
        let reply = redis::cmd("FT.SEARCH")
            .arg(&self.index_name)
            .arg(query)
            .arg("PARAMS")
            .arg(2)
            .arg("vec")
            .arg(query_bytes)
            .arg("SORTBY")
            .arg("dist")
            .arg("RETURN")
            .arg(2)
            .arg(FIELD_SKILL_ID)
            .arg("dist")
            .arg("DIALECT")
            .arg(2)
            .query_async::<redis::Value>(&mut conn)
            .await;

        let reply = match reply {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, field, "RediSearch KNN query failed");
                return Ok(HashMap::new());
            }
        };
        Ok(parse_knn_reply(&reply))
    }
}

/// Parse a RESP2 FT.SEARCH reply: `[total, key, [field, value, ...], ...]`.
fn parse_knn_reply(value: &redis::Value) -> HashMap<String, f64> {
    let mut scores = HashMap::new();
    let redis::Value::Array(items) = value else {
        return scores;
    };
    for doc in items.iter().skip(1) {
        let redis::Value::Array(fields) = doc else {
            continue;
        };
        let mut id: Option<String> = None;
        let mut dist: Option<f64> = None;
        for pair in fields.chunks(2) {
            let [name, val] = pair else { continue };
            let Some(name) = value_to_string(name) else {
                continue;
            };
            let Some(val) = value_to_string(val) else {
                continue;
            };
            match name.as_str() {
                FIELD_SKILL_ID => id = Some(val),
                "dist" => dist = val.parse().ok(),
                _ => {}
            }
        }
        if let (Some(id), Some(dist)) = (id, dist) {
            scores.insert(id, dist);
        }
    }
    scores
}

fn value_to_string(v: &redis::Value) -> Option<String> {
    match v {
        redis::Value::BulkString(b) => Some(String::from_utf8_lossy(b).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

#[async_trait]
impl VectorIndex for RedisVectorIndex {
    async fn add(
        &self,
        id: &str,
        description: &str,
        source: &str,
        content_hash: &str,
    ) -> Result<()> {
        validate_index_id(id)?;

        if self.content_hash(id).await?.as_deref() == Some(content_hash) {
            return Ok(());
        }

        let vectors = self
            .embedder
            .embed(&[description.to_string(), source.to_string()])
            .await?;
        let dim = self.embedder.dimension();
        let desc_bytes = vector_bytes(&vectors[0], dim)?;
        let code_bytes = vector_bytes(&vectors[1], dim)?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.doc_key(id))
            .arg(FIELD_DESC_VECTOR)
            .arg(desc_bytes)
            .arg(FIELD_CODE_VECTOR)
            .arg(code_bytes)
            .arg(FIELD_CONTENT_HASH)
            .arg(content_hash)
            .arg(FIELD_SKILL_ID)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        validate_index_id(id)?;
        if self.content_hash(id).await?.is_none() {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.doc_key(id)).await.map_err(storage_err)?;
        Ok(true)
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        desc_weight: f64,
        code_weight: f64,
    ) -> Result<Vec<SearchHit>> {
        let count = self.count().await?;
        if count == 0 || limit == 0 {
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed_query(query).await?;
        let query_bytes = vector_bytes(&query_vec, self.embedder.dimension())?;
        let k = (2 * limit).min(count);

        let desc = self.knn(FIELD_DESC_VECTOR, &query_bytes, k).await?;
        let code = self.knn(FIELD_CODE_VECTOR, &query_bytes, k).await?;
        Ok(combine_scores(&desc, &code, limit, desc_weight, code_weight))
    }

    async fn content_hash(&self, id: &str) -> Result<Option<String>> {
        validate_index_id(id)?;
        let mut conn = self.conn.clone();
        let hash: Option<String> = conn
            .hget(self.doc_key(id), FIELD_CONTENT_HASH)
            .await
            .map_err(storage_err)?;
        Ok(hash)
    }

    fn model_info(&self) -> ModelInfo {
        self.embedder.model_info()
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();

        match redis::cmd("FT.DROPINDEX")
            .arg(&self.index_name)
            .arg("DD")
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => {}
            Err(e) if is_unknown_index(&e) => {}
            Err(e) => return Err(storage_err(e)),
        }

        // Sweep any stragglers under the document prefix. Metadata lives
        // outside the prefix and survives.
        let pattern = format!("{}:*", self.doc_prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await.map_err(storage_err)?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        self.ensure_index_exists().await
    }

    async fn count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let reply = redis::cmd("FT.INFO")
            .arg(&self.index_name)
            .query_async::<redis::Value>(&mut conn)
            .await;
        let reply = match reply {
            Ok(v) => v,
            Err(e) if is_unknown_index(&e) => return Ok(0),
            Err(e) => return Err(storage_err(e)),
        };

        // FT.INFO replies with a flat [name, value, ...] array.
        if let redis::Value::Array(items) = &reply {
            let mut iter = items.iter();
            while let Some(name) = iter.next() {
                let val = iter.next();
                if value_to_string(name).as_deref() == Some("num_docs") {
                    if let Some(v) = val.and_then(value_to_string) {
                        return Ok(v.parse().unwrap_or(0));
                    }
                }
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_bytes_is_f32_le() {
        let bytes = vector_bytes(&[1.0, -2.0], 2).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert!(vector_bytes(&[1.0], 2).is_err());
    }

    #[test]
    fn knn_reply_parses_ids_and_distances() {
        use redis::Value;
        let reply = Value::Array(vec![
            Value::Int(2),
            Value::BulkString(b"vectors:skills_idx:a".to_vec()),
            Value::Array(vec![
                Value::BulkString(b"skill_id".to_vec()),
                Value::BulkString(b"a".to_vec()),
                Value::BulkString(b"dist".to_vec()),
                Value::BulkString(b"0.25".to_vec()),
            ]),
            Value::BulkString(b"vectors:skills_idx:b".to_vec()),
            Value::Array(vec![
                Value::BulkString(b"skill_id".to_vec()),
                Value::BulkString(b"b".to_vec()),
                Value::BulkString(b"dist".to_vec()),
                Value::BulkString(b"1.5".to_vec()),
            ]),
        ]);
        let scores = parse_knn_reply(&reply);
        assert_eq!(scores.len(), 2);
        assert!((scores["a"] - 0.25).abs() < 1e-9);
        assert!((scores["b"] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn malformed_reply_yields_empty() {
        assert!(parse_knn_reply(&redis::Value::Nil).is_empty());
    }
}
