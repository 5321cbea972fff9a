use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the artifact bytes should be interpreted on load. Recorded at save
/// time so `load(save(x)) == x` modulo the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Bytes,
    Text,
    Json,
}

/// The payload forms an artifact can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactData {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl ArtifactData {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactData::Bytes(_) => ArtifactKind::Bytes,
            ArtifactData::Text(_) => ArtifactKind::Text,
            ArtifactData::Json(_) => ArtifactKind::Json,
        }
    }

    /// Raw bytes as persisted on disk or in the KV store.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ArtifactData::Bytes(b) => b.clone(),
            ArtifactData::Text(s) => s.as_bytes().to_vec(),
            ArtifactData::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
        }
    }

    /// Reconstruct from persisted bytes according to the recorded tag.
    pub fn from_bytes(kind: ArtifactKind, bytes: Vec<u8>) -> Self {
        match kind {
            ArtifactKind::Bytes => ArtifactData::Bytes(bytes),
            ArtifactKind::Text => ArtifactData::Text(String::from_utf8_lossy(&bytes).into_owned()),
            ArtifactKind::Json => match serde_json::from_slice(&bytes) {
                Ok(v) => ArtifactData::Json(v),
                Err(_) => ArtifactData::Text(String::from_utf8_lossy(&bytes).into_owned()),
            },
        }
    }
}

/// Metadata kept in the sidecar index (file backend) or the record hash
/// (KV backend) so `list` never has to open the blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Byte size of the stored payload.
    #[serde(default)]
    pub size: u64,
}

/// Reject names that could escape the artifact root. Artifact names may
/// contain `/` (they are opaque identifiers), but never traversal
/// components.
pub fn validate_store_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty() {
        return Err(crate::error::Error::invalid_name(name, "empty name"));
    }
    if name.starts_with('/') || name.contains('\\') {
        return Err(crate::error::Error::invalid_name(
            name,
            "absolute or backslash path",
        ));
    }
    if name.split('/').any(|part| part == "..") {
        return Err(crate::error::Error::invalid_name(name, "path traversal"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_preserve_kind() {
        let cases = [
            ArtifactData::Bytes(vec![0u8, 1, 2, 255]),
            ArtifactData::Text("héllo".into()),
            ArtifactData::Json(serde_json::json!({"k": 1})),
        ];
        for data in cases {
            let restored = ArtifactData::from_bytes(data.kind(), data.to_bytes());
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn traversal_names_rejected() {
        assert!(validate_store_name("../x").is_err());
        assert!(validate_store_name("a/../b").is_err());
        assert!(validate_store_name("/etc/passwd").is_err());
        assert!(validate_store_name("a\\b").is_err());
        assert!(validate_store_name("").is_err());
        assert!(validate_store_name("reports/2026/q1.json").is_ok());
    }
}
