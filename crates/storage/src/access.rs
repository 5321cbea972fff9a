//! Serializable access descriptor.
//!
//! Out-of-process executors never receive a live storage object — only
//! this record, which tells them where storage lives. File-backed storage
//! hands out absolute paths (they become bind mounts for containers);
//! KV-backed storage hands out the connection URL plus key prefixes
//! (they become environment variables).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageAccess {
    File {
        tools_path: Option<PathBuf>,
        skills_path: PathBuf,
        artifacts_path: PathBuf,
        deps_path: PathBuf,
    },
    Kv {
        url: String,
        tools_prefix: String,
        skills_prefix: String,
        artifacts_prefix: String,
        deps_prefix: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_json() {
        let access = StorageAccess::Kv {
            url: "redis://localhost:6379".into(),
            tools_prefix: "app:tools".into(),
            skills_prefix: "app:skills".into(),
            artifacts_prefix: "app:artifacts".into(),
            deps_prefix: "app:deps".into(),
        };
        let json = serde_json::to_string(&access).unwrap();
        let back: StorageAccess = serde_json::from_str(&json).unwrap();
        assert_eq!(back, access);
        assert!(json.contains("\"backend\":\"kv\""));
    }
}
