//! Build a registry from persisted tool descriptors.

use std::path::Path;
use std::sync::Arc;

use cm_domain::error::Result;
use cm_domain::tool::ToolKind;
use cm_storage::{FileToolStore, ToolStore};
use cm_vector::Embedder;

use crate::cli::CliAdapter;
use crate::mcp::McpAdapter;
use crate::registry::ToolRegistry;

/// Load every descriptor from the store: CLI specs aggregate into one
/// adapter, each MCP spec becomes its own. A failing CLI registration
/// fails the whole load; a failing MCP connection is logged and skipped.
pub async fn registry_from_store(
    store: &dyn ToolStore,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<Arc<ToolRegistry>> {
    let registry = Arc::new(ToolRegistry::new(embedder));

    let mut cli_specs = Vec::new();
    let mut mcp_specs = Vec::new();
    for spec in store.list().await? {
        match spec.kind {
            ToolKind::Cli => cli_specs.push(spec),
            ToolKind::Mcp => mcp_specs.push(spec),
        }
    }

    if !cli_specs.is_empty() {
        let adapter = CliAdapter::from_specs(cli_specs);
        if !adapter.is_empty() {
            registry.register_adapter(Arc::new(adapter), None).await?;
        }
    }

    for spec in mcp_specs {
        match McpAdapter::connect(&spec).await {
            Ok(adapter) => {
                registry.register_adapter(Arc::new(adapter), None).await?;
                tracing::info!(tool = %spec.name, "MCP tool loaded");
            }
            Err(e) => {
                tracing::warn!(tool = %spec.name, error = %e, "MCP tool failed, skipping");
            }
        }
    }

    Ok(registry)
}

/// Load a registry from a directory of `*.yaml` descriptors.
pub async fn registry_from_dir(
    path: impl AsRef<Path>,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<Arc<ToolRegistry>> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "tools path does not exist, registry will be empty");
        return Ok(Arc::new(ToolRegistry::new(embedder)));
    }
    let store = FileToolStore::new(path);
    registry_from_store(&store, embedder).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_cli_tools_and_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("echo.yaml"),
            "name: echo\nargs: \"{text}\"\ntags: [util]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "{{{{").unwrap();
        std::fs::write(dir.path().join("nameless.yaml"), "description: no name\n").unwrap();

        let registry = registry_from_dir(dir.path(), None).await.unwrap();
        let names: Vec<String> = registry
            .list_tools(None)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["echo"]);
    }

    #[tokio::test]
    async fn missing_dir_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_from_dir(dir.path().join("absent"), None)
            .await
            .unwrap();
        assert_eq!(registry.tool_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_mcp_tool_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("remote.yaml"),
            "name: remote\ntype: mcp\ntransport: stdio\ncommand: definitely-not-a-command-zzz\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("echo.yaml"),
            "name: echo\nargs: \"{text}\"\n",
        )
        .unwrap();

        let registry = registry_from_dir(dir.path(), None).await.unwrap();
        let names: Vec<String> = registry
            .list_tools(None)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["echo"]);
    }
}
