//! The tool-source capability.

use async_trait::async_trait;

use cm_domain::error::Result;
use cm_domain::tool::Tool;

/// A pluggable source of tools. Adapters own the transport to whatever
/// actually executes the call (child process, MCP server, ...).
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tools this adapter contributes. Stable across the adapter's life.
    fn list_tools(&self) -> Vec<Tool>;

    /// Invoke `name`. `callable` selects a named sub-operation; `None` is
    /// the escape-hatch form for tools that support it.
    async fn call_tool(
        &self,
        name: &str,
        callable: Option<&str>,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Release transports. Called exactly once, in reverse registration
    /// order relative to other adapters.
    async fn close(&self);
}
