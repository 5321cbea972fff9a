//! MCP adapter — exposes one remote tool server as a single Tool whose
//! callables are the server's remote tools.

use async_trait::async_trait;

use cm_domain::error::{Error, Result};
use cm_domain::tool::{McpTransportKind, Tool, ToolCallable, ToolSpec};
use cm_mcp_client::McpSession;

use crate::adapter::ToolAdapter;

pub struct McpAdapter {
    tool: Tool,
    session: McpSession,
}

impl McpAdapter {
    /// Connect per the descriptor's transport and discover remote tools.
    pub async fn connect(spec: &ToolSpec) -> Result<Self> {
        let session = match spec.transport {
            McpTransportKind::Stdio => {
                McpSession::spawn_stdio(&spec.name, spec.command(), &spec.mcp_args, &spec.env)
                    .await?
            }
            McpTransportKind::Sse => {
                let url = spec.url.as_deref().ok_or_else(|| {
                    Error::Misconfigured(format!("MCP tool '{}' missing url", spec.name))
                })?;
                McpSession::connect_sse(&spec.name, url, &spec.headers).await?
            }
        };

        let callables = session
            .tools()
            .iter()
            .map(|t| ToolCallable {
                name: t.name.clone(),
                description: t.description.clone(),
                params: t.params(),
            })
            .collect();

        let tool = Tool {
            name: spec.name.clone(),
            description: spec.description.clone(),
            callables,
            tags: spec.tags.iter().cloned().collect(),
            timeout_sec: spec.timeout,
        };

        Ok(Self { tool, session })
    }
}

#[async_trait]
impl ToolAdapter for McpAdapter {
    fn list_tools(&self) -> Vec<Tool> {
        vec![self.tool.clone()]
    }

    async fn call_tool(
        &self,
        name: &str,
        callable: Option<&str>,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        if name != self.tool.name {
            return Err(Error::not_found("tool", name));
        }
        let remote = callable.ok_or_else(|| {
            Error::call_failed(name, "MCP tools require a callable (remote tool) name")
        })?;
        if self.tool.callable(remote).is_none() {
            return Err(Error::not_found("callable", format!("{name}.{remote}")));
        }

        let outcome = self.session.call(remote, args.clone()).await?;
        if outcome.is_error {
            return Err(Error::call_failed(format!("{name}.{remote}"), outcome.text));
        }
        Ok(serde_json::Value::String(outcome.text))
    }

    async fn close(&self) {
        self.session.close().await;
    }
}
