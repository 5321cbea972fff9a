use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime tool model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named sub-operation of a tool. CLI tools get one per recipe;
/// an MCP tool namespace gets one per remote tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Parameter name -> human-readable description or type hint.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// A registered capability owned by an adapter.
///
/// Names are unique across all adapters in a registry; tags drive scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub callables: Vec<ToolCallable>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Per-tool timeout override (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<f64>,
}

impl Tool {
    pub fn callable(&self, name: &str) -> Option<&ToolCallable> {
        self.callables.iter().find(|c| c.name == name)
    }

    /// Simplified shape returned by agent-facing list/search operations.
    pub fn summary(&self) -> serde_json::Value {
        let params: BTreeMap<&str, BTreeMap<String, String>> = self
            .callables
            .iter()
            .map(|c| (c.name.as_str(), c.params.clone()))
            .collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "callables": params,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// YAML descriptor (tools/<name>.yaml)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    #[default]
    Cli,
    Mcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}

/// One recipe in a CLI tool descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeSpec {
    #[serde(default)]
    pub description: String,
    /// Argument template, e.g. `"-sV {target}"`. Tokens in `{}` are
    /// substituted from the call's args map.
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Parsed `tools/<name>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ToolKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parameter definitions for the escape-hatch (recipe-less) form.
    #[serde(default)]
    pub schema: BTreeMap<String, String>,
    #[serde(default)]
    pub recipes: BTreeMap<String, RecipeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    // CLI fields. `command` defaults to the tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Escape-hatch argument template used when no recipe is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,

    // MCP fields.
    #[serde(default)]
    pub transport: McpTransportKind,
    #[serde(default)]
    pub mcp_args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ToolSpec {
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.name)
    }

    /// Build the runtime [`Tool`] this descriptor contributes.
    pub fn to_tool(&self) -> Tool {
        let callables = self
            .recipes
            .iter()
            .map(|(name, r)| ToolCallable {
                name: name.clone(),
                description: r.description.clone(),
                params: r.params.clone(),
            })
            .collect();
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            callables,
            tags: self.tags.iter().cloned().collect(),
            timeout_sec: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_to_cli_with_name_as_command() {
        let spec: ToolSpec = serde_yaml::from_str("name: echo\nargs: \"{text}\"\n").unwrap();
        assert_eq!(spec.kind, ToolKind::Cli);
        assert_eq!(spec.command(), "echo");
    }

    #[test]
    fn recipes_become_callables() {
        let yaml = r#"
name: curl
description: transfer a URL
tags: [network]
recipes:
  get:
    description: HTTP GET
    args: "-s {url}"
    params:
      url: target URL
"#;
        let spec: ToolSpec = serde_yaml::from_str(yaml).unwrap();
        let tool = spec.to_tool();
        assert_eq!(tool.callables.len(), 1);
        assert_eq!(tool.callables[0].name, "get");
        assert!(tool.tags.contains("network"));
    }

    #[test]
    fn mcp_spec_parses_transport() {
        let yaml = "name: brave\ntype: mcp\ntransport: stdio\ncommand: npx\n";
        let spec: ToolSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, ToolKind::Mcp);
        assert_eq!(spec.transport, McpTransportKind::Stdio);
    }
}
