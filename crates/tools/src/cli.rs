//! CLI adapter — translates tool calls into child process invocations
//! using per-recipe argument templates.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use cm_domain::error::{Error, Result};
use cm_domain::tool::{Tool, ToolSpec};

use crate::adapter::ToolAdapter;

const DEFAULT_CALL_TIMEOUT_SEC: f64 = 30.0;

/// One adapter aggregates every CLI tool descriptor in a load; each
/// descriptor produces a Tool whose callables are its named recipes.
pub struct CliAdapter {
    specs: HashMap<String, ToolSpec>,
    order: Vec<String>,
}

impl CliAdapter {
    pub fn from_specs(specs: Vec<ToolSpec>) -> Self {
        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let specs = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { specs, order }
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn spec(&self, name: &str) -> Result<&ToolSpec> {
        self.specs
            .get(name)
            .ok_or_else(|| Error::not_found("tool", name))
    }

    async fn run_command(
        &self,
        spec: &ToolSpec,
        template: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let argv = render_template(template, args)?;

        let mut cmd = Command::new(spec.command());
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(tool = %spec.name, command = %spec.command(), ?argv, "running CLI tool");

        let timeout = Duration::from_secs_f64(spec.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT_SEC));
        let child = cmd
            .spawn()
            .map_err(|e| Error::call_failed(&spec.name, format!("failed to spawn: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::call_failed(&spec.name, format!("wait failed: {e}")));
            }
            // kill_on_drop reaps the child when the future is dropped here.
            Err(_) => return Err(Error::Timeout(timeout.as_secs_f64())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::call_failed(
                &spec.name,
                format!(
                    "exit status {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        Ok(serde_json::Value::String(
            stdout.trim_end_matches('\n').to_string(),
        ))
    }
}

/// Substitute `{param}` tokens from the args map, whitespace-splitting
/// the template into argv entries. Every referenced parameter must be
/// present.
fn render_template(template: &str, args: &serde_json::Value) -> Result<Vec<String>> {
    let empty = serde_json::Map::new();
    let args = args.as_object().unwrap_or(&empty);

    let mut argv = Vec::new();
    for token in template.split_whitespace() {
        let mut rendered = String::new();
        let mut rest = token;
        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('}').ok_or_else(|| {
                Error::Internal(format!("unbalanced '{{' in args template: {template}"))
            })?;
            let param = &after[..end];
            let value = args
                .get(param)
                .ok_or_else(|| Error::call_failed(param, "missing argument"))?;
            rendered.push_str(&value_to_arg(value));
            rest = &after[end + 1..];
        }
        rendered.push_str(rest);
        if !rendered.is_empty() {
            argv.push(rendered);
        }
    }
    Ok(argv)
}

fn value_to_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ToolAdapter for CliAdapter {
    fn list_tools(&self) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.specs.get(name))
            .map(ToolSpec::to_tool)
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        callable: Option<&str>,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let spec = self.spec(name)?;
        let template = match callable {
            Some(recipe) => {
                let recipe_spec = spec.recipes.get(recipe).ok_or_else(|| {
                    Error::not_found("recipe", format!("{name}.{recipe}"))
                })?;
                recipe_spec.args.as_str()
            }
            None => spec.args.as_deref().unwrap_or(""),
        };
        self.run_command(spec, template, args).await
    }

    async fn close(&self) {
        // Child processes are per-call; nothing held open.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_spec() -> ToolSpec {
        serde_yaml::from_str(
            r#"
name: echo
description: echo text back
args: "{text}"
recipes:
  echo:
    description: echo text
    args: "{text}"
    params:
      text: text to echo
"#,
        )
        .unwrap()
    }

    #[test]
    fn template_substitutes_named_params() {
        let argv = render_template(
            "-sV {target} -p {ports}",
            &serde_json::json!({"target": "10.0.0.1", "ports": 443}),
        )
        .unwrap();
        assert_eq!(argv, ["-sV", "10.0.0.1", "-p", "443"]);
    }

    #[test]
    fn template_rejects_missing_params() {
        let err = render_template("{target}", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::CallFailed { .. }));
    }

    #[tokio::test]
    async fn echo_recipe_round_trip() {
        let adapter = CliAdapter::from_specs(vec![echo_spec()]);
        let result = adapter
            .call_tool("echo", Some("echo"), &serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn escape_hatch_uses_top_level_template() {
        let adapter = CliAdapter::from_specs(vec![echo_spec()]);
        let result = adapter
            .call_tool("echo", None, &serde_json::json!({"text": "plain"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("plain"));
    }

    #[tokio::test]
    async fn unknown_tool_and_recipe_error() {
        let adapter = CliAdapter::from_specs(vec![echo_spec()]);
        assert!(matches!(
            adapter
                .call_tool("nope", None, &serde_json::json!({}))
                .await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            adapter
                .call_tool("echo", Some("nope"), &serde_json::json!({}))
                .await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let spec: ToolSpec = serde_yaml::from_str(
            "name: sleeper\ncommand: sleep\nargs: \"{secs}\"\ntimeout: 0.2\n",
        )
        .unwrap();
        let adapter = CliAdapter::from_specs(vec![spec]);
        let err = adapter
            .call_tool("sleeper", None, &serde_json::json!({"secs": "5"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
