//! Host↔interpreter RPC frames and method dispatch.
//!
//! The interpreter's input channel doubles as a JSON request/response
//! transport: the interpreter raises an input request whose prompt is a
//! request frame; the host answers with a response frame in the input
//! reply. Prompts that are not request frames are normal interactive
//! input and get an empty-string reply.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cm_domain::error::{Error, Result};

use crate::engine::invoke_skill;
use crate::resources::Resources;

pub const RPC_REQUEST_TYPE: &str = "rpc_request";

/// Request frame as carried in the input-request prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            kind: RPC_REQUEST_TYPE.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    /// Parse a prompt string. `None` means this is ordinary interactive
    /// input, not RPC.
    pub fn from_prompt(prompt: &str) -> Option<Self> {
        let req: Self = serde_json::from_str(prompt).ok()?;
        (req.kind == RPC_REQUEST_TYPE).then_some(req)
    }
}

/// Structured error payload carried by a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub namespace: String,
    pub operation: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

/// Response frame sent back as the input reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn ok(id: &str, result: Value) -> Self {
        Self {
            id: id.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: &str, method: &str, error: &Error) -> Self {
        let (namespace, operation) = parse_method(method);
        Self {
            id: id.to_string(),
            result: None,
            error: Some(RpcErrorBody {
                namespace: namespace.to_string(),
                operation: operation.to_string(),
                message: error.to_string(),
                error_type: error_kind(error).to_string(),
            }),
        }
    }
}

/// Split a dotted method into (namespace, operation).
pub fn parse_method(method: &str) -> (&str, &str) {
    match method.split_once('.') {
        Some((namespace, operation)) => (namespace, operation),
        None => ("rpc", method),
    }
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::NotFound { .. } => "NotFound",
        Error::AlreadyExists { .. } => "AlreadyExists",
        Error::InvalidName { .. } => "InvalidName",
        Error::InvalidSource(_) => "InvalidSource",
        Error::CallFailed { .. } => "CallFailed",
        Error::Timeout(_) => "Timeout",
        Error::InterpreterDied(_) => "InterpreterDied",
        Error::AuthRequired => "AuthRequired",
        Error::AuthInvalid => "AuthInvalid",
        Error::Misconfigured(_) => "Misconfigured",
        Error::Unavailable(_) => "Unavailable",
        _ => "Internal",
    }
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Internal(format!("missing RPC parameter '{key}'")))
}

fn param_limit(params: &Value, default: usize) -> usize {
    params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serves RPC requests from an interpreter against the host resources.
#[derive(Clone)]
pub struct ResourceProvider {
    resources: Arc<Resources>,
}

impl ResourceProvider {
    pub fn new(resources: Arc<Resources>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Dispatch one request to a response frame. Never errors: failures
    /// become error frames.
    pub async fn serve(&self, request: &RpcRequest) -> RpcResponse {
        match self.dispatch(&request.method, &request.params).await {
            Ok(result) => RpcResponse::ok(&request.id, result),
            Err(e) => {
                let (namespace, operation) = parse_method(&request.method);
                tracing::warn!(namespace, operation, error = %e, "RPC dispatch failed");
                RpcResponse::err(&request.id, &request.method, &e)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: &Value) -> Result<Value> {
        let res = &self.resources;
        match method {
            // Tools.
            "tools.call" => {
                let name = param_str(params, "name")?;
                let callable = params.get("callable").and_then(|v| v.as_str());
                let args = params.get("args").cloned().unwrap_or(Value::Null);
                res.registry.call_tool(name, callable, &args).await
            }
            "tools.list" => {
                let tools = res.registry.list_tools(None);
                Ok(Value::Array(tools.iter().map(|t| t.summary()).collect()))
            }
            "tools.search" => {
                let query = param_str(params, "query")?;
                let tools = res.registry.search(query, param_limit(params, 10)).await?;
                Ok(Value::Array(tools.iter().map(|t| t.summary()).collect()))
            }
            "tools.list_recipes" => {
                let name = param_str(params, "name")?;
                Ok(serde_json::to_value(res.registry.recipes(name)?)?)
            }

            // Skills.
            "skills.invoke" => {
                let name = param_str(params, "name")?;
                let args = params.get("args").cloned().unwrap_or(Value::Null);
                invoke_skill(res.clone(), name, &args).await
            }
            "skills.search" => {
                let query = param_str(params, "query")?;
                let skills = res.skills.search(query, param_limit(params, 5)).await?;
                Ok(Value::Array(skills.iter().map(|s| s.summary()).collect()))
            }
            "skills.list" => {
                let skills = res.skills.list().await?;
                Ok(Value::Array(skills.iter().map(|s| s.summary()).collect()))
            }
            "skills.get" => {
                let name = param_str(params, "name")?;
                Ok(match res.skills.get(name).await? {
                    Some(skill) => skill.summary(),
                    None => Value::Null,
                })
            }
            "skills.create" => {
                let name = param_str(params, "name")?;
                let source = param_str(params, "source")?;
                let description = params
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let skill = res.skills.create(name, source, description).await?;
                Ok(skill.summary())
            }
            "skills.delete" => {
                let name = param_str(params, "name")?;
                Ok(Value::Bool(res.skills.remove(name).await?))
            }

            // Artifacts.
            "artifacts.load" => {
                let name = param_str(params, "name")?;
                let data = res.artifacts.load(name).await?;
                Ok(match data {
                    cm_domain::artifact::ArtifactData::Bytes(b) => {
                        Value::Array(b.into_iter().map(|x| Value::Number(x.into())).collect())
                    }
                    cm_domain::artifact::ArtifactData::Text(s) => Value::String(s),
                    cm_domain::artifact::ArtifactData::Json(v) => v,
                })
            }
            "artifacts.save" => {
                let name = param_str(params, "name")?;
                let data = params
                    .get("data")
                    .cloned()
                    .ok_or_else(|| Error::Internal("missing RPC parameter 'data'".into()))?;
                let description = params
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let metadata = params
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default();
                // The wire carries JSON, so strings stay text and
                // everything else stores as structured data.
                let payload = match data {
                    Value::String(s) => cm_domain::artifact::ArtifactData::Text(s),
                    other => cm_domain::artifact::ArtifactData::Json(other),
                };
                res.artifacts.save(name, payload, description, metadata).await?;
                Ok(Value::Null)
            }
            "artifacts.list" => Ok(serde_json::to_value(res.artifacts.list().await?)?),
            "artifacts.delete" => {
                let name = param_str(params, "name")?;
                Ok(Value::Bool(res.artifacts.delete(name).await?))
            }
            "artifacts.exists" => {
                let name = param_str(params, "name")?;
                Ok(Value::Bool(res.artifacts.exists(name).await?))
            }
            "artifacts.get" => {
                let name = param_str(params, "name")?;
                Ok(serde_json::to_value(res.artifacts.meta(name).await?)?)
            }

            // Deps.
            "deps.add" => {
                let package = param_str(params, "package")?;
                Ok(serde_json::to_value(res.deps.add_runtime(package).await?)?)
            }
            "deps.remove" => {
                let package = param_str(params, "package")?;
                Ok(Value::Bool(res.deps.remove_runtime(package).await?))
            }
            "deps.list" => Ok(serde_json::to_value(res.deps.list().await?)?),
            "deps.sync" => Ok(serde_json::to_value(res.deps.sync().await?)?),

            other => Err(Error::not_found("RPC method", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceOptions;

    async fn provider(dir: &std::path::Path) -> ResourceProvider {
        let storage = cm_storage::FileStorage::new(dir);
        let resources = Resources::from_access(
            &cm_storage::StorageBackend::serializable_access(&storage),
            &ResourceOptions::default(),
        )
        .await
        .unwrap();
        ResourceProvider::new(Arc::new(resources))
    }

    #[test]
    fn prompt_parsing_distinguishes_rpc_from_input() {
        let prompt = r#"{"type":"rpc_request","id":"abc","method":"tools.list","params":{}}"#;
        let req = RpcRequest::from_prompt(prompt).unwrap();
        assert_eq!(req.method, "tools.list");

        assert!(RpcRequest::from_prompt("What is your name? ").is_none());
        assert!(RpcRequest::from_prompt(r#"{"type":"other"}"#).is_none());
    }

    #[test]
    fn method_parsing_splits_namespace() {
        assert_eq!(parse_method("skills.invoke"), ("skills", "invoke"));
        assert_eq!(parse_method("weird"), ("rpc", "weird"));
    }

    #[tokio::test]
    async fn unknown_method_returns_error_frame() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;
        let req = RpcRequest::new("tools.frobnicate", serde_json::json!({}));
        let resp = provider.serve(&req).await;
        assert_eq!(resp.id, req.id);
        let err = resp.error.unwrap();
        assert_eq!(err.error_type, "NotFound");
        assert_eq!(err.namespace, "tools");
        assert_eq!(err.operation, "frobnicate");
    }

    #[tokio::test]
    async fn skills_round_trip_through_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;

        let create = RpcRequest::new(
            "skills.create",
            serde_json::json!({
                "name": "triple",
                "source": "fn run(n) { n * 3 }",
                "description": "Triple",
            }),
        );
        let resp = provider.serve(&create).await;
        assert!(resp.error.is_none(), "{:?}", resp.error);

        let invoke = RpcRequest::new(
            "skills.invoke",
            serde_json::json!({"name": "triple", "args": {"n": 10}}),
        );
        let resp = provider.serve(&invoke).await;
        assert_eq!(resp.result.unwrap(), serde_json::json!(30));

        let missing = RpcRequest::new(
            "skills.invoke",
            serde_json::json!({"name": "nonexistent", "args": {}}),
        );
        let resp = provider.serve(&missing).await;
        assert!(resp.error.unwrap().message.contains("not found"));
    }

    #[tokio::test]
    async fn artifact_dispatch_honors_type_tags() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;

        let save = RpcRequest::new(
            "artifacts.save",
            serde_json::json!({"name": "d.json", "data": {"k": 1}, "description": "desc"}),
        );
        assert!(provider.serve(&save).await.error.is_none());

        let load = RpcRequest::new("artifacts.load", serde_json::json!({"name": "d.json"}));
        let resp = provider.serve(&load).await;
        assert_eq!(resp.result.unwrap(), serde_json::json!({"k": 1}));

        let save_text = RpcRequest::new(
            "artifacts.save",
            serde_json::json!({"name": "t.txt", "data": "plain"}),
        );
        assert!(provider.serve(&save_text).await.error.is_none());
        let load = RpcRequest::new("artifacts.load", serde_json::json!({"name": "t.txt"}));
        assert_eq!(
            provider.serve(&load).await.result.unwrap(),
            serde_json::json!("plain")
        );
    }

    #[tokio::test]
    async fn deps_dispatch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;

        let add = RpcRequest::new("deps.add", serde_json::json!({"package": "time-utils"}));
        let resp = provider.serve(&add).await;
        assert!(resp.error.is_none());

        let list = RpcRequest::new("deps.list", serde_json::json!({}));
        assert_eq!(
            provider.serve(&list).await.result.unwrap(),
            serde_json::json!(["time-utils"])
        );

        let remove = RpcRequest::new("deps.remove", serde_json::json!({"package": "time-utils"}));
        assert_eq!(
            provider.serve(&remove).await.result.unwrap(),
            serde_json::json!(true)
        );
    }
}
