//! The slice of the MCP wire format CodeMode speaks.
//!
//! Messages are newline-delimited JSON-RPC 2.0. Only four exchanges
//! matter to the tool adapter: `initialize`, the `initialized`
//! notification, `tools/list`, and `tools/call`. Outgoing messages are
//! assembled as plain JSON values; incoming ones are picked apart into
//! exactly the data the registry needs, nothing more.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use cm_domain::error::{Error, Result};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Build a request message. A null `params` is omitted entirely; some
/// servers reject `"params": null`.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    let mut msg = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if !params.is_null() {
        msg["params"] = params;
    }
    msg
}

/// Build a fire-and-forget notification.
pub fn notification(method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
    })
}

/// Parameters for the `initialize` handshake.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "codemode",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incoming messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error object inside a failed reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcFault {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for RpcFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A message read off the server's stdout. Server notifications carry no
/// `id`; server-initiated requests carry an `id` but neither `result`
/// nor `error`. Only genuine replies interest us.
#[derive(Debug, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcFault>,
}

impl Reply {
    /// True when this is a response to some request of ours, as opposed
    /// to a notification or a server-side request.
    pub fn is_reply(&self) -> bool {
        self.id.is_some() && (self.result.is_some() || self.error.is_some())
    }

    /// Unwrap the payload, turning a fault into a call failure against
    /// `server`.
    pub fn payload(self, server: &str, method: &str) -> Result<Value> {
        if let Some(fault) = self.error {
            return Err(Error::call_failed(server, format!("{method}: {fault}")));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool advertised by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Value,
}

impl RemoteTool {
    /// Parameter name mapped to its description, or its JSON type when
    /// the schema gives no prose. This is the shape tool callables show
    /// to agents.
    pub fn params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Some(props) = self
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
        else {
            return out;
        };
        for (name, schema) in props {
            let hint = schema
                .get("description")
                .or_else(|| schema.get("type"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            out.insert(name.clone(), hint.to_string());
        }
        out
    }
}

/// Extract the tool roster from a `tools/list` payload.
pub fn parse_tool_list(payload: Value) -> Result<Vec<RemoteTool>> {
    #[derive(Deserialize)]
    struct Listing {
        tools: Vec<RemoteTool>,
    }
    let listing: Listing = serde_json::from_value(payload)?;
    Ok(listing.tools)
}

/// What a `tools/call` boils down to for the adapter: the joined text
/// blocks and whether the server flagged the result as an error.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub text: String,
    pub is_error: bool,
}

/// Reduce a `tools/call` payload. Non-text content blocks (images,
/// resources) are dropped; code-mode results are strings.
pub fn parse_call_outcome(payload: &Value) -> CallOutcome {
    let is_error = payload
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = payload
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    CallOutcome { text, is_error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_params_are_omitted() {
        let msg = request(7, "tools/list", Value::Null);
        assert!(msg.get("params").is_none());
        assert_eq!(msg["id"], 7);

        let msg = request(8, "tools/call", json!({"name": "ping"}));
        assert_eq!(msg["params"]["name"], "ping");
    }

    #[test]
    fn reply_classification() {
        let ok: Reply = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(ok.is_reply());

        let notif: Reply =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap();
        assert!(!notif.is_reply());

        // A server-initiated request has an id but no result/error.
        let server_req: Reply =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":9,"method":"sampling/createMessage"}"#)
                .unwrap();
        assert!(!server_req.is_reply());
    }

    #[test]
    fn faults_become_call_failures() {
        let reply: Reply = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        let err = reply.payload("weather", "tools/call").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("weather"));
        assert!(text.contains("no such method"));
        assert!(text.contains("-32601"));
    }

    #[test]
    fn tool_list_reflects_param_hints() {
        let payload = json!({
            "tools": [{
                "name": "read_file",
                "description": "Read a file",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "file path"},
                        "limit": {"type": "integer"}
                    }
                }
            }]
        });
        let tools = parse_tool_list(payload).unwrap();
        assert_eq!(tools.len(), 1);
        let params = tools[0].params();
        assert_eq!(params["path"], "file path");
        assert_eq!(params["limit"], "integer");
    }

    #[test]
    fn call_outcome_keeps_only_text_blocks() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "...."},
                {"type": "text", "text": "second"}
            ],
            "isError": true
        });
        let outcome = parse_call_outcome(&payload);
        assert_eq!(outcome.text, "first\nsecond");
        assert!(outcome.is_error);

        let empty = parse_call_outcome(&json!({}));
        assert_eq!(empty.text, "");
        assert!(!empty.is_error);
    }
}
