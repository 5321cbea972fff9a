//! RPC-backed namespaces installed into the worker's interpreter.
//!
//! Each method builds a request frame, raises it as an input request on
//! the stdin channel, blocks until the host's input reply arrives, and
//! either returns the result or raises the error payload so user code
//! sees an ordinary exception. The interpreter is single-threaded, so at
//! most one RPC is ever outstanding.

use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};

use cm_exec::protocol::{Channel, Frame, FramePayload};
use cm_exec::rpc::{RpcRequest, RpcResponse};
use cm_exec::value::{dynamic_to_json, json_to_dynamic};

pub type SharedWriter = Arc<Mutex<std::io::Stdout>>;

pub fn write_frame(writer: &SharedWriter, frame: &Frame) -> std::io::Result<()> {
    let line = frame
        .to_line()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut out = writer
        .lock()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "stdout writer poisoned"))?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}

fn rt_err(message: impl std::fmt::Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.to_string()),
        Position::NONE,
    ))
}

/// The blocking request/reply bridge to the host.
#[derive(Clone)]
pub struct RpcChannel {
    writer: SharedWriter,
    replies: Arc<Mutex<Receiver<Frame>>>,
    timeout: Duration,
}

impl RpcChannel {
    pub fn new(writer: SharedWriter, replies: Receiver<Frame>, timeout: Duration) -> Self {
        Self {
            writer,
            replies: Arc::new(Mutex::new(replies)),
            timeout,
        }
    }

    pub fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Box<EvalAltResult>> {
        let request = RpcRequest::new(method, params);
        let prompt = serde_json::to_string(&request).map_err(rt_err)?;
        let frame = Frame::new(Channel::Stdin, FramePayload::InputRequest { prompt });
        write_frame(&self.writer, &frame)
            .map_err(|e| rt_err(format!("rpc transport failed: {e}")))?;

        let replies = self.replies.lock().map_err(|_| rt_err("rpc channel poisoned"))?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| rt_err(format!("rpc timed out waiting for {method}")))?;
            let reply = replies
                .recv_timeout(remaining)
                .map_err(|_| rt_err(format!("rpc timed out waiting for {method}")))?;
            let FramePayload::InputReply { value } = reply.payload else {
                continue;
            };
            // Plain interactive input gets an empty-string reply; treat
            // it as unit.
            if value.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            let response: RpcResponse = match serde_json::from_str(&value) {
                Ok(response) => response,
                Err(e) => return Err(rt_err(format!("bad rpc reply: {e}"))),
            };
            if response.id != request.id {
                tracing::warn!(expected = %request.id, got = %response.id, "mismatched rpc reply, skipping");
                continue;
            }
            if let Some(error) = response.error {
                // Raise the structured payload; the type tag rides along
                // as metadata without re-typing the exception.
                let mut map = rhai::Map::new();
                map.insert("message".into(), Dynamic::from(error.message.clone()));
                map.insert("type".into(), Dynamic::from(error.error_type));
                map.insert("namespace".into(), Dynamic::from(error.namespace));
                map.insert("operation".into(), Dynamic::from(error.operation));
                return Err(Box::new(EvalAltResult::ErrorRuntime(
                    Dynamic::from_map(map),
                    Position::NONE,
                )));
            }
            return Ok(response.result.unwrap_or(serde_json::Value::Null));
        }
    }

    fn call_dynamic(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        Ok(json_to_dynamic(&self.call(method, params)?))
    }
}

fn map_to_json(map: &rhai::Map) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
            .collect(),
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Namespace shims
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct RemoteTools(pub RpcChannel);

#[derive(Clone)]
pub struct RemoteSkills(pub RpcChannel);

#[derive(Clone)]
pub struct RemoteArtifacts {
    pub rpc: RpcChannel,
    pub display_path: String,
}

#[derive(Clone)]
pub struct RemoteDeps(pub RpcChannel);

/// Register the RPC-backed namespaces and push them into the scope.
pub fn install_namespaces(
    engine: &mut Engine,
    scope: &mut Scope<'static>,
    rpc: RpcChannel,
    artifacts_path: String,
) {
    // Make the namespaces reachable from inside `fn` bodies too; script
    // functions cannot see scope variables.
    let resolver_rpc = rpc.clone();
    let resolver_path = artifacts_path.clone();
    engine.on_var(move |name, _index, _context| {
        Ok(match name {
            "tools" => Some(Dynamic::from(RemoteTools(resolver_rpc.clone()))),
            "skills" => Some(Dynamic::from(RemoteSkills(resolver_rpc.clone()))),
            "artifacts" => Some(Dynamic::from(RemoteArtifacts {
                rpc: resolver_rpc.clone(),
                display_path: resolver_path.clone(),
            })),
            "deps" => Some(Dynamic::from(RemoteDeps(resolver_rpc.clone()))),
            _ => None,
        })
    });

    engine
        .register_type_with_name::<RemoteTools>("tools")
        .register_fn("call", |ns: &mut RemoteTools, name: &str| {
            ns.0.call_dynamic(
                "tools.call",
                serde_json::json!({"name": name, "args": {}}),
            )
        })
        .register_fn("call", |ns: &mut RemoteTools, name: &str, args: rhai::Map| {
            ns.0.call_dynamic(
                "tools.call",
                serde_json::json!({"name": name, "args": map_to_json(&args)}),
            )
        })
        .register_fn(
            "invoke",
            |ns: &mut RemoteTools, name: &str, recipe: &str| {
                ns.0.call_dynamic(
                    "tools.call",
                    serde_json::json!({"name": name, "callable": recipe, "args": {}}),
                )
            },
        )
        .register_fn(
            "invoke",
            |ns: &mut RemoteTools, name: &str, recipe: &str, args: rhai::Map| {
                ns.0.call_dynamic(
                    "tools.call",
                    serde_json::json!({
                        "name": name,
                        "callable": recipe,
                        "args": map_to_json(&args),
                    }),
                )
            },
        )
        .register_fn("list", |ns: &mut RemoteTools| {
            ns.0.call_dynamic("tools.list", serde_json::json!({}))
        })
        .register_fn("search", |ns: &mut RemoteTools, query: &str| {
            ns.0.call_dynamic("tools.search", serde_json::json!({"query": query}))
        })
        .register_fn(
            "search",
            |ns: &mut RemoteTools, query: &str, limit: i64| {
                ns.0.call_dynamic(
                    "tools.search",
                    serde_json::json!({"query": query, "limit": limit}),
                )
            },
        )
        .register_fn("recipes", |ns: &mut RemoteTools, name: &str| {
            ns.0.call_dynamic("tools.list_recipes", serde_json::json!({"name": name}))
        });

    engine
        .register_type_with_name::<RemoteSkills>("skills")
        .register_fn("list", |ns: &mut RemoteSkills| {
            ns.0.call_dynamic("skills.list", serde_json::json!({}))
        })
        .register_fn("search", |ns: &mut RemoteSkills, query: &str| {
            ns.0.call_dynamic("skills.search", serde_json::json!({"query": query}))
        })
        .register_fn(
            "search",
            |ns: &mut RemoteSkills, query: &str, limit: i64| {
                ns.0.call_dynamic(
                    "skills.search",
                    serde_json::json!({"query": query, "limit": limit}),
                )
            },
        )
        .register_fn("get", |ns: &mut RemoteSkills, name: &str| {
            ns.0.call_dynamic("skills.get", serde_json::json!({"name": name}))
        })
        .register_fn(
            "create",
            |ns: &mut RemoteSkills, name: &str, source: &str, description: &str| {
                ns.0.call_dynamic(
                    "skills.create",
                    serde_json::json!({
                        "name": name,
                        "source": source,
                        "description": description,
                    }),
                )
            },
        )
        .register_fn(
            "create",
            |ns: &mut RemoteSkills, name: &str, source: &str| {
                ns.0.call_dynamic(
                    "skills.create",
                    serde_json::json!({"name": name, "source": source}),
                )
            },
        )
        .register_fn("delete", |ns: &mut RemoteSkills, name: &str| {
            ns.0.call_dynamic("skills.delete", serde_json::json!({"name": name}))
        })
        .register_fn("invoke", |ns: &mut RemoteSkills, name: &str| {
            ns.0.call_dynamic(
                "skills.invoke",
                serde_json::json!({"name": name, "args": {}}),
            )
        })
        .register_fn(
            "invoke",
            |ns: &mut RemoteSkills, name: &str, args: rhai::Map| {
                ns.0.call_dynamic(
                    "skills.invoke",
                    serde_json::json!({"name": name, "args": map_to_json(&args)}),
                )
            },
        );

    engine
        .register_type_with_name::<RemoteArtifacts>("artifacts")
        .register_fn("list", |ns: &mut RemoteArtifacts| {
            ns.rpc.call_dynamic("artifacts.list", serde_json::json!({}))
        })
        .register_fn("load", |ns: &mut RemoteArtifacts, name: &str| {
            ns.rpc.call_dynamic("artifacts.load", serde_json::json!({"name": name}))
        })
        .register_fn(
            "save",
            |ns: &mut RemoteArtifacts, name: &str, data: Dynamic| {
                ns.rpc.call_dynamic(
                    "artifacts.save",
                    serde_json::json!({"name": name, "data": dynamic_to_json(&data)}),
                )
            },
        )
        .register_fn(
            "save",
            |ns: &mut RemoteArtifacts, name: &str, data: Dynamic, description: &str| {
                ns.rpc.call_dynamic(
                    "artifacts.save",
                    serde_json::json!({
                        "name": name,
                        "data": dynamic_to_json(&data),
                        "description": description,
                    }),
                )
            },
        )
        .register_fn(
            "save",
            |ns: &mut RemoteArtifacts,
             name: &str,
             data: Dynamic,
             description: &str,
             metadata: rhai::Map| {
                ns.rpc.call_dynamic(
                    "artifacts.save",
                    serde_json::json!({
                        "name": name,
                        "data": dynamic_to_json(&data),
                        "description": description,
                        "metadata": map_to_json(&metadata),
                    }),
                )
            },
        )
        .register_fn("delete", |ns: &mut RemoteArtifacts, name: &str| {
            ns.rpc.call_dynamic("artifacts.delete", serde_json::json!({"name": name}))
        })
        .register_fn("exists", |ns: &mut RemoteArtifacts, name: &str| {
            ns.rpc.call_dynamic("artifacts.exists", serde_json::json!({"name": name}))
        })
        .register_fn("get", |ns: &mut RemoteArtifacts, name: &str| {
            ns.rpc.call_dynamic("artifacts.get", serde_json::json!({"name": name}))
        })
        .register_get("path", |ns: &mut RemoteArtifacts| ns.display_path.clone());

    engine
        .register_type_with_name::<RemoteDeps>("deps")
        .register_fn("list", |ns: &mut RemoteDeps| {
            ns.0.call_dynamic("deps.list", serde_json::json!({}))
        })
        .register_fn("add", |ns: &mut RemoteDeps, package: &str| {
            ns.0.call_dynamic("deps.add", serde_json::json!({"package": package}))
        })
        .register_fn("remove", |ns: &mut RemoteDeps, package: &str| {
            ns.0.call_dynamic("deps.remove", serde_json::json!({"package": package}))
        })
        .register_fn("sync", |ns: &mut RemoteDeps| {
            ns.0.call_dynamic("deps.sync", serde_json::json!({}))
        });

    // Plain variables, not constants: methods take `&mut` receivers.
    scope.push("tools", RemoteTools(rpc.clone()));
    scope.push("skills", RemoteSkills(rpc.clone()));
    scope.push(
        "artifacts",
        RemoteArtifacts {
            rpc: rpc.clone(),
            display_path: artifacts_path,
        },
    );
    scope.push("deps", RemoteDeps(rpc));
}
