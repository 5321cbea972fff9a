//! The worker's interpreter session: persistent scope and function
//! library, incremental output streaming, and execute handling.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhai::{Dynamic, Engine, Scope, AST};

use cm_exec::protocol::{Channel, Frame, FramePayload};
use cm_exec::value::dynamic_to_json;

use crate::remote::{install_namespaces, write_frame, RpcChannel, SharedWriter};

pub struct KernelSession {
    engine: Engine,
    scope: Scope<'static>,
    fn_lib: AST,
    writer: SharedWriter,
    /// Execution id the streaming hooks tag their frames with.
    current_exec: Arc<Mutex<Option<String>>>,
}

impl KernelSession {
    pub fn new(writer: SharedWriter, replies: Receiver<Frame>, rpc_timeout: Duration) -> Self {
        let current_exec: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let mut engine = Engine::new();

        // Stream print/debug output as it happens instead of buffering
        // until the run completes.
        for (hook_is_debug, stream_name) in [(false, "stdout"), (true, "stderr")] {
            let writer = writer.clone();
            let current = current_exec.clone();
            let emit = move |text: &str| {
                let parent = current.lock().ok().and_then(|c| c.clone());
                let frame = Frame {
                    channel: Channel::Iopub,
                    msg_id: uuid::Uuid::new_v4().to_string(),
                    parent_id: parent,
                    payload: FramePayload::Stream {
                        name: stream_name.to_string(),
                        text: format!("{text}\n"),
                    },
                };
                if let Err(e) = write_frame(&writer, &frame) {
                    tracing::warn!(error = %e, "failed to emit stream frame");
                }
            };
            if hook_is_debug {
                engine.on_debug(move |text, _source, _pos| emit(text));
            } else {
                engine.on_print(move |text| emit(text));
            }
        }

        if let Ok(dir) = std::env::var("CODEMODE_MODULES_DIR") {
            engine.set_module_resolver(rhai::module_resolvers::FileModuleResolver::new_with_path(
                dir,
            ));
        }

        let mut scope = Scope::new();
        let rpc = RpcChannel::new(writer.clone(), replies, rpc_timeout);
        let artifacts_path = std::env::var("CODEMODE_ARTIFACTS_PATH").unwrap_or_default();
        install_namespaces(&mut engine, &mut scope, rpc, artifacts_path);

        Self {
            engine,
            scope,
            fn_lib: AST::empty(),
            writer,
            current_exec,
        }
    }

    pub fn handle(&mut self, frame: Frame) {
        match frame.payload {
            FramePayload::KernelInfoRequest => {
                let reply = Frame::child_of(
                    Channel::Shell,
                    &frame.msg_id,
                    FramePayload::KernelInfoReply {
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                );
                self.send(&reply);
            }
            FramePayload::ExecuteRequest { code } => {
                self.execute(&frame.msg_id, &code);
            }
            other => {
                tracing::warn!(?other, "unexpected shell frame, ignoring");
            }
        }
    }

    fn execute(&mut self, exec_id: &str, code: &str) {
        if let Ok(mut current) = self.current_exec.lock() {
            *current = Some(exec_id.to_string());
        }

        let outcome = self.eval(code);

        if let Ok(mut current) = self.current_exec.lock() {
            *current = None;
        }

        match outcome {
            Ok(value) => {
                if !value.is_unit() {
                    let result = Frame::child_of(
                        Channel::Iopub,
                        exec_id,
                        FramePayload::ExecuteResult {
                            value: dynamic_to_json(&value),
                        },
                    );
                    self.send(&result);
                }
                let reply = Frame::child_of(
                    Channel::Shell,
                    exec_id,
                    FramePayload::ExecuteReply {
                        status: "ok".to_string(),
                        error: None,
                    },
                );
                self.send(&reply);
            }
            Err(message) => {
                let error = Frame::child_of(
                    Channel::Iopub,
                    exec_id,
                    FramePayload::Error {
                        message: message.clone(),
                    },
                );
                self.send(&error);
                let reply = Frame::child_of(
                    Channel::Shell,
                    exec_id,
                    FramePayload::ExecuteReply {
                        status: "error".to_string(),
                        error: Some(message),
                    },
                );
                self.send(&reply);
            }
        }
    }

    fn eval(&mut self, code: &str) -> Result<Dynamic, String> {
        let ast = self
            .engine
            .compile(code)
            .map_err(|e| format!("parse error: {e}"))?;
        let combined = self.fn_lib.merge(&ast);
        match self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &combined)
        {
            Ok(value) => {
                self.fn_lib = self.fn_lib.merge(&ast.clone_functions_only());
                Ok(value)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn send(&self, frame: &Frame) {
        if let Err(e) = write_frame(&self.writer, frame) {
            tracing::error!(error = %e, "failed to write frame, exiting");
            std::process::exit(1);
        }
    }
}
