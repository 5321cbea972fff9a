//! A live MCP server session.
//!
//! Concurrency model: the child process is owned exclusively. All wire
//! traffic goes through `&mut ServerProcess`, and [`McpSession`] puts
//! one async lock around it, so a whole request/reply exchange is a
//! single critical section. Call sites in the registry already serialize
//! per-call, so the lock is rarely contended.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use cm_domain::error::{Error, Result};

use crate::wire::{self, CallOutcome, RemoteTool, Reply};

/// Hard deadline for one request/reply exchange.
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(30);

/// How much non-protocol stdout noise to tolerate before giving the
/// server up as misconfigured (logging to stdout instead of stderr).
const NOISE_BUDGET_BYTES: usize = 64 * 1024;

/// Grace period for the child to exit once stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child process plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ServerProcess {
    server: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    noise_bytes: usize,
}

impl ServerProcess {
    fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::call_failed(server, format!("could not launch '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::call_failed(server, "child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::call_failed(server, "child stdout not piped"))?;

        // Surface the server's stderr through our own logging.
        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "mcp", server = %server, "{line}");
                }
            });
        }

        Ok(Self {
            server: server.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
            noise_bytes: 0,
        })
    }

    async fn write_line(&mut self, msg: &Value) -> Result<()> {
        let line = serde_json::to_string(msg)?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Send a request and block until its reply arrives. Interleaved
    /// notifications and server-initiated requests are skipped; stdout
    /// noise counts against a byte budget so a server that logs to
    /// stdout fails fast instead of spinning.
    async fn exchange(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_line(&wire::request(id, method, params)).await?;

        let reply = tokio::time::timeout(EXCHANGE_DEADLINE, self.await_reply(id))
            .await
            .map_err(|_| Error::Timeout(EXCHANGE_DEADLINE.as_secs_f64()))??;
        reply.payload(&self.server, method)
    }

    async fn await_reply(&mut self, want: u64) -> Result<Reply> {
        loop {
            let mut line = String::new();
            let read = self.stdout.read_line(&mut line).await?;
            if read == 0 {
                return Err(Error::InterpreterDied(format!(
                    "MCP server '{}' closed its stdout",
                    self.server
                )));
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            match serde_json::from_str::<Reply>(text) {
                Ok(reply) if reply.is_reply() => {
                    if reply.id == Some(want) {
                        return Ok(reply);
                    }
                    tracing::debug!(server = %self.server, "reply for another request, still waiting");
                }
                Ok(_) => {
                    // Notification or server-side request; neither needs
                    // an answer for the exchanges we make.
                    tracing::trace!(server = %self.server, "skipping non-reply message");
                }
                Err(_) => {
                    self.noise_bytes += line.len();
                    if self.noise_bytes > NOISE_BUDGET_BYTES {
                        return Err(Error::call_failed(
                            &self.server,
                            "too much non-protocol output on stdout",
                        ));
                    }
                }
            }
        }
    }

    async fn notify(&mut self, method: &str) -> Result<()> {
        self.write_line(&wire::notification(method)).await
    }

    async fn shutdown(&mut self) {
        // Closing stdin asks the server to exit; escalate if it lingers.
        if let Err(e) = self.stdin.shutdown().await {
            tracing::debug!(server = %self.server, error = %e, "stdin already closed");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, ?status, "MCP server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server, error = %e, "waiting on MCP server failed");
            }
            Err(_) => {
                tracing::warn!(server = %self.server, "MCP server ignored shutdown, killing it");
                if let Err(e) = self.child.start_kill() {
                    tracing::warn!(server = %self.server, error = %e, "kill failed");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One handshaken MCP server with its discovered tool roster.
pub struct McpSession {
    server: String,
    tools: Vec<RemoteTool>,
    proc: Mutex<ServerProcess>,
}

impl McpSession {
    /// Launch a stdio server and walk it through the MCP handshake:
    /// `initialize`, the `initialized` notification, then tool
    /// discovery. A server that cannot list tools still connects; it
    /// just contributes an empty roster.
    pub async fn spawn_stdio(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut proc = ServerProcess::spawn(server, command, args, env)?;

        proc.exchange("initialize", wire::initialize_params())
            .await?;
        proc.notify("notifications/initialized").await?;
        tracing::debug!(server = %server, "MCP handshake accepted");

        let tools = match proc.exchange("tools/list", Value::Null).await {
            Ok(payload) => match wire::parse_tool_list(payload) {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "unreadable tool roster, treating as empty");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "tool discovery failed, continuing without tools");
                Vec::new()
            }
        };

        tracing::info!(server = %server, tools = tools.len(), "MCP server connected");
        Ok(Self {
            server: server.to_string(),
            tools,
            proc: Mutex::new(proc),
        })
    }

    /// SSE transport is declared in tool descriptors but not wired up
    /// yet; the loader logs and skips such servers.
    pub async fn connect_sse(
        server: &str,
        _url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<Self> {
        Err(Error::Unavailable(format!(
            "MCP server '{server}': SSE transport is not yet supported"
        )))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Tools discovered during the handshake.
    pub fn tools(&self) -> &[RemoteTool] {
        &self.tools
    }

    /// Invoke a remote tool and reduce the response to its text.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<CallOutcome> {
        let mut proc = self.proc.lock().await;
        let payload = proc
            .exchange(
                "tools/call",
                json!({ "name": tool, "arguments": arguments }),
            )
            .await?;
        Ok(wire::parse_call_outcome(&payload))
    }

    /// Shut the server down. Safe to call once per session.
    pub async fn close(&self) {
        tracing::info!(server = %self.server, "closing MCP session");
        self.proc.lock().await.shutdown().await;
    }
}
