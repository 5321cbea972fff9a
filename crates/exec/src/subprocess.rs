//! Subprocess kernel backend.
//!
//! Spawns the worker binary and drives it over the three-channel framed
//! protocol. Every `run` starts cooperating listeners on a shared
//! completion token:
//!
//! - *input listener* — answers the interpreter's input requests; RPC
//!   requests are dispatched asynchronously and replied to on the stdin
//!   channel.
//! - *iopub listener* — collects streams, the execute result, and error
//!   reports filtered by the execution's parent id.
//! - *shell listener* — waits for the matching execute reply and watches
//!   interpreter liveness.
//! - *timeout watcher* — races the caller's deadline.
//!
//! Only these listeners read the channels while a run is in flight, and
//! runs on one executor are serialized.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use cm_domain::config::KernelConfig;
use cm_domain::deps::{InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};
use cm_domain::{Capability, ExecutionResult};
use cm_storage::StorageAccess;

use crate::executor::Executor;
use crate::protocol::{Channel, Frame, FramePayload};
use crate::resources::{ResourceOptions, Resources};
use crate::rpc::{ResourceProvider, RpcRequest};

const CAPABILITIES: &[Capability] = &[
    Capability::Timeout,
    Capability::ProcessIsolation,
    Capability::Reset,
    Capability::DepsInstall,
    Capability::DepsUninstall,
];

type SharedStdin = Arc<AsyncMutex<ChildStdin>>;

async fn write_frame(stdin: &SharedStdin, frame: &Frame) -> Result<()> {
    let line = frame.to_line()?;
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

struct KernelConnection {
    child: Child,
    stdin: SharedStdin,
    shell_rx: mpsc::UnboundedReceiver<Frame>,
    iopub_rx: mpsc::UnboundedReceiver<Frame>,
    stdin_rx: mpsc::UnboundedReceiver<Frame>,
    dead: watch::Receiver<bool>,
    provider: ResourceProvider,
    router: tokio::task::JoinHandle<()>,
}

impl KernelConnection {
    async fn spawn(
        config: &KernelConfig,
        resources: Arc<Resources>,
        env: &[(String, String)],
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CODEMODE_RPC_TIMEOUT", config.rpc_timeout_sec.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::InterpreterDied(format!("failed to spawn kernel: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::InterpreterDied("failed to capture kernel stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::InterpreterDied("failed to capture kernel stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "kernel", "{line}");
                }
            });
        }

        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead) = watch::channel(false);

        // Channel router: demultiplex the single stdout pipe into the
        // three logical channels.
        let router = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match Frame::from_line(trimmed) {
                            Ok(frame) => {
                                let _ = match frame.channel {
                                    Channel::Shell => shell_tx.send(frame),
                                    Channel::Iopub => iopub_tx.send(frame),
                                    Channel::Stdin => stdin_tx.send(frame),
                                };
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, line = %trimmed, "unparseable kernel frame, skipping");
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = dead_tx.send(true);
        });

        let mut conn = Self {
            child,
            stdin: Arc::new(AsyncMutex::new(stdin)),
            shell_rx,
            iopub_rx,
            stdin_rx,
            dead,
            provider: ResourceProvider::new(resources),
            router,
        };
        conn.handshake(config.startup_timeout_sec).await?;
        Ok(conn)
    }

    /// Readiness probe: the kernel answers a kernel-info request once its
    /// engine is up.
    async fn handshake(&mut self, timeout_sec: f64) -> Result<()> {
        let probe = Frame::new(Channel::Shell, FramePayload::KernelInfoRequest);
        write_frame(&self.stdin, &probe).await?;

        let deadline = Duration::from_secs_f64(timeout_sec);
        let reply = tokio::time::timeout(deadline, self.shell_rx.recv())
            .await
            .map_err(|_| Error::InterpreterDied("kernel did not become ready in time".into()))?;
        match reply {
            Some(Frame {
                payload: FramePayload::KernelInfoReply { version },
                ..
            }) => {
                tracing::info!(kernel_version = %version, "kernel ready");
                Ok(())
            }
            other => Err(Error::InterpreterDied(format!(
                "unexpected kernel handshake reply: {other:?}"
            ))),
        }
    }

    fn is_dead(&self) -> bool {
        *self.dead.borrow()
    }

    async fn shutdown(&mut self) {
        self.router.abort();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "kernel already gone on shutdown");
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
    }
}

#[derive(Default)]
struct RunState {
    stdout: String,
    stderr: String,
    value: Option<serde_json::Value>,
    error: Option<String>,
}

impl RunState {
    fn absorb_iopub(&mut self, frame: &Frame, exec_id: &str) {
        match &frame.payload {
            FramePayload::Stream { name, text } => {
                if name == "stderr" {
                    self.stderr.push_str(text);
                } else {
                    self.stdout.push_str(text);
                }
            }
            FramePayload::ExecuteResult { value } => {
                if frame.parent_id.as_deref() == Some(exec_id) {
                    self.value = Some(value.clone());
                }
            }
            FramePayload::Error { message } => {
                if frame.parent_id.as_deref() == Some(exec_id) && self.error.is_none() {
                    self.error = Some(message.clone());
                }
            }
            _ => {}
        }
    }
}

pub struct KernelExecutor {
    config: KernelConfig,
    options: ResourceOptions,
    conn: AsyncMutex<Option<KernelConnection>>,
    access: parking_lot::Mutex<Option<StorageAccess>>,
    closed: AtomicBool,
}

impl KernelExecutor {
    pub fn new(config: KernelConfig, options: ResourceOptions) -> Self {
        Self {
            config,
            options,
            conn: AsyncMutex::new(None),
            access: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn build_resources(&self) -> Result<Arc<Resources>> {
        let access = self.access.lock().clone();
        let resources = match access {
            Some(access) => Resources::from_access(&access, &self.options).await?,
            None => Resources::scratch(&self.options).await?,
        };
        Ok(Arc::new(resources))
    }

    /// Environment the worker needs: where artifacts live for raw file
    /// I/O and where installed modules resolve from. With file storage
    /// the deps directory doubles as the module root unless overridden.
    fn kernel_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let mut modules_dir = self.options.modules_dir.clone();
        if let Some(StorageAccess::File {
            artifacts_path,
            deps_path,
            ..
        }) = self.access.lock().as_ref()
        {
            env.push((
                "CODEMODE_ARTIFACTS_PATH".to_string(),
                artifacts_path.display().to_string(),
            ));
            modules_dir = modules_dir.or_else(|| Some(deps_path.clone()));
        }
        if let Some(dir) = modules_dir {
            env.push(("CODEMODE_MODULES_DIR".to_string(), dir.display().to_string()));
        }
        env
    }

    pub fn resources(&self) -> Option<Arc<Resources>> {
        // Safe snapshot for passthroughs; None while not started.
        match self.conn.try_lock() {
            Ok(guard) => guard.as_ref().map(|c| c.provider.resources().clone()),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl Executor for KernelExecutor {
    fn supported_capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn start(&self, storage_access: Option<StorageAccess>) -> Result<()> {
        *self.access.lock() = storage_access;
        let resources = self.build_resources().await?;
        let conn = KernelConnection::spawn(&self.config, resources, &self.kernel_env()).await?;
        *self.conn.lock().await = Some(conn);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, code: &str, timeout: Option<f64>) -> Result<ExecutionResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(ExecutionResult::err("executor is closed"));
        }

        // Holding the connection lock serializes runs and gives the
        // listeners exclusive channel access.
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Unavailable("executor not started".into()))?;
        if conn.is_dead() {
            return Ok(ExecutionResult::err(
                "interpreter died; reset the session to continue",
            ));
        }

        let exec = Frame::new(
            Channel::Shell,
            FramePayload::ExecuteRequest {
                code: code.to_string(),
            },
        );
        let exec_id = exec.msg_id.clone();
        write_frame(&conn.stdin, &exec).await?;

        let state = Arc::new(parking_lot::Mutex::new(RunState::default()));
        let completion = CancellationToken::new();
        let poll = Duration::from_secs_f64(self.config.poll_interval_sec);

        {
            let KernelConnection {
                stdin,
                shell_rx,
                iopub_rx,
                stdin_rx,
                dead,
                provider,
                ..
            } = &mut *conn;

            let input_listener = {
                let completion = completion.clone();
                let stdin = stdin.clone();
                let provider = provider.clone();
                async move {
                    loop {
                        tokio::select! {
                            _ = completion.cancelled() => break,
                            frame = stdin_rx.recv() => {
                                let Some(frame) = frame else { break };
                                let FramePayload::InputRequest { prompt } = frame.payload else {
                                    continue;
                                };
                                // Dispatch asynchronously so a slow RPC never
                                // blocks the listener.
                                let stdin = stdin.clone();
                                let provider = provider.clone();
                                let request_id = frame.msg_id.clone();
                                tokio::spawn(async move {
                                    let value = match RpcRequest::from_prompt(&prompt) {
                                        Some(request) => {
                                            let response = provider.serve(&request).await;
                                            serde_json::to_string(&response)
                                                .unwrap_or_else(|_| "{}".to_string())
                                        }
                                        // Ordinary interactive input gets an
                                        // empty string.
                                        None => String::new(),
                                    };
                                    let reply = Frame::child_of(
                                        Channel::Stdin,
                                        &request_id,
                                        FramePayload::InputReply { value },
                                    );
                                    if let Err(e) = write_frame(&stdin, &reply).await {
                                        tracing::warn!(error = %e, "failed to send input reply");
                                    }
                                });
                            }
                        }
                    }
                }
            };

            let iopub_listener = {
                let completion = completion.clone();
                let state = state.clone();
                let exec_id = exec_id.clone();
                async move {
                    loop {
                        tokio::select! {
                            _ = completion.cancelled() => break,
                            frame = iopub_rx.recv() => {
                                let Some(frame) = frame else { break };
                                state.lock().absorb_iopub(&frame, &exec_id);
                            }
                        }
                    }
                }
            };

            let shell_listener = {
                let completion = completion.clone();
                let state = state.clone();
                let exec_id = exec_id.clone();
                async move {
                    let mut liveness = tokio::time::interval(poll);
                    loop {
                        tokio::select! {
                            _ = completion.cancelled() => break,
                            _ = liveness.tick() => {
                                if *dead.borrow() {
                                    let mut st = state.lock();
                                    if st.error.is_none() {
                                        st.error = Some("interpreter died during execution".to_string());
                                    }
                                    completion.cancel();
                                    break;
                                }
                            }
                            frame = shell_rx.recv() => {
                                let Some(frame) = frame else {
                                    let mut st = state.lock();
                                    if st.error.is_none() {
                                        st.error = Some("interpreter died during execution".to_string());
                                    }
                                    completion.cancel();
                                    break;
                                };
                                if frame.parent_id.as_deref() != Some(exec_id.as_str()) {
                                    continue;
                                }
                                if let FramePayload::ExecuteReply { status, error } = frame.payload {
                                    if status == "error" {
                                        let mut st = state.lock();
                                        if st.error.is_none() {
                                            st.error =
                                                Some(error.unwrap_or_else(|| "unknown error".into()));
                                        }
                                    }
                                    completion.cancel();
                                    break;
                                }
                            }
                        }
                    }
                }
            };

            let timeout_watcher = {
                let completion = completion.clone();
                let state = state.clone();
                async move {
                    match timeout {
                        Some(seconds) => {
                            tokio::select! {
                                _ = completion.cancelled() => {}
                                _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {
                                    let mut st = state.lock();
                                    if st.error.is_none() {
                                        st.error = Some(Error::Timeout(seconds).to_string());
                                    }
                                    completion.cancel();
                                }
                            }
                        }
                        None => completion.cancelled().await,
                    }
                }
            };

            tokio::join!(
                input_listener,
                iopub_listener,
                shell_listener,
                timeout_watcher
            );
        }

        // Final drain: capture iopub frames that raced the completion.
        loop {
            match tokio::time::timeout(Duration::from_millis(100), conn.iopub_rx.recv()).await {
                Ok(Some(frame)) => state.lock().absorb_iopub(&frame, &exec_id),
                _ => break,
            }
        }

        let state = std::mem::take(&mut *state.lock());
        let mut stdout = state.stdout;
        if !state.stderr.is_empty() {
            stdout.push_str(&state.stderr);
        }
        Ok(ExecutionResult {
            value: state.value.filter(|v| !v.is_null()),
            stdout,
            error: state.error,
            elapsed_ms: 0.0,
        })
    }

    async fn reset(&self) -> Result<()> {
        // Restart the kernel; that is the only reliable way to stop
        // whatever is still executing.
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            conn.shutdown().await;
        }
        let resources = self.build_resources().await?;
        *guard = Some(KernelConnection::spawn(&self.config, resources, &self.kernel_env()).await?);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            conn.provider.resources().registry.close().await;
            conn.shutdown().await;
        }
        *guard = None;
        Ok(())
    }

    async fn install_deps(&self, packages: &[String]) -> Result<InstallReport> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("executor not started".into()))?;
        conn.provider.resources().deps.install(packages).await
    }

    async fn uninstall_deps(&self, packages: &[String]) -> Result<RemoveReport> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("executor not started".into()))?;
        conn.provider.resources().deps.uninstall(packages).await
    }
}
