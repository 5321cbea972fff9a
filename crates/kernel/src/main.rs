//! `codemode-kernel` — the subprocess worker.
//!
//! Speaks the framed three-channel protocol over stdio: the host sends
//! execute requests on the shell channel, output broadcasts on iopub,
//! and the stdin channel carries RPC input requests/replies. Logs go to
//! stderr so stdout stays a clean frame stream.

use std::io::BufRead;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cm_exec::protocol::{Channel, Frame, FramePayload};

mod remote;
mod session;

use session::KernelSession;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let rpc_timeout = std::env::var("CODEMODE_RPC_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(30));

    let writer = Arc::new(Mutex::new(std::io::stdout()));
    let (shell_tx, shell_rx) = mpsc::channel::<Frame>();
    let (reply_tx, reply_rx) = mpsc::channel::<Frame>();

    // Reader thread: demultiplex host frames. Shell traffic drives the
    // main loop; input replies feed the blocked RPC caller.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let frame = match Frame::from_line(trimmed) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable host frame, skipping");
                    continue;
                }
            };
            let sent = match frame.channel {
                Channel::Shell => shell_tx.send(frame).is_ok(),
                Channel::Stdin => match frame.payload {
                    FramePayload::InputReply { .. } => reply_tx.send(frame).is_ok(),
                    _ => true,
                },
                Channel::Iopub => true,
            };
            if !sent {
                break;
            }
        }
        // Host hung up; the main loop ends when the shell queue drains.
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kernel starting");
    let mut session = KernelSession::new(writer, reply_rx, rpc_timeout);
    while let Ok(frame) = shell_rx.recv() {
        session.handle(frame);
    }
    tracing::info!("host closed the connection, kernel exiting");
}
