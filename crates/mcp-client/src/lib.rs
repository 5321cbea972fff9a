//! `cm-mcp-client` — minimal MCP client for the tool registry.
//!
//! Covers exactly the exchanges the CodeMode tool adapter performs:
//! handshake, tool discovery, and `tools/call` over a newline-delimited
//! JSON-RPC stdio pipe. Errors surface as the workspace's shared error
//! type, so adapters need no translation layer.

pub mod session;
pub mod wire;

pub use session::McpSession;
pub use wire::{CallOutcome, RemoteTool};
