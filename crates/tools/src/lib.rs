//! Tool catalog: flat-namespace registry, tag-scoped views, and the
//! CLI / MCP adapter flavors.

pub mod adapter;
pub mod cli;
pub mod loader;
pub mod mcp;
pub mod registry;

pub use adapter::ToolAdapter;
pub use cli::CliAdapter;
pub use loader::{registry_from_dir, registry_from_store};
pub use mcp::McpAdapter;
pub use registry::{ScopedToolRegistry, ToolRegistry};
