//! Execution backends for the CodeMode session runtime.
//!
//! Three executor flavors behind one contract:
//! - [`in_process`] — same-process interpreter, fast, no isolation.
//! - [`subprocess`] — worker-process kernel over the framed three-channel
//!   protocol, with host↔interpreter RPC on the input channel.
//! - [`container`] — long-lived container running the multi-session HTTP
//!   service.
//!
//! Shared plumbing: the resource set and namespace engine, RPC framing
//! and dispatch, the package installer capability, and JSON projection.

pub mod container;
pub mod engine;
pub mod executor;
pub mod in_process;
pub mod installer;
pub mod protocol;
pub mod resources;
pub mod rpc;
pub mod subprocess;
pub mod value;

pub use container::{ContainerExecutor, SessionClient};
pub use executor::Executor;
pub use in_process::InProcessExecutor;
pub use installer::{DepsManager, NullInstaller, PackageInstaller, ProcessInstaller};
pub use resources::{ResourceOptions, Resources};
pub use rpc::{ResourceProvider, RpcRequest, RpcResponse};
pub use subprocess::KernelExecutor;
pub use value::{dynamic_to_json, json_to_dynamic};
