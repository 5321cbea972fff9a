//! Session facade: one executor, four injected namespaces, storage
//! passthroughs for host-side callers.

pub mod session;

pub use session::{Session, SessionBuilder};
