//! Multi-session HTTP execution service that runs inside the container.
//!
//! Storage location arrives via environment variables set by the
//! container executor; every session shares the registries and stores
//! but keeps its own interpreter state.

pub mod auth;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::ServerState;
