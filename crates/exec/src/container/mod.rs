//! Container backend: executor plus session-service HTTP client.

pub mod client;
pub mod executor;

pub use client::SessionClient;
pub use executor::ContainerExecutor;
