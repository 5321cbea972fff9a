/// Shared error type used across all CodeMode crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid skill source: {0}")]
    InvalidSource(String),

    #[error("call to '{name}' failed: {message}")]
    CallFailed { name: String, message: String },

    #[error("timed out after {0:.1}s")]
    Timeout(f64),

    #[error("interpreter died: {0}")]
    InterpreterDied(String),

    #[error("authorization required")]
    AuthRequired,

    #[error("invalid credentials")]
    AuthInvalid,

    #[error("server misconfigured: {0}")]
    Misconfigured(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn call_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CallFailed {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
