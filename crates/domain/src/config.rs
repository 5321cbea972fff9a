use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session-level behavior shared by all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default per-run timeout (seconds) when the caller passes none.
    #[serde(default = "d_30f")]
    pub default_timeout_sec: f64,
    /// Allow `deps.add` / `deps.remove` from agent code at runtime.
    #[serde(default = "d_true")]
    pub allow_runtime_deps: bool,
    /// Install declared dependencies during session start.
    #[serde(default)]
    pub sync_deps_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_sec: 30.0,
            allow_runtime_deps: true,
            sync_deps_on_start: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subprocess kernel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Worker binary to spawn. Defaults to `codemode-kernel` on PATH;
    /// override for test doubles or packaged layouts.
    #[serde(default = "d_kernel_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout for the worker to answer the readiness handshake (seconds).
    #[serde(default = "d_30f")]
    pub startup_timeout_sec: f64,
    /// Timeout for a single host-side RPC dispatch (seconds).
    #[serde(default = "d_30f")]
    pub rpc_timeout_sec: f64,
    /// Liveness poll period while a run is in flight (seconds).
    #[serde(default = "d_poll")]
    pub poll_interval_sec: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            command: d_kernel_command(),
            args: Vec::new(),
            startup_timeout_sec: 30.0,
            rpc_timeout_sec: 30.0,
            poll_interval_sec: 0.5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Container executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "d_image")]
    pub image: String,
    /// Host used to reach the mapped service port.
    #[serde(default = "d_localhost")]
    pub host: String,
    /// Fixed host port; 0 lets the daemon pick one.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "d_60f")]
    pub startup_timeout_sec: f64,
    #[serde(default = "d_poll")]
    pub health_check_interval_sec: f64,
    /// Default per-run timeout forwarded to the service.
    #[serde(default = "d_30f")]
    pub default_timeout_sec: f64,
    /// Bearer token shared with the in-container service. Required unless
    /// `auth_disabled` is set.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_disabled: bool,
    /// Extra environment for the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: d_image(),
            host: d_localhost(),
            port: 0,
            startup_timeout_sec: 60.0,
            health_check_interval_sec: 0.5,
            default_timeout_sec: 30.0,
            auth_token: None,
            auth_disabled: false,
            env: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Container-side server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration the multi-session server reads from its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_bind")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_disabled: bool,
    /// Sessions idle longer than this are dropped (seconds).
    #[serde(default = "d_3600")]
    pub session_expiry_sec: u64,
    #[serde(default = "d_30f")]
    pub default_timeout_sec: f64,
    #[serde(default)]
    pub allow_runtime_deps: bool,

    // File mode paths (bind-mounted by the container executor).
    #[serde(default)]
    pub tools_path: Option<PathBuf>,
    #[serde(default = "d_skills_path")]
    pub skills_path: PathBuf,
    #[serde(default = "d_artifacts_path")]
    pub artifacts_path: PathBuf,
    #[serde(default)]
    pub deps_path: Option<PathBuf>,

    // KV mode (takes precedence over file paths when set).
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "d_tools_prefix")]
    pub tools_prefix: String,
    #[serde(default = "d_skills_prefix")]
    pub skills_prefix: String,
    #[serde(default = "d_artifacts_prefix")]
    pub artifacts_prefix: String,
    #[serde(default)]
    pub deps_prefix: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_bind(),
            port: d_port(),
            auth_token: None,
            auth_disabled: false,
            session_expiry_sec: 3600,
            default_timeout_sec: 30.0,
            allow_runtime_deps: false,
            tools_path: None,
            skills_path: d_skills_path(),
            artifacts_path: d_artifacts_path(),
            deps_path: None,
            redis_url: None,
            tools_prefix: d_tools_prefix(),
            skills_prefix: d_skills_prefix(),
            artifacts_prefix: d_artifacts_prefix(),
            deps_prefix: None,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment variables the container
    /// executor injects. Fails when auth is neither configured nor
    /// explicitly disabled.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut cfg = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            cfg.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            cfg.port = port
                .parse()
                .map_err(|_| crate::error::Error::Misconfigured(format!("bad PORT: {port}")))?;
        }
        if let Ok(expiry) = std::env::var("SESSION_EXPIRY") {
            cfg.session_expiry_sec = expiry.parse().map_err(|_| {
                crate::error::Error::Misconfigured(format!("bad SESSION_EXPIRY: {expiry}"))
            })?;
        }

        cfg.auth_token = std::env::var("CONTAINER_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        cfg.auth_disabled = std::env::var("CONTAINER_AUTH_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if cfg.auth_token.is_none() && !cfg.auth_disabled {
            return Err(crate::error::Error::Misconfigured(
                "CONTAINER_AUTH_TOKEN not set and auth not disabled".into(),
            ));
        }

        cfg.redis_url = std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty());
        if let Ok(p) = std::env::var("REDIS_TOOLS_PREFIX") {
            cfg.tools_prefix = p;
        }
        if let Ok(p) = std::env::var("REDIS_SKILLS_PREFIX") {
            cfg.skills_prefix = p;
        }
        if let Ok(p) = std::env::var("REDIS_ARTIFACTS_PREFIX") {
            cfg.artifacts_prefix = p;
        }
        cfg.deps_prefix = std::env::var("REDIS_DEPS_PREFIX").ok();

        cfg.tools_path = std::env::var("TOOLS_PATH").ok().map(PathBuf::from);
        if let Ok(p) = std::env::var("SKILLS_PATH") {
            cfg.skills_path = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("ARTIFACTS_PATH") {
            cfg.artifacts_path = PathBuf::from(p);
        }
        cfg.deps_path = std::env::var("DEPS_PATH").ok().map(PathBuf::from);

        Ok(cfg)
    }

    /// Deps key prefix, derived from the tools prefix namespace when not
    /// set explicitly (`myapp:tools` -> `myapp:deps`).
    pub fn deps_prefix(&self) -> String {
        match &self.deps_prefix {
            Some(p) => p.clone(),
            None => match self.tools_prefix.rsplit_once(':') {
                Some((ns, _)) => format!("{ns}:deps"),
                None => "deps".to_string(),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Package installer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Installer executable plus fixed leading arguments. The subcommand
    /// (`install` / `uninstall`) and the package spec are appended.
    #[serde(default = "d_installer")]
    pub command: Vec<String>,
    #[serde(default = "d_120")]
    pub timeout_sec: u64,
    /// Directory packages are installed into; the interpreter's module
    /// resolver reads from here.
    #[serde(default)]
    pub modules_dir: Option<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            command: d_installer(),
            timeout_sec: 120,
            modules_dir: None,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_30f() -> f64 {
    30.0
}
fn d_60f() -> f64 {
    60.0
}
fn d_poll() -> f64 {
    0.5
}
fn d_3600() -> u64 {
    3600
}
fn d_120() -> u64 {
    120
}
fn d_kernel_command() -> String {
    "codemode-kernel".to_string()
}
fn d_image() -> String {
    "codemode:latest".to_string()
}
fn d_localhost() -> String {
    "127.0.0.1".to_string()
}
fn d_bind() -> String {
    "0.0.0.0".to_string()
}
fn d_port() -> u16 {
    8080
}
fn d_skills_path() -> PathBuf {
    PathBuf::from("/workspace/skills")
}
fn d_artifacts_path() -> PathBuf {
    PathBuf::from("/workspace/artifacts")
}
fn d_tools_prefix() -> String {
    "tools".to_string()
}
fn d_skills_prefix() -> String {
    "skills".to_string()
}
fn d_artifacts_prefix() -> String {
    "artifacts".to_string()
}
fn d_installer() -> Vec<String> {
    vec!["codemode-pkg".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deps_prefix_derived_from_tools_namespace() {
        let cfg = ServerConfig {
            tools_prefix: "myapp:tools".into(),
            ..Default::default()
        };
        assert_eq!(cfg.deps_prefix(), "myapp:deps");

        let flat = ServerConfig::default();
        assert_eq!(flat.deps_prefix(), "deps");

        let explicit = ServerConfig {
            deps_prefix: Some("custom".into()),
            ..Default::default()
        };
        assert_eq!(explicit.deps_prefix(), "custom");
    }
}
