use serde::{Deserialize, Serialize};

/// Executor capabilities — every backend advertises the subset it supports.
/// Callers select backends by capability, not by backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Per-run wall-clock timeout is enforced.
    Timeout,
    /// Code runs in a separate OS process.
    ProcessIsolation,
    /// No network reachable from the interpreter.
    NetworkIsolation,
    /// Network reachable but filtered by policy.
    NetworkFiltering,
    /// Interpreter sees its own filesystem view.
    FilesystemIsolation,
    /// Memory ceiling is enforced.
    MemoryLimit,
    /// CPU ceiling is enforced.
    CpuLimit,
    /// Session state can be reset without rebuilding the executor.
    Reset,
    /// Packages can be installed into the interpreter environment.
    DepsInstall,
    /// Packages can be removed from the interpreter environment.
    DepsUninstall,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Timeout => "timeout",
            Capability::ProcessIsolation => "process_isolation",
            Capability::NetworkIsolation => "network_isolation",
            Capability::NetworkFiltering => "network_filtering",
            Capability::FilesystemIsolation => "filesystem_isolation",
            Capability::MemoryLimit => "memory_limit",
            Capability::CpuLimit => "cpu_limit",
            Capability::Reset => "reset",
            Capability::DepsInstall => "deps_install",
            Capability::DepsUninstall => "deps_uninstall",
        };
        f.write_str(s)
    }
}
