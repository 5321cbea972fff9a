use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A declared external package the interpreter must be able to import.
/// The spec string is a package name plus an optional version constraint,
/// e.g. `"time-utils"` or `"time-utils>=0.3"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepSpec(pub String);

impl DepSpec {
    /// Package name without any version constraint.
    pub fn package_name(&self) -> &str {
        let s = self.0.as_str();
        let end = s
            .find(|c| ['>', '<', '=', '[', ' '].contains(&c))
            .unwrap_or(s.len());
        &s[..end]
    }
}

impl std::fmt::Display for DepSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Guard against flag injection into the installer command line.
pub fn validate_dep_spec(spec: &str) -> Result<()> {
    if spec.is_empty() {
        return Err(Error::invalid_name(spec, "empty package spec"));
    }
    if spec.starts_with('-') {
        return Err(Error::invalid_name(spec, "package spec starts with '-'"));
    }
    Ok(())
}

/// Outcome of installing a batch of packages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallReport {
    #[serde(default)]
    pub installed: Vec<String>,
    #[serde(default)]
    pub already_present: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

/// Outcome of removing a batch of packages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveReport {
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub not_found: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}
