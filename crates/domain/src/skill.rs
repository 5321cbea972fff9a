use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Names that can never be used for a skill — they would shadow the
/// injected namespaces or the entry point inside the interpreter.
pub const RESERVED_NAMES: &[&str] = &["tools", "skills", "artifacts", "deps", "run"];

const MAX_NAME_LEN: usize = 64;

/// One declared parameter of a skill's `run` entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named, persisted procedure authored as Rhai source with a single
/// `fn run(...)` entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<SkillParameter>,
    pub source: String,
}

impl Skill {
    /// Hash over the fields that feed the vector index. A matching stored
    /// hash means the embeddings can be reused without re-embedding.
    pub fn content_hash(&self) -> String {
        content_hash(&self.description, &self.source)
    }

    pub fn summary(&self) -> serde_json::Value {
        let params: std::collections::BTreeMap<&str, String> = self
            .parameters
            .iter()
            .map(|p| {
                let desc = p
                    .description
                    .clone()
                    .or_else(|| p.type_hint.clone())
                    .unwrap_or_default();
                (p.name.as_str(), desc)
            })
            .collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "params": params,
        })
    }

    /// Parse a skill file: leading `//!` comment lines form the
    /// description, the whole text is the source, and parameter names are
    /// reflected from the `fn run(...)` signature.
    pub fn parse(name: &str, text: &str) -> Result<Self> {
        validate_skill_name(name)?;
        let description = extract_description(text);
        let parameters = extract_run_parameters(text)
            .ok_or_else(|| Error::InvalidSource("missing fn run(...) definition".into()))?;
        Ok(Self {
            name: name.to_string(),
            description,
            parameters,
            source: text.to_string(),
        })
    }

    /// Canonical file text for this skill. Prepends the description as
    /// `//!` lines when the source does not already carry one.
    pub fn render(&self) -> String {
        if self.description.is_empty() || self.source.trim_start().starts_with("//!") {
            return self.source.clone();
        }
        let header: String = self
            .description
            .lines()
            .map(|l| format!("//! {l}\n"))
            .collect();
        format!("{header}\n{}", self.source)
    }

    /// Normalize to the canonical stored form so content hashes agree
    /// between what was submitted and what a later list returns.
    pub fn normalized(&self) -> Result<Self> {
        Self::parse(&self.name, &self.render())
    }
}

fn extract_description(text: &str) -> String {
    let mut lines = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("//!") {
            lines.push(rest.trim_start().to_string());
        } else if trimmed.is_empty() && lines.is_empty() {
            continue;
        } else {
            break;
        }
    }
    lines.join("\n").trim_end().to_string()
}

fn extract_run_parameters(text: &str) -> Option<Vec<SkillParameter>> {
    // Reflection is lexical on purpose; full validation compiles the
    // source in the skill library.
    static RUN_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RUN_RE.get_or_init(|| {
        regex::Regex::new(r"fn\s+run\s*\(([^)]*)\)").expect("static regex")
    });
    let caps = re.captures(text)?;
    let params = caps
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| SkillParameter {
            name: p.to_string(),
            type_hint: None,
            default: None,
            description: None,
        })
        .collect();
    Some(params)
}

/// `hex(SHA-256(description || "|||" || source))[..16]`
pub fn content_hash(description: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(b"|||");
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Validate a skill name: conservative identifier, bounded length, not a
/// reserved namespace name.
pub fn validate_skill_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_name(name, "must be 1-64 bytes"));
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::invalid_name(name, "empty name"));
    };
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::invalid_name(
            name,
            "must match [A-Za-z_][A-Za-z0-9_]*",
        ));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(Error::invalid_name(name, "reserved name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_hashes_equal() {
        let a = content_hash("Triple", "fn run(n) { n * 3 }");
        let b = content_hash("Triple", "fn run(n) { n * 3 }");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn distinct_content_hashes_differ() {
        let a = content_hash("Triple", "fn run(n) { n * 3 }");
        let b = content_hash("Triple", "fn run(n) { n * 4 }");
        let c = content_hash("Quadruple", "fn run(n) { n * 3 }");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn separator_prevents_boundary_collisions() {
        // ("ab", "c") and ("a", "bc") must not hash the same.
        assert_ne!(content_hash("ab", "c"), content_hash("a", "bc"));
    }

    #[test]
    fn reserved_names_rejected() {
        for name in RESERVED_NAMES {
            assert!(validate_skill_name(name).is_err());
        }
    }

    #[test]
    fn parse_extracts_description_and_params() {
        let text = "//! Triple a number\n//! second line\n\nfn run(n, factor) {\n    n * factor\n}\n";
        let skill = Skill::parse("triple", text).unwrap();
        assert_eq!(skill.description, "Triple a number\nsecond line");
        let names: Vec<_> = skill.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["n", "factor"]);
        assert_eq!(skill.source, text);
    }

    #[test]
    fn parse_requires_run() {
        assert!(Skill::parse("x", "fn other() {}").is_err());
    }

    #[test]
    fn render_parse_round_trips() {
        let skill = Skill {
            name: "triple".into(),
            description: "Triple".into(),
            parameters: vec![],
            source: "fn run(n) { n * 3 }".into(),
        };
        let normalized = skill.normalized().unwrap();
        assert_eq!(normalized.description, "Triple");
        assert!(normalized.source.starts_with("//! Triple"));
        // A second normalization is a fixed point.
        let again = normalized.normalized().unwrap();
        assert_eq!(again.source, normalized.source);
        assert_eq!(again.content_hash(), normalized.content_hash());
    }

    #[test]
    fn identifier_rules_enforced() {
        assert!(validate_skill_name("triple").is_ok());
        assert!(validate_skill_name("_x9").is_ok());
        assert!(validate_skill_name("9lives").is_err());
        assert!(validate_skill_name("has-dash").is_err());
        assert!(validate_skill_name("").is_err());
        assert!(validate_skill_name(&"x".repeat(65)).is_err());
    }
}
