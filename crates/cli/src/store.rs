//! Store operations behind the CLI subcommands.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use cm_domain::skill::Skill;
use cm_storage::{
    FileSkillStore, FileToolStore, RedisSkillStore, RedisToolStore, SkillStore, ToolStore,
};

/// Content hash used by `diff`:
/// `hex(SHA-256("{name}:{description}:{source}"))[..12]`.
pub fn skill_hash(skill: &Skill) -> String {
    let content = format!("{}:{}:{}", skill.name, skill.description, skill.source);
    hex::encode(Sha256::digest(content.as_bytes()))[..12].to_string()
}

async fn connect(target: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    if !(target.starts_with("redis://") || target.starts_with("rediss://")) {
        bail!("unknown scheme in {target}; supported: redis://, rediss://");
    }
    let client = redis::Client::open(target).with_context(|| format!("bad target URL {target}"))?;
    client
        .get_connection_manager()
        .await
        .with_context(|| format!("cannot connect to {target}"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// bootstrap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn bootstrap_skills(
    source: &Path,
    target: &str,
    prefix: &str,
    clear: bool,
) -> anyhow::Result<usize> {
    let conn = connect(target).await?;
    let store = RedisSkillStore::new(conn, prefix);

    if clear {
        for skill in store.list().await? {
            store.delete(&skill.name).await?;
            println!("  Removed: {}", skill.name);
        }
    }

    let local = FileSkillStore::new(source);
    let skills = local.list().await?;
    store.save_batch(&skills).await?;
    for skill in &skills {
        println!("  Added: {}", skill.name);
    }

    println!(
        "\nBootstrapped {} skills to {target} (prefix: {prefix})",
        skills.len()
    );
    Ok(skills.len())
}

pub async fn bootstrap_tools(
    source: &Path,
    target: &str,
    prefix: &str,
    clear: bool,
) -> anyhow::Result<usize> {
    let conn = connect(target).await?;
    let store = RedisToolStore::new(conn, prefix);

    if clear {
        for spec in store.list().await? {
            store.delete(&spec.name).await?;
            println!("  Removed: {}", spec.name);
        }
    }

    let local = FileToolStore::new(source);
    let specs = local.list().await?;
    for spec in &specs {
        store.save(spec).await?;
        println!("  Added: {}", spec.name);
    }

    println!(
        "\nBootstrapped {} tools to {target} (prefix: {prefix})",
        specs.len()
    );
    Ok(specs.len())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// pull
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn pull(target: &str, prefix: &str, dest: &Path) -> anyhow::Result<usize> {
    let conn = connect(target).await?;
    let store = RedisSkillStore::new(conn, prefix);
    let local = FileSkillStore::new(dest);

    let skills = store.list().await?;
    for skill in &skills {
        local.save(skill).await?;
        println!("  {} -> {}", skill.name, dest.join(format!("{}.rhai", skill.name)).display());
    }

    println!("\nPulled {} skills to {}", skills.len(), dest.display());
    Ok(skills.len())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// diff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, PartialEq)]
pub struct DiffReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

pub async fn diff(source: &Path, target: &str, prefix: &str) -> anyhow::Result<DiffReport> {
    let conn = connect(target).await?;
    let remote_store = RedisSkillStore::new(conn, prefix);
    let local_store = FileSkillStore::new(source);

    let local: BTreeMap<String, Skill> = local_store
        .list()
        .await?
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    let remote: BTreeMap<String, Skill> = remote_store
        .list()
        .await?
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    let mut report = DiffReport::default();
    let all_names: std::collections::BTreeSet<&String> =
        local.keys().chain(remote.keys()).collect();

    for name in all_names {
        match (local.get(name), remote.get(name)) {
            (None, Some(_)) => {
                println!("  + {name} (agent-created)");
                report.added.push(name.clone());
            }
            (Some(_), None) => {
                println!("  - {name} (removed from store)");
                report.removed.push(name.clone());
            }
            (Some(l), Some(r)) if skill_hash(l) != skill_hash(r) => {
                println!("  ~ {name} (modified)");
                report.modified.push(name.clone());
            }
            _ => {
                println!("  = {name}");
                report.unchanged.push(name.clone());
            }
        }
    }

    Ok(report)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub async fn list_skills(target: &str, prefix: &str) -> anyhow::Result<usize> {
    let conn = connect(target).await?;
    let store = RedisSkillStore::new(conn, prefix);
    let skills = store.list().await?;
    for skill in &skills {
        println!("  {}: {}", skill.name, truncate(&skill.description, 50));
    }
    println!("\n{} skills in {target} (prefix: {prefix})", skills.len());
    Ok(skills.len())
}

pub async fn list_tools(target: &str, prefix: &str) -> anyhow::Result<usize> {
    let conn = connect(target).await?;
    let store = RedisToolStore::new(conn, prefix);
    let specs = store.list().await?;
    for spec in &specs {
        println!("  {}: {}", spec.name, truncate(&spec.description, 50));
    }
    println!("\n{} tools in {target} (prefix: {prefix})", specs.len());
    Ok(specs.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(name: &str, description: &str, source: &str) -> Skill {
        Skill {
            name: name.into(),
            description: description.into(),
            parameters: vec![],
            source: source.into(),
        }
    }

    #[test]
    fn hash_is_twelve_hex_chars_and_content_sensitive() {
        let a = skill_hash(&skill("s", "d", "fn run() {}"));
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let same = skill_hash(&skill("s", "d", "fn run() {}"));
        assert_eq!(a, same);

        assert_ne!(a, skill_hash(&skill("s", "d2", "fn run() {}")));
        assert_ne!(a, skill_hash(&skill("s", "d", "fn run() { 1 }")));
        assert_ne!(a, skill_hash(&skill("s2", "d", "fn run() {}")));
    }

    #[tokio::test]
    async fn non_redis_scheme_is_an_error() {
        assert!(connect("s3://bucket").await.is_err());
        assert!(connect("file:///tmp").await.is_err());
    }
}
