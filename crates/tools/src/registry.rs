//! Tool registry with flat namespace and tag-based scoping.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use cm_domain::error::{Error, Result};
use cm_domain::tool::Tool;
use cm_vector::index::cosine_similarity;
use cm_vector::Embedder;

use crate::adapter::ToolAdapter;

// Substring search scoring.
const EXACT_NAME_MATCH_SCORE: i32 = 100;
const PARTIAL_NAME_MATCH_SCORE: i32 = 50;
const DESCRIPTION_MATCH_SCORE: i32 = 25;

/// Score items by substring matches on name and description.
pub fn substring_search<T>(
    query: &str,
    items: &[T],
    get_name: impl Fn(&T) -> &str,
    get_description: impl Fn(&T) -> &str,
    limit: usize,
) -> Vec<usize> {
    let query_lower = query.to_lowercase();
    let mut matches: Vec<(i32, usize)> = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let name = get_name(item).to_lowercase();
        let description = get_description(item).to_lowercase();

        let mut score = 0;
        if name.contains(&query_lower) {
            score += if name == query_lower {
                EXACT_NAME_MATCH_SCORE
            } else {
                PARTIAL_NAME_MATCH_SCORE
            };
        }
        if !description.is_empty() && description.contains(&query_lower) {
            score += DESCRIPTION_MATCH_SCORE;
        }
        if score > 0 {
            matches.push((score, i));
        }
    }

    matches.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    matches.into_iter().take(limit).map(|(_, i)| i).collect()
}

struct RegistryInner {
    /// Adapters in registration order. Close order is strictly reversed.
    adapters: Vec<Arc<dyn ToolAdapter>>,
    tools: HashMap<String, Tool>,
    tool_to_adapter: HashMap<String, usize>,
    vectors: HashMap<String, Vec<f32>>,
}

/// Flat-namespace catalog of tools.
///
/// Tools are registered by bare name; tags drive scoping. Reads are
/// lock-cheap and concurrent; writes happen at startup or on explicit
/// refresh.
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ToolRegistry {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                adapters: Vec::new(),
                tools: HashMap::new(),
                tool_to_adapter: HashMap::new(),
                vectors: HashMap::new(),
            }),
            embedder,
        }
    }

    /// Register an adapter's tools, merging `tags` into each.
    ///
    /// Duplicate names across adapters are rejected eagerly.
    pub async fn register_adapter(
        &self,
        adapter: Arc<dyn ToolAdapter>,
        tags: Option<&BTreeSet<String>>,
    ) -> Result<Vec<Tool>> {
        let adapter_tools = adapter.list_tools();

        let registered = {
            let mut inner = self.inner.write();
            for tool in &adapter_tools {
                if inner.tools.contains_key(&tool.name) {
                    return Err(Error::already_exists("tool", &tool.name));
                }
            }

            let adapter_index = inner.adapters.len();
            inner.adapters.push(adapter);

            let mut registered = Vec::with_capacity(adapter_tools.len());
            for mut tool in adapter_tools {
                if let Some(tags) = tags {
                    tool.tags.extend(tags.iter().cloned());
                }
                inner.tool_to_adapter.insert(tool.name.clone(), adapter_index);
                inner.tools.insert(tool.name.clone(), tool.clone());
                registered.push(tool);
            }
            registered
        };

        if let Some(embedder) = &self.embedder {
            if !registered.is_empty() {
                let texts: Vec<String> = registered
                    .iter()
                    .map(|t| format!("{}: {}", t.name, t.description))
                    .collect();
                match embedder.embed(&texts).await {
                    Ok(vectors) => {
                        let mut inner = self.inner.write();
                        for (tool, vector) in registered.iter().zip(vectors) {
                            inner.vectors.insert(tool.name.clone(), vector);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to embed tools, semantic search degraded");
                    }
                }
            }
        }

        Ok(registered)
    }

    pub fn list_tools(&self, scope: Option<&BTreeSet<String>>) -> Vec<Tool> {
        let inner = self.inner.read();
        let mut tools: Vec<Tool> = inner
            .tools
            .values()
            .filter(|t| match scope {
                Some(scope) => t.tags.iter().any(|tag| scope.contains(tag)),
                None => true,
            })
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn get_tool(&self, name: &str) -> Result<Tool> {
        self.inner
            .read()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("tool", name))
    }

    /// Callables of one tool, for agent-facing recipe listings.
    pub fn recipes(&self, name: &str) -> Result<Vec<cm_domain::tool::ToolCallable>> {
        Ok(self.get_tool(name)?.callables)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        callable: Option<&str>,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let adapter = {
            let inner = self.inner.read();
            let index = *inner
                .tool_to_adapter
                .get(name)
                .ok_or_else(|| Error::not_found("tool", name))?;
            inner.adapters[index].clone()
        };
        adapter.call_tool(name, callable, args).await
    }

    /// Cosine search when an embedder is configured, substring scoring
    /// otherwise.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        let has_vectors = { !self.inner.read().vectors.is_empty() };
        if let (Some(embedder), true) = (&self.embedder, has_vectors) {
            let query_vec = embedder.embed_query(query).await?;
            let inner = self.inner.read();
            let mut scored: Vec<(f64, &Tool)> = inner
                .vectors
                .iter()
                .filter_map(|(name, vec)| {
                    inner
                        .tools
                        .get(name)
                        .map(|tool| (cosine_similarity(&query_vec, vec), tool))
                })
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            return Ok(scored.into_iter().take(limit).map(|(_, t)| t.clone()).collect());
        }

        let tools = self.list_tools(None);
        let indices = substring_search(
            query,
            &tools,
            |t| t.name.as_str(),
            |t| t.description.as_str(),
            limit,
        );
        Ok(indices.into_iter().map(|i| tools[i].clone()).collect())
    }

    /// A view of this registry filtered through a tag mask.
    pub fn scoped_view(self: &Arc<Self>, scope: BTreeSet<String>) -> ScopedToolRegistry {
        ScopedToolRegistry {
            registry: Arc::clone(self),
            scope,
        }
    }

    /// Close all adapters in reverse registration order (LIFO). Nested
    /// cancellation scopes in client libraries must unwind innermost
    /// first.
    pub async fn close(&self) {
        let adapters: Vec<Arc<dyn ToolAdapter>> = {
            let mut inner = self.inner.write();
            inner.tools.clear();
            inner.tool_to_adapter.clear();
            inner.vectors.clear();
            inner.adapters.drain(..).collect()
        };
        for adapter in adapters.iter().rev() {
            adapter.close().await;
        }
    }

    pub fn tool_count(&self) -> usize {
        self.inner.read().tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoped view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registry view that only exposes tools whose tags intersect the
/// scope. Used to restrict tool access per agent role.
pub struct ScopedToolRegistry {
    registry: Arc<ToolRegistry>,
    scope: BTreeSet<String>,
}

impl ScopedToolRegistry {
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.registry.list_tools(Some(&self.scope))
    }

    pub fn get_tool(&self, name: &str) -> Result<Tool> {
        let tool = self.registry.get_tool(name)?;
        if !tool.tags.iter().any(|tag| self.scope.contains(tag)) {
            return Err(Error::not_found("tool", name));
        }
        Ok(tool)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        callable: Option<&str>,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.get_tool(name)?;
        self.registry.call_tool(name, callable, args).await
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        let matches = self.registry.search(query, limit * 2).await?;
        Ok(matches
            .into_iter()
            .filter(|t| t.tags.iter().any(|tag| self.scope.contains(tag)))
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticAdapter {
        tools: Vec<Tool>,
        closed: Arc<Mutex<Vec<String>>>,
        label: String,
    }

    impl StaticAdapter {
        fn new(names: &[&str], closed: Arc<Mutex<Vec<String>>>, label: &str) -> Arc<Self> {
            Arc::new(Self {
                tools: names
                    .iter()
                    .map(|n| Tool {
                        name: n.to_string(),
                        description: format!("{n} tool"),
                        callables: vec![],
                        tags: BTreeSet::new(),
                        timeout_sec: None,
                    })
                    .collect(),
                closed,
                label: label.to_string(),
            })
        }
    }

    #[async_trait]
    impl ToolAdapter for StaticAdapter {
        fn list_tools(&self) -> Vec<Tool> {
            self.tools.clone()
        }

        async fn call_tool(
            &self,
            name: &str,
            callable: Option<&str>,
            _args: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({
                "handled_by": self.label,
                "tool": name,
                "callable": callable,
            }))
        }

        async fn close(&self) {
            self.closed.lock().unwrap().push(self.label.clone());
        }
    }

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn registered_tools_route_to_their_adapter() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ToolRegistry::default());
        registry
            .register_adapter(StaticAdapter::new(&["nmap"], closed.clone(), "a"), None)
            .await
            .unwrap();
        registry
            .register_adapter(StaticAdapter::new(&["curl"], closed.clone(), "b"), None)
            .await
            .unwrap();

        let result = registry
            .call_tool("curl", Some("get"), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["handled_by"], "b");
        assert_eq!(registry.get_tool("nmap").unwrap().name, "nmap");
    }

    #[tokio::test]
    async fn duplicate_registration_fails_eagerly() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::default();
        registry
            .register_adapter(StaticAdapter::new(&["nmap"], closed.clone(), "a"), None)
            .await
            .unwrap();
        let err = registry
            .register_adapter(StaticAdapter::new(&["nmap"], closed, "b"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn close_order_is_reverse_registration() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::default();
        for label in ["a", "b", "c"] {
            registry
                .register_adapter(
                    StaticAdapter::new(&[&format!("tool_{label}")], closed.clone(), label),
                    None,
                )
                .await
                .unwrap();
        }
        registry.close().await;
        assert_eq!(*closed.lock().unwrap(), ["c", "b", "a"]);
        assert_eq!(registry.tool_count(), 0);
    }

    #[tokio::test]
    async fn tags_merge_and_scope_filters() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ToolRegistry::default());
        registry
            .register_adapter(
                StaticAdapter::new(&["nmap"], closed.clone(), "a"),
                Some(&tags(&["network", "recon"])),
            )
            .await
            .unwrap();
        registry
            .register_adapter(
                StaticAdapter::new(&["jq"], closed, "b"),
                Some(&tags(&["data"])),
            )
            .await
            .unwrap();

        let recon = registry.scoped_view(tags(&["recon"]));
        let names: Vec<String> = recon.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["nmap"]);
        assert!(recon.get_tool("jq").is_err());
        assert!(recon
            .call_tool("jq", None, &serde_json::json!({}))
            .await
            .is_err());
        assert!(recon
            .call_tool("nmap", None, &serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn substring_search_scores_name_over_description() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::default();
        registry
            .register_adapter(
                Arc::new(StaticAdapter {
                    tools: vec![
                        Tool {
                            name: "curl".into(),
                            description: "transfer a URL".into(),
                            callables: vec![],
                            tags: BTreeSet::new(),
                            timeout_sec: None,
                        },
                        Tool {
                            name: "wget".into(),
                            description: "curl-like downloader".into(),
                            callables: vec![],
                            tags: BTreeSet::new(),
                            timeout_sec: None,
                        },
                    ],
                    closed,
                    label: "a".into(),
                }),
                None,
            )
            .await
            .unwrap();

        let hits = registry.search("curl", 10).await.unwrap();
        assert_eq!(hits[0].name, "curl");
        assert_eq!(hits[1].name, "wget");
        assert!(registry.search("zzz", 10).await.unwrap().is_empty());
    }
}
