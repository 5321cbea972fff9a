//! Injected server state.
//!
//! No process-global state: the router closes over one `Arc<ServerState>`
//! built at startup, so tests construct isolated instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use cm_domain::config::ServerConfig;
use cm_domain::error::Result;
use cm_exec::{InProcessExecutor, ResourceOptions, Resources};
use cm_storage::StorageAccess;

/// One isolated session: its own interpreter state over the shared
/// registries and stores.
pub struct ServerSession {
    pub executor: Arc<InProcessExecutor>,
    pub created_at: Instant,
    pub last_used: Instant,
    pub execution_count: u64,
}

pub struct ServerState {
    pub config: ServerConfig,
    pub resources: Arc<Resources>,
    pub sessions: AsyncMutex<HashMap<String, ServerSession>>,
    pub started_at: Instant,
    /// SHA-256 of the expected bearer token; compared in constant time.
    pub token_hash: Option<[u8; 32]>,
}

impl ServerState {
    /// Build the shared resources per the configured storage mode and
    /// prepare auth.
    pub async fn initialize(config: ServerConfig) -> Result<Arc<Self>> {
        let access = match &config.redis_url {
            Some(url) => StorageAccess::Kv {
                url: url.clone(),
                tools_prefix: config.tools_prefix.clone(),
                skills_prefix: config.skills_prefix.clone(),
                artifacts_prefix: config.artifacts_prefix.clone(),
                deps_prefix: config.deps_prefix(),
            },
            None => StorageAccess::File {
                tools_path: config.tools_path.clone(),
                skills_path: config.skills_path.clone(),
                artifacts_path: config.artifacts_path.clone(),
                deps_path: config
                    .deps_path
                    .clone()
                    .unwrap_or_else(|| config.artifacts_path.join("../deps")),
            },
        };

        let options = ResourceOptions {
            allow_runtime_deps: config.allow_runtime_deps,
            ..Default::default()
        };
        let resources = Arc::new(Resources::from_access(&access, &options).await?);

        if config.auth_disabled {
            tracing::warn!(
                "SECURITY: authentication is DISABLED; set CONTAINER_AUTH_TOKEN for any \
                 non-local deployment"
            );
        } else if config.auth_token.is_some() {
            tracing::info!("authentication enabled with bearer token");
        } else {
            tracing::error!("authentication misconfigured: no token set and auth not disabled");
        }

        let token_hash = config
            .auth_token
            .as_deref()
            .map(|token| Sha256::digest(token.as_bytes()).into());

        Ok(Arc::new(Self {
            config,
            resources,
            sessions: AsyncMutex::new(HashMap::new()),
            started_at: Instant::now(),
            token_hash,
        }))
    }

    /// Fetch or create the session for `session_id`, refreshing its
    /// last-used stamp. A fresh id is minted when none is supplied.
    pub async fn session_executor(
        &self,
        session_id: Option<&str>,
    ) -> (String, Arc<InProcessExecutor>) {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(session_id.clone()).or_insert_with(|| {
            let executor = InProcessExecutor::new(ResourceOptions::default())
                .with_default_timeout(self.config.default_timeout_sec);
            executor.start_with_resources(self.resources.clone());
            tracing::info!(session_id = %session_id, "created session");
            ServerSession {
                executor: Arc::new(executor),
                created_at: Instant::now(),
                last_used: Instant::now(),
                execution_count: 0,
            }
        });
        session.last_used = Instant::now();
        session.execution_count += 1;
        (session_id, session.executor.clone())
    }

    /// Drop sessions idle past the expiry threshold. The drop is lossy:
    /// in-flight work for a dropped session errors out.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let expiry = std::time::Duration::from_secs(self.config.session_expiry_sec);
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_used.elapsed() < expiry);
        let dropped = before - sessions.len();
        if dropped > 0 {
            tracing::info!(dropped, "expired idle sessions");
        }
        dropped
    }

    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }
}
