//! Container backend.
//!
//! Runs a long-lived container whose session service speaks the HTTP
//! contract in [`super::client`]. Storage reaches the container through
//! its serializable access descriptor: file-backed stores become bind
//! mounts, KV-backed stores become environment variables, and `localhost`
//! KV URLs are rewritten to the host-gateway alias.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use tokio::sync::Mutex as AsyncMutex;

use cm_domain::config::ContainerConfig;
use cm_domain::deps::{InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};
use cm_domain::{Capability, ExecutionResult};
use cm_storage::StorageAccess;

use crate::container::client::SessionClient;
use crate::executor::Executor;

const CAPABILITIES: &[Capability] = &[
    Capability::Timeout,
    Capability::ProcessIsolation,
    Capability::Reset,
    Capability::DepsInstall,
    Capability::DepsUninstall,
];

const SERVICE_PORT: &str = "8080/tcp";
const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

/// Rewrite `localhost` / `127.0.0.1` to the host-gateway alias so the
/// container can reach services on the host.
pub fn rewrite_localhost_for_container(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    match parsed.host_str() {
        Some("localhost") | Some("127.0.0.1") => {
            if parsed.set_host(Some(HOST_GATEWAY_ALIAS)).is_err() {
                return url.to_string();
            }
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

struct Started {
    docker: Docker,
    container_id: String,
    client: SessionClient,
}

pub struct ContainerExecutor {
    config: ContainerConfig,
    state: AsyncMutex<Option<Started>>,
    closed: AtomicBool,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            state: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Translate the access descriptor into container wiring.
    fn storage_wiring(
        &self,
        access: Option<&StorageAccess>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut env = Vec::new();
        let mut binds = Vec::new();

        match access {
            Some(StorageAccess::File {
                tools_path,
                skills_path,
                artifacts_path,
                deps_path,
            }) => {
                if let Some(tools) = tools_path {
                    binds.push(format!("{}:/workspace/tools:ro", tools.display()));
                    env.push("TOOLS_PATH=/workspace/tools".to_string());
                }
                // Writable stores must exist on the host before the mount.
                std::fs::create_dir_all(skills_path)?;
                std::fs::create_dir_all(artifacts_path)?;
                std::fs::create_dir_all(deps_path)?;
                binds.push(format!("{}:/workspace/skills", skills_path.display()));
                binds.push(format!("{}:/workspace/artifacts", artifacts_path.display()));
                binds.push(format!("{}:/workspace/deps", deps_path.display()));
                env.push("SKILLS_PATH=/workspace/skills".to_string());
                env.push("ARTIFACTS_PATH=/workspace/artifacts".to_string());
                env.push("DEPS_PATH=/workspace/deps".to_string());
            }
            Some(StorageAccess::Kv {
                url,
                tools_prefix,
                skills_prefix,
                artifacts_prefix,
                deps_prefix,
            }) => {
                env.push(format!("REDIS_URL={}", rewrite_localhost_for_container(url)));
                env.push(format!("REDIS_TOOLS_PREFIX={tools_prefix}"));
                env.push(format!("REDIS_SKILLS_PREFIX={skills_prefix}"));
                env.push(format!("REDIS_ARTIFACTS_PREFIX={artifacts_prefix}"));
                env.push(format!("REDIS_DEPS_PREFIX={deps_prefix}"));
            }
            None => {}
        }

        if self.config.auth_disabled {
            env.push("CONTAINER_AUTH_DISABLED=1".to_string());
        } else if let Some(token) = &self.config.auth_token {
            env.push(format!("CONTAINER_AUTH_TOKEN={token}"));
        } else {
            return Err(Error::Misconfigured(
                "container auth token not set and auth not disabled".into(),
            ));
        }
        for (key, value) in &self.config.env {
            env.push(format!("{key}={value}"));
        }

        Ok((env, binds))
    }

    async fn resolve_host_port(&self, docker: &Docker, container_id: &str) -> Result<u16> {
        let inspect = docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Error::Http(format!("container inspect failed: {e}")))?;
        let port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(SERVICE_PORT).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|p| p.parse().ok());
        match port {
            Some(port) => Ok(port),
            None if self.config.port > 0 => Ok(self.config.port),
            None => Err(Error::Http("could not determine container port".into())),
        }
    }

    async fn wait_for_healthy(&self, client: &SessionClient) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.startup_timeout_sec);
        let mut last_error = None;
        while Instant::now() < deadline {
            match client.health().await {
                Ok(health) if health.status == "healthy" => return Ok(()),
                Ok(health) => {
                    tracing::debug!(status = %health.status, "container not healthy yet");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "health check failed, container starting");
                    last_error = Some(e);
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(
                self.config.health_check_interval_sec,
            ))
            .await;
        }
        let detail = match last_error {
            Some(e) => format!("; last health check error: {e}"),
            None => String::new(),
        };
        Err(Error::InterpreterDied(format!(
            "container did not become healthy within {}s{detail}",
            self.config.startup_timeout_sec
        )))
    }

    async fn teardown(docker: &Docker, container_id: &str) {
        if let Err(e) = docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            tracing::debug!(error = %e, container_id, "container stop failed (may be stopped already)");
        }
        if let Err(e) = docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::error!(error = %e, container_id, "failed to remove container");
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn supported_capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn start(&self, storage_access: Option<StorageAccess>) -> Result<()> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Http(format!("cannot connect to Docker: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| Error::Http(format!("Docker daemon unreachable: {e}")))?;

        let (env, binds) = self.storage_wiring(storage_access.as_ref())?;

        let host_port = if self.config.port > 0 {
            self.config.port.to_string()
        } else {
            // Empty lets the daemon pick a free port.
            String::new()
        };
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            SERVICE_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some(self.config.host.clone()),
                host_port: Some(host_port),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(SERVICE_PORT.to_string(), HashMap::new());

        let container_config = Config {
            image: Some(self.config.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                port_bindings: Some(port_bindings),
                extra_hosts: Some(vec![format!("{HOST_GATEWAY_ALIAS}:host-gateway")]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = docker
            .create_container::<String, String>(None, container_config)
            .await
            .map_err(|e| Error::Http(format!("container create failed: {e}")))?;
        let container_id = created.id;

        let startup = async {
            docker
                .start_container(&container_id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| Error::Http(format!("container start failed: {e}")))?;

            let port = self.resolve_host_port(&docker, &container_id).await?;
            let client = SessionClient::new(
                format!("http://{}:{port}", self.config.host),
                self.config.auth_token.clone(),
            )?;
            self.wait_for_healthy(&client).await?;
            Ok::<SessionClient, Error>(client)
        };

        match startup.await {
            Ok(client) => {
                tracing::info!(container_id = %container_id, image = %self.config.image, "container executor started");
                *self.state.lock().await = Some(Started {
                    docker,
                    container_id,
                    client,
                });
                self.closed.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                // Never leave a half-created container behind.
                Self::teardown(&docker, &container_id).await;
                Err(e)
            }
        }
    }

    async fn run(&self, code: &str, timeout: Option<f64>) -> Result<ExecutionResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(ExecutionResult::err("executor is closed"));
        }
        let guard = self.state.lock().await;
        let started = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("container not started".into()))?;

        let timeout = timeout.or(Some(self.config.default_timeout_sec));
        let response = started.client.execute(code, timeout).await?;
        Ok(ExecutionResult {
            value: (!response.value.is_null()).then_some(response.value),
            stdout: response.stdout,
            error: response.error,
            elapsed_ms: response.execution_time_ms,
        })
    }

    async fn reset(&self) -> Result<()> {
        let guard = self.state.lock().await;
        let started = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("container not started".into()))?;
        started.client.reset().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.state.lock().await;
        if let Some(started) = guard.take() {
            started.client.close().await;
            Self::teardown(&started.docker, &started.container_id).await;
        }
        Ok(())
    }

    async fn install_deps(&self, packages: &[String]) -> Result<InstallReport> {
        let guard = self.state.lock().await;
        let started = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("container not started".into()))?;
        started.client.install_deps(packages).await
    }

    async fn uninstall_deps(&self, packages: &[String]) -> Result<RemoveReport> {
        let guard = self.state.lock().await;
        let started = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("container not started".into()))?;
        started.client.uninstall_deps(packages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_urls_rewrite_to_host_gateway() {
        assert_eq!(
            rewrite_localhost_for_container("redis://localhost:6379"),
            "redis://host.docker.internal:6379"
        );
        assert_eq!(
            rewrite_localhost_for_container("redis://127.0.0.1:6379/0"),
            "redis://host.docker.internal:6379/0"
        );
        assert_eq!(
            rewrite_localhost_for_container("redis://redis.internal:6379"),
            "redis://redis.internal:6379"
        );
    }

    #[test]
    fn file_access_becomes_bind_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(ContainerConfig {
            auth_token: Some("t".into()),
            ..Default::default()
        });
        let access = StorageAccess::File {
            tools_path: None,
            skills_path: dir.path().join("skills"),
            artifacts_path: dir.path().join("artifacts"),
            deps_path: dir.path().join("deps"),
        };
        let (env, binds) = executor.storage_wiring(Some(&access)).unwrap();
        assert!(binds.iter().any(|b| b.ends_with(":/workspace/skills")));
        assert!(env.contains(&"ARTIFACTS_PATH=/workspace/artifacts".to_string()));
        assert!(env.contains(&"CONTAINER_AUTH_TOKEN=t".to_string()));
        // Host-side directories were created for the mounts.
        assert!(dir.path().join("skills").is_dir());
    }

    #[test]
    fn kv_access_becomes_env_vars() {
        let executor = ContainerExecutor::new(ContainerConfig {
            auth_disabled: true,
            ..Default::default()
        });
        let access = StorageAccess::Kv {
            url: "redis://localhost:6379".into(),
            tools_prefix: "app:tools".into(),
            skills_prefix: "app:skills".into(),
            artifacts_prefix: "app:artifacts".into(),
            deps_prefix: "app:deps".into(),
        };
        let (env, binds) = executor.storage_wiring(Some(&access)).unwrap();
        assert!(binds.is_empty());
        assert!(env.contains(&"REDIS_URL=redis://host.docker.internal:6379".to_string()));
        assert!(env.contains(&"REDIS_SKILLS_PREFIX=app:skills".to_string()));
        assert!(env.contains(&"CONTAINER_AUTH_DISABLED=1".to_string()));
    }

    #[test]
    fn missing_auth_config_fails_closed() {
        let executor = ContainerExecutor::new(ContainerConfig::default());
        let err = executor.storage_wiring(None).unwrap_err();
        assert!(matches!(err, Error::Misconfigured(_)));
    }
}
