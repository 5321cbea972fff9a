//! HTTP client for the in-container session service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cm_domain::deps::{InstallReport, RemoveReport};
use cm_domain::error::{Error, Result};

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteResponse {
    pub value: serde_json::Value,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: f64,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub uptime_seconds: f64,
}

#[derive(Debug, Deserialize)]
pub struct InfoResponse {
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    #[serde(default)]
    pub skills: Vec<serde_json::Value>,
    #[serde(default)]
    pub artifacts_path: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetResponse {
    pub status: String,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Serialize)]
struct DepsRequest<'a> {
    packages: &'a [String],
}

/// Client for one container's session service. Tracks the session id the
/// server assigns so consecutive calls hit the same session.
pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    session_id: parking_lot::Mutex<Option<String>>,
}

impl SessionClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            auth_token,
            session_id: parking_lot::Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder, with_session: bool) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if with_session {
            if let Some(session) = self.session_id.lock().as_deref() {
                req = req.header("X-Session-ID", session);
            }
        }
        req
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response> {
        match resp.status().as_u16() {
            200 => Ok(resp),
            401 => Err(Error::AuthInvalid),
            500 => Err(Error::Misconfigured("container service".into())),
            503 => Err(Error::Unavailable("container service not initialized".into())),
            code => Err(Error::Http(format!(
                "container service returned {code}: {}",
                resp.text().await.unwrap_or_default()
            ))),
        }
    }

    pub async fn execute(&self, code: &str, timeout: Option<f64>) -> Result<ExecuteResponse> {
        let req = self
            .apply_headers(self.http.post(self.url("/execute")), true)
            .json(&ExecuteRequest { code, timeout });
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Http(format!("execute failed: {e}")))?;
        let body: ExecuteResponse = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Http(format!("bad execute response: {e}")))?;
        *self.session_id.lock() = Some(body.session_id.clone());
        Ok(body)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        // Unauthenticated by design so orchestrators can probe it.
        let resp = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| Error::Http(format!("health check failed: {e}")))?;
        self.check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Http(format!("bad health response: {e}")))
    }

    pub async fn info(&self) -> Result<InfoResponse> {
        let resp = self
            .apply_headers(self.http.get(self.url("/info")), false)
            .send()
            .await
            .map_err(|e| Error::Http(format!("info failed: {e}")))?;
        self.check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Http(format!("bad info response: {e}")))
    }

    pub async fn reset(&self) -> Result<ResetResponse> {
        let resp = self
            .apply_headers(self.http.post(self.url("/reset")), true)
            .send()
            .await
            .map_err(|e| Error::Http(format!("reset failed: {e}")))?;
        let body: ResetResponse = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Http(format!("bad reset response: {e}")))?;
        *self.session_id.lock() = None;
        Ok(body)
    }

    pub async fn install_deps(&self, packages: &[String]) -> Result<InstallReport> {
        let resp = self
            .apply_headers(self.http.post(self.url("/install_deps")), false)
            .json(&DepsRequest { packages })
            .send()
            .await
            .map_err(|e| Error::Http(format!("install_deps failed: {e}")))?;
        self.check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Http(format!("bad install_deps response: {e}")))
    }

    pub async fn uninstall_deps(&self, packages: &[String]) -> Result<RemoveReport> {
        let resp = self
            .apply_headers(self.http.post(self.url("/uninstall_deps")), false)
            .json(&DepsRequest { packages })
            .send()
            .await
            .map_err(|e| Error::Http(format!("uninstall_deps failed: {e}")))?;
        self.check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Http(format!("bad uninstall_deps response: {e}")))
    }

    pub async fn close(&self) {
        *self.session_id.lock() = None;
    }
}
