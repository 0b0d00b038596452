use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ControlPlaneConfig;
use crate::error::{ProxyError, Result};

/// Status value the control plane uses for "enabled".
const STATUS_ENABLED: i64 = 1;

/// How the router authenticates against the control plane.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Fixed service token, sent as-is; nothing to renew.
    Static(String),
    /// Username/password exchanged for a session token via the login endpoint.
    Login { username: String, password: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Static(_) => f.write_str("Static(<redacted>)"),
            Credential::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// One token-to-model binding as served by the control plane.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneRoute {
    pub token: String,
    #[serde(default)]
    pub token_status: i64,
    #[serde(rename = "ai_model_api_url", default)]
    pub upstream_url: String,
    #[serde(rename = "ai_model_api_key", default)]
    pub upstream_key: String,
    #[serde(rename = "ai_model_status", default)]
    pub model_status: i64,
    #[serde(default)]
    pub token_id: Option<u64>,
    #[serde(rename = "ai_model_id", default)]
    pub model_id: Option<u64>,
    #[serde(rename = "ai_model_name", default)]
    pub model_name: Option<String>,
}

impl ControlPlaneRoute {
    pub fn is_enabled(&self) -> bool {
        self.token_status == STATUS_ENABLED && self.model_status == STATUS_ENABLED
    }
}

/// Response envelope shared by every control-plane endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: String,
}

/// Source of the full route set. The HTTP control plane in production.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Obtain a new session token. `Ok(None)` when the credential is static.
    async fn login(&self) -> Result<Option<String>>;

    /// Fetch every route. `session` is the token from the last `login`.
    async fn fetch_routes(&self, session: Option<&str>) -> Result<Vec<ControlPlaneRoute>>;
}

/// HTTP client for the administrative control plane.
pub struct ControlPlaneClient {
    client: Client,
    routes_url: String,
    login_url: String,
    credential: Credential,
}

impl ControlPlaneClient {
    pub fn new(config: &ControlPlaneConfig, credential: Credential) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("token-router/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create control plane client: {}", e)))?;

        let base = config.base_url.trim_end_matches('/');

        Ok(Self {
            client,
            routes_url: format!("{}{}", base, config.routes_path),
            login_url: format!("{}{}", base, config.login_path),
            credential,
        })
    }

    fn bearer_for<'a>(&'a self, session: Option<&'a str>) -> Result<&'a str> {
        match &self.credential {
            Credential::Static(token) => Ok(token),
            Credential::Login { .. } => session
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProxyError::ControlPlaneAuth("no session token, login required".to_string())),
        }
    }
}

#[async_trait]
impl RouteSource for ControlPlaneClient {
    async fn login(&self) -> Result<Option<String>> {
        let (username, password) = match &self.credential {
            Credential::Static(_) => return Ok(None),
            Credential::Login { username, password } => (username, password),
        };

        let response = self
            .client
            .post(&self.login_url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProxyError::ControlPlane {
                status: status.as_u16(),
                code: 0,
                message: format!("login returned {}", status),
            });
        }

        let envelope: Envelope<LoginData> = response.json().await?;
        if envelope.code != 0 {
            return Err(ProxyError::ControlPlaneAuth(envelope.message));
        }

        let token = envelope.data.map(|d| d.token).unwrap_or_default();
        if token.is_empty() {
            return Err(ProxyError::ControlPlaneAuth("login response carried no token".to_string()));
        }

        info!(username = %username, "Logged in to control plane");
        Ok(Some(token))
    }

    async fn fetch_routes(&self, session: Option<&str>) -> Result<Vec<ControlPlaneRoute>> {
        let bearer = self.bearer_for(session)?;

        let response = self
            .client
            .get(&self.routes_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProxyError::ControlPlaneAuth("route fetch returned 401".to_string()));
        }
        if status != StatusCode::OK {
            return Err(ProxyError::ControlPlane {
                status: status.as_u16(),
                code: 0,
                message: format!("route fetch returned {}", status),
            });
        }

        let envelope: Envelope<Vec<ControlPlaneRoute>> = response.json().await?;
        match envelope.code {
            0 => {}
            401 => return Err(ProxyError::ControlPlaneAuth(envelope.message)),
            code => {
                return Err(ProxyError::ControlPlane {
                    status: status.as_u16(),
                    code,
                    message: envelope.message,
                })
            }
        }

        let routes = envelope.data.unwrap_or_default();
        debug!(count = routes.len(), "Fetched routes from control plane");
        Ok(routes)
    }
}
