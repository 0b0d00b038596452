use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::routing::Credential;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    #[serde(default = "default_routes_path")]
    pub routes_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default)]
    pub credential: CredentialConfig,
    #[serde(with = "duration_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_sync_interval")]
    pub sync_interval: Duration,
}

/// Either a static service token or login credentials, never both.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CredentialConfig {
    pub static_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CredentialConfig {
    pub fn to_credential(&self) -> Result<Credential> {
        let static_token = self.static_token.as_deref().filter(|t| !t.is_empty());
        let username = self.username.as_deref().filter(|u| !u.is_empty());

        match (static_token, username) {
            (Some(token), None) => Ok(Credential::Static(token.to_string())),
            (None, Some(username)) => Ok(Credential::Login {
                username: username.to_string(),
                password: self.password.clone().unwrap_or_default(),
            }),
            (Some(_), Some(_)) => {
                anyhow::bail!("control_plane.credential must set either static_token or username, not both")
            }
            (None, None) => {
                anyhow::bail!("control_plane.credential requires static_token or username/password")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(with = "duration_serde")]
    pub upstream_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub max_request_body: usize,
    pub log_request_body: bool,
    pub capture_error_response_body: bool,
    pub max_captured_body: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            max_request_body: 10 * 1024 * 1024,
            log_request_body: false,
            capture_error_response_body: true,
            max_captured_body: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

fn default_routes_path() -> String {
    "/api/tokens/with-model".to_string()
}

fn default_login_path() -> String {
    "/api/auth/login".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(300)
}

impl Config {
    /// Load configuration from file, then apply `TOKEN_ROUTER_*` overrides
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TOKEN_ROUTER_CONTROL_PLANE_URL") {
            self.control_plane.base_url = url;
        }
        if let Some(token) = lookup("TOKEN_ROUTER_STATIC_TOKEN") {
            self.control_plane.credential = CredentialConfig {
                static_token: Some(token),
                username: None,
                password: None,
            };
        }
        if let Some(username) = lookup("TOKEN_ROUTER_USERNAME") {
            self.control_plane.credential.static_token = None;
            self.control_plane.credential.username = Some(username);
        }
        if let Some(password) = lookup("TOKEN_ROUTER_PASSWORD") {
            self.control_plane.credential.password = Some(password);
        }
        if let Some(listen) = lookup("TOKEN_ROUTER_LISTEN") {
            let (host, port) = listen
                .rsplit_once(':')
                .with_context(|| format!("TOKEN_ROUTER_LISTEN must be host:port, got '{}'", listen))?;
            self.server.host = host.to_string();
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid port in TOKEN_ROUTER_LISTEN: '{}'", port))?;
        }
        if let Some(level) = lookup("TOKEN_ROUTER_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.control_plane.base_url.is_empty() {
            anyhow::bail!("control_plane.base_url cannot be empty");
        }
        reqwest::Url::parse(&self.control_plane.base_url)
            .with_context(|| format!("Invalid control_plane.base_url: {}", self.control_plane.base_url))?;

        self.control_plane.credential.to_credential()?;

        if self.control_plane.sync_interval.is_zero() {
            anyhow::bail!("control_plane.sync_interval cannot be zero");
        }

        if self.metrics.enabled && self.metrics.port == self.server.port {
            anyhow::bail!("metrics.port must differ from server.port");
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        serializer.serialize_str(&format!("{}s", secs))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}
