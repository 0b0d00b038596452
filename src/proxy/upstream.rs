use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use reqwest::{redirect, Client, Url};
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::observability::MetricsCollector;

/// Headers that describe a single connection and are never relayed.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Per-request details the forwarding engine adds to the outbound request.
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext<'a> {
    pub request_id: &'a str,
    pub client_addr: Option<SocketAddr>,
    /// Keep `Connection: upgrade` and `Upgrade` so the upstream can switch protocols.
    pub upgrade: bool,
}

/// Forwarding engine for one upstream base URL.
pub struct UpstreamProxy {
    base: Url,
    client: Client,
    timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(base_url: &str, config: &ProxyConfig) -> Result<Self> {
        let invalid = |reason: String| ProxyError::InvalidUpstream {
            url: base_url.to_string(),
            reason,
        };

        let base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
        }
        if base.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base,
            client,
            timeout: config.upstream_timeout,
        })
    }

    /// Target for an inbound path and query: the paths are joined with
    /// exactly one slash and both queries are kept, base query first.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();

        let joined = join_paths(self.base.path(), path);
        url.set_path(&joined);

        let merged = match (self.base.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(inbound)) => Some(format!("{}&{}", base, inbound)),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(inbound)) => Some(inbound.to_string()),
            (None, None) => None,
        };
        url.set_query(merged.as_deref());
        url
    }

    /// Build the outbound request from the inbound parts as they are now,
    /// so the caller controls which `Authorization` value goes out.
    pub fn build_request(&self, parts: &Parts, body: Bytes, ctx: ForwardContext<'_>) -> Result<reqwest::Request> {
        let url = self.target_url(parts.uri.path(), parts.uri.query());
        debug!(request_id = ctx.request_id, upstream_url = %url, "Forwarding request");

        let mut headers = parts.headers.clone();
        let upgrade_to = headers.get(header::UPGRADE).cloned();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        if ctx.upgrade {
            if let Some(protocol) = upgrade_to {
                headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
                headers.insert(header::UPGRADE, protocol);
            }
        }

        if let Some(addr) = ctx.client_addr {
            let ip = addr.ip().to_string();
            let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
                _ => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert("x-forwarded-for", value);
            }
        }
        if !headers.contains_key("x-forwarded-proto") {
            let proto = parts.uri.scheme_str().unwrap_or("http");
            if let Ok(value) = HeaderValue::from_str(proto) {
                headers.insert("x-forwarded-proto", value);
            }
        }
        if !headers.contains_key("x-forwarded-host") {
            if let Some(host) = parts.headers.get(header::HOST) {
                headers.insert("x-forwarded-host", host.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(ctx.request_id) {
            headers.insert("x-request-id", value);
        }

        let mut request = reqwest::Request::new(parts.method.clone(), url);
        *request.headers_mut() = headers;
        if !body.is_empty() {
            *request.body_mut() = Some(body.into());
        }
        Ok(request)
    }

    /// Send one request. Waiting for response headers is bounded by the
    /// upstream timeout; the body then streams without a deadline.
    pub async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let target = request.url().clone();
        match tokio::time::timeout(self.timeout, self.client.execute(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                error!(upstream_url = %target, error = %e, "Upstream request failed");
                Err(ProxyError::Upstream(format!("Request failed: {}", e)))
            }
            Err(_) => {
                error!(upstream_url = %target, timeout_secs = self.timeout.as_secs(), "Upstream request timed out");
                Err(ProxyError::Upstream("Request timed out".to_string()))
            }
        }
    }
}

/// Join a base path and a request path with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Lazily constructed forwarding engines keyed by upstream base URL.
///
/// Engines live for the whole process; no eviction.
pub struct UpstreamProxyPool {
    proxies: RwLock<HashMap<String, Arc<UpstreamProxy>>>,
    config: ProxyConfig,
    constructed: AtomicUsize,
    metrics: Arc<MetricsCollector>,
}

impl UpstreamProxyPool {
    pub fn new(config: &ProxyConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            config: config.clone(),
            constructed: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Engine for `base_url`, constructing it on first use. Concurrent
    /// first calls for one URL all receive the same engine.
    pub fn get(&self, base_url: &str) -> Result<Arc<UpstreamProxy>> {
        {
            let proxies = self.proxies.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(proxy) = proxies.get(base_url) {
                return Ok(Arc::clone(proxy));
            }
        }

        let mut proxies = self.proxies.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(proxy) = proxies.get(base_url) {
            return Ok(Arc::clone(proxy));
        }

        let proxy = Arc::new(UpstreamProxy::new(base_url, &self.config)?);
        self.constructed.fetch_add(1, Ordering::Relaxed);
        proxies.insert(base_url.to_string(), Arc::clone(&proxy));
        let size = proxies.len();
        drop(proxies);

        self.metrics.set_pool_size(size);
        info!(upstream = %base_url, pool_size = size, "Created upstream proxy");
        Ok(proxy)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.proxies.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Engines ever constructed, which equals `len` since none are evicted.
    #[cfg(test)]
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }
}
