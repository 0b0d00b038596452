use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::upgrade::OnUpgrade;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::recorder::{BodyCapture, Outcome, PendingRecord, RequestTelemetry};
use super::upgrade::{is_upgrade_request, switch_protocols};
use super::upstream::{strip_hop_by_hop, ForwardContext, UpstreamProxyPool};
use crate::config::{ProxyConfig, ServerConfig};
use crate::error::{ProxyError, Result};
use crate::health;
use crate::observability::TelemetrySink;
use crate::routing::RoutingCache;

/// The request handler: resolves the caller's token to a route, forwards
/// through the pooled engine with the upstream credential, and records
/// telemetry for every request whatever the outcome.
pub struct ReverseProxy {
    cache: Arc<RoutingCache>,
    pool: Arc<UpstreamProxyPool>,
    telemetry: Arc<dyn TelemetrySink>,
    config: ProxyConfig,
}

#[derive(Clone)]
struct AppState {
    proxy: Arc<ReverseProxy>,
}

impl ReverseProxy {
    pub fn new(
        cache: Arc<RoutingCache>,
        pool: Arc<UpstreamProxyPool>,
        telemetry: Arc<dyn TelemetrySink>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            cache,
            pool,
            telemetry,
            config: config.clone(),
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let state = AppState {
            proxy: Arc::clone(self),
        };

        Router::new()
            .merge(health::routes(self.cache.clone()))
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn start(self: Arc<Self>, server: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
        let addr = server.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Token router listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| ProxyError::Internal(format!("Server error: {}", e)))?;

        info!("Token router stopped accepting connections");
        Ok(())
    }

    /// Process a single inbound request.
    #[instrument(skip_all, fields(request_id))]
    pub async fn handle(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let (mut parts, body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<OnUpgrade>();

        // Snapshot before the credential is substituted. Dropping the guard
        // (the caller went away) still emits a record.
        let telemetry = RequestTelemetry::from_request(&request_id, &parts, client_addr);
        let mut pending = PendingRecord::new(telemetry, Arc::clone(&self.telemetry), started);

        let result = if !self.cache.is_ready() {
            Err(ProxyError::NotReady)
        } else {
            match self.read_body(body).await {
                Ok(body_bytes) => {
                    let body_limit = self.config.log_request_body.then_some(self.config.max_captured_body);
                    pending.telemetry_mut().record_request_body(&body_bytes, body_limit);
                    self.dispatch(&mut parts, body_bytes, client_addr, &request_id, on_upgrade, &mut pending)
                        .await
                }
                Err(e) => Err(e),
            }
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                self.log_rejection(&e, &request_id, &parts, pending.telemetry().upstream.as_deref());
                pending.telemetry_mut().outcome = Outcome::from_error(&e);
                e.into_response()
            }
        };
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Response headers ready"
        );

        let capture = BodyCapture {
            enabled: self.config.capture_error_response_body,
            limit: self.config.max_captured_body,
        };
        pending.into_recorder(capture).wrap(response)
    }

    async fn read_body(&self, body: Body) -> Result<Bytes> {
        let limit = self.config.max_request_body;
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(ProxyError::PayloadTooLarge { limit }),
            Err(e) => Err(ProxyError::BadRequest(format!("Failed to read request body: {}", e))),
        }
    }

    async fn dispatch(
        &self,
        parts: &mut Parts,
        body: Bytes,
        client_addr: Option<SocketAddr>,
        request_id: &str,
        on_upgrade: Option<OnUpgrade>,
        pending: &mut PendingRecord,
    ) -> Result<Response> {
        let authorization = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let route = self.cache.lookup(authorization).ok_or(ProxyError::Unauthorized)?;
        pending.telemetry_mut().upstream = Some(route.upstream_base_url.clone());
        pending.telemetry_mut().model_name = route.model_name.clone();

        let upstream = self.pool.get(&route.upstream_base_url)?;

        let mut substituted =
            HeaderValue::from_str(&route.outbound_authorization()).map_err(|_| ProxyError::InvalidUpstream {
                url: route.upstream_base_url.clone(),
                reason: "upstream credential is not a valid header value".to_string(),
            })?;
        substituted.set_sensitive(true);

        let ctx = ForwardContext {
            request_id,
            client_addr,
            upgrade: on_upgrade.is_some() && is_upgrade_request(&parts.headers),
        };

        let original: Vec<HeaderValue> = parts.headers.get_all(header::AUTHORIZATION).iter().cloned().collect();
        parts.headers.insert(header::AUTHORIZATION, substituted);
        let outbound = upstream.build_request(parts, body, ctx);
        parts.headers.remove(header::AUTHORIZATION);
        for value in original {
            parts.headers.append(header::AUTHORIZATION, value);
        }

        let response = upstream.send(outbound?).await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let on_upgrade = on_upgrade
                .filter(|_| ctx.upgrade)
                .ok_or_else(|| ProxyError::Upstream("upstream switched protocols without an upgrade request".to_string()))?;
            pending.telemetry_mut().upgraded = true;
            info!(request_id, upstream = %route.upstream_base_url, "Switching protocols");
            return Ok(switch_protocols(on_upgrade, response, request_id.to_string()));
        }

        Ok(relay(response))
    }

    fn log_rejection(&self, error: &ProxyError, request_id: &str, parts: &Parts, upstream: Option<&str>) {
        match error {
            ProxyError::NotReady => warn!(
                request_id,
                method = %parts.method,
                path = parts.uri.path(),
                "Routing cache not ready, rejecting request"
            ),
            ProxyError::Unauthorized => warn!(
                request_id,
                method = %parts.method,
                path = parts.uri.path(),
                "Token not in routing table, rejecting request"
            ),
            ProxyError::InvalidUpstream { url, reason } => error!(
                request_id,
                method = %parts.method,
                path = parts.uri.path(),
                upstream_url = %url,
                reason = %reason,
                "Cannot create upstream proxy"
            ),
            ProxyError::PayloadTooLarge { .. } | ProxyError::BadRequest(_) => warn!(
                request_id,
                method = %parts.method,
                path = parts.uri.path(),
                error = %error,
                "Rejecting unreadable request body"
            ),
            other => error!(
                request_id,
                method = %parts.method,
                path = parts.uri.path(),
                upstream_url = upstream,
                error = %other,
                "Proxy request failed"
            ),
        }
    }
}

/// Stream an upstream response back to the caller unchanged apart from
/// hop-by-hop headers.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn handle_request(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    state.proxy.handle(req, connect_info.map(|ConnectInfo(addr)| addr)).await
}
