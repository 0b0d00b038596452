//! In-process mock servers and fixtures shared by unit tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ControlPlaneConfig;
use crate::config::CredentialConfig;
use crate::observability::TelemetrySink;
use crate::proxy::recorder::RequestTelemetry;
use crate::routing::ControlPlaneRoute;

async fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

/// URL on localhost where nothing is listening.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn control_plane_config(base_url: &str) -> ControlPlaneConfig {
    ControlPlaneConfig {
        base_url: base_url.to_string(),
        routes_path: "/api/tokens/with-model".to_string(),
        login_path: "/api/auth/login".to_string(),
        credential: CredentialConfig::default(),
        request_timeout: Duration::from_secs(5),
        sync_interval: Duration::from_secs(60),
    }
}

pub fn record(token: &str, upstream: &str, key: &str, token_enabled: bool, model_enabled: bool) -> ControlPlaneRoute {
    ControlPlaneRoute {
        token: token.to_string(),
        token_status: token_enabled as i64,
        upstream_url: upstream.to_string(),
        upstream_key: key.to_string(),
        model_status: model_enabled as i64,
        token_id: None,
        model_id: None,
        model_name: None,
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ControlPlaneState {
    routes: Vec<Value>,
    session: Option<String>,
    sessions_issued: usize,
    login_calls: usize,
    fetch_calls: usize,
    failure: Option<(i64, String)>,
    malformed: bool,
}

/// Mock administrative backend serving login and the route listing.
pub struct MockControlPlane {
    addr: SocketAddr,
    state: Arc<Mutex<ControlPlaneState>>,
    _handle: JoinHandle<()>,
}

impl MockControlPlane {
    pub const STATIC_TOKEN: &'static str = "sys-static-token";

    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(ControlPlaneState::default()));
        let app = Router::new()
            .route("/api/auth/login", post(cp_login))
            .route("/api/tokens/with-model", get(cp_routes))
            .with_state(state.clone());
        let (addr, handle) = serve(app).await;
        Self {
            addr,
            state,
            _handle: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn route(token: &str, upstream: &str, key: &str, token_enabled: bool, model_enabled: bool) -> Value {
        json!({
            "token_id": 1,
            "token": token,
            "token_status": token_enabled as i64,
            "ai_model_id": 1,
            "ai_model_name": "mock-model",
            "ai_model_api_url": upstream,
            "ai_model_api_key": key,
            "ai_model_status": model_enabled as i64,
        })
    }

    pub fn set_routes(&self, routes: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state.routes = routes;
        state.failure = None;
        state.malformed = false;
    }

    /// Answer route fetches with a non-zero application code.
    pub fn fail_with_code(&self, code: i64, message: &str) {
        self.state.lock().unwrap().failure = Some((code, message.to_string()));
    }

    /// Answer route fetches with HTTP 200 and a truncated JSON body.
    pub fn serve_malformed(&self) {
        self.state.lock().unwrap().malformed = true;
    }

    /// Invalidate the current session so the next fetch gets a 401.
    pub fn expire_session(&self) {
        self.state.lock().unwrap().session = None;
    }

    pub fn current_session(&self) -> String {
        self.state.lock().unwrap().session.clone().unwrap_or_default()
    }

    pub fn login_calls(&self) -> usize {
        self.state.lock().unwrap().login_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_calls
    }
}

async fn cp_login(State(state): State<Arc<Mutex<ControlPlaneState>>>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.login_calls += 1;

    if body["username"] != "admin" || body["password"] != "secret" {
        return Json(json!({"code": 401, "message": "invalid username or password"}));
    }

    state.sessions_issued += 1;
    let session = format!("session-{}", state.sessions_issued);
    state.session = Some(session.clone());
    Json(json!({
        "code": 0,
        "message": "success",
        "data": {"token": session, "username": "admin", "user_info": {"username": "admin"}}
    }))
}

async fn cp_routes(State(state): State<Arc<Mutex<ControlPlaneState>>>, headers: HeaderMap) -> Response {
    let mut state = state.lock().unwrap();
    state.fetch_calls += 1;

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    let authorized = presented == MockControlPlane::STATIC_TOKEN
        || state.session.as_deref().is_some_and(|s| s == presented);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": 401, "message": "invalid token"})),
        )
            .into_response();
    }

    if state.malformed {
        return (StatusCode::OK, r#"{"code":0,"data":[{"token":"#).into_response();
    }

    if let Some((code, message)) = &state.failure {
        return Json(json!({"code": code, "message": message})).into_response();
    }

    Json(json!({"code": 0, "message": "success", "data": state.routes})).into_response()
}

// ---------------------------------------------------------------------------
// Upstream model backend
// ---------------------------------------------------------------------------

/// What the upstream saw for one request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Mock upstream that records requests and answers:
/// - `/fail` with 500 and a plain-text body,
/// - `/stream` with a multi-chunk streamed body,
/// - anything else with a small JSON echo.
pub struct MockUpstream {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    _handle: JoinHandle<()>,
}

impl MockUpstream {
    pub const FAIL_BODY: &'static str = "upstream exploded";

    pub async fn start() -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/fail", axum::routing::any(upstream_fail))
            .route("/stream", axum::routing::any(upstream_stream))
            .fallback(upstream_echo)
            .with_state(seen.clone());
        let (addr, handle) = serve(app).await;
        Self {
            addr,
            seen,
            _handle: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

async fn remember(seen: &Arc<Mutex<Vec<SeenRequest>>>, req: Request) {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    seen.lock().unwrap().push(SeenRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    });
}

async fn upstream_echo(State(seen): State<Arc<Mutex<Vec<SeenRequest>>>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    remember(&seen, req).await;
    (
        StatusCode::OK,
        [("x-upstream", "mock"), ("content-type", "application/json")],
        Json(json!({"ok": true, "path": path})),
    )
        .into_response()
}

async fn upstream_fail(State(seen): State<Arc<Mutex<Vec<SeenRequest>>>>, req: Request) -> Response {
    remember(&seen, req).await;
    (StatusCode::INTERNAL_SERVER_ERROR, MockUpstream::FAIL_BODY).into_response()
}

async fn upstream_stream(State(seen): State<Arc<Mutex<Vec<SeenRequest>>>>, req: Request) -> Response {
    remember(&seen, req).await;
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(b"data: one\n\n")),
        Ok(Bytes::from_static(b"data: two\n\n")),
        Ok(Bytes::from_static(b"data: [DONE]\n\n")),
    ];
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Sink that keeps every record for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<RequestTelemetry>>,
}

impl CollectingSink {
    pub fn records(&self) -> Vec<RequestTelemetry> {
        self.records.lock().unwrap().clone()
    }

    pub fn last(&self) -> RequestTelemetry {
        self.records().pop().expect("no telemetry recorded")
    }
}

impl TelemetrySink for CollectingSink {
    fn record(&self, telemetry: RequestTelemetry) {
        self.records.lock().unwrap().push(telemetry);
    }
}
