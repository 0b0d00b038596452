use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body::{Body as HttpBody, Frame};
use serde::Serialize;

use crate::error::ProxyError;
use crate::observability::TelemetrySink;

/// Which terminal branch of request handling produced the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Forwarded,
    NotReady,
    Unauthorized,
    InvalidUpstream,
    UpstreamError,
    BadRequest,
    PayloadTooLarge,
    /// The caller went away before response headers were sent.
    ClientClosed,
}

/// Status recorded when the caller disconnects before a response exists.
pub const CLIENT_CLOSED_STATUS: u16 = 499;

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Forwarded => "forwarded",
            Outcome::NotReady => "not_ready",
            Outcome::Unauthorized => "unauthorized",
            Outcome::InvalidUpstream => "invalid_upstream",
            Outcome::UpstreamError => "upstream_error",
            Outcome::BadRequest => "bad_request",
            Outcome::PayloadTooLarge => "payload_too_large",
            Outcome::ClientClosed => "client_closed",
        }
    }

    pub fn from_error(error: &ProxyError) -> Self {
        match error {
            ProxyError::NotReady => Outcome::NotReady,
            ProxyError::Unauthorized => Outcome::Unauthorized,
            ProxyError::InvalidUpstream { .. } => Outcome::InvalidUpstream,
            ProxyError::BadRequest(_) => Outcome::BadRequest,
            ProxyError::PayloadTooLarge { .. } => Outcome::PayloadTooLarge,
            _ => Outcome::UpstreamError,
        }
    }
}

/// Everything known about one inbound request once its response is done.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestTelemetry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query: String,
    pub client_addr: String,
    pub user_agent: Option<String>,
    pub x_forwarded_for: Option<String>,
    /// Caller's credential as received, never the substituted one.
    pub authorization: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<String>,
    pub request_size: u64,
    pub upstream: Option<String>,
    pub model_name: Option<String>,
    pub outcome: Outcome,
    pub upgraded: bool,
    pub status: u16,
    pub response_headers: BTreeMap<String, String>,
    pub response_size: u64,
    pub response_body: Option<String>,
    pub response_body_truncated: bool,
    pub latency_ms: u64,
    #[serde(skip)]
    pub latency: Duration,
}

impl RequestTelemetry {
    /// Snapshot the request line and headers, before anything is rewritten.
    pub fn from_request(request_id: &str, parts: &Parts, client_addr: Option<SocketAddr>) -> Self {
        let header_str = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        };

        Self {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            client_addr: client_addr.map(|a| a.to_string()).unwrap_or_default(),
            user_agent: header_str(header::USER_AGENT),
            x_forwarded_for: parts
                .headers
                .get("x-forwarded-for")
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
            authorization: header_str(header::AUTHORIZATION).unwrap_or_default(),
            request_headers: headers_to_map(&parts.headers),
            ..Self::default()
        }
    }

    /// Account for the buffered request body. `body_limit` is `Some` when the
    /// body should be kept, truncated to that many bytes.
    pub fn record_request_body(&mut self, body: &Bytes, body_limit: Option<usize>) {
        self.request_size = body.len() as u64;
        self.request_body = body_limit.map(|limit| truncate_lossy(body, limit));
    }
}

/// Flatten a header map, joining repeated values with ", ".
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    map
}

fn truncate_lossy(bytes: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(limit)]).into_owned()
}

/// Request telemetry held while a response is being produced. If it is
/// dropped before becoming a [`ResponseRecorder`], the caller disconnected
/// and a client-closed record is emitted instead.
pub struct PendingRecord {
    telemetry: RequestTelemetry,
    sink: Arc<dyn TelemetrySink>,
    started: Instant,
    armed: bool,
}

impl PendingRecord {
    pub fn new(telemetry: RequestTelemetry, sink: Arc<dyn TelemetrySink>, started: Instant) -> Self {
        Self {
            telemetry,
            sink,
            started,
            armed: true,
        }
    }

    pub fn telemetry(&self) -> &RequestTelemetry {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut RequestTelemetry {
        &mut self.telemetry
    }

    /// Hand the record over to a recorder that observes the response.
    pub fn into_recorder(mut self, capture: BodyCapture) -> ResponseRecorder {
        self.armed = false;
        let telemetry = std::mem::take(&mut self.telemetry);
        ResponseRecorder::new(telemetry, Arc::clone(&self.sink), self.started, capture)
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut telemetry = std::mem::take(&mut self.telemetry);
        let latency = self.started.elapsed();
        telemetry.outcome = Outcome::ClientClosed;
        telemetry.status = CLIENT_CLOSED_STATUS;
        telemetry.latency = latency;
        telemetry.latency_ms = latency.as_millis() as u64;
        self.sink.record(telemetry);
    }
}

/// Error-body capture settings.
#[derive(Debug, Clone, Copy)]
pub struct BodyCapture {
    pub enabled: bool,
    pub limit: usize,
}

/// Observes a response as it is written and hands the finished telemetry
/// record to the sink exactly once, on completion or on drop.
pub struct ResponseRecorder {
    telemetry: Option<RequestTelemetry>,
    sink: Arc<dyn TelemetrySink>,
    started: Instant,
    capture: BodyCapture,
    status: Option<StatusCode>,
    headers: BTreeMap<String, String>,
    bytes_written: u64,
    buffer: Option<Vec<u8>>,
    truncated: bool,
}

impl ResponseRecorder {
    pub fn new(telemetry: RequestTelemetry, sink: Arc<dyn TelemetrySink>, started: Instant, capture: BodyCapture) -> Self {
        Self {
            telemetry: Some(telemetry),
            sink,
            started,
            capture,
            status: None,
            headers: BTreeMap::new(),
            bytes_written: 0,
            buffer: None,
            truncated: false,
        }
    }

    /// Record status and headers. Only the first call has any effect.
    pub fn write_header(&mut self, status: StatusCode, headers: &HeaderMap) {
        if self.status.is_some() {
            return;
        }
        self.status = Some(status);
        self.headers = headers_to_map(headers);
        if self.capture.enabled && (status.is_client_error() || status.is_server_error()) {
            self.buffer = Some(Vec::new());
        }
    }

    /// Account for a body chunk on its way to the client.
    pub fn write(&mut self, chunk: &[u8]) {
        if self.status.is_none() {
            self.write_header(StatusCode::OK, &HeaderMap::new());
        }
        self.bytes_written += chunk.len() as u64;

        if let Some(buffer) = self.buffer.as_mut() {
            let room = self.capture.limit.saturating_sub(buffer.len());
            if chunk.len() > room {
                self.truncated = true;
            }
            buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    /// Emit the telemetry record. Later calls are no-ops.
    pub fn finish(&mut self) {
        let Some(mut telemetry) = self.telemetry.take() else {
            return;
        };

        let latency = self.started.elapsed();
        telemetry.status = self.status.unwrap_or(StatusCode::OK).as_u16();
        telemetry.response_headers = std::mem::take(&mut self.headers);
        telemetry.response_size = self.bytes_written;
        telemetry.response_body = self
            .buffer
            .take()
            .map(|buffer| String::from_utf8_lossy(&buffer).into_owned());
        telemetry.response_body_truncated = self.truncated;
        telemetry.latency = latency;
        telemetry.latency_ms = latency.as_millis() as u64;

        self.sink.record(telemetry);
    }

    /// Interpose on `response`: headers are recorded now, body bytes as they
    /// stream, and the record is emitted when the body ends or is dropped.
    pub fn wrap(mut self, response: Response) -> Response {
        let (parts, body) = response.into_parts();
        self.write_header(parts.status, &parts.headers);
        Response::from_parts(
            parts,
            Body::new(RecordingBody {
                inner: body,
                recorder: self,
            }),
        )
    }
}

impl Drop for ResponseRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Response body that reports every data frame to its recorder.
pub struct RecordingBody {
    inner: Body,
    recorder: ResponseRecorder,
}

impl HttpBody for RecordingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.recorder.write(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.recorder.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.recorder.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CollectingSink;
    use axum::http::{HeaderValue, Request};
    use http_body_util::BodyExt;

    fn telemetry() -> RequestTelemetry {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions?stream=true")
            .header("authorization", "Bearer abc")
            .header("accept", "text/plain")
            .header("accept", "application/json")
            .body(())
            .unwrap()
            .into_parts();
        let mut t = RequestTelemetry::from_request("req-1", &parts, None);
        t.record_request_body(&Bytes::from_static(b"{\"a\":1}"), Some(4));
        t
    }

    fn recorder(sink: &Arc<CollectingSink>, capture: BodyCapture) -> ResponseRecorder {
        ResponseRecorder::new(telemetry(), sink.clone(), Instant::now(), capture)
    }

    const CAPTURE: BodyCapture = BodyCapture { enabled: true, limit: 8 };

    #[test]
    fn test_request_snapshot() {
        let t = telemetry();
        assert_eq!(t.method, "POST");
        assert_eq!(t.path, "/v1/chat/completions");
        assert_eq!(t.query, "stream=true");
        assert_eq!(t.authorization, "Bearer abc");
        assert_eq!(t.request_size, 7);
        assert_eq!(t.request_body.as_deref(), Some("{\"a\""));
        assert_eq!(t.request_headers["accept"], "text/plain, application/json");
    }

    #[test]
    fn test_first_status_wins() {
        let sink = Arc::new(CollectingSink::default());
        let mut rec = recorder(&sink, CAPTURE);

        let mut headers = HeaderMap::new();
        headers.insert("x-first", HeaderValue::from_static("1"));
        rec.write_header(StatusCode::CREATED, &headers);
        rec.write_header(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new());
        rec.finish();

        let t = sink.last();
        assert_eq!(t.status, 201);
        assert_eq!(t.response_headers["x-first"], "1");
        assert!(t.response_body.is_none());
    }

    #[test]
    fn test_success_bodies_are_counted_not_buffered() {
        let sink = Arc::new(CollectingSink::default());
        let mut rec = recorder(&sink, CAPTURE);
        rec.write(b"hello ");
        rec.write(b"world, this is long");
        drop(rec);

        let t = sink.last();
        assert_eq!(t.response_size, 25);
        assert!(t.response_body.is_none());
        assert!(!t.response_body_truncated);
    }

    #[test]
    fn test_error_body_captured_and_truncated() {
        let sink = Arc::new(CollectingSink::default());
        let mut rec = recorder(&sink, CAPTURE);
        rec.write_header(StatusCode::BAD_GATEWAY, &HeaderMap::new());
        rec.write(b"upstream ");
        rec.write(b"exploded");
        rec.finish();

        let t = sink.last();
        assert_eq!(t.status, 502);
        assert_eq!(t.response_size, 17);
        assert_eq!(t.response_body.as_deref(), Some("upstream"));
        assert!(t.response_body_truncated);
    }

    #[test]
    fn test_error_body_capture_can_be_disabled() {
        let sink = Arc::new(CollectingSink::default());
        let mut rec = recorder(&sink, BodyCapture { enabled: false, limit: 8 });
        rec.write_header(StatusCode::NOT_FOUND, &HeaderMap::new());
        rec.write(b"missing");
        rec.finish();

        assert!(sink.last().response_body.is_none());
    }

    #[test]
    fn test_emits_exactly_once() {
        let sink = Arc::new(CollectingSink::default());
        let mut rec = recorder(&sink, CAPTURE);
        rec.finish();
        rec.finish();
        drop(rec);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_wrapped_response_streams_through() {
        let sink = Arc::new(CollectingSink::default());
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"data: a\n\n")), Ok(Bytes::from_static(b"data: b\n\n"))];
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();

        let wrapped = recorder(&sink, CAPTURE).wrap(response);
        assert_eq!(wrapped.status(), StatusCode::OK);
        assert!(sink.records().is_empty());

        let body = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"data: a\n\ndata: b\n\n");

        let t = sink.last();
        assert_eq!(t.response_size, 18);
        assert_eq!(t.response_headers["content-type"], "text/event-stream");
        assert_eq!(t.authorization, "Bearer abc");
    }

    #[test]
    fn test_dropped_response_still_emits() {
        let sink = Arc::new(CollectingSink::default());
        let wrapped = recorder(&sink, CAPTURE).wrap(Response::new(Body::from("never read")));
        drop(wrapped);

        let t = sink.last();
        assert_eq!(t.status, 200);
        assert_eq!(t.response_size, 0);
    }

    #[test]
    fn test_abandoned_pending_record_is_client_closed() {
        let sink = Arc::new(CollectingSink::default());
        let mut pending = PendingRecord::new(telemetry(), sink.clone(), Instant::now());
        pending.telemetry_mut().upstream = Some("https://m1".into());
        drop(pending);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CLIENT_CLOSED_STATUS);
        assert_eq!(records[0].outcome, Outcome::ClientClosed);
        assert_eq!(records[0].upstream.as_deref(), Some("https://m1"));
        assert_eq!(records[0].authorization, "Bearer abc");
    }

    #[test]
    fn test_pending_record_hands_off_to_recorder() {
        let sink = Arc::new(CollectingSink::default());
        let pending = PendingRecord::new(telemetry(), sink.clone(), Instant::now());
        let mut rec = pending.into_recorder(CAPTURE);
        assert!(sink.records().is_empty());

        rec.write_header(StatusCode::NO_CONTENT, &HeaderMap::new());
        drop(rec);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 204);
        assert_eq!(records[0].outcome, Outcome::Forwarded);
        assert_eq!(records[0].request_id, "req-1");
    }

    #[test]
    fn test_outcome_from_error() {
        assert_eq!(Outcome::from_error(&ProxyError::NotReady), Outcome::NotReady);
        assert_eq!(Outcome::from_error(&ProxyError::Unauthorized), Outcome::Unauthorized);
        assert_eq!(
            Outcome::from_error(&ProxyError::Upstream("refused".into())),
            Outcome::UpstreamError
        );
        assert_eq!(Outcome::from_error(&ProxyError::PayloadTooLarge { limit: 1 }).as_str(), "payload_too_large");
    }
}
