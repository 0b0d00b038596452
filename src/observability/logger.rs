use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tracing::Level;

use crate::proxy::recorder::RequestTelemetry;

/// Receives one record per inbound request, after its response completes.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, telemetry: RequestTelemetry);
}

const TARGET: &str = "request_log";

macro_rules! emit {
    ($level:expr, $t:expr, $headers:expr, $response_headers:expr, $message:literal) => {
        tracing::event!(
            target: TARGET,
            $level,
            request_id = %$t.request_id,
            timestamp = %$t.timestamp.to_rfc3339(),
            method = %$t.method,
            path = %$t.path,
            query = %$t.query,
            client_addr = %$t.client_addr,
            user_agent = $t.user_agent.as_deref().unwrap_or("-"),
            x_forwarded_for = $t.x_forwarded_for.as_deref().unwrap_or("-"),
            authorization = %$t.authorization,
            request_headers = %$headers,
            request_body = $t.request_body.as_deref(),
            request_size = $t.request_size,
            upstream = $t.upstream.as_deref(),
            model = $t.model_name.as_deref(),
            outcome = $t.outcome.as_str(),
            upgraded = $t.upgraded,
            status = $t.status,
            response_headers = %$response_headers,
            response_size = $t.response_size,
            response_body = $t.response_body.as_deref(),
            response_body_truncated = $t.response_body_truncated,
            latency_ms = $t.latency_ms,
            $message
        )
    };
}

#[derive(Debug, Default)]
struct LoggerStatistics {
    total_log_entries: AtomicU64,
    client_error_entries: AtomicU64,
    server_error_entries: AtomicU64,
}

/// Writes request telemetry as structured `tracing` events on the
/// `request_log` target, at a level chosen by response status.
#[derive(Debug, Default)]
pub struct RequestLogger {
    statistics: LoggerStatistics,
}

impl RequestLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level_for(status: u16) -> Level {
        if status >= 500 {
            Level::ERROR
        } else if status >= 400 {
            Level::WARN
        } else {
            Level::INFO
        }
    }

    pub fn statistics(&self) -> Value {
        json!({
            "total_log_entries": self.statistics.total_log_entries.load(Ordering::Relaxed),
            "client_error_entries": self.statistics.client_error_entries.load(Ordering::Relaxed),
            "server_error_entries": self.statistics.server_error_entries.load(Ordering::Relaxed),
        })
    }
}

impl TelemetrySink for RequestLogger {
    fn record(&self, t: RequestTelemetry) {
        self.statistics.total_log_entries.fetch_add(1, Ordering::Relaxed);

        let headers = serde_json::to_string(&t.request_headers).unwrap_or_default();
        let response_headers = serde_json::to_string(&t.response_headers).unwrap_or_default();

        let level = Self::level_for(t.status);
        if level == Level::ERROR {
            self.statistics.server_error_entries.fetch_add(1, Ordering::Relaxed);
            emit!(Level::ERROR, t, headers, response_headers, "proxy_request_server_error");
        } else if level == Level::WARN {
            self.statistics.client_error_entries.fetch_add(1, Ordering::Relaxed);
            emit!(Level::WARN, t, headers, response_headers, "proxy_request_client_error");
        } else {
            emit!(Level::INFO, t, headers, response_headers, "proxy_request");
        }
    }
}
