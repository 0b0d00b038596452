use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::proxy::recorder::Outcome;

/// Metrics collector that handles all application metrics
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    /// Collector that records nothing and installs no global recorder.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    fn register_metrics() {
        describe_counter!("proxy_requests_total", "Total number of proxied requests by status class and outcome");
        describe_histogram!("proxy_request_duration_seconds", "Time from request receipt until the response body completes or is abandoned");
        describe_counter!("routing_refresh_total", "Routing table refresh attempts by result");
        describe_gauge!("routing_table_entries", "Enabled entries in the installed routing table");
        describe_gauge!("upstream_pool_size", "Forwarding engines constructed so far");
    }

    /// Serve the Prometheus scrape endpoint until `shutdown` is cancelled.
    pub async fn start_server(&self, shutdown: CancellationToken) -> ProxyResult<()> {
        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => return Ok(()),
        };

        let app = Router::new()
            .route(&self.config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Internal(format!("Failed to bind metrics server: {}", e)))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| ProxyError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }

    pub fn record_request(&self, status: u16, outcome: Outcome, duration: Duration) {
        if !self.is_enabled() {
            return;
        }

        counter!(
            "proxy_requests_total",
            "status_class" => status_class(status),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!("proxy_request_duration_seconds", "outcome" => outcome.as_str()).record(duration.as_secs_f64());
    }

    pub fn record_refresh(&self, success: bool, entries: usize) {
        if !self.is_enabled() {
            return;
        }

        let result = if success { "success" } else { "failure" };
        counter!("routing_refresh_total", "result" => result).increment(1);
        gauge!("routing_table_entries").set(entries as f64);
    }

    pub fn set_pool_size(&self, size: usize) {
        if !self.is_enabled() {
            return;
        }

        gauge!("upstream_pool_size").set(size as f64);
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}
