pub mod logger;
pub mod metrics;

use std::sync::Arc;

use crate::proxy::recorder::RequestTelemetry;

pub use logger::{RequestLogger, TelemetrySink};
pub use metrics::MetricsCollector;

/// Observability facade that combines metrics and logging
pub struct Observability {
    pub metrics: Arc<MetricsCollector>,
    pub logger: Arc<RequestLogger>,
}

impl Observability {
    pub fn new(metrics: Arc<MetricsCollector>, logger: Arc<RequestLogger>) -> Self {
        Self { metrics, logger }
    }
}

impl TelemetrySink for Observability {
    fn record(&self, telemetry: RequestTelemetry) {
        self.metrics
            .record_request(telemetry.status, telemetry.outcome, telemetry.latency);
        self.logger.record(telemetry);
    }
}
