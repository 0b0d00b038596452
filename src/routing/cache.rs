use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::control_plane::{ControlPlaneRoute, RouteSource};
use super::{extract_bearer_token, RouteEntry, RoutingTable};
use crate::error::Result;
use crate::observability::MetricsCollector;

/// Token routing cache kept fresh from the control plane.
///
/// Lookups take a read lock just long enough to clone an `Arc` out of the
/// current table. Refreshes fetch and build a complete new table without
/// holding that lock, then swap the pointer under the write lock.
pub struct RoutingCache {
    table: RwLock<Arc<RoutingTable>>,
    ready: AtomicBool,
    /// Session token from the last login; the lock also serializes refreshes.
    session: Mutex<Option<String>>,
    generation: AtomicU64,
    source: Arc<dyn RouteSource>,
    metrics: Arc<MetricsCollector>,
}

impl RoutingCache {
    pub fn new(source: Arc<dyn RouteSource>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            table: RwLock::new(Arc::new(RoutingTable::empty())),
            ready: AtomicBool::new(false),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            source,
            metrics,
        }
    }

    /// Resolve an `Authorization` header value to its route.
    pub fn lookup(&self, authorization: &str) -> Option<Arc<RouteEntry>> {
        let token = extract_bearer_token(authorization)?;
        self.snapshot().get(token)
    }

    /// True once at least one refresh has succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The currently installed table.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        let guard = self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Obtain a session token up front. No-op for static credentials.
    pub async fn authenticate(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        *session = self.source.login().await?;
        Ok(())
    }

    /// Fetch the full route set and install it, returning the entry count.
    ///
    /// A rejected credential triggers one login and one retried fetch. Any
    /// other failure, or a second failure, leaves the current table in place.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize> {
        let result = self.refresh_inner().await;
        self.metrics.record_refresh(result.is_ok(), self.snapshot().len());
        result
    }

    async fn refresh_inner(&self) -> Result<usize> {
        let mut session = self.session.lock().await;

        let routes = match self.source.fetch_routes(session.as_deref()).await {
            Ok(routes) => routes,
            Err(e) if e.is_auth_expired() => {
                info!(error = %e, "Control plane credential rejected, logging in again");
                *session = self.source.login().await?;
                self.source.fetch_routes(session.as_deref()).await?
            }
            Err(e) => return Err(e),
        };

        Ok(self.install(&routes))
    }

    fn install(&self, routes: &[ControlPlaneRoute]) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let table = Arc::new(RoutingTable::from_records(routes, generation));
        let count = table.len();
        if table.is_empty() {
            warn!(fetched = routes.len(), "Control plane returned no enabled routes");
        }

        {
            let mut guard = self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = table;
        }
        self.ready.store(true, Ordering::Release);

        info!(
            fetched = routes.len(),
            enabled = count,
            generation,
            "Routing table refreshed"
        );
        count
    }

    /// Refresh now, then every `period` until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between ticks, so a refresh that has
    /// started always runs to completion.
    pub async fn run_periodic(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        info!(interval_secs = period.as_secs(), "Starting routing table sync");

        if let Err(e) = self.authenticate().await {
            warn!(error = %e, "Control plane login failed");
        }
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Initial routing table sync failed");
        }

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Routing table sync stopped");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("Routing table sync tick");
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Routing table sync failed, keeping previous table");
                    }
                }
            }
        }
    }
}
