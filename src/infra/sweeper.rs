//! Periodic background sweeps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::application::quota::QuotaService;
use crate::cache::ResponseCache;

const METRIC_SWEEP_MS: &str = "tollgate_sweep_ms";

/// Running sweep tasks. Dropping this does not stop them; call [`Sweepers::shutdown`].
pub struct Sweepers {
    handles: Vec<JoinHandle<()>>,
}

impl Sweepers {
    pub fn spawn(
        cache: Arc<ResponseCache>,
        cache_interval: Duration,
        quota: Arc<QuotaService>,
        usage_interval: Duration,
    ) -> Self {
        Self {
            handles: vec![
                spawn_cache_sweep(cache, cache_interval),
                spawn_usage_sweep(quota, usage_interval),
            ],
        }
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

pub fn spawn_cache_sweep(cache: Arc<ResponseCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            let started = Instant::now();
            let removed = cache.purge_expired();
            histogram!(METRIC_SWEEP_MS, "sweep" => "cache")
                .record(started.elapsed().as_secs_f64() * 1_000.0);
            if removed > 0 {
                debug!(target = "tollgate::sweeper", removed, "purged expired cache entries");
            }
        }
    })
}

pub fn spawn_usage_sweep(quota: Arc<QuotaService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let started = Instant::now();
            if let Err(err) = quota.purge_expired_usage().await {
                warn!(target = "tollgate::sweeper", error = %err, "usage retention sweep failed");
            }
            histogram!(METRIC_SWEEP_MS, "sweep" => "usage")
                .record(started.elapsed().as_secs_f64() * 1_000.0);
        }
    })
}
