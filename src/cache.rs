//! Cache of the latest tick report.
//!
//! The sampling loop publishes into `ReportCache` through `CacheSink`; the
//! HTTP handlers only ever read the last complete report.

use herakles_proc_power_exporter::{SampleSink, TickReport};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

use crate::health_stats::HealthStats;

#[derive(Clone, Default)]
pub struct ReportCache {
    pub report: Option<TickReport>,
    pub last_updated: Option<Instant>,
    /// Ticks published so far, including empty warm-up ticks.
    pub ticks: u64,
}

impl ReportCache {
    /// True once a tick with at least one estimate was published.
    pub fn has_estimates(&self) -> bool {
        self.report
            .as_ref()
            .map_or(false, |report| !report.estimates.is_empty())
    }
}

pub type SharedCache = Arc<RwLock<ReportCache>>;

/// Sink storing every report in the shared cache.
pub struct CacheSink {
    cache: SharedCache,
    health_stats: Arc<HealthStats>,
    ready: Arc<Notify>,
}

impl CacheSink {
    pub fn new(cache: SharedCache, health_stats: Arc<HealthStats>, ready: Arc<Notify>) -> Self {
        Self {
            cache,
            health_stats,
            ready,
        }
    }
}

impl SampleSink for CacheSink {
    fn publish(&mut self, report: &TickReport) {
        self.health_stats.record_tick(
            report.duration.as_secs_f64() * 1000.0,
            report.uid_count(),
            report.estimates.len(),
        );

        if let Ok(mut cache) = self.cache.write() {
            cache.ticks += 1;
            cache.last_updated = Some(Instant::now());
            // keep the last useful report through empty warm-up ticks
            if !report.estimates.is_empty() || cache.report.is_none() {
                cache.report = Some(report.clone());
            }
        }
        debug!("Cached report for tick {}", report.tick);
        self.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn report(tick: u64) -> TickReport {
        TickReport {
            tick,
            timestamp: Utc::now(),
            duration: Duration::from_millis(1),
            estimates: Vec::new(),
        }
    }

    #[test]
    fn test_sink_updates_cache_and_stats() {
        let cache = SharedCache::default();
        let stats = Arc::new(HealthStats::new());
        let mut sink = CacheSink::new(cache.clone(), stats.clone(), Arc::new(Notify::new()));

        sink.publish(&report(1));
        sink.publish(&report(2));

        let cache = cache.read().unwrap();
        assert_eq!(cache.ticks, 2);
        assert!(cache.last_updated.is_some());
        // empty reports never replace a stored one
        assert_eq!(cache.report.as_ref().unwrap().tick, 1);
        assert!(!cache.has_estimates());
        assert_eq!(stats.total_ticks(), 2);
    }
}
