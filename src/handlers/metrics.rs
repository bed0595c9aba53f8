//! Metrics endpoint handler for Prometheus scraping.
//!
//! This module provides the `/metrics` endpoint handler that turns the
//! latest cached tick report into Prometheus text format.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument};

use crate::state::SharedState;

/// Buffer capacity for metrics encoding.
const BUFFER_CAP: usize = 128 * 1024;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response()
    }
}

/// Handler for the /metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, MetricsError> {
    let start = Instant::now();
    debug!("Processing /metrics request");
    state.health_stats.record_http_request();

    // Before the first tick there is nothing to export; give it one interval.
    let no_tick_yet = state.cache.read().map_or(true, |cache| cache.ticks == 0);
    if no_tick_yet {
        let wait = Duration::from_millis(state.config.tick_interval_ms());
        if tokio::time::timeout(wait, state.cache_ready.notified())
            .await
            .is_err()
        {
            debug!("No tick completed within {}ms, exporting empty set", wait.as_millis());
        }
    }

    let (report, ticks) = match state.cache.read() {
        Ok(cache) => (cache.report.clone(), cache.ticks),
        Err(_) => {
            error!("Report cache lock poisoned");
            return Err(MetricsError::EncodingFailed);
        }
    };

    // Reset metrics before populating with fresh data
    state.metrics.reset();
    let series = report
        .as_ref()
        .map_or(0, |report| state.metrics.set_from_report(report));

    if let Some(telemetry) = &state.telemetry {
        if let Some(report) = &report {
            telemetry.tick_duration.set(report.duration.as_secs_f64());
            telemetry.tracked_uids.set(report.uid_count() as f64);
        }
        telemetry.tick.set(ticks as f64);

        let stats = state.process_registry.stats();
        telemetry.registry_uid_entries.set(stats.uid_entries as f64);
        telemetry.registry_times_entries.set(stats.times_entries as f64);
        telemetry.scrape_duration.set(start.elapsed().as_secs_f64());
    }

    // Encode metrics in Prometheus text format
    let families = state.registry.gather();
    let mut buffer = Vec::with_capacity(BUFFER_CAP);
    let encoder = TextEncoder::new();

    if encoder.encode(&families, &mut buffer).is_err() {
        error!("Failed to encode Prometheus metrics");
        return Err(MetricsError::EncodingFailed);
    }

    debug!(
        "Metrics request completed: {} series, {} bytes, {:.3}ms",
        series,
        buffer.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    String::from_utf8(buffer).map_err(|_| MetricsError::EncodingFailed)
}
