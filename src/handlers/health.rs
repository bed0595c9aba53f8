//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns
//! sampling statistics and process registry status.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use herakles_proc_power_exporter::registry::RegistryStats;
use std::fmt::Write as FmtWrite;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "Project: https://github.com/herakles-io/herakles-proc-power-exporter | More info: https://www.herakles.io | Support: proc-mem@herakles.io";

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    // Track HTTP request for health endpoint
    state.health_stats.record_http_request();

    let (ticks, has_estimates, age) = match state.cache.read() {
        Ok(cache) => (
            cache.ticks,
            cache.has_estimates(),
            cache.last_updated.map(|t| t.elapsed()),
        ),
        Err(_) => (0, false, None),
    };

    // Sampling is considered stuck after three missed intervals
    let stale_after = Duration::from_millis(state.config.tick_interval_ms() * 3);
    let stale = age.map_or(true, |age| age > stale_after);

    let status = if ticks > 0 && !stale {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    // Short status message for human-readable heading
    let message = if ticks == 0 {
        "Waiting for first tick"
    } else if stale {
        "Sampling stalled"
    } else if !has_estimates {
        "OK - Warming up"
    } else {
        "OK"
    };

    // Render plain-text table from HealthStats
    let table = state.health_stats.render_table();
    let registry_section = render_registry(&state.process_registry.stats(), &state.profile);

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{message}\n\n{table}\n{registry_section}\n{FOOTER_TEXT}"),
    )
}

/// Renders process registry state as a plain-text block.
fn render_registry(stats: &RegistryStats, profile: &str) -> String {
    let age = |t: Option<std::time::Instant>| {
        t.map_or_else(
            || "never".to_string(),
            |t| format!("{:.1}s ago", t.elapsed().as_secs_f64()),
        )
    };

    let mut out = String::new();
    writeln!(out, "PROCESS REGISTRY").ok();
    writeln!(out, "================").ok();
    writeln!(out).ok();
    writeln!(
        out,
        "{:10} | {:>10} | {:>14} | {:>14}",
        "Cache", "Entries", "Refresh (ms)", "Last refresh"
    )
    .ok();
    writeln!(out, "{}", "-".repeat(57)).ok();
    writeln!(
        out,
        "{:10} | {:>10} | {:>14.3} | {:>14}",
        "uids",
        stats.uid_entries,
        stats.uid_refresh_duration.as_secs_f64() * 1000.0,
        age(stats.last_uid_refresh)
    )
    .ok();
    writeln!(
        out,
        "{:10} | {:>10} | {:>14.3} | {:>14}",
        "times",
        stats.times_entries,
        stats.times_refresh_duration.as_secs_f64() * 1000.0,
        age(stats.last_times_refresh)
    )
    .ok();
    writeln!(out).ok();
    writeln!(out, "Power profile: {}", profile).ok();
    out
}
