//! Application state management for the exporter.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers and fed by the background sampling task.

use herakles_proc_power_exporter::CachedRegistry;
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::cache::SharedCache;
use crate::config::Config;
use crate::health_stats::HealthStats;
use crate::metrics::{PowerMetrics, TelemetryMetrics};

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests and background tasks.
pub struct AppState {
    pub registry: Registry,
    pub metrics: PowerMetrics,
    /// `None` when telemetry is disabled.
    pub telemetry: Option<TelemetryMetrics>,
    pub cache: SharedCache,
    /// Notified after every published tick.
    pub cache_ready: Arc<Notify>,
    pub process_registry: Arc<CachedRegistry>,
    pub config: Arc<Config>,
    pub health_stats: Arc<HealthStats>,
    /// Name of the active power profile.
    pub profile: String,
}
