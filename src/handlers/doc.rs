//! Documentation endpoint handler.
//!
//! This module provides the `/doc` endpoint handler that displays
//! documentation for the exporter.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, instrument};

use crate::handlers::health::FOOTER_TEXT;
use crate::state::SharedState;

/// Handler for the /doc endpoint.
#[instrument(skip(state))]
pub async fn doc_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /doc request");

    // Track HTTP request
    state.health_stats.record_http_request();

    let version = env!("CARGO_PKG_VERSION");
    let doc = format!(
        r#"HERAKLES PROCESS POWER EXPORTER - DOCUMENTATION
===============================================

VERSION: {}
DESCRIPTION: Prometheus exporter for per-UID CPU and Wifi power estimates
ACTIVE PROFILE: {}

HTTP ENDPOINTS
--------------
GET /metrics     - Prometheus metrics endpoint
GET /health      - Health check with sampling statistics (plain text)
GET /doc         - This documentation (plain text)

AVAILABLE METRICS
-----------------
herakles_proc_power_milliwatts{{component,uid}}
    Estimated power per component (CPU, Wifi) and UID. uid="ALL" is the
    whole system.
herakles_proc_power_uid_total_milliwatts{{uid}}
    Sum over all components per UID.
herakles_proc_power_sample_value{{component,metric,uid}}
    Utilization behind the estimate:
      CPU:  usr, sys (percent), freq0..N (MHz, uid="ALL" only), solo-freq
      Wifi: on, packets, uplinkBytes, downlinkBytes, uplink, speed,
            state (0=low, 1=high), upload, download

herakles_proc_power_tick*                - Sampling loop telemetry
herakles_proc_power_registry_*           - Process registry telemetry
herakles_proc_power_scrape_duration_seconds

ESTIMATION MODEL
----------------
CPU power  = ratio(frequency) x (usr% + sys%) per active frequency, with the
             base power shared once across cores.
Wifi power = low/high state power + link-speed ratio x uplink rate, split to
             UIDs by their share of sent and received bytes.
The first tick after startup is a baseline and exports no estimates.

CONFIGURATION
-------------
Config file locations (in order):
1. CLI specified: -c /path/to/config.yaml
2. Current directory: ./herakles-proc-power-exporter.yaml
3. System config: /etc/herakles/proc-power-exporter.yaml

Key configuration options:
- port: HTTP listen port (default: 9216)
- bind: Bind address (default: 0.0.0.0)
- tick_interval_ms: Sampling interval (default: 1000)
- device_profile: Calibration profile (default: hammerhead)
- coefficients_file: Calibration table file, overrides device_profile
- wifi_interface: Network interface (default: wlan0)
- registry_backend: procfs or shell (default: procfs)
- max_processes: Process cap per refresh (default: 4096)

CLI COMMANDS
------------
herakles-proc-power-exporter                    - Start the exporter
herakles-proc-power-exporter check --all        - Validate counters and config
herakles-proc-power-exporter config -o cfg.yaml - Generate config file
herakles-proc-power-exporter sample -n 5        - Print a few ticks
herakles-proc-power-exporter profiles           - List power profiles
herakles-proc-power-exporter --help             - Show all CLI options

EXAMPLE USAGE
-------------
# Start exporter with a specific profile
herakles-proc-power-exporter --profile royss --interface wlan0

# View this documentation
curl http://localhost:9216/doc

# Get metrics
curl http://localhost:9216/metrics

EXAMPLE PROMQL QUERIES
----------------------
# Top 10 UIDs by total power
topk(10, herakles_proc_power_uid_total_milliwatts{{uid!="ALL"}})

# CPU share of the system power
herakles_proc_power_milliwatts{{component="CPU",uid="ALL"}}
  / ignoring(component) herakles_proc_power_uid_total_milliwatts{{uid="ALL"}}

# Energy per UID over one hour (mWh)
avg_over_time(herakles_proc_power_uid_total_milliwatts[1h])

PROMETHEUS SCRAPE CONFIG
------------------------
scrape_configs:
  - job_name: 'herakles-proc-power'
    static_configs:
      - targets: ['localhost:9216']
    scrape_interval: 15s

MORE INFORMATION
----------------
GitHub: https://github.com/herakles-io/herakles-proc-power-exporter

{}
"#,
        version, state.profile, FOOTER_TEXT
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        doc,
    )
}
