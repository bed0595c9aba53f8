//! `config` subcommand: writes a default configuration file.

use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::{render_config, Config};

/// Generates configuration files
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = output.unwrap_or_else(|| PathBuf::from("herakles-proc-power-exporter.yaml"));

    let mut content = render_config(&config, format)?;
    if commented && matches!(format, ConfigFormat::Yaml) {
        content = add_config_comments(content);
    }

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Herakles Process Power Exporter Configuration
# ===============================================
#
# Server Configuration
# --------------------
# bind: "0.0.0.0"                # Bind IP (0.0.0.0 = all interfaces)
# port: 9216                     # HTTP port
#
# Sampling
# --------
# tick_interval_ms: 1000         # Tick period, every component is sampled once per tick
# device_profile: hammerhead     # Built-in or /etc/herakles/power-profiles.toml profile
# coefficients_file: null        # Calibration table file, overrides device_profile
# enable_cpu: true               # CPU attribution
# enable_wifi: true              # Wifi attribution
# enable_solo_prediction: true   # Predict per-UID frequency when run alone
#
# Counter Locations
# -----------------
# counter_root: "/"              # Prefix for /proc and /sys paths
# wifi_interface: wlan0          # Interface under /sys/class/net
# link_speed_path: null          # Link speed file (null = <iface>/speed)
# link_speed_refresh_ticks: 30   # Re-read link speed every N ticks
#
# Process Registry
# ----------------
# max_processes: 4096            # Process cap per refresh
# registry_backend: procfs       # procfs or shell
# shell_command: su              # Shell for the shell backend
# uid_refresh_ms: 5000           # PID to UID cache refresh
# times_refresh_ms: 1000         # CPU times cache refresh (capped at tick)
# parallelism: null              # Parallel threads (null = auto)
#
# Feature Flags
# -------------
# enable_health: true            # Enable /health endpoint
# enable_telemetry: true         # Enable internal metrics
#
# Logging
# -------
# log_level: "info"              # off, error, warn, info, debug, trace
"#;

    format!("{comments}\n{yaml}")
}
