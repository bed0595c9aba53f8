//! Configuration management for herakles-proc-power-exporter.
//!
//! Configuration is merged from defaults, an optional YAML/JSON/TOML file
//! and CLI overrides (CLI wins).

use herakles_proc_power_exporter::coefficients::{self, CoefficientTable};
use herakles_proc_power_exporter::counters::CounterPaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::{Args, ConfigFormat};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9216;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_UID_REFRESH_MS: u64 = 5000;
pub const DEFAULT_PROFILE: &str = "hammerhead";
pub const DEFAULT_MAX_PROCESSES: usize = 4096;
pub const DEFAULT_REGISTRY_BACKEND: &str = "procfs";
pub const DEFAULT_SHELL_COMMAND: &str = "su";

/// Effective exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Sampling
    #[serde(alias = "tick-interval-ms")]
    pub tick_interval_ms: Option<u64>,
    /// Built-in or installed calibration profile name
    #[serde(alias = "profile")]
    pub device_profile: Option<String>,
    /// Explicit calibration table, overrides device_profile
    #[serde(alias = "coefficients")]
    pub coefficients_file: Option<PathBuf>,
    #[serde(alias = "enable-cpu")]
    pub enable_cpu: Option<bool>,
    #[serde(alias = "enable-wifi")]
    pub enable_wifi: Option<bool>,
    #[serde(alias = "solo-prediction")]
    pub enable_solo_prediction: Option<bool>,

    // Counter locations
    /// Prefix prepended to every kernel counter path
    #[serde(alias = "root")]
    pub counter_root: Option<PathBuf>,
    #[serde(alias = "interface")]
    pub wifi_interface: Option<String>,
    pub link_speed_path: Option<PathBuf>,
    pub link_speed_refresh_ticks: Option<u64>,

    // Process registry
    pub max_processes: Option<usize>,
    /// "procfs" | "shell"
    #[serde(alias = "backend")]
    pub registry_backend: Option<String>,
    /// Shell started by the shell backend
    pub shell_command: Option<String>,
    pub uid_refresh_ms: Option<u64>,
    pub times_refresh_ms: Option<u64>,
    pub parallelism: Option<usize>,

    // Feature flags
    pub enable_health: Option<bool>,
    pub enable_telemetry: Option<bool>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_PORT),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            tick_interval_ms: Some(DEFAULT_TICK_INTERVAL_MS),
            device_profile: Some(DEFAULT_PROFILE.to_string()),
            coefficients_file: None,
            enable_cpu: Some(true),
            enable_wifi: Some(true),
            enable_solo_prediction: Some(true),
            counter_root: Some(PathBuf::from("/")),
            wifi_interface: Some("wlan0".into()),
            link_speed_path: None,
            link_speed_refresh_ticks: Some(30),
            max_processes: Some(DEFAULT_MAX_PROCESSES),
            registry_backend: Some(DEFAULT_REGISTRY_BACKEND.into()),
            shell_command: Some(DEFAULT_SHELL_COMMAND.into()),
            uid_refresh_ms: Some(DEFAULT_UID_REFRESH_MS),
            times_refresh_ms: Some(DEFAULT_TICK_INTERVAL_MS),
            parallelism: None,
            enable_health: Some(true),
            enable_telemetry: Some(true),
            log_level: Some("info".into()),
        }
    }
}

impl Config {
    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS)
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes.unwrap_or(DEFAULT_MAX_PROCESSES)
    }

    pub fn counter_root(&self) -> PathBuf {
        self.counter_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    pub fn registry_backend(&self) -> &str {
        self.registry_backend
            .as_deref()
            .unwrap_or(DEFAULT_REGISTRY_BACKEND)
    }

    /// Counter locations as seen by the engines (relative to the root).
    pub fn counter_paths(&self) -> CounterPaths {
        let mut paths = CounterPaths::default();
        if let Some(iface) = &self.wifi_interface {
            paths.wifi_interface = iface.clone();
        }
        paths.link_speed = self.link_speed_path.clone();
        paths
    }

    /// Loads the calibration table: explicit file first, then profile.
    pub fn coefficient_table(&self) -> herakles_proc_power_exporter::Result<CoefficientTable> {
        match &self.coefficients_file {
            Some(path) => coefficients::load_table_from_file(path),
            None => coefficients::profile(self.device_profile.as_deref().unwrap_or(DEFAULT_PROFILE)),
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if !(cfg.enable_cpu.unwrap_or(true) || cfg.enable_wifi.unwrap_or(true)) {
        return Err("At least one of enable_cpu/enable_wifi must be true".into());
    }

    if cfg.tick_interval_ms() == 0 {
        return Err("tick_interval_ms must be greater than 0".into());
    }
    for (name, value) in [
        ("uid_refresh_ms", cfg.uid_refresh_ms),
        ("times_refresh_ms", cfg.times_refresh_ms),
    ] {
        if value == Some(0) {
            return Err(format!("{} must be greater than 0", name).into());
        }
    }

    if cfg.max_processes() == 0 {
        return Err("max_processes must be greater than 0".into());
    }

    match cfg.registry_backend() {
        "procfs" => {}
        "shell" => {
            if cfg.shell_command.as_deref().map_or(true, str::is_empty) {
                return Err("registry_backend is 'shell' but shell_command is empty".into());
            }
        }
        other => {
            return Err(format!(
                "Invalid registry_backend '{}', expected 'procfs' or 'shell'",
                other
            )
            .into());
        }
    }

    if cfg.wifi_interface.as_deref().map_or(false, str::is_empty) {
        return Err("wifi_interface must not be empty".into());
    }

    cfg.coefficient_table()?;

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }

    if let Some(ms) = args.interval_ms {
        config.tick_interval_ms = Some(ms);
    }
    if let Some(profile) = &args.profile {
        config.device_profile = Some(profile.clone());
        // a named profile on the CLI beats a table file from the config
        if args.coefficients.is_none() {
            config.coefficients_file = None;
        }
    }
    if let Some(path) = &args.coefficients {
        config.coefficients_file = Some(path.clone());
    }
    if let Some(root) = &args.root {
        config.counter_root = Some(root.clone());
    }
    if let Some(iface) = &args.interface {
        config.wifi_interface = Some(iface.clone());
    }
    if let Some(backend) = &args.backend {
        config.registry_backend = Some(backend.clone());
    }
    if args.max_processes.is_some() {
        config.max_processes = args.max_processes;
    }
    if args.parallelism.is_some() {
        config.parallelism = args.parallelism;
    }

    // Feature flags
    if args.disable_cpu {
        config.enable_cpu = Some(false);
    }
    if args.disable_wifi {
        config.enable_wifi = Some(false);
    }
    if args.disable_health {
        config.enable_health = Some(false);
    }
    if args.disable_telemetry {
        config.enable_telemetry = Some(false);
    }

    Ok(config)
}

/// Loads a config file; without an explicit path the default locations are
/// tried and plain defaults are used when none exists.
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => {
            let defaults = [
                "./herakles-proc-power-exporter.yaml",
                "./herakles-proc-power-exporter.yml",
                "./herakles-proc-power-exporter.json",
                "/etc/herakles/proc-power-exporter.yaml",
                "/etc/herakles/proc-power-exporter.yml",
                "/etc/herakles/proc-power-exporter.json",
            ];

            match defaults.iter().find(|p| Path::new(p).exists()) {
                Some(found) => PathBuf::from(found),
                None => return Ok(Config::default()),
            }
        }
    };

    let content = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("toml") => toml::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Shows configuration in requested format
pub fn show_config(
    config: &Config,
    format: ConfigFormat,
    user_config: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = render_config(config, format)?;
    if user_config {
        println!("User configuration (effective values):");
    }
    println!("{output}");
    Ok(())
}

pub fn render_config(
    config: &Config,
    format: ConfigFormat,
) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_effective_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_all_components_disabled() {
        let cfg = Config {
            enable_cpu: Some(false),
            enable_wifi: Some(false),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn test_rejects_unknown_backend_and_profile() {
        let cfg = Config {
            registry_backend: Some("magic".into()),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());

        let cfg = Config {
            device_profile: Some("no-such-phone".into()),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn test_yaml_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        fs::write(&path, "profile: royss\ninterface: wlan1\nbackend: shell\n").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.device_profile.as_deref(), Some("royss"));
        assert_eq!(cfg.wifi_interface.as_deref(), Some("wlan1"));
        assert_eq!(cfg.registry_backend(), "shell");
        // unspecified fields stay unset and fall back at use sites
        assert_eq!(cfg.tick_interval_ms(), DEFAULT_TICK_INTERVAL_MS);
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "herakles-proc-power-exporter",
            "--no-config",
            "--profile",
            "royss",
            "--interval-ms",
            "250",
            "--disable-wifi",
        ]);
        let cfg = resolve_config(&args).unwrap();
        assert_eq!(cfg.device_profile.as_deref(), Some("royss"));
        assert_eq!(cfg.tick_interval_ms(), 250);
        assert_eq!(cfg.enable_wifi, Some(false));
        assert_eq!(cfg.coefficient_table().unwrap().name, "royss");
    }

    #[test]
    fn test_counter_paths_follow_config() {
        let cfg = Config {
            wifi_interface: Some("wlp2s0".into()),
            link_speed_path: Some(PathBuf::from("/run/wifi/speed")),
            ..Config::default()
        };
        let paths = cfg.counter_paths();
        assert_eq!(paths.wifi_interface, "wlp2s0");
        assert_eq!(paths.link_speed(), PathBuf::from("/run/wifi/speed"));
    }
}
