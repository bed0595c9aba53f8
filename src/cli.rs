//! CLI arguments and subcommands for herakles-proc-power-exporter.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "herakles-proc-power-exporter",
    about = "Prometheus exporter for per-UID CPU and Wifi power estimates",
    long_about = "Prometheus exporter for per-UID CPU and Wifi power estimates.\n\n\
                  Samples kernel CPU time, core frequency and network counters at a fixed \
                  cadence, attributes utilization to application UIDs and prices it in \
                  milliwatts using a calibrated device power profile.",
    author = "Michael Moll <proc-mem@herakles.io> - Herakles IO",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/herakles-io/herakles-proc-power-exporter | More info: https://www.herakles.io | Support: proc-mem@herakles.io"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Print only the loaded user config file and exit
    #[arg(long)]
    pub show_user_config: bool,

    /// Output format for --show-config*
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Device power profile name (see `profiles`)
    #[arg(long)]
    pub profile: Option<String>,

    /// Calibration table file (TOML/YAML/JSON), overrides --profile
    #[arg(long)]
    pub coefficients: Option<PathBuf>,

    /// Sampling tick interval in milliseconds
    #[arg(short = 'i', long)]
    pub interval_ms: Option<u64>,

    /// Prefix for all kernel counter paths (e.g. a mounted device image)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Wifi network interface name
    #[arg(long)]
    pub interface: Option<String>,

    /// Process registry backend: procfs or shell
    #[arg(long)]
    pub backend: Option<String>,

    /// Maximum number of processes tracked per refresh
    #[arg(long)]
    pub max_processes: Option<usize>,

    /// Parallel processing threads (0 = auto)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Disable the CPU component
    #[arg(long)]
    pub disable_cpu: bool,

    /// Disable the Wifi component
    #[arg(long)]
    pub disable_wifi: bool,

    /// Disable /health endpoint + health metrics
    #[arg(long)]
    pub disable_health: bool,

    /// Disable internal exporter_* metrics
    #[arg(long)]
    pub disable_telemetry: bool,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and counter accessibility
    Check {
        /// Check CPU counters (stat, cpufreq, per-process stat)
        #[arg(long)]
        cpu: bool,

        /// Check Wifi interface and per-UID network counters
        #[arg(long)]
        wifi: bool,

        /// Check everything
        #[arg(long)]
        all: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path ("-" for stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Run a few sampling ticks and print the estimates
    Sample {
        /// Number of ticks to print (after the warm-up tick)
        #[arg(short = 'n', long, default_value_t = 3)]
        iterations: usize,

        /// Milliseconds between ticks
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Print every sample record, not just milliwatts
        #[arg(long)]
        verbose: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// List available device power profiles
    Profiles {
        /// Show the full calibration tables
        #[arg(long)]
        verbose: bool,

        /// Show only this profile
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
}
