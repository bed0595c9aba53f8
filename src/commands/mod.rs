//! CLI command implementations for herakles-proc-power-exporter.
//!
//! This module provides implementations for all CLI subcommands:
//! - `check`: Counter and configuration validation
//! - `config`: Configuration file generation
//! - `sample`: Live sampling dry run
//! - `profiles`: Power profile listing

pub mod check;
pub mod config;
pub mod profiles;
pub mod sample;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
pub use profiles::command_profiles;
pub use sample::command_sample;
