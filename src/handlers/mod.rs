//! HTTP endpoint handlers for the exporter.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/metrics`: Prometheus metrics endpoint
//! - `/health`: Health check endpoint
//! - `/doc`: Documentation endpoint

pub mod doc;
pub mod health;
pub mod metrics;

// Re-export handlers
pub use doc::doc_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
