//! Per-UID power estimation for CPU and Wifi.
//!
//! Kernel counters are sampled at a fixed cadence by the attribution
//! engines ([`cpu`], [`wifi`]), turned into per-UID utilization samples and
//! priced in milliwatts by the [`power`] model using a device calibration
//! table ([`coefficients`]). The [`scheduler`] drives one tick at a time.

pub mod coefficients;
pub mod counters;
pub mod cpu;
pub mod error;
pub mod power;
pub mod registry;
pub mod sample;
pub mod scheduler;
pub mod wifi;

pub use coefficients::CoefficientTable;
pub use counters::{CounterPaths, CounterSource, FsCounterSource, MemoryCounterSource};
pub use cpu::{CpuAttributionEngine, CpuSample};
pub use error::{PowerError, Result};
pub use power::PowerModel;
pub use registry::{CachedRegistry, ProcessRegistry};
pub use sample::{Component, Iteration, Record, Sample, Uid};
pub use scheduler::{AttributionEngine, IterationScheduler, PowerEstimate, SampleSink, TickReport};
pub use wifi::{PowerState, WifiAttributionEngine, WifiSample};
