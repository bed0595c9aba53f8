//! Prometheus metrics definitions for the power exporter.
//!
//! `PowerMetrics` holds the per-UID gauges that are rebuilt from the latest
//! tick report on every scrape.

use herakles_proc_power_exporter::TickReport;
use prometheus::{Gauge, GaugeVec, Opts, Registry};

/// Per-UID power and sample gauges.
pub struct PowerMetrics {
    pub power: GaugeVec,
    pub sample_value: GaugeVec,
    pub uid_total: GaugeVec,
}

impl PowerMetrics {
    /// Creates and registers all power metrics with the registry
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let power = GaugeVec::new(
            Opts::new(
                "herakles_proc_power_milliwatts",
                "Estimated power draw per component and UID in milliwatts",
            ),
            &["component", "uid"],
        )?;
        let sample_value = GaugeVec::new(
            Opts::new(
                "herakles_proc_power_sample_value",
                "Raw utilization values behind the power estimates",
            ),
            &["component", "metric", "uid"],
        )?;
        let uid_total = GaugeVec::new(
            Opts::new(
                "herakles_proc_power_uid_total_milliwatts",
                "Estimated power draw per UID summed over all components",
            ),
            &["uid"],
        )?;

        registry.register(Box::new(power.clone()))?;
        registry.register(Box::new(sample_value.clone()))?;
        registry.register(Box::new(uid_total.clone()))?;

        Ok(Self {
            power,
            sample_value,
            uid_total,
        })
    }

    /// Clears all label sets so UIDs gone since the last tick disappear.
    pub fn reset(&self) {
        self.power.reset();
        self.sample_value.reset();
        self.uid_total.reset();
    }

    /// Populates the gauges from one tick report. Returns the number of
    /// exported series.
    pub fn set_from_report(&self, report: &TickReport) -> usize {
        let mut series = 0;

        for estimate in &report.estimates {
            let component = estimate.component.name();
            let uid = estimate.uid.to_string();

            self.power
                .with_label_values(&[component, uid.as_str()])
                .set(estimate.milliwatts);
            series += 1;

            let mut freq_index = 0usize;
            for record in estimate.records() {
                let metric = if record.metric == "freq" {
                    // per-core frequencies only make sense for the system scope
                    if !estimate.uid.is_all() {
                        continue;
                    }
                    let name = format!("freq{}", freq_index);
                    freq_index += 1;
                    name
                } else {
                    record.metric.to_string()
                };
                self.sample_value
                    .with_label_values(&[component, metric.as_str(), uid.as_str()])
                    .set(record.value);
                series += 1;
            }
        }

        for (uid, milliwatts) in report.totals_by_uid() {
            self.uid_total
                .with_label_values(&[uid.to_string().as_str()])
                .set(milliwatts);
            series += 1;
        }

        series
    }
}

/// Internal exporter gauges (disabled with `--disable-telemetry`).
pub struct TelemetryMetrics {
    pub scrape_duration: Gauge,
    pub tick_duration: Gauge,
    pub tick: Gauge,
    pub tracked_uids: Gauge,
    pub registry_uid_entries: Gauge,
    pub registry_times_entries: Gauge,
}

impl TelemetryMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let scrape_duration = Gauge::new(
            "herakles_proc_power_scrape_duration_seconds",
            "Time spent serving /metrics request (reading from cache)",
        )?;
        let tick_duration = Gauge::new(
            "herakles_proc_power_tick_duration_seconds",
            "Time spent in the last sampling tick",
        )?;
        let tick = Gauge::new(
            "herakles_proc_power_tick",
            "Number of the last completed sampling tick",
        )?;
        let tracked_uids = Gauge::new(
            "herakles_proc_power_tracked_uids",
            "Number of UIDs with a power estimate in the last tick",
        )?;
        let registry_uid_entries = Gauge::new(
            "herakles_proc_power_registry_uid_entries",
            "Processes in the PID to UID cache",
        )?;
        let registry_times_entries = Gauge::new(
            "herakles_proc_power_registry_times_entries",
            "Processes in the per-PID CPU times cache",
        )?;

        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(tick.clone()))?;
        registry.register(Box::new(tracked_uids.clone()))?;
        registry.register(Box::new(registry_uid_entries.clone()))?;
        registry.register(Box::new(registry_times_entries.clone()))?;

        Ok(Self {
            scrape_duration,
            tick_duration,
            tick,
            tracked_uids,
            registry_uid_entries,
            registry_times_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herakles_proc_power_exporter::cpu::CpuSample;
    use herakles_proc_power_exporter::{Component, PowerEstimate, Sample, Uid};
    use prometheus::{Encoder, TextEncoder};
    use std::sync::Arc;
    use std::time::Duration;

    fn cpu_estimate(uid: Uid, milliwatts: f64) -> PowerEstimate {
        PowerEstimate {
            component: Component::Cpu,
            uid,
            milliwatts,
            sample: Sample::Cpu(CpuSample {
                usr_perc: 20.0,
                sys_perc: 5.0,
                freqs: Arc::from(vec![300.0, 960.0]),
                solo_freq: None,
            }),
        }
    }

    fn encode(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_report_becomes_labelled_series() {
        let registry = Registry::new();
        let metrics = PowerMetrics::new(&registry).unwrap();
        let report = TickReport {
            tick: 4,
            timestamp: Utc::now(),
            duration: Duration::from_millis(3),
            estimates: vec![cpu_estimate(Uid::ALL, 900.0), cpu_estimate(Uid(10061), 250.0)],
        };

        metrics.set_from_report(&report);
        let text = encode(&registry);

        assert!(text.contains(r#"herakles_proc_power_milliwatts{component="CPU",uid="ALL"} 900"#));
        assert!(text.contains(r#"herakles_proc_power_milliwatts{component="CPU",uid="10061"} 250"#));
        assert!(text.contains(r#"metric="freq1",uid="ALL"} 960"#));
        // no per-core frequencies for app scopes
        assert!(!text.contains(r#"metric="freq0",uid="10061""#));
        assert!(text.contains(r#"herakles_proc_power_uid_total_milliwatts{uid="10061"} 250"#));
    }

    #[test]
    fn test_reset_drops_vanished_uids() {
        let registry = Registry::new();
        let metrics = PowerMetrics::new(&registry).unwrap();
        let mut report = TickReport {
            tick: 1,
            timestamp: Utc::now(),
            duration: Duration::ZERO,
            estimates: vec![cpu_estimate(Uid(10061), 250.0)],
        };
        metrics.set_from_report(&report);

        report.estimates = vec![cpu_estimate(Uid(10077), 10.0)];
        metrics.reset();
        metrics.set_from_report(&report);

        let text = encode(&registry);
        assert!(!text.contains("10061"));
        assert!(text.contains("10077"));
    }
}
