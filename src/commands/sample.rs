//! `sample` subcommand: runs a few ticks against the live counters and
//! prints the estimates as flat records.

use herakles_proc_power_exporter::registry::RefreshKind;
use herakles_proc_power_exporter::{registry, TickReport};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::cli::ConfigFormat;
use crate::config::{Config, DEFAULT_UID_REFRESH_MS};
use crate::pipeline::{build_pipeline, make_reader, prime_registry};

/// One output line: a single value of one scope in one tick.
#[derive(Debug, Serialize)]
struct SampleRow {
    tick: u64,
    timestamp: String,
    component: &'static str,
    uid: String,
    metric: String,
    value: f64,
}

#[derive(Serialize)]
struct SampleOutput {
    records: Vec<SampleRow>,
}

fn report_rows(report: &TickReport, verbose: bool) -> Vec<SampleRow> {
    let timestamp = report.timestamp.to_rfc3339();
    let mut rows = Vec::new();

    for estimate in &report.estimates {
        let row = |metric: String, value: f64| SampleRow {
            tick: report.tick,
            timestamp: timestamp.clone(),
            component: estimate.component.name(),
            uid: estimate.uid.to_string(),
            metric,
            value,
        };

        rows.push(row("power".to_string(), estimate.milliwatts));
        if verbose {
            rows.extend(
                estimate
                    .records()
                    .into_iter()
                    .map(|record| row(record.metric.to_string(), record.value)),
            );
        }
    }
    rows
}

fn render_rows(rows: Vec<SampleRow>, format: ConfigFormat) -> Result<String, Box<dyn std::error::Error>> {
    let output = SampleOutput { records: rows };
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&output)?,
        ConfigFormat::Toml => toml::to_string_pretty(&output)?,
        ConfigFormat::Yaml => serde_yaml::to_string(&output)?,
    })
}

/// Ticks between two pid→uid refreshes, at least one.
fn uid_refresh_every(interval_ms: u64, uid_refresh_ms: u64) -> usize {
    (uid_refresh_ms / interval_ms.max(1)).max(1) as usize
}

/// Tests power sampling
pub async fn command_sample(
    iterations: usize,
    interval_ms: u64,
    verbose: bool,
    format: ConfigFormat,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 Herakles Process Power Exporter - Sample Mode");
    println!("=================================================");

    let mut pipeline = build_pipeline(config)?;
    let mut reader = make_reader(config, &pipeline.source)?;
    prime_registry(&pipeline.registry, &mut reader).await?;

    let stats = pipeline.registry.stats();
    println!(
        "   📁 Registry: {} processes with UID, {} with CPU times ({} backend)",
        stats.uid_entries,
        stats.times_entries,
        reader.name()
    );

    // The first tick only records baselines.
    pipeline.scheduler.run_once();
    let interval = Duration::from_millis(interval_ms.max(1));
    let uid_every = uid_refresh_every(
        interval_ms,
        config.uid_refresh_ms.unwrap_or(DEFAULT_UID_REFRESH_MS),
    );

    for iteration in 1..=iterations {
        tokio::time::sleep(interval).await;
        // new processes need a uid before their times count
        if iteration % uid_every == 0 {
            registry::refresh_once(&pipeline.registry, &mut reader, RefreshKind::Uids).await?;
        }
        registry::refresh_once(&pipeline.registry, &mut reader, RefreshKind::Times).await?;

        let start = Instant::now();
        let report = pipeline.scheduler.run_once();
        println!("\n🔄 Iteration {}/{} (tick {}):", iteration, iterations, report.tick);
        println!(
            "   ⏱️  Tick duration: {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        println!(
            "   📊 {} estimates for {} UIDs",
            report.estimates.len(),
            report.uid_count()
        );

        let rows = report_rows(&report, verbose);
        if !rows.is_empty() {
            println!("{}", render_rows(rows, format)?);
        }
    }

    reader.shutdown().await;
    println!("\n✅ Sampling completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herakles_proc_power_exporter::wifi::WifiSample;
    use herakles_proc_power_exporter::{Component, PowerEstimate, Sample, Uid};

    fn report() -> TickReport {
        TickReport {
            tick: 7,
            timestamp: Utc::now(),
            duration: Duration::ZERO,
            estimates: vec![PowerEstimate {
                component: Component::Wifi,
                uid: Uid(10061),
                milliwatts: 0.0,
                sample: Sample::Wifi(WifiSample::off()),
            }],
        }
    }

    #[test]
    fn test_rows_include_records_only_when_verbose() {
        let report = report();
        let short = report_rows(&report, false);
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].metric, "power");
        assert_eq!(short[0].uid, "10061");

        let long = report_rows(&report, true);
        assert_eq!(long.len(), 2);
        assert_eq!(long[1].metric, "on");
        assert_eq!(long[1].component, "Wifi");
    }

    #[test]
    fn test_uid_refresh_cadence() {
        assert_eq!(uid_refresh_every(1000, 5000), 5);
        assert_eq!(uid_refresh_every(1000, 500), 1);
        assert_eq!(uid_refresh_every(0, 5000), 5000);
        assert_eq!(uid_refresh_every(2000, 5000), 2);
    }

    #[test]
    fn test_rows_render_in_every_format() {
        for format in [ConfigFormat::Yaml, ConfigFormat::Json, ConfigFormat::Toml] {
            let text = render_rows(report_rows(&report(), true), format).unwrap();
            assert!(text.contains("10061"));
        }
    }
}
