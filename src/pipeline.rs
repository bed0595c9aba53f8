//! Wiring of counter source, process registry, engines and scheduler from
//! the effective configuration.

use anyhow::Context;
use herakles_proc_power_exporter::counters::{CounterSource, FsCounterSource};
use herakles_proc_power_exporter::registry::{
    refresh_once, run_refresher, CachedRegistry, ProcfsReader, RefreshKind, RegistryReader,
    ShellReader,
};
use herakles_proc_power_exporter::wifi::DEFAULT_LINK_SPEED_REFRESH_TICKS;
use herakles_proc_power_exporter::{
    CpuAttributionEngine, IterationScheduler, PowerModel, WifiAttributionEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, DEFAULT_SHELL_COMMAND, DEFAULT_UID_REFRESH_MS};

/// Everything the sampling loop needs, built once at startup.
pub struct Pipeline {
    pub source: Arc<FsCounterSource>,
    pub registry: Arc<CachedRegistry>,
    pub scheduler: IterationScheduler,
}

pub fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let table = Arc::new(
        config
            .coefficient_table()
            .context("failed to load power profile")?,
    );
    info!(
        "Using power profile '{}' ({} frequency steps, {} link speeds)",
        table.name,
        table.cpu_freqs.len(),
        table.wifi_link_speeds.len()
    );

    let source = Arc::new(FsCounterSource::new(config.counter_root()));
    let dyn_source: Arc<dyn CounterSource> = source.clone();
    let paths = config.counter_paths();
    let registry = Arc::new(CachedRegistry::new(config.max_processes()));
    let model = PowerModel::new(table.clone());

    let mut scheduler = IterationScheduler::new(model.clone());

    if config.enable_cpu.unwrap_or(true) {
        let mut engine = CpuAttributionEngine::new(dyn_source.clone(), registry.clone(), paths.clone());
        if config.enable_solo_prediction.unwrap_or(true) {
            engine = engine.with_solo_prediction(model);
        }
        scheduler = scheduler.with_engine(engine);
        debug!("CPU engine enabled");
    }

    if config.enable_wifi.unwrap_or(true) {
        let ticks = config
            .link_speed_refresh_ticks
            .unwrap_or(DEFAULT_LINK_SPEED_REFRESH_TICKS);
        let engine = WifiAttributionEngine::new(dyn_source, paths, table).with_link_speed_refresh(ticks);
        scheduler = scheduler.with_engine(engine);
        debug!("Wifi engine enabled on {}", config.counter_paths().wifi_interface);
    }

    Ok(Pipeline {
        source,
        registry,
        scheduler,
    })
}

/// Creates a registry reader for the configured backend.
pub fn make_reader(
    config: &Config,
    source: &Arc<FsCounterSource>,
) -> anyhow::Result<RegistryReader> {
    let paths = config.counter_paths();
    match config.registry_backend() {
        "shell" => {
            let shell = config.shell_command.as_deref().unwrap_or(DEFAULT_SHELL_COMMAND);
            let proc_dir = source.resolve(&paths.proc_dir);
            let reader = ShellReader::spawn(shell, &proc_dir)
                .with_context(|| format!("failed to start shell registry reader '{}'", shell))?;
            Ok(RegistryReader::Shell(reader))
        }
        _ => {
            let dyn_source: Arc<dyn CounterSource> = source.clone();
            Ok(RegistryReader::Procfs(ProcfsReader::new(dyn_source, paths)))
        }
    }
}

/// Fills both registry caches once so the first ticks see processes.
pub async fn prime_registry(
    registry: &CachedRegistry,
    reader: &mut RegistryReader,
) -> anyhow::Result<()> {
    for kind in [RefreshKind::Uids, RefreshKind::Times] {
        let entries = refresh_once(registry, reader, kind)
            .await
            .with_context(|| format!("initial {} refresh failed", kind.name()))?;
        debug!("Primed registry {} cache with {} entries", kind.name(), entries);
    }
    Ok(())
}

/// Starts one refresher task per cache. Each task owns its own reader.
pub fn spawn_refreshers(
    config: &Config,
    source: &Arc<FsCounterSource>,
    registry: &Arc<CachedRegistry>,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let tick = config.tick_interval_ms();
    let schedule = [
        (RefreshKind::Uids, config.uid_refresh_ms.unwrap_or(DEFAULT_UID_REFRESH_MS)),
        // per-tick deltas need times at least as fresh as the tick
        (RefreshKind::Times, config.times_refresh_ms.unwrap_or(tick).min(tick)),
    ];

    let mut handles = Vec::with_capacity(schedule.len());
    for (kind, period_ms) in schedule {
        let reader = make_reader(config, source)?;
        if config.times_refresh_ms.map_or(false, |ms| ms > tick) && kind == RefreshKind::Times {
            warn!(
                "times_refresh_ms is longer than the tick interval, using {}ms",
                tick
            );
        }
        handles.push(tokio::spawn(run_refresher(
            registry.clone(),
            reader,
            kind,
            Duration::from_millis(period_ms),
            shutdown.clone(),
        )));
    }
    Ok(handles)
}
