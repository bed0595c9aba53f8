// herakles-proc-power-exporter - version 0.1.0
// Per-UID CPU and Wifi power estimation exporter with tracing logging
use axum::{routing::get, Router};
use clap::Parser;
use herakles_proc_power_exporter::coefficients;
use prometheus::Registry;
use std::{
    net::SocketAddr,
    sync::{Arc, RwLock as StdRwLock},
};
use tokio::{
    net::TcpListener,
    signal,
    sync::{watch, Notify},
    time::Duration,
};
use tracing::{debug, error, info, warn, Level};

mod cache;
mod cli;
mod commands;
mod config;
mod handlers;
mod health_stats;
mod metrics;
mod pipeline;
mod state;

use cache::{CacheSink, ReportCache};
use cli::{Args, Commands, LogLevel};
use config::{
    resolve_config, show_config, validate_effective_config, Config, DEFAULT_BIND_ADDR,
    DEFAULT_PORT, DEFAULT_PROFILE,
};
use handlers::{doc_handler, health_handler, metrics_handler};
use health_stats::HealthStats;
use metrics::{PowerMetrics, TelemetryMetrics};
use pipeline::{build_pipeline, make_reader, prime_registry, spawn_refreshers};
use state::AppState;

/// Initializes tracing logging subsystem with configured log level
fn setup_logging(config: &Config, args: &Args) {
    // an explicit CLI level wins over the config file
    let level_name = match (&args.log_level, config.log_level.as_deref()) {
        (LogLevel::Info, Some(cfg)) => cfg.to_ascii_lowercase(),
        (cli, _) => format!("{:?}", cli).to_ascii_lowercase(),
    };

    let log_level = match level_name.as_str() {
        "off" | "error" => Level::ERROR, // Off not fully supported, use ERROR as minimal
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    info!("Logging initialized with level: {}", level_name);
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// -------------------------------------------------------------------
/// MAIN APPLICATION ENTRY POINT
/// -------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.show_user_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        if args.show_config {
            return show_config(&config, args.config_format, false);
        }

        if args.show_user_config {
            return show_config(&config, args.config_format, true);
        }
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        // profile listing and config generation work without a valid config
        match command {
            Commands::Profiles { verbose, name } => {
                return commands::command_profiles(*verbose, name.clone());
            }
            Commands::Config {
                output,
                format,
                commented,
            } => return commands::command_config(output.clone(), *format, *commented),
            _ => {}
        }

        let config = resolve_config(&args)?;
        if let Err(e) = validate_effective_config(&config) {
            eprintln!("❌ Configuration invalid: {}", e);
            std::process::exit(1);
        }

        return match command {
            Commands::Check { cpu, wifi, all } => {
                commands::command_check(*cpu, *wifi, *all, &config)
            }
            Commands::Sample {
                iterations,
                interval_ms,
                verbose,
                format,
            } => {
                setup_logging(&config, &args);
                commands::command_sample(*iterations, *interval_ms, *verbose, *format, &config)
                    .await
            }
            Commands::Profiles { .. } | Commands::Config { .. } => Ok(()),
        };
    }

    // Load configuration for main server mode
    let config = resolve_config(&args)?;

    // Validate config before starting exporter
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    // Setup logging subsystem first to enable proper logging
    setup_logging(&config, &args);

    info!("Starting herakles-proc-power-exporter");
    debug!("Available power profiles: {:?}", coefficients::profile_names());

    // Determine bind ip and port from effective config
    let bind_ip_str = config.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    // Configure parallel processing thread pool if specified
    if let Some(threads) = config.parallelism {
        if threads > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .unwrap_or_else(|e| error!("Failed to set rayon thread pool: {}", e));
            debug!("Rayon thread pool configured with {} threads", threads);
        }
    }

    // Initialize Prometheus metrics registry
    let registry = Registry::new();
    debug!("Prometheus registry initialized");

    let metrics = PowerMetrics::new(&registry)?;
    let telemetry = if config.enable_telemetry.unwrap_or(true) {
        Some(TelemetryMetrics::new(&registry)?)
    } else {
        None
    };
    debug!("All metrics registered successfully");

    // Build counter source, process registry, engines and scheduler
    let pipeline = build_pipeline(&config)?;
    let profile = profile_label(&config);

    // Perform initial registry population before the first tick
    info!("Performing initial process registry refresh");
    let mut initial_reader = make_reader(&config, &pipeline.source)?;
    if let Err(e) = prime_registry(&pipeline.registry, &mut initial_reader).await {
        warn!("Initial registry refresh failed: {:#}", e);
    } else {
        info!("Initial registry refresh completed successfully");
    }
    initial_reader.shutdown().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refreshers = spawn_refreshers(&config, &pipeline.source, &pipeline.registry, &shutdown_rx)?;

    let health_stats = Arc::new(HealthStats::new());
    let cache = Arc::new(StdRwLock::new(ReportCache::default()));
    let cache_ready = Arc::new(Notify::new());

    // Create shared application state
    let state = Arc::new(AppState {
        registry,
        metrics,
        telemetry,
        cache: cache.clone(),
        cache_ready: cache_ready.clone(),
        process_registry: pipeline.registry.clone(),
        config: Arc::new(config.clone()),
        health_stats: health_stats.clone(),
        profile,
    });

    // Start background sampling task
    let period = Duration::from_millis(config.tick_interval_ms());
    let sink = CacheSink::new(cache, health_stats, cache_ready);
    let sampler = tokio::spawn(pipeline.scheduler.run(period, sink, shutdown_rx));

    // Configure HTTP server routes and start listening
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;

    let mut app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/doc", get(doc_handler));

    // Conditionally add health endpoint
    if config.enable_health.unwrap_or(true) {
        app = app.route("/health", get(health_handler));
    }

    let app = app.with_state(state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!(
        "herakles-proc-power-exporter listening on http://{}:{}",
        bind_ip_str, port
    );

    // Start HTTP server with graceful shutdown capability
    let server = axum::serve(listener, app);

    let server_result = tokio::select! {
        result = server => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, exiting...");
            Ok(())
        }
    };

    // Cleanup: stop sampling and refreshers, let shell readers exit
    if shutdown_tx.send(true).is_err() {
        debug!("All background tasks already stopped");
    }
    if let Err(e) = sampler.await {
        warn!("Sampling task ended abnormally: {}", e);
    }
    for handle in refreshers {
        if let Err(e) = handle.await {
            warn!("Registry refresher ended abnormally: {}", e);
        }
    }

    if let Err(e) = server_result {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("herakles-proc-power-exporter stopped gracefully");
    Ok(())
}

/// Display name of the configured calibration table.
fn profile_label(config: &Config) -> String {
    match &config.coefficients_file {
        Some(path) => path.display().to_string(),
        None => config
            .device_profile
            .clone()
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
    }
}
