//! Entry point: CLI parsing, startup ordering, and the signal-driven
//! lifecycle (spec §4.6, §4.8).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use powerlogd::breaker::BreakerConfig;
use powerlogd::cache::OverflowCache;
use powerlogd::config::Config;
use powerlogd::config_watcher::ConfigWatcher;
use powerlogd::http::{build_router, loopback_addr};
use powerlogd::influx::InfluxSink;
use powerlogd::metrics::Metrics;
use powerlogd::monitor::{PowerMonitor, SimulatedReader};
use powerlogd::notifier::{Notifier, Severity};
use powerlogd::registry::Registry;
use powerlogd::scanner::MdnsScanner;
use powerlogd::storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "powerlogd", about = "Discovers, polls, and relays Matter power-measurement readings to InfluxDB")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Port the metrics/health HTTP surface binds on, loopback only.
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    /// Probe a running instance's /health endpoint and exit.
    #[arg(long)]
    health_check: bool,

    /// Load and validate the configuration file, then exit.
    #[arg(long)]
    validate_config: bool,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.health_check {
        return run_health_check(cli.metrics_port).await;
    }

    let mut config = Config::load(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    if cli.validate_config {
        println!("configuration at {} is valid", cli.config.display());
        return Ok(());
    }

    init_tracing(config.logging.tracing_level());
    tracing::info!(config_path = %cli.config.display(), "starting powerlogd");

    run(config, cli).await
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_health_check(metrics_port: u16) -> anyhow::Result<()> {
    let url = format!("http://127.0.0.1:{metrics_port}/health");
    let response = reqwest::get(&url).await?;
    if response.status().is_success() {
        println!("healthy");
        Ok(())
    } else {
        anyhow::bail!("unhealthy: HTTP {}", response.status());
    }
}

async fn run(config: Config, cli: Cli) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let notifier = Arc::new(Notifier::new(config.notifications.slack_webhook_url.clone()));

    let sink = Arc::new(InfluxSink::new(&config.influxdb)?);
    sink.health(Duration::from_secs(5))
        .await
        .map_err(|e| anyhow::anyhow!("InfluxDB health check failed at startup: {e}"))?;

    let cache = Arc::new(OverflowCache::open(
        config.cache.directory.clone(),
        config.cache.max_size_bytes,
        config.max_age(),
    )?);
    let storage = Storage::new(sink, BreakerConfig::default(), cache, metrics.clone(), notifier.clone());
    let replay_loop = storage.spawn_background_loop();

    let registry = Registry::new();
    let scanner = Arc::new(MdnsScanner::new(
        registry.clone(),
        config.matter.service_type.clone(),
        config.matter.domain.clone(),
    )?);

    let reader = Arc::new(SimulatedReader);
    let (monitor, mut readings_rx) = PowerMonitor::new(
        reader,
        registry.clone(),
        metrics.clone(),
        config.poll_interval(),
        config.matter.readings_channel_size,
    );

    let http_storage = storage.clone();
    let router = build_router(metrics.clone(), http_storage);
    let addr = loopback_addr(cli.metrics_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP surface listening");
    let http_shutdown = tokio_util::sync::CancellationToken::new();
    let http_shutdown_for_server = http_shutdown.clone();
    let mut http_server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { http_shutdown_for_server.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server exited");
        }
    });

    // Register signal handlers before starting any further background work
    // so a signal delivered during the rest of startup is not missed.
    let mut signals = Signals::register()?;

    let (config_watcher, mut config_rx) = ConfigWatcher::spawn(&cli.config, config.clone())?;
    let monitor_for_watch = monitor.clone();
    tokio::spawn(async move {
        while config_rx.changed().await.is_ok() {
            let new_interval = config_rx.borrow().poll_interval();
            monitor_for_watch.set_poll_interval(new_interval);
        }
    });

    let consumer_storage = storage.clone();
    let consumer_metrics = metrics.clone();
    let consumer = tokio::spawn(async move {
        while let Some(reading) = readings_rx.recv().await {
            consumer_metrics.readings_total.inc();
            consumer_metrics.observe_device_reading(
                &reading.device_id,
                &reading.device_name,
                reading.power_w,
                reading.voltage_v,
                reading.current_a,
            );
            if let Err(e) = consumer_storage.write_reading(reading).await {
                consumer_metrics.readings_errors.inc();
                tracing::warn!(error = %e, "failed to persist reading");
            }
        }
    });

    let discovery_metrics = metrics.clone();
    let discovery_monitor = monitor.clone();
    let discovery_scanner = scanner.clone();
    let discovery_notifier = notifier.clone();
    let discovery_interval = config.discovery_interval();
    let discovery = tokio::spawn(async move {
        loop {
            let started = Instant::now();
            match discovery_scanner.discover(Duration::from_secs(10)).await {
                Ok(_found) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "discovery scan failed");
                    let notifier = discovery_notifier.clone();
                    let message = e.to_string();
                    tokio::spawn(async move {
                        notifier
                            .send_alert("mDNS discovery scan failed", &message, Severity::Warning)
                            .await;
                    });
                }
            }
            discovery_metrics
                .discovery_duration
                .observe(started.elapsed().as_secs_f64());

            discovery_metrics
                .devices_discovered
                .set(discovery_scanner.devices().len() as f64);
            let power_devices = discovery_scanner.power_devices();
            discovery_metrics
                .power_devices_discovered
                .set(power_devices.len() as f64);

            discovery_monitor.start(power_devices).await;
            discovery_metrics
                .devices_monitored
                .set(discovery_monitor.monitored_device_count().await as f64);

            tokio::time::sleep(discovery_interval).await;
        }
    });

    signals
        .wait_for_shutdown(monitor.clone(), storage.clone(), scanner.clone())
        .await?;

    // Ordered graceful shutdown per spec §4.6: HTTP surface first (bounded,
    // so in-flight requests complete), then the monitor fleet, then the
    // config watcher, then the root cancellation, then a bounded flush.
    http_shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), &mut http_server)
        .await
        .is_err()
    {
        tracing::warn!("HTTP server did not shut down within 5s, aborting");
        http_server.abort();
    }

    monitor.stop().await;
    drop(config_watcher);

    discovery.abort();
    consumer.abort();

    match tokio::time::timeout(Duration::from_secs(10), storage.flush()).await {
        Ok(Ok(())) => tracing::info!("final storage flush completed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "final storage flush failed"),
        Err(_) => tracing::warn!("final storage flush timed out, accepting data loss beyond this bound"),
    }
    storage.close();
    let _ = replay_loop.await;

    Ok(())
}

/// Registered signal handlers, held open for the life of the process so a
/// signal delivered anywhere during startup or steady-state is captured.
#[cfg(unix)]
struct Signals {
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    sigusr1: tokio::signal::unix::Signal,
    sigusr2: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigusr2: signal(SignalKind::user_defined2())?,
        })
    }

    /// Block until a termination signal arrives, logging debug signals
    /// (hang-up, user-defined 1/2) along the way (spec §4.6).
    async fn wait_for_shutdown(
        &mut self,
        monitor: Arc<PowerMonitor>,
        storage: Arc<Storage>,
        scanner: Arc<MdnsScanner>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down gracefully");
                    break;
                }
                _ = self.sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = self.sighup.recv() => {
                    tracing::info!("received SIGHUP, configuration reload is handled by the file watcher");
                }
                _ = self.sigusr1.recv() => {
                    tracing::info!(
                        devices_known = scanner.devices().len(),
                        devices_monitored = monitor.monitored_device_count().await,
                        cache_bytes_used = storage_cache_snapshot(&storage),
                        "state dump"
                    );
                }
                _ = self.sigusr2.recv() => {
                    tracing::info!(
                        monitored_devices = monitor.monitored_device_count().await,
                        "task queue depth snapshot"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn storage_cache_snapshot(_storage: &Arc<Storage>) -> &'static str {
    "see /metrics for cache_usage_ratio"
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn wait_for_shutdown(
        &mut self,
        _monitor: Arc<PowerMonitor>,
        _storage: Arc<Storage>,
        _scanner: Arc<MdnsScanner>,
    ) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received ctrl-c, shutting down gracefully");
        Ok(())
    }
}
