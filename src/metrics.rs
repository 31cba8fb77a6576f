//! Prometheus metrics registry (C10).
//!
//! Names and help text follow the convention the reference codebase's own
//! mobility metrics module uses (`<prefix>_<subject>_total` for counters,
//! plain nouns for gauges); the actual collection here goes through the
//! `prometheus` crate's `Registry` rather than hand-formatted text, since
//! this agent exposes a real `/metrics` scrape endpoint.

use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder, Encoder,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encode(String),
}

/// Every counter/gauge/histogram this agent exposes, per spec §6.
pub struct Metrics {
    registry: Registry,

    pub discovery_duration: Histogram,
    pub reading_duration: Histogram,

    pub readings_total: IntCounter,
    pub readings_errors: IntCounter,
    pub remote_writes_total: IntCounter,
    pub remote_writes_errors: IntCounter,
    pub poll_successes: IntCounter,
    pub poll_failures: IntCounter,
    pub breaker_trips: IntCounter,
    pub readings_replayed: IntCounter,

    pub devices_discovered: Gauge,
    pub power_devices_discovered: Gauge,
    pub devices_monitored: Gauge,
    pub cache_usage_ratio: Gauge,

    /// Per-device instantaneous readings, labelled `{device_id, device_name}`.
    pub device_power: GaugeVec,
    pub device_voltage: GaugeVec,
    pub device_current: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let discovery_duration = Histogram::with_opts(HistogramOpts::new(
            "powerlogd_discovery_duration_seconds",
            "Duration of each mDNS discovery scan",
        ))?;
        let reading_duration = Histogram::with_opts(HistogramOpts::new(
            "powerlogd_reading_duration_seconds",
            "Duration of each per-device power read",
        ))?;

        let readings_total = IntCounter::new(
            "powerlogd_readings_total",
            "Total number of readings produced by the monitor fleet",
        )?;
        let readings_errors = IntCounter::new(
            "powerlogd_readings_errors_total",
            "Total number of readings rejected at the storage boundary",
        )?;
        let remote_writes_total = IntCounter::new(
            "powerlogd_remote_writes_total",
            "Total number of readings successfully written to InfluxDB",
        )?;
        let remote_writes_errors = IntCounter::new(
            "powerlogd_remote_writes_errors_total",
            "Total number of remote writes that failed or were refused by the breaker",
        )?;
        let poll_successes = IntCounter::new(
            "powerlogd_poll_successes_total",
            "Total number of successful device poll attempts",
        )?;
        let poll_failures = IntCounter::new(
            "powerlogd_poll_failures_total",
            "Total number of failed device poll attempts",
        )?;
        let breaker_trips = IntCounter::new(
            "powerlogd_breaker_trips_total",
            "Total number of times the InfluxDB circuit breaker has opened",
        )?;
        let readings_replayed = IntCounter::new(
            "powerlogd_readings_replayed_total",
            "Total number of cached readings successfully replayed to InfluxDB",
        )?;

        let devices_discovered = Gauge::new(
            "powerlogd_devices_discovered",
            "Current number of devices known to the registry",
        )?;
        let power_devices_discovered = Gauge::new(
            "powerlogd_power_devices_discovered",
            "Current number of known devices that are power-capable",
        )?;
        let devices_monitored = Gauge::new(
            "powerlogd_devices_monitored",
            "Current number of devices with an active polling task",
        )?;
        let cache_usage_ratio = Gauge::new(
            "powerlogd_cache_usage_ratio",
            "Fraction of the overflow cache size cap currently in use",
        )?;

        let device_power = GaugeVec::new(
            Opts::new("powerlogd_device_power_watts", "Latest power reading per device"),
            &["device_id", "device_name"],
        )?;
        let device_voltage = GaugeVec::new(
            Opts::new("powerlogd_device_voltage_volts", "Latest voltage reading per device"),
            &["device_id", "device_name"],
        )?;
        let device_current = GaugeVec::new(
            Opts::new("powerlogd_device_current_amps", "Latest current reading per device"),
            &["device_id", "device_name"],
        )?;

        registry.register(Box::new(discovery_duration.clone()))?;
        registry.register(Box::new(reading_duration.clone()))?;
        registry.register(Box::new(readings_total.clone()))?;
        registry.register(Box::new(readings_errors.clone()))?;
        registry.register(Box::new(remote_writes_total.clone()))?;
        registry.register(Box::new(remote_writes_errors.clone()))?;
        registry.register(Box::new(poll_successes.clone()))?;
        registry.register(Box::new(poll_failures.clone()))?;
        registry.register(Box::new(breaker_trips.clone()))?;
        registry.register(Box::new(readings_replayed.clone()))?;
        registry.register(Box::new(devices_discovered.clone()))?;
        registry.register(Box::new(power_devices_discovered.clone()))?;
        registry.register(Box::new(devices_monitored.clone()))?;
        registry.register(Box::new(cache_usage_ratio.clone()))?;
        registry.register(Box::new(device_power.clone()))?;
        registry.register(Box::new(device_voltage.clone()))?;
        registry.register(Box::new(device_current.clone()))?;

        Ok(Self {
            registry,
            discovery_duration,
            reading_duration,
            readings_total,
            readings_errors,
            remote_writes_total,
            remote_writes_errors,
            poll_successes,
            poll_failures,
            breaker_trips,
            readings_replayed,
            devices_discovered,
            power_devices_discovered,
            devices_monitored,
            cache_usage_ratio,
            device_power,
            device_voltage,
            device_current,
        })
    }

    /// Publish the three per-device gauges for one reading, per spec §4.6's
    /// data-writer task.
    pub fn observe_device_reading(&self, device_id: &str, device_name: &str, power: f64, voltage: f64, current: f64) {
        let labels: &[&str] = &[device_id, device_name];
        self.device_power.with_label_values(labels).set(power);
        self.device_voltage.with_label_values(labels).set(voltage);
        self.device_current.with_label_values(labels).set(current);
    }

    /// Render the registry in Prometheus text exposition format, for the
    /// `/metrics` HTTP handler.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}
