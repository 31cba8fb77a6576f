//! Storage façade (C5): the single path every reading takes to InfluxDB,
//! wrapping the remote sink with a circuit breaker and an on-disk overflow
//! cache, plus a background loop that replays the cache once the remote
//! recovers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerConfig, BreakerOutcome, CircuitBreaker};
use crate::cache::{CacheError, OverflowCache};
use crate::device::{PowerReading, ReadingValidationError};
use crate::influx::{InfluxError, InfluxSink};
use crate::metrics::Metrics;
use crate::notifier::{Notifier, Severity};

/// Health-probe deadline for the background replay loop (spec §4.5).
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default interval between background health checks / replay attempts.
const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_secs(30);
/// Issue an intermediate `Flush` every this many successful replays.
const REPLAY_FLUSH_BATCH: u64 = 100;
/// Cache usage fraction at which the pressure alert fires.
const CACHE_PRESSURE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading validation failed: {0}")]
    Validation(#[from] ReadingValidationError),
    #[error("remote write failed ({remote}) and the overflow cache write also failed ({cache})")]
    Unavailable { remote: String, cache: CacheError },
    #[error("batch write failed at item {index}/{total} (device_id={device_id}): {source}")]
    Batch {
        index: usize,
        total: usize,
        device_id: String,
        #[source]
        source: Box<StorageError>,
    },
}

/// Combines a breaker-guarded remote sink with a disk-backed overflow cache.
pub struct Storage {
    sink: Arc<InfluxSink>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<OverflowCache>,
    metrics: Arc<Metrics>,
    notifier: Arc<Notifier>,
    replay_interval: Duration,
    /// Set while new writes are being diverted to the overflow cache;
    /// cleared when a replay pass completes (spec §4.5 "cache-mode").
    cache_mode: AtomicBool,
    cache_pressure_alerted: AtomicBool,
    observed_trips: AtomicU64,
    shutdown: CancellationToken,
    replay_trigger: Notify,
}

impl Storage {
    pub fn new(
        sink: Arc<InfluxSink>,
        breaker_config: BreakerConfig,
        cache: Arc<OverflowCache>,
        metrics: Arc<Metrics>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        Self::with_replay_interval(sink, breaker_config, cache, metrics, notifier, DEFAULT_REPLAY_INTERVAL)
    }

    /// Same as `new`, but with an explicit background health-probe/replay
    /// tick interval instead of the 30s default (spec §4.5 "overridable").
    pub fn with_replay_interval(
        sink: Arc<InfluxSink>,
        breaker_config: BreakerConfig,
        cache: Arc<OverflowCache>,
        metrics: Arc<Metrics>,
        notifier: Arc<Notifier>,
        replay_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            cache,
            metrics,
            notifier,
            replay_interval,
            cache_mode: AtomicBool::new(false),
            cache_pressure_alerted: AtomicBool::new(false),
            observed_trips: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            replay_trigger: Notify::new(),
        })
    }

    /// Validate, then attempt the remote write through the breaker; divert
    /// to the overflow cache on breaker-open or remote failure. Succeeds
    /// whenever either the remote write or the cache write succeeded.
    pub async fn write_reading(&self, reading: PowerReading) -> Result<(), StorageError> {
        reading.validate()?;

        let sink = self.sink.clone();
        let batch = vec![reading.clone()];
        let result = self
            .breaker
            .call(|| async move { sink.write_batch(&batch).await })
            .await;

        match result {
            Ok(()) => {
                self.metrics.remote_writes_total.inc();
                Ok(())
            }
            Err(outcome) => {
                self.metrics.remote_writes_errors.inc();
                let total_trips = self.breaker.trip_count();
                let previous_trips = self.observed_trips.swap(total_trips, Ordering::SeqCst);
                if total_trips > previous_trips {
                    self.metrics.breaker_trips.inc_by(total_trips - previous_trips);
                }
                let remote_description = match &outcome {
                    BreakerOutcome::Open(e) => e.to_string(),
                    BreakerOutcome::Inner(e) => e.to_string(),
                };
                self.enter_cache_mode();

                match self.cache.write(&reading) {
                    Ok(_path) => {
                        self.check_cache_pressure();
                        match &outcome {
                            BreakerOutcome::Open(_) => {
                                tracing::debug!("breaker open, diverted reading to overflow cache");
                            }
                            BreakerOutcome::Inner(e) => {
                                tracing::warn!(error = %e, "remote write failed, diverted reading to overflow cache");
                            }
                        }
                        Ok(())
                    }
                    Err(cache_err) => Err(StorageError::Unavailable {
                        remote: remote_description,
                        cache: cache_err,
                    }),
                }
            }
        }
    }

    /// Write each reading through `write_reading` in order; stop and report
    /// the first failure, identifying it as `i/N` with its `device_id`.
    pub async fn write_batch(&self, readings: &[PowerReading]) -> Result<(), StorageError> {
        let total = readings.len();
        for (index, reading) in readings.iter().enumerate() {
            if let Err(source) = self.write_reading(reading.clone()).await {
                return Err(StorageError::Batch {
                    index,
                    total,
                    device_id: reading.device_id.clone(),
                    source: Box::new(source),
                });
            }
        }
        Ok(())
    }

    /// Mark cache-mode active; on the false-to-true transition, fire the
    /// `sink-down` alert (best-effort, bounded).
    fn enter_cache_mode(&self) {
        if !self.cache_mode.swap(true, Ordering::SeqCst) {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                notifier
                    .send_alert(
                        "InfluxDB sink unreachable",
                        "Readings are being diverted to the on-disk overflow cache",
                        Severity::Danger,
                    )
                    .await;
            });
        }
    }

    fn check_cache_pressure(&self) {
        let ratio = self.cache.usage_ratio();
        self.metrics.cache_usage_ratio.set(ratio);
        if ratio > CACHE_PRESSURE_THRESHOLD {
            // Only alert once per crossing, not on every write past the line.
            if !self.cache_pressure_alerted.swap(true, Ordering::SeqCst) {
                let notifier = self.notifier.clone();
                let percent = (ratio * 100.0).round();
                tokio::spawn(async move {
                    notifier
                        .send_alert(
                            "Overflow cache under pressure",
                            &format!("Cache is {percent:.0}% full"),
                            Severity::Warning,
                        )
                        .await;
                });
            }
        } else {
            self.cache_pressure_alerted.store(false, Ordering::SeqCst);
        }
    }

    /// Readiness: healthy iff the remote sink responds within the health
    /// probe deadline, independent of breaker state.
    pub async fn health(&self) -> Result<(), InfluxError> {
        self.sink.health(HEALTH_PROBE_TIMEOUT).await
    }

    /// Replay every cached reading, oldest first, bypassing the breaker so
    /// recovery makes progress independently of the breaker's own state
    /// (spec §4.5, §9). Per-item failures are logged and do not abort the
    /// pass. Returns `(replayed, failed)`.
    async fn replay(&self) -> Result<(u64, u64), CacheError> {
        let entries = self.cache.list()?;
        let mut replayed = 0u64;
        let mut failed = 0u64;

        for (path, record) in entries {
            let reading = record.into_power_reading();
            match self.sink.write_batch(std::slice::from_ref(&reading)).await {
                Ok(()) => {
                    self.cache.delete(&path)?;
                    replayed += 1;
                    self.metrics.readings_replayed.inc();
                    if replayed % REPLAY_FLUSH_BATCH == 0 {
                        let _ = self.sink.flush().await;
                    }
                }
                Err(e) => {
                    failed += 1;
                    tracing::debug!(error = %e, "replay item failed, will retry next pass");
                }
            }
        }

        let _ = self.sink.flush().await;
        self.metrics.cache_usage_ratio.set(self.cache.usage_ratio());
        tracing::info!(replayed, failed, "cache replay pass complete");
        Ok((replayed, failed))
    }

    /// Background task: on a timer, check cache-mode, probe remote health,
    /// and replay the cache while healthy. Runs until `close()` is called.
    pub fn spawn_background_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = storage.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(storage.replay_interval) => {}
                    _ = storage.replay_trigger.notified() => {}
                }

                if !storage.cache_mode.load(Ordering::SeqCst) {
                    continue;
                }

                if storage.health().await.is_err() {
                    tracing::debug!("cache replay skipped, remote sink still unhealthy");
                    continue;
                }

                match storage.replay().await {
                    Ok(_) => {
                        if storage.cache_mode.swap(false, Ordering::SeqCst) {
                            let notifier = storage.notifier.clone();
                            tokio::spawn(async move {
                                notifier
                                    .send_alert(
                                        "InfluxDB sink recovered",
                                        "Overflow cache replay completed",
                                        Severity::Good,
                                    )
                                    .await;
                            });
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "cache replay pass failed"),
                }
            }
        })
    }

    /// Wake the background loop immediately instead of waiting for the
    /// next tick, used by the config watcher and tests.
    pub fn trigger_replay(&self) {
        self.replay_trigger.notify_one();
    }

    /// Force the remote client to drain any buffered, unsent writes. Bounded
    /// by the caller (shutdown applies a 10s deadline and accepts data loss
    /// beyond it, per spec §4.6).
    pub async fn flush(&self) -> Result<(), InfluxError> {
        self.sink.flush().await
    }

    /// Cancel the background health/replay task and wait for it; idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
