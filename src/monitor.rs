//! Power monitor fleet (C2): one polling task per device, independently
//! cancellable, feeding a single bounded readings channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::{Device, PowerReading};
use crate::metrics::Metrics;

/// Reads instantaneous power measurements from a device. The built-in
/// `SimulatedReader` stands in for a real Matter cluster read.
#[async_trait::async_trait]
pub trait ReadPower: Send + Sync {
    async fn read(&self, device: &Device) -> Result<RawReading, ReadError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    pub power_w: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub energy_kwh: f64,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to read device: {0}")]
pub struct ReadError(pub String);

/// Deterministic-ish simulator matching spec §4.2: power centered around
/// 10-100W, voltage around 120V +/- 1V, current derived from power/voltage,
/// with 50-250ms of injected latency to mimic a real cluster round-trip.
pub struct SimulatedReader;

#[async_trait::async_trait]
impl ReadPower for SimulatedReader {
    async fn read(&self, _device: &Device) -> Result<RawReading, ReadError> {
        let latency_ms = 50 + (fastrand::u64(..) % 201);
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        let power_w = 10.0 + fastrand::f64() * 90.0;
        let voltage_v = 120.0 + (fastrand::f64() * 2.0 - 1.0);
        let current_a = power_w / voltage_v;

        Ok(RawReading {
            power_w,
            voltage_v,
            current_a,
            energy_kwh: 0.0,
        })
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Resolves the current name for a device mid-poll, so a rename observed by
/// the scanner becomes visible on the next tick without restarting the task
/// (spec §4.2, §9 "device name staleness").
pub trait ResolveDeviceName: Send + Sync {
    fn resolve_name(&self, device_id: &str, fallback: &str) -> String;
}

impl ResolveDeviceName for crate::registry::Registry {
    fn resolve_name(&self, device_id: &str, fallback: &str) -> String {
        self.device_by_id(device_id)
            .map(|d| d.name)
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Owns one polling task per monitored device and the shared readings
/// channel they feed.
pub struct PowerMonitor {
    reader: Arc<dyn ReadPower>,
    names: Arc<dyn ResolveDeviceName>,
    metrics: Arc<Metrics>,
    poll_interval: Arc<Mutex<Duration>>,
    handles: RwLock<HashMap<String, MonitorHandle>>,
    tx: mpsc::Sender<PowerReading>,
}

impl PowerMonitor {
    /// `channel_capacity` must be >= 1; readings are dropped, not buffered
    /// indefinitely, when the consumer falls behind (spec §4.2, §5).
    pub fn new(
        reader: Arc<dyn ReadPower>,
        names: Arc<dyn ResolveDeviceName>,
        metrics: Arc<Metrics>,
        poll_interval: Duration,
        channel_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<PowerReading>) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let monitor = Arc::new(Self {
            reader,
            names,
            metrics,
            poll_interval: Arc::new(Mutex::new(poll_interval)),
            handles: RwLock::new(HashMap::new()),
            tx,
        });
        (monitor, rx)
    }

    /// Ensure a polling task exists for every device in `devices` (spec
    /// §4.2 `Start`). Devices already monitored are left untouched.
    pub async fn start(self: &Arc<Self>, devices: Vec<Device>) {
        for device in devices {
            self.start_monitoring_device(device).await;
        }
    }

    /// Start polling `device` on its own task if one isn't already running.
    /// Idempotent per `device_id`: returns `true` if a new task was started,
    /// `false` if one was already present (spec §4.2, §8).
    pub async fn start_monitoring_device(self: &Arc<Self>, device: Device) -> bool {
        let mut handles = self.handles.write().await;
        if handles.contains_key(&device.device_id) {
            return false;
        }

        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let reader = self.reader.clone();
        let names = self.names.clone();
        let metrics = self.metrics.clone();
        let poll_interval = self.poll_interval.clone();
        let tx = self.tx.clone();
        let device_id = device.device_id.clone();
        let device_id_for_task = device_id.clone();

        let join = tokio::spawn(async move {
            loop {
                let interval = *poll_interval.lock();
                tokio::select! {
                    _ = cancel_for_task.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let current_name = names.resolve_name(&device_id_for_task, &device.name);
                let started = Instant::now();
                let result = reader.read(&device).await;
                metrics
                    .reading_duration
                    .observe(started.elapsed().as_secs_f64());

                match result {
                    Ok(raw) => {
                        metrics.poll_successes.inc();
                        let reading = PowerReading {
                            device_id: device_id_for_task.clone(),
                            device_name: current_name,
                            timestamp: SystemTime::now(),
                            power_w: raw.power_w,
                            voltage_v: raw.voltage_v,
                            current_a: raw.current_a,
                            energy_kwh: raw.energy_kwh,
                        };
                        if tx.try_send(reading).is_err() {
                            tracing::warn!(
                                device_id = %device_id_for_task,
                                "readings channel full, dropping reading"
                            );
                        }
                    }
                    Err(e) => {
                        metrics.poll_failures.inc();
                        tracing::warn!(device_id = %device_id_for_task, error = %e, "poll failed");
                    }
                }
            }
        });

        handles.insert(device_id, MonitorHandle { cancel, join });
        true
    }

    /// Cancel and await the task for `device_id`, if any.
    pub async fn stop_monitoring_device(&self, device_id: &str) {
        if let Some(handle) = self.handles.write().await.remove(device_id) {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    pub async fn is_monitoring(&self, device_id: &str) -> bool {
        self.handles.read().await.contains_key(device_id)
    }

    pub async fn monitored_device_count(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Change the poll interval applied by every running and future task.
    /// Takes effect on each task's next sleep cycle.
    pub fn set_poll_interval(&self, interval: Duration) {
        *self.poll_interval.lock() = interval;
    }

    /// Cancel every monitored device's task and await them all.
    pub async fn stop(&self) {
        let mut handles = self.handles.write().await;
        for (_, handle) in handles.drain() {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device(id: &str) -> Device {
        Device::new(
            "Plug".into(),
            "10.0.0.1".into(),
            1,
            Map::from([("D".to_string(), id.to_string())]),
            "h.local.".into(),
        )
    }

    struct NoRename;
    impl ResolveDeviceName for NoRename {
        fn resolve_name(&self, _device_id: &str, fallback: &str) -> String {
            fallback.to_string()
        }
    }

    fn no_rename() -> Arc<dyn ResolveDeviceName> {
        Arc::new(NoRename)
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    struct CountingReader {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReadPower for CountingReader {
        async fn read(&self, _device: &Device) -> Result<RawReading, ReadError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(RawReading {
                power_w: 5.0,
                voltage_v: 120.0,
                current_a: 0.04,
                energy_kwh: 0.0,
            })
        }
    }

    #[tokio::test]
    async fn polls_and_emits_readings_at_interval() {
        let reader = Arc::new(CountingReader {
            count: AtomicUsize::new(0),
        });
        let (monitor, mut rx) =
            PowerMonitor::new(reader, no_rename(), metrics(), Duration::from_millis(10), 8);

        assert!(monitor.start_monitoring_device(device("A")).await);
        assert!(monitor.is_monitoring("A").await);

        let reading = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reading arrived before timeout")
            .expect("channel open");
        assert_eq!(reading.device_id, "A");

        monitor.stop().await;
        assert_eq!(monitor.monitored_device_count().await, 0);
    }

    #[tokio::test]
    async fn stop_monitoring_device_cancels_only_that_device() {
        let reader = Arc::new(SimulatedReader);
        let (monitor, _rx) =
            PowerMonitor::new(reader, no_rename(), metrics(), Duration::from_secs(60), 8);

        monitor.start_monitoring_device(device("A")).await;
        monitor.start_monitoring_device(device("B")).await;
        assert_eq!(monitor.monitored_device_count().await, 2);

        monitor.stop_monitoring_device("A").await;
        assert!(!monitor.is_monitoring("A").await);
        assert!(monitor.is_monitoring("B").await);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn start_monitoring_device_is_idempotent_until_stopped() {
        let reader = Arc::new(SimulatedReader);
        let (monitor, _rx) =
            PowerMonitor::new(reader, no_rename(), metrics(), Duration::from_secs(60), 8);

        assert!(monitor.start_monitoring_device(device("A")).await);
        assert!(!monitor.start_monitoring_device(device("A")).await);
        assert_eq!(monitor.monitored_device_count().await, 1);

        monitor.stop_monitoring_device("A").await;
        assert!(monitor.start_monitoring_device(device("A")).await);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn start_ensures_a_task_per_device_without_duplicates() {
        let reader = Arc::new(SimulatedReader);
        let (monitor, _rx) =
            PowerMonitor::new(reader, no_rename(), metrics(), Duration::from_secs(60), 8);

        monitor
            .start(vec![device("A"), device("B"), device("A")])
            .await;
        assert_eq!(monitor.monitored_device_count().await, 2);

        monitor.stop().await;
    }
}
