//! Concrete mDNS discovery (C1, C12): wraps `mdns_sd::ServiceDaemon`.
//!
//! The `mdns-sd` receiver is synchronous, so a dedicated thread bridges it
//! onto the async world — the same bridging idiom the nearest discovery
//! client in the reference codebase family uses for its own synchronous
//! resolver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::device::Device;
use crate::registry::Registry;

/// Channel capacity for the bridge between the synchronous mdns-sd receiver
/// and the async consumer task. Must stay above `10` per spec §4.1 so the
/// resolver never experiences back-pressure from a slow consumer.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Poll interval for the bridge thread's `recv_timeout`, bounding how
/// quickly it notices the deadline has passed.
const BRIDGE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to construct mDNS resolver: {0}")]
    ResolverInit(String),
    #[error("failed to start mDNS browse: {0}")]
    Browse(String),
}

/// Owns the device registry and performs bounded mDNS browses against it.
pub struct MdnsScanner {
    daemon: ServiceDaemon,
    registry: Arc<Registry>,
    service_type: String,
    domain: String,
}

impl MdnsScanner {
    pub fn new(
        registry: Arc<Registry>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::ResolverInit(e.to_string()))?;
        Ok(Self {
            daemon,
            registry,
            service_type: service_type.into(),
            domain: domain.into(),
        })
    }

    fn full_service_type(&self) -> String {
        let service_type = self.service_type.trim_end_matches('.');
        let domain = self.domain.trim_end_matches('.');
        format!("{service_type}.{domain}.")
    }

    /// Snapshot of every device ever discovered this process.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.devices()
    }

    /// Subset that are power-capable.
    pub fn power_devices(&self) -> Vec<Device> {
        self.registry.power_devices()
    }

    pub fn device_by_id(&self, id: &str) -> Option<Device> {
        self.registry.device_by_id(id)
    }

    /// Perform one bounded mDNS browse. Returns only devices newly seen or
    /// updated during this scan, in discovery order.
    pub async fn discover(&self, deadline: Duration) -> Result<Vec<Device>, DiscoveryError> {
        let full_type = self.full_service_type();
        let receiver = self
            .daemon
            .browse(&full_type)
            .map_err(|e| DiscoveryError::Browse(e.to_string()))?;

        let (tx, mut rx) = mpsc::channel::<ServiceEvent>(EVENT_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_bridge = stop.clone();

        let bridge = std::thread::Builder::new()
            .name("powerlogd-mdns-bridge".to_string())
            .spawn(move || {
                while !stop_for_bridge.load(Ordering::Relaxed) {
                    match receiver.recv_timeout(BRIDGE_POLL_INTERVAL) {
                        Ok(event) => {
                            if tx.blocking_send(event).is_err() {
                                break;
                            }
                        }
                        Err(_) => continue,
                    }
                }
            })
            .expect("spawn mdns bridge thread");

        let new_or_updated = Arc::new(Mutex::new(Vec::new()));
        let new_or_updated_consumer = new_or_updated.clone();
        let registry = self.registry.clone();

        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let ServiceEvent::ServiceResolved(info) = event {
                    match parse_service_info(&info) {
                        Some(device) => {
                            tracing::info!(
                                device_id = %device.device_id,
                                name = %device.name,
                                address = %device.network_address,
                                "discovered device"
                            );
                            registry.upsert(device.clone());
                            new_or_updated_consumer.lock().push(device);
                        }
                        None => {
                            tracing::debug!(fullname = %info.fullname, "skipped unparseable service entry");
                        }
                    }
                }
            }
        });

        tokio::time::sleep(deadline).await;
        stop.store(true, Ordering::Relaxed);
        let _ = self.daemon.stop_browse(&full_type);

        // Wait for the bridge thread and the consumer task to fully drain
        // before returning, per spec §4.1.
        if let Err(e) = tokio::task::spawn_blocking(move || bridge.join()).await {
            tracing::warn!(error = %e, "mdns bridge thread join task failed");
        }
        let _ = consumer.await;

        let devices = Arc::try_unwrap(new_or_updated)
            .map(Mutex::into_inner)
            .unwrap_or_default();
        Ok(devices)
    }
}

/// Parse a resolved mDNS service entry into a `Device`. IPv4 is preferred;
/// IPv6 is used only if no IPv4 address is present. An entry with neither is
/// skipped.
fn parse_service_info(info: &ResolvedService) -> Option<Device> {
    let address = info
        .addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| info.addresses.iter().next())?
        .to_ip_addr();

    let tx_record: HashMap<String, String> = info
        .txt_properties
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    let name = tx_record
        .get("N")
        .cloned()
        .unwrap_or_else(|| info.fullname.clone());

    Some(Device::new(
        name,
        address.to_string(),
        info.port,
        tx_record,
        info.fullname.clone(),
    ))
}
