//! Core data model: discovered devices and the readings they produce.

use std::collections::HashMap;
use std::time::SystemTime;

/// Cluster tags that mark a device as power-capable (Electrical Measurement
/// / Electrical Power Measurement clusters), per spec §3.
const POWER_CLUSTER_TAGS: [&str; 4] = ["0B04", "B04", "0091", "91"];

/// An mDNS-discovered device. Immutable once constructed; a later discovery
/// of the same `device_id` replaces the entry wholesale rather than mutating
/// it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub network_address: String,
    pub port: u16,
    pub tx_record: HashMap<String, String>,
    pub hostname: String,
}

impl Device {
    /// Derive `device_id` from the `D` TXT record entry, falling back to
    /// `<address>:<port>` when absent or empty.
    pub fn new(
        name: String,
        network_address: String,
        port: u16,
        tx_record: HashMap<String, String>,
        hostname: String,
    ) -> Self {
        let device_id = tx_record
            .get("D")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{network_address}:{port}"));

        Self {
            device_id,
            name,
            network_address,
            port,
            tx_record,
            hostname,
        }
    }

    /// A device is power-capable iff its `C` TXT record entry contains any
    /// of the recognized Electrical Measurement cluster tags.
    pub fn is_power_capable(&self) -> bool {
        self.tx_record
            .get("C")
            .map(|clusters| {
                POWER_CLUSTER_TAGS
                    .iter()
                    .any(|tag| clusters.contains(tag))
            })
            .unwrap_or(false)
    }
}

/// One immutable tuple of instantaneous electrical measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerReading {
    pub device_id: String,
    pub device_name: String,
    pub timestamp: SystemTime,
    pub power_w: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub energy_kwh: f64,
}

/// Errors produced when a `PowerReading` fails the storage boundary's
/// validation checks (spec §4.5, §8).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadingValidationError {
    #[error("device_id must not be empty")]
    EmptyDeviceId,
    #[error("timestamp must not be the zero instant")]
    ZeroTimestamp,
    #[error("field {field} must be >= 0, got {value}")]
    NegativeField { field: &'static str, value: String },
}

impl PowerReading {
    /// Validate the invariants enforced at the storage boundary: non-empty
    /// `device_id`, a real timestamp, and non-negative numeric fields.
    pub fn validate(&self) -> Result<(), ReadingValidationError> {
        if self.device_id.is_empty() {
            return Err(ReadingValidationError::EmptyDeviceId);
        }
        if self.timestamp == SystemTime::UNIX_EPOCH {
            return Err(ReadingValidationError::ZeroTimestamp);
        }
        for (field, value) in [
            ("power_w", self.power_w),
            ("voltage_v", self.voltage_v),
            ("current_a", self.current_a),
            ("energy_kwh", self.energy_kwh),
        ] {
            if value < 0.0 {
                return Err(ReadingValidationError::NegativeField {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn device_id_prefers_txt_record_d_entry() {
        let d = Device::new(
            "Plug".into(),
            "192.168.1.10".into(),
            5540,
            tx(&[("D", "ABCD"), ("C", "0006,0B04")]),
            "plug.local.".into(),
        );
        assert_eq!(d.device_id, "ABCD");
        assert!(d.is_power_capable());
    }

    #[test]
    fn device_id_falls_back_to_address_port() {
        let d = Device::new(
            "Plug".into(),
            "192.168.1.10".into(),
            5540,
            tx(&[("C", "0006")]),
            "plug.local.".into(),
        );
        assert_eq!(d.device_id, "192.168.1.10:5540");
        assert!(!d.is_power_capable());
    }

    #[test]
    fn empty_d_entry_falls_back_to_address_port() {
        let d = Device::new(
            "Plug".into(),
            "192.168.1.10".into(),
            5540,
            tx(&[("D", "   ")]),
            "plug.local.".into(),
        );
        assert_eq!(d.device_id, "192.168.1.10:5540");
    }

    #[test]
    fn recognizes_all_power_cluster_tags() {
        for tag in ["0B04", "B04", "0091", "91"] {
            let d = Device::new(
                "Plug".into(),
                "10.0.0.1".into(),
                1,
                tx(&[("C", &format!("0006,{tag}"))]),
                "h".into(),
            );
            assert!(d.is_power_capable(), "tag {tag} should be power-capable");
        }
    }

    #[test]
    fn reading_validation_rejects_empty_device_id() {
        let r = PowerReading {
            device_id: String::new(),
            device_name: "x".into(),
            timestamp: SystemTime::now(),
            power_w: 1.0,
            voltage_v: 1.0,
            current_a: 1.0,
            energy_kwh: 0.0,
        };
        assert_eq!(r.validate(), Err(ReadingValidationError::EmptyDeviceId));
    }

    #[test]
    fn reading_validation_rejects_zero_timestamp() {
        let r = PowerReading {
            device_id: "d".into(),
            device_name: "x".into(),
            timestamp: SystemTime::UNIX_EPOCH,
            power_w: 1.0,
            voltage_v: 1.0,
            current_a: 1.0,
            energy_kwh: 0.0,
        };
        assert_eq!(r.validate(), Err(ReadingValidationError::ZeroTimestamp));
    }

    #[test]
    fn reading_validation_rejects_negative_field() {
        let r = PowerReading {
            device_id: "d".into(),
            device_name: "x".into(),
            timestamp: SystemTime::now(),
            power_w: -1.0,
            voltage_v: 1.0,
            current_a: 1.0,
            energy_kwh: 0.0,
        };
        assert!(matches!(
            r.validate(),
            Err(ReadingValidationError::NegativeField { field: "power_w", .. })
        ));
    }

    #[test]
    fn reading_validation_accepts_well_formed_reading() {
        let r = PowerReading {
            device_id: "d".into(),
            device_name: "x".into(),
            timestamp: SystemTime::now(),
            power_w: 10.0,
            voltage_v: 120.0,
            current_a: 0.083,
            energy_kwh: 0.0,
        };
        assert!(r.validate().is_ok());
    }
}
