//! InfluxDB v2 Line Protocol sink (C9).
//!
//! The line-writing half is carried over near verbatim from the reference
//! codebase's own Influx sink crate, which already encodes every escaping
//! rule from the Line Protocol spec. What's new here is the HTTP transport:
//! a `reqwest` client that POSTs batches to `/api/v2/write` and probes
//! `/health` for the readiness endpoint.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::InfluxDbConfig;
use crate::device::PowerReading;

const MEASUREMENT: &str = "power_consumption";

#[derive(Debug, Error)]
pub enum InfluxError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
    #[error("request to InfluxDB failed: {0}")]
    Request(String),
    #[error("InfluxDB returned {status}: {body}")]
    Response { status: u16, body: String },
}

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{v}"),
            FieldValue::Integer(v) => format!("{v}i"),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            }
            FieldValue::Boolean(v) => if *v { "true" } else { "false" }.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// Accumulates points and renders them to Line Protocol on flush.
#[derive(Default)]
pub struct LineProtocolWriter {
    buffer: Vec<String>,
}

impl LineProtocolWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// Panics if `fields` is empty (InfluxDB requires at least one field).
    pub fn write_point(
        &mut self,
        measurement: &str,
        tags: &[(&str, &str)],
        fields: &[(&str, FieldValue)],
        timestamp_ns: u64,
    ) {
        assert!(!fields.is_empty(), "InfluxDB requires at least one field");

        let mut line = escape_measurement(measurement);

        let mut sorted_tags: Vec<_> = tags.iter().collect();
        sorted_tags.sort_by_key(|(k, _)| *k);
        for (key, value) in &sorted_tags {
            line.push(',');
            line.push_str(&escape_tag_key(key));
            line.push('=');
            line.push_str(&escape_tag_value(value));
        }

        line.push(' ');
        for (i, (key, value)) in fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_field_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&timestamp_ns.to_string());

        self.buffer.push(line);
    }

    pub fn flush(&mut self) -> Vec<String> {
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_tag_value(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_field_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Escape a string destined for a Flux query literal: backslash first,
/// then double-quote, so the probe query can never break out of its
/// string literal even if a device name contains quotes. Null bytes have
/// no valid escape in a Flux string literal and are stripped outright.
fn escape_flux_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\0', "")
}

fn reading_to_line(reading: &PowerReading) -> String {
    let mut writer = LineProtocolWriter::new();
    let timestamp_ns = reading
        .timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    writer.write_point(
        MEASUREMENT,
        &[
            ("device_id", reading.device_id.as_str()),
            ("device_name", reading.device_name.as_str()),
        ],
        &[
            ("power_w", FieldValue::Float(reading.power_w)),
            ("voltage_v", FieldValue::Float(reading.voltage_v)),
            ("current_a", FieldValue::Float(reading.current_a)),
            ("energy_kwh", FieldValue::Float(reading.energy_kwh)),
        ],
        timestamp_ns,
    );
    writer.flush().remove(0)
}

/// HTTP client for InfluxDB v2: batched writes plus a `/health` probe.
pub struct InfluxSink {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxDbConfig) -> Result<Self, InfluxError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| InfluxError::ClientBuild(e.to_string()))?;

        Ok(Self {
            http,
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            org: config.organization.clone(),
            bucket: config.bucket.clone(),
        })
    }

    /// Write one batch of readings in a single request. Empty batches are a
    /// no-op.
    pub async fn write_batch(&self, readings: &[PowerReading]) -> Result<(), InfluxError> {
        if readings.is_empty() {
            return Ok(());
        }

        let body = readings
            .iter()
            .map(reading_to_line)
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .http
            .post(format!(
                "{}/api/v2/write?org={}&bucket={}&precision=ns",
                self.url,
                urlencode(&self.org),
                urlencode(&self.bucket)
            ))
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| InfluxError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(InfluxError::Response { status, body });
        }
        Ok(())
    }

    /// Force any buffered, unsent writes to drain. This sink posts each
    /// batch synchronously and holds no internal write buffer, so there is
    /// nothing to drain; the method exists to satisfy the storage façade's
    /// `Flush` contract and gives a real client room to batch internally.
    pub async fn flush(&self) -> Result<(), InfluxError> {
        Ok(())
    }

    /// Probe `/health`, bounded by `timeout`, for the readiness endpoint.
    pub async fn health(&self, timeout: Duration) -> Result<(), InfluxError> {
        let response = self
            .http
            .get(format!("{}/health", self.url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| InfluxError::Request(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(InfluxError::Response { status, body })
        }
    }

    /// Build the Flux query used to fetch a device's latest recorded point,
    /// for diagnostics and manual verification.
    pub fn latest_reading_query(&self, device_id: &str) -> String {
        let device_id = escape_flux_string(device_id);
        format!(
            "from(bucket: \"{}\") |> range(start: -1h) |> filter(fn: (r) => r._measurement == \"{}\" and r.device_id == \"{}\") |> last()",
            self.bucket, MEASUREMENT, device_id
        )
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_formats_match_line_protocol() {
        assert_eq!(FieldValue::Float(3.15).to_line_protocol(), "3.15");
        assert_eq!(FieldValue::Integer(42).to_line_protocol(), "42i");
        assert_eq!(
            FieldValue::String("say \"hi\"".into()).to_line_protocol(),
            "\"say \\\"hi\\\"\""
        );
        assert_eq!(FieldValue::Boolean(true).to_line_protocol(), "true");
    }

    #[test]
    fn write_point_sorts_tags_and_escapes_specials() {
        let mut writer = LineProtocolWriter::new();
        writer.write_point(
            "my measurement",
            &[("tag key", "tag,value")],
            &[("field=key", FieldValue::String("hello \"world\"".to_string()))],
            3_000_000_000,
        );
        let lines = writer.flush();
        assert_eq!(
            lines[0],
            "my\\ measurement,tag\\ key=tag\\,value field\\=key=\"hello \\\"world\\\"\" 3000000000"
        );
    }

    #[test]
    fn reading_to_line_includes_device_tags_and_fields() {
        let reading = PowerReading {
            device_id: "ABCD".into(),
            device_name: "Plug".into(),
            timestamp: UNIX_EPOCH + Duration::from_secs(1),
            power_w: 10.5,
            voltage_v: 120.0,
            current_a: 0.0875,
            energy_kwh: 1.2,
        };
        let line = reading_to_line(&reading);
        assert!(line.starts_with("power_consumption,device_id=ABCD,device_name=Plug "));
        assert!(line.contains("power_w=10.5"));
        assert!(line.ends_with(" 1000000000"));
    }

    #[test]
    fn flux_query_escapes_embedded_quotes() {
        let config = InfluxDbConfig {
            url: "https://localhost:8086".into(),
            token: "t".into(),
            organization: "org".into(),
            bucket: "power".into(),
        };
        let sink = InfluxSink::new(&config).unwrap();
        let query = sink.latest_reading_query("weird\"device");
        assert!(query.contains("weird\\\"device"));
        assert!(!query.contains("weird\"device\""));
    }

    #[test]
    fn flux_query_strips_null_bytes() {
        let config = InfluxDbConfig {
            url: "https://localhost:8086".into(),
            token: "t".into(),
            organization: "org".into(),
            bucket: "power".into(),
        };
        let sink = InfluxSink::new(&config).unwrap();
        let query = sink.latest_reading_query("dev\0ice");
        assert!(!query.contains('\0'));
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("my org"), "my%20org");
        assert_eq!(urlencode("safe-bucket_1.0"), "safe-bucket_1.0");
    }
}
