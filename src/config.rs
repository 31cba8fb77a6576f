//! YAML configuration with environment overrides.
//!
//! Mirrors the `hdds-router`/`hdds-persistence` convention: a plain
//! `serde`-deserializable struct, a fluent `ConfigBuilder` for tests and the
//! CLI-args-only path, and a `validate()` that both startup and hot-reload
//! call before accepting a new snapshot.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, mirroring spec §6's sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub influxdb: InfluxDbConfig,
    #[serde(default)]
    pub matter: MatterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    pub url: String,
    pub token: String,
    pub organization: String,
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatterConfig {
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_readings_channel_size")]
    pub readings_channel_size: usize,
}

impl Default for MatterConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: default_discovery_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            service_type: default_service_type(),
            domain: default_domain(),
            readings_channel_size: default_readings_channel_size(),
        }
    }
}

fn default_discovery_interval_secs() -> u64 {
    300
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_service_type() -> String {
    "_matter._tcp".to_string()
}
fn default_domain() -> String {
    "local.".to_string()
}
fn default_readings_channel_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    /// Map the configured level onto a level `tracing`'s `EnvFilter`
    /// understands. `tracing` has no `fatal`/`panic` levels, so both map onto
    /// its most severe level, `error`; `warning` maps onto `warn`. Every
    /// other accepted value already matches a `tracing` level name verbatim.
    pub fn tracing_level(&self) -> &'static str {
        match self.level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" | "warning" => "warn",
            "error" | "fatal" | "panic" => "error",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: String,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            max_size_bytes: default_max_size_bytes(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

fn default_cache_directory() -> String {
    "/var/cache/powerlogd".to_string()
}
fn default_max_size_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_max_age_secs() -> u64 {
    86_400
}

impl Config {
    /// Load from a YAML file, apply environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the environment-variable overrides listed in spec §6. Checked
    /// after the file is parsed, before validation.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("INFLUXDB_URL") {
            self.influxdb.url = v;
        }
        if let Ok(v) = std::env::var("INFLUXDB_TOKEN") {
            self.influxdb.token = v;
        }
        if let Ok(v) = std::env::var("INFLUXDB_ORG") {
            self.influxdb.organization = v;
        }
        if let Ok(v) = std::env::var("INFLUXDB_BUCKET") {
            self.influxdb.bucket = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("MATTER_DISCOVERY_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.matter.discovery_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("MATTER_POLL_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.matter.poll_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SLACK_WEBHOOK_URL") {
            self.notifications.slack_webhook_url = Some(v);
        }
        if let Ok(v) = std::env::var("CACHE_DIRECTORY") {
            self.cache.directory = v;
        }
    }

    /// Validate all invariants named in spec §6. Called at startup and on
    /// every hot-reload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.influxdb.url.is_empty() {
            return Err(ConfigError::Invalid("influxdb.url is required".into()));
        }
        if self.influxdb.token.len() < 8 {
            return Err(ConfigError::Invalid(
                "influxdb.token must be at least 8 characters".into(),
            ));
        }
        if self.influxdb.organization.is_empty() {
            return Err(ConfigError::Invalid(
                "influxdb.organization is required".into(),
            ));
        }
        if self.influxdb.bucket.is_empty() {
            return Err(ConfigError::Invalid("influxdb.bucket is required".into()));
        }
        validate_influx_url(&self.influxdb.url)?;

        let m = &self.matter;
        if !(1..=86_400).contains(&m.discovery_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "matter.discovery_interval_secs must be in 1..=86400, got {}",
                m.discovery_interval_secs
            )));
        }
        if !(1..=3_600).contains(&m.poll_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "matter.poll_interval_secs must be in 1..=3600, got {}",
                m.poll_interval_secs
            )));
        }
        if m.discovery_interval_secs < m.poll_interval_secs {
            return Err(ConfigError::Invalid(
                "matter.discovery_interval_secs must be >= matter.poll_interval_secs".into(),
            ));
        }
        if !(1..=10_000).contains(&m.readings_channel_size) {
            return Err(ConfigError::Invalid(format!(
                "matter.readings_channel_size must be in 1..=10000, got {}",
                m.readings_channel_size
            )));
        }

        let level = self.logging.level.to_lowercase();
        let valid_levels = [
            "trace", "debug", "info", "warn", "warning", "error", "fatal", "panic",
        ];
        if !valid_levels.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.matter.discovery_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.matter.poll_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cache.max_age_secs)
    }

    /// Create a fluent builder seeded with defaults, for tests and the
    /// CLI-args-only code path.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Enforces the URL security law: non-loopback, non-private hosts must use
/// `https`.
fn validate_influx_url(url: &str) -> Result<(), ConfigError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| ConfigError::Invalid(format!("influxdb.url is not a valid URL: {url}")))?;

    if scheme.eq_ignore_ascii_case("https") {
        return Ok(());
    }
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(ConfigError::Invalid(format!(
            "influxdb.url must use http or https, got scheme {scheme:?}"
        )));
    }

    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .rsplit_once('@')
        .map(|(_, h)| h)
        .unwrap_or(rest);
    let host = host.split(':').next().unwrap_or(host);

    if is_loopback_or_private_host(host) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "influxdb.url must use https for non-loopback/private-network host {host:?}"
        )))
    }
}

fn is_loopback_or_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.octets()[0..2] == [169, 254]
        }
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

/// Fluent builder for tests and the CLI-args-only startup path.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    influxdb: Option<InfluxDbConfig>,
    matter: Option<MatterConfig>,
    logging: Option<LoggingConfig>,
    notifications: Option<NotificationsConfig>,
    cache: Option<CacheConfig>,
}

impl ConfigBuilder {
    pub fn influxdb(mut self, url: impl Into<String>, token: impl Into<String>, org: impl Into<String>, bucket: impl Into<String>) -> Self {
        self.influxdb = Some(InfluxDbConfig {
            url: url.into(),
            token: token.into(),
            organization: org.into(),
            bucket: bucket.into(),
        });
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        let mut m = self.matter.unwrap_or_default();
        m.poll_interval_secs = secs;
        self.matter = Some(m);
        self
    }

    pub fn discovery_interval_secs(mut self, secs: u64) -> Self {
        let mut m = self.matter.unwrap_or_default();
        m.discovery_interval_secs = secs;
        self.matter = Some(m);
        self
    }

    pub fn cache_directory(mut self, dir: impl Into<String>) -> Self {
        let mut c = self.cache.unwrap_or_default();
        c.directory = dir.into();
        self.cache = Some(c);
        self
    }

    pub fn cache_max_size_bytes(mut self, bytes: u64) -> Self {
        let mut c = self.cache.unwrap_or_default();
        c.max_size_bytes = bytes;
        self.cache = Some(c);
        self
    }

    pub fn cache_max_age_secs(mut self, secs: u64) -> Self {
        let mut c = self.cache.unwrap_or_default();
        c.max_age_secs = secs;
        self.cache = Some(c);
        self
    }

    pub fn slack_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.notifications = Some(NotificationsConfig {
            slack_webhook_url: Some(url.into()),
        });
        self
    }

    pub fn build(self) -> Config {
        Config {
            influxdb: self.influxdb.unwrap_or(InfluxDbConfig {
                url: "https://localhost:8086".to_string(),
                token: "placeholder-token".to_string(),
                organization: "org".to_string(),
                bucket: "bucket".to_string(),
            }),
            matter: self.matter.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
            notifications: self.notifications.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_yaml() -> &'static str {
        r#"
influxdb:
  url: "https://influx.example.com:8086"
  token: "supersecrettoken"
  organization: "acme"
  bucket: "power"
matter:
  poll_interval_secs: 10
  discovery_interval_secs: 60
cache:
  directory: "/tmp/powerlogd-cache"
  max_size_bytes: 1048576
  max_age_secs: 3600
"#
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let config: Config = serde_yaml::from_str(valid_yaml()).unwrap();
        config.validate().expect("valid config");
        assert_eq!(config.matter.poll_interval_secs, 10);
        assert_eq!(config.matter.service_type, "_matter._tcp");
    }

    #[test]
    fn rejects_short_token() {
        let config = Config::builder()
            .influxdb("https://localhost:8086", "short", "org", "bucket")
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_discovery_interval_below_poll_interval() {
        let config = Config::builder()
            .influxdb("https://localhost:8086", "12345678", "org", "bucket")
            .discovery_interval_secs(5)
            .poll_interval_secs(30)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_http_for_public_host() {
        let config = Config::builder()
            .influxdb("http://influx.example.com:8086", "12345678", "org", "bucket")
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn allows_http_for_loopback_host() {
        let config = Config::builder()
            .influxdb("http://127.0.0.1:8086", "12345678", "org", "bucket")
            .build();
        config.validate().expect("loopback http allowed");
    }

    #[test]
    fn allows_http_for_private_network_host() {
        let config = Config::builder()
            .influxdb("http://10.0.0.5:8086", "12345678", "org", "bucket")
            .build();
        config.validate().expect("private network http allowed");
    }

    #[test]
    fn allows_https_for_public_host() {
        let config = Config::builder()
            .influxdb("https://influx.example.com:8086", "12345678", "org", "bucket")
            .build();
        config.validate().expect("https public host allowed");
    }

    #[test]
    fn env_overrides_apply_before_validation() {
        let mut config = Config::builder()
            .influxdb("https://localhost:8086", "12345678", "org", "bucket")
            .build();
        std::env::set_var("INFLUXDB_BUCKET", "overridden-bucket");
        config.apply_env_overrides();
        std::env::remove_var("INFLUXDB_BUCKET");
        assert_eq!(config.influxdb.bucket, "overridden-bucket");
    }

    #[test]
    fn accepts_fatal_and_panic_log_levels() {
        for level in ["fatal", "panic"] {
            let config = Config::builder()
                .influxdb("https://localhost:8086", "12345678", "org", "bucket")
                .build();
            let mut config = config;
            config.logging.level = level.to_string();
            config.validate().expect("fatal/panic must validate per spec.md §6");
        }
    }

    #[test]
    fn tracing_level_maps_fatal_and_panic_to_error() {
        let mut logging = LoggingConfig::default();
        for level in ["fatal", "panic", "Fatal", "PANIC"] {
            logging.level = level.to_string();
            assert_eq!(logging.tracing_level(), "error");
        }
        logging.level = "warning".to_string();
        assert_eq!(logging.tracing_level(), "warn");
    }

    #[test]
    fn matter_interval_env_overrides_use_spec_names() {
        let mut config = Config::builder()
            .influxdb("https://localhost:8086", "12345678", "org", "bucket")
            .build();
        std::env::set_var("MATTER_DISCOVERY_INTERVAL", "120");
        std::env::set_var("MATTER_POLL_INTERVAL", "15");
        config.apply_env_overrides();
        std::env::remove_var("MATTER_DISCOVERY_INTERVAL");
        std::env::remove_var("MATTER_POLL_INTERVAL");
        assert_eq!(config.matter.discovery_interval_secs, 120);
        assert_eq!(config.matter.poll_interval_secs, 15);
    }
}
