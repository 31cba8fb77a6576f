//! Bounded on-disk overflow cache (C4): durable holding area for readings
//! that cannot currently reach InfluxDB, replayed once the remote recovers.
//!
//! Each reading is written as a self-describing JSON file named
//! `cache_<nanos-since-epoch>_<device-id-or-hash>.json`, per spec §4.4/§6.
//! A single `parking_lot::Mutex` serializes writes/deletes and tracks the
//! running size total, mirroring the single-lock style the rest of this
//! crate uses for small shared state.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::PowerReading;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize cache record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache is full: {used} / {max} bytes")]
    Full { used: u64, max: u64 },
}

/// A reading as it sits on disk, self-describing so a fresh process can
/// replay it without any other context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedReading {
    pub device_id: String,
    pub device_name: String,
    pub power_w: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub energy_kwh: f64,
    #[serde(with = "system_time_nanos")]
    pub timestamp: SystemTime,
    #[serde(with = "system_time_nanos")]
    pub cached_at: SystemTime,
}

impl From<&PowerReading> for CachedReading {
    fn from(r: &PowerReading) -> Self {
        Self {
            device_id: r.device_id.clone(),
            device_name: r.device_name.clone(),
            power_w: r.power_w,
            voltage_v: r.voltage_v,
            current_a: r.current_a,
            energy_kwh: r.energy_kwh,
            timestamp: r.timestamp,
            cached_at: SystemTime::now(),
        }
    }
}

impl CachedReading {
    pub fn into_power_reading(self) -> PowerReading {
        PowerReading {
            device_id: self.device_id,
            device_name: self.device_name,
            timestamp: self.timestamp,
            power_w: self.power_w,
            voltage_v: self.voltage_v,
            current_a: self.current_a,
            energy_kwh: self.energy_kwh,
        }
    }
}

mod system_time_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?
            .as_nanos();
        s.serialize_u128(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let nanos = u128::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_nanos(nanos as u64))
    }
}

struct Inner {
    used_bytes: u64,
}

/// Durable overflow store for readings the storage façade cannot currently
/// deliver to InfluxDB.
pub struct OverflowCache {
    directory: PathBuf,
    max_size_bytes: u64,
    max_age: Duration,
    inner: Mutex<Inner>,
}

impl OverflowCache {
    /// Create the cache directory if needed (mode 0750) and recompute the
    /// running size total from whatever is already on disk.
    pub fn open(
        directory: impl Into<PathBuf>,
        max_size_bytes: u64,
        max_age: Duration,
    ) -> Result<Self, CacheError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|source| CacheError::Io {
            path: directory.display().to_string(),
            source,
        })?;
        set_dir_permissions(&directory)?;

        let mut used_bytes = 0u64;
        for entry in std::fs::read_dir(&directory).map_err(|source| CacheError::Io {
            path: directory.display().to_string(),
            source,
        })? {
            let entry = entry.map_err(|source| CacheError::Io {
                path: directory.display().to_string(),
                source,
            })?;
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    used_bytes += meta.len();
                }
            }
        }

        let cache = Self {
            directory,
            max_size_bytes,
            max_age,
            inner: Mutex::new(Inner { used_bytes }),
        };
        // Spec: entries older than max_age are deleted by construction, not
        // left for the first background tick to discover.
        let removed = cache.cleanup_old()?;
        if removed > 0 {
            tracing::info!(removed, "purged expired overflow cache entries at startup");
        }
        Ok(cache)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    /// Fraction of the size cap currently in use, for the cache-pressure
    /// alert in the storage façade (spec §4.5).
    pub fn usage_ratio(&self) -> f64 {
        if self.max_size_bytes == 0 {
            return 1.0;
        }
        self.size() as f64 / self.max_size_bytes as f64
    }

    /// Persist `reading` to disk. Refuses when the cache is already full.
    pub fn write(&self, reading: &PowerReading) -> Result<PathBuf, CacheError> {
        let record = CachedReading::from(reading);
        let bytes = serde_json::to_vec(&record)?;

        let mut inner = self.inner.lock();
        let projected = inner.used_bytes + bytes.len() as u64;
        if projected > self.max_size_bytes {
            return Err(CacheError::Full {
                used: inner.used_bytes,
                max: self.max_size_bytes,
            });
        }

        let path = self.directory.join(file_name(&record));
        std::fs::write(&path, &bytes).map_err(|source| CacheError::Io {
            path: path.display().to_string(),
            source,
        })?;
        set_file_permissions(&path)?;

        inner.used_bytes = projected;
        Ok(path)
    }

    /// All cache entries, oldest `cached_at` first, ready for sequential
    /// replay.
    pub fn list(&self) -> Result<Vec<(PathBuf, CachedReading)>, CacheError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.directory).map_err(|source| CacheError::Io {
            path: self.directory.display().to_string(),
            source,
        })? {
            let entry = entry.map_err(|source| CacheError::Io {
                path: self.directory.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|source| CacheError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let record: CachedReading = serde_json::from_str(&content)?;
            entries.push((path, record));
        }
        entries.sort_by_key(|(_, r)| r.cached_at);
        Ok(entries)
    }

    /// Remove one cache file and account for its size.
    pub fn delete(&self, path: &Path) -> Result<(), CacheError> {
        let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        std::fs::remove_file(path).map_err(|source| CacheError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut inner = self.inner.lock();
        inner.used_bytes = inner.used_bytes.saturating_sub(len);
        Ok(())
    }

    /// Delete every entry older than `max_age`. Returns how many were
    /// removed.
    pub fn cleanup_old(&self) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for (path, record) in self.list()? {
            let age = now.duration_since(record.cached_at).unwrap_or_default();
            if age > self.max_age {
                self.delete(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// `cache_<nanos>_<device-id-or-hash>.json`. A device_id is used verbatim
/// only when it's already filesystem-safe; otherwise it's hashed, since
/// TXT record content is attacker/vendor controlled and must never be
/// trusted as a path component.
fn file_name(record: &CachedReading) -> String {
    let nanos = record
        .cached_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let safe_id = filesystem_safe_component(&record.device_id);
    format!("cache_{nanos}_{safe_id}.json")
}

fn filesystem_safe_component(device_id: &str) -> String {
    let is_safe = !device_id.is_empty()
        && device_id.len() <= 64
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':');

    if is_safe {
        device_id.replace(':', "-")
    } else {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        format!("h{:016x}", hasher.finish())
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750)).map_err(|source| {
        CacheError::Io {
            path: path.display().to_string(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        CacheError::Io {
            path: path.display().to_string(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reading(device_id: &str) -> PowerReading {
        PowerReading {
            device_id: device_id.to_string(),
            device_name: "Plug".to_string(),
            timestamp: SystemTime::now(),
            power_w: 10.0,
            voltage_v: 120.0,
            current_a: 0.083,
            energy_kwh: 0.0,
        }
    }

    #[test]
    fn writes_and_lists_in_chronological_order() {
        let dir = tempdir().unwrap();
        let cache = OverflowCache::open(dir.path(), 1_000_000, Duration::from_secs(86_400)).unwrap();

        cache.write(&reading("A")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.write(&reading("B")).unwrap();

        let entries = cache.list().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.device_id, "A");
        assert_eq!(entries[1].1.device_id, "B");
        assert!(cache.size() > 0);
    }

    #[test]
    fn refuses_writes_past_size_cap() {
        let dir = tempdir().unwrap();
        let cache = OverflowCache::open(dir.path(), 10, Duration::from_secs(86_400)).unwrap();
        let result = cache.write(&reading("A"));
        assert!(matches!(result, Err(CacheError::Full { .. })));
    }

    #[test]
    fn delete_reduces_tracked_size() {
        let dir = tempdir().unwrap();
        let cache = OverflowCache::open(dir.path(), 1_000_000, Duration::from_secs(86_400)).unwrap();
        let path = cache.write(&reading("A")).unwrap();
        assert!(cache.size() > 0);
        cache.delete(&path).unwrap();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn reopening_recomputes_size_from_disk() {
        let dir = tempdir().unwrap();
        {
            let cache = OverflowCache::open(dir.path(), 1_000_000, Duration::from_secs(86_400)).unwrap();
            cache.write(&reading("A")).unwrap();
        }
        let reopened = OverflowCache::open(dir.path(), 1_000_000, Duration::from_secs(86_400)).unwrap();
        assert!(reopened.size() > 0);
        assert_eq!(reopened.list().unwrap().len(), 1);
    }

    #[test]
    fn unsafe_device_id_is_hashed_not_embedded() {
        let dir = tempdir().unwrap();
        let cache = OverflowCache::open(dir.path(), 1_000_000, Duration::from_secs(86_400)).unwrap();
        let path = cache.write(&reading("../../etc/passwd")).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains(".."));
        assert!(!name.contains('/'));
    }

    #[test]
    fn open_purges_expired_entries_on_construction() {
        let dir = tempdir().unwrap();
        {
            let cache = OverflowCache::open(dir.path(), 1_000_000, Duration::from_millis(1)).unwrap();
            cache.write(&reading("A")).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        let reopened = OverflowCache::open(dir.path(), 1_000_000, Duration::from_millis(1)).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 0);
        assert_eq!(reopened.size(), 0);
    }

    #[test]
    fn cleanup_old_removes_expired_entries_only() {
        let dir = tempdir().unwrap();
        let cache = OverflowCache::open(dir.path(), 1_000_000, Duration::from_millis(1)).unwrap();
        cache.write(&reading("A")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let removed = cache.cleanup_old().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.list().unwrap().len(), 0);
    }
}
