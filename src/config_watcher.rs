//! Config file watcher (C8): watches the config file for changes, debounces
//! bursts of filesystem events, then re-loads, re-validates, and publishes
//! a fresh snapshot. Only `matter.poll_interval_secs` is live-reloadable;
//! every other field requires a restart to take effect (spec §4.8).

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::{Config, ConfigError};

/// Settle window after the first filesystem event before re-reading the
/// file, so a burst of writes (e.g. an editor's atomic-rename save) is
/// collapsed into a single reload.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ConfigWatchError {
    #[error("failed to start filesystem watcher: {0}")]
    Watch(#[from] notify::Error),
    #[error("reload failed, keeping previous configuration: {0}")]
    Reload(#[from] ConfigError),
}

/// Watches `path` and publishes validated `Config` snapshots on `watch::Receiver`.
/// The initial snapshot is the config passed to `spawn`.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path`. `initial` becomes the first value observable
    /// on the returned receiver.
    pub fn spawn(
        path: impl AsRef<Path>,
        initial: Config,
    ) -> Result<(Self, watch::Receiver<Config>), ConfigWatchError> {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = watch::channel(initial);
        let (events_tx, mut events_rx) = mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if res.is_ok() {
                let _ = events_tx.try_send(());
            }
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        let watch_path = path.clone();
        tokio::spawn(async move {
            while events_rx.recv().await.is_some() {
                // Drain any further events received during the debounce
                // window so a burst only triggers one reload.
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                while events_rx.try_recv().is_ok() {}

                match reload(&watch_path) {
                    Ok(config) => {
                        tracing::info!(path = %watch_path.display(), "configuration reloaded");
                        if tx.send(config).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %watch_path.display(), error = %e, "configuration reload failed, keeping previous snapshot");
                    }
                }
            }
        });

        Ok((
            Self {
                _watcher: watcher,
            },
            rx,
        ))
    }
}

fn reload(path: &PathBuf) -> Result<Config, ConfigWatchError> {
    Config::load(path).map_err(ConfigWatchError::Reload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(file: &mut NamedTempFile, poll_interval_secs: u64) {
        let yaml = format!(
            r#"
influxdb:
  url: "https://localhost:8086"
  token: "supersecrettoken"
  organization: "org"
  bucket: "bucket"
matter:
  poll_interval_secs: {poll_interval_secs}
  discovery_interval_secs: 300
"#
        );
        file.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().seek(std::io::SeekFrom::Start(0)).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[tokio::test]
    async fn reload_publishes_updated_snapshot_after_file_write() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, 30);
        let initial = Config::load(file.path()).unwrap();

        let (_watcher, mut rx) = ConfigWatcher::spawn(file.path(), initial).unwrap();
        assert_eq!(rx.borrow().matter.poll_interval_secs, 30);

        write_config(&mut file, 45);

        let changed = tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("reload observed before timeout");
        assert!(changed.is_ok());
        assert_eq!(rx.borrow().matter.poll_interval_secs, 45);
    }
}
