//! TOML file configuration source.
//!
//! The file is re-read on a fixed cadence; every key whose value differs
//! from the last accepted file is published as a change. A file that fails
//! to parse or validate is logged and the previous values stay in effect.

use keyring_autolock_core::config::ConfigSource;
use keyring_autolock_core::{AutolockConfig, Collection, ConfigChange, ConfigError, ConfigKey, ConfigValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Collections served by the in-memory demo keyring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemoConfig {
    #[serde(default)]
    pub collections: Vec<Collection>,
}

/// Contents of the daemon's configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonFile {
    #[serde(flatten)]
    pub autolock: AutolockConfig,
    #[serde(default, skip_serializing_if = "DemoConfig::is_empty")]
    pub demo: DemoConfig,
}

impl DemoConfig {
    fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl DaemonFile {
    /// Read the file, falling back to defaults when it does not exist
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: Self =
            toml_dep::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.autolock.validate()?;
        Ok(file)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml_dep::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

struct Inner {
    path: PathBuf,
    current: Mutex<DaemonFile>,
    changes: broadcast::Sender<ConfigChange>,
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, DaemonFile> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reload(&self) -> Result<Vec<ConfigChange>, ConfigError> {
        let file = DaemonFile::read(&self.path)?;

        let changes: Vec<ConfigChange> = {
            let mut current = self.current();
            let changes = ConfigKey::ALL
                .into_iter()
                .filter(|&key| current.autolock.get(key) != file.autolock.get(key))
                .map(|key| ConfigChange {
                    key,
                    value: file.autolock.get(key),
                })
                .collect();
            *current = file;
            changes
        };

        for change in &changes {
            info!(key = %change.key, "Configuration changed");
            // No subscribers is not an error
            let _ = self.changes.send(change.clone());
        }
        Ok(changes)
    }
}

/// Configuration source backed by a TOML file
pub struct FileConfigSource {
    inner: Arc<Inner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl FileConfigSource {
    /// Load the file at `path`; a missing file yields the defaults
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let file = DaemonFile::read(&path)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                current: Mutex::new(file),
                changes,
            }),
            watcher: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Collections declared for the demo keyring
    pub fn demo_collections(&self) -> Vec<Collection> {
        self.inner.current().demo.collections.clone()
    }

    /// Re-read the file now and publish the keys that changed
    pub fn reload(&self) -> Result<Vec<ConfigChange>, ConfigError> {
        self.inner.reload()
    }

    /// Re-read the file every `poll` until this source is dropped
    pub fn watch(&self, poll: Duration) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            // The first tick completes immediately and the file was just read
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match inner.reload() {
                    Ok(changes) if changes.is_empty() => debug!("Configuration unchanged"),
                    Ok(_) => {}
                    Err(e) => warn!(path = ?inner.path, error = %e, "Keeping previous configuration"),
                }
            }
        });

        let mut watcher = self.watcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = watcher.replace(task) {
            previous.abort();
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn get(&self, key: ConfigKey) -> Result<ConfigValue, ConfigError> {
        Ok(self.inner.current().autolock.get(key))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.inner.changes.subscribe()
    }

    fn snapshot(&self) -> Result<AutolockConfig, ConfigError> {
        Ok(self.inner.current().autolock.clone())
    }
}

impl Drop for FileConfigSource {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = watcher.take() {
            task.abort();
        }
    }
}
