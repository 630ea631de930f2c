//! Autolock configuration, validated deltas and configuration sources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::store::CollectionId;

/// Default polling cadence in seconds
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
/// Default grace period before locking, in seconds
pub const DEFAULT_LOCK_DELAY_SECS: u64 = 60;

pub const MIN_CHECK_INTERVAL_SECS: u64 = 1;
pub const MAX_CHECK_INTERVAL_SECS: u64 = 3600;
pub const MIN_LOCK_DELAY_SECS: u64 = 0;
pub const MAX_LOCK_DELAY_SECS: u64 = 86_400;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: ConfigKey,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Wrong value type for {key}")]
    TypeMismatch { key: ConfigKey },

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Names of the configuration keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigKey {
    #[serde(rename = "check-interval")]
    CheckInterval,
    #[serde(rename = "lock-delay")]
    LockDelay,
    #[serde(rename = "ignored-collections")]
    IgnoredCollections,
    #[serde(rename = "hide-locked")]
    HideLocked,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::CheckInterval,
        ConfigKey::LockDelay,
        ConfigKey::IgnoredCollections,
        ConfigKey::HideLocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::CheckInterval => "check-interval",
            ConfigKey::LockDelay => "lock-delay",
            ConfigKey::IgnoredCollections => "ignored-collections",
            ConfigKey::HideLocked => "hide-locked",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

/// A configuration value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Seconds(u64),
    Flag(bool),
    Collections(BTreeSet<CollectionId>),
}

/// Change event published by a [`ConfigSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub key: ConfigKey,
    pub value: ConfigValue,
}

/// Autolock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutolockConfig {
    /// Polling cadence in seconds
    #[serde(rename = "check-interval")]
    pub check_interval_secs: u64,
    /// Grace period between detecting an unlocked collection and locking it
    #[serde(rename = "lock-delay")]
    pub lock_delay_secs: u64,
    /// Collections excluded from status and from automatic locking
    #[serde(rename = "ignored-collections")]
    pub ignored_collections: BTreeSet<CollectionId>,
    /// Hide the indicator while everything is locked
    #[serde(rename = "hide-locked")]
    pub hide_when_locked: bool,
}

impl Default for AutolockConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            lock_delay_secs: DEFAULT_LOCK_DELAY_SECS,
            ignored_collections: BTreeSet::new(),
            hide_when_locked: false,
        }
    }
}

impl AutolockConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn lock_delay(&self) -> Duration {
        Duration::from_secs(self.lock_delay_secs)
    }

    /// Current value of `key`
    pub fn get(&self, key: ConfigKey) -> ConfigValue {
        match key {
            ConfigKey::CheckInterval => ConfigValue::Seconds(self.check_interval_secs),
            ConfigKey::LockDelay => ConfigValue::Seconds(self.lock_delay_secs),
            ConfigKey::IgnoredCollections => ConfigValue::Collections(self.ignored_collections.clone()),
            ConfigKey::HideLocked => ConfigValue::Flag(self.hide_when_locked),
        }
    }

    /// Validate every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigDelta::from_config(self).validate()
    }

    /// Validate `delta` as a whole, then apply it. Returns the keys whose
    /// value actually changed. Nothing is applied when validation fails.
    pub fn apply(&mut self, delta: &ConfigDelta) -> Result<Vec<ConfigKey>, ConfigError> {
        delta.validate()?;

        let mut changed = Vec::new();
        if let Some(secs) = delta.check_interval_secs {
            if secs != self.check_interval_secs {
                self.check_interval_secs = secs;
                changed.push(ConfigKey::CheckInterval);
            }
        }
        if let Some(secs) = delta.lock_delay_secs {
            if secs != self.lock_delay_secs {
                self.lock_delay_secs = secs;
                changed.push(ConfigKey::LockDelay);
            }
        }
        if let Some(ref ignored) = delta.ignored_collections {
            if *ignored != self.ignored_collections {
                self.ignored_collections = ignored.clone();
                changed.push(ConfigKey::IgnoredCollections);
            }
        }
        if let Some(hide) = delta.hide_when_locked {
            if hide != self.hide_when_locked {
                self.hide_when_locked = hide;
                changed.push(ConfigKey::HideLocked);
            }
        }
        Ok(changed)
    }
}

/// A partial configuration update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDelta {
    pub check_interval_secs: Option<u64>,
    pub lock_delay_secs: Option<u64>,
    pub ignored_collections: Option<BTreeSet<CollectionId>>,
    pub hide_when_locked: Option<bool>,
}

impl ConfigDelta {
    /// A delta setting every field of `config`
    pub fn from_config(config: &AutolockConfig) -> Self {
        Self {
            check_interval_secs: Some(config.check_interval_secs),
            lock_delay_secs: Some(config.lock_delay_secs),
            ignored_collections: Some(config.ignored_collections.clone()),
            hide_when_locked: Some(config.hide_when_locked),
        }
    }

    /// A single-field delta from a change event
    pub fn from_change(change: &ConfigChange) -> Result<Self, ConfigError> {
        let mut delta = Self::default();
        delta.set(change.key, change.value.clone())?;
        Ok(delta)
    }

    pub fn check_interval(mut self, secs: u64) -> Self {
        self.check_interval_secs = Some(secs);
        self
    }

    pub fn lock_delay(mut self, secs: u64) -> Self {
        self.lock_delay_secs = Some(secs);
        self
    }

    pub fn ignored<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CollectionId>,
    {
        self.ignored_collections = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn hide_when_locked(mut self, hide: bool) -> Self {
        self.hide_when_locked = Some(hide);
        self
    }

    /// Set one field from a key/value pair
    pub fn set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<(), ConfigError> {
        match (key, value) {
            (ConfigKey::CheckInterval, ConfigValue::Seconds(secs)) => {
                self.check_interval_secs = Some(secs)
            }
            (ConfigKey::LockDelay, ConfigValue::Seconds(secs)) => self.lock_delay_secs = Some(secs),
            (ConfigKey::IgnoredCollections, ConfigValue::Collections(ids)) => {
                self.ignored_collections = Some(ids)
            }
            (ConfigKey::HideLocked, ConfigValue::Flag(hide)) => self.hide_when_locked = Some(hide),
            (key, _) => return Err(ConfigError::TypeMismatch { key }),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secs) = self.check_interval_secs {
            check_range(
                ConfigKey::CheckInterval,
                secs,
                MIN_CHECK_INTERVAL_SECS,
                MAX_CHECK_INTERVAL_SECS,
            )?;
        }
        if let Some(secs) = self.lock_delay_secs {
            check_range(ConfigKey::LockDelay, secs, MIN_LOCK_DELAY_SECS, MAX_LOCK_DELAY_SECS)?;
        }
        Ok(())
    }
}

fn check_range(key: ConfigKey, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Source of configuration values and change notifications
pub trait ConfigSource: Send + Sync {
    /// Read the current value of `key`
    fn get(&self, key: ConfigKey) -> Result<ConfigValue, ConfigError>;

    /// Subscribe to change events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<ConfigChange>;

    /// Read every key into a validated configuration
    fn snapshot(&self) -> Result<AutolockConfig, ConfigError> {
        let mut delta = ConfigDelta::default();
        for key in ConfigKey::ALL {
            delta.set(key, self.get(key)?)?;
        }
        let mut config = AutolockConfig::default();
        config.apply(&delta)?;
        Ok(config)
    }
}

/// Configuration source held in memory
pub struct MemoryConfigSource {
    config: Mutex<AutolockConfig>,
    changes: broadcast::Sender<ConfigChange>,
}

impl MemoryConfigSource {
    pub fn new(config: AutolockConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            config: Mutex::new(config),
            changes,
        }
    }

    fn config(&self) -> MutexGuard<'_, AutolockConfig> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a new value and notify subscribers if it changed
    pub fn set(&self, key: ConfigKey, value: ConfigValue) -> Result<(), ConfigError> {
        let delta = ConfigDelta::from_change(&ConfigChange {
            key,
            value: value.clone(),
        })?;

        let changed = self.config().apply(&delta)?;
        if !changed.is_empty() {
            // No subscribers is not an error
            let _ = self.changes.send(ConfigChange { key, value });
        }
        Ok(())
    }
}

impl Default for MemoryConfigSource {
    fn default() -> Self {
        Self::new(AutolockConfig::default())
    }
}

impl ConfigSource for MemoryConfigSource {
    fn get(&self, key: ConfigKey) -> Result<ConfigValue, ConfigError> {
        Ok(self.config().get(key))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    fn snapshot(&self) -> Result<AutolockConfig, ConfigError> {
        Ok(self.config().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AutolockConfig::default();
        assert_eq!(config.check_interval_secs, 30);
        assert_eq!(config.lock_delay_secs, 60);
        assert!(config.ignored_collections.is_empty());
        assert!(!config.hide_when_locked);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_names_round_trip() {
        for key in ConfigKey::ALL {
            assert_eq!(key.as_str().parse::<ConfigKey>().unwrap(), key);
        }
        assert!(matches!(
            "lock-timeout".parse::<ConfigKey>(),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_apply_reports_changed_keys() {
        let mut config = AutolockConfig::default();
        let delta = ConfigDelta::default()
            .check_interval(30)
            .lock_delay(120)
            .ignored(["scratch"]);

        let changed = config.apply(&delta).unwrap();
        assert_eq!(changed, vec![ConfigKey::LockDelay, ConfigKey::IgnoredCollections]);
        assert_eq!(config.lock_delay_secs, 120);
        assert!(config.ignored_collections.contains("scratch"));
    }

    #[test]
    fn test_invalid_delta_applies_nothing() {
        let mut config = AutolockConfig::default();
        let delta = ConfigDelta::default().lock_delay(10).check_interval(0);

        let result = config.apply(&delta);
        assert!(matches!(
            result,
            Err(ConfigError::OutOfRange {
                key: ConfigKey::CheckInterval,
                value: 0,
                ..
            })
        ));
        assert_eq!(config, AutolockConfig::default());
    }

    #[test]
    fn test_bounds() {
        assert!(ConfigDelta::default().check_interval(1).validate().is_ok());
        assert!(ConfigDelta::default().check_interval(3600).validate().is_ok());
        assert!(ConfigDelta::default().check_interval(3601).validate().is_err());
        assert!(ConfigDelta::default().lock_delay(0).validate().is_ok());
        assert!(ConfigDelta::default().lock_delay(86_400).validate().is_ok());
        assert!(ConfigDelta::default().lock_delay(86_401).validate().is_err());
    }

    #[test]
    fn test_delta_type_mismatch() {
        let change = ConfigChange {
            key: ConfigKey::HideLocked,
            value: ConfigValue::Seconds(1),
        };
        assert!(matches!(
            ConfigDelta::from_change(&change),
            Err(ConfigError::TypeMismatch {
                key: ConfigKey::HideLocked
            })
        ));
    }

    #[test]
    fn test_memory_source_notifies_on_change_only() {
        let source = MemoryConfigSource::default();
        let mut rx = source.subscribe();

        source.set(ConfigKey::LockDelay, ConfigValue::Seconds(60)).unwrap();
        assert!(rx.try_recv().is_err());

        source.set(ConfigKey::LockDelay, ConfigValue::Seconds(5)).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, ConfigKey::LockDelay);
        assert_eq!(change.value, ConfigValue::Seconds(5));
        assert_eq!(source.get(ConfigKey::LockDelay).unwrap(), ConfigValue::Seconds(5));
    }

    #[test]
    fn test_memory_source_rejects_out_of_range() {
        let source = MemoryConfigSource::default();
        assert!(source.set(ConfigKey::CheckInterval, ConfigValue::Seconds(0)).is_err());
        assert_eq!(source.snapshot().unwrap(), AutolockConfig::default());
    }

    #[test]
    fn test_default_snapshot_assembles_from_get() {
        struct Fixed;

        impl ConfigSource for Fixed {
            fn get(&self, key: ConfigKey) -> Result<ConfigValue, ConfigError> {
                Ok(match key {
                    ConfigKey::CheckInterval => ConfigValue::Seconds(10),
                    ConfigKey::LockDelay => ConfigValue::Seconds(0),
                    ConfigKey::IgnoredCollections => ConfigValue::Collections(BTreeSet::new()),
                    ConfigKey::HideLocked => ConfigValue::Flag(true),
                })
            }

            fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
                broadcast::channel(1).1
            }
        }

        let config = Fixed.snapshot().unwrap();
        assert_eq!(config.check_interval_secs, 10);
        assert_eq!(config.lock_delay_secs, 0);
        assert!(config.hide_when_locked);
    }

    #[test]
    fn test_config_serde_keys() {
        let config: AutolockConfig = serde_json::from_str(
            r#"{"check-interval": 15, "ignored-collections": ["work"], "hide-locked": true}"#,
        )
        .unwrap();
        assert_eq!(config.check_interval_secs, 15);
        assert_eq!(config.lock_delay_secs, DEFAULT_LOCK_DELAY_SECS);
        assert!(config.ignored_collections.contains("work"));
        assert!(config.hide_when_locked);
    }
}
