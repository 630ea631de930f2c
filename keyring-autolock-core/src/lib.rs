//! Keyring Autolock Core Library
//!
//! This library provides the autolock scheduling engine: it polls the lock
//! state of secret-service collections, derives a tri-level security status,
//! and re-locks the keyring after a configurable grace period.

pub mod config;
pub mod controller;
pub mod observer;
pub mod platform;
pub mod status;
pub mod store;
pub mod timers;

pub use config::{
    AutolockConfig, ConfigChange, ConfigDelta, ConfigError, ConfigKey, ConfigSource, ConfigValue,
    MemoryConfigSource,
};
pub use controller::{AutolockController, AutolockHandle};
pub use observer::{NullObserver, StatusObserver, StatusReport};
pub use platform::{default_config_path, ensure_config_dir, get_config_dir};
pub use status::{compute_status, StatusCounts, StatusLevel};
pub use store::{Collection, CollectionId, MemoryStore, SecretStore, StoreError, SESSION_COLLECTION_ID};
pub use timers::{RearmPolicy, TimerFired, TimerRegistry, TimerRole};

use thiserror::Error;

/// Result type for autolock operations
pub type Result<T> = std::result::Result<T, AutolockError>;

/// General error type for autolock operations
#[derive(Error, Debug)]
pub enum AutolockError {
    #[error("Secret store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Autolock controller is not running")]
    ControllerStopped,
}
