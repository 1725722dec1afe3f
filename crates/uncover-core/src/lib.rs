//! Uncover Core Library
//!
//! This crate provides the configuration types shared by the offline worker,
//! its network layer and the smoke harness.

pub mod config;
pub mod error;

pub use config::{
    NetworkConfig, NotificationConfig, StorageConfig, SyncConfig, WorkerConfig,
    DEFAULT_CACHE_VERSION,
};
pub use error::{ConfigError, ConfigResult};
