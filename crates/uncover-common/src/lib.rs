//! # Uncover Common
//!
//! Shared plumbing for the Uncover Markets offline worker crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Retry with exponential backoff (used by the background sync scheduler)
//! - Timeouts for individual asynchronous operations

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Errors raised by the shared helpers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Logging could not be installed (a global subscriber already exists).
    #[error("Logging error: {0}")]
    Logging(String),
}

impl CommonError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommonError::Timeout(_))
    }
}
