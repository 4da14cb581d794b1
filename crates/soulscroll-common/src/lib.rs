//! # SoulScroll Common
//!
//! Error type, logging setup and retry/timeout helpers shared by the
//! SoulScroll offline worker crates.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the shared helpers.
#[derive(Error, Debug)]
pub enum SoulScrollError {
    /// Bad or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl SoulScrollError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for the shared helpers.
pub type Result<T> = std::result::Result<T, SoulScrollError>;
