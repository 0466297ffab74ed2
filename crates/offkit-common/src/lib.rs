//! # OffKit Common
//!
//! Shared pieces for the OffKit offline caching worker.
//!
//! ## Features
//!
//! - A host-facing error type with categories and a retry hint
//! - Logging configuration and setup
//! - A timeout helper for bounding network work

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, init_test_logging, LogConfig, LogFormat, LOG_ENV};
pub use timeout::with_timeout;

/// Error type surfaced to hosts embedding an OffKit worker.
///
/// Each crate keeps its own precise error enum; this type is what they
/// collapse into when crossing the host boundary.
#[derive(Error, Debug)]
pub enum OffKitError {
    /// The network capability could not complete a fetch.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The persistent store could not be opened, read or written.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid worker configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A lifecycle step was requested from the wrong state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl OffKitError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the host's normal retry path is worth taking.
    ///
    /// A failed install is retried by the host; a bad config never is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OffKitError::Network { .. }
                | OffKitError::Storage { .. }
                | OffKitError::Timeout(_)
                | OffKitError::Io(_)
        )
    }

    /// Get the error category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            OffKitError::Network { .. } => "network",
            OffKitError::Storage { .. } => "storage",
            OffKitError::Config(_) => "config",
            OffKitError::Lifecycle(_) => "lifecycle",
            OffKitError::Io(_) => "io",
            OffKitError::Timeout(_) => "timeout",
            OffKitError::NotFound(_) => "not_found",
        }
    }
}

/// Result type alias for host-facing OffKit operations.
pub type Result<T> = std::result::Result<T, OffKitError>;
