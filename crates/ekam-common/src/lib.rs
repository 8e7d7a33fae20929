//! # Ekam Common
//!
//! Shared error type, logging setup and retry/deadline helpers used by the
//! Ekam offline cache crates and tools.
//!
//! Library crates keep their own error enums; binaries fold them into
//! [`EkamError`] so retry decisions and exit codes hang off one type.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum EkamError {
    /// Upstream unreachable, slow or garbled.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Reading or writing cache storage.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Install or activation did not complete.
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EkamError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause. Variants without a source slot are
    /// returned unchanged.
    pub fn with_source(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        match &mut self {
            Self::Network { source, .. }
            | Self::Cache { source, .. }
            | Self::Lifecycle { source, .. }
            | Self::Config { source, .. } => *source = Some(Box::new(cause)),
            _ => {}
        }
        self
    }

    /// Whether repeating the operation could succeed.
    ///
    /// A failed install is retryable: the whole manifest is fetched again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Lifecycle { .. } | Self::Timeout(_) | Self::Io(_)
        )
    }

    /// Short label for structured logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Cache { .. } => "cache",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Config { .. } => "config",
            Self::Io(_) => "io",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
        }
    }
}

pub type Result<T> = std::result::Result<T, EkamError>;

pub trait OptionExt<T> {
    /// Convert `None` into [`EkamError::NotFound`].
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| EkamError::NotFound(resource.into()))
    }
}
