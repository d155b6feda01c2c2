//! Error types for the host agent

use crate::domain::resource::ResourceError;
use thiserror::Error;

/// Result type alias using the host agent's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Host agent error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Resource errors (E300-E399)
    #[error(transparent)]
    Resource(#[from] ResourceError),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resource(e) => e.code(),
            Self::ConfigError(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Resource(ResourceError::UnknownNamespace(ns)) => Some(format!(
                "Register namespace '{}' before acquiring its resources",
                ns
            )),
            Self::Resource(ResourceError::InvalidName(_)) => {
                Some("Remove '.' from namespace and resource names".to_string())
            }
            Self::Resource(ResourceError::InvalidTimeout(_)) => {
                Some("Give timeouts as a non-negative number of seconds".to_string())
            }
            Self::Resource(ResourceError::TimedOut { .. }) => {
                Some("hostagent config set resources.default_timeout_secs <secs>".to_string())
            }
            Self::ConfigError(_) => Some("hostagent config show".to_string()),
            _ => None,
        }
    }
}
