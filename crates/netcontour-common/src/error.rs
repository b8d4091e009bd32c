//! Error types for the netcontour controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object or config key it relates to, so a
//! failed reconcile can be traced back to its input.

use thiserror::Error;

/// Main error type for netcontour operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for an Ingress
    #[error("validation error for {ingress}: {message}")]
    Validation {
        /// `namespace/name` of the offending Ingress
        ingress: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.rules[0].hosts")
        field: Option<String>,
    },

    /// Invalid controller configuration
    #[error("config error [{key}]: {message}")]
    Config {
        /// ConfigMap key that failed to parse
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error for a specific Ingress and field path
    pub fn validation_for_field(
        ingress: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            ingress: ingress.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a config error for the given ConfigMap key
    pub fn config(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, config and serialization errors need an input change.
    /// Kubernetes errors are retryable unless the API rejected the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 conflicts resolve themselves on the next pass against fresh state
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
