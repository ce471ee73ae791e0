//! Error types for gpsgate-rs.
//!
//! This module defines structured error types that provide better error handling
//! and debugging compared to using `anyhow::Error` everywhere. Each error variant
//! includes contextual information about what went wrong and where.
//!
//! No error crosses the pipeline boundary: every frame ends in success, a
//! counted drop, or a bounded retry-then-drop. Only configuration failures at
//! startup and fatal broker errors surface to the host process.

use std::io;
use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A frame could not be decoded into a telemetry record
    #[error("Decode error ({protocol}): {reason}")]
    Decode {
        /// Protocol of the decoder that rejected the frame
        protocol: String,
        /// Why the frame was rejected
        reason: String,
    },

    /// A decoded record violates one or more hard invariants
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Transient or terminal bus publish failure
    #[error("Publish error on topic '{topic}': {reason}")]
    Publish {
        /// Topic the record was destined for
        topic: String,
        /// Broker-reported reason
        reason: String,
        /// Whether retrying can succeed
        retriable: bool,
    },

    /// The publish circuit breaker is open; fail fast and back-pressure upstream
    #[error("Circuit breaker open; publish path unavailable")]
    CircuitOpen,

    /// A plugin's init hook failed; the plugin is not registered
    #[error("Plugin '{plugin}' failed to initialize: {reason}")]
    PluginInit {
        /// Plugin name
        plugin: String,
        /// Failure reason
        reason: String,
    },

    /// A plugin failed at runtime; the plugin is quarantined, the core continues
    #[error("Plugin '{plugin}' runtime failure: {reason}")]
    PluginRuntime {
        /// Plugin name
        plugin: String,
        /// Failure reason
        reason: String,
    },

    /// Flush did not confirm all in-flight records before the deadline
    #[error("Flush deadline exceeded with {pending} records unconfirmed")]
    FlushTimeout {
        /// Number of records still unconfirmed
        pending: usize,
    },

    /// Cooperative shutdown observed mid-operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Network I/O errors (bind failures, socket errors)
    #[error("Network error on endpoint '{endpoint}': {source}")]
    Network {
        /// Name or address of the endpoint that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// File system errors (config file, plugin directory)
    #[error("Filesystem error at '{path}': {source}")]
    Filesystem {
        /// Path that caused the error
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new decode error
    pub fn decode(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// Create a new retriable publish error
    pub fn publish_retriable(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.into(),
            retriable: true,
        }
    }

    /// Create a new terminal publish error
    pub fn publish_terminal(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.into(),
            retriable: false,
        }
    }

    /// Create a new plugin init error
    pub fn plugin_init(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginInit {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a new plugin runtime error
    pub fn plugin_runtime(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginRuntime {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new filesystem error
    pub fn filesystem(path: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry of the failed operation can succeed.
    ///
    /// Used by the resilience wrappers to stop retrying terminal failures
    /// (e.g. a record the broker rejects as too large).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Publish { retriable, .. } => *retriable,
            Self::Network { .. } => true,
            _ => false,
        }
    }
}

/// Convert from std::io::Error
impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            endpoint: "unknown".to_string(),
            source: err,
        }
    }
}
