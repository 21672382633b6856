//! Error types for tunstack-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for tunstack-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration (address, name, MTU)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Interface or route lookup miss
    #[error("{kind} {key} not found")]
    NotFound {
        /// What was looked up ("interface name", "interface index", ...)
        kind: &'static str,
        /// The lookup key
        key: String,
    },

    /// Default route query found zero or several candidates
    #[error("Ambiguous default route: {0}")]
    AmbiguousRoute(String),

    /// OS-level socket option or bind failure
    #[error("Failed to bind to interface '{iface}': {message}")]
    Bind {
        /// Interface name
        iface: String,
        /// Error message
        message: String,
    },

    /// No usable local address on the interface
    #[error("No usable {family} address on interface '{iface}'")]
    AddressResolution {
        /// Interface name
        iface: String,
        /// Address family that was requested
        family: &'static str,
    },

    /// Route or rule install/delete failure
    #[error("Kernel state error during {op}: {message}")]
    KernelState {
        /// Operation that failed
        op: String,
        /// Error message
        message: String,
    },

    /// Start while running, or stop while stopped
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Userspace stack rejected a configuration step
    #[error("Netstack error: {0}")]
    Stack(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Create a bind error
    pub fn bind(iface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bind {
            iface: iface.into(),
            message: message.into(),
        }
    }

    /// Create a kernel state error
    pub fn kernel(op: impl Into<String>, message: impl ToString) -> Self {
        Self::KernelState {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// Create a stack error
    pub fn stack(message: impl ToString) -> Self {
        Self::Stack(message.to_string())
    }
}
