//! Error types for the filtering engine.
//!
//! None of these ever reach the end client: the engine logs them and
//! fails open.

use thiserror::Error;

/// Errors raised by a storage collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The backing store could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A concurrent writer won and the operation may be retried.
    #[error("storage conflict on {key}")]
    Conflict {
        /// Key that was being written.
        key: String,
    },

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors that can occur in firewall operations.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A rule could not be compiled for its type.
    #[error("invalid rule '{name}': {reason}")]
    InvalidRule {
        /// Rule name.
        name: String,
        /// Why the rule was rejected.
        reason: String,
    },

    /// An identifier is neither an IP address nor a network.
    #[error("invalid identifier '{0}': expected an IP address or CIDR network")]
    InvalidIdentifier(String),

    /// A storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The geo lookup collaborator failed.
    #[error("geo lookup failed for {identifier}: {reason}")]
    GeoLookup {
        /// Identifier being resolved.
        identifier: String,
        /// Failure description.
        reason: String,
    },

    /// Reading a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FirewallError {
    /// Shorthand for an [`FirewallError::InvalidRule`].
    pub fn invalid_rule(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for firewall operations.
pub type FirewallResult<T> = Result<T, FirewallError>;
