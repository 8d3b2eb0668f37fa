//! CLI error types.

use claw_firewall::FirewallError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration or rule loading failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A trace line could not be used.
    #[error("trace line {line}: {reason}")]
    Trace {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// The engine rejected an operation.
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Shorthand for a [`CliError::Trace`].
    pub fn trace(line: usize, reason: impl Into<String>) -> Self {
        Self::Trace {
            line,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_error_display_trace() {
        let err = CliError::trace(7, "offset went backwards");
        assert_eq!(err.to_string(), "trace line 7: offset went backwards");
    }

    #[test]
    fn cli_error_from_firewall_error() {
        let err = CliError::from(FirewallError::Config("bad".into()));
        assert_eq!(err.to_string(), "configuration error: bad");
    }

    #[test]
    fn cli_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cli_err = CliError::from(io_err);
        assert!(matches!(cli_err, CliError::Io(_)));
    }
}
