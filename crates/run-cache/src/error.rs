//! Error types for the run-cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Errors raised while restoring or saving a task's outputs.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The artifact store failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] cachet_cache::Error),

    /// Output globs could not be resolved
    #[error(transparent)]
    #[diagnostic(transparent)]
    Hash(#[from] cachet_hash::Error),

    /// Log file I/O failed
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cachet::run_cache::io),
        help("Check that the package's .cachet directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "create log file", "replay log")
        operation: String,
    },

    /// The output watcher could not answer
    #[error("Output watcher error: {message}")]
    #[diagnostic(code(cachet::run_cache::watcher))]
    Watcher {
        /// Description from the watcher
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without a path
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a watcher error
    #[must_use]
    pub fn watcher(message: impl Into<String>) -> Self {
        Self::Watcher {
            message: message.into(),
        }
    }
}

/// Result type for run-cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = Error::io(
            std::io::Error::other("denied"),
            "/repo/web/.cachet/cachet-build.log",
            "create log file",
        );
        assert_eq!(
            err.to_string(),
            "I/O create log file failed: /repo/web/.cachet/cachet-build.log"
        );
    }

    #[test]
    fn test_cache_error_is_transparent() {
        let err: Error = cachet_cache::Error::Cancelled.into();
        assert_eq!(err.to_string(), cachet_cache::Error::Cancelled.to_string());
    }
}
