//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations.
///
/// Almost every variant is recoverable from the point of view of a task run:
/// a failed read is a miss and a failed write is skipped. Only the archive
/// safety variants ([`Error::InvalidArchivePath`], [`Error::LinkEscape`],
/// [`Error::CyclicLinks`]) indicate a hostile or corrupt artifact.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cachet::cache::io),
        help("Check file permissions and ensure the cache directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Transport-level HTTP failure (connect, TLS, timeout, body)
    #[error("HTTP request to remote cache failed: {source}")]
    #[diagnostic(code(cachet::cache::http))]
    Http {
        /// The underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// Remote cache answered with a status that is neither success nor a miss
    #[error("Remote cache returned {status} for {operation}")]
    #[diagnostic(code(cachet::cache::unexpected_status))]
    UnexpectedStatus {
        /// HTTP status code
        status: u16,
        /// Request kind ("fetch", "put", "exists")
        operation: String,
    },

    /// The run-wide remote failure budget is spent
    #[error("Remote cache disabled after {failures} failures in this run")]
    #[diagnostic(
        code(cachet::cache::too_many_failures),
        help("The remote cache is skipped until the next run; local caching continues")
    )]
    TooManyFailures {
        /// Failures recorded so far
        failures: u64,
    },

    /// The run was cancelled while a remote request was in flight
    #[error("Remote cache request cancelled")]
    #[diagnostic(code(cachet::cache::cancelled))]
    Cancelled,

    /// An output is neither a regular file, a directory nor a symlink
    #[error("Unsupported file type for cached output: {}", path.display())]
    #[diagnostic(
        code(cachet::cache::unsupported_file_type),
        help("Sockets, devices and FIFOs cannot be cached")
    )]
    UnsupportedFileType {
        /// Offending path
        path: Box<Path>,
    },

    /// An archive entry name is absolute or climbs out of the anchor
    #[error("Invalid path in cache archive: {path}")]
    #[diagnostic(
        code(cachet::cache::invalid_archive_path),
        help("The artifact is corrupt or was not produced by cachet")
    )]
    InvalidArchivePath {
        /// Entry name as stored in the archive
        path: String,
    },

    /// A restored path would be written through a symlink leaving the anchor
    #[error("Restoring {path} would follow a link outside the restore root")]
    #[diagnostic(code(cachet::cache::link_escape))]
    LinkEscape {
        /// Entry name as stored in the archive
        path: String,
    },

    /// Symlinks in an archive point at each other in a loop
    #[error("Cache archive contains cyclic symlinks: {}", links.join(", "))]
    #[diagnostic(code(cachet::cache::cyclic_links))]
    CyclicLinks {
        /// Links participating in the cycle
        links: Vec<String>,
    },

    /// Signature verification is enabled but the artifact carries no tag
    #[error("Remote artifact {hash} has no signature tag")]
    #[diagnostic(
        code(cachet::cache::artifact_tag_missing),
        help("The artifact was uploaded without signing; it is treated as a miss")
    )]
    ArtifactTagMissing {
        /// Artifact hash
        hash: String,
    },

    /// The artifact's signature tag does not match its contents
    #[error("Remote artifact {hash} failed signature verification")]
    #[diagnostic(
        code(cachet::cache::invalid_tag),
        help("Check that every machine shares the same signature key")
    )]
    InvalidTag {
        /// Artifact hash
        hash: String,
    },

    /// Signing is enabled but cannot be performed
    #[error("Artifact signing failed: {message}")]
    #[diagnostic(
        code(cachet::cache::signature),
        help("Set CACHET_REMOTE_CACHE_SIGNATURE_KEY or disable signature verification")
    )]
    Signature {
        /// What went wrong
        message: String,
    },

    /// `x-artifact-duration` was present but not a number
    #[error("Invalid artifact duration header: {value}")]
    #[diagnostic(code(cachet::cache::invalid_duration))]
    InvalidDuration {
        /// Raw header value
        value: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(cachet::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(cachet::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A blocking archive task panicked or was aborted
    #[error("Background cache task failed: {message}")]
    #[diagnostic(code(cachet::cache::join))]
    Join {
        /// Join error text
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an unexpected-status error
    #[must_use]
    pub fn unexpected_status(status: u16, operation: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            status,
            operation: operation.into(),
        }
    }

    /// Create an invalid-archive-path error
    #[must_use]
    pub fn invalid_archive_path(path: impl Into<String>) -> Self {
        Self::InvalidArchivePath { path: path.into() }
    }

    /// Create a link-escape error
    #[must_use]
    pub fn link_escape(path: impl Into<String>) -> Self {
        Self::LinkEscape { path: path.into() }
    }

    /// Whether the run-wide failure budget stopped this request.
    #[must_use]
    pub const fn is_too_many_failures(&self) -> bool {
        matches!(self, Self::TooManyFailures { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        Self::Http { source }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join {
            message: err.to_string(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
