//! Error types for the hash crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Errors that prevent a task hash from being computed.
///
/// Every variant is fatal for the task being hashed: a task whose inputs
/// cannot be read or whose globs escape the repository must not run from a
/// guessed hash.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while reading an input
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cachet::hash::io),
        help("Declared inputs must be readable when the task is hashed")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "open", "read", "readlink")
        operation: String,
    },

    /// A glob pattern could not be compiled
    #[error("Invalid glob pattern '{pattern}': {message}")]
    #[diagnostic(code(cachet::hash::invalid_glob))]
    InvalidGlob {
        /// The offending pattern
        pattern: String,
        /// Parser message
        message: String,
    },

    /// A glob pattern resolves outside the repository root
    #[error("Glob pattern '{pattern}' escapes the repository root")]
    #[diagnostic(
        code(cachet::hash::glob_escape),
        help("Patterns are resolved relative to the package directory and may not climb above the repository root")
    )]
    GlobEscape {
        /// The offending pattern
        pattern: String,
    },

    /// A dependency's hash was requested before it was computed
    #[error("missing hash for dependent task {dependency} (required by {task})")]
    #[diagnostic(
        code(cachet::hash::missing_dependency_hash),
        help("Dependencies must be hashed before the tasks that depend on them")
    )]
    MissingDependencyHash {
        /// The task being hashed
        task: String,
        /// The dependency with no recorded hash
        dependency: String,
    },

    /// An environment variable wildcard could not be compiled
    #[error("Invalid environment variable pattern: {message}")]
    #[diagnostic(code(cachet::hash::invalid_env_pattern))]
    InvalidEnvPattern {
        /// Regex compiler message
        message: String,
    },

    /// A task identifier could not be parsed
    #[error("Invalid task identifier '{value}': {message}")]
    #[diagnostic(code(cachet::hash::invalid_task_id))]
    InvalidTaskId {
        /// The rejected input
        value: String,
        /// Why it was rejected
        message: String,
    },
}

impl Error {
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

    /// Create an invalid glob error
    #[must_use]
    pub fn invalid_glob(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidGlob {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Create a glob escape error
    #[must_use]
    pub fn glob_escape(pattern: impl Into<String>) -> Self {
        Self::GlobEscape {
            pattern: pattern.into(),
        }
    }

    /// Create a missing dependency hash error
    #[must_use]
    pub fn missing_dependency_hash(task: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependencyHash {
            task: task.into(),
            dependency: dependency.into(),
        }
    }

    /// Create an invalid task identifier error
    #[must_use]
    pub fn invalid_task_id(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTaskId {
            value: value.into(),
            message: message.into(),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::InvalidEnvPattern {
            message: err.to_string(),
        }
    }
}

/// Result type for hash operations
pub type Result<T> = std::result::Result<T, Error>;
