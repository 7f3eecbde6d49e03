//! Deterministic task fingerprints for cachet.
//!
//! This crate turns a task's configuration, its input files and the hashes of
//! the tasks it depends on into a stable `TaskHash`:
//!
//! - [`fingerprint`] hashes individual files (git blob ids).
//! - [`glob`] resolves include/exclude patterns to sorted repo-relative paths.
//! - [`env`] selects environment variables by name or wildcard.
//! - [`task`] models task identifiers and definitions.
//! - [`engine`] combines all of the above into global and per-task hashes
//!   through the hand-written serializer in [`canonical`].
//!
//! A `TaskHash` is a pure function of its inputs: equal inputs on any machine
//! and in any run produce the same string.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error conditions are documented on the error enum"
)]

pub mod canonical;
pub mod engine;
pub mod env;
mod error;
pub mod fingerprint;
pub mod glob;
pub mod task;

pub use canonical::{CanonicalHash, CanonicalWriter};
pub use engine::{
    GlobalHashable, HASH_FORMAT_VERSION, TaskHashInputs, TaskHashTracker, TaskHashable,
    compute_global_hash, compute_task_hash, hash_file_map,
};
pub use env::EnvironmentVariableMap;
pub use error::{Error, Result};
pub use fingerprint::{git_blob_hash, hash_file, hash_files};
pub use glob::{Globber, WalkType};
pub use task::{DependsOn, EnvMode, OutputLogsMode, TaskDefinition, TaskId, TaskOutputs};
