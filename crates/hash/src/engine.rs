//! Global and per-task hash computation.
//!
//! A run computes one [`GlobalHashable`] hash, then one [`TaskHashable`]
//! hash per task in dependency order. [`TaskHashTracker`] records each task's
//! hash so dependents can fold it in, and refuses to hash a task whose
//! dependencies are not hashed yet.

use crate::canonical::{CanonicalHash, CanonicalWriter};
use crate::env::EnvironmentVariableMap;
use crate::task::{EnvMode, TaskDefinition, TaskId, TaskOutputs};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// Version tag of the canonical serialization.
///
/// Bump this whenever a hashable record gains, loses or reorders a field, or
/// when the encoding in [`crate::canonical`] changes. Every artifact stored
/// under the old version becomes unreachable.
pub const HASH_FORMAT_VERSION: &str = "cachet-hash-v1";

/// Run-wide inputs shared by every task hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHashable {
    /// Format version or user-supplied cache salt
    pub cache_key: String,
    /// Repo-relative path → fingerprint of every global dependency file
    pub global_file_hashes: BTreeMap<String, String>,
    /// Hash of the root lockfile's external dependency closure
    pub root_external_deps_hash: String,
    /// Declared global env names or wildcards
    pub env: Vec<String>,
    /// Values of the variables selected by `env`
    pub resolved_env_vars: EnvironmentVariableMap,
    /// Pass-through env names; values never enter the hash
    pub pass_through_env: Vec<String>,
    /// Environment isolation mode
    pub env_mode: EnvMode,
    /// Whether framework env inference is on
    pub framework_inference: bool,
    /// Global dotenv files, in load order
    pub dot_env: Vec<String>,
}

impl Default for GlobalHashable {
    fn default() -> Self {
        Self {
            cache_key: HASH_FORMAT_VERSION.to_string(),
            global_file_hashes: BTreeMap::new(),
            root_external_deps_hash: String::new(),
            env: Vec::new(),
            resolved_env_vars: EnvironmentVariableMap::default(),
            pass_through_env: Vec::new(),
            env_mode: EnvMode::default(),
            framework_inference: true,
            dot_env: Vec::new(),
        }
    }
}

impl CanonicalHash for GlobalHashable {
    fn write_canonical(&self) -> CanonicalWriter {
        let mut w = CanonicalWriter::record("global");
        w.str(&self.cache_key)
            .map(&self.global_file_hashes)
            .str(&self.root_external_deps_hash)
            .sorted_list(&self.env)
            .list(&self.resolved_env_vars.to_hashable());
        write_pass_through(&mut w, self.env_mode, &self.pass_through_env);
        w.str(self.env_mode.as_str())
            .bool(self.framework_inference)
            // load order decides which value wins; never sort
            .list(&self.dot_env);
        w
    }
}

/// Everything that identifies one task's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHashable {
    /// Hash of the run's [`GlobalHashable`]
    pub global_hash: String,
    /// Repo-relative package directory
    pub package_dir: String,
    /// [`hash_file_map`] of the package's resolved inputs
    pub hash_of_files: String,
    /// Hash of the package's external dependency closure
    pub external_deps_hash: String,
    /// Task name
    pub task: String,
    /// Declared output globs
    pub outputs: TaskOutputs,
    /// Hashes of every task this one depends on
    pub task_dependency_hashes: Vec<String>,
    /// Extra CLI arguments forwarded to the task
    pub pass_through_args: Vec<String>,
    /// Declared env names or wildcards
    pub env: Vec<String>,
    /// Values of the variables selected by `env`
    pub resolved_env_vars: EnvironmentVariableMap,
    /// Pass-through env names; values never enter the hash
    pub pass_through_env: Vec<String>,
    /// Environment isolation mode
    pub env_mode: EnvMode,
    /// Task dotenv files, in load order
    pub dot_env: Vec<String>,
}

impl CanonicalHash for TaskHashable {
    fn write_canonical(&self) -> CanonicalWriter {
        let outputs = self.outputs.sorted();
        let mut w = CanonicalWriter::record("task");
        w.str(&self.global_hash)
            .str(&self.package_dir)
            .str(&self.hash_of_files)
            .str(&self.external_deps_hash)
            .str(&self.task)
            .str(self.env_mode.as_str())
            .list(&outputs.inclusions)
            .list(&outputs.exclusions)
            .sorted_list(&self.task_dependency_hashes)
            // argument order is meaningful to the task
            .list(&self.pass_through_args)
            .sorted_list(&self.env);
        write_pass_through(&mut w, self.env_mode, &self.pass_through_env);
        w.list(&self.dot_env)
            .list(&self.resolved_env_vars.to_hashable());
        w
    }
}

// Loose mode exposes the whole environment anyway, so the pass-through list
// carries no information and is hashed as empty.
fn write_pass_through(w: &mut CanonicalWriter, env_mode: EnvMode, names: &[String]) {
    match env_mode {
        EnvMode::Loose => w.list::<&str>(&[]),
        EnvMode::Strict => w.sorted_list(names),
    };
}

/// Compute the run-wide hash.
#[must_use]
pub fn compute_global_hash(global: &GlobalHashable) -> String {
    let hash = global.hash();
    tracing::debug!(global_hash = %hash, files = global.global_file_hashes.len(), "Computed global hash");
    hash
}

/// Compute one task's hash.
#[must_use]
pub fn compute_task_hash(task: &TaskHashable) -> String {
    task.hash()
}

/// Combine a package's input fingerprints into its "hash of files".
#[must_use]
pub fn hash_file_map(file_hashes: &BTreeMap<String, String>) -> String {
    let mut w = CanonicalWriter::record("files");
    w.map(file_hashes);
    crate::canonical::hash_bytes(&w.into_bytes())
}

/// Per-task inputs other than the global hash and dependency hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskHashInputs {
    /// Repo-relative package directory
    pub package_dir: String,
    /// [`hash_file_map`] of the package's inputs
    pub hash_of_files: String,
    /// Hash of the package's external dependency closure
    pub external_deps_hash: String,
    /// Declared output globs
    pub outputs: TaskOutputs,
    /// Extra CLI arguments
    pub pass_through_args: Vec<String>,
    /// Declared env names or wildcards
    pub env: Vec<String>,
    /// Values of the variables selected by `env`
    pub resolved_env_vars: EnvironmentVariableMap,
    /// Pass-through env names
    pub pass_through_env: Vec<String>,
    /// Environment isolation mode
    pub env_mode: EnvMode,
    /// Dotenv files, in load order
    pub dot_env: Vec<String>,
}

impl TaskHashInputs {
    /// Collect a task's inputs from its definition and the run's environment
    /// snapshot.
    pub fn from_definition(
        definition: &TaskDefinition,
        package_dir: impl Into<String>,
        hash_of_files: impl Into<String>,
        external_deps_hash: impl Into<String>,
        env_snapshot: &EnvironmentVariableMap,
        pass_through_args: &[String],
    ) -> Result<Self> {
        Ok(Self {
            package_dir: package_dir.into(),
            hash_of_files: hash_of_files.into(),
            external_deps_hash: external_deps_hash.into(),
            outputs: definition.task_outputs(),
            pass_through_args: pass_through_args.to_vec(),
            env: definition.env.clone(),
            resolved_env_vars: env_snapshot.from_wildcards(&definition.env)?,
            pass_through_env: definition.pass_through_env.clone(),
            env_mode: definition.env_mode,
            dot_env: definition.dot_env.clone(),
        })
    }
}

/// Thread-safe registry of the task hashes computed during a run.
#[derive(Debug)]
pub struct TaskHashTracker {
    global_hash: String,
    hashes: RwLock<HashMap<TaskId, String>>,
}

impl TaskHashTracker {
    /// Create a tracker for a run with the given global hash.
    pub fn new(global_hash: impl Into<String>) -> Self {
        Self {
            global_hash: global_hash.into(),
            hashes: RwLock::new(HashMap::new()),
        }
    }

    /// The run's global hash.
    #[must_use]
    pub fn global_hash(&self) -> &str {
        &self.global_hash
    }

    /// Hash `task_id`, folding in the recorded hashes of `dependencies`.
    ///
    /// Fails with [`Error::MissingDependencyHash`] if any dependency has not
    /// been hashed yet. On success the hash is recorded for later dependents.
    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId,
        dependencies: &[TaskId],
        inputs: TaskHashInputs,
    ) -> Result<String> {
        let task_dependency_hashes = {
            let hashes = self.hashes.read().unwrap_or_else(PoisonError::into_inner);
            dependencies
                .iter()
                .map(|dep| {
                    hashes.get(dep).cloned().ok_or_else(|| {
                        Error::missing_dependency_hash(task_id.to_string(), dep.to_string())
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let hashable = TaskHashable {
            global_hash: self.global_hash.clone(),
            package_dir: inputs.package_dir,
            hash_of_files: inputs.hash_of_files,
            external_deps_hash: inputs.external_deps_hash,
            task: task_id.task.clone(),
            outputs: inputs.outputs,
            task_dependency_hashes,
            pass_through_args: inputs.pass_through_args,
            env: inputs.env,
            resolved_env_vars: inputs.resolved_env_vars,
            pass_through_env: inputs.pass_through_env,
            env_mode: inputs.env_mode,
            dot_env: inputs.dot_env,
        };
        let hash = compute_task_hash(&hashable);
        tracing::debug!(task = %task_id, hash = %hash, "Computed task hash");

        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.clone(), hash.clone());
        Ok(hash)
    }

    /// The recorded hash of `task_id`, if it has been computed.
    #[must_use]
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        self.hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }
}
