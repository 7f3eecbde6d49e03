//! Task identifiers and the per-task configuration that feeds hashing and
//! caching.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between package and task in a task identifier.
pub const TASK_DELIMITER: char = '#';

/// Directory (relative to a package) holding task log files.
pub const LOG_DIR: &str = ".cachet";

/// A task within a specific package, displayed as `package#task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Package name
    pub package: String,
    /// Task name
    pub task: String,
}

impl TaskId {
    /// Create a task identifier.
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    /// Parse `package#task`, or a bare `task` belonging to `package`.
    pub fn parse_in_package(value: &str, package: &str) -> Result<Self> {
        match value.split_once(TASK_DELIMITER) {
            Some(_) => value.parse(),
            None if value.is_empty() => Err(Error::invalid_task_id(value, "empty task name")),
            None => Ok(Self::new(package, value)),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (package, task) = s
            .split_once(TASK_DELIMITER)
            .ok_or_else(|| Error::invalid_task_id(s, "expected package#task"))?;
        if package.is_empty() || task.is_empty() {
            return Err(Error::invalid_task_id(s, "package and task must be non-empty"));
        }
        Ok(Self::new(package, task))
    }
}

/// One entry of a task's `dependsOn` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependsOn {
    /// `build`: a task in the same package.
    SamePackage(String),
    /// `^build`: the task in every package this package depends on.
    Upstream(String),
    /// `web#build`: a specific package's task.
    Explicit(TaskId),
}

impl FromStr for DependsOn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(task) = s.strip_prefix('^') {
            if task.is_empty() || task.contains(TASK_DELIMITER) {
                return Err(Error::invalid_task_id(s, "upstream dependency must be ^task"));
            }
            return Ok(Self::Upstream(task.to_string()));
        }
        if s.contains(TASK_DELIMITER) {
            return s.parse().map(Self::Explicit);
        }
        if s.is_empty() {
            return Err(Error::invalid_task_id(s, "empty task name"));
        }
        Ok(Self::SamePackage(s.to_string()))
    }
}

/// How a task's logs are shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    /// Stream live output and replay logs on a hit.
    #[default]
    Full,
    /// Show nothing.
    None,
    /// Show only the hash status line.
    HashOnly,
    /// Stream live output on a miss; only the status line on a hit.
    NewOnly,
    /// Show logs only when the task fails.
    ErrorsOnly,
}

impl FromStr for OutputLogsMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "none" => Ok(Self::None),
            "hash-only" => Ok(Self::HashOnly),
            "new-only" => Ok(Self::NewOnly),
            "errors-only" => Ok(Self::ErrorsOnly),
            other => Err(format!("Unknown output logs mode: {other}")),
        }
    }
}

/// Whether undeclared environment variables reach the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    /// The whole environment is available; pass-through names are not hashed.
    Loose,
    /// Only declared and pass-through variables are available.
    #[default]
    Strict,
}

impl EnvMode {
    /// Stable name used in hash serialization.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loose => "loose",
            Self::Strict => "strict",
        }
    }
}

/// Output globs split into inclusions and `!`-prefixed exclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskOutputs {
    /// Globs whose matches are cached
    pub inclusions: Vec<String>,
    /// Globs removed from the inclusions
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    /// Split a raw `outputs` list on the `!` prefix.
    pub fn from_globs<S: AsRef<str>>(globs: &[S]) -> Self {
        let mut outputs = Self::default();
        for glob in globs {
            let glob = glob.as_ref();
            match glob.strip_prefix('!') {
                Some(excluded) => outputs.exclusions.push(excluded.to_string()),
                None => outputs.inclusions.push(glob.to_string()),
            }
        }
        outputs
    }

    /// True when no globs are declared at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inclusions.is_empty() && self.exclusions.is_empty()
    }

    /// Sorted copy, used for hashing so declaration order is irrelevant.
    #[must_use]
    pub fn sorted(&self) -> Self {
        let mut inclusions = self.inclusions.clone();
        let mut exclusions = self.exclusions.clone();
        inclusions.sort();
        exclusions.sort();
        Self {
            inclusions,
            exclusions,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Configuration for one task in one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// `dependsOn` entries, see [`DependsOn`]
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Output globs (package-relative, `!` for exclusions)
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Input globs; empty means every file in the package
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Environment variables (names or wildcards) whose values are hashed
    #[serde(default)]
    pub env: Vec<String>,
    /// Environment variables passed through without affecting the hash
    #[serde(default)]
    pub pass_through_env: Vec<String>,
    /// Dotenv files, in load order
    #[serde(default)]
    pub dot_env: Vec<String>,
    /// Whether outputs are cached
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Long-running task (dev servers); never cached
    #[serde(default)]
    pub persistent: bool,
    /// Log display mode
    #[serde(default)]
    pub output_logs: OutputLogsMode,
    /// Environment isolation mode
    #[serde(default)]
    pub env_mode: EnvMode,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            env: Vec::new(),
            pass_through_env: Vec::new(),
            dot_env: Vec::new(),
            cache: true,
            persistent: false,
            output_logs: OutputLogsMode::default(),
            env_mode: EnvMode::default(),
        }
    }
}

impl TaskDefinition {
    /// Parsed `dependsOn` entries.
    pub fn dependencies(&self) -> Result<Vec<DependsOn>> {
        self.depends_on.iter().map(|d| d.parse()).collect()
    }

    /// Whether a run of this task may read from or write to the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cache && !self.persistent
    }

    /// Output globs as declared, split into inclusions and exclusions.
    #[must_use]
    pub fn task_outputs(&self) -> TaskOutputs {
        TaskOutputs::from_globs(&self.outputs)
    }

    /// Log file path relative to the package directory.
    #[must_use]
    pub fn package_relative_log_file(task: &str) -> String {
        format!("{LOG_DIR}/cachet-{task}.log")
    }

    /// Output globs prefixed with `package_dir`, plus the task's log file.
    ///
    /// These are the globs archived after the task runs; the log file is
    /// always among them so a cache hit can replay it.
    #[must_use]
    pub fn repo_relative_hashable_outputs(&self, task: &str, package_dir: &str) -> TaskOutputs {
        let prefix = |glob: &str| {
            if package_dir.is_empty() {
                glob.to_string()
            } else {
                format!("{package_dir}/{glob}")
            }
        };
        let declared = self.task_outputs();
        let mut inclusions: Vec<String> = declared
            .inclusions
            .iter()
            .map(|g| prefix(g.as_str()))
            .collect();
        inclusions.push(prefix(Self::package_relative_log_file(task).as_str()));
        TaskOutputs {
            inclusions,
            exclusions: declared
                .exclusions
                .iter()
                .map(|g| prefix(g.as_str()))
                .collect(),
        }
    }
}
