//! Per-task cache decisions for a cachet run.
//!
//! The scheduler owns one [`RunCache`] per invocation and asks it for a
//! [`TaskCache`] once a task's hash is known. The task cache then drives the
//! task through its cache states:
//!
//! 1. [`TaskCache::restore_outputs`] decides between a bypass, a hit (outputs
//!    restored, log replayed according to the output mode) and a miss.
//! 2. On a miss the scheduler runs the task, writing its output through
//!    [`TaskCache::output_writer`] so the log file is captured.
//! 3. [`TaskCache::save_outputs`] archives the declared outputs and the log.
//!
//! Cache trouble never fails a task: store failures are logged and degrade to
//! a miss or a skipped save.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error conditions are documented on the error enum"
)]

mod error;
pub mod output;
pub mod watcher;

pub use cachet_cache::{CacheHitMetadata, CacheSource};
pub use error::{Error, Result};
pub use output::{CacheOutput, CacheResult, LogReplayer, LogWriter};
pub use watcher::{NoopOutputWatcher, OutputWatcher};

use cachet_cache::Cache;
use cachet_events::{emit_cache_bypass, emit_cache_hit, emit_cache_miss, emit_cache_saved, emit_remote_degraded};
use cachet_hash::{Globber, OutputLogsMode, TaskDefinition, TaskId, TaskOutputs, WalkType};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Run-wide switches layered over the cache configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCacheOpts {
    /// Replaces every task's `outputLogs` when set
    pub output_logs_override: Option<OutputLogsMode>,
    /// Never restore (`--force`)
    pub reads_disabled: bool,
    /// Never save
    pub writes_disabled: bool,
}

/// Run-scoped cache façade shared by every task.
pub struct RunCache {
    cache: Arc<Cache>,
    repo_root: PathBuf,
    globber: Globber,
    output_logs_override: Option<OutputLogsMode>,
    reads_disabled: bool,
    writes_disabled: bool,
    warnings: Mutex<Vec<String>>,
    output_watcher: Arc<dyn OutputWatcher>,
}

impl std::fmt::Debug for RunCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCache")
            .field("repo_root", &self.repo_root)
            .field("output_logs_override", &self.output_logs_override)
            .field("reads_disabled", &self.reads_disabled)
            .field("writes_disabled", &self.writes_disabled)
            .finish_non_exhaustive()
    }
}

impl RunCache {
    /// Wrap `cache` for a run rooted at `repo_root`.
    ///
    /// Reads (writes) are disabled when `opts` says so or when neither store
    /// can read (write).
    pub fn new(cache: Arc<Cache>, repo_root: impl AsRef<Path>, opts: RunCacheOpts) -> Self {
        let config = cache.config();
        let repo_root = repo_root.as_ref().to_path_buf();
        Self {
            reads_disabled: opts.reads_disabled || !config.can_read(),
            writes_disabled: opts.writes_disabled || !config.can_write(),
            output_logs_override: opts.output_logs_override,
            globber: Globber::new(&repo_root),
            repo_root,
            cache,
            warnings: Mutex::new(Vec::new()),
            output_watcher: Arc::new(NoopOutputWatcher),
        }
    }

    /// Consult `watcher` before fetching and notify it after writing.
    #[must_use]
    pub fn with_output_watcher(mut self, watcher: Arc<dyn OutputWatcher>) -> Self {
        self.output_watcher = watcher;
        self
    }

    /// Repository root every output path is relative to.
    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Whether restores are skipped for the whole run.
    #[must_use]
    pub const fn reads_disabled(&self) -> bool {
        self.reads_disabled
    }

    /// Whether saves are skipped for the whole run.
    #[must_use]
    pub const fn writes_disabled(&self) -> bool {
        self.writes_disabled
    }

    /// Cache handle for one task.
    ///
    /// `package_dir` is the package's repo-relative, `/`-separated directory
    /// (empty for the root package) and `hash` the task's computed hash.
    #[must_use]
    pub fn task_cache(
        self: &Arc<Self>,
        task_id: TaskId,
        definition: &TaskDefinition,
        package_dir: &str,
        hash: &str,
    ) -> TaskCache {
        let log_file = TaskDefinition::package_relative_log_file(&task_id.task);
        let log_file = if package_dir.is_empty() {
            log_file
        } else {
            format!("{package_dir}/{log_file}")
        };

        TaskCache {
            run_cache: Arc::clone(self),
            outputs: definition.repo_relative_hashable_outputs(&task_id.task, package_dir),
            declares_outputs: !definition.task_outputs().inclusions.is_empty(),
            output_logs: self.output_logs_override.unwrap_or(definition.output_logs),
            caching_disabled: !definition.is_cacheable(),
            log_file_path: self.repo_root.join(&log_file),
            log_file,
            hash: hash.to_string(),
            task_id,
            expanded_outputs: Vec::new(),
        }
    }

    fn push_warning(&self, warning: String) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning);
    }

    /// Warnings collected so far, sorted.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        warnings.sort();
        warnings
    }

    /// End-of-run reporting: collected warnings and, once, the notice that
    /// the remote cache was switched off.
    pub fn shutdown(&self) {
        for warning in self.warnings() {
            warn!("{warning}");
        }
        let run_state = self.cache.run_state();
        if run_state.take_trip_notice() {
            emit_remote_degraded!(run_state.failures());
        }
    }
}

/// Cache handle for one task invocation.
#[derive(Debug)]
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    task_id: TaskId,
    hash: String,
    outputs: TaskOutputs,
    declares_outputs: bool,
    output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file: String,
    log_file_path: PathBuf,
    expanded_outputs: Vec<String>,
}

impl TaskCache {
    /// Effective output mode after the run-wide override.
    #[must_use]
    pub const fn output_logs(&self) -> OutputLogsMode {
        self.output_logs
    }

    /// Whether this task never touches the cache.
    #[must_use]
    pub const fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    /// Task hash this handle was created for.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Absolute path of the task's log file.
    #[must_use]
    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    /// Repo-relative output paths restored or saved by this handle.
    #[must_use]
    pub fn expanded_outputs(&self) -> &[String] {
        &self.expanded_outputs
    }

    /// Status text for modes that print one; empty for the quiet modes.
    fn status_text(&self, text: impl FnOnce() -> String) -> String {
        match self.output_logs {
            OutputLogsMode::None | OutputLogsMode::ErrorsOnly => String::new(),
            _ => text(),
        }
    }

    /// Replay the task's log file if it exists.
    pub fn replay_log_file(&self, output: &mut impl CacheOutput) -> Result<()> {
        if self.log_file_path.exists() {
            output.replay_logs(&self.log_file_path)?;
        }
        Ok(())
    }

    /// Failure path: under `errors-only` nothing was shown yet, so print the
    /// miss status and the captured log now.
    pub fn on_error(&self, output: &mut impl CacheOutput) -> Result<()> {
        if self.output_logs == OutputLogsMode::ErrorsOnly {
            output.status(
                &format!("cache miss, executing {}", self.hash),
                CacheResult::Miss,
            );
            self.replay_log_file(output)?;
        }
        Ok(())
    }

    /// Sink for the task's live output.
    ///
    /// The log file is opened (and truncated) here, before the task starts,
    /// unless nothing will be saved. The console only sees output in the
    /// `full` and `new-only` modes.
    pub fn output_writer<W: Write>(&self, writer: W) -> Result<LogWriter<W>> {
        let mut log_writer = LogWriter::default();
        if !self.caching_disabled && !self.run_cache.writes_disabled {
            log_writer.with_log_file(&self.log_file_path)?;
        }
        match self.output_logs {
            OutputLogsMode::Full | OutputLogsMode::NewOnly => log_writer.with_writer(writer),
            OutputLogsMode::None | OutputLogsMode::HashOnly | OutputLogsMode::ErrorsOnly => {}
        }
        Ok(log_writer)
    }

    /// Whether an artifact exists for this task's hash, without restoring it.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>> {
        Ok(self.run_cache.cache.exists(&self.hash).await?)
    }

    /// Restore outputs for this task's hash.
    ///
    /// `Ok(None)` means the task must run, either because caching is
    /// bypassed or because no artifact exists.
    #[tracing::instrument(skip_all, fields(task = %self.task_id, hash = %self.hash))]
    pub async fn restore_outputs(
        &mut self,
        output: &mut impl CacheOutput,
    ) -> Result<Option<CacheHitMetadata>> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            let message = self.status_text(|| format!("cache bypass, force executing {}", self.hash));
            output.status(&message, CacheResult::Miss);
            emit_cache_bypass!(self.task_id, self.hash);
            return Ok(None);
        }

        let inclusions = &self.outputs.inclusions;
        let changed = match self
            .run_cache
            .output_watcher
            .changed_outputs(&self.hash, inclusions)
            .await
        {
            Ok(changed) => changed.len(),
            Err(e) => {
                debug!(error = %e, "Output watcher unavailable; checking the cache");
                inclusions.len()
            }
        };

        let metadata = if changed == 0 {
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: 0,
            }
        } else {
            let fetched = self
                .run_cache
                .cache
                .fetch(&self.run_cache.repo_root, &self.hash)
                .await?;
            let Some((metadata, restored)) = fetched else {
                let message = self.status_text(|| format!("cache miss, executing {}", self.hash));
                output.status(&message, CacheResult::Miss);
                emit_cache_miss!(self.task_id, self.hash);
                return Ok(None);
            };
            self.expanded_outputs = restored;
            self.notify_written(metadata.time_saved).await;
            metadata
        };
        emit_cache_hit!(self.task_id, self.hash, metadata.source);

        let context = if changed == 0 {
            " (outputs already on disk)"
        } else {
            ""
        };
        match self.output_logs {
            OutputLogsMode::HashOnly | OutputLogsMode::NewOnly => {
                output.status(
                    &format!("cache hit{context}, suppressing logs {}", self.hash),
                    CacheResult::Hit,
                );
            }
            OutputLogsMode::Full => {
                debug!(log_file = %self.log_file_path.display(), "Replaying logs");
                output.status(
                    &format!("cache hit{context}, replaying logs {}", self.hash),
                    CacheResult::Hit,
                );
                self.replay_log_file(output)?;
            }
            // A hit means the task succeeded, so there are no errors to show.
            OutputLogsMode::ErrorsOnly | OutputLogsMode::None => {}
        }

        Ok(Some(metadata))
    }

    /// Archive the task's outputs and log after it ran.
    ///
    /// Glob errors are returned. A failed store write is logged and
    /// otherwise ignored.
    #[tracing::instrument(skip_all, fields(task = %self.task_id, hash = %self.hash))]
    pub async fn save_outputs(&mut self, duration: Duration) -> Result<()> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }
        debug!(outputs = ?self.outputs, "Caching outputs");

        // Rooted at the repo so globs climbing out of it are rejected.
        let files = self.run_cache.globber.resolve(
            "",
            &self.outputs.inclusions,
            &self.outputs.exclusions,
            WalkType::All,
        )?;

        if self.declares_outputs && files.iter().all(|f| *f == self.log_file) {
            self.run_cache.push_warning(format!(
                "no output files found for task {}. Please check the `outputs` key of its definition",
                self.task_id
            ));
        }

        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let file_count = files.len();
        match self
            .run_cache
            .cache
            .put(&self.run_cache.repo_root, &self.hash, files.clone(), duration_ms)
            .await
        {
            Ok(()) => emit_cache_saved!(self.task_id, self.hash, file_count),
            Err(e) => warn!(task = %self.task_id, error = %e, "Failed to cache outputs"),
        }

        self.notify_written(duration_ms).await;
        self.expanded_outputs = files;
        Ok(())
    }

    async fn notify_written(&self, time_saved: u64) {
        if let Err(e) = self
            .run_cache
            .output_watcher
            .notify_outputs_written(
                &self.hash,
                &self.outputs.inclusions,
                &self.outputs.exclusions,
                time_saved,
            )
            .await
        {
            debug!(task = %self.task_id, error = %e, "Failed to mark outputs as written");
        }
    }
}
