//! Output watcher seam.
//!
//! A long-lived process (a daemon or watch mode) can track which output
//! globs changed on disk since they were last restored or produced for a
//! given hash. When nothing changed, a hit can skip the cache entirely.

use crate::Result;
use async_trait::async_trait;

/// Tracks whether a task's outputs are still on disk as last written.
#[async_trait]
pub trait OutputWatcher: Send + Sync {
    /// The subset of `globs` whose matches changed since outputs for `hash`
    /// were last written. Unknown hashes report every glob.
    async fn changed_outputs(&self, hash: &str, globs: &[String]) -> Result<Vec<String>>;

    /// Record that outputs for `hash` were just written to disk.
    async fn notify_outputs_written(
        &self,
        hash: &str,
        inclusions: &[String],
        exclusions: &[String],
        time_saved: u64,
    ) -> Result<()>;
}

/// Watcher for runs without one: every glob always counts as changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOutputWatcher;

#[async_trait]
impl OutputWatcher for NoopOutputWatcher {
    async fn changed_outputs(&self, _hash: &str, globs: &[String]) -> Result<Vec<String>> {
        Ok(globs.to_vec())
    }

    async fn notify_outputs_written(
        &self,
        _hash: &str,
        _inclusions: &[String],
        _exclusions: &[String],
        _time_saved: u64,
    ) -> Result<()> {
        Ok(())
    }
}
