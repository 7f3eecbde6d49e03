//! Artifact storage for cachet task outputs.
//!
//! A task's outputs are archived under its task hash and stored in up to two
//! places:
//!
//! - [`LocalStore`]: a directory of `{hash}.tar.zst` archives plus
//!   `{hash}-meta.json` timing metadata.
//! - [`RemoteStore`]: an HTTP API shared between machines, with retries,
//!   optional HMAC signing and a per-run failure circuit breaker
//!   ([`RunState`]).
//!
//! [`Cache`] combines the two: reads try local first and backfill it from a
//! remote hit; writes go to every enabled store. Cache failures never fail a
//! task. They are logged and treated as a miss (or a skipped write).

#![expect(
    clippy::missing_errors_doc,
    reason = "Error conditions are documented on the error enum"
)]

pub mod archive;
pub mod config;
mod error;
pub mod local;
pub mod remote;
pub mod run_state;

pub use cachet_events::HitSource as CacheSource;
pub use config::{CacheActions, CacheConfig, CacheOpts, RemoteCacheConfig, RetryConfig, SignatureConfig};
pub use error::{Error, Error as CacheError, Result};
pub use local::LocalStore;
pub use remote::{RemoteArtifact, RemoteStore};
pub use run_state::RunState;

use cachet_events::redact;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a hit came from and how long the original run took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    /// Store that served the hit
    pub source: CacheSource,
    /// Execution time of the run that produced the artifact, in milliseconds
    pub time_saved: u64,
}

/// Local and remote stores behind one interface.
#[derive(Debug)]
pub struct Cache {
    local: Option<Arc<LocalStore>>,
    remote: Option<Arc<RemoteStore>>,
    config: CacheConfig,
    run_state: Arc<RunState>,
}

impl Cache {
    /// Build the stores enabled by `opts`.
    ///
    /// A remote store is only created when a remote configuration with a
    /// token exists and remote reads or writes are enabled.
    #[tracing::instrument(skip_all)]
    pub fn new(opts: &CacheOpts, repo_root: &Path, run_state: Arc<RunState>) -> Result<Self> {
        let local = if opts.cache.local.any() {
            Some(Arc::new(LocalStore::new(opts.resolve_cache_dir(repo_root))?))
        } else {
            None
        };

        let remote = match &opts.remote {
            Some(remote) if opts.cache.remote.any() && !remote.token.is_empty() => Some(Arc::new(
                RemoteStore::new(remote, Arc::clone(&run_state))?,
            )),
            Some(_) if opts.cache.remote.any() => {
                warn!("Remote cache configured without a token; using local cache only");
                None
            }
            _ => None,
        };

        Ok(Self::from_stores(local, remote, opts.cache, run_state))
    }

    /// Assemble a cache from already-built stores.
    #[must_use]
    pub fn from_stores(
        local: Option<Arc<LocalStore>>,
        remote: Option<Arc<RemoteStore>>,
        config: CacheConfig,
        run_state: Arc<RunState>,
    ) -> Self {
        debug!(
            local = local.is_some(),
            remote = remote.is_some(),
            %config,
            "Cache configured"
        );
        Self {
            local,
            remote,
            config,
            run_state,
        }
    }

    /// Run-scoped remote state.
    #[must_use]
    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    /// Effective read/write switches, accounting for missing stores.
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        let mut config = self.config;
        if self.local.is_none() {
            config.local = CacheActions::DISABLED;
        }
        if self.remote.is_none() {
            config.remote = CacheActions::DISABLED;
        }
        config
    }

    fn local_reads(&self) -> Option<&Arc<LocalStore>> {
        self.local.as_ref().filter(|_| self.config.local.read)
    }

    fn local_writes(&self) -> Option<&Arc<LocalStore>> {
        self.local.as_ref().filter(|_| self.config.local.write)
    }

    fn remote_reads(&self) -> Option<&Arc<RemoteStore>> {
        self.remote
            .as_ref()
            .filter(|_| self.config.remote.read && !self.run_state.is_tripped())
    }

    fn remote_writes(&self) -> Option<&Arc<RemoteStore>> {
        self.remote
            .as_ref()
            .filter(|_| self.config.remote.write && !self.run_state.is_tripped())
    }

    /// Restore the artifact for `hash` below `anchor`.
    ///
    /// Local is tried first. A remote hit is written back to the local store
    /// when local writes are enabled. Store failures are logged and reported
    /// as a miss.
    #[tracing::instrument(skip_all, fields(hash = %hash))]
    pub async fn fetch(&self, anchor: &Path, hash: &str) -> Result<Option<(CacheHitMetadata, Vec<String>)>> {
        if let Some(local) = self.local_reads() {
            let store = Arc::clone(local);
            let (anchor_buf, owned_hash) = (anchor.to_path_buf(), hash.to_string());
            match tokio::task::spawn_blocking(move || store.fetch(&anchor_buf, &owned_hash)).await? {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Local cache read failed; treating as a miss"),
            }
        }

        let Some(remote) = self.remote_reads() else {
            return Ok(None);
        };
        match remote.fetch_files(anchor, hash).await {
            Ok(Some((meta, files))) => {
                self.backfill_local(anchor, hash, &files, meta.time_saved).await;
                Ok(Some((meta, files)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                log_remote_error(&e, "Remote cache read failed; treating as a miss");
                Ok(None)
            }
        }
    }

    async fn backfill_local(&self, anchor: &Path, hash: &str, files: &[String], duration: u64) {
        let Some(local) = self.local_writes() else {
            return;
        };
        let store = Arc::clone(local);
        let (anchor, hash, files) = (anchor.to_path_buf(), hash.to_string(), files.to_vec());
        let result =
            tokio::task::spawn_blocking(move || store.put(&anchor, &hash, &files, duration)).await;
        match result {
            Ok(Ok(())) => debug!("Copied remote artifact into local cache"),
            Ok(Err(e)) => warn!(error = %e, "Failed to copy remote artifact into local cache"),
            Err(e) => warn!(error = %e, "Local cache backfill task failed"),
        }
    }

    /// Whether an artifact for `hash` exists, checking local then remote.
    #[tracing::instrument(skip_all, fields(hash = %hash))]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>> {
        if let Some(local) = self.local_reads() {
            match local.exists(hash) {
                Ok(Some(meta)) => return Ok(Some(meta)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Local cache lookup failed"),
            }
        }
        let Some(remote) = self.remote_reads() else {
            return Ok(None);
        };
        match remote.exists(hash).await {
            Ok(meta) => Ok(meta),
            Err(e) => {
                log_remote_error(&e, "Remote cache lookup failed; treating as a miss");
                Ok(None)
            }
        }
    }

    /// Store `files` (relative to `anchor`) as the artifact for `hash`.
    ///
    /// The remote upload is attempted even when the local write fails. A
    /// local write failure is returned afterwards; a remote write failure is
    /// only logged.
    #[tracing::instrument(skip_all, fields(hash = %hash, files = files.len()))]
    pub async fn put(&self, anchor: &Path, hash: &str, files: Vec<String>, duration: u64) -> Result<()> {
        let mut local_result = Ok(());
        let mut local_archive: Option<PathBuf> = None;
        if let Some(local) = self.local_writes() {
            let store = Arc::clone(local);
            let (anchor_buf, owned_hash, owned_files) =
                (anchor.to_path_buf(), hash.to_string(), files.clone());
            match tokio::task::spawn_blocking(move || {
                store.put(&anchor_buf, &owned_hash, &owned_files, duration)
            })
            .await?
            {
                Ok(()) => local_archive = Some(local.archive_path(hash)),
                Err(e) => {
                    warn!(error = %e, "Local cache write failed");
                    local_result = Err(e);
                }
            }
        }

        let Some(remote) = self.remote_writes() else {
            return local_result;
        };
        let result = match local_archive {
            // Archives are reproducible, so the local file is the upload body.
            Some(path) => match tokio::fs::read(&path).await {
                Ok(body) => remote.put(hash, body.into(), duration).await,
                Err(e) => Err(Error::io(e, &path, "read archive")),
            },
            None => remote.put_files(anchor, hash, files, duration).await,
        };
        if let Err(e) = result {
            log_remote_error(&e, "Remote cache write failed; continuing without it");
        }
        local_result
    }
}

fn log_remote_error(err: &Error, message: &str) {
    match err {
        Error::TooManyFailures { .. } | Error::Cancelled => {
            debug!(error = %err, "{message}");
        }
        _ => warn!(error = %redact(&err.to_string()), "{message}"),
    }
}
