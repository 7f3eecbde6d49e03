//! Filesystem artifact store.
//!
//! Layout of the cache directory:
//!
//! ```text
//! {hash}.tar.zst      archive of the task's outputs
//! {hash}.tar          legacy uncompressed archive (read only)
//! {hash}-meta.json    {"hash": "...", "duration": <ms>}
//! ```

use crate::archive::{ArchiveFile, CacheReader};
use crate::{CacheHitMetadata, CacheSource, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static META_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

/// Reject hashes that could address a file outside the cache directory.
pub(crate) fn validate_hash(hash: &str) -> Result<()> {
    if hash.is_empty()
        || !hash
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::configuration(format!("invalid artifact hash '{hash}'")));
    }
    Ok(())
}

/// Artifact store in a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    cache_dir: PathBuf,
}

impl LocalStore {
    /// Open (and create if needed) the store at `cache_dir`.
    #[tracing::instrument(skip_all, fields(cache_dir = %cache_dir.as_ref().display()))]
    pub fn new(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)
            .map_err(|e| Error::io(e, &cache_dir, "create cache directory"))?;
        Ok(Self { cache_dir })
    }

    /// Directory holding the artifacts.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path the archive for `hash` is written to.
    #[must_use]
    pub fn archive_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}.tar.zst"))
    }

    fn legacy_archive_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}.tar"))
    }

    fn metadata_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}-meta.json"))
    }

    fn existing_archive(&self, hash: &str) -> Option<PathBuf> {
        [self.archive_path(hash), self.legacy_archive_path(hash)]
            .into_iter()
            .find(|p| p.is_file())
    }

    /// Restore the artifact for `hash` below `anchor`.
    ///
    /// Returns `Ok(None)` when no archive exists. A missing or unreadable
    /// metadata file still counts as a hit with zero time saved.
    #[tracing::instrument(skip_all, fields(hash = %hash))]
    pub fn fetch(&self, anchor: &Path, hash: &str) -> Result<Option<(CacheHitMetadata, Vec<String>)>> {
        validate_hash(hash)?;
        let Some(archive_path) = self.existing_archive(hash) else {
            debug!("Local cache miss");
            return Ok(None);
        };

        let files = CacheReader::open(&archive_path)?.restore(anchor)?;
        let time_saved = self.read_duration(hash);
        debug!(files = files.len(), time_saved, "Local cache hit");

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved,
            },
            files,
        )))
    }

    /// Whether an archive for `hash` exists, without restoring it.
    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>> {
        validate_hash(hash)?;
        if self.existing_archive(hash).is_none() {
            return Ok(None);
        }
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: self.read_duration(hash),
        }))
    }

    /// Archive `files` (relative to `anchor`) as the artifact for `hash`.
    ///
    /// Files that are neither regular files, directories nor symlinks are
    /// skipped with a warning; any other failure abandons the write and
    /// leaves no partial archive behind.
    #[tracing::instrument(skip_all, fields(hash = %hash, files = files.len()))]
    pub fn put(&self, anchor: &Path, hash: &str, files: &[String], duration: u64) -> Result<()> {
        validate_hash(hash)?;
        let mut archive = ArchiveFile::create(&self.archive_path(hash))?;
        for file in files {
            match archive.add_file(anchor, file) {
                Ok(()) => {}
                Err(Error::UnsupportedFileType { path }) => {
                    warn!(path = %path.display(), "Skipping output with unsupported file type");
                }
                Err(e) => return Err(e),
            }
        }
        archive.finish()?;
        self.write_metadata(hash, duration)
    }

    fn read_duration(&self, hash: &str) -> u64 {
        let path = self.metadata_path(hash);
        let parsed = fs::read_to_string(&path)
            .map_err(|e| Error::io(e, &path, "read metadata"))
            .and_then(|s| {
                serde_json::from_str::<CacheMetadata>(&s)
                    .map_err(|e| Error::serialization(e.to_string()))
            });
        match parsed {
            Ok(meta) => meta.duration,
            Err(e) => {
                debug!(error = %e, "No usable metadata for cached artifact");
                0
            }
        }
    }

    fn write_metadata(&self, hash: &str, duration: u64) -> Result<()> {
        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
        };
        let json = serde_json::to_string(&meta).map_err(|e| Error::serialization(e.to_string()))?;

        let final_path = self.metadata_path(hash);
        let unique = META_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .cache_dir
            .join(format!(".{hash}-meta.json.{}.{unique}.tmp", std::process::id()));
        fs::write(&temp_path, json).map_err(|e| Error::io(e, &temp_path, "write metadata"))?;
        fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::io(e, &final_path, "rename metadata")
        })
    }
}
