//! Reproducible tar archives of task outputs.
//!
//! Archives ending in `.zst` are zstd-compressed; anything else is plain tar.
//! Entry names are repo-relative with `/` separators.

mod create;
mod restore;

pub use create::{ArchiveFile, CacheWriter};
pub use restore::CacheReader;

use std::path::Path;

pub(crate) fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "zst")
}
