//! Include/exclude glob resolution rooted at a package directory.
//!
//! Patterns are written relative to a package but matched against
//! repo-relative, `/`-separated paths. Resolution rules:
//!
//! - An empty include list means every file under the package.
//! - Exclusions are checked first and always win.
//! - `.` and `..` segments are collapsed before matching; a pattern that
//!   climbs above the repository root is an error, never a silent no-op.
//! - A bare directory name (`dist`) matches the directory entry only.
//!   Descendants need `dist/**`, which in turn does not match `dist` itself.
//! - `*` never crosses a `/`; `**` does.
//! - An exclusion ending in `/` excludes everything below that directory.
//!
//! Results are deduplicated and returned in byte order.

use crate::{Error, Result};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Which filesystem entries a walk reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkType {
    /// Regular files and symlinks (inputs for hashing).
    Files,
    /// Files, symlinks and directories (outputs for archiving).
    All,
}

/// Resolves glob patterns against a repository checkout.
#[derive(Debug, Clone)]
pub struct Globber {
    repo_root: PathBuf,
}

impl Globber {
    /// Create a globber for the repository rooted at `repo_root`.
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
        }
    }

    /// The repository root all results are relative to.
    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Resolve `include`/`exclude` patterns written relative to `base_dir`.
    ///
    /// `base_dir` may be repo-relative or an absolute path inside the
    /// repository. Returned paths are repo-relative and `/`-separated.
    pub fn resolve(
        &self,
        base_dir: impl AsRef<Path>,
        include: &[String],
        exclude: &[String],
        walk_type: WalkType,
    ) -> Result<Vec<String>> {
        let base = self.relative_base(base_dir.as_ref())?;
        let _span = tracing::debug_span!(
            "globber.resolve",
            base = %base,
            include = include.len(),
            exclude = exclude.len()
        )
        .entered();

        let include: Vec<String> = if include.is_empty() {
            vec![anchor_pattern(&base, "**")?]
        } else {
            include
                .iter()
                .map(|p| anchor_pattern(&base, p))
                .collect::<Result<_>>()?
        };
        let exclude: Vec<String> = exclude
            .iter()
            .map(|p| {
                let anchored = anchor_pattern(&base, p)?;
                Ok(if p.ends_with('/') {
                    format!("{anchored}/**")
                } else {
                    anchored
                })
            })
            .collect::<Result<_>>()?;

        self.resolve_anchored(&include, &exclude, walk_type)
    }

    /// Resolve patterns that are already repo-relative.
    pub fn resolve_anchored(
        &self,
        include: &[String],
        exclude: &[String],
        walk_type: WalkType,
    ) -> Result<Vec<String>> {
        let exclude_set = build_set(exclude)?;
        let mut found = BTreeSet::new();

        for pattern in include {
            let matcher = build_matcher(pattern)?;
            let base = literal_prefix(pattern);

            if base == *pattern {
                // No glob metacharacters: a direct lookup, no traversal.
                let path = self.repo_root.join(&base);
                if let Ok(meta) = fs::symlink_metadata(&path)
                    && accepts(walk_type, meta.file_type().is_dir())
                    && !exclude_set.is_match(&base)
                {
                    found.insert(base);
                }
                continue;
            }

            let walk_root = self.repo_root.join(&base);
            if !walk_root.exists() {
                tracing::trace!(pattern = %pattern, "Glob base does not exist, skipping");
                continue;
            }

            let walker = WalkDir::new(&walk_root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git");
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let path = err.path().map_or_else(|| walk_root.clone(), Path::to_path_buf);
                        if let Some(io) = err.into_io_error() {
                            if io.kind() == std::io::ErrorKind::NotFound {
                                continue;
                            }
                            return Err(Error::io(io, path, "walk"));
                        }
                        continue;
                    }
                };

                if !accepts(walk_type, entry.file_type().is_dir()) {
                    continue;
                }
                let Some(rel) = self.to_repo_relative(entry.path()) else {
                    continue;
                };
                if rel.is_empty() || exclude_set.is_match(&rel) {
                    continue;
                }
                if matcher.is_match(&rel) {
                    found.insert(rel);
                }
            }
        }

        tracing::debug!(matched = found.len(), "Glob resolution complete");
        Ok(found.into_iter().collect())
    }

    fn relative_base(&self, base_dir: &Path) -> Result<String> {
        let rel = if base_dir.is_absolute() {
            base_dir
                .strip_prefix(&self.repo_root)
                .map_err(|_| Error::glob_escape(base_dir.display().to_string()))?
        } else {
            base_dir
        };
        let rel = to_slash(rel);
        collapse(&rel).ok_or_else(|| Error::glob_escape(rel.clone()))
    }

    fn to_repo_relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.repo_root).ok().map(to_slash)
    }
}

fn accepts(walk_type: WalkType, is_dir: bool) -> bool {
    match walk_type {
        WalkType::Files => !is_dir,
        WalkType::All => true,
    }
}

/// Join `pattern` onto the repo-relative `base` and collapse dot segments.
fn anchor_pattern(base: &str, pattern: &str) -> Result<String> {
    let pattern = pattern.replace('\\', "/");
    if pattern.starts_with('/') {
        return Err(Error::glob_escape(pattern));
    }
    let joined = if base.is_empty() {
        pattern.clone()
    } else {
        format!("{base}/{pattern}")
    };
    collapse(&joined).ok_or_else(|| Error::glob_escape(pattern))
}

/// Collapse `.`, `..` and empty segments. `None` if the path climbs above
/// its starting point.
fn collapse(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

/// Leading segments of `pattern` that contain no glob metacharacters.
fn literal_prefix(pattern: &str) -> String {
    pattern
        .split('/')
        .take_while(|part| !part.contains(['*', '?', '[', '{']))
        .collect::<Vec<_>>()
        .join("/")
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_matcher(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::invalid_glob(pattern, e.to_string()))
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::invalid_glob(pattern, e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::invalid_glob(patterns.join(","), e.to_string()))
}
