//! Restoring output archives.

use super::is_compressed;
use crate::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::debug;

enum Source<R: Read> {
    Plain(R),
    Zstd(zstd::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
        }
    }
}

/// Streams a tar archive back onto disk below an anchor directory.
pub struct CacheReader<R: Read> {
    archive: tar::Archive<Source<R>>,
}

impl CacheReader<File> {
    /// Open the archive at `path`; `.zst` selects decompression.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path, "open archive"))?;
        Self::from_reader(file, is_compressed(path))
    }
}

struct PendingLink {
    name: String,
    target: String,
}

impl<R: Read> CacheReader<R> {
    /// Read an archive from `reader`, zstd-compressed when `compressed` is set.
    pub fn from_reader(reader: R, compressed: bool) -> Result<Self> {
        let source = if compressed {
            Source::Zstd(
                zstd::Decoder::new(reader)
                    .map_err(|e| Error::io_no_path(e, "start decompression"))?,
            )
        } else {
            Source::Plain(reader)
        };
        Ok(Self {
            archive: tar::Archive::new(source),
        })
    }

    /// Extract every entry below `anchor` and return the restored names.
    ///
    /// Entry names that are absolute or contain `..` are rejected, as is any
    /// write that would pass through a symlink resolving outside `anchor`.
    /// Existing files are replaced. Symlinks whose targets do not exist yet
    /// are created after everything else, ordered so that links to links
    /// come after their targets.
    pub fn restore(&mut self, anchor: &Path) -> Result<Vec<String>> {
        fs::create_dir_all(anchor).map_err(|e| Error::io(e, anchor, "create restore root"))?;
        let root = fs::canonicalize(anchor).map_err(|e| Error::io(e, anchor, "resolve"))?;

        let mut restored = Vec::new();
        let mut deferred = Vec::new();
        let entries = self
            .archive
            .entries()
            .map_err(|e| Error::io_no_path(e, "read archive"))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| Error::io_no_path(e, "read archive entry"))?;
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let entry_type = entry.header().entry_type();
            if matches!(entry_type, EntryType::XGlobalHeader | EntryType::XHeader) {
                continue;
            }

            let name = normalize_entry_name(&raw)?;
            let mode = entry.header().mode().ok();
            match entry_type {
                EntryType::Directory => restore_dir(&root, &name, mode)?,
                EntryType::Regular | EntryType::Continuous => {
                    restore_regular(&root, &name, &mut entry, mode)?;
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name_bytes()
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .ok_or_else(|| Error::invalid_archive_path(&raw))?;
                    if link_target_exists(&root, &name, &target) {
                        restore_symlink(&root, &name, &target)?;
                    } else {
                        deferred.push(PendingLink { name, target });
                        continue;
                    }
                }
                _ => {
                    return Err(Error::UnsupportedFileType {
                        path: Path::new(&raw).into(),
                    });
                }
            }
            restored.push(name);
        }

        for link in order_links(deferred)? {
            restore_symlink(&root, &link.name, &link.target)?;
            restored.push(link.name);
        }

        debug!(anchor = %anchor.display(), files = restored.len(), "Restored archive");
        Ok(restored)
    }
}

fn normalize_entry_name(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic();
    if raw.starts_with('/') || raw.starts_with('\\') || has_drive {
        return Err(Error::invalid_archive_path(raw));
    }

    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(Error::invalid_archive_path(raw)),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(Error::invalid_archive_path(raw));
    }
    Ok(segments.join("/"))
}

/// Create the parent directories of `name` below `root`, refusing to pass
/// through links that leave `root`. Returns the entry's own path.
fn prepare_parent(root: &Path, name: &str) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    let mut segments = name.split('/').peekable();
    while let Some(segment) = segments.next() {
        current.push(segment);
        if segments.peek().is_none() {
            break;
        }
        ensure_directory(root, &current, name)?;
    }
    Ok(current)
}

fn ensure_directory(root: &Path, dir: &Path, name: &str) -> Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let resolved = fs::canonicalize(dir).map_err(|e| Error::io(e, dir, "resolve link"))?;
            if resolved.starts_with(root) {
                Ok(())
            } else {
                Err(Error::link_escape(name))
            }
        }
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::io(
            io::Error::from(io::ErrorKind::NotADirectory),
            dir,
            "create directory",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::create_dir(dir) {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
                Err(Error::io(e, dir, "create directory"))
            }
            _ => Ok(()),
        },
        Err(e) => Err(Error::io(e, dir, "stat")),
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(Error::io(
            io::Error::from(io::ErrorKind::IsADirectory),
            path,
            "replace",
        )),
        Ok(_) => fs::remove_file(path).map_err(|e| Error::io(e, path, "replace")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "stat")),
    }
}

fn restore_dir(root: &Path, name: &str, mode: Option<u32>) -> Result<()> {
    let path = prepare_parent(root, name)?;
    ensure_directory(root, &path, name)?;
    let is_link = fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink());
    if !is_link {
        set_mode(&path, mode)?;
    }
    Ok(())
}

fn restore_regular(root: &Path, name: &str, data: &mut impl Read, mode: Option<u32>) -> Result<()> {
    let path = prepare_parent(root, name)?;
    remove_existing(&path)?;
    let mut file = File::create(&path).map_err(|e| Error::io(e, &path, "create"))?;
    io::copy(data, &mut file).map_err(|e| Error::io(e, &path, "write"))?;
    drop(file);
    set_mode(&path, mode)
}

fn restore_symlink(root: &Path, name: &str, target: &str) -> Result<()> {
    let path = prepare_parent(root, name)?;
    remove_existing(&path)?;
    make_symlink(target, &path)
}

fn link_target_exists(root: &Path, name: &str, target: &str) -> bool {
    let parent = Path::new(name).parent().unwrap_or_else(|| Path::new(""));
    root.join(parent).join(target).exists()
}

/// Repo-relative path a link points at, if it stays within the archive.
fn resolve_link_target(name: &str, target: &str) -> Option<String> {
    if target.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = name.split('/').collect();
    parts.pop();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

/// Order dangling links so that a link is created after any link it
/// points into.
fn order_links(links: Vec<PendingLink>) -> Result<Vec<PendingLink>> {
    if links.len() <= 1 {
        return Ok(links);
    }

    let index: HashMap<&str, usize> = links
        .iter()
        .enumerate()
        .map(|(i, link)| (link.name.as_str(), i))
        .collect();

    let mut graph = DiGraphMap::<usize, ()>::new();
    for i in 0..links.len() {
        graph.add_node(i);
    }
    for (i, link) in links.iter().enumerate() {
        let Some(resolved) = resolve_link_target(&link.name, &link.target) else {
            continue;
        };
        let mut candidate = resolved.as_str();
        loop {
            if let Some(&dependency) = index.get(candidate) {
                graph.add_edge(dependency, i, ());
            }
            match candidate.rsplit_once('/') {
                Some((parent, _)) => candidate = parent,
                None => break,
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        let node = cycle.node_id();
        let members = tarjan_scc(&graph)
            .into_iter()
            .find(|component| component.contains(&node))
            .unwrap_or_else(|| vec![node]);
        let mut names: Vec<String> = members.iter().map(|&i| links[i].name.clone()).collect();
        names.sort();
        Error::CyclicLinks { links: names }
    })?;

    let mut slots: Vec<Option<PendingLink>> = links.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path).map_err(|e| Error::io(e, path, "symlink"))
}

#[cfg(windows)]
fn make_symlink(target: &str, path: &Path) -> Result<()> {
    let native = target.replace('/', "\\");
    let resolved = path
        .parent()
        .map_or_else(|| PathBuf::from(&native), |p| p.join(&native));
    let result = if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(&native, path)
    } else {
        std::os::windows::fs::symlink_file(&native, path)
    };
    result.map_err(|e| Error::io(e, path, "symlink"))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| Error::io(e, path, "set permissions"))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
