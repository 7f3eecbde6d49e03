//! Writing output archives.

use super::is_compressed;
use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tar::{EntryType, Header};

const WRITE_BUFFER_SIZE: usize = 1 << 20;

// 0 selects zstd's default level.
const ZSTD_LEVEL: i32 = 0;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

enum Sink<W: Write> {
    Plain(W),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

impl<W: Write> Sink<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Zstd(w) => w.finish(),
        }
    }
}

/// Streams files into a tar archive with fixed metadata.
///
/// Headers carry zero uid/gid/mtime/atime/ctime, so archiving identical trees
/// in the same order yields identical bytes.
pub struct CacheWriter<W: Write> {
    builder: tar::Builder<Sink<W>>,
}

impl<W: Write> CacheWriter<W> {
    /// Archive into `writer`, zstd-compressed when `compressed` is set.
    pub fn from_writer(writer: W, compressed: bool) -> Result<Self> {
        let sink = if compressed {
            Sink::Zstd(
                zstd::Encoder::new(writer, ZSTD_LEVEL)
                    .map_err(|e| Error::io_no_path(e, "start compression"))?,
            )
        } else {
            Sink::Plain(writer)
        };
        Ok(Self {
            builder: tar::Builder::new(sink),
        })
    }

    /// Add `anchor/name` under the archive name `name`.
    pub fn add_file(&mut self, anchor: &Path, name: &str) -> Result<()> {
        self.add(name, &anchor.join(name))
    }

    /// Add the file, directory or symlink at `source` under `name`.
    ///
    /// Symlinks are stored as links, never followed.
    pub fn add(&mut self, name: &str, source: &Path) -> Result<()> {
        let meta =
            fs::symlink_metadata(source).map_err(|e| Error::io(e, source, "stat output"))?;
        let file_type = meta.file_type();

        let mut header = Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(0);
            gnu.set_ctime(0);
        }

        if file_type.is_symlink() {
            let target = fs::read_link(source).map_err(|e| Error::io(e, source, "readlink"))?;
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            self.builder
                .append_link(&mut header, name, link_target(&target))
                .map_err(|e| Error::io(e, source, "archive symlink"))?;
        } else if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(file_mode(&meta));
            header.set_size(0);
            self.builder
                .append_data(&mut header, name, io::empty())
                .map_err(|e| Error::io(e, source, "archive directory"))?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(file_mode(&meta));
            header.set_size(meta.len());
            let file = File::open(source).map_err(|e| Error::io(e, source, "open output"))?;
            self.builder
                .append_data(&mut header, name, file)
                .map_err(|e| Error::io(e, source, "archive file"))?;
        } else {
            return Err(Error::UnsupportedFileType {
                path: source.into(),
            });
        }
        Ok(())
    }

    /// Write the archive trailer and end the compression frame.
    pub fn finish(self) -> Result<W> {
        let sink = self
            .builder
            .into_inner()
            .map_err(|e| Error::io_no_path(e, "finish archive"))?;
        sink.finish()
            .map_err(|e| Error::io_no_path(e, "finish compression"))
    }
}

/// An archive being written to disk.
///
/// Data goes to a temporary sibling of the final path which is renamed into
/// place by [`ArchiveFile::finish`]. Dropping an unfinished archive deletes
/// the temporary file, so readers never observe a partial archive.
pub struct ArchiveFile {
    writer: Option<CacheWriter<BufWriter<File>>>,
    temp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl ArchiveFile {
    /// Start an archive that will land at `path`; `.zst` selects compression.
    pub fn create(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::configuration(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create cache directory"))?;

        let temp_path = temp_path_for(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::io(e, &temp_path, "create archive"))?;
        let writer = CacheWriter::from_writer(
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            is_compressed(path),
        )?;

        Ok(Self {
            writer: Some(writer),
            temp_path,
            final_path: path.to_path_buf(),
            finished: false,
        })
    }

    /// See [`CacheWriter::add_file`].
    pub fn add_file(&mut self, anchor: &Path, name: &str) -> Result<()> {
        self.writer()?.add_file(anchor, name)
    }

    /// See [`CacheWriter::add`].
    pub fn add(&mut self, name: &str, source: &Path) -> Result<()> {
        self.writer()?.add(name, source)
    }

    /// Complete the archive and move it to its final path.
    pub fn finish(mut self) -> Result<()> {
        let writer = self.writer.take().ok_or_else(closed)?;
        let buffered = writer.finish()?;
        let file = buffered
            .into_inner()
            .map_err(|e| Error::io(e.into_error(), &self.temp_path, "flush archive"))?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| Error::io(e, &self.final_path, "rename archive"))?;
        self.finished = true;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut CacheWriter<BufWriter<File>>> {
        self.writer.as_mut().ok_or_else(closed)
    }
}

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        // Close the file before removing it.
        self.writer.take();
        if !self.finished {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

fn closed() -> Error {
    Error::configuration("archive writer already closed")
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let file_name = final_path
        .file_name()
        .map_or_else(|| "archive".into(), |n| n.to_string_lossy());
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    final_path.with_file_name(format!(".{file_name}.{}.{unique}.tmp", std::process::id()))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(windows)]
fn link_target(target: &Path) -> PathBuf {
    PathBuf::from(target.to_string_lossy().replace('\\', "/"))
}

#[cfg(not(windows))]
fn link_target(target: &Path) -> PathBuf {
    target.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let temp = temp_path_for(Path::new("/cache/abc.tar.zst"));
        assert_eq!(temp.parent(), Some(Path::new("/cache")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".abc.tar.zst."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn test_dropped_archive_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let target = tmp.path().join("cache").join("h.tar.zst");

        let mut archive = ArchiveFile::create(&target).unwrap();
        archive.add_file(tmp.path(), "a.txt").unwrap();
        drop(archive);

        assert!(!target.exists());
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("cache"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let mut writer = CacheWriter::from_writer(Vec::new(), false).unwrap();
        let err = writer.add_file(tmp.path(), "nope.txt").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_fifo_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let fifo = tmp.path().join("pipe");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        if !status.success() {
            return;
        }
        let mut writer = CacheWriter::from_writer(Vec::new(), false).unwrap();
        let err = writer.add_file(tmp.path(), "pipe").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFileType { .. }));
    }
}
