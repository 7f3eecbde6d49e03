//! Task log capture and replay.
//!
//! While a task runs, its output goes through a [`LogWriter`], which tees it
//! into the task's log file and, depending on the output mode, the console.
//! On a cache hit the archived log is replayed through a [`CacheOutput`].

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Outcome reported alongside a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResult {
    /// Outputs were restored (or already on disk)
    Hit,
    /// The task has to run
    Miss,
}

/// Sink for the user-facing side of cache decisions.
pub trait CacheOutput {
    /// Report a cache decision. An empty message still signals the result.
    fn status(&mut self, message: &str, result: CacheResult);

    /// Report a problem with the task's cache handling.
    fn error(&mut self, message: &str);

    /// Replay a task log, one line at a time.
    fn replay_logs(&mut self, log_file: &Path) -> Result<()>;
}

/// [`CacheOutput`] that writes to any [`Write`], prefixing every line.
#[derive(Debug)]
pub struct LogReplayer<W> {
    prefix: String,
    writer: W,
}

impl<W: Write> LogReplayer<W> {
    /// Create a replayer whose lines start with `prefix` (e.g. `web:build: `).
    pub fn new(prefix: impl Into<String>, writer: W) -> Self {
        Self {
            prefix: prefix.into(),
            writer,
        }
    }

    /// Give back the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(self.prefix.as_bytes())?;
        self.writer.write_all(line)?;
        if !line.ends_with(b"\n") {
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl<W: Write> CacheOutput for LogReplayer<W> {
    fn status(&mut self, message: &str, _result: CacheResult) {
        if message.is_empty() {
            return;
        }
        if let Err(e) = self.write_line(message.as_bytes()) {
            tracing::debug!(error = %e, "Failed to write cache status");
        }
    }

    fn error(&mut self, message: &str) {
        if let Err(e) = self.write_line(message.as_bytes()) {
            tracing::debug!(error = %e, "Failed to write cache error");
        }
    }

    fn replay_logs(&mut self, log_file: &Path) -> Result<()> {
        let file = File::open(log_file).map_err(|e| Error::io(e, log_file, "open log file"))?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| Error::io(e, log_file, "read log file"))?;
            if read == 0 {
                break;
            }
            self.write_line(&line)
                .map_err(|e| Error::io_no_path(e, "replay log"))?;
        }
        self.writer
            .flush()
            .map_err(|e| Error::io_no_path(e, "flush replayed log"))
    }
}

/// Tee for a running task's output.
///
/// Writes go to the log file (if any) and then to the console writer (if
/// any). The log file is unbuffered so a crash mid-task still leaves
/// everything written so far on disk.
#[derive(Debug)]
pub struct LogWriter<W> {
    log_file: Option<File>,
    writer: Option<W>,
}

impl<W> Default for LogWriter<W> {
    fn default() -> Self {
        Self {
            log_file: None,
            writer: None,
        }
    }
}

impl<W: Write> LogWriter<W> {
    /// Start capturing into `path`, creating parent directories and
    /// truncating any previous log.
    pub fn with_log_file(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create log directory"))?;
        }
        let file = File::create(path).map_err(|e| Error::io(e, path, "create log file"))?;
        self.log_file = Some(file);
        Ok(())
    }

    /// Also forward output to `writer`.
    pub fn with_writer(&mut self, writer: W) {
        self.writer = Some(writer);
    }

    /// Whether output is being captured to a log file.
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.log_file.is_some()
    }
}

impl<W: Write> Write for LogWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = self.log_file.as_mut() {
            file.write_all(buf)?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.log_file.as_mut() {
            file.flush()?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
