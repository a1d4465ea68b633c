//! Append-only JSONL persistence for security events.
//!
//! Events are buffered and checkpointed to disk every `flush_threshold`
//! records, on critical events, on explicit [`EventLog::flush`], and when the
//! log is dropped. The file is rotated once it exceeds `max_bytes`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::event::SecurityEvent;
use veilvault_common::Result;

const MAX_ROTATIONS: usize = 5;

pub struct EventLog {
    path: PathBuf,
    pending: Mutex<Vec<SecurityEvent>>,
    flush_threshold: usize,
    max_bytes: u64,
}

impl EventLog {
    /// Open (or create on first flush) the log at `path`.
    pub fn open<P: AsRef<Path>>(path: P, flush_threshold: usize, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            pending: Mutex::new(Vec::new()),
            flush_threshold: flush_threshold.max(1),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer an event, writing the buffer out if it reached the threshold.
    pub fn append(&self, event: SecurityEvent, force_flush: bool) -> Result<()> {
        let mut pending = self.pending.lock();
        pending.push(event);
        if force_flush || pending.len() >= self.flush_threshold {
            self.write_pending(&mut pending)?;
        }
        Ok(())
    }

    /// Write every buffered event to disk.
    pub fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        self.write_pending(&mut pending)
    }

    /// Number of events not yet on disk.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn write_pending(&self, pending: &mut Vec<SecurityEvent>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for event in pending.iter() {
            let line = serde_json::to_string(event)?;
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        file.sync_data()?;

        debug!(count = pending.len(), "Security events checkpointed");
        pending.clear();
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..MAX_ROTATIONS).rev() {
            let from = self.rotated_path(i);
            if from.exists() {
                fs::rename(&from, self.rotated_path(i + 1))?;
            }
        }
        fs::rename(&self.path, self.rotated_path(1))?;
        debug!(path = %self.path.display(), "Security event log rotated");
        Ok(())
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// Read every event currently on disk, oldest first. Rotated files are
    /// not included.
    pub fn read_all(&self) -> Result<Vec<SecurityEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush security events on shutdown");
        }
    }
}
