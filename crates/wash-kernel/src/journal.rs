//! Per-actor activity journals.
//!
//! Every request entering the core is tagged with a [`JournalId`] derived
//! from the originating actor (kernel pid + executable for FUSE, a header
//! or synthesized id for HTTP), so one user command yields one journal.
//! Each capability invocation appends a JSON line to
//! `<user-cache>/wash/activity/<id>.log`.
//!
//! Writes are buffered and flushed best-effort: journaling must never block
//! or fail the primary request. A crash loses at most the unflushed tail.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use wash_types::{Action, EntryPath, WashError};

/// Identifies the actor a journal belongs to.
///
/// Derived from stable identifiers of the originator and sanitized so it is
/// always a safe file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JournalId(String);

impl JournalId {
    /// Sanitize an arbitrary id into a file-stem-safe one.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let sanitized: String = raw
            .as_ref()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if sanitized.is_empty() {
            JournalId("unknown".to_string())
        } else {
            JournalId(sanitized)
        }
    }

    /// The conventional id for a kernel-originated request: pid plus the
    /// executable name, so repeated invocations of one command share a
    /// journal.
    pub fn for_process(pid: u32, executable: &str) -> Self {
        JournalId::new(format!("{}-{}", pid, executable))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JournalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One capability invocation, as recorded in a journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// When the invocation started.
    pub at: DateTime<Utc>,
    pub action: Action,
    pub path: EntryPath,
    /// Wall time the invocation took, in milliseconds.
    pub duration_ms: u64,
    /// `None` on success; the error category and message otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JournalError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalError {
    pub category: String,
    pub message: String,
}

impl JournalRecord {
    pub fn new(
        at: SystemTime,
        action: Action,
        path: EntryPath,
        duration: Duration,
        outcome: Result<(), &WashError>,
    ) -> Self {
        Self {
            at: DateTime::<Utc>::from(at),
            action,
            path,
            duration_ms: duration.as_millis() as u64,
            error: outcome.err().map(|e| JournalError {
                category: e.category().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Summary of one journal on disk, as enumerated by `wash history`.
#[derive(Debug, Clone, Serialize)]
pub struct JournalInfo {
    pub id: JournalId,
    pub started: Option<DateTime<Utc>>,
    pub size: u64,
}

#[derive(Default)]
struct JournalFile {
    /// `None` until the first append opens the file.
    writer: Option<BufWriter<File>>,
    written: u64,
    opened: Option<SystemTime>,
}

/// The journal store: one log file per journal id.
pub struct Journal {
    dir: PathBuf,
    max_size: u64,
    max_age: Duration,
    // Lock per journal id; the outer lock is only held to find the inner one.
    files: Mutex<HashMap<JournalId, Arc<Mutex<JournalFile>>>>,
}

impl Journal {
    pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

    /// Open (creating if needed) the journal directory.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_size: Self::DEFAULT_MAX_SIZE,
            max_age: Self::DEFAULT_MAX_AGE,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_rotation(mut self, max_size: u64, max_age: Duration) -> Self {
        self.max_size = max_size;
        self.max_age = max_age;
        self
    }

    /// Open the journal at the conventional XDG location.
    pub fn open_default() -> std::io::Result<Self> {
        Self::open(crate::paths::activity_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &JournalId) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    /// Append a record to `id`'s journal.
    ///
    /// Failures are logged and swallowed: journaling never fails a request.
    pub fn append(&self, id: &JournalId, record: &JournalRecord) {
        let line = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize journal record: {}", e);
                return;
            }
        };

        let file = {
            let mut files = self.files.lock().expect("journal lock poisoned");
            files.entry(id.clone()).or_default().clone()
        };

        let mut file = file.lock().expect("journal file lock poisoned");
        if let Err(e) = self.write_line(id, &mut file, &line) {
            warn!(journal = %id, "failed to append journal record: {}", e);
        }
    }

    fn write_line(
        &self,
        id: &JournalId,
        file: &mut JournalFile,
        line: &str,
    ) -> std::io::Result<()> {
        match file.state(self.max_size, self.max_age) {
            FileState::Ready => {}
            FileState::NeedsOpen => self.reopen(id, file, false)?,
            FileState::NeedsRotation => self.reopen(id, file, true)?,
        }

        let writer = file.writer.as_mut().expect("reopen left no writer");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        file.written += line.len() as u64 + 1;
        // Best-effort durability; a crash loses at most this record.
        let _ = writer.flush();
        Ok(())
    }

    fn reopen(&self, id: &JournalId, file: &mut JournalFile, rotate: bool) -> std::io::Result<()> {
        let path = self.path_for(id);
        if rotate {
            if let Some(writer) = file.writer.as_mut() {
                let _ = writer.flush();
            }
            std::fs::rename(&path, path.with_extension("log.1"))?;
        }
        let handle = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = handle.metadata().map(|m| m.len()).unwrap_or(0);
        file.writer = Some(BufWriter::new(handle));
        file.written = written;
        file.opened = Some(SystemTime::now());
        Ok(())
    }

    /// Enumerate journals on disk, newest first.
    pub fn list(&self) -> std::io::Result<Vec<JournalInfo>> {
        let mut infos = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".log")) else {
                continue;
            };
            let meta = dirent.metadata()?;
            let started = self
                .read_first_record(&dirent.path())
                .map(|r| r.at)
                .or_else(|| meta.modified().ok().map(DateTime::<Utc>::from));
            infos.push(JournalInfo {
                id: JournalId::new(stem),
                started,
                size: meta.len(),
            });
        }
        infos.sort_by(|a, b| b.started.cmp(&a.started));
        Ok(infos)
    }

    /// Read every record line of one journal.
    pub fn read(&self, id: &JournalId) -> std::io::Result<String> {
        std::fs::read_to_string(self.path_for(id))
    }

    fn read_first_record(&self, path: &Path) -> Option<JournalRecord> {
        let content = std::fs::read_to_string(path).ok()?;
        let first = content.lines().next()?;
        serde_json::from_str(first).ok()
    }
}

enum FileState {
    Ready,
    NeedsOpen,
    NeedsRotation,
}

impl JournalFile {
    fn state(&self, max_size: u64, max_age: Duration) -> FileState {
        let Some(opened) = self.opened else {
            return FileState::NeedsOpen;
        };
        if self.writer.is_none() {
            return FileState::NeedsOpen;
        }
        if self.written >= max_size {
            return FileState::NeedsRotation;
        }
        let aged = opened
            .elapsed()
            .map(|age| age >= max_age)
            .unwrap_or(false);
        if aged {
            return FileState::NeedsRotation;
        }
        FileState::Ready
    }
}
