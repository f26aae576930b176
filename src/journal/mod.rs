//! Append-Only Session Journal
//!
//! One file per session under the data directory, named by the session id in
//! hex. Everything needed to rebuild a session is in its file: the genesis
//! record (seed, creator, init args), then every committed method call and
//! every state-changing tick, in order.
//!
//! ```text
//! data/
//! ├── 00000000000004d2.log
//! └── 000000000000162e.log
//! ```
//!
//! A session exclusively owns its [`SessionLog`] while active. Dropping or
//! unloading the handle flushes it, so a later recovery can reopen the file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::codec::{CodecError, Reader};
use crate::core::ids::SessionId;

pub mod frame;
pub mod record;
pub mod replay;

pub use record::{JournalEntry, LogRecord};
pub use replay::{replay, ReplayError, Replayed};

/// Journal file extension.
pub const LOG_EXTENSION: &str = "log";

/// Extra extension of the sidecar that keeps a dropped torn tail.
pub const TORN_EXTENSION: &str = "torn";

/// Slack allowed between a record's timestamp and the file's mtime.
const CLOCK_SKEW_MS: u64 = 60_000;

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// No journal exists for this session.
    #[error("no journal for session {0}")]
    NotFound(SessionId),

    /// A journal already exists where a new session wants to start one.
    #[error("journal for session {0} already exists")]
    AlreadyExists(SessionId),

    /// A record failed to decode, or intact records follow an incomplete one.
    #[error("corrupt journal for session {session} at byte {offset}: {reason}")]
    Corrupt {
        /// Session whose journal is corrupt.
        session: SessionId,
        /// Byte offset of the bad record.
        offset: usize,
        /// What went wrong.
        reason: String,
    },

    /// Filesystem failure.
    #[error("journal I/O error at {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl JournalError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory of session journals.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
    sync_writes: bool,
}

impl Journal {
    /// Open (creating if needed) a journal directory.
    pub fn open(dir: impl Into<PathBuf>, sync_writes: bool) -> JournalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| JournalError::io(&dir, e))?;
        Ok(Self { dir, sync_writes })
    }

    /// Directory holding the journals.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether appends are flushed to disk before returning.
    pub fn sync_writes(&self) -> bool {
        self.sync_writes
    }

    /// File path for a session.
    pub fn path_for(&self, session: SessionId) -> PathBuf {
        self.dir.join(format!("{}.{}", session, LOG_EXTENSION))
    }

    /// Whether a session has a journal on disk.
    pub fn exists(&self, session: SessionId) -> bool {
        self.path_for(session).is_file()
    }

    /// Sessions with a journal on disk, sorted.
    pub fn sessions(&self) -> JournalResult<Vec<SessionId>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| JournalError::io(&self.dir, e))?;
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| JournalError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(SessionId::from_hex)
            {
                sessions.push(id);
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Start a new journal with its genesis record.
    pub fn create(
        &self,
        session: SessionId,
        timestamp: u64,
        genesis: &LogRecord,
    ) -> JournalResult<SessionLog> {
        let path = self.path_for(session);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => JournalError::AlreadyExists(session),
                _ => JournalError::io(&path, e),
            })?;

        let mut log = SessionLog::new(session, path, file, self.sync_writes);
        log.append(timestamp, genesis)?;
        debug!("Created journal for session {}", session);
        Ok(log)
    }

    /// Sidecar holding bytes dropped from a torn tail.
    pub fn torn_path_for(&self, session: SessionId) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", session, LOG_EXTENSION, TORN_EXTENSION))
    }

    /// Read back every record of a session, in order.
    ///
    /// An incomplete final frame with nothing decodable after it is an
    /// interrupted write: its bytes are moved to the `.torn` sidecar and the
    /// file truncated so appends resume after the last whole record. An
    /// incomplete frame followed by intact records is corruption, and the
    /// file is left untouched.
    pub fn load(&self, session: SessionId) -> JournalResult<Vec<JournalEntry>> {
        let path = self.path_for(session);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(JournalError::NotFound(session))
            }
            Err(e) => return Err(JournalError::io(&path, e)),
        };

        let corrupt = |offset: usize, reason: String| JournalError::Corrupt {
            session,
            offset,
            reason,
        };

        let mut reader = Reader::new(&bytes);
        let mut entries: Vec<JournalEntry> = Vec::new();
        let mut torn_at = None;

        while !reader.is_empty() {
            let offset = reader.position();
            let (timestamp, payload) = match frame::read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(CodecError::UnexpectedEof { .. }) => {
                    torn_at = Some(offset);
                    break;
                }
                Err(e) => return Err(corrupt(offset, e.to_string())),
            };
            let record = LogRecord::decode_payload(payload, entries.is_empty())
                .map_err(|e| corrupt(offset, e.to_string()))?;
            entries.push(JournalEntry { timestamp, record });
        }

        let Some(last) = entries.last() else {
            return Err(corrupt(0, "missing genesis record".to_string()));
        };

        if let Some(offset) = torn_at {
            let tail = &bytes[offset..];
            let newest = modified_millis(&path).saturating_add(CLOCK_SKEW_MS);
            if let Some(next) = intact_frames_after(tail, last.timestamp, newest) {
                return Err(corrupt(
                    offset,
                    format!("incomplete record followed by intact records at byte {}", offset + next),
                ));
            }
            self.set_aside_tail(session, &path, offset, tail)?;
        }

        Ok(entries)
    }

    fn set_aside_tail(
        &self,
        session: SessionId,
        path: &Path,
        offset: usize,
        tail: &[u8],
    ) -> JournalResult<()> {
        let torn_path = self.torn_path_for(session);
        let mut sidecar = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&torn_path)
            .map_err(|e| JournalError::io(&torn_path, e))?;
        sidecar
            .write_all(tail)
            .and_then(|_| sidecar.sync_all())
            .map_err(|e| JournalError::io(&torn_path, e))?;

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| JournalError::io(path, e))?;
        file.set_len(offset as u64)
            .map_err(|e| JournalError::io(path, e))?;

        warn!(
            "Session {} journal has a torn record at byte {} ({} bytes moved to {})",
            session,
            offset,
            tail.len(),
            torn_path.display()
        );
        Ok(())
    }

    /// Reopen an existing journal for appending.
    pub fn open_append(&self, session: SessionId) -> JournalResult<SessionLog> {
        let path = self.path_for(session);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => JournalError::NotFound(session),
                _ => JournalError::io(&path, e),
            })?;
        Ok(SessionLog::new(session, path, file, self.sync_writes))
    }

    /// Delete a session's journal (and any torn-tail sidecar) for good.
    pub fn discard(&self, session: SessionId) -> JournalResult<()> {
        let path = self.path_for(session);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(JournalError::NotFound(session)),
            Err(e) => return Err(JournalError::io(&path, e)),
        }
        let torn_path = self.torn_path_for(session);
        match fs::remove_file(&torn_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JournalError::io(&torn_path, e)),
        }
    }
}

/// Offset of the first position in `tail` (after its first byte) where a run
/// of whole, decodable frames starts and reaches the end of the file exactly.
///
/// Timestamps in the run must not go below `oldest` or above `newest`, which
/// keeps stray bytes inside a genuinely torn record from looking like frames.
fn intact_frames_after(tail: &[u8], oldest: u64, newest: u64) -> Option<usize> {
    (1..tail.len()).find(|&start| frames_reach_end(&tail[start..], oldest, newest))
}

fn frames_reach_end(bytes: &[u8], oldest: u64, newest: u64) -> bool {
    let mut reader = Reader::new(bytes);
    let mut previous = oldest;
    while !reader.is_empty() {
        let Ok((timestamp, payload)) = frame::read_frame(&mut reader) else {
            return false;
        };
        if timestamp < previous
            || timestamp > newest
            || LogRecord::decode_payload(payload, false).is_err()
        {
            return false;
        }
        previous = timestamp;
    }
    true
}

/// Modification time of a file in ms since the epoch, or `u64::MAX` if the
/// platform cannot tell.
fn modified_millis(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(u64::MAX, |d| d.as_millis() as u64)
}

/// Open append handle for one session's journal.
#[derive(Debug)]
pub struct SessionLog {
    session: SessionId,
    path: PathBuf,
    writer: BufWriter<File>,
    sync_writes: bool,
    appended: u64,
}

impl SessionLog {
    fn new(session: SessionId, path: PathBuf, file: File, sync_writes: bool) -> Self {
        Self {
            session,
            path,
            writer: BufWriter::new(file),
            sync_writes,
            appended: 0,
        }
    }

    /// Session this log belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Records appended through this handle.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Append one record and push it to the OS before returning.
    pub fn append(&mut self, timestamp: u64, record: &LogRecord) -> JournalResult<()> {
        let frame = frame::encode_frame(timestamp, &record.encode_payload());
        self.writer
            .write_all(&frame)
            .and_then(|_| self.writer.flush())
            .map_err(|e| JournalError::io(&self.path, e))?;
        if self.sync_writes {
            self.writer
                .get_ref()
                .sync_data()
                .map_err(|e| JournalError::io(&self.path, e))?;
        }
        self.appended += 1;
        Ok(())
    }

    /// Flush, sync and close the handle.
    pub fn unload(mut self) -> JournalResult<()> {
        self.writer
            .flush()
            .map_err(|e| JournalError::io(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| JournalError::io(&self.path, e))?;
        debug!("Unloaded journal for session {}", self.session);
        Ok(())
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush journal for session {}: {}", self.session, e);
        }
    }
}
