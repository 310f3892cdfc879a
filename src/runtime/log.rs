//! Append-only message log
//!
//! One writer thread owns the write handle and commits submissions in the
//! order they were handed over. Sequence ids are assigned at submission under
//! the same lock that enqueues, so submission order, commit order and id order
//! agree even with many producers. Reads go through their own file handle and
//! only ever observe whole, committed records.
//!
//! On-disk format: one JSON-encoded [`Message`] per line.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::error::{LogError, LogResult};
use super::message::{Message, SequenceId};

/// Commands kept in a history window besides the all-uppercase verbs:
/// joins, channel/direct text, and the numerics for topic (332),
/// names (353, 366) and unknown command (421).
pub const HISTORY_COMMANDS: &[&str] = &[
    "JOIN", "PART", "PRIVMSG", "NOTICE", "332", "353", "366", "421",
];

/// Message log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// How often an idle writer wakes to check for shutdown
    pub poll_interval_ms: u64,

    /// fsync every record before taking the next one
    pub sync: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            sync: true,
        }
    }
}

/// True if `command` belongs in a conversational history window.
///
/// Either listed in `allowed`, or made of two or more uppercase ASCII letters.
pub fn is_conversational(command: &str, allowed: &[&str]) -> bool {
    allowed.contains(&command)
        || (command.len() >= 2 && command.bytes().all(|b| b.is_ascii_uppercase()))
}

struct Pending {
    sequence_id: SequenceId,
    message: Message,
}

/// Location of one committed record
#[derive(Debug, Clone)]
struct IndexEntry {
    offset: u64,
    len: usize,
    command: String,
}

/// In-memory index of every decodable record, in file order.
///
/// Built once when the log is opened and extended by the writer after each
/// commit, so history reads touch only the records they return.
#[derive(Debug, Default)]
struct LogIndex {
    entries: Vec<IndexEntry>,
}

/// Result of scanning a log file from the start
struct Scan {
    index: LogIndex,
    last_id: SequenceId,
    /// Length up to the end of the last whole record
    valid_len: u64,
}

/// Read side of a message log.
///
/// Obtained from [`MessageLog::reader`] for the live log, or from
/// [`LogReader::open`] to inspect a log another process may be writing.
pub struct LogReader {
    file: Mutex<Option<File>>,
    index: Arc<RwLock<LogIndex>>,
}

impl LogReader {
    /// Open `path` for reading only. Nothing is repaired or truncated, and a
    /// record still being written is left out.
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                file: Mutex::new(None),
                index: Arc::new(RwLock::new(LogIndex::default())),
            });
        }
        let scan = scan_file(path)?;
        Ok(Self {
            file: Mutex::new(Some(File::open(path)?)),
            index: Arc::new(RwLock::new(scan.index)),
        })
    }

    /// Up to `limit` committed messages, most recent first, whose command passes
    /// [`is_conversational`] against `allowed`.
    pub fn history(&self, limit: usize, allowed: &[&str]) -> LogResult<Vec<Message>> {
        self.recent(limit, |command| is_conversational(command, allowed))
    }

    /// Up to `limit` committed messages of any command, most recent first.
    pub fn tail(&self, limit: usize) -> LogResult<Vec<Message>> {
        self.recent(limit, |_| true)
    }

    fn recent(&self, limit: usize, keep: impl Fn(&str) -> bool) -> LogResult<Vec<Message>> {
        let wanted: Vec<IndexEntry> = self
            .index
            .read()
            .entries
            .iter()
            .rev()
            .filter(|entry| keep(&entry.command))
            .take(limit)
            .cloned()
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::with_capacity(wanted.len());
        let mut record = Vec::new();
        for entry in wanted {
            record.resize(entry.len, 0);
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut record)?;
            match serde_json::from_slice::<Message>(&record) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::warn!(offset = entry.offset, error = %err, "skipping undecodable log record");
                }
            }
        }
        Ok(messages)
    }
}

struct Submitter {
    next_id: SequenceId,
    tx: Option<Sender<Pending>>,
}

/// Ordered, durable store of every message the agent has seen or sent.
pub struct MessageLog {
    path: PathBuf,
    submitter: Mutex<Submitter>,
    reader: LogReader,
    running: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MessageLog {
    /// Open (or create) the log at `path` and start its writer thread.
    ///
    /// A torn final record left by a crash is truncated first; numbering
    /// resumes after the highest committed id.
    pub fn open(path: impl Into<PathBuf>, config: LogConfig) -> LogResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let scan = validate_and_repair(&path)?;
        let last_id = scan.last_id;
        let index = Arc::new(RwLock::new(scan.index));

        let write_handle = OpenOptions::new().create(true).append(true).open(&path)?;
        let committed_len = write_handle.metadata()?.len();
        let read_handle = File::open(&path)?;

        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let writer = LogWriter {
            file: write_handle,
            committed_len,
            torn: false,
            sync: config.sync,
            index: Arc::clone(&index),
        };
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("message-log-writer".into())
            .spawn(move || writer.run(rx, flag, poll))?;

        tracing::debug!(path = %path.display(), last_id, "message log opened");

        Ok(Self {
            path,
            submitter: Mutex::new(Submitter {
                next_id: last_id + 1,
                tx: Some(tx),
            }),
            reader: LogReader {
                file: Mutex::new(Some(read_handle)),
                index,
            },
            running,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read side of this log
    pub fn reader(&self) -> &LogReader {
        &self.reader
    }

    /// Hand a message to the writer and return the id it will be committed under.
    ///
    /// Never waits for the commit. Fails only once the log is closed.
    pub fn append(&self, message: Message) -> LogResult<SequenceId> {
        let mut submitter = self.submitter.lock();
        let sequence_id = submitter.next_id;
        let tx = submitter.tx.as_ref().ok_or(LogError::Closed)?;
        tx.send(Pending {
            sequence_id,
            message,
        })
        .map_err(|_| LogError::Closed)?;
        submitter.next_id += 1;
        Ok(sequence_id)
    }

    /// See [`LogReader::history`].
    pub fn history(&self, limit: usize, allowed: &[&str]) -> LogResult<Vec<Message>> {
        self.reader.history(limit, allowed)
    }

    /// See [`LogReader::tail`].
    pub fn tail(&self, limit: usize) -> LogResult<Vec<Message>> {
        self.reader.tail(limit)
    }

    /// Stop accepting submissions and wait up to `timeout` for the writer to
    /// commit what it already has.
    pub fn close(&self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        self.submitter.lock().tx = None;

        let Some(handle) = self.writer.lock().take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(path = %self.path.display(), "message log writer did not stop in time");
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            tracing::error!("message log writer panicked");
        }
    }
}

impl Drop for MessageLog {
    fn drop(&mut self) {
        self.close(Duration::from_secs(2));
    }
}

struct LogWriter {
    file: File,
    committed_len: u64,
    /// A failed write could not be rolled back; the file may end mid-record
    torn: bool,
    sync: bool,
    index: Arc<RwLock<LogIndex>>,
}

impl LogWriter {
    fn run(mut self, rx: Receiver<Pending>, running: Arc<AtomicBool>, poll: Duration) {
        loop {
            match rx.recv_timeout(poll) {
                Ok(pending) => self.commit(pending),
                Err(RecvTimeoutError::Timeout) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while let Ok(pending) = rx.try_recv() {
            self.commit(pending);
        }
        tracing::debug!("message log writer stopped");
    }

    /// Failures are logged and the record dropped; the file is cut back to the
    /// last whole record so later commits stay readable.
    fn commit(&mut self, pending: Pending) {
        let sequence_id = pending.sequence_id;
        if let Err(err) = self.write_record(pending) {
            tracing::error!(sequence_id, error = %err, "failed to commit message");
            if let Err(err) = self.file.set_len(self.committed_len) {
                tracing::error!(error = %err, "failed to roll back partial record");
                self.torn = true;
            }
        }
    }

    fn write_record(&mut self, pending: Pending) -> LogResult<()> {
        if self.torn {
            // Close off the fragment so it stays a line of its own
            let len = self.file.metadata()?.len();
            self.file.write_all(b"\n")?;
            self.committed_len = len + 1;
            self.torn = false;
        }

        let mut message = pending.message;
        message.sequence_id = Some(pending.sequence_id);
        message.timestamp = Some(chrono::Utc::now());

        let mut encoded = serde_json::to_vec(&message)?;
        encoded.push(b'\n');

        self.file.write_all(&encoded)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }

        let offset = self.committed_len;
        self.committed_len += encoded.len() as u64;
        self.index.write().entries.push(IndexEntry {
            offset,
            len: encoded.len() - 1,
            command: message.command,
        });
        Ok(())
    }
}

/// Index every decodable record. Undecodable lines are skipped; an
/// unterminated or undecodable final line is left outside `valid_len`.
fn scan_file(path: &Path) -> LogResult<Scan> {
    let data = std::fs::read(path)?;
    let mut index = LogIndex::default();
    let mut last_id = 0;
    let mut valid_len = 0u64;

    let mut lines = data.split_inclusive(|b| *b == b'\n').peekable();
    while let Some(line) = lines.next() {
        let offset = valid_len;
        let is_last = lines.peek().is_none();

        let decoded = line
            .strip_suffix(b"\n")
            .ok_or_else(|| LogError::Corrupted {
                offset,
                detail: "unterminated record".into(),
            })
            .and_then(|record| serde_json::from_slice::<Message>(record).map_err(LogError::from));

        match decoded {
            Ok(message) => {
                last_id = message.sequence_id.unwrap_or(last_id).max(last_id);
                index.entries.push(IndexEntry {
                    offset,
                    len: line.len() - 1,
                    command: message.command,
                });
            }
            Err(err) if is_last => {
                tracing::warn!(
                    "Torn record found in {} at offset {}: {}",
                    path.display(),
                    offset,
                    err
                );
                break;
            }
            Err(err) => {
                tracing::warn!(
                    "Skipping corrupted record in {} at offset {}: {}",
                    path.display(),
                    offset,
                    err
                );
            }
        }
        valid_len += line.len() as u64;
    }

    Ok(Scan {
        index,
        last_id,
        valid_len,
    })
}

/// Truncate a torn final record and index what remains.
fn validate_and_repair(path: &Path) -> LogResult<Scan> {
    if !path.exists() {
        return Ok(Scan {
            index: LogIndex::default(),
            last_id: 0,
            valid_len: 0,
        });
    }

    let scan = scan_file(path)?;
    let file_len = std::fs::metadata(path)?.len();
    if scan.valid_len < file_len {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(scan.valid_len)?;
        file.sync_all()?;
        tracing::info!("Truncated {} to {} bytes", path.display(), scan.valid_len);
    }

    Ok(scan)
}
