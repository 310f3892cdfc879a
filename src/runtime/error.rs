//! Error types for the Lain runtime
//!
//! Each subsystem owns a thiserror enum and handles it at its own boundary.
//! The orchestrator and binary fold them into `anyhow::Error`.

use std::io;
use thiserror::Error;

/// A line that matched neither the wire nor the authored grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("couldn't parse {raw:?}: {reason}")]
pub struct ParseError {
    /// The offending input, as received.
    pub raw: String,
    /// Which part of the grammar rejected it.
    pub reason: &'static str,
}

impl ParseError {
    pub(crate) fn new(raw: &str, reason: &'static str) -> Self {
        Self {
            raw: raw.to_string(),
            reason,
        }
    }
}

/// Convenience result alias for grammar operations
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Message log errors
#[derive(Debug, Error)]
pub enum LogError {
    /// The writer has shut down and accepts no more submissions
    #[error("message log is closed")]
    Closed,

    /// A committed record could not be decoded
    #[error("Corrupted record at offset {offset}: {detail}")]
    Corrupted {
        /// Byte offset of the record
        offset: u64,
        /// Description of the corruption
        detail: String,
    },

    /// Encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for log operations
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream, or the writer task is gone
    #[error("connection closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Generation backend errors
#[derive(Debug, Error)]
pub enum GenerationError {
    /// HTTP client error (connect, send, body decode)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("backend returned status {0}")]
    Status(u16),

    /// Backend reply lacked the expected fields
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The call did not finish in time
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// The request queue is at capacity
    #[error("generation queue is full")]
    QueueFull,

    /// The gateway worker is gone
    #[error("generation gateway is closed")]
    Closed,
}

/// Convenience result alias for generation operations
pub type GenerationResult<T> = std::result::Result<T, GenerationError>;
