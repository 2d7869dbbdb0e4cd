//! Common data types used across the data_capture subsystem.

use std::backtrace::Backtrace;
use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of the bytes flowing through a wrapped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Bytes returned to the caller by a read.
    Read,
    /// Bytes accepted by the underlying connection on a write.
    Write,
}

/// Wall-clock bookkeeping for the reads and writes of one connection.
///
/// `first_*` fields are set once and never overwritten. `last_*` fields
/// bracket the most recent operation in each direction and are overwritten by
/// every new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoTimeline {
    pub first_read_at: Option<DateTime<Utc>>,
    pub first_write_at: Option<DateTime<Utc>>,
    pub last_read_start: Option<DateTime<Utc>>,
    pub last_read_end: Option<DateTime<Utc>>,
    pub last_write_start: Option<DateTime<Utc>>,
    pub last_write_end: Option<DateTime<Utc>>,
}

impl IoTimeline {
    pub fn operation_started(&mut self, direction: Direction, at: DateTime<Utc>) {
        match direction {
            Direction::Read => {
                self.first_read_at.get_or_insert(at);
                self.last_read_start = Some(at);
            }
            Direction::Write => {
                self.first_write_at.get_or_insert(at);
                self.last_write_start = Some(at);
            }
        }
    }

    pub fn operation_finished(&mut self, direction: Direction, at: DateTime<Utc>) {
        match direction {
            Direction::Read => self.last_read_end = Some(at),
            Direction::Write => self.last_write_end = Some(at),
        }
    }
}

/// Context retained when a read from the underlying connection fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTrace {
    pub captured_at: DateTime<Utc>,
    /// `io::ErrorKind` of the failed read, formatted with `Debug`.
    pub kind: String,
    pub message: String,
    pub backtrace: String,
}

impl FailureTrace {
    /// Captures the current stack together with the error that triggered it.
    ///
    /// The backtrace is forced regardless of `RUST_BACKTRACE` because it is
    /// only taken on the failure path.
    pub fn capture(err: &io::Error) -> Self {
        Self {
            captured_at: Utc::now(),
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.backtrace.is_empty()
    }
}

impl fmt::Display for FailureTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "read failed at {} ({}): {}",
            self.captured_at.to_rfc3339(),
            self.kind,
            self.message
        )?;
        write!(f, "{}", self.backtrace)
    }
}

/// Point-in-time copy of everything the recorder knows about a connection.
///
/// Intended for post-mortem dumps once a connection misbehaved; the mirrors
/// are empty when mirroring was stopped before the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    pub connection_id: Uuid,
    pub sniffing: bool,
    pub mirroring: bool,
    pub sniff_count: u64,
    pub read_mirror: Vec<u8>,
    pub write_mirror: Vec<u8>,
    pub timeline: IoTimeline,
    pub failure_trace: Option<FailureTrace>,
}

impl CaptureSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
