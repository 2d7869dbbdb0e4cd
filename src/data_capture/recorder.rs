//! Diagnostics recorder for a single sniffed connection.
//!
//! `ConnRecorder` mirrors every byte read from and written to a wrapped
//! connection, keeps the read/write timeline, counts completed sniff reads and
//! retains a failure trace when the underlying connection errors. It is shared
//! between the I/O path (the owning `SniffingStream`) and any control-plane
//! task holding a `SnifferHandle`, so every field is either atomic or behind
//! a mutex that the I/O path holds only for the duration of a copy.
//!
//! Mirroring can be stopped at any time to reclaim memory. Stopping is
//! one-way: the buffers are released and nothing is appended afterwards.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::{debug, trace};
use uuid::Uuid;

use super::types::{CaptureSnapshot, Direction, FailureTrace, IoTimeline};

#[derive(Debug, Default)]
struct Mirrors {
    stopped: bool,
    read: Vec<u8>,
    write: Vec<u8>,
}

impl Mirrors {
    fn release(&mut self) {
        self.read = Vec::new();
        self.write = Vec::new();
    }
}

#[derive(Debug)]
pub struct ConnRecorder {
    connection_id: Uuid,
    /// Fast-path copy of `!mirrors.stopped`, checked before taking the lock.
    mirroring: AtomicBool,
    mirrors: Mutex<Mirrors>,
    timeline: Mutex<IoTimeline>,
    failure_trace: Mutex<Option<FailureTrace>>,
    sniff_count: AtomicU64,
}

// Diagnostics must keep working after a panic elsewhere poisoned a lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnRecorder {
    /// Creates a recorder for `connection_id`. With `mirroring == false` the
    /// recorder starts in the stopped state and never buffers payloads.
    pub fn new(connection_id: Uuid, mirroring: bool) -> Self {
        Self {
            connection_id,
            mirroring: AtomicBool::new(mirroring),
            mirrors: Mutex::new(Mirrors {
                stopped: !mirroring,
                ..Mirrors::default()
            }),
            timeline: Mutex::new(IoTimeline::default()),
            failure_trace: Mutex::new(None),
            sniff_count: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn is_mirroring(&self) -> bool {
        self.mirroring.load(Ordering::Acquire)
    }

    /// Appends `bytes` to the mirror for `direction` unless mirroring stopped.
    pub fn mirror(&self, direction: Direction, bytes: &[u8]) {
        if !self.is_mirroring() {
            return;
        }

        let mut mirrors = lock(&self.mirrors);
        // Re-checked under the lock so a concurrent stop cannot be followed by an append.
        if mirrors.stopped {
            return;
        }
        match direction {
            Direction::Read => mirrors.read.extend_from_slice(bytes),
            Direction::Write => mirrors.write.extend_from_slice(bytes),
        }
    }

    /// Stops mirroring and releases both mirror buffers. Idempotent.
    pub fn stop_mirroring(&self) {
        self.mirroring.store(false, Ordering::Release);

        let mut mirrors = lock(&self.mirrors);
        if !mirrors.stopped {
            debug!(
                "[{}] mirroring stopped, releasing {} read / {} written bytes",
                self.connection_id,
                mirrors.read.len(),
                mirrors.write.len()
            );
        }
        mirrors.stopped = true;
        mirrors.release();
    }

    pub fn read_mirror_bytes(&self) -> Vec<u8> {
        lock(&self.mirrors).read.clone()
    }

    pub fn write_mirror_bytes(&self) -> Vec<u8> {
        lock(&self.mirrors).write.clone()
    }

    pub fn operation_started(&self, direction: Direction) {
        lock(&self.timeline).operation_started(direction, Utc::now());
    }

    pub fn operation_finished(&self, direction: Direction) {
        lock(&self.timeline).operation_finished(direction, Utc::now());
    }

    pub fn timeline(&self) -> IoTimeline {
        *lock(&self.timeline)
    }

    /// Retains the stack and error context of a failed read, replacing any
    /// earlier trace.
    pub fn record_failure(&self, err: &io::Error) {
        trace!(
            "[{}] capturing failure trace for {:?}",
            self.connection_id,
            err.kind()
        );
        *lock(&self.failure_trace) = Some(FailureTrace::capture(err));
    }

    pub fn failure_trace(&self) -> Option<FailureTrace> {
        lock(&self.failure_trace).clone()
    }

    /// Counts one completed sniff read and returns the counter value it was
    /// recorded under (zero for the first sniff).
    pub fn next_sniff(&self) -> u64 {
        self.sniff_count.fetch_add(1, Ordering::AcqRel)
    }

    pub fn sniff_count(&self) -> u64 {
        self.sniff_count.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, sniffing: bool) -> CaptureSnapshot {
        let (read_mirror, write_mirror, mirroring) = {
            let mirrors = lock(&self.mirrors);
            (mirrors.read.clone(), mirrors.write.clone(), !mirrors.stopped)
        };

        CaptureSnapshot {
            connection_id: self.connection_id,
            sniffing,
            mirroring,
            sniff_count: self.sniff_count(),
            read_mirror,
            write_mirror,
            timeline: self.timeline(),
            failure_trace: self.failure_trace(),
        }
    }
}
