//! # Connection Sniffer
//!
//! [`SniffingStream`] wraps an accepted connection so a dispatcher can look at
//! its leading bytes before handing it to the real handler, without the
//! handler losing any of them.
//!
//! ```text
//!              sniffing                         passthrough
//!  caller ◀── inner.read ──▶ replay     caller ◀── replay (FIFO) ◀── until drained
//!                                       caller ◀── inner.read        afterwards
//! ```
//!
//! While sniffing, every successful read from the inner stream is returned to
//! the caller *and* appended to a replay buffer. Once [`SnifferHandle::stop_sniffing`]
//! was called, reads are served from the replay buffer first, so the next
//! consumer observes the stream from its very first byte. The buffer is
//! released as soon as it is drained.
//!
//! Independently, every byte read from or written to the inner stream is
//! mirrored into a [`ConnRecorder`] for post-mortem inspection until
//! mirroring is stopped. Writes are never replayed.
//!
//! ## Concurrency
//!
//! The stream assumes one reader and one writer, which `&mut self` enforces.
//! `stop_sniffing`/`stop_mirroring` may be called from any thread through a
//! cloned [`SnifferHandle`]. The sniffing flag is an atomic read once per read
//! call, so a stop racing with a read takes effect at most one call late. For
//! async streams each `poll_read` is a call: a poll that returns `Pending` has
//! consumed nothing from the inner stream. Timestamps follow the same rule:
//! every poll stamps the operation start and the completing poll stamps its
//! end, so a read cancelled after `Pending` leaves nothing behind.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use connsniff::network::conn_sniffer::SniffingStream;
//! use tokio::io::AsyncReadExt;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> std::io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let (socket, _) = listener.accept().await?;
//! let mut stream = SniffingStream::new(socket);
//!
//! let prefix = stream.sniff(3).await?;
//! let is_tls = prefix.first() == Some(&0x16);
//! stream.stop_sniffing();
//!
//! // The handler reads the full stream, prefix included.
//! let mut request = Vec::new();
//! stream.read_to_end(&mut request).await?;
//! # let _ = is_tls;
//! # Ok(())
//! # }
//! ```

use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use uuid::Uuid;

use super::connection::{Connection, Deadlines};
use super::replay_buffer::ReplayBuffer;
use crate::configuration::types::SnifferConfig;
use crate::data_capture::{CaptureSnapshot, ConnRecorder, Direction, FailureTrace, IoTimeline};

/// Upper bound for a single read issued by [`SniffingStream::sniff`].
const SNIFF_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
struct SnifferState {
    sniffing: AtomicBool,
    log_payload: bool,
    recorder: ConnRecorder,
}

/// Cloneable control and diagnostics handle of one [`SniffingStream`].
///
/// The handle stays valid after the stream was moved into a handler or
/// dropped, so diagnostics can be queried after teardown.
#[derive(Clone, Debug)]
pub struct SnifferHandle {
    state: Arc<SnifferState>,
}

impl SnifferHandle {
    fn new(connection_id: Uuid, config: &SnifferConfig) -> Self {
        Self {
            state: Arc::new(SnifferState {
                sniffing: AtomicBool::new(true),
                log_payload: config.log_payload,
                recorder: ConnRecorder::new(connection_id, config.mirror),
            }),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.state.recorder.connection_id()
    }

    pub fn is_sniffing(&self) -> bool {
        self.state.sniffing.load(Ordering::Acquire)
    }

    /// Switches the stream to passthrough. Bytes sniffed so far are replayed
    /// before the inner stream is read again. Calling it again is a no-op.
    pub fn stop_sniffing(&self) {
        if self.state.sniffing.swap(false, Ordering::AcqRel) {
            debug!(
                "[{}] sniffing stopped after {} sniff reads",
                self.connection_id(),
                self.state.recorder.sniff_count()
            );
        }
    }

    /// Stops mirroring reads and writes and releases the mirrored bytes.
    pub fn stop_mirroring(&self) {
        self.state.recorder.stop_mirroring();
    }

    /// Alias of [`Self::stop_mirroring`].
    pub fn stop_reading(&self) {
        self.stop_mirroring();
    }

    pub fn is_mirroring(&self) -> bool {
        self.state.recorder.is_mirroring()
    }

    fn recorder(&self) -> &ConnRecorder {
        &self.state.recorder
    }
}

/// Read-only diagnostics of a sniffed connection.
///
/// Implemented for [`SniffingStream`], [`SnifferHandle`], references to them
/// and `Option` of any of those; `None` reports empty values, so callers can
/// query connections that were never wrapped or already torn down.
pub trait ConnDiagnostics {
    /// Copy of every byte read from the inner stream while mirroring.
    fn read_mirror_bytes(&self) -> Vec<u8>;
    /// Copy of every byte accepted by the inner stream while mirroring.
    fn write_mirror_bytes(&self) -> Vec<u8>;
    /// Context of the last failed read, if any.
    fn failure_trace(&self) -> Option<FailureTrace>;
    fn sniff_count(&self) -> u64;
    fn timeline(&self) -> IoTimeline;
    fn snapshot(&self) -> Option<CaptureSnapshot>;
}

impl ConnDiagnostics for SnifferHandle {
    fn read_mirror_bytes(&self) -> Vec<u8> {
        self.recorder().read_mirror_bytes()
    }

    fn write_mirror_bytes(&self) -> Vec<u8> {
        self.recorder().write_mirror_bytes()
    }

    fn failure_trace(&self) -> Option<FailureTrace> {
        self.recorder().failure_trace()
    }

    fn sniff_count(&self) -> u64 {
        self.recorder().sniff_count()
    }

    fn timeline(&self) -> IoTimeline {
        self.recorder().timeline()
    }

    fn snapshot(&self) -> Option<CaptureSnapshot> {
        Some(self.recorder().snapshot(self.is_sniffing()))
    }
}

impl<T: ConnDiagnostics + ?Sized> ConnDiagnostics for &T {
    fn read_mirror_bytes(&self) -> Vec<u8> {
        (**self).read_mirror_bytes()
    }

    fn write_mirror_bytes(&self) -> Vec<u8> {
        (**self).write_mirror_bytes()
    }

    fn failure_trace(&self) -> Option<FailureTrace> {
        (**self).failure_trace()
    }

    fn sniff_count(&self) -> u64 {
        (**self).sniff_count()
    }

    fn timeline(&self) -> IoTimeline {
        (**self).timeline()
    }

    fn snapshot(&self) -> Option<CaptureSnapshot> {
        (**self).snapshot()
    }
}

impl<T: ConnDiagnostics> ConnDiagnostics for Option<T> {
    fn read_mirror_bytes(&self) -> Vec<u8> {
        self.as_ref().map(T::read_mirror_bytes).unwrap_or_default()
    }

    fn write_mirror_bytes(&self) -> Vec<u8> {
        self.as_ref().map(T::write_mirror_bytes).unwrap_or_default()
    }

    fn failure_trace(&self) -> Option<FailureTrace> {
        self.as_ref().and_then(T::failure_trace)
    }

    fn sniff_count(&self) -> u64 {
        self.as_ref().map_or(0, T::sniff_count)
    }

    fn timeline(&self) -> IoTimeline {
        self.as_ref().map(T::timeline).unwrap_or_default()
    }

    fn snapshot(&self) -> Option<CaptureSnapshot> {
        self.as_ref().and_then(T::snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Sniffing,
    Passthrough,
}

/// A duplex stream that records its leading bytes and replays them once
/// sniffing stops. See the [module documentation](self).
#[derive(Debug)]
pub struct SniffingStream<S> {
    inner: S,
    replay: ReplayBuffer,
    handle: SnifferHandle,
}

impl<S> SniffingStream<S> {
    /// Wraps `inner` with default settings: sniffing and mirroring enabled.
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, &SnifferConfig::default())
    }

    pub fn with_config(inner: S, config: &SnifferConfig) -> Self {
        Self::with_id(inner, Uuid::new_v4(), config)
    }

    /// Wraps `inner` under an existing identifier, e.g. a session id, so log
    /// records of both can be correlated.
    pub fn with_id(inner: S, connection_id: Uuid, config: &SnifferConfig) -> Self {
        debug!("[{}] wrapping connection for sniffing", connection_id);
        Self {
            inner,
            replay: ReplayBuffer::default(),
            handle: SnifferHandle::new(connection_id, config),
        }
    }

    pub fn handle(&self) -> SnifferHandle {
        self.handle.clone()
    }

    pub fn connection_id(&self) -> Uuid {
        self.handle.connection_id()
    }

    pub fn is_sniffing(&self) -> bool {
        self.handle.is_sniffing()
    }

    pub fn stop_sniffing(&self) {
        self.handle.stop_sniffing();
    }

    pub fn stop_mirroring(&self) {
        self.handle.stop_mirroring();
    }

    pub fn stop_reading(&self) {
        self.handle.stop_reading();
    }

    /// Number of sniffed bytes still waiting to be replayed.
    pub fn replay_pending(&self) -> usize {
        self.replay.buffered_remaining()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the inner stream. Reading from it directly bypasses
    /// both the replay buffer and the mirrors.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Releases the inner stream together with the bytes that were sniffed
    /// but not yet replayed.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.inner, self.replay.into_remaining())
    }

    fn read_mode(&self) -> ReadMode {
        if self.handle.is_sniffing() {
            ReadMode::Sniffing
        } else {
            ReadMode::Passthrough
        }
    }

    fn serves_from_replay(&self, mode: ReadMode) -> bool {
        mode == ReadMode::Passthrough && self.replay.has_remaining()
    }

    // Stamped on every poll: a future dropped after Pending must not pin the
    // start of the next operation.
    fn begin(&self, direction: Direction) {
        self.handle.recorder().operation_started(direction);
    }

    fn finish(&self, direction: Direction) {
        self.handle.recorder().operation_finished(direction);
    }

    fn after_replay(&mut self, copied: usize, capacity: usize) {
        if copied == 0 && capacity > 0 {
            // Replay reads never fail; an empty copy into a non-empty buffer is
            // a bookkeeping bug and must not turn into a stream error.
            warn!(
                "[{}] replay buffer returned no data with {} bytes pending",
                self.connection_id(),
                self.replay.buffered_remaining()
            );
        }
        if !self.replay.has_remaining() {
            self.replay.release();
            debug!("[{}] replay buffer drained and released", self.connection_id());
        }
    }

    fn record_live_read(&mut self, mode: ReadMode, outcome: Result<&[u8], &io::Error>) {
        let recorder = self.handle.recorder();
        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(err) => {
                recorder.record_failure(err);
                return;
            }
        };

        recorder.mirror(Direction::Read, bytes);
        if mode != ReadMode::Sniffing {
            return;
        }

        let counter = recorder.next_sniff();
        if self.handle.state.log_payload {
            info!(
                "[{}] sniffed some data: counter={}, read_size={}, sniffed_data=\"{}\"",
                recorder.connection_id(),
                counter,
                bytes.len(),
                bytes.escape_ascii()
            );
        } else {
            info!(
                "[{}] sniffed some data: counter={}, read_size={}",
                recorder.connection_id(),
                counter,
                bytes.len()
            );
        }
        self.replay.append(bytes);
    }

    fn record_write(&self, buf: &[u8], written: usize) {
        self.handle
            .recorder()
            .mirror(Direction::Write, &buf[..written.min(buf.len())]);
    }

    fn record_vectored_write(&self, bufs: &[IoSlice<'_>], written: usize) {
        let mut left = written;
        for buf in bufs {
            if left == 0 {
                break;
            }
            let take = left.min(buf.len());
            self.record_write(buf, take);
            left -= take;
        }
    }
}

impl<S: AsyncRead + Unpin> SniffingStream<S> {
    /// Reads until at least `min_bytes` were sniffed or the stream ended, and
    /// returns everything read. The bytes are replayed after
    /// [`Self::stop_sniffing`], so the caller may inspect them freely.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] once sniffing was stopped,
    /// since reads would then consume bytes the next consumer expects.
    pub async fn sniff(&mut self, min_bytes: usize) -> io::Result<Vec<u8>> {
        if !self.is_sniffing() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sniffing already stopped",
            ));
        }

        let mut sniffed = Vec::with_capacity(min_bytes);
        let mut chunk = vec![0u8; min_bytes.clamp(1, SNIFF_CHUNK_SIZE)];
        while sniffed.len() < min_bytes {
            let n = AsyncReadExt::read(&mut *self, &mut chunk).await?;
            if n == 0 {
                break;
            }
            sniffed.extend_from_slice(&chunk[..n]);
        }
        Ok(sniffed)
    }
}

impl<S> ConnDiagnostics for SniffingStream<S> {
    fn read_mirror_bytes(&self) -> Vec<u8> {
        self.handle.read_mirror_bytes()
    }

    fn write_mirror_bytes(&self) -> Vec<u8> {
        self.handle.write_mirror_bytes()
    }

    fn failure_trace(&self) -> Option<FailureTrace> {
        self.handle.failure_trace()
    }

    fn sniff_count(&self) -> u64 {
        self.handle.sniff_count()
    }

    fn timeline(&self) -> IoTimeline {
        self.handle.timeline()
    }

    fn snapshot(&self) -> Option<CaptureSnapshot> {
        self.handle.snapshot()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.begin(Direction::Read);

        let mode = this.read_mode();
        if this.serves_from_replay(mode) {
            let capacity = buf.remaining();
            let copied = {
                let available = this.replay.remaining_slice();
                let to_copy = available.len().min(capacity);
                buf.put_slice(&available[..to_copy]);
                to_copy
            };
            this.replay.consume(copied);
            this.after_replay(copied, capacity);
            this.finish(Direction::Read);
            return Poll::Ready(Ok(()));
        }

        let filled_before = buf.filled().len();
        let result = match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        match &result {
            Ok(()) => this.record_live_read(mode, Ok(&buf.filled()[filled_before..])),
            Err(err) => this.record_live_read(mode, Err(err)),
        }
        this.finish(Direction::Read);
        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.begin(Direction::Write);

        let result = match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        if let Ok(written) = &result {
            this.record_write(buf, *written);
        }
        this.finish(Direction::Write);
        Poll::Ready(result)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.begin(Direction::Write);

        let result = match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        if let Ok(written) = &result {
            this.record_vectored_write(bufs, *written);
        }
        this.finish(Direction::Write);
        Poll::Ready(result)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: Read> Read for SniffingStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.begin(Direction::Read);

        let mode = self.read_mode();
        let result = if self.serves_from_replay(mode) {
            let copied = self.replay.copy_into(buf);
            self.after_replay(copied, buf.len());
            Ok(copied)
        } else {
            let result = self.inner.read(buf);
            match &result {
                Ok(n) => self.record_live_read(mode, Ok(&buf[..*n])),
                Err(err) => self.record_live_read(mode, Err(err)),
            }
            result
        };

        self.finish(Direction::Read);
        result
    }
}

impl<S: Write> Write for SniffingStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.begin(Direction::Write);
        let result = self.inner.write(buf);
        if let Ok(written) = &result {
            self.record_write(buf, *written);
        }
        self.finish(Direction::Write);
        result
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.begin(Direction::Write);
        let result = self.inner.write_vectored(bufs);
        if let Ok(written) = &result {
            self.record_vectored_write(bufs, *written);
        }
        self.finish(Direction::Write);
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Connection> Connection for SniffingStream<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<S: Deadlines> Deadlines for SniffingStream<S> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_write_timeout(timeout)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.inner.read_timeout()
    }

    fn write_timeout(&self) -> io::Result<Option<Duration>> {
        self.inner.write_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::{Builder, Mock};

    async fn read_in_chunks<R: AsyncRead + Unpin>(reader: &mut R, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn replays_sniffed_prefix_before_live_bytes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mock = Builder::new()
            .read(b"GET")
            .read(b" /x HTTP/1.1\r\n")
            .build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 2];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GE");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"T");

        stream.stop_sniffing();

        let replayed = read_in_chunks(&mut stream, 2).await;
        assert_eq!(replayed, b"GET /x HTTP/1.1\r\n");
        assert_eq!(stream.sniff_count(), 2);
    }

    #[tokio::test]
    async fn replay_is_independent_of_chunk_sizes() {
        let payload = b"\x16\x03\x01\x02\x00\x01\x00\x01\xfcclient hello body";

        for (sniff_chunk, drain_chunk) in [(1, 64), (5, 1), (3, 7), (64, 2)] {
            let mock = Builder::new()
                .read(&payload[..4])
                .read(&payload[4..9])
                .read(&payload[9..])
                .build();
            let mut stream = SniffingStream::new(mock);

            let mut sniffed = Vec::new();
            let mut buf = vec![0u8; sniff_chunk];
            while sniffed.len() < 6 {
                let n = stream.read(&mut buf).await.unwrap();
                sniffed.extend_from_slice(&buf[..n]);
            }
            stream.stop_sniffing();

            let drained = read_in_chunks(&mut stream, drain_chunk).await;
            assert_eq!(drained, payload.to_vec(), "chunks {sniff_chunk}/{drain_chunk}");
            assert_eq!(stream.read_mirror_bytes(), payload.to_vec());
        }
    }

    #[tokio::test]
    async fn stop_sniffing_is_idempotent() {
        let mock = Builder::new().read(b"abc").read(b"def").build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        stream.stop_sniffing();
        stream.stop_sniffing();
        stream.handle().stop_sniffing();
        assert!(!stream.is_sniffing());

        assert_eq!(read_in_chunks(&mut stream, 8).await, b"abcdef");
        assert_eq!(stream.sniff_count(), 1);
    }

    #[tokio::test]
    async fn stop_before_any_read_is_plain_passthrough() {
        let mock = Builder::new().read(b"hello").build();
        let mut stream = SniffingStream::new(mock);
        stream.stop_sniffing();

        assert_eq!(read_in_chunks(&mut stream, 3).await, b"hello");
        assert_eq!(stream.sniff_count(), 0);
        assert_eq!(stream.replay_pending(), 0);
    }

    #[tokio::test]
    async fn replay_buffer_is_released_once_drained() {
        let mock = Builder::new().read(b"abcdef").read(b"gh").build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 16];
        stream.read(&mut buf).await.unwrap();
        stream.stop_sniffing();
        assert_eq!(stream.replay_pending(), 6);

        let mut small = [0u8; 4];
        assert_eq!(stream.read(&mut small).await.unwrap(), 4);
        assert_eq!(stream.replay_pending(), 2);
        assert!(stream.replay.capacity() > 0);

        assert_eq!(stream.read(&mut small).await.unwrap(), 2);
        assert_eq!(&small[..2], b"ef");
        assert_eq!(stream.replay.capacity(), 0);

        assert_eq!(read_in_chunks(&mut stream, 4).await, b"gh");
    }

    #[tokio::test]
    async fn read_error_is_returned_unchanged_and_traced() {
        let mock = Builder::new()
            .read(b"ab")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            .build();
        let mut stream = SniffingStream::new(mock);
        assert!(stream.failure_trace().is_none());

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);

        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), "reset by peer");

        let trace = stream.failure_trace().expect("failure trace");
        assert_eq!(trace.kind, "ConnectionReset");
        assert!(!trace.is_empty());
        assert_eq!(stream.read_mirror_bytes(), b"ab");
        assert_eq!(stream.sniff_count(), 1);
    }

    #[tokio::test]
    async fn read_error_in_passthrough_is_not_masked_by_replay() {
        let mock = Builder::new()
            .read(b"ab")
            .read_error(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))
            .build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 8];
        stream.read(&mut buf).await.unwrap();
        stream.stop_sniffing();

        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(stream.failure_trace().is_some());
    }

    #[tokio::test]
    async fn writes_pass_through_and_are_mirrored() {
        let mock = Builder::new()
            .read(b"PING")
            .write(b"PONG")
            .write(b"!")
            .build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(stream.write(b"PONG").await.unwrap(), 4);
        stream.write_all(b"!").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(stream.write_mirror_bytes(), b"PONG!");
        assert_eq!(stream.read_mirror_bytes(), b"PING");

        // Written bytes are never replayed.
        stream.stop_sniffing();
        assert_eq!(read_in_chunks(&mut stream, 8).await, b"PING");
    }

    #[tokio::test]
    async fn write_after_stop_mirroring_is_not_recorded() {
        let mock = Builder::new().write(b"abc").build();
        let mut stream = SniffingStream::new(mock);
        stream.stop_mirroring();

        assert_eq!(stream.write(b"abc").await.unwrap(), 3);
        assert!(stream.write_mirror_bytes().is_empty());
    }

    #[tokio::test]
    async fn stop_mirroring_releases_and_freezes_mirrors() {
        let mock = Builder::new()
            .read(b"first")
            .write(b"reply")
            .read(b"second")
            .build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 8];
        stream.read(&mut buf).await.unwrap();
        stream.write_all(b"reply").await.unwrap();
        assert_eq!(stream.read_mirror_bytes(), b"first");

        stream.stop_reading();
        assert!(stream.read_mirror_bytes().is_empty());
        assert!(stream.write_mirror_bytes().is_empty());

        stream.read(&mut buf).await.unwrap();
        assert!(stream.read_mirror_bytes().is_empty());
        // Sniffing is unaffected by mirroring.
        assert!(stream.is_sniffing());
        assert_eq!(stream.replay_pending(), 11);

        stream.stop_sniffing();
        assert_eq!(read_in_chunks(&mut stream, 4).await, b"firstsecond");
    }

    #[tokio::test]
    async fn mirroring_can_start_disabled() {
        let config = SnifferConfig {
            mirror: false,
            log_payload: false,
            keep_mirrors: false,
        };
        let mock = Builder::new().read(b"abc").build();
        let mut stream = SniffingStream::with_config(mock, &config);

        let sniffed = stream.sniff(3).await.unwrap();
        assert_eq!(sniffed, b"abc");
        assert!(stream.read_mirror_bytes().is_empty());

        stream.stop_sniffing();
        assert_eq!(read_in_chunks(&mut stream, 2).await, b"abc");
    }

    #[tokio::test]
    async fn sniff_reads_until_enough_bytes() {
        let mock = Builder::new()
            .read(b"\x16")
            .read(b"\x03\x01")
            .read(b"\x00\x05hello")
            .build();
        let mut stream = SniffingStream::new(mock);

        let prefix = stream.sniff(3).await.unwrap();
        assert_eq!(prefix, b"\x16\x03\x01");

        stream.stop_sniffing();
        assert!(stream.sniff(1).await.is_err());
        assert_eq!(
            read_in_chunks(&mut stream, 5).await,
            b"\x16\x03\x01\x00\x05hello"
        );
    }

    #[tokio::test]
    async fn sniff_stops_at_end_of_stream() {
        let mock = Builder::new().read(b"ab").build();
        let mut stream = SniffingStream::new(mock);

        assert_eq!(stream.sniff(10).await.unwrap(), b"ab");
        stream.stop_sniffing();
        assert_eq!(read_in_chunks(&mut stream, 10).await, b"ab");
    }

    #[tokio::test]
    async fn handle_controls_stream_from_another_task() {
        let mock = Builder::new().read(b"abc").read(b"def").build();
        let mut stream = SniffingStream::new(mock);
        let handle = stream.handle();

        let mut buf = [0u8; 3];
        stream.read(&mut buf).await.unwrap();

        tokio::task::spawn_blocking(move || handle.stop_sniffing())
            .await
            .unwrap();

        assert_eq!(read_in_chunks(&mut stream, 3).await, b"abcdef");
    }

    #[tokio::test]
    async fn handle_outlives_stream() {
        let mock = Builder::new().read(b"xyz").write(b"ok").build();
        let mut stream = SniffingStream::new(mock);
        let handle = stream.handle();

        let mut buf = [0u8; 3];
        stream.read(&mut buf).await.unwrap();
        stream.write_all(b"ok").await.unwrap();
        drop(stream);

        assert_eq!(handle.read_mirror_bytes(), b"xyz");
        assert_eq!(handle.write_mirror_bytes(), b"ok");
        let snapshot = handle.snapshot().unwrap();
        assert!(snapshot.sniffing);
        assert_eq!(snapshot.sniff_count, 1);
    }

    #[tokio::test]
    async fn timeline_tracks_first_and_last_operations() {
        let mock = Builder::new().read(b"a").write(b"b").read(b"c").build();
        let mut stream = SniffingStream::new(mock);
        assert_eq!(stream.timeline(), IoTimeline::default());

        let mut buf = [0u8; 1];
        stream.read(&mut buf).await.unwrap();
        let first = stream.timeline();
        stream.write_all(b"b").await.unwrap();
        stream.read(&mut buf).await.unwrap();
        let timeline = stream.timeline();

        assert_eq!(timeline.first_read_at, first.first_read_at);
        assert!(timeline.first_write_at.is_some());
        assert!(timeline.last_read_start >= first.last_read_start);
        assert!(timeline.last_read_end >= timeline.last_read_start);
        assert!(timeline.last_write_end >= timeline.last_write_start);
    }

    #[test]
    fn absent_stream_reports_empty_diagnostics() {
        let absent: Option<SnifferHandle> = None;
        assert!(absent.read_mirror_bytes().is_empty());
        assert!(absent.write_mirror_bytes().is_empty());
        assert!(absent.failure_trace().is_none());
        assert!(absent.snapshot().is_none());
        assert_eq!(absent.sniff_count(), 0);
        assert_eq!(absent.timeline(), IoTimeline::default());

        let absent_stream: Option<&SniffingStream<Mock>> = None;
        assert!(absent_stream.read_mirror_bytes().is_empty());
        assert!(absent_stream.failure_trace().is_none());
    }

    #[tokio::test]
    async fn present_option_delegates() {
        let mock = Builder::new().read(b"hi").build();
        let mut stream = SniffingStream::new(mock);
        let mut buf = [0u8; 2];
        stream.read(&mut buf).await.unwrap();

        let present = Some(stream.handle());
        assert_eq!(present.read_mirror_bytes(), b"hi");
        assert_eq!(Some(&stream).sniff_count(), 1);
    }

    #[tokio::test]
    async fn into_parts_returns_unreplayed_bytes() {
        let mock = Builder::new().read(b"hello").build();
        let mut stream = SniffingStream::new(mock);

        let mut buf = [0u8; 8];
        stream.read(&mut buf).await.unwrap();
        stream.stop_sniffing();
        let mut two = [0u8; 2];
        stream.read(&mut two).await.unwrap();

        let (mut inner, pending) = stream.into_parts();
        assert_eq!(pending, b"llo");
        assert_eq!(inner.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_sniff_does_not_pin_next_read_start() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = SniffingStream::new(server);

        let cancelled = tokio::time::timeout(Duration::from_millis(20), stream.sniff(4)).await;
        assert!(cancelled.is_err());
        let cancelled_start = stream.timeline().last_read_start;
        assert!(cancelled_start.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        client.write_all(b"abcd").await.unwrap();
        let before_read = chrono::Utc::now();

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");

        let timeline = stream.timeline();
        assert!(timeline.last_read_start > cancelled_start);
        assert!(timeline.last_read_start >= Some(before_read));
        assert!(timeline.last_read_end >= timeline.last_read_start);
    }

    /// Sink that accepts at most `limit` bytes per call, across all slices.
    struct VectoredSink {
        written: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for VectoredSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let n = buf.len().min(this.limit);
            this.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_write_vectored(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let mut accepted = 0;
            for buf in bufs {
                let take = (this.limit - accepted).min(buf.len());
                this.written.extend_from_slice(&buf[..take]);
                accepted += take;
            }
            Poll::Ready(Ok(accepted))
        }

        fn is_write_vectored(&self) -> bool {
            true
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn vectored_writes_are_forwarded_and_mirrored() {
        let sink = VectoredSink {
            written: Vec::new(),
            limit: 4,
        };
        let mut stream = SniffingStream::new(sink);
        assert!(AsyncWrite::is_write_vectored(&stream));

        let bufs = [IoSlice::new(b"ab"), IoSlice::new(b""), IoSlice::new(b"cde")];
        let n = AsyncWriteExt::write_vectored(&mut stream, &bufs).await.unwrap();

        assert_eq!(n, 4);
        assert_eq!(stream.get_ref().written, b"abcd");
        assert_eq!(stream.write_mirror_bytes(), b"abcd");
        assert!(stream.timeline().last_write_end.is_some());
    }
}
