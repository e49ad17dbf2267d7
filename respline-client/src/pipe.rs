//! # Duplex Pipe
//!
//! Purpose: Decouple transport I/O granularity from reply framing. A raw
//! byte stream is split into two halves, each driven by its own pump task:
//!
//! ```text
//!            ┌──────────── read pump ────────────┐
//! transport ─┤ read_buf → segment → mpsc<Bytes> ─┼─► PipeReader (cursor)
//!            └───────────────────────────────────┘
//!            ┌──────────── write pump ───────────┐
//! transport ◄┤ write_all ← batch ← mpsc<Bytes> ◄─┼── PipeWriter
//!            └───────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. **Independent Pumps**: Reads and writes progress without the engine
//!    polling them; the engine only sees completed segments.
//! 2. **Batch Flushes**: The write pump flushes only when no more data is
//!    immediately queued, so bursts share one flush.
//! 3. **Complete With Fault**: A pump that dies records its fault and stops
//!    its sibling; the reader observes the fault instead of a silent EOF.
//! 4. **Replace, Never Patch**: A pipe is owned by one connection and is
//!    dropped wholesale on reconnect. Dropping it stops both pumps.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use respline_common::ClientConfig;

/// Any duplex byte stream the pipe can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport handed over by a Connector.
pub type BoxedTransport = Box<dyn Transport>;

/// Segments handed from the read pump to the reader before it backs off.
const READ_QUEUE_CAPACITY: usize = 64;

/// Upper bound on segments written between two flush checks.
const MAX_WRITE_BATCH: usize = 64;

/// Base delay between transient read retries; scaled by attempt number.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Sizing and retry knobs for one pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// Bytes reserved for each transport read.
    pub read_chunk_size: usize,
    /// Consecutive transient read errors tolerated.
    pub read_retry_limit: u32,
    /// Bounded capacity of the write queue.
    pub write_queue_capacity: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        PipeOptions::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for PipeOptions {
    fn from(config: &ClientConfig) -> Self {
        PipeOptions {
            read_chunk_size: config.read_chunk_size.max(1),
            read_retry_limit: config.read_retry_limit,
            write_queue_capacity: config.write_queue_capacity.max(1),
        }
    }
}

/// Marker carried by I/O errors raised because the pipe was shut down
/// locally, as opposed to a fault reported by the transport.
#[derive(Debug)]
pub struct PipeAborted;

impl fmt::Display for PipeAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipe shut down")
    }
}

impl std::error::Error for PipeAborted {}

/// Returns true when `err` was caused by a local shutdown of the pipe.
pub fn is_aborted(err: &io::Error) -> bool {
    err.get_ref().map_or(false, |inner| inner.is::<PipeAborted>())
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, PipeAborted)
}

/// State shared by both pumps and both pipe ends.
struct PipeShared {
    shutdown: CancellationToken,
    // Set once the read pump has exited for any reason.
    read_closed: AtomicBool,
    // First fault wins; later faults are consequences of the first.
    fault: Mutex<Option<io::Error>>,
}

impl PipeShared {
    fn new() -> Self {
        PipeShared {
            shutdown: CancellationToken::new(),
            read_closed: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }

    fn fail(&self, err: io::Error) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(err);
            }
        }
        self.shutdown.cancel();
    }

    /// Returns a copy of the recorded fault, if any.
    fn fault(&self) -> Option<io::Error> {
        self.fault
            .lock()
            .as_ref()
            .map(|err| io::Error::new(err.kind(), err.to_string()))
    }
}

/// Read end of the pipe: a resumable cursor over bytes delivered by the pump.
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    buf: BytesMut,
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Builds a reader over a fixed sequence of segments.
    ///
    /// The reader reports end-of-input after the last segment. Useful for
    /// decoding captured replies without a transport.
    pub fn from_segments<I>(segments: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let segments: Vec<Bytes> = segments.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(segments.len().max(1));
        for segment in segments {
            // Capacity covers every segment, so this never fails.
            let _ = tx.try_send(segment);
        }
        PipeReader {
            rx,
            buf: BytesMut::new(),
            shared: Arc::new(PipeShared::new()),
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Discards `count` buffered bytes.
    pub fn consume(&mut self, count: usize) {
        self.buf.advance(count);
    }

    /// Removes and returns the first `count` buffered bytes.
    pub fn take(&mut self, count: usize) -> Bytes {
        self.buf.split_to(count).freeze()
    }

    /// Waits for the next segment from the read pump.
    ///
    /// Returns `Ok(false)` on clean end-of-input, and the recorded fault if
    /// the pump stopped because of one.
    pub async fn fill(&mut self) -> io::Result<bool> {
        match self.rx.recv().await {
            Some(segment) => {
                self.buf.extend_from_slice(&segment);
                Ok(true)
            }
            None => {
                if let Some(err) = self.shared.fault() {
                    return Err(err);
                }
                if self.shared.shutdown.is_cancelled() {
                    return Err(aborted());
                }
                Ok(false)
            }
        }
    }
}

/// Write end of the pipe.
#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Enqueues `data` for the write pump.
    pub async fn write(&self, data: Bytes) -> io::Result<()> {
        if let Some(err) = self.shared.fault() {
            return Err(err);
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(aborted());
        }
        self.tx
            .send(data)
            .await
            .map_err(|_| self.shared.fault().unwrap_or_else(aborted))
    }
}

/// A transport wrapped by a read pump and a write pump.
pub struct DuplexPipe {
    input: PipeReader,
    output: PipeWriter,
    shared: Arc<PipeShared>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl DuplexPipe {
    /// Takes ownership of `transport` and starts both pumps.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<T: Transport>(transport: T, options: PipeOptions) -> Self {
        let shared = Arc::new(PipeShared::new());

        let (source, sink) = tokio::io::split(transport);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(options.write_queue_capacity);

        let read_task = tokio::spawn(read_pump(source, read_tx, Arc::clone(&shared), options));
        let write_task = tokio::spawn(write_pump(sink, write_rx, Arc::clone(&shared)));

        DuplexPipe {
            input: PipeReader {
                rx: read_rx,
                buf: BytesMut::with_capacity(options.read_chunk_size),
                shared: Arc::clone(&shared),
            },
            output: PipeWriter {
                tx: write_tx,
                shared: Arc::clone(&shared),
            },
            shared,
            read_task: Some(read_task),
            write_task: Some(write_task),
        }
    }

    /// Read cursor.
    pub fn input(&mut self) -> &mut PipeReader {
        &mut self.input
    }

    /// Write handle.
    pub fn output(&self) -> &PipeWriter {
        &self.output
    }

    /// Returns true once the read side has ended or the pipe was shut down.
    ///
    /// A closed pipe will never deliver another reply.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled() || self.shared.read_closed.load(Ordering::Acquire)
    }

    /// Fault that stopped a pump, if any.
    pub fn fault(&self) -> Option<io::Error> {
        self.shared.fault()
    }

    /// Stops both pumps and waits for them to release the transport.
    pub async fn close(mut self) {
        self.shared.shutdown.cancel();
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.write_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DuplexPipe {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

async fn read_pump<R>(
    mut source: R,
    tx: mpsc::Sender<Bytes>,
    shared: Arc<PipeShared>,
    options: PipeOptions,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(options.read_chunk_size);
    let mut retries = 0u32;

    let outcome: io::Result<()> = loop {
        buf.reserve(options.read_chunk_size);
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break Ok(()),
            read = source.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                trace!("read pump reached end of stream");
                break Ok(());
            }
            Ok(count) => {
                retries = 0;
                let segment = buf.split_to(count).freeze();
                let delivered = tokio::select! {
                    _ = shared.shutdown.cancelled() => false,
                    sent = tx.send(segment) => sent.is_ok(),
                };
                if !delivered {
                    break Ok(());
                }
            }
            Err(err) if is_transient(&err) && retries < options.read_retry_limit => {
                retries += 1;
                debug!(error = %err, attempt = retries, "transient read error, retrying");
                tokio::time::sleep(READ_RETRY_BACKOFF * retries).await;
            }
            Err(err) => break Err(err),
        }
    };

    if let Err(err) = outcome {
        warn!(error = %err, "read pump failed");
        shared.fail(err);
    }
    shared.read_closed.store(true, Ordering::Release);
    // Dropping `tx` completes the read side for the reader.
}

async fn write_pump<W>(mut sink: W, mut rx: mpsc::Receiver<Bytes>, shared: Arc<PipeShared>)
where
    W: AsyncWrite + Unpin,
{
    let outcome = tokio::select! {
        _ = shared.shutdown.cancelled() => Ok(()),
        drained = drain_writes(&mut sink, &mut rx) => drained,
    };

    match outcome {
        Ok(()) => {
            // Best effort: the peer may already be gone.
            let _ = sink.flush().await;
            let _ = sink.shutdown().await;
            trace!("write pump completed");
        }
        Err(err) => {
            warn!(error = %err, "write pump failed");
            shared.fail(err);
        }
    }
}

async fn drain_writes<W>(sink: &mut W, rx: &mut mpsc::Receiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_WRITE_BATCH);
    let mut unflushed = false;

    loop {
        let first = match rx.try_recv() {
            Ok(segment) => segment,
            Err(mpsc::error::TryRecvError::Empty) => {
                // Nothing else is pending, so this is the end of a burst.
                if unflushed {
                    sink.flush().await?;
                    unflushed = false;
                }
                match rx.recv().await {
                    Some(segment) => segment,
                    None => break,
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        };

        batch.push(first);
        while batch.len() < MAX_WRITE_BATCH {
            match rx.try_recv() {
                Ok(segment) => batch.push(segment),
                Err(_) => break,
            }
        }

        if batch.len() == 1 {
            sink.write_all(&batch[0]).await?;
        } else {
            for segment in &batch {
                sink.write_all(segment).await?;
            }
        }
        batch.clear();
        unflushed = true;
    }

    if unflushed {
        sink.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    async fn read_exactly(reader: &mut PipeReader, len: usize) -> Vec<u8> {
        while reader.buffered().len() < len {
            assert!(reader.fill().await.expect("fill"), "unexpected end of input");
        }
        reader.take(len).to_vec()
    }

    #[tokio::test]
    async fn pumps_bytes_both_ways() {
        let (client, mut server) = duplex(4096);
        let mut pipe = DuplexPipe::new(client, PipeOptions::default());

        pipe.output().write(Bytes::from_static(b"PING\r\n")).await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\r\n");

        server.write_all(b"+PONG\r\n").await.unwrap();
        assert_eq!(read_exactly(pipe.input(), 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn burst_of_writes_arrives_in_order() {
        let (client, mut server) = duplex(64 * 1024);
        let pipe = DuplexPipe::new(client, PipeOptions::default());

        let mut expected = Vec::new();
        for idx in 0..100 {
            let line = format!("SET k{} v{}\r\n", idx, idx);
            expected.extend_from_slice(line.as_bytes());
            pipe.output().write(Bytes::from(line)).await.unwrap();
        }

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn peer_close_is_clean_end_of_input() {
        let (client, server) = duplex(1024);
        let mut pipe = DuplexPipe::new(client, PipeOptions::default());
        drop(server);

        assert!(!pipe.input().fill().await.unwrap());
        assert!(pipe.is_closed());
        assert!(pipe.fault().is_none());
    }

    #[tokio::test]
    async fn local_close_reports_abort() {
        let (client, _server) = duplex(1024);
        let mut pipe = DuplexPipe::new(client, PipeOptions::default());
        pipe.shared.shutdown.cancel();

        let err = pipe.input().fill().await.unwrap_err();
        assert!(is_aborted(&err));
        assert!(pipe.is_closed());
    }

    #[tokio::test]
    async fn segments_reader_ends_after_last_segment() {
        let mut reader = PipeReader::from_segments(vec![&b"ab"[..], &b"c"[..]]);
        assert!(reader.fill().await.unwrap());
        assert!(reader.fill().await.unwrap());
        assert_eq!(reader.buffered(), b"abc");
        assert!(!reader.fill().await.unwrap());
    }

    /// Fails every read with the given kind.
    struct FailingStream {
        kind: io::ErrorKind,
        attempts: Arc<std::sync::atomic::AtomicU32>,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Poll::Ready(Err(io::Error::from(self.kind)))
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn transient_read_errors_are_bounded() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let stream = FailingStream {
            kind: io::ErrorKind::Interrupted,
            attempts: Arc::clone(&attempts),
        };
        let options = PipeOptions {
            read_retry_limit: 2,
            ..PipeOptions::default()
        };
        let mut pipe = DuplexPipe::new(stream, options);

        let err = pipe.input().fill().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        // One initial attempt plus two retries.
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(pipe.fault().is_some());
    }

    #[tokio::test]
    async fn hard_read_error_fails_writer_too() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let stream = FailingStream {
            kind: io::ErrorKind::ConnectionReset,
            attempts,
        };
        let mut pipe = DuplexPipe::new(stream, PipeOptions::default());

        let err = pipe.input().fill().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let err = pipe
            .output()
            .write(Bytes::from_static(b"PING\r\n"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn close_releases_transport() {
        let (client, mut server) = duplex(1024);
        let pipe = DuplexPipe::new(client, PipeOptions::default());
        pipe.close().await;

        let mut buf = [0u8; 1];
        let read = server.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
