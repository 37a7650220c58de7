//! Byte-stream transport and line framing.
//!
//! The engine drives exactly one controller through one duplex byte stream.
//! This crate owns the stream split: the write half becomes a [`LinkWriter`]
//! handed to the executor's single writer task, and the read half feeds a
//! spawned reader task that frames CR/LF-terminated lines, drops empties, and
//! forwards them to a bounded channel. The concrete serial driver sits behind
//! the [`ByteStream`] bound; tests attach an in-memory duplex instead.
//!
//! FIFO is structural on both sides: the writer half is `&mut`-exclusive so
//! writes serialize, and the reader task is the only consumer of the read
//! half so delivered lines preserve wire order.

pub mod testing;

use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the inbound line channel. The reader parks when the router
/// falls this far behind rather than dropping controller output.
pub const LINE_CHANNEL_CAP: usize = 256;

/// Longest inbound line accepted before the reader discards the accumulation.
/// Status frames top out well under this; anything longer is wire garbage.
pub const MAX_LINE_BYTES: usize = 1024;

/// Transport failure modes surfaced to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("port unavailable: {0}")]
    PortUnavailable(String),
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("read failure: {0}")]
    ReadFailure(String),
    #[error("link closed")]
    Closed,
}

/// Marker bound for anything usable as the controller byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

/// Why the reader task stopped. Returned through its join handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// Orderly shutdown via [`LinkShutdown::signal`].
    ShutdownSignal,
    /// The line channel's consumer went away.
    ChannelClosed,
    /// The peer closed the stream (EOF).
    StreamEnded,
    /// An I/O error ended the stream.
    StreamError(String),
}

impl ReaderExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderExit::ShutdownSignal => "shutdown_signal",
            ReaderExit::ChannelClosed => "channel_closed",
            ReaderExit::StreamEnded => "stream_ended",
            ReaderExit::StreamError(_) => "stream_error",
        }
    }
}

/// Handle used to stop the reader task without dropping the channel.
#[derive(Clone, Debug)]
pub struct LinkShutdown {
    notify: Arc<Notify>,
}

impl LinkShutdown {
    pub fn signal(&self) {
        self.notify.notify_one();
    }
}

/// Exclusive write half. All outbound bytes, command lines and real-time
/// singles alike, leave through [`LinkWriter::send_bytes`].
pub struct LinkWriter<S: ByteStream> {
    io: WriteHalf<S>,
    bytes_written: u64,
}

impl<S: ByteStream> LinkWriter<S> {
    /// Write `bytes` in order and flush. Ordered because the caller holds the
    /// only handle; non-blocking in the transport sense (no ack awaited).
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.io
            .write_all(bytes)
            .await
            .map_err(|e| LinkError::WriteFailure(e.to_string()))?;
        self.io
            .flush()
            .await
            .map_err(|e| LinkError::WriteFailure(e.to_string()))?;
        self.bytes_written += bytes.len() as u64;
        trace!(target: "link.write", len = bytes.len(), "bytes_out");
        Ok(())
    }

    /// Total bytes accepted by the stream since attach.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Shut the write half down, signalling EOF to the peer.
    pub async fn close(&mut self) -> Result<(), LinkError> {
        self.io
            .shutdown()
            .await
            .map_err(|e| LinkError::WriteFailure(e.to_string()))
    }
}

/// Receiving side of the framed-line channel.
pub struct LinkReader {
    rx: mpsc::Receiver<String>,
}

impl LinkReader {
    /// Next framed line, or `None` once the reader task has stopped and the
    /// channel drained.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Everything `attach` hands back to the caller.
pub struct AttachedLink<S: ByteStream> {
    pub writer: LinkWriter<S>,
    pub reader: LinkReader,
    pub reader_task: JoinHandle<ReaderExit>,
    pub shutdown: LinkShutdown,
}

/// Split `stream` and spawn the framing reader task.
pub fn attach<S: ByteStream>(stream: S) -> AttachedLink<S> {
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAP);
    let notify = Arc::new(Notify::new());
    let shutdown = LinkShutdown {
        notify: notify.clone(),
    };

    let reader_task = tokio::spawn(run_reader(read_half, tx, notify));

    AttachedLink {
        writer: LinkWriter {
            io: write_half,
            bytes_written: 0,
        },
        reader: LinkReader { rx },
        reader_task,
        shutdown,
    }
}

async fn run_reader<S: ByteStream>(
    mut read_half: ReadHalf<S>,
    tx: mpsc::Sender<String>,
    notify: Arc<Notify>,
) -> ReaderExit {
    info!(target: "link.reader", "reader_task_started");
    let mut accumulator: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    let mut overlong = false;

    let exit = loop {
        let read = tokio::select! {
            biased;
            _ = notify.notified() => break ReaderExit::ShutdownSignal,
            read = read_half.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => break ReaderExit::StreamEnded,
            Ok(n) => n,
            Err(e) => break ReaderExit::StreamError(e.to_string()),
        };

        let mut exit = None;
        for &byte in &chunk[..n] {
            match byte {
                b'\n' | b'\r' => {
                    if overlong {
                        // The truncated tail of an oversized line ends here.
                        overlong = false;
                        accumulator.clear();
                        continue;
                    }
                    if accumulator.is_empty() {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&accumulator).into_owned();
                    accumulator.clear();
                    trace!(target: "link.reader", len = line.len(), "line_in");
                    if tx.send(line).await.is_err() {
                        exit = Some(ReaderExit::ChannelClosed);
                        break;
                    }
                }
                _ => {
                    if accumulator.len() >= MAX_LINE_BYTES {
                        if !overlong {
                            warn!(target: "link.reader", "line_overlong_discarded");
                            overlong = true;
                            accumulator.clear();
                        }
                        continue;
                    }
                    accumulator.push(byte);
                }
            }
        }
        if let Some(exit) = exit {
            break exit;
        }
    };

    if let ReaderExit::StreamError(e) = &exit {
        warn!(target: "link.reader", error = %e, "reader_task_stream_error");
    }
    debug!(target: "link.reader", reason = exit.as_str(), "reader_task_stopped");
    exit
}
