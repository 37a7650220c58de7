//! The single writer task.
//!
//! Every byte leaving the host goes through this task, which exclusively owns
//! the link's write half. Two inbound channels: command frames and real-time
//! singles. The select is biased toward real-time so a held-back frame queue
//! never delays a feed-hold, and each frame writes atomically, so real-time
//! bytes interleave between frames, never inside one.

use core_link::{ByteStream, LinkError, LinkWriter};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub static FRAMES_WRITTEN: AtomicU64 = AtomicU64::new(0);
pub static REALTIME_WRITTEN: AtomicU64 = AtomicU64::new(0);

/// One framed command line, terminator already appended by the executor.
pub(crate) struct FrameWrite {
    pub bytes: Vec<u8>,
    /// Resolves once the bytes are on the wire (or the write failed).
    pub done: oneshot::Sender<Result<(), LinkError>>,
}

/// Cloneable handle for the two write paths.
#[derive(Clone)]
pub struct WriterHandle {
    pub(crate) frames: mpsc::Sender<FrameWrite>,
    realtime: mpsc::UnboundedSender<u8>,
}

impl WriterHandle {
    /// Queue a real-time byte. Fire-and-forget: never blocks, never acks.
    pub fn send_realtime(&self, byte: u8) {
        if self.realtime.send(byte).is_err() {
            warn!(target: "command.writer", byte, "realtime_dropped_writer_gone");
        }
    }

    /// Write one framed line and wait until it reaches the wire.
    pub(crate) async fn write_frame(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        let (done, done_rx) = oneshot::channel();
        self.frames
            .send(FrameWrite { bytes, done })
            .await
            .map_err(|_| LinkError::Closed)?;
        done_rx.await.map_err(|_| LinkError::Closed)?
    }
}

/// Spawn the writer task over the link's exclusive write half.
pub fn spawn_writer<S: ByteStream>(
    mut link_writer: LinkWriter<S>,
) -> (WriterHandle, JoinHandle<()>) {
    // Frame channel depth 1: the executor's send slot admits one frame at a
    // time anyway, and a shallow channel keeps the realtime bias effective.
    let (frames_tx, mut frames_rx) = mpsc::channel::<FrameWrite>(1);
    let (realtime_tx, mut realtime_rx) = mpsc::unbounded_channel::<u8>();

    let task = tokio::spawn(async move {
        debug!(target: "command.writer", "writer_task_started");
        loop {
            tokio::select! {
                biased;
                byte = realtime_rx.recv() => {
                    let Some(byte) = byte else { break };
                    match link_writer.send_bytes(&[byte]).await {
                        Ok(()) => {
                            REALTIME_WRITTEN.fetch_add(1, Ordering::Relaxed);
                            trace!(target: "command.writer", byte, "realtime_out");
                        }
                        Err(e) => {
                            warn!(target: "command.writer", error = %e, "realtime_write_failed");
                        }
                    }
                }
                frame = frames_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let result = link_writer.send_bytes(&frame.bytes).await;
                    if result.is_ok() {
                        FRAMES_WRITTEN.fetch_add(1, Ordering::Relaxed);
                    }
                    let _ = frame.done.send(result);
                }
            }
        }
        let _ = link_writer.close().await;
        debug!(target: "command.writer", "writer_task_stopped");
    });

    (
        WriterHandle {
            frames: frames_tx,
            realtime: realtime_tx,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frames_and_realtime_share_one_wire() {
        let (engine_side, mut peer) = tokio::io::duplex(1024);
        let link = core_link::attach(engine_side);
        let (writer, _task) = spawn_writer(link.writer);

        writer.write_frame(b"G0X1\r\n".to_vec()).await.unwrap();
        writer.send_realtime(b'?');
        writer.write_frame(b"G0X2\r\n".to_vec()).await.unwrap();

        let mut buf = vec![0u8; 13];
        peer.read_exact(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        // Both frames arrive intact; the realtime byte lands between them,
        // never inside a frame.
        assert!(text.contains("G0X1\r\n"));
        assert!(text.contains("G0X2\r\n"));
        assert!(text.contains('?'));
        let x1 = text.find("G0X1").unwrap();
        let x2 = text.find("G0X2").unwrap();
        assert!(x1 < x2, "frame order preserved");
    }

    #[tokio::test]
    async fn write_frame_resolves_after_wire() {
        let (engine_side, mut peer) = tokio::io::duplex(64);
        let link = core_link::attach(engine_side);
        let (writer, _task) = spawn_writer(link.writer);

        writer.write_frame(b"$X\r\n".to_vec()).await.unwrap();
        let mut buf = vec![0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"$X\r\n");
    }
}
