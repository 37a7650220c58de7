//! Scripted controller peers for exercising the engine without hardware.
//!
//! [`Emulator`] owns the far end of an in-memory duplex and reacts to what
//! the engine writes: complete lines invoke the line responder, recognized
//! real-time bytes invoke the real-time responder immediately, even when they
//! land between the bytes of a partially received line, which is exactly how
//! the firmware treats them.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

/// Byte values the emulator treats as real-time controls.
fn is_realtime(byte: u8) -> bool {
    matches!(byte, 0x3F | 0x21 | 0x7E | 0x18 | 0x85 | 0x90..=0x97 | 0x99..=0x9D)
}

type LineResponder = Box<dyn FnMut(&str) -> Vec<String> + Send>;
type RealtimeResponder = Box<dyn FnMut(u8) -> Vec<String> + Send>;

/// Running scripted peer. Dropping the handle aborts the peer task.
pub struct Emulator {
    task: JoinHandle<()>,
    /// Raw injection side-channel: lines pushed here are written to the
    /// engine unprompted (unsolicited alarms, banners mid-stream).
    inject_tx: tokio::sync::mpsc::UnboundedSender<String>,
    /// Every complete line the engine sent, in arrival order.
    received: Arc<Mutex<Vec<String>>>,
    /// Every real-time byte the engine sent, in arrival order.
    realtime: Arc<Mutex<Vec<u8>>>,
}

impl Emulator {
    /// Spawn a peer over `peer_half` with explicit responders.
    pub fn spawn(
        peer_half: DuplexStream,
        mut on_line: LineResponder,
        mut on_realtime: RealtimeResponder,
    ) -> Self {
        let (mut read_half, write_half) = tokio::io::split(peer_half);
        let write_half = Arc::new(Mutex::new(write_half));
        let (inject_tx, mut inject_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let received = Arc::new(Mutex::new(Vec::new()));
        let realtime = Arc::new(Mutex::new(Vec::new()));

        let received_in_task = received.clone();
        let realtime_in_task = realtime.clone();
        let writer_for_inject = write_half.clone();

        let inject_task = tokio::spawn(async move {
            while let Some(line) = inject_rx.recv().await {
                let mut writer = writer_for_inject.lock().await;
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\r\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let task = tokio::spawn(async move {
            let mut accumulator: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for &byte in &chunk[..n] {
                    let replies = if is_realtime(byte) {
                        realtime_in_task.lock().await.push(byte);
                        on_realtime(byte)
                    } else if byte == b'\n' || byte == b'\r' {
                        if accumulator.is_empty() {
                            continue;
                        }
                        let line = String::from_utf8_lossy(&accumulator).into_owned();
                        accumulator.clear();
                        trace!(target: "link.emulator", line = %line, "line_received");
                        received_in_task.lock().await.push(line.clone());
                        on_line(&line)
                    } else {
                        accumulator.push(byte);
                        continue;
                    };
                    let mut writer = write_half.lock().await;
                    for reply in replies {
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                        if writer.write_all(b"\r\n").await.is_err() {
                            return;
                        }
                    }
                    let _ = writer.flush().await;
                }
            }
            inject_task.abort();
        });

        Self {
            task,
            inject_tx,
            received,
            realtime,
        }
    }

    /// Peer that answers `ok` to every line and a parked Idle frame to `?`.
    pub fn ack_everything(peer_half: DuplexStream) -> Self {
        Self::spawn(
            peer_half,
            Box::new(|_| vec!["ok".to_string()]),
            Box::new(|byte| match byte {
                0x3F => vec!["<Idle|MPos:0.000,0.000,0.000|Bf:15,128>".to_string()],
                0x18 => vec!["Grbl 1.1h ['$' for help]".to_string()],
                _ => Vec::new(),
            }),
        )
    }

    /// Peer with a mutable status body shared with the test. `?` answers with
    /// the current body; every line answers `ok`.
    pub fn with_live_status(peer_half: DuplexStream) -> (Self, Arc<std::sync::Mutex<String>>) {
        let body = Arc::new(std::sync::Mutex::new(
            "Idle|MPos:0.000,0.000,0.000|Bf:15,128".to_string(),
        ));
        let body_for_task = body.clone();
        let emulator = Self::spawn(
            peer_half,
            Box::new(|_| vec!["ok".to_string()]),
            Box::new(move |byte| match byte {
                0x3F => vec![format!("<{}>", body_for_task.lock().unwrap())],
                0x18 => vec!["Grbl 1.1h ['$' for help]".to_string()],
                _ => Vec::new(),
            }),
        );
        (emulator, body)
    }

    /// Write an unsolicited line (banner, alarm) to the engine.
    pub fn inject_line(&self, line: impl Into<String>) {
        let _ = self.inject_tx.send(line.into());
    }

    /// Snapshot of all complete lines received so far.
    pub async fn received_lines(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    /// Snapshot of all real-time bytes received so far.
    pub async fn realtime_bytes(&self) -> Vec<u8> {
        self.realtime.lock().await.clone()
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}
