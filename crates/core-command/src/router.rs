//! Response routing.
//!
//! The router task is the only consumer of the link's framed lines. Each line
//! classifies to exactly one [`core_protocol::ResponseKind`]; acks flow to
//! the executor's correlation FIFO, everything else fans out on a broadcast
//! channel that the poller, supervisor, and mirror subscribe to by kind.
//! Status frames additionally refresh the shared rx-budget watch that gates
//! the executor's send slot.

use core_events::{EngineEvent, EventBus};
use core_link::LinkReader;
use core_protocol::{ResponseKind, alarm_description, classify_line};
use core_protocol::status::StatusFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub static LINES_ROUTED: AtomicU64 = AtomicU64::new(0);
pub static ACKS_ROUTED: AtomicU64 = AtomicU64::new(0);
pub static UNSOLICITED_ROUTED: AtomicU64 = AtomicU64::new(0);

/// Capacity of the unsolicited broadcast ring.
pub const UNSOLICITED_CHANNEL_CAP: usize = 256;

/// Lines that never consume the pending-command FIFO.
#[derive(Debug, Clone)]
pub enum Unsolicited {
    Status(StatusFrame),
    Alarm(u8),
    Setting { number: u16, value: String },
    Feedback(String),
    Banner(String),
    Free(String),
}

/// Ack-path message delivered to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterAck {
    Ok,
    Error(u8),
    /// Banner rides the ack path too: it flushes the whole pending queue.
    Banner,
}

/// Controller receive-buffer budget derived from status frames. `epoch`
/// advances on every frame carrying a `Bf:` field, letting the executor reset
/// its since-frame outstanding-byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxBudget {
    pub rx_free: Option<u32>,
    pub epoch: u64,
}

impl RxBudget {
    pub const fn unknown() -> Self {
        Self {
            rx_free: None,
            epoch: 0,
        }
    }
}

/// Shared handles produced by [`spawn_router`].
pub struct RouterHandles {
    pub unsolicited: broadcast::Sender<Unsolicited>,
    pub rx_budget: watch::Receiver<RxBudget>,
    /// First banner observed after attach, kept as the controller identity.
    pub welcome: watch::Receiver<Option<String>>,
    pub task: JoinHandle<()>,
}

pub fn spawn_router(
    mut reader: LinkReader,
    bus: EventBus,
) -> (RouterHandles, mpsc::Receiver<RouterAck>) {
    let (acks_tx, acks_rx) = mpsc::channel::<RouterAck>(64);
    let (unsolicited_tx, _) = broadcast::channel(UNSOLICITED_CHANNEL_CAP);
    let (budget_tx, budget_rx) = watch::channel(RxBudget::unknown());
    let (welcome_tx, welcome_rx) = watch::channel(None::<String>);

    let unsolicited_for_task = unsolicited_tx.clone();
    let task = tokio::spawn(async move {
        debug!(target: "command.router", "router_task_started");
        while let Some(line) = reader.next_line().await {
            LINES_ROUTED.fetch_add(1, Ordering::Relaxed);
            let kind = classify_line(&line);
            trace!(target: "command.router", line = %line, "line_classified");
            match kind {
                ResponseKind::Ok => {
                    ACKS_ROUTED.fetch_add(1, Ordering::Relaxed);
                    if acks_tx.send(RouterAck::Ok).await.is_err() {
                        break;
                    }
                }
                ResponseKind::Error(code) => {
                    ACKS_ROUTED.fetch_add(1, Ordering::Relaxed);
                    if acks_tx.send(RouterAck::Error(code)).await.is_err() {
                        break;
                    }
                }
                ResponseKind::Status(frame) => {
                    if let Some(buffer) = frame.buffer {
                        budget_tx.send_modify(|budget| {
                            budget.rx_free = Some(buffer.rx_free);
                            budget.epoch += 1;
                        });
                    }
                    UNSOLICITED_ROUTED.fetch_add(1, Ordering::Relaxed);
                    let _ = unsolicited_for_task.send(Unsolicited::Status(frame));
                }
                ResponseKind::Alarm(code) => {
                    warn!(target: "command.router", code, "alarm_line");
                    bus.emit(EngineEvent::AlarmDetected {
                        code,
                        description: alarm_description(code),
                    });
                    UNSOLICITED_ROUTED.fetch_add(1, Ordering::Relaxed);
                    let _ = unsolicited_for_task.send(Unsolicited::Alarm(code));
                }
                ResponseKind::Banner(text) => {
                    let is_welcome = welcome_tx.borrow().is_none();
                    if is_welcome {
                        info!(target: "command.router", banner = %text, "controller_identified");
                        let _ = welcome_tx.send(Some(text.clone()));
                    } else {
                        warn!(target: "command.router", banner = %text, "reset_detected");
                    }
                    bus.emit(EngineEvent::ResetDetected {
                        banner: text.clone(),
                    });
                    // Reset invalidates any previously reported buffer room.
                    budget_tx.send_modify(|budget| {
                        budget.rx_free = None;
                        budget.epoch += 1;
                    });
                    let _ = unsolicited_for_task.send(Unsolicited::Banner(text));
                    if acks_tx.send(RouterAck::Banner).await.is_err() {
                        break;
                    }
                }
                ResponseKind::Setting { number, value } => {
                    let _ = unsolicited_for_task.send(Unsolicited::Setting { number, value });
                }
                ResponseKind::Feedback(text) => {
                    let _ = unsolicited_for_task.send(Unsolicited::Feedback(text));
                }
                ResponseKind::Free(text) => {
                    debug!(target: "command.router", text = %text, "free_text");
                    let _ = unsolicited_for_task.send(Unsolicited::Free(text));
                }
            }
        }
        bus.emit(EngineEvent::Disconnected {
            reason: "line stream ended".to_string(),
        });
        debug!(target: "command.router", "router_task_stopped");
    });

    (
        RouterHandles {
            unsolicited: unsolicited_tx,
            rx_budget: budget_rx,
            welcome: welcome_rx,
            task,
        },
        acks_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_events::EventChannel;
    use tokio::io::AsyncWriteExt;

    async fn routed(lines: &str) -> (RouterHandles, mpsc::Receiver<RouterAck>, EventBus) {
        let (engine_side, mut peer) = tokio::io::duplex(1024);
        let link = core_link::attach(engine_side);
        let bus = EventBus::new();
        let (handles, acks) = spawn_router(link.reader, bus.clone());
        peer.write_all(lines.as_bytes()).await.unwrap();
        // Peer stays open long enough for the router to drain.
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            drop(peer);
        });
        (handles, acks, bus)
    }

    #[tokio::test]
    async fn acks_reach_the_ack_channel_in_order() {
        let (_handles, mut acks, _bus) = routed("ok\r\nerror:20\r\nok\r\n").await;
        assert_eq!(acks.recv().await.unwrap(), RouterAck::Ok);
        assert_eq!(acks.recv().await.unwrap(), RouterAck::Error(20));
        assert_eq!(acks.recv().await.unwrap(), RouterAck::Ok);
    }

    #[tokio::test]
    async fn status_never_reaches_the_ack_channel() {
        let (engine_side, mut peer) = tokio::io::duplex(1024);
        let link = core_link::attach(engine_side);
        let bus = EventBus::new();
        let (handles, mut acks) = spawn_router(link.reader, bus.clone());
        let mut unsolicited = handles.unsolicited.subscribe();

        peer.write_all(b"<Idle|Bf:15,120>\r\nok\r\n").await.unwrap();

        // The only ack is the `ok`; the status frame went out of band.
        assert_eq!(acks.recv().await.unwrap(), RouterAck::Ok);
        match unsolicited.recv().await.unwrap() {
            Unsolicited::Status(frame) => {
                assert_eq!(frame.buffer.unwrap().rx_free, 120);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_frame_updates_rx_budget_epoch() {
        let (handles, _acks, _bus) = routed("<Idle|Bf:15,100>\r\n<Idle|Bf:15,90>\r\n").await;
        let mut budget = handles.rx_budget.clone();
        budget.changed().await.unwrap();
        loop {
            let current = *budget.borrow_and_update();
            if current.epoch == 2 {
                assert_eq!(current.rx_free, Some(90));
                break;
            }
            budget.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn first_banner_is_welcome_second_is_reset() {
        let (engine_side, mut peer) = tokio::io::duplex(1024);
        let link = core_link::attach(engine_side);
        let bus = EventBus::new();
        let mut reset_rx = bus.subscribe(EventChannel::ResetDetected);
        let (handles, mut acks) = spawn_router(link.reader, bus.clone());

        peer.write_all(b"Grbl 1.1h ['$' for help]\r\n").await.unwrap();
        assert_eq!(acks.recv().await.unwrap(), RouterAck::Banner);
        assert!(matches!(
            reset_rx.recv().await.unwrap(),
            EngineEvent::ResetDetected { .. }
        ));
        assert_eq!(
            handles.welcome.borrow().as_deref(),
            Some("Grbl 1.1h ['$' for help]")
        );

        peer.write_all(b"Grbl 1.1h ['$' for help]\r\n").await.unwrap();
        assert_eq!(acks.recv().await.unwrap(), RouterAck::Banner);
        // Welcome stays the first banner.
        assert_eq!(
            handles.welcome.borrow().as_deref(),
            Some("Grbl 1.1h ['$' for help]")
        );
    }

    #[tokio::test]
    async fn alarm_line_emits_event_and_unsolicited() {
        let (engine_side, mut peer) = tokio::io::duplex(1024);
        let link = core_link::attach(engine_side);
        let bus = EventBus::new();
        let mut alarm_rx = bus.subscribe(EventChannel::AlarmDetected);
        let (handles, _acks) = spawn_router(link.reader, bus.clone());
        let mut unsolicited = handles.unsolicited.subscribe();

        peer.write_all(b"ALARM:2\r\n").await.unwrap();

        match alarm_rx.recv().await.unwrap() {
            EngineEvent::AlarmDetected { code, .. } => assert_eq!(code, 2),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            unsolicited.recv().await.unwrap(),
            Unsolicited::Alarm(2)
        ));
    }
}
