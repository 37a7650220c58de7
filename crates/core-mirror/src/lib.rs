//! The host-side mirror of controller state.
//!
//! One task owns every write to the mirror. It folds in two truth sources:
//! parsed status frames and `[GC:...]` reports from the router's unsolicited
//! channel, and command-completed events for executor-confirmed modal
//! effects. Readers get lock-free snapshots through a watch channel; each
//! update replaces the whole snapshot atomically.

pub mod modal;
pub mod sync;

pub use modal::{CoordSystem, DistanceMode, FeedMode, ModalState, MotionMode, Plane, Units};
pub use sync::{Discrepancy, Synchronizer, compare};

use core_command::Unsolicited;
use core_events::{EngineEvent, EventBus, EventChannel};
use core_protocol::status::{BufferFill, MachineState, PinFlags, Position, StatusFrame};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// One atomic view of everything the host believes about the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorSnapshot {
    pub state: MachineState,
    pub sub_state: Option<u8>,
    pub mpos: Position,
    pub wco: Position,
    pub feed: f64,
    pub spindle_speed: f64,
    pub buffer: Option<BufferFill>,
    pub pins: PinFlags,
    pub modal: ModalState,
    pub tool: u16,
    pub spindle_on: bool,
    pub coolant_on: bool,
    pub is_homed: bool,
    /// `$n=v` echoes observed since attach, keyed by setting number.
    pub settings: BTreeMap<u16, String>,
    /// False until the first status frame, and again after a reset or a
    /// poll failure marked by the session.
    pub fresh: bool,
}

impl Default for MirrorSnapshot {
    fn default() -> Self {
        Self {
            state: MachineState::Idle,
            sub_state: None,
            mpos: Position::default(),
            wco: Position::default(),
            feed: 0.0,
            spindle_speed: 0.0,
            buffer: None,
            pins: PinFlags::empty(),
            modal: ModalState::default(),
            tool: 0,
            spindle_on: false,
            coolant_on: false,
            is_homed: false,
            settings: BTreeMap::new(),
            fresh: false,
        }
    }
}

impl MirrorSnapshot {
    /// Work position derived from machine position and the work offset.
    pub fn work_position(&self) -> Position {
        Position::new(
            self.mpos.x - self.wco.x,
            self.mpos.y - self.wco.y,
            self.mpos.z - self.wco.z,
        )
    }

    fn apply_frame(&mut self, frame: &StatusFrame) {
        self.state = frame.state;
        self.sub_state = frame.sub_state;
        if let Some(mpos) = frame.mpos {
            self.mpos = mpos;
        } else if let (Some(wpos), Some(wco)) = (frame.wpos, frame.wco) {
            self.mpos = Position::new(wpos.x + wco.x, wpos.y + wco.y, wpos.z + wco.z);
        }
        if let Some(wco) = frame.wco {
            self.wco = wco;
        }
        if let Some(feed) = frame.feed {
            self.feed = feed;
        }
        if let Some(spindle) = frame.spindle {
            self.spindle_speed = spindle;
        }
        if frame.buffer.is_some() {
            self.buffer = frame.buffer;
        }
        if let Some(pins) = frame.pins {
            self.pins = pins;
        }
        self.fresh = true;
    }

    fn apply_acked_command(&mut self, payload: &str) {
        self.modal.apply_command(payload);
        let upper = payload.to_ascii_uppercase();
        if upper.contains("M3") || upper.contains("M4") {
            self.spindle_on = true;
        }
        if upper.contains("M5") {
            self.spindle_on = false;
        }
        if upper.contains("M7") || upper.contains("M8") {
            self.coolant_on = true;
        }
        if upper.contains("M9") {
            self.coolant_on = false;
        }
        if let Some(tool) = parse_tool_word(&upper) {
            self.tool = tool;
        }
        if upper == "$H" {
            self.is_homed = true;
        }
    }

    fn apply_reset(&mut self) {
        let was_homed = self.is_homed;
        // Settings live in the controller's EEPROM and survive a reset.
        let settings = std::mem::take(&mut self.settings);
        *self = MirrorSnapshot::default();
        self.settings = settings;
        // Homing survives a soft reset on machines with persistent homing,
        // but the safe assumption after any reset is that it does not.
        if was_homed {
            debug!(target: "mirror", "reset_cleared_homed_flag");
        }
    }
}

/// `T12` anywhere in the payload, tolerating packed words like `T6M6`.
fn parse_tool_word(upper: &str) -> Option<u16> {
    let at = upper.find('T')?;
    let digits: String = upper[at + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Read handle. Cloneable; all clones observe the same snapshots.
#[derive(Clone)]
pub struct MachineMirror {
    snapshot_rx: watch::Receiver<MirrorSnapshot>,
    control: mpsc::Sender<MirrorControl>,
}

enum MirrorControl {
    /// Controller truth wins: replace status-derived fields from this frame.
    Overwrite(StatusFrame),
    /// Poll failures make the snapshot untrustworthy without changing it.
    MarkStale,
}

impl MachineMirror {
    /// Current snapshot by value. An atomic read; never blocks on writers.
    pub fn snapshot(&self) -> MirrorSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch receiver for callers that react to snapshot replacement.
    pub fn watch(&self) -> watch::Receiver<MirrorSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Force the mirror to adopt controller truth (hardware-priority sync).
    pub async fn overwrite_from_frame(&self, frame: StatusFrame) {
        let _ = self.control.send(MirrorControl::Overwrite(frame)).await;
    }

    /// Flag the snapshot as stale after a poll failure.
    pub async fn mark_stale(&self) {
        let _ = self.control.send(MirrorControl::MarkStale).await;
    }
}

/// Spawn the mirror task.
pub fn spawn_mirror(
    unsolicited: broadcast::Sender<Unsolicited>,
    bus: EventBus,
) -> (MachineMirror, JoinHandle<()>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(MirrorSnapshot::default());
    let (control_tx, control_rx) = mpsc::channel(16);

    let task = tokio::spawn(run_mirror(
        unsolicited.subscribe(),
        bus.subscribe(EventChannel::CommandCompleted),
        control_rx,
        snapshot_tx,
    ));

    (
        MachineMirror {
            snapshot_rx,
            control: control_tx,
        },
        task,
    )
}

async fn run_mirror(
    mut unsolicited: broadcast::Receiver<Unsolicited>,
    mut completed: broadcast::Receiver<EngineEvent>,
    mut control: mpsc::Receiver<MirrorControl>,
    snapshot_tx: watch::Sender<MirrorSnapshot>,
) {
    debug!(target: "mirror", "mirror_task_started");
    loop {
        tokio::select! {
            message = unsolicited.recv() => match message {
                Ok(Unsolicited::Status(frame)) => {
                    snapshot_tx.send_modify(|snapshot| snapshot.apply_frame(&frame));
                }
                Ok(Unsolicited::Feedback(text)) => {
                    if let Some(modal) = ModalState::from_parser_state(&text) {
                        info!(target: "mirror", "modal_state_synced_from_parser_report");
                        snapshot_tx.send_modify(|snapshot| snapshot.modal = modal);
                    }
                }
                Ok(Unsolicited::Alarm(code)) => {
                    // Position-loss alarms invalidate the homed flag.
                    if matches!(code, 1 | 3 | 6..=9) {
                        warn!(target: "mirror", code, "alarm_cleared_homed_flag");
                        snapshot_tx.send_modify(|snapshot| snapshot.is_homed = false);
                    }
                }
                Ok(Unsolicited::Banner(_)) => {
                    snapshot_tx.send_modify(MirrorSnapshot::apply_reset);
                }
                Ok(Unsolicited::Setting { number, value }) => {
                    snapshot_tx.send_modify(|snapshot| {
                        snapshot.settings.insert(number, value);
                    });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(target: "mirror", skipped, "unsolicited_lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = completed.recv() => match event {
                Ok(EngineEvent::CommandCompleted { payload, .. }) => {
                    snapshot_tx.send_modify(|snapshot| snapshot.apply_acked_command(&payload));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(target: "mirror", skipped, "completions_lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = control.recv() => match message {
                Some(MirrorControl::Overwrite(frame)) => {
                    info!(target: "mirror", "hardware_priority_overwrite");
                    snapshot_tx.send_modify(|snapshot| snapshot.apply_frame(&frame));
                }
                Some(MirrorControl::MarkStale) => {
                    snapshot_tx.send_modify(|snapshot| snapshot.fresh = false);
                }
                None => break,
            },
        }
    }
    debug!(target: "mirror", "mirror_task_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_protocol::status::parse_status_body;

    fn frame(body: &str) -> StatusFrame {
        parse_status_body(body).unwrap()
    }

    #[test]
    fn frame_application_replaces_status_fields() {
        let mut snapshot = MirrorSnapshot::default();
        snapshot.apply_frame(&frame("Run|MPos:1.0,2.0,3.0|WCO:0.0,0.0,1.0|FS:500.0,8000"));
        assert_eq!(snapshot.state, MachineState::Run);
        assert_eq!(snapshot.mpos, Position::new(1.0, 2.0, 3.0));
        assert_eq!(snapshot.work_position(), Position::new(1.0, 2.0, 2.0));
        assert!(snapshot.fresh);
    }

    #[test]
    fn frame_without_mpos_derives_it_from_wpos() {
        let mut snapshot = MirrorSnapshot::default();
        snapshot.apply_frame(&frame("Idle|WPos:1.0,1.0,1.0|WCO:2.0,0.0,0.0"));
        assert_eq!(snapshot.mpos, Position::new(3.0, 1.0, 1.0));
    }

    #[test]
    fn acked_commands_update_modal_and_accessories() {
        let mut snapshot = MirrorSnapshot::default();
        snapshot.apply_acked_command("G91G1X5");
        assert_eq!(snapshot.modal.distance, DistanceMode::Incremental);

        snapshot.apply_acked_command("M3S12000");
        assert!(snapshot.spindle_on);
        snapshot.apply_acked_command("M8");
        assert!(snapshot.coolant_on);
        snapshot.apply_acked_command("M5");
        assert!(!snapshot.spindle_on);
        snapshot.apply_acked_command("M9");
        assert!(!snapshot.coolant_on);
        snapshot.apply_acked_command("T6");
        assert_eq!(snapshot.tool, 6);
        snapshot.apply_acked_command("$H");
        assert!(snapshot.is_homed);
    }

    #[test]
    fn reset_returns_to_defaults() {
        let mut snapshot = MirrorSnapshot::default();
        snapshot.apply_acked_command("$H");
        snapshot.apply_acked_command("M3S100");
        snapshot.apply_frame(&frame("Run|MPos:5.0,5.0,5.0"));
        snapshot.apply_reset();
        assert_eq!(snapshot, MirrorSnapshot::default());
    }

    #[test]
    fn settings_survive_a_reset() {
        let mut snapshot = MirrorSnapshot::default();
        snapshot.settings.insert(110, "5000.000".to_string());
        snapshot.apply_acked_command("$H");
        snapshot.apply_reset();
        assert!(!snapshot.is_homed);
        assert_eq!(snapshot.settings.get(&110).map(String::as_str), Some("5000.000"));
    }

    #[test]
    fn snapshot_serializes() {
        let snapshot = MirrorSnapshot::default();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: MirrorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, back);
    }

    #[tokio::test]
    async fn mirror_task_folds_frames_and_completions() {
        let (unsolicited_tx, _) = broadcast::channel(16);
        let bus = EventBus::new();
        let (mirror, _task) = spawn_mirror(unsolicited_tx.clone(), bus.clone());

        unsolicited_tx
            .send(Unsolicited::Status(frame("Run|MPos:1.0,0.0,0.0")))
            .unwrap();
        let mut watch = mirror.watch();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if watch.borrow_and_update().state == MachineState::Run {
                    break;
                }
                watch.changed().await.unwrap();
            }
        })
        .await
        .expect("frame applied");

        bus.emit(EngineEvent::CommandCompleted {
            id: 1,
            payload: "G91".to_string(),
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if watch.borrow_and_update().modal.distance == DistanceMode::Incremental {
                    break;
                }
                watch.changed().await.unwrap();
            }
        })
        .await
        .expect("acked effect applied");
    }

    #[tokio::test]
    async fn alarm_invalidates_homed_banner_resets() {
        let (unsolicited_tx, _) = broadcast::channel(16);
        let bus = EventBus::new();
        let (mirror, _task) = spawn_mirror(unsolicited_tx.clone(), bus.clone());

        bus.emit(EngineEvent::CommandCompleted {
            id: 1,
            payload: "$H".to_string(),
        });
        let mut watch = mirror.watch();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if watch.borrow_and_update().is_homed {
                    break;
                }
                watch.changed().await.unwrap();
            }
        })
        .await
        .expect("homed set");

        unsolicited_tx.send(Unsolicited::Alarm(1)).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if !watch.borrow_and_update().is_homed {
                    break;
                }
                watch.changed().await.unwrap();
            }
        })
        .await
        .expect("homed cleared");
    }
}
