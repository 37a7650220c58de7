//! Engine event types and the per-channel publish/subscribe bus.
//!
//! Every observable fact the engine produces is one [`EngineEvent`] variant,
//! published on a channel named by [`EventChannel`]. Subscribers of a channel
//! receive its events in emission order; ordering across channels is not
//! guaranteed. Each long-lived subsystem owns an [`EventBus`] handle as a
//! plain field and publishes directly; there is no shared emitter base type.

use core_protocol::status::{MachineState, Position, StatusFrame};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Capacity of each per-channel broadcast ring. A slow subscriber that falls
/// more than this many events behind observes a `Lagged` error and resumes at
/// the oldest retained event; publishers never block.
pub const EVENT_CHANNEL_CAP: usize = 1024;

// Bus telemetry. Inspected in tests and periodically logged; no locking.
pub static EVENTS_EMITTED: AtomicU64 = AtomicU64::new(0);
pub static EVENTS_UNOBSERVED: AtomicU64 = AtomicU64::new(0);

/// Discrepancy category reported by the state synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncCategory {
    Status,
    MachinePosition,
    WorkPosition,
    Motion,
    Buffer,
    Modal,
}

impl SyncCategory {
    /// Critical categories force attention under every resolution policy.
    pub fn is_critical(self) -> bool {
        matches!(self, SyncCategory::Status | SyncCategory::MachinePosition)
    }
}

/// Everything the engine reports to consumers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Link opened and the controller answered.
    Connected { port: String },
    /// Link closed or lost.
    Disconnected { reason: String },
    /// A submitted command reached a terminal `ok`.
    CommandCompleted { id: u64, payload: String },
    /// A submitted command terminated without `ok`.
    CommandFailed { id: u64, payload: String, error: String },
    /// A fresh status frame was parsed.
    StatusUpdate(StatusFrame),
    /// Machine state token changed between consecutive frames.
    StateChange { from: MachineState, to: MachineState },
    /// Machine position moved by `distance` millimeters since the last frame.
    PositionChange { position: Position, distance: f64 },
    /// Controller rx buffer free space dropped below the low threshold.
    BufferLow { rx_free: u32 },
    /// Controller rx buffer free space rose above the high threshold.
    BufferHigh { rx_free: u32 },
    /// An `ALARM:N` line or an Alarm state was observed.
    AlarmDetected { code: u8, description: &'static str },
    /// A limit switch pin is asserted in the latest frame.
    LimitSwitchActive { axes: String },
    /// The safety door pin is asserted in the latest frame.
    DoorOpen,
    /// A startup banner arrived, meaning the controller reset.
    ResetDetected { banner: String },
    /// The synchronizer found mirror and controller disagreeing.
    SyncConflict { category: SyncCategory, detail: String },
    StreamStarted { program: String, total_lines: usize },
    StreamProgress { completed: usize, total: usize },
    StreamPaused { at_line: usize },
    StreamResumed { at_line: usize },
    StreamStopped { completed: usize, total: usize },
    CheckpointCreated { path: String, cursor: usize },
    RecoveryStarted { alarm_code: u8 },
    RecoveryCompleted { alarm_code: u8, attempts: u32 },
    RecoveryFailed { alarm_code: u8, reason: String },
    /// Circuit breaker transitioned closed -> open.
    BreakerOpened { consecutive_failures: u32 },
    /// Circuit breaker transitioned back to closed.
    BreakerClosed,
}

/// Stable channel names, one per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    Connected,
    Disconnected,
    CommandCompleted,
    CommandFailed,
    StatusUpdate,
    StateChange,
    PositionChange,
    BufferLow,
    BufferHigh,
    AlarmDetected,
    LimitSwitchActive,
    DoorOpen,
    ResetDetected,
    SyncConflict,
    StreamStarted,
    StreamProgress,
    StreamPaused,
    StreamResumed,
    StreamStopped,
    CheckpointCreated,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
    BreakerOpened,
    BreakerClosed,
}

impl EventChannel {
    pub const ALL: [EventChannel; 25] = [
        EventChannel::Connected,
        EventChannel::Disconnected,
        EventChannel::CommandCompleted,
        EventChannel::CommandFailed,
        EventChannel::StatusUpdate,
        EventChannel::StateChange,
        EventChannel::PositionChange,
        EventChannel::BufferLow,
        EventChannel::BufferHigh,
        EventChannel::AlarmDetected,
        EventChannel::LimitSwitchActive,
        EventChannel::DoorOpen,
        EventChannel::ResetDetected,
        EventChannel::SyncConflict,
        EventChannel::StreamStarted,
        EventChannel::StreamProgress,
        EventChannel::StreamPaused,
        EventChannel::StreamResumed,
        EventChannel::StreamStopped,
        EventChannel::CheckpointCreated,
        EventChannel::RecoveryStarted,
        EventChannel::RecoveryCompleted,
        EventChannel::RecoveryFailed,
        EventChannel::BreakerOpened,
        EventChannel::BreakerClosed,
    ];

    /// Wire/consumer-facing channel name.
    pub fn name(self) -> &'static str {
        match self {
            EventChannel::Connected => "connected",
            EventChannel::Disconnected => "disconnected",
            EventChannel::CommandCompleted => "command_completed",
            EventChannel::CommandFailed => "command_failed",
            EventChannel::StatusUpdate => "status_update",
            EventChannel::StateChange => "state_change",
            EventChannel::PositionChange => "position_change",
            EventChannel::BufferLow => "buffer_low",
            EventChannel::BufferHigh => "buffer_high",
            EventChannel::AlarmDetected => "alarm_detected",
            EventChannel::LimitSwitchActive => "limit_switch_active",
            EventChannel::DoorOpen => "door_open",
            EventChannel::ResetDetected => "reset_detected",
            EventChannel::SyncConflict => "sync_conflict",
            EventChannel::StreamStarted => "stream_started",
            EventChannel::StreamProgress => "stream_progress",
            EventChannel::StreamPaused => "stream_paused",
            EventChannel::StreamResumed => "stream_resumed",
            EventChannel::StreamStopped => "stream_stopped",
            EventChannel::CheckpointCreated => "checkpoint_created",
            EventChannel::RecoveryStarted => "recovery_started",
            EventChannel::RecoveryCompleted => "recovery_completed",
            EventChannel::RecoveryFailed => "recovery_failed",
            EventChannel::BreakerOpened => "breaker_opened",
            EventChannel::BreakerClosed => "breaker_closed",
        }
    }

    fn index(self) -> usize {
        EventChannel::ALL.iter().position(|c| *c == self).expect("channel in ALL")
    }
}

impl EngineEvent {
    /// The channel this event publishes on.
    pub fn channel(&self) -> EventChannel {
        match self {
            EngineEvent::Connected { .. } => EventChannel::Connected,
            EngineEvent::Disconnected { .. } => EventChannel::Disconnected,
            EngineEvent::CommandCompleted { .. } => EventChannel::CommandCompleted,
            EngineEvent::CommandFailed { .. } => EventChannel::CommandFailed,
            EngineEvent::StatusUpdate(_) => EventChannel::StatusUpdate,
            EngineEvent::StateChange { .. } => EventChannel::StateChange,
            EngineEvent::PositionChange { .. } => EventChannel::PositionChange,
            EngineEvent::BufferLow { .. } => EventChannel::BufferLow,
            EngineEvent::BufferHigh { .. } => EventChannel::BufferHigh,
            EngineEvent::AlarmDetected { .. } => EventChannel::AlarmDetected,
            EngineEvent::LimitSwitchActive { .. } => EventChannel::LimitSwitchActive,
            EngineEvent::DoorOpen => EventChannel::DoorOpen,
            EngineEvent::ResetDetected { .. } => EventChannel::ResetDetected,
            EngineEvent::SyncConflict { .. } => EventChannel::SyncConflict,
            EngineEvent::StreamStarted { .. } => EventChannel::StreamStarted,
            EngineEvent::StreamProgress { .. } => EventChannel::StreamProgress,
            EngineEvent::StreamPaused { .. } => EventChannel::StreamPaused,
            EngineEvent::StreamResumed { .. } => EventChannel::StreamResumed,
            EngineEvent::StreamStopped { .. } => EventChannel::StreamStopped,
            EngineEvent::CheckpointCreated { .. } => EventChannel::CheckpointCreated,
            EngineEvent::RecoveryStarted { .. } => EventChannel::RecoveryStarted,
            EngineEvent::RecoveryCompleted { .. } => EventChannel::RecoveryCompleted,
            EngineEvent::RecoveryFailed { .. } => EventChannel::RecoveryFailed,
            EngineEvent::BreakerOpened { .. } => EventChannel::BreakerOpened,
            EngineEvent::BreakerClosed => EventChannel::BreakerClosed,
        }
    }
}

/// Per-channel broadcast bus. Cloning shares the underlying channels, so every
/// subsystem holds its own handle and publishes without coordination.
#[derive(Debug, Clone)]
pub struct EventBus {
    senders: std::sync::Arc<Vec<broadcast::Sender<EngineEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let senders = EventChannel::ALL
            .iter()
            .map(|_| broadcast::channel(EVENT_CHANNEL_CAP).0)
            .collect();
        Self {
            senders: std::sync::Arc::new(senders),
        }
    }

    /// Publish on the event's channel. Never blocks. Returns the number of
    /// subscribers that will observe the event.
    pub fn emit(&self, event: EngineEvent) -> usize {
        let channel = event.channel();
        EVENTS_EMITTED.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "events.bus", channel = channel.name(), "emit");
        match self.senders[channel.index()].send(event) {
            Ok(subscribers) => subscribers,
            Err(_) => {
                EVENTS_UNOBSERVED.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Subscribe to a single channel. Events arrive in emission order.
    pub fn subscribe(&self, channel: EventChannel) -> broadcast::Receiver<EngineEvent> {
        self.senders[channel.index()].subscribe()
    }

    /// Subscribe to every channel at once. Useful for loggers and tests.
    pub fn subscribe_all(&self) -> Vec<broadcast::Receiver<EngineEvent>> {
        EventChannel::ALL.iter().map(|c| self.subscribe(*c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_protocol::status::MachineState;

    #[tokio::test]
    async fn events_route_to_their_channel() {
        let bus = EventBus::new();
        let mut state_rx = bus.subscribe(EventChannel::StateChange);
        let mut alarm_rx = bus.subscribe(EventChannel::AlarmDetected);

        bus.emit(EngineEvent::StateChange {
            from: MachineState::Idle,
            to: MachineState::Run,
        });

        let got = state_rx.recv().await.unwrap();
        assert!(matches!(got, EngineEvent::StateChange { .. }));
        assert!(alarm_rx.try_recv().is_err(), "alarm channel must stay empty");
    }

    #[tokio::test]
    async fn per_channel_emission_order_is_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventChannel::StreamProgress);
        for completed in 0..10 {
            bus.emit(EngineEvent::StreamProgress {
                completed,
                total: 10,
            });
        }
        for expected in 0..10 {
            match rx.recv().await.unwrap() {
                EngineEvent::StreamProgress { completed, .. } => {
                    assert_eq!(completed, expected);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::new();
        let observers = bus.emit(EngineEvent::BreakerClosed);
        assert_eq!(observers, 0);
    }

    #[test]
    fn channel_names_are_unique_and_stable() {
        let mut seen = std::collections::HashSet::new();
        for channel in EventChannel::ALL {
            assert!(seen.insert(channel.name()), "duplicate {}", channel.name());
        }
        assert_eq!(EventChannel::StatusUpdate.name(), "status_update");
        assert_eq!(EventChannel::BreakerOpened.name(), "breaker_opened");
    }

    #[test]
    fn every_event_maps_to_a_listed_channel() {
        let event = EngineEvent::CheckpointCreated {
            path: "cp_1_abc123.json".to_string(),
            cursor: 1000,
        };
        assert!(EventChannel::ALL.contains(&event.channel()));
    }
}
