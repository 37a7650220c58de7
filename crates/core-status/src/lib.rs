//! Status polling and status-derived event emission.
//!
//! The poller owns the cadence of the out-of-band `?` byte. The resulting
//! frame arrives unsolicited through the router's broadcast channel, so
//! polling never touches the command FIFO and is idempotent with respect to
//! machine state. Cadence adapts in three tiers from recent machine activity;
//! consecutive missed polls beyond the configured bound stop the poller and
//! surface a poll failure.

use core_command::{CommandExecutor, Unsolicited};
use core_config::PollerConfig;
use core_events::{EngineEvent, EventBus};
use core_protocol::realtime::STATUS_QUERY;
use core_protocol::status::{MachineState, PinFlags, Position, StatusFrame};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

pub static POLLS_SENT: AtomicU64 = AtomicU64::new(0);
pub static POLLS_MISSED: AtomicU64 = AtomicU64::new(0);
pub static TIER_TRANSITIONS: AtomicU64 = AtomicU64::new(0);

/// Machine movement below this distance is jitter, not a position change.
const POSITION_EPSILON_MM: f64 = 0.001;

/// Activity window that keeps the fast tier selected.
const FAST_WINDOW: Duration = Duration::from_secs(5);
/// Inactivity span after which the slow tier engages.
const SLOW_WINDOW: Duration = Duration::from_secs(30);

/// Polling cadence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTier {
    Fast,
    Normal,
    Slow,
}

impl PollTier {
    pub fn interval(self, config: &PollerConfig) -> Duration {
        match self {
            PollTier::Fast => Duration::from_millis(config.fast_ms),
            PollTier::Normal => Duration::from_millis(config.normal_ms),
            PollTier::Slow => Duration::from_millis(config.slow_ms),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PollTier::Fast => "fast",
            PollTier::Normal => "normal",
            PollTier::Slow => "slow",
        }
    }
}

/// Whether the poll loop is issuing queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Running,
    Stopped,
    /// Stopped after exceeding the consecutive missed-poll bound.
    Failed { consecutive_missed: u32 },
}

enum PollerControl {
    Start,
    Stop,
    PollNow,
}

/// Control handle for the poller task.
#[derive(Clone)]
pub struct StatusPoller {
    control: mpsc::Sender<PollerControl>,
    shutdown: Arc<Notify>,
    state: watch::Receiver<PollerState>,
    tier: watch::Receiver<PollTier>,
}

impl StatusPoller {
    pub async fn start(&self) {
        let _ = self.control.send(PollerControl::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.control.send(PollerControl::Stop).await;
    }

    /// Issue a single query now, independent of the cadence and of whether
    /// the periodic loop is running.
    pub async fn poll_now(&self) {
        let _ = self.control.send(PollerControl::PollNow).await;
    }

    pub fn state(&self) -> PollerState {
        self.state.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<PollerState> {
        self.state.clone()
    }

    pub fn tier(&self) -> PollTier {
        *self.tier.borrow()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Spawn the poller task. It subscribes to the router's unsolicited channel
/// for status frames and writes `?` through the executor's real-time path.
pub fn spawn_poller(
    executor: CommandExecutor,
    unsolicited: broadcast::Sender<Unsolicited>,
    bus: EventBus,
    config: PollerConfig,
) -> (StatusPoller, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::channel(8);
    let shutdown = Arc::new(Notify::new());
    let (state_tx, state_rx) = watch::channel(PollerState::Stopped);
    let (tier_tx, tier_rx) = watch::channel(PollTier::Normal);

    let handle = StatusPoller {
        control: control_tx,
        shutdown: shutdown.clone(),
        state: state_rx,
        tier: tier_rx,
    };

    let task = tokio::spawn(run_poller(PollerTask {
        executor,
        frames: unsolicited.subscribe(),
        bus,
        config,
        control_rx,
        shutdown,
        state_tx,
        tier_tx,
    }));

    (handle, task)
}

struct PollerTask {
    executor: CommandExecutor,
    frames: broadcast::Receiver<Unsolicited>,
    bus: EventBus,
    config: PollerConfig,
    control_rx: mpsc::Receiver<PollerControl>,
    shutdown: Arc<Notify>,
    state_tx: watch::Sender<PollerState>,
    tier_tx: watch::Sender<PollTier>,
}

/// Frame-to-frame deltas the poller turns into events.
struct FrameObserver {
    bus: EventBus,
    config: PollerConfig,
    last_state: Option<MachineState>,
    last_mpos: Option<Position>,
    last_rx_free: Option<u32>,
    last_pins: PinFlags,
    last_activity: Option<Instant>,
}

impl FrameObserver {
    fn new(bus: EventBus, config: PollerConfig) -> Self {
        Self {
            bus,
            config,
            last_state: None,
            last_mpos: None,
            last_rx_free: None,
            last_pins: PinFlags::empty(),
            last_activity: None,
        }
    }

    fn observe(&mut self, frame: &StatusFrame, now: Instant) {
        self.bus.emit(EngineEvent::StatusUpdate(frame.clone()));

        if frame.state.is_active() {
            self.last_activity = Some(now);
        }

        let entered_alarm = frame.state == MachineState::Alarm
            && self.last_state != Some(MachineState::Alarm);
        if let Some(previous) = self.last_state
            && previous != frame.state
        {
            info!(
                target: "status.poller",
                from = %previous,
                to = %frame.state,
                "machine_state_changed"
            );
            self.bus.emit(EngineEvent::StateChange {
                from: previous,
                to: frame.state,
            });
        }
        if entered_alarm {
            self.bus.emit(EngineEvent::AlarmDetected {
                code: 0,
                description: "alarm state reported by status poll",
            });
        }
        self.last_state = Some(frame.state);

        if let Some(mpos) = frame.mpos {
            if let Some(previous) = self.last_mpos {
                let distance = previous.distance_to(&mpos);
                if distance > POSITION_EPSILON_MM {
                    self.bus.emit(EngineEvent::PositionChange {
                        position: mpos,
                        distance,
                    });
                }
            }
            self.last_mpos = Some(mpos);
        }

        if let Some(buffer) = frame.buffer {
            let low = self.config.rx_low_watermark;
            let high = self.config.rx_high_watermark;
            match self.last_rx_free {
                Some(previous) if previous > low && buffer.rx_free <= low => {
                    warn!(target: "status.poller", rx_free = buffer.rx_free, "buffer_low");
                    self.bus.emit(EngineEvent::BufferLow {
                        rx_free: buffer.rx_free,
                    });
                }
                Some(previous) if previous < high && buffer.rx_free >= high => {
                    self.bus.emit(EngineEvent::BufferHigh {
                        rx_free: buffer.rx_free,
                    });
                }
                _ => {}
            }
            self.last_rx_free = Some(buffer.rx_free);
        }

        let pins = frame.pins.unwrap_or_else(PinFlags::empty);
        if pins.any_limit() && !self.last_pins.any_limit() {
            let mut axes = String::new();
            for (flag, name) in [
                (PinFlags::LIMIT_X, 'X'),
                (PinFlags::LIMIT_Y, 'Y'),
                (PinFlags::LIMIT_Z, 'Z'),
            ] {
                if pins.contains(flag) {
                    axes.push(name);
                }
            }
            warn!(target: "status.poller", axes = %axes, "limit_switch_active");
            self.bus.emit(EngineEvent::LimitSwitchActive { axes });
        }
        if pins.contains(PinFlags::DOOR) && !self.last_pins.contains(PinFlags::DOOR) {
            self.bus.emit(EngineEvent::DoorOpen);
        }
        self.last_pins = pins;
    }

    fn tier(&self, now: Instant) -> PollTier {
        match self.last_activity {
            Some(at) if now.duration_since(at) <= FAST_WINDOW => PollTier::Fast,
            Some(at) if now.duration_since(at) <= SLOW_WINDOW => PollTier::Normal,
            Some(_) => PollTier::Slow,
            // Never seen activity: settle into the slow tier only after the
            // inactivity span, as if activity had just ceased at startup.
            None => PollTier::Normal,
        }
    }
}

async fn run_poller(task: PollerTask) {
    let PollerTask {
        executor,
        mut frames,
        bus,
        config,
        mut control_rx,
        shutdown,
        state_tx,
        tier_tx,
    } = task;

    let mut observer = FrameObserver::new(bus, config);
    let mut running = false;
    let mut consecutive_missed: u32 = 0;
    let started = Instant::now();
    let mut observer_tier = PollTier::Normal;

    debug!(target: "status.poller", "poller_task_started");
    loop {
        let interval = observer_tier.interval(&config);
        let tick = tokio::time::sleep(interval);
        tokio::pin!(tick);

        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            control = control_rx.recv() => {
                match control {
                    Some(PollerControl::Start) => {
                        if !running {
                            info!(target: "status.poller", tier = observer_tier.as_str(), "poller_started");
                            running = true;
                            consecutive_missed = 0;
                            let _ = state_tx.send(PollerState::Running);
                        }
                    }
                    Some(PollerControl::Stop) => {
                        if running {
                            info!(target: "status.poller", "poller_stopped");
                            running = false;
                            let _ = state_tx.send(PollerState::Stopped);
                        }
                    }
                    Some(PollerControl::PollNow) => {
                        poll_once(&executor, &mut frames, &mut observer, &config, &mut consecutive_missed).await;
                    }
                    None => break,
                }
            }
            _ = &mut tick, if running => {
                let missed_before = consecutive_missed;
                poll_once(&executor, &mut frames, &mut observer, &config, &mut consecutive_missed).await;
                if consecutive_missed > config.max_missed {
                    error!(
                        target: "status.poller",
                        consecutive_missed,
                        max_missed = config.max_missed,
                        "poll_failure_stopping"
                    );
                    running = false;
                    let _ = state_tx.send(PollerState::Failed { consecutive_missed });
                } else if consecutive_missed > missed_before {
                    warn!(target: "status.poller", consecutive_missed, "poll_missed");
                }
            }
        }

        // Re-evaluate the cadence tier after every cycle; activity observed
        // since startup drives the selection.
        let now = Instant::now();
        let tier = if observer.last_activity.is_none()
            && now.duration_since(started) > SLOW_WINDOW
        {
            PollTier::Slow
        } else {
            observer.tier(now)
        };
        if tier != observer_tier {
            TIER_TRANSITIONS.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "status.poller",
                from = observer_tier.as_str(),
                to = tier.as_str(),
                "poll_rate_changed"
            );
            observer_tier = tier;
            let _ = tier_tx.send(tier);
        }
    }
    debug!(target: "status.poller", "poller_task_stopped");
}

/// Send one `?` and wait for the next status frame, skipping other
/// unsolicited kinds. A lagged broadcast position is recovered by resync.
async fn poll_once(
    executor: &CommandExecutor,
    frames: &mut broadcast::Receiver<Unsolicited>,
    observer: &mut FrameObserver,
    config: &PollerConfig,
    consecutive_missed: &mut u32,
) {
    // Drain frames that arrived before this query so the answer we correlate
    // with the poll is at least as new as the query itself.
    loop {
        match frames.try_recv() {
            Ok(Unsolicited::Status(frame)) => {
                observer.observe(&frame, Instant::now());
            }
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                trace!(target: "status.poller", skipped, "frames_lagged_resync");
            }
            Err(_) => break,
        }
    }

    executor.submit_immediate(STATUS_QUERY);
    POLLS_SENT.fetch_add(1, Ordering::Relaxed);

    let deadline = Instant::now() + config.poll_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            POLLS_MISSED.fetch_add(1, Ordering::Relaxed);
            *consecutive_missed += 1;
            return;
        }
        match tokio::time::timeout(remaining, frames.recv()).await {
            Ok(Ok(Unsolicited::Status(frame))) => {
                observer.observe(&frame, Instant::now());
                *consecutive_missed = 0;
                return;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                trace!(target: "status.poller", skipped, "frames_lagged_resync");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                POLLS_MISSED.fetch_add(1, Ordering::Relaxed);
                *consecutive_missed += 1;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_protocol::status::{BufferFill, parse_status_body};

    fn observer() -> (FrameObserver, EventBus) {
        let bus = EventBus::new();
        (FrameObserver::new(bus.clone(), PollerConfig::default()), bus)
    }

    fn frame(body: &str) -> StatusFrame {
        parse_status_body(body).unwrap()
    }

    #[tokio::test]
    async fn state_transition_emits_state_change() {
        let (mut observer, bus) = observer();
        let mut rx = bus.subscribe(core_events::EventChannel::StateChange);
        let now = Instant::now();

        observer.observe(&frame("Idle"), now);
        observer.observe(&frame("Run"), now);

        match rx.recv().await.unwrap() {
            EngineEvent::StateChange { from, to } => {
                assert_eq!(from, MachineState::Idle);
                assert_eq!(to, MachineState::Run);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_identical_frames_emit_no_delta_events() {
        let (mut observer, bus) = observer();
        let mut state_rx = bus.subscribe(core_events::EventChannel::StateChange);
        let mut pos_rx = bus.subscribe(core_events::EventChannel::PositionChange);
        let now = Instant::now();

        for _ in 0..5 {
            observer.observe(&frame("Idle|MPos:1.000,2.000,3.000"), now);
        }
        assert!(state_rx.try_recv().is_err());
        assert!(pos_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn movement_beyond_epsilon_emits_position_change() {
        let (mut observer, bus) = observer();
        let mut rx = bus.subscribe(core_events::EventChannel::PositionChange);
        let now = Instant::now();

        observer.observe(&frame("Run|MPos:0.000,0.000,0.000"), now);
        observer.observe(&frame("Run|MPos:3.000,4.000,0.000"), now);

        match rx.recv().await.unwrap() {
            EngineEvent::PositionChange { distance, .. } => {
                assert!((distance - 5.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn buffer_watermark_crossings() {
        let (mut observer, bus) = observer();
        let mut low_rx = bus.subscribe(core_events::EventChannel::BufferLow);
        let mut high_rx = bus.subscribe(core_events::EventChannel::BufferHigh);
        let now = Instant::now();

        observer.observe(&frame("Run|Bf:15,100"), now);
        observer.observe(&frame("Run|Bf:2,10"), now);
        observer.observe(&frame("Run|Bf:15,100"), now);

        assert!(matches!(
            low_rx.recv().await.unwrap(),
            EngineEvent::BufferLow { rx_free: 10 }
        ));
        assert!(matches!(
            high_rx.recv().await.unwrap(),
            EngineEvent::BufferHigh { rx_free: 100 }
        ));
    }

    #[tokio::test]
    async fn limit_and_door_pins_are_edge_triggered() {
        let (mut observer, bus) = observer();
        let mut limit_rx = bus.subscribe(core_events::EventChannel::LimitSwitchActive);
        let mut door_rx = bus.subscribe(core_events::EventChannel::DoorOpen);
        let now = Instant::now();

        observer.observe(&frame("Alarm|Pn:XD"), now);
        observer.observe(&frame("Alarm|Pn:XD"), now);

        match limit_rx.recv().await.unwrap() {
            EngineEvent::LimitSwitchActive { axes } => assert_eq!(axes, "X"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(door_rx.recv().await.unwrap(), EngineEvent::DoorOpen));
        // Second identical frame added nothing.
        assert!(limit_rx.try_recv().is_err());
        assert!(door_rx.try_recv().is_err());
    }

    #[test]
    fn tier_selection_follows_activity_windows() {
        let (mut observer, _bus) = observer();
        let start = Instant::now();
        observer.observe(&frame("Run"), start);

        assert_eq!(observer.tier(start + Duration::from_secs(2)), PollTier::Fast);
        assert_eq!(observer.tier(start + Duration::from_secs(10)), PollTier::Normal);
        assert_eq!(observer.tier(start + Duration::from_secs(31)), PollTier::Slow);
    }

    #[test]
    fn hold_counts_as_activity() {
        let (mut observer, _bus) = observer();
        let now = Instant::now();
        observer.observe(&frame("Hold:0"), now);
        assert_eq!(observer.tier(now), PollTier::Fast);
    }

    #[test]
    fn buffer_fill_struct_is_exposed() {
        let f = frame("Idle|Bf:15,128");
        assert_eq!(
            f.buffer,
            Some(BufferFill {
                planner_free: 15,
                rx_free: 128
            })
        );
    }
}
