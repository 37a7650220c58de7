//! Poller loop behavior against a scripted controller peer.

use core_command::{spawn_executor, spawn_router, spawn_writer};
use core_config::{ExecutorConfig, PollerConfig};
use core_events::{EngineEvent, EventBus, EventChannel};
use core_link::testing::Emulator;
use core_status::{PollTier, PollerState, StatusPoller, spawn_poller};
use std::time::Duration;
use tokio::time::timeout;

fn quick_config() -> PollerConfig {
    PollerConfig {
        fast_ms: 10,
        normal_ms: 25,
        slow_ms: 100,
        poll_timeout_ms: 100,
        max_missed: 2,
        ..PollerConfig::default()
    }
}

fn rig(emulator_factory: impl FnOnce(tokio::io::DuplexStream) -> Emulator) -> (StatusPoller, EventBus, Emulator) {
    let (engine_side, peer_side) = tokio::io::duplex(4096);
    let emulator = emulator_factory(peer_side);
    let link = core_link::attach(engine_side);
    let bus = EventBus::new();
    let (writer, _writer_task) = spawn_writer(link.writer);
    let (router, acks_rx) = spawn_router(link.reader, bus.clone());
    let (executor, _executor_task) = spawn_executor(
        writer,
        acks_rx,
        router.rx_budget.clone(),
        bus.clone(),
        ExecutorConfig::default(),
        "\r\n".to_string(),
    );
    let (poller, _poller_task) =
        spawn_poller(executor, router.unsolicited.clone(), bus.clone(), quick_config());
    (poller, bus, emulator)
}

#[tokio::test]
async fn poll_now_emits_status_update() {
    let (poller, bus, _emulator) = rig(Emulator::ack_everything);
    let mut status_rx = bus.subscribe(EventChannel::StatusUpdate);

    poller.poll_now().await;

    let event = timeout(Duration::from_secs(1), status_rx.recv())
        .await
        .expect("status arrives")
        .unwrap();
    assert!(matches!(event, EngineEvent::StatusUpdate(_)));
}

#[tokio::test]
async fn repeated_poll_now_is_idempotent_on_events() {
    let (poller, bus, _emulator) = rig(Emulator::ack_everything);
    let mut status_rx = bus.subscribe(EventChannel::StatusUpdate);
    let mut state_rx = bus.subscribe(EventChannel::StateChange);

    for _ in 0..3 {
        poller.poll_now().await;
        timeout(Duration::from_secs(1), status_rx.recv())
            .await
            .expect("status arrives")
            .unwrap();
    }
    // Identical frames: status updates flow, but no state deltas appear.
    assert!(state_rx.try_recv().is_err());
}

#[tokio::test]
async fn missed_polls_beyond_bound_stop_the_poller() {
    // Peer that never answers the status query.
    let (poller, _bus, _emulator) = rig(|peer| {
        Emulator::spawn(peer, Box::new(|_| vec!["ok".to_string()]), Box::new(|_| Vec::new()))
    });
    let mut state_watch = poller.state_watch();

    poller.start().await;

    timeout(Duration::from_secs(5), async {
        loop {
            if matches!(*state_watch.borrow_and_update(), PollerState::Failed { .. }) {
                break;
            }
            state_watch.changed().await.unwrap();
        }
    })
    .await
    .expect("poller reports failure");

    match poller.state() {
        PollerState::Failed { consecutive_missed } => {
            assert!(consecutive_missed > 2, "bound is exceeded, not merely met");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn activity_raises_the_cadence_tier() {
    let (engine_side, peer_side) = tokio::io::duplex(4096);
    let (emulator, status_body) = Emulator::with_live_status(peer_side);
    let link = core_link::attach(engine_side);
    let bus = EventBus::new();
    let (writer, _writer_task) = spawn_writer(link.writer);
    let (router, acks_rx) = spawn_router(link.reader, bus.clone());
    let (executor, _executor_task) = spawn_executor(
        writer,
        acks_rx,
        router.rx_budget.clone(),
        bus.clone(),
        ExecutorConfig::default(),
        "\r\n".to_string(),
    );
    let (poller, _poller_task) =
        spawn_poller(executor, router.unsolicited.clone(), bus.clone(), quick_config());
    let _keep = emulator;

    *status_body.lock().unwrap() = "Run|MPos:1.000,0.000,0.000|Bf:15,128".to_string();
    poller.start().await;

    timeout(Duration::from_secs(2), async {
        loop {
            if poller.tier() == PollTier::Fast {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tier escalates to fast while running");
}
