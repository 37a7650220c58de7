//! End-to-end executor behavior against a scripted controller peer.

use core_command::{
    CommandError, CommandExecutor, CommandPriority, RouterHandles, SubmitOptions, spawn_executor,
    spawn_router, spawn_writer,
};
use core_config::ExecutorConfig;
use core_events::{EngineEvent, EventBus, EventChannel};
use core_link::testing::Emulator;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;

struct Rig {
    executor: CommandExecutor,
    router: RouterHandles,
    bus: EventBus,
    emulator: Emulator,
}

fn rig_with(emulator_factory: impl FnOnce(tokio::io::DuplexStream) -> Emulator) -> Rig {
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
    Rig {
        executor,
        router,
        bus,
        emulator,
    }
}

async fn wait_for_lines(emulator: &Emulator, count: usize) {
    for _ in 0..200 {
        if emulator.received_lines().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("peer never received {count} lines");
}

#[tokio::test]
async fn minimal_ack_completes_the_future() {
    let rig = rig_with(Emulator::ack_everything);

    let outcome = rig
        .executor
        .run("G0 X1", SubmitOptions::default())
        .await
        .expect("single command acks");
    assert_eq!(outcome.payload, "G0X1");
    assert_eq!(rig.emulator.received_lines().await, vec!["G0X1".to_string()]);
}

#[tokio::test]
async fn fifo_correlation_under_load() {
    let rig = rig_with(Emulator::ack_everything);
    let mut completed = rig.bus.subscribe(EventChannel::CommandCompleted);

    let a = rig.executor.submit("G0X1", SubmitOptions::default()).await;
    let b = rig.executor.submit("G0X2", SubmitOptions::default()).await;
    let c = rig.executor.submit("G0X3", SubmitOptions::default()).await;
    let (id_a, id_b, id_c) = (a.id, b.id, c.id);

    assert_eq!(a.outcome().await.unwrap().payload, "G0X1");
    assert_eq!(b.outcome().await.unwrap().payload, "G0X2");
    assert_eq!(c.outcome().await.unwrap().payload, "G0X3");

    // Completion events observe submission order, not merely all-complete.
    for expected in [id_a, id_b, id_c] {
        match completed.recv().await.unwrap() {
            EngineEvent::CommandCompleted { id, .. } => assert_eq!(id, expected),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn controller_error_fails_only_its_command() {
    let rejected = Arc::new(AtomicBool::new(false));
    let rejected_in_script = rejected.clone();
    let rig = rig_with(move |peer| {
        Emulator::spawn(
            peer,
            Box::new(move |line| {
                if line.contains("X999999") {
                    rejected_in_script.store(true, Ordering::SeqCst);
                    vec!["error:10".to_string()]
                } else {
                    vec!["ok".to_string()]
                }
            }),
            Box::new(|_| Vec::new()),
        )
    });

    let good = rig.executor.submit("G0X1", SubmitOptions::default()).await;
    let bad = rig.executor.submit("G0X999999", SubmitOptions::default()).await;
    let tail = rig.executor.submit("G0X2", SubmitOptions::default()).await;

    assert!(good.outcome().await.is_ok());
    match bad.outcome().await {
        Err(CommandError::Controller { code: 10, .. }) => {}
        other => panic!("expected error:10, got {other:?}"),
    }
    assert!(tail.outcome().await.is_ok(), "later command unaffected");
    assert!(rejected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn realtime_bytes_never_disturb_pending_order() {
    let rig = rig_with(Emulator::ack_everything);

    let a = rig.executor.submit("G0X1", SubmitOptions::default()).await;
    rig.executor.submit_immediate(b'!');
    let b = rig.executor.submit("G0X2", SubmitOptions::default()).await;
    rig.executor.submit_immediate(b'~');
    let c = rig.executor.submit("G0X3", SubmitOptions::default()).await;

    assert_eq!(a.outcome().await.unwrap().payload, "G0X1");
    assert_eq!(b.outcome().await.unwrap().payload, "G0X2");
    assert_eq!(c.outcome().await.unwrap().payload, "G0X3");

    let realtime = rig.emulator.realtime_bytes().await;
    assert!(realtime.contains(&b'!'));
    assert!(realtime.contains(&b'~'));
}

#[tokio::test]
async fn timeout_leaves_head_and_discards_late_ack() {
    let respond = Arc::new(AtomicBool::new(false));
    let respond_in_script = respond.clone();
    let rig = rig_with(move |peer| {
        Emulator::spawn(
            peer,
            Box::new(move |_| {
                if respond_in_script.load(Ordering::SeqCst) {
                    vec!["ok".to_string()]
                } else {
                    Vec::new()
                }
            }),
            Box::new(|_| Vec::new()),
        )
    });

    let doomed = rig
        .executor
        .submit(
            "G4P10",
            SubmitOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert_eq!(doomed.outcome().await, Err(CommandError::Timeout));

    // The controller finally answers the dead head; the orphan ack must be
    // swallowed and the next command correlates cleanly.
    rig.emulator.inject_line("ok");
    respond.store(true, Ordering::SeqCst);
    let next = rig.executor.run("G0X1", SubmitOptions::default()).await;
    assert_eq!(next.unwrap().payload, "G0X1");
}

#[tokio::test]
async fn banner_mid_queue_fails_every_pending_future() {
    let rig = rig_with(move |peer| {
        Emulator::spawn(peer, Box::new(|_| Vec::new()), Box::new(|_| Vec::new()))
    });
    let mut reset_rx = rig.bus.subscribe(EventChannel::ResetDetected);

    let a = rig.executor.submit("G0X1", SubmitOptions::default()).await;
    let b = rig.executor.submit("G0X2", SubmitOptions::default()).await;
    wait_for_lines(&rig.emulator, 2).await;

    rig.emulator.inject_line("Grbl 1.1h ['$' for help]");

    assert_eq!(a.outcome().await, Err(CommandError::BannerReset));
    assert_eq!(b.outcome().await, Err(CommandError::BannerReset));
    assert!(matches!(
        timeout(Duration::from_secs(1), reset_rx.recv()).await.unwrap().unwrap(),
        EngineEvent::ResetDetected { .. }
    ));
}

#[tokio::test]
async fn zero_rx_free_blocks_dispatch_until_room_returns() {
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

    // Report a full receive buffer.
    *status_body.lock().unwrap() = "Hold|Bf:15,0".to_string();
    executor.submit_immediate(b'?');
    let mut budget = router.rx_budget.clone();
    timeout(Duration::from_secs(1), async {
        loop {
            if budget.borrow_and_update().rx_free == Some(0) {
                break;
            }
            budget.changed().await.unwrap();
        }
    })
    .await
    .expect("budget reflects zero rx_free");

    let held = executor.submit("G0X1", SubmitOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        emulator.received_lines().await.is_empty(),
        "no line may be written against a zero budget"
    );

    // Room comes back; the held command goes out and completes.
    *status_body.lock().unwrap() = "Idle|Bf:15,128".to_string();
    executor.submit_immediate(b'?');
    assert_eq!(
        timeout(Duration::from_secs(1), held.outcome())
            .await
            .expect("completes after budget recovers")
            .unwrap()
            .payload,
        "G0X1"
    );
}

#[tokio::test]
async fn priorities_drain_in_strict_order_once_unblocked() {
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

    *status_body.lock().unwrap() = "Hold|Bf:15,0".to_string();
    executor.submit_immediate(b'?');
    let mut budget = router.rx_budget.clone();
    timeout(Duration::from_secs(1), async {
        loop {
            if budget.borrow_and_update().rx_free == Some(0) {
                break;
            }
            budget.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let normal = executor
        .submit("G1X1", SubmitOptions::priority(CommandPriority::Normal))
        .await;
    let low = executor
        .submit("$G", SubmitOptions::priority(CommandPriority::Low))
        .await;
    let urgent = executor
        .submit("$X", SubmitOptions::priority(CommandPriority::Immediate))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    *status_body.lock().unwrap() = "Idle|Bf:15,128".to_string();
    executor.submit_immediate(b'?');

    for handle in [urgent, normal, low] {
        timeout(Duration::from_secs(1), handle.outcome())
            .await
            .expect("drains")
            .unwrap();
    }
    let lines = emulator.received_lines().await;
    assert_eq!(lines, vec!["$X".to_string(), "G1X1".to_string(), "$G".to_string()]);
}

#[tokio::test]
async fn cancel_queued_and_inflight_commands() {
    let respond = Arc::new(AtomicBool::new(false));
    let respond_in_script = respond.clone();
    let rig = rig_with(move |peer| {
        Emulator::spawn(
            peer,
            Box::new(move |_| {
                if respond_in_script.load(Ordering::SeqCst) {
                    vec!["ok".to_string()]
                } else {
                    Vec::new()
                }
            }),
            Box::new(|_| Vec::new()),
        )
    });

    let inflight = rig.executor.submit("G4P10", SubmitOptions::default()).await;
    let id = inflight.id;
    wait_for_lines(&rig.emulator, 1).await;
    rig.executor.cancel(id);
    assert_eq!(inflight.outcome().await, Err(CommandError::Cancelled));

    // The wire still owes the ack; it is swallowed without shifting the FIFO.
    rig.emulator.inject_line("ok");
    respond.store(true, Ordering::SeqCst);
    let next = rig.executor.run("G0X9", SubmitOptions::default()).await;
    assert_eq!(next.unwrap().payload, "G0X9");
}

#[tokio::test]
async fn payload_containing_a_realtime_byte_is_intercepted_on_the_wire() {
    let rig = rig_with(Emulator::ack_everything);

    // `?` inside a command line is consumed by the controller as a status
    // query; the remaining characters form the actual line.
    let outcome = rig.executor.run("G0?X1", SubmitOptions::default()).await;
    assert!(outcome.is_ok());
    assert_eq!(rig.emulator.realtime_bytes().await, vec![b'?']);
    assert_eq!(rig.emulator.received_lines().await, vec!["G0X1".to_string()]);
}
