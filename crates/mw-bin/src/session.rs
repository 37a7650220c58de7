//! Session wiring: one controller, every subsystem, injected configuration.
//!
//! `Session::attach` takes any duplex byte stream and stands up the full
//! stack: link reader, writer task, router, executor, poller, mirror,
//! synchronizer, and the alarm supervisor with its listener. Nothing in the
//! stack reads global state; each subsystem receives its config section and
//! its bus handle at construction.

use anyhow::bail;
use core_command::{
    AckOutcome, CommandError, CommandExecutor, CommandPriority, RouterHandles, SubmitOptions,
    spawn_executor, spawn_router, spawn_writer,
};
use core_config::EngineConfig;
use core_protocol::commands;
use core_protocol::realtime::{self, OverrideAdjust, RapidOverride};
use core_protocol::status::MachineState;
use core_events::{EngineEvent, EventBus, EventChannel};
use core_link::{ByteStream, LinkShutdown, attach};
use core_mirror::{MachineMirror, Synchronizer, spawn_mirror};
use core_recover::{AlarmSupervisor, ErrorClassifier, RetryManager, spawn_alarm_listener};
use core_status::{StatusPoller, spawn_poller};
use core_stream::{
    CheckpointStore, ProgramFeed, StreamDeps, StreamError, StreamStats, spawn_stream,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Exit-code classes for batch invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Success,
    OperationalFailure,
    RecoveryRequired,
    LinkFailure,
}

impl BatchOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            BatchOutcome::Success => 0,
            BatchOutcome::OperationalFailure => 1,
            BatchOutcome::RecoveryRequired => 2,
            BatchOutcome::LinkFailure => 3,
        }
    }
}

/// Flags flipped by failure events while a batch run is in progress.
struct FailureFlags {
    recovery_failed: AtomicBool,
    link_lost: AtomicBool,
}

pub struct Session {
    pub bus: EventBus,
    pub executor: CommandExecutor,
    pub poller: StatusPoller,
    pub mirror: MachineMirror,
    pub synchronizer: Synchronizer,
    pub supervisor: Arc<AlarmSupervisor>,
    pub retry: Arc<RetryManager>,
    pub classifier: Arc<ErrorClassifier>,
    pub router: RouterHandles,
    config: EngineConfig,
    link_shutdown: LinkShutdown,
    flags: Arc<FailureFlags>,
    watcher_task: JoinHandle<()>,
}

impl Session {
    /// Stand the whole engine up over `stream`.
    pub fn attach<S: ByteStream>(stream: S, config: EngineConfig) -> Self {
        let bus = EventBus::new();
        let link = attach(stream);
        let link_shutdown = link.shutdown.clone();
        let (writer, _writer_task) = spawn_writer(link.writer);
        let (router, acks_rx) = spawn_router(link.reader, bus.clone());
        let (executor, _executor_task) = spawn_executor(
            writer,
            acks_rx,
            router.rx_budget.clone(),
            bus.clone(),
            config.executor,
            config.link.line_ending.clone(),
        );
        let (poller, _poller_task) = spawn_poller(
            executor.clone(),
            router.unsolicited.clone(),
            bus.clone(),
            config.poller,
        );
        let (mirror, _mirror_task) = spawn_mirror(router.unsolicited.clone(), bus.clone());
        let synchronizer = Synchronizer::new(
            mirror.clone(),
            executor.clone(),
            bus.clone(),
            config.sync,
        );
        let supervisor = Arc::new(AlarmSupervisor::new(
            executor.clone(),
            mirror.clone(),
            bus.clone(),
            config.recovery,
        ));
        let _listener_task = spawn_alarm_listener(supervisor.clone(), bus.clone());
        let retry = Arc::new(RetryManager::new(config.retry, bus.clone()));
        let classifier = Arc::new(ErrorClassifier::default());

        let flags = Arc::new(FailureFlags {
            recovery_failed: AtomicBool::new(false),
            link_lost: AtomicBool::new(false),
        });
        let watcher_task = spawn_failure_watcher(&bus, flags.clone());

        Self {
            bus,
            executor,
            poller,
            mirror,
            synchronizer,
            supervisor,
            retry,
            classifier,
            router,
            config,
            link_shutdown,
            flags,
            watcher_task,
        }
    }

    /// Wait briefly for the controller to introduce itself after attach.
    pub async fn await_welcome(&self, window: Duration) -> Option<String> {
        let mut welcome = self.router.welcome.clone();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if let Some(banner) = welcome.borrow_and_update().clone() {
                return Some(banner);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, welcome.changed()).await.is_err() {
                return None;
            }
        }
    }

    /// Stream a program file end to end, resuming from the latest valid
    /// checkpoint when asked. Returns the stats and the batch outcome class.
    pub async fn stream_program(
        &self,
        path: &Path,
        resume: bool,
    ) -> (Result<StreamStats, StreamError>, BatchOutcome) {
        let program_name = path.display().to_string();
        let store = CheckpointStore::new(
            self.config.streaming.checkpoint_dir.clone(),
            self.config.streaming.max_checkpoints,
        );

        let resume_cursor = if resume {
            match store.latest_for(&program_name).await {
                Ok(checkpoint) => {
                    info!(
                        target: "runtime.session",
                        cursor = checkpoint.cursor,
                        "resuming_from_checkpoint"
                    );
                    checkpoint.cursor
                }
                Err(e) => {
                    warn!(target: "runtime.session", error = %e, "checkpoint_resume_unavailable");
                    0
                }
            }
        } else {
            0
        };

        let feed = match ProgramFeed::open(path, &self.config.streaming).await {
            Ok(feed) => feed,
            Err(e) => {
                return (
                    Err(StreamError::Io(e)),
                    BatchOutcome::OperationalFailure,
                );
            }
        };

        let deps = StreamDeps {
            executor: self.executor.clone(),
            bus: self.bus.clone(),
            config: self.config.streaming.clone(),
            rx_budget: self.router.rx_budget.clone(),
            terminator_len: self.config.link.line_ending.len(),
        };
        let (_controller, task) = spawn_stream(deps, feed, program_name, Some(store), resume_cursor);

        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(target: "runtime.session", error = %join_error, "stream_task_panicked");
                return (
                    Err(StreamError::Io(std::io::Error::other(join_error))),
                    BatchOutcome::OperationalFailure,
                );
            }
        };

        let outcome = match &result {
            _ if self.flags.link_lost.load(Ordering::SeqCst) => BatchOutcome::LinkFailure,
            _ if self.flags.recovery_failed.load(Ordering::SeqCst) => {
                BatchOutcome::RecoveryRequired
            }
            Ok(stats) if stats.completed == stats.total => BatchOutcome::Success,
            _ => BatchOutcome::OperationalFailure,
        };
        (result, outcome)
    }

    /// Kill the alarm lock.
    pub async fn unlock(&self) -> Result<AckOutcome, CommandError> {
        self.executor
            .run(commands::UNLOCK, SubmitOptions::priority(CommandPriority::Immediate))
            .await
    }

    /// Run the homing cycle under the homing timeout. Homing can take tens of
    /// seconds on a large machine; the default command timeout would fail it.
    pub async fn home(&self) -> Result<AckOutcome, CommandError> {
        self.executor
            .run(
                commands::HOME,
                SubmitOptions::priority(CommandPriority::Immediate)
                    .with_timeout(self.config.recovery.homing_timeout()),
            )
            .await
    }

    /// Jog. Legal only while idle or already jogging.
    pub async fn jog(
        &self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feed: f64,
        incremental: bool,
    ) -> anyhow::Result<()> {
        let state = self.mirror.snapshot().state;
        if !matches!(state, MachineState::Idle | MachineState::Jog) {
            bail!("cannot jog while the machine is in {state}");
        }
        let command = commands::build_jog_command(x, y, z, feed, incremental);
        self.executor
            .run(&command, SubmitOptions::priority(CommandPriority::High))
            .await?;
        Ok(())
    }

    /// Cancel an in-progress jog without flushing the planner.
    pub fn jog_cancel(&self) {
        self.executor.submit_immediate(realtime::JOG_CANCEL);
    }

    pub fn feed_hold(&self) {
        self.executor.submit_immediate(realtime::FEED_HOLD);
    }

    pub fn cycle_start(&self) {
        self.executor.submit_immediate(realtime::CYCLE_START);
    }

    /// Soft reset. The mirror resets itself when the ensuing banner arrives.
    pub fn soft_reset(&self) {
        self.executor.submit_immediate(realtime::SOFT_RESET);
    }

    pub fn feed_override(&self, adjust: OverrideAdjust) {
        self.executor.submit_immediate(adjust.feed_byte());
    }

    pub fn spindle_override(&self, adjust: OverrideAdjust) {
        self.executor.submit_immediate(adjust.spindle_byte());
    }

    pub fn rapid_override(&self, preset: RapidOverride) {
        self.executor.submit_immediate(preset.byte());
    }

    /// Quiesce in order: poller first, then executor, then the link reader.
    pub async fn shutdown(self) {
        info!(target: "runtime.session", "session_shutdown");
        self.poller.shutdown();
        self.executor.shutdown();
        self.link_shutdown.signal();
        self.watcher_task.abort();
    }
}

fn spawn_failure_watcher(bus: &EventBus, flags: Arc<FailureFlags>) -> JoinHandle<()> {
    let mut recovery_rx = bus.subscribe(EventChannel::RecoveryFailed);
    let mut disconnect_rx = bus.subscribe(EventChannel::Disconnected);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = recovery_rx.recv() => match event {
                    Ok(EngineEvent::RecoveryFailed { alarm_code, reason }) => {
                        warn!(target: "runtime.session", alarm_code, reason = %reason, "recovery_required");
                        flags.recovery_failed.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
                event = disconnect_rx.recv() => match event {
                    Ok(EngineEvent::Disconnected { reason }) => {
                        warn!(target: "runtime.session", reason = %reason, "link_lost");
                        flags.link_lost.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            }
        }
    })
}
