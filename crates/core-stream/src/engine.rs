//! The streaming task and its state machine.
//!
//! Phases: `Starting -> Running -> (Pausing <-> Paused) -> Stopping`, with
//! `Completed` terminal when the cursor reaches the program's total. The task
//! keeps at most `look_ahead_lines` submissions in flight, never lets unacked
//! bytes exceed the last reported rx free space minus the safety margin, and
//! writes a durable checkpoint every `checkpoint_interval` completed lines.

use crate::checkpoint::{CheckpointStore, ChunkMetrics};
use crate::program::{ProgramFeed, ProgramLine};
use core_command::{
    CommandError, CommandExecutor, CommandPriority, RxBudget, SubmitOptions,
};
use core_config::StreamingConfig;
use core_events::{EngineEvent, EventBus};
use core_protocol::realtime::{CYCLE_START, FEED_HOLD, SOFT_RESET};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receive-buffer size assumed until the first `Bf:` report.
const DEFAULT_RX_BYTES: u32 = 128;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("program io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
}

/// Streaming state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Starting,
    Running,
    /// Draining in-flight lines before reporting paused.
    Pausing,
    Paused,
    Stopping,
    Completed,
}

impl StreamPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamPhase::Idle => "idle",
            StreamPhase::Starting => "starting",
            StreamPhase::Running => "running",
            StreamPhase::Pausing => "pausing",
            StreamPhase::Paused => "paused",
            StreamPhase::Stopping => "stopping",
            StreamPhase::Completed => "completed",
        }
    }
}

/// Final accounting for one stream run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub total: usize,
    /// Overall cursor: completed lines including any resumed prefix.
    pub completed: usize,
    pub sent_this_run: usize,
    pub errored: usize,
    pub elapsed: Duration,
}

/// Observable stream state, snapshot-replaced on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProgress {
    pub phase: StreamPhase,
    pub completed: usize,
    pub total: usize,
    pub in_flight: usize,
    pub checkpoint_cursor: usize,
}

enum StreamControl {
    Pause { immediate: bool },
    Resume,
    Stop { soft_reset: bool },
}

/// Control handle for an active stream.
#[derive(Clone)]
pub struct StreamController {
    control: mpsc::Sender<StreamControl>,
    progress: watch::Receiver<StreamProgress>,
}

impl StreamController {
    /// Graceful pause: stop submitting, drain in-flight, then report paused.
    pub async fn pause(&self) {
        let _ = self.control.send(StreamControl::Pause { immediate: false }).await;
    }

    /// Immediate pause: feed-hold now, stop submitting, report right away.
    pub async fn pause_immediate(&self) {
        let _ = self.control.send(StreamControl::Pause { immediate: true }).await;
    }

    pub async fn resume(&self) {
        let _ = self.control.send(StreamControl::Resume).await;
    }

    pub async fn stop(&self, soft_reset: bool) {
        let _ = self.control.send(StreamControl::Stop { soft_reset }).await;
    }

    pub fn progress(&self) -> StreamProgress {
        *self.progress.borrow()
    }

    pub fn progress_watch(&self) -> watch::Receiver<StreamProgress> {
        self.progress.clone()
    }
}

/// Everything the stream task needs from the surrounding engine.
pub struct StreamDeps {
    pub executor: CommandExecutor,
    pub bus: EventBus,
    pub config: StreamingConfig,
    pub rx_budget: watch::Receiver<RxBudget>,
    /// Byte length of the configured line terminator.
    pub terminator_len: usize,
}

/// Spawn a stream over `feed`, optionally resuming at `resume_cursor`
/// completed lines (checkpoint already validated by the caller).
pub fn spawn_stream(
    deps: StreamDeps,
    feed: ProgramFeed,
    program_name: String,
    checkpoints: Option<CheckpointStore>,
    resume_cursor: usize,
) -> (StreamController, JoinHandle<Result<StreamStats, StreamError>>) {
    let (control_tx, control_rx) = mpsc::channel(8);
    let total = feed.total();
    let (progress_tx, progress_rx) = watch::channel(StreamProgress {
        phase: StreamPhase::Idle,
        completed: resume_cursor,
        total,
        in_flight: 0,
        checkpoint_cursor: resume_cursor,
    });

    let controller = StreamController {
        control: control_tx,
        progress: progress_rx,
    };

    let task = tokio::spawn(run_stream(StreamTask {
        deps,
        feed,
        program_name,
        checkpoints,
        resume_cursor,
        control_rx,
        progress_tx,
    }));

    (controller, task)
}

struct StreamTask {
    deps: StreamDeps,
    feed: ProgramFeed,
    program_name: String,
    checkpoints: Option<CheckpointStore>,
    resume_cursor: usize,
    control_rx: mpsc::Receiver<StreamControl>,
    progress_tx: watch::Sender<StreamProgress>,
}

struct InFlightLine {
    id: u64,
    frame_bytes: usize,
}

type LineResult = (usize, Result<(), CommandError>);

async fn run_stream(task: StreamTask) -> Result<StreamStats, StreamError> {
    let StreamTask {
        deps,
        mut feed,
        program_name,
        checkpoints,
        resume_cursor,
        mut control_rx,
        progress_tx,
    } = task;
    let StreamDeps {
        executor,
        bus,
        config,
        mut rx_budget,
        terminator_len,
    } = deps;

    let total = feed.total();
    let started = Instant::now();
    info!(
        target: "stream.engine",
        program = %program_name,
        total,
        resume_cursor,
        "stream_starting"
    );
    set_phase(&progress_tx, StreamPhase::Starting);
    bus.emit(EngineEvent::StreamStarted {
        program: program_name.clone(),
        total_lines: total,
    });
    if resume_cursor > 0 {
        feed.skip(resume_cursor).await?;
    }

    let mut phase = StreamPhase::Running;
    set_phase(&progress_tx, phase);

    let mut completed = resume_cursor;
    let mut checkpoint_cursor = resume_cursor;
    let mut sent_this_run: usize = 0;
    let mut errored: usize = 0;
    let mut bytes_sent: u64 = 0;
    let mut in_flight: VecDeque<InFlightLine> = VecDeque::new();
    let mut in_flight_bytes: usize = 0;
    let mut next_line: Option<ProgramLine> = None;
    let mut feed_exhausted = false;
    let mut held_by_feed_hold = false;
    let mut lines_since_checkpoint: usize = 0;
    let mut last_progress_emit: Option<Instant> = None;
    let (results_tx, mut results_rx) = mpsc::channel::<LineResult>(config.look_ahead_lines.max(1));

    let final_phase = 'run: loop {
        // Fill the window while running.
        if phase == StreamPhase::Running {
            while in_flight.len() < config.look_ahead_lines.max(1) {
                if next_line.is_none() && !feed_exhausted {
                    next_line = feed.next_line().await?;
                    if next_line.is_none() {
                        feed_exhausted = true;
                    }
                }
                let Some(line) = next_line.as_ref() else { break };
                let frame_bytes = line.payload.len() + terminator_len;
                if !fits_budget(&rx_budget, &config, in_flight_bytes, frame_bytes) {
                    break;
                }
                let line = next_line.take().expect("peeked line");
                let submitted = executor
                    .submit(
                        &line.payload,
                        SubmitOptions::priority(CommandPriority::Normal),
                    )
                    .await;
                debug!(
                    target: "stream.engine",
                    line = line.file_line_no,
                    payload = %line.payload,
                    "line_submitted"
                );
                in_flight.push_back(InFlightLine {
                    id: submitted.id,
                    frame_bytes,
                });
                in_flight_bytes += frame_bytes;
                bytes_sent += frame_bytes as u64;
                sent_this_run += 1;
                let results_tx = results_tx.clone();
                tokio::spawn(async move {
                    let result = submitted.outcome().await.map(|_| ());
                    let _ = results_tx.send((frame_bytes, result)).await;
                });
            }

            // Everything submitted and acked: done.
            if feed_exhausted && next_line.is_none() && in_flight.is_empty() {
                break 'run StreamPhase::Completed;
            }
        }

        if phase == StreamPhase::Pausing && in_flight.is_empty() {
            phase = StreamPhase::Paused;
            set_phase(&progress_tx, phase);
            info!(target: "stream.engine", at_line = completed, "stream_paused");
            bus.emit(EngineEvent::StreamPaused { at_line: completed });
        }

        tokio::select! {
            result = results_rx.recv() => {
                let Some((frame_bytes, result)) = result else { break 'run phase };
                if in_flight.pop_front().is_none() {
                    warn!(target: "stream.engine", "result_without_in_flight_entry");
                }
                in_flight_bytes = in_flight_bytes.saturating_sub(frame_bytes);
                match result {
                    Ok(()) => {
                        completed += 1;
                        lines_since_checkpoint += 1;
                    }
                    Err(error) => {
                        errored += 1;
                        warn!(
                            target: "stream.engine",
                            at_line = completed,
                            error = %error,
                            "line_failed"
                        );
                        let reset = matches!(error, CommandError::BannerReset);
                        if config.pause_on_error || reset {
                            if phase == StreamPhase::Running {
                                phase = StreamPhase::Pausing;
                                set_phase(&progress_tx, phase);
                            }
                        }
                    }
                }

                if lines_since_checkpoint >= config.checkpoint_interval
                    && config.checkpoint_interval > 0
                    && let Some(store) = checkpoints.as_ref()
                {
                    let metrics = ChunkMetrics {
                        lines_sent: sent_this_run as u64,
                        lines_ok: (completed - resume_cursor) as u64,
                        lines_errored: errored as u64,
                        bytes_sent,
                    };
                    match store.save(&program_name, completed, metrics).await {
                        Ok((path, checkpoint)) => {
                            checkpoint_cursor = checkpoint.cursor;
                            lines_since_checkpoint = 0;
                            bus.emit(EngineEvent::CheckpointCreated {
                                path: path.display().to_string(),
                                cursor: checkpoint.cursor,
                            });
                        }
                        Err(e) => {
                            warn!(target: "stream.engine", error = %e, "checkpoint_write_failed");
                        }
                    }
                }

                if last_progress_emit.is_none_or(|at| at.elapsed() >= config.progress_interval()) {
                    last_progress_emit = Some(Instant::now());
                    bus.emit(EngineEvent::StreamProgress { completed, total });
                }
                update_progress(&progress_tx, phase, completed, total, in_flight.len(), checkpoint_cursor);
            }
            control = control_rx.recv() => {
                let Some(control) = control else { break 'run phase };
                match control {
                    StreamControl::Pause { immediate } => {
                        if matches!(phase, StreamPhase::Running) {
                            if immediate {
                                executor.submit_immediate(FEED_HOLD);
                                held_by_feed_hold = true;
                                phase = StreamPhase::Paused;
                                set_phase(&progress_tx, phase);
                                info!(target: "stream.engine", at_line = completed, "stream_paused_feed_hold");
                                bus.emit(EngineEvent::StreamPaused { at_line: completed });
                            } else {
                                phase = StreamPhase::Pausing;
                                set_phase(&progress_tx, phase);
                            }
                        }
                    }
                    StreamControl::Resume => {
                        if matches!(phase, StreamPhase::Paused | StreamPhase::Pausing) {
                            if held_by_feed_hold {
                                executor.submit_immediate(CYCLE_START);
                                held_by_feed_hold = false;
                            }
                            phase = StreamPhase::Running;
                            set_phase(&progress_tx, phase);
                            info!(target: "stream.engine", at_line = completed, "stream_resumed");
                            bus.emit(EngineEvent::StreamResumed { at_line: completed });
                        }
                    }
                    StreamControl::Stop { soft_reset } => {
                        phase = StreamPhase::Stopping;
                        set_phase(&progress_tx, phase);
                        for line in &in_flight {
                            executor.cancel(line.id);
                        }
                        if soft_reset {
                            executor.submit_immediate(SOFT_RESET);
                        }
                        break 'run StreamPhase::Stopping;
                    }
                }
            }
            changed = rx_budget.changed(), if phase == StreamPhase::Running => {
                if changed.is_err() {
                    // Router gone; the in-flight futures will fail and drive
                    // the pause path.
                    phase = StreamPhase::Pausing;
                    set_phase(&progress_tx, phase);
                }
            }
        }
    };

    let elapsed = started.elapsed();
    let stats = StreamStats {
        total,
        completed,
        sent_this_run,
        errored,
        elapsed,
    };
    let end_phase = if final_phase == StreamPhase::Completed {
        StreamPhase::Completed
    } else {
        StreamPhase::Idle
    };
    update_progress(&progress_tx, end_phase, completed, total, 0, checkpoint_cursor);
    bus.emit(EngineEvent::StreamProgress { completed, total });
    bus.emit(EngineEvent::StreamStopped { completed, total });
    info!(
        target: "stream.engine",
        completed,
        total,
        errored,
        elapsed_ms = elapsed.as_millis() as u64,
        phase = final_phase.as_str(),
        "stream_finished"
    );
    Ok(stats)
}

/// Invariant: unacked bytes plus the next frame stay within the last
/// reported rx free space minus the safety margin.
fn fits_budget(
    rx_budget: &watch::Receiver<RxBudget>,
    config: &StreamingConfig,
    in_flight_bytes: usize,
    frame_bytes: usize,
) -> bool {
    let rx_free = rx_budget.borrow().rx_free.unwrap_or(DEFAULT_RX_BYTES);
    let allowance = rx_free.saturating_sub(config.rx_safety_margin) as usize;
    in_flight_bytes + frame_bytes <= allowance
}

fn set_phase(progress_tx: &watch::Sender<StreamProgress>, phase: StreamPhase) {
    progress_tx.send_modify(|p| p.phase = phase);
}

fn update_progress(
    progress_tx: &watch::Sender<StreamProgress>,
    phase: StreamPhase,
    completed: usize,
    total: usize,
    in_flight: usize,
    checkpoint_cursor: usize,
) {
    let _ = progress_tx.send(StreamProgress {
        phase,
        completed,
        total,
        in_flight,
        checkpoint_cursor,
    });
}
