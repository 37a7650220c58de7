//! Command executor: admission, dispatch, and ack correlation.
//!
//! One task owns the pending FIFO and the four priority queues. Dispatch is
//! gated by the in-flight cap and by the controller's receive-buffer budget
//! (last reported `rx_free` minus bytes written since that report). The next
//! `ok`/`error` from the router always terminates the oldest in-flight
//! command; a command whose submitter gave up (timeout, cancel) stays in the
//! FIFO as a dead entry until its ack arrives, keeping correlation intact.

use crate::command::{
    AckOutcome, CommandError, CommandPriority, SubmitOptions, SubmittedCommand, normalize_payload,
};
use crate::router::{RouterAck, RxBudget};
use crate::writer::WriterHandle;
use core_config::ExecutorConfig;
use core_events::{EngineEvent, EventBus};
use core_protocol::error_description;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

pub static COMMANDS_SUBMITTED: AtomicU64 = AtomicU64::new(0);
pub static COMMANDS_COMPLETED: AtomicU64 = AtomicU64::new(0);
pub static COMMANDS_FAILED: AtomicU64 = AtomicU64::new(0);
pub static COMMANDS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
pub static COMMANDS_CANCELLED: AtomicU64 = AtomicU64::new(0);
pub static ORPHAN_ACKS_DISCARDED: AtomicU64 = AtomicU64::new(0);

/// Receive-buffer size assumed until the first status frame reports `Bf:`.
const DEFAULT_RX_BYTES: usize = 128;

/// Executor counter snapshot for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorTelemetrySnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub orphan_acks: u64,
}

impl ExecutorTelemetrySnapshot {
    pub fn capture() -> Self {
        Self {
            submitted: COMMANDS_SUBMITTED.load(Ordering::Relaxed),
            completed: COMMANDS_COMPLETED.load(Ordering::Relaxed),
            failed: COMMANDS_FAILED.load(Ordering::Relaxed),
            timed_out: COMMANDS_TIMED_OUT.load(Ordering::Relaxed),
            cancelled: COMMANDS_CANCELLED.load(Ordering::Relaxed),
            orphan_acks: ORPHAN_ACKS_DISCARDED.load(Ordering::Relaxed),
        }
    }
}

type ReplySender = oneshot::Sender<Result<AckOutcome, CommandError>>;

struct Submission {
    id: u64,
    payload: String,
    priority: CommandPriority,
    deadline: Instant,
    tag: Option<&'static str>,
    reply: ReplySender,
}

struct QueuedCommand {
    id: u64,
    payload: String,
    deadline: Instant,
    tag: Option<&'static str>,
    reply: ReplySender,
}

/// Whether the submitter still holds a live future for an in-flight command.
enum PendingDisposition {
    AwaitingAck { deadline: Instant, reply: ReplySender },
    /// Submitter already answered; the eventual ack is discarded.
    DeadTimedOut,
    DeadCancelled,
}

struct PendingCommand {
    id: u64,
    payload: String,
    /// Frame length on the wire; credited back to the rx budget on ack.
    bytes_on_wire: usize,
    disposition: PendingDisposition,
}

/// Cloneable submission handle. All clones feed the same executor task.
#[derive(Clone)]
pub struct CommandExecutor {
    submit_tx: mpsc::Sender<Submission>,
    cancel_tx: mpsc::UnboundedSender<u64>,
    writer: WriterHandle,
    shutdown: Arc<Notify>,
    next_id: Arc<AtomicU64>,
    default_timeout: Duration,
}

impl CommandExecutor {
    /// Submit one command line. Resolves with the terminal outcome.
    pub async fn submit(
        &self,
        payload: impl AsRef<str>,
        options: SubmitOptions,
    ) -> SubmittedCommand {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = normalize_payload(payload.as_ref());
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let (reply, rx) = oneshot::channel();
        COMMANDS_SUBMITTED.fetch_add(1, Ordering::Relaxed);

        let submission = Submission {
            id,
            payload,
            priority: options.priority.unwrap_or(CommandPriority::Normal),
            deadline: Instant::now() + timeout,
            tag: options.tag,
            reply,
        };
        if let Err(send_error) = self.submit_tx.send(submission).await {
            let _ = send_error.0.reply.send(Err(CommandError::Shutdown));
        }
        SubmittedCommand { id, rx }
    }

    /// Submit and await the outcome in one step.
    pub async fn run(
        &self,
        payload: impl AsRef<str>,
        options: SubmitOptions,
    ) -> Result<AckOutcome, CommandError> {
        self.submit(payload, options).await.outcome().await
    }

    /// Write a single real-time byte, bypassing every queue. Fire-and-forget.
    pub fn submit_immediate(&self, byte: u8) {
        self.writer.send_realtime(byte);
    }

    /// Cancel a submission by id. Best effort: bytes already on the wire stay
    /// there and the eventual ack is discarded silently.
    pub fn cancel(&self, id: u64) {
        let _ = self.cancel_tx.send(id);
    }

    /// Stop the executor task. Outstanding futures resolve with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Spawn the executor task.
pub fn spawn_executor(
    writer: WriterHandle,
    acks_rx: mpsc::Receiver<RouterAck>,
    rx_budget: watch::Receiver<RxBudget>,
    bus: EventBus,
    config: ExecutorConfig,
    line_ending: String,
) -> (CommandExecutor, JoinHandle<()>) {
    let (submit_tx, submit_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());

    let handle = CommandExecutor {
        submit_tx,
        cancel_tx,
        writer: writer.clone(),
        shutdown: shutdown.clone(),
        next_id: Arc::new(AtomicU64::new(1)),
        default_timeout: config.command_timeout(),
    };

    let task = tokio::spawn(run_executor(ExecutorTask {
        writer,
        acks_rx,
        submit_rx,
        cancel_rx,
        rx_budget,
        bus,
        shutdown,
        max_pending: config.max_pending,
        line_ending: line_ending.into_bytes(),
    }));

    (handle, task)
}

struct ExecutorTask {
    writer: WriterHandle,
    acks_rx: mpsc::Receiver<RouterAck>,
    submit_rx: mpsc::Receiver<Submission>,
    cancel_rx: mpsc::UnboundedReceiver<u64>,
    rx_budget: watch::Receiver<RxBudget>,
    bus: EventBus,
    shutdown: Arc<Notify>,
    max_pending: usize,
    line_ending: Vec<u8>,
}

struct ExecutorCore {
    /// One queue per priority, index order == dispatch order.
    queues: [VecDeque<QueuedCommand>; 4],
    pending: VecDeque<PendingCommand>,
    bus: EventBus,
    max_pending: usize,
    line_ending: Vec<u8>,
    /// Latest `Bf:` budget and bytes written since its epoch.
    rx_free: Option<usize>,
    budget_epoch: u64,
    bytes_since_frame: usize,
    link_down: bool,
}

const QUEUE_ORDER: [CommandPriority; 4] = [
    CommandPriority::Immediate,
    CommandPriority::High,
    CommandPriority::Normal,
    CommandPriority::Low,
];

fn queue_index(priority: CommandPriority) -> usize {
    QUEUE_ORDER.iter().position(|p| *p == priority).expect("priority in order")
}

async fn run_executor(task: ExecutorTask) {
    let ExecutorTask {
        writer,
        mut acks_rx,
        mut submit_rx,
        mut cancel_rx,
        mut rx_budget,
        bus,
        shutdown,
        max_pending,
        line_ending,
    } = task;

    let mut core = ExecutorCore {
        queues: Default::default(),
        pending: VecDeque::new(),
        bus,
        max_pending,
        line_ending,
        rx_free: None,
        budget_epoch: 0,
        bytes_since_frame: 0,
        link_down: false,
    };

    debug!(target: "command.executor", "executor_task_started");
    loop {
        let next_deadline = core.earliest_deadline();
        let sleep_target =
            next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        let deadline_sleep = tokio::time::sleep_until(sleep_target);
        tokio::pin!(deadline_sleep);

        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                core.fail_everything(CommandError::Shutdown);
                break;
            }
            Some(id) = cancel_rx.recv() => {
                core.cancel(id);
            }
            ack = acks_rx.recv(), if !core.link_down => {
                match ack {
                    Some(RouterAck::Ok) => core.correlate(Ok(())),
                    Some(RouterAck::Error(code)) => core.correlate(Err(code)),
                    Some(RouterAck::Banner) => core.fail_everything(CommandError::BannerReset),
                    None => {
                        info!(target: "command.executor", "link_lost_pausing_submissions");
                        core.link_down = true;
                        core.fail_everything(CommandError::Link(core_link::LinkError::Closed));
                    }
                }
            }
            changed = rx_budget.changed(), if !core.link_down => {
                if changed.is_ok() {
                    let budget = *rx_budget.borrow_and_update();
                    core.apply_budget(budget);
                }
            }
            Some(submission) = submit_rx.recv() => {
                core.admit(submission);
            }
            _ = &mut deadline_sleep, if next_deadline.is_some() => {
                core.sweep_deadlines(Instant::now());
            }
        }

        core.dispatch(&writer).await;
    }
    debug!(target: "command.executor", "executor_task_stopped");
}

impl ExecutorCore {
    fn outstanding(&self) -> usize {
        self.pending.len() + self.queues.iter().map(VecDeque::len).sum::<usize>()
    }

    fn admit(&mut self, submission: Submission) {
        if self.link_down {
            fail_reply(
                submission.reply,
                submission.id,
                &submission.payload,
                CommandError::Link(core_link::LinkError::Closed),
                &self.bus,
            );
            return;
        }
        if submission.payload.is_empty() {
            // Nothing to put on the wire; complete without consuming a slot.
            trace!(target: "command.executor", id = submission.id, "empty_payload_completed");
            COMMANDS_COMPLETED.fetch_add(1, Ordering::Relaxed);
            let _ = submission.reply.send(Ok(AckOutcome {
                id: submission.id,
                payload: String::new(),
            }));
            return;
        }
        let full = self.outstanding() >= self.max_pending;
        if full && submission.priority == CommandPriority::Low {
            fail_reply(
                submission.reply,
                submission.id,
                &submission.payload,
                CommandError::QueueFull,
                &self.bus,
            );
            return;
        }
        // Normal waits in queue up to its deadline; high and immediate are
        // admitted past the cap.
        trace!(
            target: "command.executor",
            id = submission.id,
            priority = ?submission.priority,
            tag = submission.tag,
            "command_queued"
        );
        self.queues[queue_index(submission.priority)].push_back(QueuedCommand {
            id: submission.id,
            payload: submission.payload,
            deadline: submission.deadline,
            tag: submission.tag,
            reply: submission.reply,
        });
    }

    fn apply_budget(&mut self, budget: RxBudget) {
        if budget.epoch != self.budget_epoch {
            self.budget_epoch = budget.epoch;
            self.bytes_since_frame = 0;
        }
        self.rx_free = budget.rx_free.map(|free| free as usize);
    }

    /// Room left in the controller's receive buffer for one more frame.
    fn frame_fits(&self, frame_len: usize) -> bool {
        let budget = self.rx_free.unwrap_or(DEFAULT_RX_BYTES);
        self.bytes_since_frame + frame_len <= budget
    }

    async fn dispatch(&mut self, writer: &WriterHandle) {
        if self.link_down {
            return;
        }
        loop {
            if self.pending.len() >= self.max_pending {
                return;
            }
            let Some(queue_at) = (0..self.queues.len()).find(|&i| !self.queues[i].is_empty())
            else {
                return;
            };
            let frame_len = self.queues[queue_at].front().expect("non-empty").payload.len()
                + self.line_ending.len();
            if !self.frame_fits(frame_len) {
                trace!(target: "command.executor", frame_len, "dispatch_held_no_rx_room");
                return;
            }
            let command = self.queues[queue_at].pop_front().expect("non-empty");

            let mut frame = Vec::with_capacity(frame_len);
            frame.extend_from_slice(command.payload.as_bytes());
            frame.extend_from_slice(&self.line_ending);

            match writer.write_frame(frame).await {
                Ok(()) => {
                    self.bytes_since_frame += frame_len;
                    trace!(
                        target: "command.executor",
                        id = command.id,
                        payload = %command.payload,
                        "command_written"
                    );
                    self.pending.push_back(PendingCommand {
                        id: command.id,
                        payload: command.payload,
                        bytes_on_wire: frame_len,
                        disposition: PendingDisposition::AwaitingAck {
                            deadline: command.deadline,
                            reply: command.reply,
                        },
                    });
                }
                Err(e) => {
                    warn!(target: "command.executor", error = %e, "write_failed_pausing");
                    self.link_down = true;
                    fail_reply(
                        command.reply,
                        command.id,
                        &command.payload,
                        CommandError::Link(e),
                        &self.bus,
                    );
                    return;
                }
            }
        }
    }

    /// Terminate the head of the pending FIFO with an ack.
    fn correlate(&mut self, ack: Result<(), u8>) {
        let Some(head) = self.pending.pop_front() else {
            ORPHAN_ACKS_DISCARDED.fetch_add(1, Ordering::Relaxed);
            warn!(target: "command.executor", ?ack, "orphan_ack_no_pending");
            return;
        };
        // An ack means the controller consumed the line from its receive
        // buffer; that room is available again.
        self.bytes_since_frame = self.bytes_since_frame.saturating_sub(head.bytes_on_wire);
        match head.disposition {
            PendingDisposition::AwaitingAck { reply, .. } => match ack {
                Ok(()) => {
                    COMMANDS_COMPLETED.fetch_add(1, Ordering::Relaxed);
                    self.bus.emit(EngineEvent::CommandCompleted {
                        id: head.id,
                        payload: head.payload.clone(),
                    });
                    let _ = reply.send(Ok(AckOutcome {
                        id: head.id,
                        payload: head.payload,
                    }));
                }
                Err(code) => {
                    let error = CommandError::Controller {
                        code,
                        description: error_description(code),
                    };
                    fail_reply(reply, head.id, &head.payload, error, &self.bus);
                }
            },
            PendingDisposition::DeadTimedOut => {
                ORPHAN_ACKS_DISCARDED.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "command.executor",
                    id = head.id,
                    "late_ack_for_timed_out_command_discarded"
                );
            }
            PendingDisposition::DeadCancelled => {
                ORPHAN_ACKS_DISCARDED.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "command.executor",
                    id = head.id,
                    "ack_for_cancelled_command_discarded"
                );
            }
        }
    }

    fn cancel(&mut self, id: u64) {
        for queue in &mut self.queues {
            if let Some(position) = queue.iter().position(|c| c.id == id) {
                let command = queue.remove(position).expect("position valid");
                COMMANDS_CANCELLED.fetch_add(1, Ordering::Relaxed);
                fail_reply(
                    command.reply,
                    id,
                    &command.payload,
                    CommandError::Cancelled,
                    &self.bus,
                );
                return;
            }
        }
        if let Some(pending) = self.pending.iter_mut().find(|p| p.id == id) {
            let disposition =
                std::mem::replace(&mut pending.disposition, PendingDisposition::DeadCancelled);
            if let PendingDisposition::AwaitingAck { reply, .. } = disposition {
                COMMANDS_CANCELLED.fetch_add(1, Ordering::Relaxed);
                fail_reply(reply, id, &pending.payload, CommandError::Cancelled, &self.bus);
            } else {
                // Already dead; keep the original disposition's logging class.
                pending.disposition = disposition;
            }
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        let queued = self
            .queues
            .iter()
            .flat_map(|queue| queue.iter().map(|c| c.deadline));
        let pending = self.pending.iter().filter_map(|p| match &p.disposition {
            PendingDisposition::AwaitingAck { deadline, .. } => Some(*deadline),
            _ => None,
        });
        queued.chain(pending).min()
    }

    fn sweep_deadlines(&mut self, now: Instant) {
        for queue in &mut self.queues {
            let mut index = 0;
            while index < queue.len() {
                if queue[index].deadline <= now {
                    let command = queue.remove(index).expect("index valid");
                    COMMANDS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
                    fail_reply(
                        command.reply,
                        command.id,
                        &command.payload,
                        CommandError::Timeout,
                        &self.bus,
                    );
                } else {
                    index += 1;
                }
            }
        }
        // In-flight entries stay in the FIFO as dead heads: the controller
        // still owes an ack and correlation must not shift.
        for pending in &mut self.pending {
            let expired = matches!(
                &pending.disposition,
                PendingDisposition::AwaitingAck { deadline, .. } if *deadline <= now
            );
            if expired {
                let disposition =
                    std::mem::replace(&mut pending.disposition, PendingDisposition::DeadTimedOut);
                if let PendingDisposition::AwaitingAck { reply, .. } = disposition {
                    COMMANDS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
                    fail_reply(
                        reply,
                        pending.id,
                        &pending.payload,
                        CommandError::Timeout,
                        &self.bus,
                    );
                }
            }
        }
    }

    fn fail_everything(&mut self, error: CommandError) {
        for queue in &mut self.queues {
            while let Some(command) = queue.pop_front() {
                fail_reply(command.reply, command.id, &command.payload, error.clone(), &self.bus);
            }
        }
        while let Some(pending) = self.pending.pop_front() {
            if let PendingDisposition::AwaitingAck { reply, .. } = pending.disposition {
                fail_reply(reply, pending.id, &pending.payload, error.clone(), &self.bus);
            }
        }
        self.bytes_since_frame = 0;
    }
}

fn fail_reply(
    reply: ReplySender,
    id: u64,
    payload: &str,
    error: CommandError,
    bus: &EventBus,
) {
    COMMANDS_FAILED.fetch_add(1, Ordering::Relaxed);
    bus.emit(EngineEvent::CommandFailed {
        id,
        payload: payload.to_string(),
        error: error.kind().to_string(),
    });
    let _ = reply.send(Err(error));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_order_matches_priority_order() {
        assert_eq!(queue_index(CommandPriority::Immediate), 0);
        assert_eq!(queue_index(CommandPriority::High), 1);
        assert_eq!(queue_index(CommandPriority::Normal), 2);
        assert_eq!(queue_index(CommandPriority::Low), 3);
    }
}
