//! Command execution over the link: a single writer task, a response router,
//! and the executor that correlates acks to submissions.
//!
//! Ordering rules enforced here:
//! * one command occupies the send slot at a time; the slot releases only on
//!   a terminal `ok`/`error` ack,
//! * the pending FIFO's head is terminated by the next ack, regardless of
//!   status frames or other unsolicited lines in between,
//! * real-time bytes bypass both queues entirely.

pub mod command;
pub mod executor;
pub mod router;
pub mod writer;

pub use command::{AckOutcome, CommandError, CommandPriority, SubmitOptions, SubmittedCommand};
pub use executor::{CommandExecutor, ExecutorTelemetrySnapshot, spawn_executor};
pub use router::{RouterHandles, RxBudget, Unsolicited, spawn_router};
pub use writer::{WriterHandle, spawn_writer};
