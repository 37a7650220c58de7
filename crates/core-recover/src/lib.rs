//! Failure classification, bounded retry, and alarm recovery.
//!
//! Three cooperating pieces: the [`classify`] module names what went wrong
//! and whether trying again can help; the [`retry`] module re-runs failed
//! operations under per-kind policies behind a shared circuit breaker; the
//! [`supervisor`] module walks alarm-specific recovery sequences through the
//! executor, one episode at a time.

pub mod classify;
pub mod retry;
pub mod supervisor;

pub use classify::{Classification, ErrorClassifier, ErrorKind, Severity};
pub use retry::{BreakerState, RetryError, RetryManager, RetryTelemetrySnapshot};
pub use supervisor::{AlarmSupervisor, RecoveryOutcome, alarm_table, spawn_alarm_listener};
