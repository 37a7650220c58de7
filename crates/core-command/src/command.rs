//! Command submission types and terminal outcomes.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Scheduling class for a submitted command line. Real-time control bytes are
/// not commands and never appear here; see `submit_immediate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    /// Recovery and unlock traffic. Always accepted, served first.
    Immediate,
    /// Jogging and interactive operations. Accepted past the queue cap.
    High,
    /// Program lines. Waits for queue room up to its deadline.
    Normal,
    /// Background queries. Rejected outright when the queue is full.
    Low,
}

/// Per-submission overrides. `Default` takes everything from executor config.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<CommandPriority>,
    pub timeout: Option<Duration>,
    /// Retry-policy tag recorded on failures for the classifier's context.
    pub tag: Option<&'static str>,
}

impl SubmitOptions {
    pub fn priority(priority: CommandPriority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Successful terminal state of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub id: u64,
    /// Payload as written to the wire, terminator excluded.
    pub payload: String,
}

/// Terminal failure states of a command. Exhaustive at this boundary; the
/// classifier in `core-recover` maps these onward.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Controller rejected the line with `error:N`.
    #[error("controller error {code}: {description}")]
    Controller { code: u8, description: &'static str },
    /// Deadline expired before the ack arrived.
    #[error("command timed out")]
    Timeout,
    /// Cancelled by the submitter before a terminal ack.
    #[error("command cancelled")]
    Cancelled,
    /// A startup banner arrived while this command was queued or in flight.
    #[error("controller reset while command outstanding")]
    BannerReset,
    /// Transport failed under the command.
    #[error("link failure: {0}")]
    Link(#[from] core_link::LinkError),
    /// Queue at capacity and the priority does not wait.
    #[error("pending queue full")]
    QueueFull,
    /// Executor is shutting down.
    #[error("executor shut down")]
    Shutdown,
}

impl CommandError {
    /// Stable snake_case kind name used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Controller { .. } => "controller_error",
            CommandError::Timeout => "timeout",
            CommandError::Cancelled => "cancelled",
            CommandError::BannerReset => "banner_reset",
            CommandError::Link(_) => "link_failure",
            CommandError::QueueFull => "queue_full",
            CommandError::Shutdown => "shutdown",
        }
    }
}

/// Handle to one in-flight submission: the id for cancellation plus the
/// receiver that resolves with the terminal outcome.
#[derive(Debug)]
pub struct SubmittedCommand {
    pub id: u64,
    pub(crate) rx: oneshot::Receiver<Result<AckOutcome, CommandError>>,
}

impl SubmittedCommand {
    /// Await the terminal outcome. A dropped executor resolves as `Shutdown`.
    pub async fn outcome(self) -> Result<AckOutcome, CommandError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Shutdown),
        }
    }
}

/// Normalize a payload for the wire: trim, strip interior whitespace so token
/// spacing never confuses older firmware, and leave the terminator to the
/// writer, which appends it exactly once.
pub fn normalize_payload(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_interior_and_edge_whitespace() {
        assert_eq!(normalize_payload("  G0 X1 Y2  "), "G0X1Y2");
        assert_eq!(normalize_payload("G0\tX1\r\n"), "G0X1");
        assert_eq!(normalize_payload("$X"), "$X");
    }

    #[test]
    fn priority_order_is_strict() {
        assert!(CommandPriority::Immediate < CommandPriority::High);
        assert!(CommandPriority::High < CommandPriority::Normal);
        assert!(CommandPriority::Normal < CommandPriority::Low);
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(CommandError::Timeout.kind(), "timeout");
        assert_eq!(CommandError::BannerReset.kind(), "banner_reset");
        assert_eq!(
            CommandError::Link(core_link::LinkError::Closed).kind(),
            "link_failure"
        );
    }
}
