//! Error and alarm classification.
//!
//! Known controller codes classify through static tables; free-text failures
//! fall back to substring heuristics. A capped pattern store counts
//! recurrences per (kind, context) so classifications of previously seen
//! text report higher confidence.

use core_command::CommandError;
use core_protocol::{alarm_description, error_description};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, trace};

/// Confidence for a static-table hit.
const TABLE_CONFIDENCE: f64 = 0.9;
/// Base confidence for a heuristic hit.
const HEURISTIC_CONFIDENCE: f64 = 0.5;
/// Confidence floor for totally unrecognized failures.
const UNKNOWN_CONFIDENCE: f64 = 0.2;
/// Per-recurrence confidence boost and its cap.
const RECURRENCE_STEP: f64 = 0.02;
const RECURRENCE_CAP: f64 = 0.09;

/// Exhaustive failure kinds at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Controller errors by code family.
    SyntaxError,
    ParameterError,
    StateError,
    LimitError,
    BufferError,
    SafetyError,
    ConfigurationError,
    SystemError,
    // Controller alarms by code family.
    HardLimit,
    SoftLimit,
    AbortCycle,
    ProbeError,
    HomingError,
    // Transport.
    PortUnavailable,
    WriteFailure,
    ReadFailure,
    ConnectionLost,
    // Protocol.
    UnknownResponse,
    BannerReset,
    Timeout,
    // Higher level.
    Cancelled,
    RecoveryFailed,
    BreakerOpen,
    ChecksumMismatch,
    OutOfBounds,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::ParameterError => "parameter_error",
            ErrorKind::StateError => "state_error",
            ErrorKind::LimitError => "limit_error",
            ErrorKind::BufferError => "buffer_error",
            ErrorKind::SafetyError => "safety_error",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::SystemError => "system_error",
            ErrorKind::HardLimit => "hard_limit",
            ErrorKind::SoftLimit => "soft_limit",
            ErrorKind::AbortCycle => "abort_cycle",
            ErrorKind::ProbeError => "probe_error",
            ErrorKind::HomingError => "homing_error",
            ErrorKind::PortUnavailable => "port_unavailable",
            ErrorKind::WriteFailure => "write_failure",
            ErrorKind::ReadFailure => "read_failure",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::UnknownResponse => "unknown_response",
            ErrorKind::BannerReset => "banner_reset",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RecoveryFailed => "recovery_failed",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::OutOfBounds => "out_of_bounds",
        }
    }

    /// True when this kind names a machine alarm rather than an error reply.
    pub fn is_alarm(self) -> bool {
        matches!(
            self,
            ErrorKind::HardLimit
                | ErrorKind::SoftLimit
                | ErrorKind::AbortCycle
                | ErrorKind::ProbeError
                | ErrorKind::HomingError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the classifier reports for one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub confidence: f64,
    pub description: String,
    pub suggested_actions: Vec<&'static str>,
}

fn actions_for(kind: ErrorKind) -> Vec<&'static str> {
    match kind {
        ErrorKind::SyntaxError | ErrorKind::ParameterError => {
            vec!["fix the offending g-code line", "re-run the program"]
        }
        ErrorKind::StateError => vec!["wait for idle", "unlock with $X if alarmed"],
        ErrorKind::HardLimit => vec![
            "move the machine away from the limit switches by hand or jog",
            "inspect switch wiring for shorts",
            "re-home when the machine is clear",
        ],
        ErrorKind::SoftLimit | ErrorKind::OutOfBounds => vec![
            "unlock with $X",
            "reposition inside the travel envelope",
        ],
        ErrorKind::AbortCycle => vec!["unlock with $X", "re-establish modal state"],
        ErrorKind::ProbeError => vec!["check probe wiring", "verify probe starting position"],
        ErrorKind::HomingError => vec!["clear the axes", "re-run homing ($H)"],
        ErrorKind::BufferError => vec!["let the planner drain", "reduce streaming batch size"],
        ErrorKind::PortUnavailable | ErrorKind::ConnectionLost => vec![
            "check the serial cable",
            "verify the port path and permissions",
        ],
        ErrorKind::Timeout => vec!["check controller responsiveness", "retry the operation"],
        ErrorKind::BannerReset => vec!["re-home if position was lost", "restart the stream"],
        ErrorKind::SafetyError => vec!["close the safety door"],
        ErrorKind::BreakerOpen => vec!["wait for the breaker reset window"],
        ErrorKind::ChecksumMismatch => vec!["discard the checkpoint", "restart from the program start"],
        _ => Vec::new(),
    }
}

/// Static classification of a controller `error:N` code.
pub fn classify_error_code(code: u8) -> Classification {
    let (kind, severity, retryable) = match code {
        1..=3 | 20 | 21 | 24 | 25 => (ErrorKind::SyntaxError, Severity::Low, false),
        4 | 22 | 23 | 26..=38 => (ErrorKind::ParameterError, Severity::Low, false),
        8 | 9 => (ErrorKind::StateError, Severity::Medium, true),
        15 => (ErrorKind::LimitError, Severity::High, false),
        11 | 14 => (ErrorKind::BufferError, Severity::Medium, true),
        13 => (ErrorKind::SafetyError, Severity::High, false),
        5 | 10 | 12 | 17 => (ErrorKind::ConfigurationError, Severity::Medium, false),
        6 | 7 => (ErrorKind::SystemError, Severity::High, false),
        _ => (ErrorKind::UnknownResponse, Severity::Medium, false),
    };
    Classification {
        kind,
        severity,
        retryable,
        confidence: TABLE_CONFIDENCE,
        description: format!("error:{code}: {}", error_description(code)),
        suggested_actions: actions_for(kind),
    }
}

/// Static classification of an `ALARM:N` code.
pub fn classify_alarm_code(code: u8) -> Classification {
    let (kind, severity) = match code {
        1 => (ErrorKind::HardLimit, Severity::Critical),
        2 => (ErrorKind::SoftLimit, Severity::High),
        3 => (ErrorKind::AbortCycle, Severity::Medium),
        4 | 5 => (ErrorKind::ProbeError, Severity::Medium),
        6..=9 => (ErrorKind::HomingError, Severity::High),
        _ => (ErrorKind::UnknownResponse, Severity::High),
    };
    Classification {
        kind,
        severity,
        // Alarms are never retried at the command level; the supervisor owns
        // their recovery.
        retryable: false,
        confidence: TABLE_CONFIDENCE,
        description: format!("ALARM:{code}: {}", alarm_description(code)),
        suggested_actions: actions_for(kind),
    }
}

/// Substring heuristics for failures that arrive as free text.
pub fn classify_text(text: &str) -> Classification {
    let lower = text.to_ascii_lowercase();
    let hit = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    let (kind, severity, retryable) = if hit(&["timeout", "timed out"]) {
        (ErrorKind::Timeout, Severity::Medium, true)
    } else if hit(&["connection", "serial", "disconnected", "port"]) {
        (ErrorKind::ConnectionLost, Severity::High, true)
    } else if hit(&["buffer", "overflow"]) {
        (ErrorKind::BufferError, Severity::Medium, true)
    } else if hit(&["hard limit"]) {
        (ErrorKind::HardLimit, Severity::Critical, false)
    } else if hit(&["soft limit", "limit"]) {
        (ErrorKind::SoftLimit, Severity::High, false)
    } else if hit(&["not idle", "busy", "locked"]) {
        (ErrorKind::StateError, Severity::Medium, true)
    } else if hit(&["syntax", "invalid"]) {
        (ErrorKind::SyntaxError, Severity::Low, false)
    } else {
        (ErrorKind::UnknownResponse, Severity::Medium, false)
    };

    let confidence = if kind == ErrorKind::UnknownResponse {
        UNKNOWN_CONFIDENCE
    } else {
        HEURISTIC_CONFIDENCE
    };

    Classification {
        kind,
        severity,
        retryable,
        confidence,
        description: text.to_string(),
        suggested_actions: actions_for(kind),
    }
}

/// Classification of executor-level command failures.
pub fn classify_command_error(error: &CommandError) -> Classification {
    match error {
        CommandError::Controller { code, .. } => classify_error_code(*code),
        CommandError::Timeout => Classification {
            kind: ErrorKind::Timeout,
            severity: Severity::Medium,
            retryable: true,
            confidence: TABLE_CONFIDENCE,
            description: "command deadline expired before ack".to_string(),
            suggested_actions: actions_for(ErrorKind::Timeout),
        },
        CommandError::BannerReset => Classification {
            kind: ErrorKind::BannerReset,
            severity: Severity::High,
            retryable: false,
            confidence: TABLE_CONFIDENCE,
            description: "controller reset while command outstanding".to_string(),
            suggested_actions: actions_for(ErrorKind::BannerReset),
        },
        CommandError::Cancelled => Classification {
            kind: ErrorKind::Cancelled,
            severity: Severity::Low,
            retryable: false,
            confidence: TABLE_CONFIDENCE,
            description: "cancelled by submitter".to_string(),
            suggested_actions: Vec::new(),
        },
        CommandError::Link(link_error) => {
            let kind = match link_error {
                core_link::LinkError::PortUnavailable(_) => ErrorKind::PortUnavailable,
                core_link::LinkError::WriteFailure(_) => ErrorKind::WriteFailure,
                core_link::LinkError::ReadFailure(_) => ErrorKind::ReadFailure,
                core_link::LinkError::Closed => ErrorKind::ConnectionLost,
            };
            Classification {
                kind,
                severity: Severity::High,
                retryable: true,
                confidence: TABLE_CONFIDENCE,
                description: link_error.to_string(),
                suggested_actions: actions_for(ErrorKind::ConnectionLost),
            }
        }
        CommandError::QueueFull => Classification {
            kind: ErrorKind::BufferError,
            severity: Severity::Low,
            retryable: true,
            confidence: TABLE_CONFIDENCE,
            description: "host pending queue full".to_string(),
            suggested_actions: actions_for(ErrorKind::BufferError),
        },
        CommandError::Shutdown => Classification {
            kind: ErrorKind::Cancelled,
            severity: Severity::Low,
            retryable: false,
            confidence: TABLE_CONFIDENCE,
            description: "executor shut down".to_string(),
            suggested_actions: Vec::new(),
        },
    }
}

struct PatternRecord {
    count: u64,
    last_seen: Instant,
}

/// Classifier with the recurrence-learning pattern store. The store is the
/// only process-wide mutable state in the engine and it lives behind its own
/// guard inside this explicitly owned component.
pub struct ErrorClassifier {
    capacity: usize,
    patterns: Mutex<HashMap<(ErrorKind, String), PatternRecord>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ErrorClassifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Classify free text within a context, learning the pattern.
    pub fn classify(&self, text: &str, context: &str) -> Classification {
        let mut classification = classify_text(text);
        let boost = self.record(classification.kind, context);
        classification.confidence = (classification.confidence + boost).min(1.0);
        trace!(
            target: "recover.classify",
            kind = classification.kind.as_str(),
            confidence = classification.confidence,
            context,
            "classified"
        );
        classification
    }

    /// Classify an executor failure within a context, learning the pattern.
    pub fn classify_failure(&self, error: &CommandError, context: &str) -> Classification {
        let mut classification = classify_command_error(error);
        let boost = self.record(classification.kind, context);
        classification.confidence = (classification.confidence + boost).min(1.0);
        classification
    }

    /// Times the (kind, context) pair has been seen.
    pub fn occurrences(&self, kind: ErrorKind, context: &str) -> u64 {
        let patterns = self.patterns.lock().expect("pattern store poisoned");
        patterns
            .get(&(kind, context.to_string()))
            .map(|record| record.count)
            .unwrap_or(0)
    }

    fn record(&self, kind: ErrorKind, context: &str) -> f64 {
        let mut patterns = self.patterns.lock().expect("pattern store poisoned");
        let key = (kind, context.to_string());
        let now = Instant::now();
        let count = match patterns.get_mut(&key) {
            Some(record) => {
                record.count += 1;
                record.last_seen = now;
                record.count
            }
            None => {
                if patterns.len() >= self.capacity {
                    // Evict the least-frequent pattern, oldest on ties.
                    if let Some(evict) = patterns
                        .iter()
                        .min_by_key(|(_, r)| (r.count, std::cmp::Reverse(r.last_seen)))
                        .map(|(k, _)| k.clone())
                    {
                        debug!(target: "recover.classify", kind = evict.0.as_str(), "pattern_evicted");
                        patterns.remove(&evict);
                    }
                }
                patterns.insert(
                    key,
                    PatternRecord {
                        count: 1,
                        last_seen: now,
                    },
                );
                1
            }
        };
        ((count.saturating_sub(1)) as f64 * RECURRENCE_STEP).min(RECURRENCE_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_families() {
        assert_eq!(classify_error_code(2).kind, ErrorKind::SyntaxError);
        assert_eq!(classify_error_code(22).kind, ErrorKind::ParameterError);
        assert_eq!(classify_error_code(9).kind, ErrorKind::StateError);
        assert!(classify_error_code(9).retryable);
        assert_eq!(classify_error_code(11).kind, ErrorKind::BufferError);
        assert_eq!(classify_error_code(13).kind, ErrorKind::SafetyError);
        assert_eq!(classify_error_code(7).kind, ErrorKind::SystemError);
        assert!(!classify_error_code(20).retryable);
    }

    #[test]
    fn alarm_code_families() {
        assert_eq!(classify_alarm_code(1).kind, ErrorKind::HardLimit);
        assert_eq!(classify_alarm_code(1).severity, Severity::Critical);
        assert_eq!(classify_alarm_code(2).kind, ErrorKind::SoftLimit);
        assert_eq!(classify_alarm_code(3).kind, ErrorKind::AbortCycle);
        assert_eq!(classify_alarm_code(5).kind, ErrorKind::ProbeError);
        assert_eq!(classify_alarm_code(9).kind, ErrorKind::HomingError);
        assert!(!classify_alarm_code(2).retryable);
    }

    #[test]
    fn text_heuristics() {
        assert_eq!(classify_text("read timed out").kind, ErrorKind::Timeout);
        assert_eq!(
            classify_text("serial port disconnected").kind,
            ErrorKind::ConnectionLost
        );
        assert_eq!(classify_text("rx buffer overflow").kind, ErrorKind::BufferError);
        assert_eq!(classify_text("hard limit hit").kind, ErrorKind::HardLimit);
        assert_eq!(classify_text("soft limit exceeded").kind, ErrorKind::SoftLimit);
        assert_eq!(classify_text("machine busy").kind, ErrorKind::StateError);
        assert_eq!(classify_text("invalid statement").kind, ErrorKind::SyntaxError);
        let unknown = classify_text("gremlins in the gearbox");
        assert_eq!(unknown.kind, ErrorKind::UnknownResponse);
        assert!(unknown.confidence < HEURISTIC_CONFIDENCE);
    }

    #[test]
    fn recurrence_raises_confidence() {
        let classifier = ErrorClassifier::default();
        let first = classifier.classify("read timed out", "streaming");
        let mut last = first.clone();
        for _ in 0..5 {
            last = classifier.classify("read timed out", "streaming");
        }
        assert!(last.confidence > first.confidence);
        assert_eq!(classifier.occurrences(ErrorKind::Timeout, "streaming"), 6);
    }

    #[test]
    fn confidence_boost_is_capped() {
        let classifier = ErrorClassifier::default();
        let mut last = classifier.classify("timeout", "x");
        for _ in 0..100 {
            last = classifier.classify("timeout", "x");
        }
        assert!(last.confidence <= HEURISTIC_CONFIDENCE + RECURRENCE_CAP + 1e-9);
    }

    #[test]
    fn store_evicts_least_frequent_at_capacity() {
        let classifier = ErrorClassifier::new(2);
        // "streaming" seen three times, "jog" once, then a third context
        // forces an eviction of the least frequent.
        for _ in 0..3 {
            classifier.classify("timeout", "streaming");
        }
        classifier.classify("timeout", "jog");
        classifier.classify("timeout", "homing");
        assert_eq!(classifier.occurrences(ErrorKind::Timeout, "streaming"), 3);
        assert_eq!(classifier.occurrences(ErrorKind::Timeout, "jog"), 0);
        assert_eq!(classifier.occurrences(ErrorKind::Timeout, "homing"), 1);
    }

    #[test]
    fn command_error_classification() {
        let timeout = classify_command_error(&CommandError::Timeout);
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert!(timeout.retryable);

        let banner = classify_command_error(&CommandError::BannerReset);
        assert_eq!(banner.kind, ErrorKind::BannerReset);
        assert!(!banner.retryable);

        let link = classify_command_error(&CommandError::Link(core_link::LinkError::Closed));
        assert_eq!(link.kind, ErrorKind::ConnectionLost);
        assert!(link.retryable);
    }

    #[test]
    fn hard_limit_suggests_manual_steps() {
        let classification = classify_alarm_code(1);
        assert!(
            classification
                .suggested_actions
                .iter()
                .any(|action| action.contains("limit switches"))
        );
    }
}
