//! Inbound line classification.
//!
//! Every line delivered by the link classifies as exactly one [`ResponseKind`].
//! The function is total and pure: no input is an error at this layer, the
//! fallback is `Free` text. The router decides which kinds consume the
//! pending-ack queue; this module only names what arrived.

use crate::status::{StatusFrame, parse_status_body};

/// Closed union of everything a GRBL-class controller sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// `ok` acknowledgment. Terminates the oldest awaiting command.
    Ok,
    /// `error:N` rejection. Terminates the oldest awaiting command.
    Error(u8),
    /// `ALARM:N`. Routed to the recovery supervisor, never consumes the queue.
    Alarm(u8),
    /// `<...>` status report, already parsed.
    Status(StatusFrame),
    /// `$n=v` setting echo.
    Setting { number: u16, value: String },
    /// Startup banner (`Grbl 1.1h [...]`). Signals a controller reset.
    Banner(String),
    /// Bracketed feedback such as `[MSG:...]` or `[GC:...]`.
    Feedback(String),
    /// Anything unrecognized, surfaced verbatim.
    Free(String),
}

impl ResponseKind {
    /// True for the kinds that terminate the head of the pending FIFO.
    pub fn is_ack(&self) -> bool {
        matches!(self, ResponseKind::Ok | ResponseKind::Error(_))
    }
}

/// Classify one CR/LF-stripped line.
pub fn classify_line(line: &str) -> ResponseKind {
    let line = line.trim();

    if line == "ok" {
        return ResponseKind::Ok;
    }

    if let Some(code) = numeric_suffix(line, "error:") {
        return ResponseKind::Error(code);
    }

    if let Some(code) = numeric_suffix(line, "alarm:") {
        return ResponseKind::Alarm(code);
    }

    if let Some(body) = line.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        match parse_status_body(body) {
            Ok(frame) => return ResponseKind::Status(frame),
            // A malformed frame is surfaced as free text rather than dropped,
            // so a logging consumer can still see what the controller said.
            Err(_) => return ResponseKind::Free(line.to_string()),
        }
    }

    if let Some(rest) = line.strip_prefix('$')
        && let Some((number, value)) = rest.split_once('=')
        && let Ok(number) = number.parse::<u16>()
    {
        return ResponseKind::Setting {
            number,
            value: value.to_string(),
        };
    }

    if line.starts_with("Grbl ") || line.starts_with("GrblHAL ") {
        return ResponseKind::Banner(line.to_string());
    }

    if line.starts_with('[') && line.ends_with(']') {
        return ResponseKind::Feedback(line.to_string());
    }

    ResponseKind::Free(line.to_string())
}

/// Case-insensitive `prefix` followed by a decimal u8.
fn numeric_suffix(line: &str, prefix: &str) -> Option<u8> {
    let head = line.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    line[prefix.len()..].trim().parse::<u8>().ok()
}
