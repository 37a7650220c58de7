//! System command strings and the jog command builder.
//!
//! `$` system commands are ordinary queued lines, unlike the real-time bytes
//! in [`crate::realtime`]: each one consumes a slot in the pending-ack FIFO.

/// Kill the alarm lock.
pub const UNLOCK: &str = "$X";
/// Run the homing cycle.
pub const HOME: &str = "$H";
/// Report the parser's modal state (`[GC:...]` feedback).
pub const PARSER_STATE: &str = "$G";
/// Dump all settings (`$n=v` echoes).
pub const VIEW_SETTINGS: &str = "$$";
/// Report coordinate-system offsets.
pub const VIEW_OFFSETS: &str = "$#";
/// Report build info.
pub const BUILD_INFO: &str = "$I";
/// Enter sleep mode.
pub const SLEEP: &str = "$SLP";
/// Toggle g-code check mode.
pub const CHECK_MODE: &str = "$C";

/// Build a `$J=` jog line. Axes are optional; at least one must be given or
/// the controller rejects the command. `incremental` selects G91 over G90,
/// and the jog always spells out metric units so a program's modal state
/// cannot change what the jog means.
pub fn build_jog_command(
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    feed: f64,
    incremental: bool,
) -> String {
    let mut command = String::from("$J=");
    command.push_str(if incremental { "G91" } else { "G90" });
    command.push_str("G21");
    for (axis, value) in [('X', x), ('Y', y), ('Z', z)] {
        if let Some(value) = value {
            command.push(axis);
            command.push_str(&trim_float(value));
        }
    }
    command.push('F');
    command.push_str(&trim_float(feed));
    command
}

/// `12.5` not `12.500`, `10` not `10.000`.
fn trim_float(value: f64) -> String {
    let formatted = format!("{value:.3}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}
