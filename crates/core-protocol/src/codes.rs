//! Static GRBL 1.1 error and alarm code tables.
//!
//! Codes outside the table are still accepted on the wire (the protocol is
//! extensible); they decode with a generic description and the classifier in
//! `core-recover` falls back to its heuristics for them.

/// Human-readable description for `error:N` codes.
pub fn error_description(code: u8) -> &'static str {
    match code {
        1 => "Expected command letter",
        2 => "Bad number format",
        3 => "Invalid statement",
        4 => "Negative value",
        5 => "Setting disabled",
        6 => "Step pulse too short",
        7 => "EEPROM read failed",
        8 => "Command only valid when idle",
        9 => "G-code locked out during alarm or jog",
        10 => "Soft limits require homing to be enabled",
        11 => "Line exceeds maximum length",
        12 => "Setting exceeds maximum step rate",
        13 => "Safety door detected and opened",
        14 => "Build info line exceeds EEPROM capacity",
        15 => "Jog target exceeds machine travel",
        16 => "Invalid jog command",
        17 => "Laser mode requires PWM output",
        20 => "Unsupported or invalid g-code command",
        21 => "More than one command from a modal group",
        22 => "Undefined feed rate",
        23 => "Command value is not an integer",
        24 => "Two commands both require the axis words",
        25 => "Repeated g-code word",
        26 => "Axis words missing",
        27 => "Invalid line number value",
        28 => "Command missing a required value word",
        29 => "Unsupported work coordinate system",
        30 => "G53 only allowed with G0 and G1 motion modes",
        31 => "Unused axis words in block",
        32 => "G2/G3 arcs require an in-plane axis word",
        33 => "Invalid motion target",
        34 => "Arc radius calculation failed",
        35 => "G2/G3 arcs require an offset word",
        36 => "Unused value words in block",
        37 => "G43.1 offset only assigned to configured tool axis",
        38 => "Tool number greater than supported value",
        _ => "Unknown error",
    }
}

/// Human-readable description for `ALARM:N` codes.
pub fn alarm_description(code: u8) -> &'static str {
    match code {
        1 => "Hard limit triggered; position likely lost",
        2 => "Motion target exceeds machine travel (soft limit)",
        3 => "Reset while in motion; position likely lost",
        4 => "Probe fail: probe not in expected initial state",
        5 => "Probe fail: probe did not contact the workpiece",
        6 => "Homing fail: reset during active homing cycle",
        7 => "Homing fail: safety door opened during homing",
        8 => "Homing fail: pull off did not clear the limit switch",
        9 => "Homing fail: could not find the limit switch",
        _ => "Unknown alarm",
    }
}
