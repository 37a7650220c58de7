//! Real-time control bytes.
//!
//! A real-time byte is interpreted by the controller the instant it arrives,
//! outside the line-oriented command queue. The executor writes these through
//! a dedicated path that never touches the pending-ack FIFO; interleaving one
//! between two bytes of a normal command line is legal.

/// Status report query `?`. The reply arrives as an unsolicited `<...>` frame.
pub const STATUS_QUERY: u8 = 0x3F;

/// Feed hold `!`. Decelerates to a controlled stop and enters Hold.
pub const FEED_HOLD: u8 = 0x21;

/// Cycle start / resume `~`.
pub const CYCLE_START: u8 = 0x7E;

/// Soft reset (Ctrl-X). Halts and reinitializes without a power cycle; the
/// controller answers with its startup banner.
pub const SOFT_RESET: u8 = 0x18;

/// Cancel an in-progress jog without flushing the main planner.
pub const JOG_CANCEL: u8 = 0x85;

// Feed rate overrides. Coarse steps are 10%, fine steps 1%.
pub const FEED_OVR_RESET: u8 = 0x90;
pub const FEED_OVR_COARSE_PLUS: u8 = 0x91;
pub const FEED_OVR_COARSE_MINUS: u8 = 0x92;
pub const FEED_OVR_FINE_PLUS: u8 = 0x93;
pub const FEED_OVR_FINE_MINUS: u8 = 0x94;

// Rapid overrides select a fixed percentage of the rapid rate.
pub const RAPID_OVR_RESET: u8 = 0x95;
pub const RAPID_OVR_HALF: u8 = 0x96;
pub const RAPID_OVR_QUARTER: u8 = 0x97;

// Spindle speed overrides, same stepping as feed.
pub const SPINDLE_OVR_RESET: u8 = 0x99;
pub const SPINDLE_OVR_COARSE_PLUS: u8 = 0x9A;
pub const SPINDLE_OVR_COARSE_MINUS: u8 = 0x9B;
pub const SPINDLE_OVR_FINE_PLUS: u8 = 0x9C;
pub const SPINDLE_OVR_FINE_MINUS: u8 = 0x9D;

/// Stepwise override adjustment shared by feed and spindle overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideAdjust {
    /// Back to 100%.
    Reset,
    /// +10%.
    CoarsePlus,
    /// -10%.
    CoarseMinus,
    /// +1%.
    FinePlus,
    /// -1%.
    FineMinus,
}

impl OverrideAdjust {
    pub fn feed_byte(self) -> u8 {
        match self {
            OverrideAdjust::Reset => FEED_OVR_RESET,
            OverrideAdjust::CoarsePlus => FEED_OVR_COARSE_PLUS,
            OverrideAdjust::CoarseMinus => FEED_OVR_COARSE_MINUS,
            OverrideAdjust::FinePlus => FEED_OVR_FINE_PLUS,
            OverrideAdjust::FineMinus => FEED_OVR_FINE_MINUS,
        }
    }

    pub fn spindle_byte(self) -> u8 {
        match self {
            OverrideAdjust::Reset => SPINDLE_OVR_RESET,
            OverrideAdjust::CoarsePlus => SPINDLE_OVR_COARSE_PLUS,
            OverrideAdjust::CoarseMinus => SPINDLE_OVR_COARSE_MINUS,
            OverrideAdjust::FinePlus => SPINDLE_OVR_FINE_PLUS,
            OverrideAdjust::FineMinus => SPINDLE_OVR_FINE_MINUS,
        }
    }
}

/// Rapid-rate override presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RapidOverride {
    Full,
    Half,
    Quarter,
}

impl RapidOverride {
    pub fn byte(self) -> u8 {
        match self {
            RapidOverride::Full => RAPID_OVR_RESET,
            RapidOverride::Half => RAPID_OVR_HALF,
            RapidOverride::Quarter => RAPID_OVR_QUARTER,
        }
    }
}

/// True if `byte` is one of the recognized real-time control bytes.
///
/// Used by the executor to reject real-time bytes smuggled in as command
/// payload text, where they would corrupt ack correlation.
pub fn is_realtime_byte(byte: u8) -> bool {
    matches!(
        byte,
        STATUS_QUERY
            | FEED_HOLD
            | CYCLE_START
            | SOFT_RESET
            | JOG_CANCEL
            | FEED_OVR_RESET..=FEED_OVR_FINE_MINUS
            | RAPID_OVR_RESET..=RAPID_OVR_QUARTER
            | SPINDLE_OVR_RESET..=SPINDLE_OVR_FINE_MINUS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_control_bytes_match_wire_values() {
        assert_eq!(STATUS_QUERY, b'?');
        assert_eq!(FEED_HOLD, b'!');
        assert_eq!(CYCLE_START, b'~');
        assert_eq!(SOFT_RESET, 0x18);
    }

    #[test]
    fn realtime_predicate_covers_extended_range() {
        assert!(is_realtime_byte(JOG_CANCEL));
        assert!(is_realtime_byte(SPINDLE_OVR_FINE_MINUS));
        assert!(!is_realtime_byte(b'G'));
        assert!(!is_realtime_byte(0x98));
    }

    #[test]
    fn override_enums_map_to_distinct_bytes() {
        let feed: Vec<u8> = [
            OverrideAdjust::Reset,
            OverrideAdjust::CoarsePlus,
            OverrideAdjust::CoarseMinus,
            OverrideAdjust::FinePlus,
            OverrideAdjust::FineMinus,
        ]
        .iter()
        .map(|a| a.feed_byte())
        .collect();
        let mut unique = feed.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), feed.len());
        assert_ne!(
            OverrideAdjust::Reset.feed_byte(),
            OverrideAdjust::Reset.spindle_byte()
        );
        assert_eq!(RapidOverride::Half.byte(), RAPID_OVR_HALF);
    }
}
