//! Modal group tracking.
//!
//! Modal groups are the controller's sticky settings: they persist until a
//! later command overrides them. The mirror applies modal words from two
//! sources, acked command lines and `[GC:...]` parser-state feedback, and the
//! recovery supervisor replays them after an abort.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotionMode {
    #[default]
    Rapid,
    Linear,
    CwArc,
    CcwArc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Plane {
    #[default]
    Xy,
    Zx,
    Yz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Units {
    Inch,
    #[default]
    Mm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeedMode {
    InverseTime,
    #[default]
    UnitsPerMinute,
}

/// Full modal state with controller power-on defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModalState {
    pub motion: MotionMode,
    pub plane: Plane,
    pub units: Units,
    pub distance: DistanceMode,
    pub feed_mode: FeedMode,
    /// Work coordinate system index, 1 through 9 for G54 through G59.3.
    pub coord_system: CoordSystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordSystem(pub u8);

impl Default for CoordSystem {
    fn default() -> Self {
        CoordSystem(1)
    }
}

impl CoordSystem {
    /// G-word spelling: `G54` for index 1, through `G59` for index 6.
    /// Extended systems 7 through 9 spell `G59.1` through `G59.3`.
    pub fn gcode(self) -> String {
        match self.0 {
            1..=6 => format!("G{}", 53 + self.0),
            7..=9 => format!("G59.{}", self.0 - 6),
            other => format!("G54 (invalid index {other})"),
        }
    }
}

impl ModalState {
    /// Apply every modal word found in an acked command line. Non-modal words
    /// are ignored. Returns true when anything changed.
    pub fn apply_command(&mut self, payload: &str) -> bool {
        let mut changed = false;
        for word in gcode_words(payload) {
            changed |= self.apply_word(&word);
        }
        changed
    }

    /// Parse a `[GC:...]` parser-state report into a full modal state.
    pub fn from_parser_state(feedback: &str) -> Option<ModalState> {
        let inner = feedback.strip_prefix("[GC:")?.strip_suffix(']')?;
        let mut modal = ModalState::default();
        for word in inner.split_ascii_whitespace() {
            modal.apply_word(word);
        }
        Some(modal)
    }

    fn apply_word(&mut self, word: &str) -> bool {
        let before = *self;
        match word {
            "G0" | "G00" => self.motion = MotionMode::Rapid,
            "G1" | "G01" => self.motion = MotionMode::Linear,
            "G2" | "G02" => self.motion = MotionMode::CwArc,
            "G3" | "G03" => self.motion = MotionMode::CcwArc,
            "G17" => self.plane = Plane::Xy,
            "G18" => self.plane = Plane::Zx,
            "G19" => self.plane = Plane::Yz,
            "G20" => self.units = Units::Inch,
            "G21" => self.units = Units::Mm,
            "G90" => self.distance = DistanceMode::Absolute,
            "G91" => self.distance = DistanceMode::Incremental,
            "G93" => self.feed_mode = FeedMode::InverseTime,
            "G94" => self.feed_mode = FeedMode::UnitsPerMinute,
            "G54" => self.coord_system = CoordSystem(1),
            "G55" => self.coord_system = CoordSystem(2),
            "G56" => self.coord_system = CoordSystem(3),
            "G57" => self.coord_system = CoordSystem(4),
            "G58" => self.coord_system = CoordSystem(5),
            "G59" => self.coord_system = CoordSystem(6),
            "G59.1" => self.coord_system = CoordSystem(7),
            "G59.2" => self.coord_system = CoordSystem(8),
            "G59.3" => self.coord_system = CoordSystem(9),
            _ => {}
        }
        *self != before
    }

    /// Command lines that replay this state onto a freshly reset controller.
    pub fn restore_commands(&self) -> Vec<String> {
        let motion = match self.motion {
            MotionMode::Rapid => "G0",
            MotionMode::Linear => "G1",
            MotionMode::CwArc => "G2",
            MotionMode::CcwArc => "G3",
        };
        let plane = match self.plane {
            Plane::Xy => "G17",
            Plane::Zx => "G18",
            Plane::Yz => "G19",
        };
        let units = match self.units {
            Units::Inch => "G20",
            Units::Mm => "G21",
        };
        let distance = match self.distance {
            DistanceMode::Absolute => "G90",
            DistanceMode::Incremental => "G91",
        };
        let feed = match self.feed_mode {
            FeedMode::InverseTime => "G93",
            FeedMode::UnitsPerMinute => "G94",
        };
        vec![
            self.coord_system.gcode(),
            plane.to_string(),
            units.to_string(),
            distance.to_string(),
            feed.to_string(),
            motion.to_string(),
        ]
    }
}

/// Split a normalized (whitespace-free, uppercase) payload into G/M/T words.
/// `G91G1X5` yields `G91`, `G1`, `X5`.
fn gcode_words(payload: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for ch in payload.chars() {
        if ch.is_ascii_alphabetic() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(ch.to_ascii_uppercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_grbl_power_on_state() {
        let modal = ModalState::default();
        assert_eq!(modal.motion, MotionMode::Rapid);
        assert_eq!(modal.plane, Plane::Xy);
        assert_eq!(modal.units, Units::Mm);
        assert_eq!(modal.distance, DistanceMode::Absolute);
        assert_eq!(modal.coord_system.gcode(), "G54");
    }

    #[test]
    fn acked_command_updates_modal_groups() {
        let mut modal = ModalState::default();
        assert!(modal.apply_command("G91G1X5F100"));
        assert_eq!(modal.distance, DistanceMode::Incremental);
        assert_eq!(modal.motion, MotionMode::Linear);
        // Plane untouched.
        assert_eq!(modal.plane, Plane::Xy);
    }

    #[test]
    fn non_modal_command_changes_nothing() {
        let mut modal = ModalState::default();
        assert!(!modal.apply_command("X5Y10"));
        assert!(!modal.apply_command("$X"));
    }

    #[test]
    fn parser_state_report_round_trip() {
        let modal =
            ModalState::from_parser_state("[GC:G1 G55 G18 G20 G91 G93 M5 M9 T0 F500 S0]").unwrap();
        assert_eq!(modal.motion, MotionMode::Linear);
        assert_eq!(modal.coord_system, CoordSystem(2));
        assert_eq!(modal.plane, Plane::Zx);
        assert_eq!(modal.units, Units::Inch);
        assert_eq!(modal.distance, DistanceMode::Incremental);
        assert_eq!(modal.feed_mode, FeedMode::InverseTime);
    }

    #[test]
    fn restore_commands_replay_the_state() {
        let mut modal = ModalState::default();
        modal.apply_command("G18G20G91G55");
        let commands = modal.restore_commands();
        assert!(commands.contains(&"G55".to_string()));
        assert!(commands.contains(&"G18".to_string()));
        assert!(commands.contains(&"G20".to_string()));
        assert!(commands.contains(&"G91".to_string()));
    }

    #[test]
    fn extended_coord_systems_spell_with_suffix() {
        assert_eq!(CoordSystem(7).gcode(), "G59.1");
        assert_eq!(CoordSystem(9).gcode(), "G59.3");
    }

    #[test]
    fn word_splitting_handles_packed_payloads() {
        assert_eq!(gcode_words("G91G1X5"), vec!["G91", "G1", "X5"]);
        assert_eq!(gcode_words("M3S12000"), vec!["M3", "S12000"]);
    }
}
