//! Status frame parsing.
//!
//! A status frame is the `<...>` report the controller emits in answer to the
//! real-time `?` byte. Only the leading machine-state token is mandatory; the
//! remaining pipe-separated fields appear in any order and any subset.
//! Unknown fields are skipped so newer firmware reports keep parsing.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure modes when decoding the interior of a `<...>` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusParseError {
    #[error("empty status frame")]
    Empty,
    #[error("unknown machine state token: {0}")]
    UnknownState(String),
    #[error("malformed field: {0}")]
    MalformedField(String),
}

/// Machine state reported in the leading token of a status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
}

impl MachineState {
    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Hold" => Self::Hold,
            "Jog" => Self::Jog,
            "Alarm" => Self::Alarm,
            "Door" => Self::Door,
            "Check" => Self::Check,
            "Home" => Self::Home,
            "Sleep" => Self::Sleep,
            _ => None?,
        })
    }

    /// States in which the controller is actively executing or moving.
    /// Drives the poller's fast cadence tier.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Run | Self::Jog | Self::Home | Self::Hold)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Alarm => "Alarm",
            Self::Door => "Door",
            Self::Check => "Check",
            Self::Home => "Home",
            Self::Sleep => "Sleep",
        };
        f.write_str(s)
    }
}

/// Cartesian position in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Controller buffer utilization from a `Bf:planner,rx` field.
///
/// `rx_free` is the authoritative input for host-side flow control; the
/// planner count is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferFill {
    pub planner_free: u32,
    pub rx_free: u32,
}

bitflags! {
    /// Input pin states from a `Pn:` field. One letter per asserted pin.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PinFlags: u16 {
        const LIMIT_X     = 1 << 0;
        const LIMIT_Y     = 1 << 1;
        const LIMIT_Z     = 1 << 2;
        const PROBE       = 1 << 3;
        const DOOR        = 1 << 4;
        const HOLD        = 1 << 5;
        const SOFT_RESET  = 1 << 6;
        const CYCLE_START = 1 << 7;
        const COOLANT     = 1 << 8;
        const SPINDLE     = 1 << 9;
    }
}

impl PinFlags {
    fn from_wire(flags: &str) -> Result<Self, StatusParseError> {
        let mut pins = PinFlags::empty();
        for ch in flags.chars() {
            pins |= match ch {
                'X' => PinFlags::LIMIT_X,
                'Y' => PinFlags::LIMIT_Y,
                'Z' => PinFlags::LIMIT_Z,
                'P' => PinFlags::PROBE,
                'D' => PinFlags::DOOR,
                'H' => PinFlags::HOLD,
                'R' => PinFlags::SOFT_RESET,
                'S' => PinFlags::CYCLE_START,
                'C' => PinFlags::COOLANT,
                'L' => PinFlags::SPINDLE,
                other => {
                    return Err(StatusParseError::MalformedField(format!("Pn:{other}")));
                }
            };
        }
        Ok(pins)
    }

    /// True when any axis limit switch is asserted.
    pub fn any_limit(self) -> bool {
        self.intersects(PinFlags::LIMIT_X | PinFlags::LIMIT_Y | PinFlags::LIMIT_Z)
    }
}

/// Parsed form of one `<...>` report. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    pub state: MachineState,
    /// Numeric sub-state after `:` in the state token (e.g. `Hold:1`).
    pub sub_state: Option<u8>,
    pub mpos: Option<Position>,
    pub wpos: Option<Position>,
    pub wco: Option<Position>,
    pub feed: Option<f64>,
    pub spindle: Option<f64>,
    pub buffer: Option<BufferFill>,
    pub line_no: Option<u32>,
    pub pins: Option<PinFlags>,
}

impl StatusFrame {
    /// Work position, preferring the reported `WPos` and falling back to
    /// `MPos - WCO` when the controller only reports machine coordinates.
    pub fn work_position(&self) -> Option<Position> {
        if let Some(wpos) = self.wpos {
            return Some(wpos);
        }
        match (self.mpos, self.wco) {
            (Some(m), Some(o)) => Some(Position::new(m.x - o.x, m.y - o.y, m.z - o.z)),
            _ => None,
        }
    }
}

/// Parse the interior of a `<...>` frame (angle brackets already stripped).
pub fn parse_status_body(body: &str) -> Result<StatusFrame, StatusParseError> {
    let mut parts = body.split('|');
    let head = parts.next().filter(|s| !s.is_empty()).ok_or(StatusParseError::Empty)?;

    let (state_token, sub_state) = match head.split_once(':') {
        Some((state, sub)) => {
            let sub = sub
                .parse::<u8>()
                .map_err(|_| StatusParseError::MalformedField(format!("sub-state {sub}")))?;
            (state, Some(sub))
        }
        None => (head, None),
    };
    let state = MachineState::from_token(state_token)
        .ok_or_else(|| StatusParseError::UnknownState(state_token.to_string()))?;

    let mut frame = StatusFrame {
        state,
        sub_state,
        mpos: None,
        wpos: None,
        wco: None,
        feed: None,
        spindle: None,
        buffer: None,
        line_no: None,
        pins: None,
    };

    for field in parts {
        if let Some(v) = field.strip_prefix("MPos:") {
            frame.mpos = Some(parse_triplet(v)?);
        } else if let Some(v) = field.strip_prefix("WPos:") {
            frame.wpos = Some(parse_triplet(v)?);
        } else if let Some(v) = field.strip_prefix("WCO:") {
            frame.wco = Some(parse_triplet(v)?);
        } else if let Some(v) = field.strip_prefix("FS:") {
            let (feed, spindle) = v
                .split_once(',')
                .ok_or_else(|| StatusParseError::MalformedField(field.to_string()))?;
            frame.feed = Some(parse_f64(feed, field)?);
            frame.spindle = Some(parse_f64(spindle, field)?);
        } else if let Some(v) = field.strip_prefix("F:") {
            frame.feed = Some(parse_f64(v, field)?);
        } else if let Some(v) = field.strip_prefix("Bf:") {
            let (planner, rx) = v
                .split_once(',')
                .ok_or_else(|| StatusParseError::MalformedField(field.to_string()))?;
            frame.buffer = Some(BufferFill {
                planner_free: parse_u32(planner, field)?,
                rx_free: parse_u32(rx, field)?,
            });
        } else if let Some(v) = field.strip_prefix("Ln:") {
            frame.line_no = Some(parse_u32(v, field)?);
        } else if let Some(v) = field.strip_prefix("Pn:") {
            frame.pins = Some(PinFlags::from_wire(v)?);
        }
        // Unrecognized fields (e.g. Ov: overrides) are skipped.
    }

    Ok(frame)
}

fn parse_triplet(v: &str) -> Result<Position, StatusParseError> {
    let mut coords = v.split(',');
    let mut next = |axis: &str| -> Result<f64, StatusParseError> {
        coords
            .next()
            .and_then(|c| c.trim().parse::<f64>().ok())
            .ok_or_else(|| StatusParseError::MalformedField(format!("{axis} in {v}")))
    };
    Ok(Position::new(next("x")?, next("y")?, next("z")?))
}

fn parse_f64(v: &str, field: &str) -> Result<f64, StatusParseError> {
    v.trim()
        .parse::<f64>()
        .map_err(|_| StatusParseError::MalformedField(field.to_string()))
}

fn parse_u32(v: &str, field: &str) -> Result<u32, StatusParseError> {
    v.trim()
        .parse::<u32>()
        .map_err(|_| StatusParseError::MalformedField(field.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_frame() {
        let frame = parse_status_body("Idle").unwrap();
        assert_eq!(frame.state, MachineState::Idle);
        assert_eq!(frame.sub_state, None);
        assert!(frame.mpos.is_none());
        assert!(frame.buffer.is_none());
    }

    #[test]
    fn full_frame_with_all_fields() {
        let frame = parse_status_body(
            "Run|MPos:1.000,2.500,-0.250|WCO:0.000,0.000,5.000|FS:500.0,12000|Bf:14,120|Ln:42|Pn:XP",
        )
        .unwrap();
        assert_eq!(frame.state, MachineState::Run);
        assert_eq!(frame.mpos, Some(Position::new(1.0, 2.5, -0.25)));
        assert_eq!(frame.wco, Some(Position::new(0.0, 0.0, 5.0)));
        assert_eq!(frame.feed, Some(500.0));
        assert_eq!(frame.spindle, Some(12000.0));
        assert_eq!(
            frame.buffer,
            Some(BufferFill {
                planner_free: 14,
                rx_free: 120
            })
        );
        assert_eq!(frame.line_no, Some(42));
        let pins = frame.pins.unwrap();
        assert!(pins.contains(PinFlags::LIMIT_X));
        assert!(pins.contains(PinFlags::PROBE));
        assert!(pins.any_limit());
    }

    #[test]
    fn sub_state_is_extracted() {
        let frame = parse_status_body("Hold:1|MPos:0.000,0.000,0.000").unwrap();
        assert_eq!(frame.state, MachineState::Hold);
        assert_eq!(frame.sub_state, Some(1));
    }

    #[test]
    fn field_order_is_irrelevant() {
        let a = parse_status_body("Idle|MPos:1.0,2.0,3.0|Bf:15,128").unwrap();
        let b = parse_status_body("Idle|Bf:15,128|MPos:1.0,2.0,3.0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn work_position_derived_from_wco() {
        let frame = parse_status_body("Idle|MPos:10.0,20.0,5.0|WCO:10.0,10.0,0.0").unwrap();
        assert_eq!(frame.work_position(), Some(Position::new(0.0, 10.0, 5.0)));
    }

    #[test]
    fn explicit_wpos_wins_over_derivation() {
        let frame =
            parse_status_body("Idle|WPos:1.0,1.0,1.0|MPos:9.0,9.0,9.0|WCO:1.0,1.0,1.0").unwrap();
        assert_eq!(frame.work_position(), Some(Position::new(1.0, 1.0, 1.0)));
    }

    #[test]
    fn legacy_feed_only_field() {
        let frame = parse_status_body("Run|F:250.0").unwrap();
        assert_eq!(frame.feed, Some(250.0));
        assert_eq!(frame.spindle, None);
    }

    #[test]
    fn unknown_state_rejected() {
        assert!(matches!(
            parse_status_body("Bork|MPos:0,0,0"),
            Err(StatusParseError::UnknownState(_))
        ));
    }

    #[test]
    fn malformed_coordinate_rejected() {
        assert!(matches!(
            parse_status_body("Idle|MPos:1.0,abc,3.0"),
            Err(StatusParseError::MalformedField(_))
        ));
    }

    #[test]
    fn unknown_fields_skipped() {
        let frame = parse_status_body("Idle|Ov:100,100,100|A:SFM").unwrap();
        assert_eq!(frame.state, MachineState::Idle);
    }

    #[test]
    fn unknown_pin_letter_rejected() {
        assert!(matches!(
            parse_status_body("Idle|Pn:XQ"),
            Err(StatusParseError::MalformedField(_))
        ));
    }

    #[test]
    fn position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < f64::EPSILON);
    }
}
