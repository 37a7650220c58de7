//! Wire-level protocol types for GRBL-class controllers.
//!
//! Everything in this crate is pure data and pure functions: classifying an
//! inbound line, parsing a status frame, and the static code tables. No I/O,
//! no state. The router in `core-command` and the poller in `core-status`
//! consume the classified values; they never re-parse raw text.

pub mod codes;
pub mod commands;
pub mod realtime;
pub mod response;
pub mod status;

pub use codes::{alarm_description, error_description};
pub use response::{ResponseKind, classify_line};
pub use status::{BufferFill, MachineState, PinFlags, Position, StatusFrame};
