//! Buffer-aware g-code streaming.
//!
//! A program file is preprocessed once into sendable lines, then streamed in
//! bounded batches that respect the controller's reported receive-buffer room
//! minus a safety margin. The stream task supports graceful and feed-hold
//! pause, resume with cycle-start, stop with optional soft reset, durable
//! checkpoints at a line interval, and a disk-backed chunked mode that caps
//! resident lines for very large programs.

pub mod checkpoint;
pub mod engine;
pub mod program;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use engine::{
    StreamController, StreamDeps, StreamError, StreamPhase, StreamProgress, StreamStats,
    spawn_stream,
};
pub use program::{LineMeta, Program, ProgramFeed, ProgramLine, preprocess_line, preprocess_text};
