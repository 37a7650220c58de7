//! Program preprocessing and line feeds.
//!
//! Preprocessing is pure per line: strip `;` comments to end of line and
//! `(...)` inline comments, uppercase, drop all embedded whitespace, and keep
//! only lines that begin a G, M, T, or `$` command. Each kept line carries
//! metadata the engine and checkpointing use. A [`ProgramFeed`] hands lines
//! to the stream task either from a fully resident [`Program`] or, for files
//! past the resident-line cap, from disk-backed chunks refilled on demand.

use core_config::StreamingConfig;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info};

/// Per-line metadata attached during preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineMeta {
    pub is_movement: bool,
    pub has_tool_change: bool,
    pub has_coord_change: bool,
    /// Word count, saturating. A rough cost signal for progress heuristics.
    pub complexity: u8,
}

/// One sendable program line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramLine {
    /// 1-based line number in the original file.
    pub file_line_no: usize,
    pub payload: String,
    pub meta: LineMeta,
}

/// A fully preprocessed, immutable program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub path: Option<PathBuf>,
    pub lines: Vec<ProgramLine>,
}

impl Program {
    pub fn from_text(text: &str) -> Self {
        Self {
            path: None,
            lines: preprocess_text(text),
        }
    }

    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let lines = preprocess_text(&text);
        info!(
            target: "stream.program",
            path = %path.display(),
            sendable = lines.len(),
            "program_loaded"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            lines,
        })
    }

    pub fn total(&self) -> usize {
        self.lines.len()
    }
}

/// Preprocess a whole text into sendable lines.
pub fn preprocess_text(text: &str) -> Vec<ProgramLine> {
    text.lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            preprocess_line(raw).map(|(payload, meta)| ProgramLine {
                file_line_no: index + 1,
                payload,
                meta,
            })
        })
        .collect()
}

/// Preprocess one raw line. `None` means the line carries nothing to send.
pub fn preprocess_line(raw: &str) -> Option<(String, LineMeta)> {
    let uncommented = strip_comments(raw);
    let payload: String = uncommented
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if payload.is_empty() {
        return None;
    }
    if !matches!(payload.as_bytes()[0], b'G' | b'M' | b'T' | b'$') {
        return None;
    }
    let meta = line_meta(&payload);
    Some((payload, meta))
}

/// Remove `(...)` inline comments (unclosed runs to end of line) and `;` to
/// end of line. A line may carry both forms.
fn strip_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_parens = false;
    for ch in raw.chars() {
        match ch {
            '(' if !in_parens => in_parens = true,
            ')' if in_parens => in_parens = false,
            ';' if !in_parens => break,
            _ if in_parens => {}
            _ => out.push(ch),
        }
    }
    out
}

fn line_meta(payload: &str) -> LineMeta {
    let words = split_words(payload);
    let has = |needle: &str| words.iter().any(|w| w == needle);
    let is_movement = has("G0") || has("G00") || has("G1") || has("G01")
        || has("G2") || has("G02") || has("G3") || has("G03")
        || words.iter().any(|w| matches!(w.as_bytes().first(), Some(b'X' | b'Y' | b'Z')));
    let has_tool_change =
        has("M6") || has("M06") || words.iter().any(|w| w.starts_with('T') && w.len() > 1);
    let has_coord_change = words.iter().any(|w| {
        matches!(
            w.as_str(),
            "G54" | "G55" | "G56" | "G57" | "G58" | "G59" | "G59.1" | "G59.2" | "G59.3"
        ) || w.starts_with("G10")
            || w.starts_with("G92")
            || w == "G28"
            || w == "G30"
    });
    LineMeta {
        is_movement,
        has_tool_change,
        has_coord_change,
        complexity: words.len().min(u8::MAX as usize) as u8,
    }
}

fn split_words(payload: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for ch in payload.chars() {
        if ch.is_ascii_alphabetic() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Line source for the stream task: fully resident, or chunked off disk with
/// a bounded number of resident lines.
pub enum ProgramFeed {
    Resident {
        program: Program,
        cursor: usize,
    },
    Chunked(ChunkedFeed),
}

impl ProgramFeed {
    /// Open `path`, choosing resident or chunked mode by the configured
    /// resident-line cap. The total sendable count is known either way.
    pub async fn open(path: &Path, config: &StreamingConfig) -> std::io::Result<Self> {
        let total = count_sendable_lines(path).await?;
        if total <= config.max_resident_lines {
            let program = Program::from_file(path).await?;
            Ok(ProgramFeed::Resident { program, cursor: 0 })
        } else {
            info!(
                target: "stream.program",
                path = %path.display(),
                total,
                chunk_lines = config.chunk_lines,
                "chunked_mode_selected"
            );
            Ok(ProgramFeed::Chunked(
                ChunkedFeed::open(path, total, config).await?,
            ))
        }
    }

    pub fn from_program(program: Program) -> Self {
        ProgramFeed::Resident { program, cursor: 0 }
    }

    /// Total sendable lines in the program.
    pub fn total(&self) -> usize {
        match self {
            ProgramFeed::Resident { program, .. } => program.total(),
            ProgramFeed::Chunked(chunked) => chunked.total,
        }
    }

    /// Next sendable line, or `None` at end of program.
    pub async fn next_line(&mut self) -> std::io::Result<Option<ProgramLine>> {
        match self {
            ProgramFeed::Resident { program, cursor } => {
                let line = program.lines.get(*cursor).cloned();
                if line.is_some() {
                    *cursor += 1;
                }
                Ok(line)
            }
            ProgramFeed::Chunked(chunked) => chunked.next_line().await,
        }
    }

    /// Skip `n` sendable lines; used when resuming from a checkpoint.
    pub async fn skip(&mut self, n: usize) -> std::io::Result<()> {
        match self {
            ProgramFeed::Resident { program, cursor } => {
                *cursor = (*cursor + n).min(program.total());
                Ok(())
            }
            ProgramFeed::Chunked(chunked) => {
                for _ in 0..n {
                    if chunked.next_line().await?.is_none() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Count sendable lines without holding the file's lines in memory.
pub async fn count_sendable_lines(path: &Path) -> std::io::Result<usize> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    while let Some(raw) = lines.next_line().await? {
        if preprocess_line(&raw).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// Disk-backed feed holding at most one chunk of preprocessed lines.
pub struct ChunkedFeed {
    lines: Lines<BufReader<File>>,
    buffer: VecDeque<ProgramLine>,
    chunk_lines: usize,
    file_line_no: usize,
    total: usize,
}

impl ChunkedFeed {
    async fn open(path: &Path, total: usize, config: &StreamingConfig) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        // The chunk size is the memory manager's back-pressure lever: the
        // resident peak is one chunk plus the engine's look-ahead.
        let chunk_lines = config.chunk_lines.min(config.max_resident_lines).max(1);
        Ok(Self {
            lines: BufReader::new(file).lines(),
            buffer: VecDeque::new(),
            chunk_lines,
            file_line_no: 0,
            total,
        })
    }

    async fn next_line(&mut self) -> std::io::Result<Option<ProgramLine>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn refill(&mut self) -> std::io::Result<()> {
        while self.buffer.len() < self.chunk_lines {
            let Some(raw) = self.lines.next_line().await? else {
                break;
            };
            self.file_line_no += 1;
            if let Some((payload, meta)) = preprocess_line(&raw) {
                self.buffer.push_back(ProgramLine {
                    file_line_no: self.file_line_no,
                    payload,
                    meta,
                });
            }
        }
        if !self.buffer.is_empty() {
            debug!(
                target: "stream.program",
                resident = self.buffer.len(),
                "chunk_refilled"
            );
        }
        Ok(())
    }
}
