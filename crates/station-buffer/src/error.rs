//! Error types for buffer access.

use station_core::{SettingsError, SparseSet, SparseSetError};
use thiserror::Error;

use crate::buffer::ReadWindow;

/// Result type alias for buffer operations.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors from creating, attaching to or writing into a [`SampleBuffer`](crate::SampleBuffer).
#[derive(Error, Debug)]
pub enum BufferError {
    /// Geometry rejected by validation
    #[error("Invalid buffer settings: {0}")]
    Settings(#[from] SettingsError),

    /// Board index out of range
    #[error("No board {board}: buffer has {nr_boards} boards")]
    NoSuchBoard { board: u32, nr_boards: u32 },

    /// Another [`BoardWriter`](crate::BoardWriter) already owns this board
    #[error("Board {board} already has a writer")]
    WriterBusy { board: u32 },

    /// Writers cannot be claimed on an attached (read-only) buffer
    #[error("Buffer is attached read-only")]
    ReadOnly,

    /// Zero-length window
    #[error("Window must hold at least one sample")]
    EmptyWindow,

    /// Window longer than the buffer
    #[error("Window of {length} samples exceeds buffer capacity of {capacity}")]
    WindowTooLarge { length: u64, capacity: u64 },

    /// Window starts below the oldest slot that can still hold valid data
    #[error("Window starting at {start} is older than the buffer floor {floor}")]
    TooOld { start: i64, floor: i64 },

    /// Commit of a window that was never handed out by `write_window`
    #[error("Window [{start}..{end}) was not reserved before commit")]
    NotReserved { start: i64, end: i64 },

    /// Beamlet index out of range
    #[error("Beamlet {beamlet} out of range: buffer stores {nr_beamlets}")]
    NoSuchBeamlet { beamlet: u32, nr_beamlets: u32 },

    /// Sample bytes do not match the window length
    #[error("Expected {expected} bytes for the window, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Shared segment header does not match the expected station or layout
    #[error("Incompatible shared segment: {0}")]
    Incompatible(String),

    /// Validity flags could not be stored
    #[error("Flag table error: {0}")]
    Flags(#[from] SparseSetError),

    /// Creating, opening or mapping the backing file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a read that did not produce a fully valid window.
#[derive(Error, Debug)]
pub enum ReadError {
    /// Part of the window is not valid. The window still carries the copied
    /// samples; [`ReadWindow::missing`] lists the flagged offsets.
    #[error("Window has gaps: {}", .0.missing())]
    Gap(Box<ReadWindow>),

    /// The buffer was stopped while the reader was waiting.
    #[error("End of stream")]
    EndOfStream,

    /// Bad board, zero length or a window larger than the buffer.
    #[error("Invalid read request: {0}")]
    InvalidRequest(String),
}

impl ReadError {
    /// Missing offsets (relative to the window start) for a [`ReadError::Gap`].
    pub fn missing(&self) -> Option<&SparseSet> {
        match self {
            Self::Gap(window) => Some(window.missing()),
            _ => None,
        }
    }

    /// Consume a [`ReadError::Gap`] into its partially valid window.
    pub fn into_window(self) -> Option<ReadWindow> {
        match self {
            Self::Gap(window) => Some(*window),
            _ => None,
        }
    }
}
