//! Error types for packet ingestion.

use station_buffer::BufferError;
use thiserror::Error;

/// A packet that cannot be ingested.
///
/// Never leaves the [`PacketReader`](crate::PacketReader): bad packets are
/// logged, counted and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than a header
    #[error("Packet of {len} bytes is shorter than the 16-byte header")]
    TooShort { len: usize },

    /// Header version below the supported minimum
    #[error("Unsupported RSP version {0}")]
    UnsupportedVersion(u8),

    /// Bit mode field holds a reserved value
    #[error("Invalid bit mode field {0}")]
    InvalidBitMode(u8),

    /// Header clock differs from the station clock
    #[error("Clock mismatch: station runs at {expected} Hz, packet says {actual} Hz")]
    ClockMismatch { expected: u32, actual: u32 },

    /// Header sample width differs from the station's
    #[error("Bit mode mismatch: station uses {expected} bits, packet has {actual}")]
    BitModeMismatch { expected: u32, actual: u32 },

    /// Zero beamlets or blocks, or more beamlets than a board carries
    #[error("Bad packet geometry: {beamlets} beamlets x {blocks} blocks (max {max_beamlets} beamlets)")]
    Geometry {
        beamlets: u8,
        blocks: u8,
        max_beamlets: u32,
    },

    /// Payload size does not match the header
    #[error("Payload is {actual} bytes, header implies {expected}")]
    PayloadLength { expected: usize, actual: usize },

    /// Station flagged its own payload as corrupt
    #[error("Payload error flag set by station")]
    PayloadError,
}

/// Failure of a packet source.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The source closed (socket shut down, end of file)
    #[error("End of stream")]
    EndOfStream,

    /// Nothing arrived within the read timeout
    #[error("Read timed out")]
    Timeout,

    /// Source description could not be parsed
    #[error("Invalid source '{0}': expected udp:<addr>, tcp:<addr> or file:<path>")]
    InvalidSource(String),

    /// Socket or file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of one board's ingestion task.
#[derive(Error, Debug)]
pub enum InputError {
    /// The packet source failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The buffer rejected a write
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// An ingestion thread could not be started
    #[error("Failed to spawn thread for board {board}: {source}")]
    Spawn {
        board: u32,
        #[source]
        source: std::io::Error,
    },

    /// An ingestion thread panicked
    #[error("Ingestion thread for board {board} panicked")]
    Panicked { board: u32 },
}
