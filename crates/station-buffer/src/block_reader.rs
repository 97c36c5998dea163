//! Sequential block consumption for downstream stages.

use std::sync::Arc;
use std::time::Duration;

use station_core::TimeStamp;

use crate::buffer::{ReadMode, ReadWindow, SampleBuffer};
use crate::error::ReadError;

/// Reads consecutive blocks of one board, each waiting until the block should
/// have fully arrived.
///
/// The deadline for block `[t, t + block_size)` is `t + block_size + max_delay`
/// on the wall clock. Late or lost samples come back flagged in
/// [`ReadWindow::missing`] instead of failing the read.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use station_buffer::{BlockReader, SampleBuffer};
/// use station_core::StationId;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let station = StationId::new("CS001", "HBA_DUAL", 200_000_000, 16)?;
/// let buffer = Arc::new(SampleBuffer::attach(&station, "/dev/shm".as_ref())?);
/// let mut reader = BlockReader::new(buffer, 0, station.now(), 3_072, Duration::from_millis(250))?;
/// let block = reader.read_block()?;
/// println!("{:.1}% flagged", 100.0 * block.flagged_fraction());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BlockReader {
    buffer: Arc<SampleBuffer>,
    board: u32,
    next: TimeStamp,
    block_size: u64,
    max_delay: i64,
}

impl BlockReader {
    /// Start reading `board` at `start` in blocks of `block_size` samples.
    pub fn new(
        buffer: Arc<SampleBuffer>,
        board: u32,
        start: TimeStamp,
        block_size: u64,
        max_delay: Duration,
    ) -> Result<Self, ReadError> {
        if block_size == 0 || block_size > buffer.nr_samples() {
            return Err(ReadError::InvalidRequest(format!(
                "block size {block_size} must be in 1..={}",
                buffer.nr_samples()
            )));
        }
        if board >= buffer.settings().nr_boards {
            return Err(ReadError::InvalidRequest(format!("no board {board}")));
        }
        let clock = buffer.settings().station.clock_hz;
        let max_delay = (max_delay.as_secs_f64() * TimeStamp::new(0, clock).samples_per_second())
            .ceil() as i64;
        Ok(Self {
            buffer,
            board,
            next: start,
            block_size,
            max_delay,
        })
    }

    /// Start of the block [`read_block`](Self::read_block) returns next.
    pub fn next_start(&self) -> TimeStamp {
        self.next
    }

    /// Samples per block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Skip ahead (or back) to `start`.
    pub fn seek(&mut self, start: TimeStamp) {
        self.next = start;
    }

    /// Read the next block.
    ///
    /// Fails only with [`ReadError::EndOfStream`] once the buffer stops; gaps
    /// are returned as flags on the window.
    pub fn read_block(&mut self) -> Result<ReadWindow, ReadError> {
        let start = self.next;
        let deadline = start + self.block_size as i64 + self.max_delay;
        let window = match self.buffer.read_window(
            self.board,
            start,
            self.block_size,
            ReadMode::Strict { deadline },
        ) {
            Ok(window) => window,
            Err(ReadError::Gap(window)) => {
                tracing::debug!(
                    board = self.board,
                    start = start.count(),
                    missing = %window.missing(),
                    "Block incomplete"
                );
                *window
            }
            Err(e) => return Err(e),
        };
        self.next = start + self.block_size as i64;
        Ok(window)
    }
}

impl Iterator for BlockReader {
    type Item = ReadWindow;

    /// Ends at end of stream.
    fn next(&mut self) -> Option<ReadWindow> {
        self.read_block().ok()
    }
}
