//! Circular sample store with per-board validity flags.
//!
//! Each board owns a ring of `N` time slots per beamlet. Absolute sample `t`
//! lives in slot `t % N`; whether that slot currently holds `t` is decided by
//! the board's [`BoardFlags`], never by the slot contents.
//!
//! # Threading
//!
//! - **Writes**: one [`BoardWriter`] per board, claimed through
//!   [`SampleBuffer::claim_writer`]. Writers never wait for readers.
//! - **Reads**: any number of threads. [`ReadMode::Strict`] blocks on a per-board
//!   condition variable until the window is valid, the deadline passes or the
//!   buffer stops.
//! - **Attached readers** (other processes) see the flags through the shared
//!   segment and poll instead of waiting on the condition variable.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use station_core::{BufferSettings, DualPol, SampleFormat, SparseSet, StationId, TimeStamp};

use crate::error::{BufferError, ReadError, Result};
use crate::flags::BoardFlags;
use crate::segment::Segment;

/// Poll interval of readers attached to another process's buffer.
const ATTACHED_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Where the sample memory lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Private anonymous memory; only this process can read it.
    Heap,
    /// A file in the given directory (typically `/dev/shm`) that other
    /// processes can [`attach`](SampleBuffer::attach) to.
    Shared(PathBuf),
}

/// How [`SampleBuffer::read_window`] treats samples that are not valid yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait until the whole window is valid.
    ///
    /// Gives up with [`ReadError::Gap`] when the wall clock passes `deadline`
    /// ([`TimeStamp::never`] waits forever) or when part of the window has
    /// already been evicted.
    Strict {
        /// Wall-clock time to stop waiting at
        deadline: TimeStamp,
    },
    /// Return immediately with whatever is there.
    BestEffort,
}

struct Board {
    flags: Mutex<BoardFlags>,
    committed: Condvar,
    claimed: AtomicBool,
}

/// Fixed-capacity, time-indexed sample store for one station.
pub struct SampleBuffer {
    settings: BufferSettings,
    format: SampleFormat,
    segment: Segment,
    /// Writer-side state; empty when attached
    boards: Vec<Board>,
    stopped: AtomicBool,
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("station", &self.settings.station.to_string())
            .field("nr_boards", &self.settings.nr_boards)
            .field("nr_beamlets", &self.settings.nr_beamlets)
            .field("nr_samples", &self.settings.nr_samples)
            .field("attached", &self.is_attached())
            .field("segment", &self.segment)
            .finish()
    }
}

impl SampleBuffer {
    /// Allocate a buffer for `settings`.
    ///
    /// With [`Backing::Shared`] the segment file is created (replacing a stale
    /// one) and removed again when the buffer is dropped.
    pub fn create(settings: BufferSettings, backing: Backing) -> Result<Self> {
        settings.validate()?;
        let format = SampleFormat::from_bits(settings.station.bits_per_sample)?;
        let segment = match &backing {
            Backing::Heap => Segment::anonymous(&settings)?,
            Backing::Shared(dir) => Segment::create(&settings, dir)?,
        };

        let boards = (0..settings.nr_boards)
            .map(|_| Board {
                flags: Mutex::new(BoardFlags::default()),
                committed: Condvar::new(),
                claimed: AtomicBool::new(false),
            })
            .collect();

        tracing::info!(
            station = %settings.station,
            boards = settings.nr_boards,
            beamlets = settings.nr_beamlets,
            samples = settings.nr_samples,
            seconds = settings.seconds(),
            path = ?segment.path(),
            "Created sample buffer"
        );

        Ok(Self {
            settings,
            format,
            segment,
            boards,
            stopped: AtomicBool::new(false),
        })
    }

    /// Attach read-only to the shared buffer another process created for `station`.
    pub fn attach(station: &StationId, dir: &Path) -> Result<Self> {
        let (segment, settings) = Segment::attach(station, dir)?;
        let format = SampleFormat::from_bits(settings.station.bits_per_sample)?;
        tracing::info!(
            station = %settings.station,
            boards = settings.nr_boards,
            samples = settings.nr_samples,
            path = ?segment.path(),
            "Attached to sample buffer"
        );
        Ok(Self {
            settings,
            format,
            segment,
            boards: Vec::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Buffer geometry.
    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    /// Capacity `N` in samples per board.
    pub fn nr_samples(&self) -> u64 {
        self.settings.nr_samples
    }

    /// Wire format of the stored samples.
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Whether this is a read-only view of another process's buffer.
    pub fn is_attached(&self) -> bool {
        self.boards.is_empty()
    }

    /// Shared segment file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.segment.path()
    }

    /// Current flags of `board`.
    pub fn flags(&self, board: u32) -> Result<BoardFlags> {
        let index = self.board_index(board)?;
        Ok(self.flags_of(index))
    }

    /// End of the newest committed window of `board`.
    pub fn horizon(&self, board: u32) -> Result<Option<TimeStamp>> {
        let clock = self.settings.station.clock_hz;
        Ok(self
            .flags(board)?
            .horizon()
            .map(|horizon| TimeStamp::new(horizon, clock)))
    }

    /// Take exclusive write access to `board`.
    pub fn claim_writer(self: &Arc<Self>, board: u32) -> Result<BoardWriter> {
        if self.is_attached() {
            return Err(BufferError::ReadOnly);
        }
        let index = self.board_index(board)?;
        if self.boards[index]
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BufferError::WriterBusy { board });
        }
        tracing::debug!(board, "Claimed board writer");
        Ok(BoardWriter {
            buffer: Arc::clone(self),
            board,
            index,
        })
    }

    /// Copy `[start, start + length)` of `board` out of the buffer.
    ///
    /// Missing offsets in the result are relative to `start`. Validity is
    /// checked after the copy, so samples overwritten meanwhile show up as
    /// missing rather than as stale data.
    pub fn read_window(
        &self,
        board: u32,
        start: TimeStamp,
        length: u64,
        mode: ReadMode,
    ) -> std::result::Result<ReadWindow, ReadError> {
        let index = self
            .board_index(board)
            .map_err(|e| ReadError::InvalidRequest(e.to_string()))?;
        if length == 0 || length > self.nr_samples() {
            return Err(ReadError::InvalidRequest(format!(
                "window of {length} samples, buffer holds {}",
                self.nr_samples()
            )));
        }

        let deadline = match mode {
            ReadMode::BestEffort => return Ok(self.copy_window(index, start, length)),
            ReadMode::Strict { deadline } => deadline,
        };

        let n = self.nr_samples();
        loop {
            let flags = self.flags_of(index);
            if flags.is_valid(start.count(), length, n) {
                let window = self.copy_window(index, start, length);
                if window.is_complete() {
                    return Ok(window);
                }
                // overwritten while copying; the next pass sees the eviction
                continue;
            }
            if flags.is_evicted(start.count(), n) {
                return Err(ReadError::Gap(Box::new(self.copy_window(index, start, length))));
            }
            if self.stop_requested() {
                return Err(ReadError::EndOfStream);
            }
            let timeout = time_left(deadline, self.settings.station.clock_hz);
            if timeout == Some(Duration::ZERO) {
                return Err(ReadError::Gap(Box::new(self.copy_window(index, start, length))));
            }
            self.wait_for_commit(index, flags.commits(), timeout);
        }
    }

    /// Mark the stream as ended and wake every waiting reader.
    ///
    /// Also raises the stop byte in the segment, so a controller process can
    /// stop the ingestion process by attaching and calling this.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.segment.request_stop();
        for board in &self.boards {
            let _guard = board.flags.lock();
            board.committed.notify_all();
        }
        tracing::info!(station = %self.settings.station, "Sample buffer stopped");
    }

    /// Whether [`stop`](Self::stop) was called here or by any attached process.
    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.segment.stop_requested()
    }

    fn board_index(&self, board: u32) -> Result<usize> {
        if board >= self.settings.nr_boards {
            return Err(BufferError::NoSuchBoard {
                board,
                nr_boards: self.settings.nr_boards,
            });
        }
        Ok(board as usize)
    }

    fn flags_of(&self, index: usize) -> BoardFlags {
        match self.boards.get(index) {
            Some(board) => board.flags.lock().clone(),
            None => self.segment.snapshot(index),
        }
    }

    fn copy_window(&self, index: usize, start: TimeStamp, length: u64) -> ReadWindow {
        let beamlet_bytes = length as usize * self.format.sample_bytes();
        let nr_beamlets = self.settings.nr_beamlets;
        let mut data = vec![0u8; beamlet_bytes * nr_beamlets as usize];
        for (beamlet, out) in data.chunks_exact_mut(beamlet_bytes).enumerate() {
            self.segment.copy_out(index, beamlet, start.count(), out);
        }

        let missing = self
            .flags_of(index)
            .missing(start.count(), length, self.nr_samples());
        ReadWindow {
            start,
            length,
            nr_beamlets,
            format: self.format,
            data,
            missing,
        }
    }

    fn wait_for_commit(&self, index: usize, seen: u64, timeout: Option<Duration>) {
        let Some(board) = self.boards.get(index) else {
            let nap = timeout.map_or(ATTACHED_POLL_INTERVAL, |t| t.min(ATTACHED_POLL_INTERVAL));
            std::thread::sleep(nap);
            return;
        };

        let mut flags = board.flags.lock();
        // a commit or stop between the caller's snapshot and this lock must not be missed
        if flags.commits() != seen || self.stopped.load(Ordering::Acquire) {
            return;
        }
        match timeout {
            Some(timeout) => {
                board.committed.wait_for(&mut flags, timeout);
            }
            None => board.committed.wait(&mut flags),
        }
    }
}

/// Wall-clock time until `deadline`; `None` for the never sentinel.
fn time_left(deadline: TimeStamp, clock_hz: u32) -> Option<Duration> {
    if deadline.is_never() {
        return None;
    }
    let samples = deadline - TimeStamp::now(clock_hz);
    if samples <= 0 {
        return Some(Duration::ZERO);
    }
    let seconds = samples as f64 / TimeStamp::new(0, clock_hz).samples_per_second();
    Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

/// Exclusive write access to one board.
///
/// Dropping the writer releases the claim.
pub struct BoardWriter {
    buffer: Arc<SampleBuffer>,
    board: u32,
    index: usize,
}

impl fmt::Debug for BoardWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardWriter")
            .field("board", &self.board)
            .finish_non_exhaustive()
    }
}

impl BoardWriter {
    /// Board this writer owns.
    pub fn board(&self) -> u32 {
        self.board
    }

    /// The buffer written to.
    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }

    /// Current flags of the board.
    pub fn flags(&self) -> BoardFlags {
        self.state().flags.lock().clone()
    }

    /// Oldest sample a new window may start at, once anything was written.
    pub fn floor(&self) -> Option<TimeStamp> {
        let clock = self.buffer.settings.station.clock_hz;
        self.flags()
            .floor(self.buffer.nr_samples())
            .map(|floor| TimeStamp::new(floor, clock))
    }

    /// Whether all of `[start, start + length)` is already valid.
    pub fn is_valid(&self, start: TimeStamp, length: u64) -> bool {
        self.state()
            .flags
            .lock()
            .is_valid(start.count(), length, self.buffer.nr_samples())
    }

    /// Reserve `[start, start + length)` for writing.
    ///
    /// The slots the window overwrites stop counting as valid before this
    /// returns. Fails with [`BufferError::TooOld`] when `start` is below the
    /// floor and [`BufferError::WindowTooLarge`] when `length > N`.
    pub fn write_window(&mut self, start: TimeStamp, length: u64) -> Result<WriteWindow<'_>> {
        let end = self.check_window(start, length)?;
        let n = self.buffer.nr_samples();
        let max_ranges = self.buffer.settings.nr_flag_ranges as usize;
        {
            let mut flags = self.state().flags.lock();
            let dropped = flags.reserve(start.count(), end, n, max_ranges)?;
            if dropped > 0 {
                tracing::debug!(
                    board = self.board,
                    dropped,
                    "Flag table full, unmarked oldest ranges"
                );
            }
            self.buffer.segment.publish(self.index, &flags)?;
        }
        tracing::trace!(board = self.board, start = start.count(), length, "Reserved window");
        Ok(WriteWindow {
            writer: self,
            start,
            length,
        })
    }

    /// Mark `[start, start + length)` valid, advance the horizon and wake readers.
    ///
    /// The window must have been reserved with [`write_window`](Self::write_window).
    pub fn commit(&mut self, start: TimeStamp, length: u64) -> Result<()> {
        let end = self.check_window(start, length)?;
        let board = self.state();
        let max_ranges = self.buffer.settings.nr_flag_ranges as usize;
        {
            let mut flags = board.flags.lock();
            let dropped = flags.commit(start.count(), end, self.buffer.nr_samples(), max_ranges)?;
            if dropped > 0 {
                tracing::debug!(
                    board = self.board,
                    dropped,
                    "Flag table full, unmarked oldest ranges"
                );
            }
            self.buffer.segment.publish(self.index, &flags)?;
        }
        board.committed.notify_all();
        tracing::trace!(board = self.board, start = start.count(), length, "Committed window");
        Ok(())
    }

    fn check_window(&self, start: TimeStamp, length: u64) -> Result<i64> {
        if length == 0 {
            return Err(BufferError::EmptyWindow);
        }
        let capacity = self.buffer.nr_samples();
        if length > capacity {
            return Err(BufferError::WindowTooLarge { length, capacity });
        }
        Ok(start.count().saturating_add(length as i64))
    }

    fn state(&self) -> &Board {
        &self.buffer.boards[self.index]
    }
}

impl Drop for BoardWriter {
    fn drop(&mut self) {
        self.state().claimed.store(false, Ordering::Release);
        tracing::debug!(board = self.board, "Released board writer");
    }
}

/// A reserved span of one board's ring, see [`BoardWriter::write_window`].
///
/// Dropping the window without [`commit`](Self::commit) leaves its samples invalid.
pub struct WriteWindow<'w> {
    writer: &'w mut BoardWriter,
    start: TimeStamp,
    length: u64,
}

impl fmt::Debug for WriteWindow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteWindow")
            .field("board", &self.writer.board)
            .field("start", &self.start.count())
            .field("length", &self.length)
            .finish()
    }
}

impl WriteWindow<'_> {
    /// First sample of the window.
    pub fn start(&self) -> TimeStamp {
        self.start
    }

    /// Number of samples.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Always false; windows hold at least one sample.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Store one beamlet's samples, `len() * sample_bytes` bytes in wire layout.
    pub fn write_beamlet(&mut self, beamlet: u32, bytes: &[u8]) -> Result<()> {
        let buffer = &self.writer.buffer;
        if beamlet >= buffer.settings.nr_beamlets {
            return Err(BufferError::NoSuchBeamlet {
                beamlet,
                nr_beamlets: buffer.settings.nr_beamlets,
            });
        }
        let expected = self.length as usize * buffer.format.sample_bytes();
        if bytes.len() != expected {
            return Err(BufferError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        buffer
            .segment
            .copy_in(self.writer.index, beamlet as usize, self.start.count(), bytes);
        Ok(())
    }

    /// Encode and store one beamlet's samples.
    pub fn write_samples(&mut self, beamlet: u32, samples: &[DualPol]) -> Result<()> {
        let bytes = self.writer.buffer.format.encode_all(samples);
        self.write_beamlet(beamlet, &bytes)
    }

    /// Publish the window, see [`BoardWriter::commit`].
    pub fn commit(self) -> Result<()> {
        let (start, length) = (self.start, self.length);
        self.writer.commit(start, length)
    }
}

/// Samples copied out of the buffer plus the offsets that were not valid.
#[derive(Clone)]
pub struct ReadWindow {
    start: TimeStamp,
    length: u64,
    nr_beamlets: u32,
    format: SampleFormat,
    data: Vec<u8>,
    missing: SparseSet,
}

impl fmt::Debug for ReadWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWindow")
            .field("start", &self.start.count())
            .field("length", &self.length)
            .field("nr_beamlets", &self.nr_beamlets)
            .field("missing", &self.missing.to_string())
            .finish()
    }
}

impl ReadWindow {
    /// First sample of the window.
    pub fn start(&self) -> TimeStamp {
        self.start
    }

    /// One past the last sample.
    pub fn end(&self) -> TimeStamp {
        self.start + self.length as i64
    }

    /// Number of samples per beamlet.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Always false; windows hold at least one sample.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of beamlets copied.
    pub fn nr_beamlets(&self) -> u32 {
        self.nr_beamlets
    }

    /// Offsets (relative to [`start`](Self::start)) that hold no valid data.
    pub fn missing(&self) -> &SparseSet {
        &self.missing
    }

    /// Whether every sample is valid.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Fraction of samples that are flagged.
    pub fn flagged_fraction(&self) -> f64 {
        self.missing.count() as f64 / self.length as f64
    }

    /// Raw wire-format bytes of one beamlet.
    pub fn beamlet(&self, beamlet: u32) -> Option<&[u8]> {
        if beamlet >= self.nr_beamlets {
            return None;
        }
        let size = self.length as usize * self.format.sample_bytes();
        let offset = beamlet as usize * size;
        self.data.get(offset..offset + size)
    }

    /// Decoded samples of one beamlet.
    pub fn samples(&self, beamlet: u32) -> Option<Vec<DualPol>> {
        self.beamlet(beamlet)
            .map(|bytes| self.format.decode_all(bytes))
    }
}
