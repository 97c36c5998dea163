#![allow(unsafe_code)]
//! Memory-mapped backing store for a [`SampleBuffer`](crate::SampleBuffer).
//!
//! The same layout is used for private (anonymous) and shared (file-backed)
//! buffers, so an attached process reads exactly what the owner writes.
//!
//! # Layout
//!
//! ```text
//! +-------------------+  0
//! | SegmentHeader     |  128 bytes: magic, geometry, station key, stop byte
//! +-------------------+  128
//! | flag table [0]    |  per board: epoch, commits, base, horizon, reserved,
//! | flag table [1]    |  then the marshalled range set (u64 words)
//! | ...               |
//! +-------------------+  aligned to 64
//! | samples [board][beamlet][slot][X re, X im, Y re, Y im]
//! +-------------------+
//! ```
//!
//! # Synchronization
//!
//! Flag tables are published with a seqlock: the owner bumps the epoch to an
//! odd value, stores the words and bumps it back to even. Readers retry until
//! they see the same even epoch before and after copying. Sample slots carry
//! no synchronization of their own; readers copy first and check validity
//! afterwards, so a slot rewritten during the copy is reported missing.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use station_core::{BufferSettings, SettingsError, SparseSet, StationId};

use crate::error::{BufferError, Result};
use crate::flags::BoardFlags;

/// Magic number for segment validation ("STNBUF" + layout version)
const MAGIC: u64 = 0x5354_4E42_5546_0001;

/// Size of the segment header in bytes (two cache lines)
const HEADER_SIZE: usize = 128;

/// Alignment of the sample region
const DATA_ALIGN: usize = 64;

/// Words in a flag table before the marshalled ranges
const FIXED_FLAG_WORDS: usize = 5;

const EPOCH: usize = 0;
const COMMITS: usize = 1;
const BASE: usize = 2;
const HORIZON: usize = 3;
const RESERVED: usize = 4;

/// Stored in place of an absent horizon or reservation
const UNSET: i64 = i64::MIN;

/// Give up on a seqlock read after this long (writer died mid-publish)
const MAX_SNAPSHOT_WAIT: Duration = Duration::from_millis(100);

/// Segment header.
///
/// Layout (128 bytes total):
/// - magic: u64 (8 bytes)
/// - nr_samples: u64 (8 bytes)
/// - clock_hz, bits_per_sample, nr_boards, nr_beamlets, nr_flag_ranges,
///   station_key: u32 each (24 bytes)
/// - stop: AtomicU8 (1 byte)
/// - _padding: [u8; 87]
#[repr(C)]
struct SegmentHeader {
    magic: u64,
    nr_samples: u64,
    clock_hz: u32,
    bits_per_sample: u32,
    nr_boards: u32,
    nr_beamlets: u32,
    nr_flag_ranges: u32,
    station_key: u32,
    /// Non-zero once any process asked the station to stop
    stop: AtomicU8,
    _padding: [u8; 87],
}

const _: () = assert!(
    std::mem::size_of::<SegmentHeader>() == HEADER_SIZE,
    "SegmentHeader size must equal HEADER_SIZE (128 bytes)"
);

/// File name of the shared segment for `station` inside a segment directory.
pub fn segment_path(dir: &Path, station: &StationId) -> PathBuf {
    dir.join(format!("station-buffer-{:08x}", station.shm_key()))
}

/// Byte offsets derived from the buffer geometry.
#[derive(Debug, Clone, Copy)]
struct Layout {
    nr_beamlets: usize,
    nr_samples: usize,
    bytes_per_sample: usize,
    flag_words: usize,
    data_offset: usize,
    total: usize,
}

impl Layout {
    fn new(settings: &BufferSettings) -> Result<Self> {
        let too_large = || {
            BufferError::Settings(SettingsError::Invalid(
                "buffer does not fit in the address space".into(),
            ))
        };
        let nr_boards = settings.nr_boards as usize;
        let nr_beamlets = settings.nr_beamlets as usize;
        let nr_samples = usize::try_from(settings.nr_samples).map_err(|_| too_large())?;
        let bytes_per_sample = settings.station.bytes_per_sample();
        let flag_words =
            FIXED_FLAG_WORDS + SparseSet::marshalled_words(settings.nr_flag_ranges as usize);

        let flags_end = nr_boards
            .checked_mul(flag_words * 8)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
            .ok_or_else(too_large)?;
        let data_offset = flags_end.div_ceil(DATA_ALIGN) * DATA_ALIGN;
        let total = nr_boards
            .checked_mul(nr_beamlets)
            .and_then(|n| n.checked_mul(nr_samples))
            .and_then(|n| n.checked_mul(bytes_per_sample))
            .and_then(|n| n.checked_add(data_offset))
            .ok_or_else(too_large)?;

        Ok(Self {
            nr_beamlets,
            nr_samples,
            bytes_per_sample,
            flag_words,
            data_offset,
            total,
        })
    }

    fn flags_offset(&self, board: usize) -> usize {
        HEADER_SIZE + board * self.flag_words * 8
    }

    fn slot_offset(&self, board: usize, beamlet: usize, slot: usize) -> usize {
        self.data_offset
            + ((board * self.nr_beamlets + beamlet) * self.nr_samples + slot)
                * self.bytes_per_sample
    }
}

/// Mapped buffer storage.
///
/// # Safety
/// Holds raw pointers into `mmap`; they stay valid for the lifetime of the
/// segment because the mapping is never resized or moved.
pub(crate) struct Segment {
    mmap: MmapMut,
    base: *mut u8,
    layout: Layout,
    /// Backing file, removed on drop when this process created it
    path: Option<PathBuf>,
    owner: bool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("bytes", &self.layout.total)
            .field("base", &format!("{:p}", self.base))
            .finish()
    }
}

// SAFETY: the segment owns its mapping and only hands out copies or atomics.
// Sample slots of a board are written only by that board's single claimed
// writer, and readers never trust sample bytes without re-checking the flags.
unsafe impl Send for Segment {}

// SAFETY: see above; all shared mutable metadata lives in atomics.
unsafe impl Sync for Segment {}

impl Segment {
    /// Map private anonymous memory for an in-process buffer.
    pub(crate) fn anonymous(settings: &BufferSettings) -> Result<Self> {
        let layout = Layout::new(settings)?;
        let mut mmap = MmapOptions::new().len(layout.total).map_anon()?;
        let base = mmap.as_mut_ptr();
        let segment = Self {
            mmap,
            base,
            layout,
            path: None,
            owner: true,
        };
        segment.initialize(settings);
        Ok(segment)
    }

    /// Create (or replace) the shared segment file for `settings.station` in `dir`.
    pub(crate) fn create(settings: &BufferSettings, dir: &Path) -> Result<Self> {
        let layout = Layout::new(settings)?;
        let path = segment_path(dir, &settings.station);

        std::fs::create_dir_all(dir)?;
        if path.exists() {
            tracing::warn!(path = %path.display(), "Replacing stale shared segment");
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(layout.total as u64)?;

        // SAFETY: we just created and sized the file; nobody else maps it until
        // the header carries the magic number.
        let mut mmap = unsafe { MmapOptions::new().len(layout.total).map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let segment = Self {
            mmap,
            base,
            layout,
            path: Some(path),
            owner: true,
        };
        segment.initialize(settings);
        Ok(segment)
    }

    /// Map the existing segment for `station` and rebuild its geometry.
    pub(crate) fn attach(station: &StationId, dir: &Path) -> Result<(Self, BufferSettings)> {
        let path = segment_path(dir, station);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(BufferError::Incompatible(format!(
                "{} is only {file_len} bytes",
                path.display()
            )));
        }

        // SAFETY: the file is at least HEADER_SIZE bytes; the header is
        // validated before any other region is touched.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        // SAFETY: mapping is at least HEADER_SIZE bytes and page aligned
        let header = unsafe { &*(base as *const SegmentHeader) };
        if header.magic != MAGIC {
            return Err(BufferError::Incompatible(format!(
                "bad magic number: expected 0x{MAGIC:016X}, got 0x{:016X}",
                header.magic
            )));
        }
        if header.station_key != station.shm_key()
            || header.clock_hz != station.clock_hz
            || header.bits_per_sample != station.bits_per_sample
        {
            return Err(BufferError::Incompatible(format!(
                "segment belongs to another station configuration (key {:08x})",
                header.station_key
            )));
        }

        let settings = BufferSettings {
            station: station.clone(),
            nr_beamlets: header.nr_beamlets,
            nr_boards: header.nr_boards,
            nr_samples: header.nr_samples,
            nr_flag_ranges: header.nr_flag_ranges,
        };
        settings.validate()?;
        let layout = Layout::new(&settings)?;
        if mmap.len() < layout.total {
            return Err(BufferError::Incompatible(format!(
                "segment holds {} bytes, geometry needs {}",
                mmap.len(),
                layout.total
            )));
        }

        Ok((
            Self {
                mmap,
                base,
                layout,
                path: Some(path),
                owner: false,
            },
            settings,
        ))
    }

    fn initialize(&self, settings: &BufferSettings) {
        debug_assert!(self.mmap.len() >= self.layout.data_offset);
        // SAFETY: the mapping is at least HEADER_SIZE bytes, page aligned and
        // not yet visible to readers (magic is written here).
        unsafe {
            std::ptr::write(
                self.base as *mut SegmentHeader,
                SegmentHeader {
                    magic: MAGIC,
                    nr_samples: settings.nr_samples,
                    clock_hz: settings.station.clock_hz,
                    bits_per_sample: settings.station.bits_per_sample,
                    nr_boards: settings.nr_boards,
                    nr_beamlets: settings.nr_beamlets,
                    nr_flag_ranges: settings.nr_flag_ranges,
                    station_key: settings.station.shm_key(),
                    stop: AtomicU8::new(0),
                    _padding: [0; 87],
                },
            );
        }
        for board in 0..settings.nr_boards as usize {
            let words = self.flag_words(board);
            for word in words {
                word.store(0, Ordering::Relaxed);
            }
            words[HORIZON].store(UNSET as u64, Ordering::Relaxed);
            words[RESERVED].store(UNSET as u64, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: header was written by initialize() or validated by attach()
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    fn flag_words(&self, board: usize) -> &[AtomicU64] {
        let offset = self.layout.flags_offset(board);
        debug_assert!(offset + self.layout.flag_words * 8 <= self.layout.data_offset);
        // SAFETY: the flag table lies inside the mapping, is 8-byte aligned
        // (HEADER_SIZE and every table size are multiples of 8) and is only
        // ever accessed atomically.
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(offset) as *const AtomicU64,
                self.layout.flag_words,
            )
        }
    }

    /// Backing file, if any.
    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Raise the cross-process stop byte.
    pub(crate) fn request_stop(&self) {
        self.header().stop.store(1, Ordering::Release);
    }

    /// Whether any process raised the stop byte.
    pub(crate) fn stop_requested(&self) -> bool {
        self.header().stop.load(Ordering::Acquire) != 0
    }

    /// Publish a board's flags for attached readers.
    pub(crate) fn publish(&self, board: usize, flags: &BoardFlags) -> Result<()> {
        let mut ranges = vec![0u64; self.layout.flag_words - FIXED_FLAG_WORDS];
        flags.valid.marshal(&mut ranges)?;

        let words = self.flag_words(board);
        // Odd epoch: publish in progress. AcqRel keeps the stores below from
        // floating above the increment.
        words[EPOCH].fetch_add(1, Ordering::AcqRel);
        words[COMMITS].store(flags.commits, Ordering::Relaxed);
        words[BASE].store(flags.base as u64, Ordering::Relaxed);
        words[HORIZON].store(flags.horizon.unwrap_or(UNSET) as u64, Ordering::Relaxed);
        words[RESERVED].store(flags.reserved.unwrap_or(UNSET) as u64, Ordering::Relaxed);
        let count = flags.valid.ranges().len();
        for (word, value) in words[FIXED_FLAG_WORDS..]
            .iter()
            .zip(&ranges)
            .take(SparseSet::marshalled_words(count))
        {
            word.store(*value, Ordering::Relaxed);
        }
        words[EPOCH].fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Consistent copy of a board's published flags.
    ///
    /// A writer that stays mid-publish for longer than [`MAX_SNAPSHOT_WAIT`]
    /// is presumed dead; the board then reads as holding no valid data.
    pub(crate) fn snapshot(&self, board: usize) -> BoardFlags {
        let words = self.flag_words(board);
        let start_time = Instant::now();
        let mut retry = 0u32;

        loop {
            if start_time.elapsed() > MAX_SNAPSHOT_WAIT {
                tracing::error!(
                    board,
                    "Flag snapshot timed out, publisher appears stuck mid-update"
                );
                return BoardFlags::default();
            }

            let epoch_before = words[EPOCH].load(Ordering::Acquire);
            if epoch_before % 2 != 0 {
                backoff(retry);
                retry += 1;
                continue;
            }

            let commits = words[COMMITS].load(Ordering::Relaxed);
            let base = words[BASE].load(Ordering::Relaxed) as i64;
            let horizon = words[HORIZON].load(Ordering::Relaxed) as i64;
            let reserved = words[RESERVED].load(Ordering::Relaxed) as i64;
            let count = words[FIXED_FLAG_WORDS].load(Ordering::Relaxed) as usize;
            let used = SparseSet::marshalled_words(count)
                .min(self.layout.flag_words - FIXED_FLAG_WORDS);
            let ranges: Vec<u64> = words[FIXED_FLAG_WORDS..FIXED_FLAG_WORDS + used]
                .iter()
                .map(|word| word.load(Ordering::Relaxed))
                .collect();

            fence(Ordering::Acquire);
            if words[EPOCH].load(Ordering::Relaxed) != epoch_before {
                backoff(retry);
                retry += 1;
                continue;
            }

            let valid = match SparseSet::unmarshal(&ranges) {
                Ok(valid) => valid,
                Err(e) => {
                    tracing::error!(board, error = %e, "Corrupt flag table in shared segment");
                    SparseSet::new()
                }
            };
            let optional = |value: i64| (value != UNSET).then_some(value);
            return BoardFlags {
                base,
                horizon: optional(horizon),
                reserved: optional(reserved),
                commits,
                valid,
            };
        }
    }

    /// Copy one beamlet's samples starting at absolute time `start` into the ring.
    pub(crate) fn copy_in(&self, board: usize, beamlet: usize, start: i64, bytes: &[u8]) {
        let (first, second) = self.spans(start, bytes.len());
        debug_assert!(first.1 + second <= self.layout.nr_samples);

        // SAFETY: both spans lie inside this beamlet's slot run (checked by
        // spans()), and only the board's claimed writer calls copy_in.
        unsafe {
            let dest = self.base.add(self.layout.slot_offset(board, beamlet, first.0));
            let split = first.1 * self.layout.bytes_per_sample;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, split);
            if second > 0 {
                let dest = self.base.add(self.layout.slot_offset(board, beamlet, 0));
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(split),
                    dest,
                    second * self.layout.bytes_per_sample,
                );
            }
        }
    }

    /// Copy one beamlet's samples starting at absolute time `start` out of the ring.
    pub(crate) fn copy_out(&self, board: usize, beamlet: usize, start: i64, out: &mut [u8]) {
        let (first, second) = self.spans(start, out.len());

        // SAFETY: both spans lie inside this beamlet's slot run (checked by
        // spans()); the destination is an exclusive slice of matching length.
        unsafe {
            let src = self.base.add(self.layout.slot_offset(board, beamlet, first.0));
            let split = first.1 * self.layout.bytes_per_sample;
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), split);
            if second > 0 {
                let src = self.base.add(self.layout.slot_offset(board, beamlet, 0));
                std::ptr::copy_nonoverlapping(
                    src,
                    out.as_mut_ptr().add(split),
                    second * self.layout.bytes_per_sample,
                );
            }
        }
    }

    /// Split `len_bytes` starting at `start` into `((slot, samples), wrapped samples)`.
    fn spans(&self, start: i64, len_bytes: usize) -> ((usize, usize), usize) {
        let n = self.layout.nr_samples;
        let samples = len_bytes / self.layout.bytes_per_sample;
        assert!(
            samples <= n && len_bytes % self.layout.bytes_per_sample == 0,
            "span of {len_bytes} bytes does not fit the ring"
        );
        let slot = start.rem_euclid(n as i64) as usize;
        let first = samples.min(n - slot);
        ((slot, first), samples - first)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed shared segment"),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove shared segment"
                ),
            }
        }
    }
}

fn backoff(retry: u32) {
    if retry < 10 {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}
