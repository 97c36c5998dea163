//! Time-indexed circular sample store for station input.
//!
//! A [`SampleBuffer`] keeps the last `N` samples of every board of one
//! station, together with exact flags of which samples are valid. One
//! [`BoardWriter`] per board fills it; any number of readers, in this process
//! or attached through shared memory, copy windows out of it.
//!
//! ```
//! use std::sync::Arc;
//! use station_buffer::{Backing, ReadMode, SampleBuffer};
//! use station_core::{BufferSettings, StationId, TimeStamp};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let station = StationId::new("CS001", "HBA_DUAL", 200_000_000, 16)?;
//! let settings = BufferSettings::new(station, 1, 1.0)?.with_samples(1024)?;
//! let buffer = Arc::new(SampleBuffer::create(settings, Backing::Heap)?);
//!
//! let start = TimeStamp::new(5_000, 200_000_000);
//! let mut writer = buffer.claim_writer(0)?;
//! let mut window = writer.write_window(start, 16)?;
//! window.write_beamlet(0, &[0u8; 16 * 8])?;
//! window.commit()?;
//!
//! let read = buffer.read_window(0, start, 32, ReadMode::BestEffort)?;
//! assert_eq!(read.missing().to_string(), "[16..32)");
//! # Ok(())
//! # }
//! ```

pub mod block_reader;
pub mod buffer;
pub mod error;
pub mod flags;
mod segment;

pub use block_reader::BlockReader;
pub use buffer::{Backing, BoardWriter, ReadMode, ReadWindow, SampleBuffer, WriteWindow};
pub use error::{BufferError, ReadError};
pub use flags::BoardFlags;
pub use segment::segment_path;
