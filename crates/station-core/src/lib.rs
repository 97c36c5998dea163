//! Core value types for station sample buffering.
//!
//! - [`TimeStamp`]: absolute sample index on a station's subband clock
//! - [`SparseSet`]: ranges of valid sample offsets
//! - [`StationId`] / [`BufferSettings`]: station identity and buffer geometry
//! - [`SampleFormat`]: 16/8/4-bit dual-polarisation sample codec
//! - [`Ring`]: round-robin work partitioning over ranks
//!
//! Everything here is plain data with no I/O; the buffer and the ingestion
//! pipeline live in `station-buffer` and `station-input`.

pub mod error;
pub mod ring;
pub mod sample;
pub mod settings;
pub mod sparse_set;
pub mod timestamp;

pub use error::{SettingsError, SparseSetError, TimeError};
pub use ring::Ring;
pub use sample::{DualPol, SampleFormat};
pub use settings::{BufferSettings, StationId, BLOCKS_PER_PACKET};
pub use sparse_set::{Range, SparseSet};
pub use timestamp::{TimeStamp, SUBBAND_FFT_SIZE};
