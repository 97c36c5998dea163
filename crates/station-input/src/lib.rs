//! RSP packet ingestion.
//!
//! Receives the packet streams of a station's boards, validates them and
//! writes their samples into a [`station_buffer::SampleBuffer`], tracking
//! gaps, late arrivals and duplicates along the way.
//!
//! ```text
//! PacketSource ──▶ PacketReader ──▶ PacketWriter ──▶ BoardWriter
//!  (udp/tcp/file)   (validate)       (classify)       (one per board)
//! ```
//!
//! [`StationStreams`] runs one such pipeline per board on its own thread and
//! stops them all together.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use station_buffer::{Backing, SampleBuffer};
//! use station_core::{BufferSettings, StationId};
//! use station_input::{SourceSpec, StationStreams, StopSignal};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let station = StationId::new("CS001", "HBA_DUAL", 200_000_000, 16)?;
//! let settings = BufferSettings::new(station, 1, 2.0)?;
//! let buffer = Arc::new(SampleBuffer::create(settings, Backing::Heap)?);
//!
//! let source = "udp:0.0.0.0:4346".parse::<SourceSpec>()?;
//! let stop = StopSignal::new();
//! let outcomes = StationStreams::new(buffer)
//!     .add_board(0, source.open(Duration::from_millis(100))?)
//!     .run(&stop)?;
//! for outcome in outcomes {
//!     println!("board {}: {:?}", outcome.board, outcome.termination);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod packet;
pub mod reader;
pub mod stop;
pub mod streams;
pub mod transport;
pub mod writer;

pub use config::{BoardSource, BufferConfig, InputConfig, StationConfig};
pub use error::{InputError, PacketError, TransportError};
pub use factory::PacketFactory;
pub use packet::{RspHeader, RspPacket, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, MIN_VERSION};
pub use reader::PacketReader;
pub use stop::StopSignal;
pub use streams::{BoardOutcome, StationStreams};
pub use transport::{MemorySource, PacketSource, SourceSpec, StreamSource, UdpSource};
pub use writer::{
    PacketDisposition, PacketStats, PacketWriter, StatisticsSink, Termination,
    DEFAULT_STATS_INTERVAL,
};
