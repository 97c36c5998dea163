//! Per-board packet writer.
//!
//! Sorts every packet against the board's expected next timestamp and the
//! buffer floor, then copies the ones worth keeping into the sample buffer.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use station_buffer::{BoardWriter, BufferError};
use station_core::TimeStamp;

use crate::error::{InputError, TransportError};
use crate::packet::RspPacket;
use crate::reader::PacketReader;
use crate::stop::StopSignal;

/// Default period between statistics reports.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Counters of one board's ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacketStats {
    /// Valid packets handed to the writer
    pub received: u64,
    /// Packets copied into the buffer
    pub written: u64,
    /// Forward jumps in the packet stream
    pub gaps: u64,
    /// Samples skipped by those jumps
    pub missing_samples: u64,
    /// Packets that filled an earlier hole
    pub late: u64,
    /// Packets whose samples were already valid
    pub duplicates: u64,
    /// Packets older than the buffer reaches back
    pub too_old: u64,
    /// Packets that failed validation or came from another board
    pub malformed: u64,
    /// Packets the station flagged as corrupt
    pub payload_errors: u64,
}

/// What happened to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    /// Arrived exactly when expected
    InOrder,
    /// Arrived after `missing` samples that never came
    AfterGap {
        /// Samples skipped
        missing: u64,
    },
    /// Filled part of an earlier hole
    Late,
    /// Every sample was already valid; discarded
    Duplicate,
    /// Below the buffer floor; discarded
    TooOld,
    /// Header names a different board; discarded
    ForeignBoard,
}

/// External telemetry receiver.
pub trait StatisticsSink: Send + Sync {
    /// Called with the running totals of `board` every statistics interval.
    fn report(&self, board: u32, stats: &PacketStats);
}

/// How a board's ingestion loop ended.
#[derive(Debug)]
pub enum Termination {
    /// The source closed
    EndOfStream,
    /// The stop signal fired or a stop was requested through the buffer
    Stopped,
    /// The source or the buffer failed
    Failed(InputError),
}

impl Termination {
    /// Whether the loop ended without an error.
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Writes one board's packets into the buffer.
pub struct PacketWriter {
    writer: BoardWriter,
    expected_next: Option<TimeStamp>,
    stats: PacketStats,
    foreign: u64,
    zeros: Vec<u8>,
    sink: Option<Arc<dyn StatisticsSink>>,
    stats_interval: Duration,
}

impl fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketWriter")
            .field("board", &self.writer.board())
            .field("expected_next", &self.expected_next.map(|t| t.count()))
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl PacketWriter {
    /// Write through `writer`.
    pub fn new(writer: BoardWriter) -> Self {
        Self {
            writer,
            expected_next: None,
            stats: PacketStats::default(),
            foreign: 0,
            zeros: Vec::new(),
            sink: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    /// Also report statistics to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn StatisticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Report statistics every `interval` while running.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Board written to.
    pub fn board(&self) -> u32 {
        self.writer.board()
    }

    /// Timestamp the next in-order packet should carry.
    pub fn expected_next(&self) -> Option<TimeStamp> {
        self.expected_next
    }

    /// Counters so far.
    pub fn stats(&self) -> PacketStats {
        self.stats
    }

    /// Classify `packet` and store it unless it is a duplicate, too old or foreign.
    ///
    /// Buffer beamlets the packet does not carry are zero-filled.
    pub fn write_packet(
        &mut self,
        packet: &RspPacket<'_>,
    ) -> Result<PacketDisposition, BufferError> {
        self.stats.received += 1;

        if u32::from(packet.header.board) != self.writer.board() {
            self.foreign += 1;
            self.stats.malformed += 1;
            tracing::warn!(
                board = self.writer.board(),
                packet_board = packet.header.board,
                "Dropped packet from another board"
            );
            return Ok(PacketDisposition::ForeignBoard);
        }

        let time = packet.time();
        let blocks = packet.nr_blocks();
        if self.writer.floor().is_some_and(|floor| time < floor) {
            self.stats.too_old += 1;
            tracing::debug!(board = self.writer.board(), time = time.count(), "Packet too old");
            return Ok(PacketDisposition::TooOld);
        }

        let disposition = match self.expected_next {
            None => PacketDisposition::InOrder,
            Some(expected) if time == expected => PacketDisposition::InOrder,
            Some(expected) if time > expected => PacketDisposition::AfterGap {
                missing: time.samples_since(expected) as u64,
            },
            Some(_) if self.writer.is_valid(time, blocks) => PacketDisposition::Duplicate,
            Some(_) => PacketDisposition::Late,
        };
        if disposition == PacketDisposition::Duplicate {
            self.stats.duplicates += 1;
            return Ok(disposition);
        }

        self.store(packet, time, blocks)?;
        self.stats.written += 1;

        let end = time + blocks as i64;
        match disposition {
            PacketDisposition::AfterGap { missing } => {
                self.stats.gaps += 1;
                self.stats.missing_samples += missing;
                tracing::debug!(
                    board = self.writer.board(),
                    time = time.count(),
                    missing,
                    "Gap in packet stream"
                );
                self.expected_next = Some(end);
            }
            PacketDisposition::Late => self.stats.late += 1,
            _ => self.expected_next = Some(end),
        }
        Ok(disposition)
    }

    fn store(
        &mut self,
        packet: &RspPacket<'_>,
        time: TimeStamp,
        blocks: u64,
    ) -> Result<(), BufferError> {
        let buffer = Arc::clone(self.writer.buffer());
        let nr_beamlets = buffer.settings().nr_beamlets;
        let beamlet_bytes = blocks as usize * buffer.format().sample_bytes();
        if self.zeros.len() < beamlet_bytes {
            self.zeros.resize(beamlet_bytes, 0);
        }

        let mut window = self.writer.write_window(time, blocks)?;
        for beamlet in 0..nr_beamlets {
            let bytes = packet
                .beamlet(beamlet)
                .unwrap_or(&self.zeros[..beamlet_bytes]);
            window.write_beamlet(beamlet, bytes)?;
        }
        window.commit()
    }

    /// Ingest from `reader` until the source ends, a stop is requested or something fails.
    ///
    /// Statistics are logged every stats interval and once more on exit.
    pub fn run(&mut self, reader: &mut PacketReader, stop: &StopSignal) -> Termination {
        let board = self.writer.board();
        tracing::info!(board, source = %reader.describe(), "Board ingestion started");

        let mut last_report = Instant::now();
        let termination = loop {
            if stop.is_stopped() || self.writer.buffer().stop_requested() {
                break Termination::Stopped;
            }

            match reader.read() {
                Ok(packet) => {
                    if let Err(e) = self.write_packet(&packet) {
                        break Termination::Failed(e.into());
                    }
                }
                Err(TransportError::Timeout) => {}
                Err(TransportError::EndOfStream) => break Termination::EndOfStream,
                Err(e) => break Termination::Failed(e.into()),
            }

            if last_report.elapsed() >= self.stats_interval {
                self.absorb_reader_counts(reader);
                self.log_statistics();
                last_report = Instant::now();
            }
        };

        self.absorb_reader_counts(reader);
        self.log_statistics();
        match &termination {
            Termination::Failed(error) => {
                tracing::error!(board, %error, "Board ingestion failed");
            }
            other => tracing::info!(board, termination = ?other, "Board ingestion ended"),
        }
        termination
    }

    fn absorb_reader_counts(&mut self, reader: &PacketReader) {
        self.stats.malformed = reader.malformed() + self.foreign;
        self.stats.payload_errors = reader.payload_errors();
    }

    /// Log the counters and hand them to the statistics sink.
    pub fn log_statistics(&self) {
        let board = self.writer.board();
        let s = &self.stats;
        tracing::info!(
            board,
            received = s.received,
            written = s.written,
            gaps = s.gaps,
            missing_samples = s.missing_samples,
            late = s.late,
            duplicates = s.duplicates,
            too_old = s.too_old,
            malformed = s.malformed,
            payload_errors = s.payload_errors,
            "Board statistics"
        );
        if let Some(sink) = &self.sink {
            sink.report(board, s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::PacketFactory;
    use parking_lot::Mutex;
    use station_buffer::{Backing, ReadMode, SampleBuffer};
    use station_core::{BufferSettings, StationId};

    const CLOCK: u32 = 160_000_000;

    fn setup(samples: u64) -> (Arc<SampleBuffer>, PacketWriter, PacketFactory) {
        let station = StationId::new("RS210", "HBA_ZERO", CLOCK, 8).unwrap();
        let settings = BufferSettings::new(station.clone(), 1, 1.0)
            .unwrap()
            .with_beamlets(4)
            .unwrap()
            .with_samples(samples)
            .unwrap();
        let buffer = Arc::new(SampleBuffer::create(settings, Backing::Heap).unwrap());
        let writer = PacketWriter::new(buffer.claim_writer(0).unwrap());
        let factory = PacketFactory::new(&station, 0, TimeStamp::new(1_000, CLOCK))
            .unwrap()
            .with_beamlets(2)
            .unwrap()
            .with_blocks(5)
            .unwrap();
        (buffer, writer, factory)
    }

    fn write_at(writer: &mut PacketWriter, factory: &PacketFactory, t: i64) -> PacketDisposition {
        let bytes = factory.packet_at(TimeStamp::new(t, CLOCK));
        let packet = RspPacket::parse(&bytes).unwrap();
        writer.write_packet(&packet).unwrap()
    }

    #[test]
    fn test_classification() {
        let (_buffer, mut writer, factory) = setup(100);
        assert_eq!(write_at(&mut writer, &factory, 1000), PacketDisposition::InOrder);
        assert_eq!(write_at(&mut writer, &factory, 1005), PacketDisposition::InOrder);
        assert_eq!(
            write_at(&mut writer, &factory, 1020),
            PacketDisposition::AfterGap { missing: 10 }
        );
        assert_eq!(write_at(&mut writer, &factory, 1010), PacketDisposition::Late);
        assert_eq!(write_at(&mut writer, &factory, 1010), PacketDisposition::Duplicate);
        assert_eq!(writer.expected_next(), Some(TimeStamp::new(1025, CLOCK)));

        // floor is 1125 - 100 = 1025 once the next packet lands
        assert!(matches!(
            write_at(&mut writer, &factory, 1120),
            PacketDisposition::AfterGap { missing: 95 }
        ));
        assert_eq!(write_at(&mut writer, &factory, 1015), PacketDisposition::TooOld);

        let stats = writer.stats();
        assert_eq!(stats.received, 7);
        assert_eq!(stats.written, 5);
        assert_eq!(stats.gaps, 2);
        assert_eq!(stats.missing_samples, 105);
        assert_eq!((stats.late, stats.duplicates, stats.too_old), (1, 1, 1));
    }

    #[test]
    fn test_unused_beamlets_are_zeroed() {
        let (buffer, mut writer, factory) = setup(100);
        write_at(&mut writer, &factory, 1000);

        let window = buffer
            .read_window(0, TimeStamp::new(1000, CLOCK), 5, ReadMode::BestEffort)
            .unwrap();
        assert!(window.is_complete());
        let samples = window.samples(1).unwrap();
        assert_eq!(samples[3], PacketFactory::sample_value(1, 1003));
        assert!(window.beamlet(3).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_foreign_board_counted() {
        let (_buffer, mut writer, _) = setup(100);
        let station = StationId::new("RS210", "HBA_ZERO", CLOCK, 8).unwrap();
        let other = PacketFactory::new(&station, 3, TimeStamp::new(0, CLOCK)).unwrap();
        let bytes = other.packet_at(TimeStamp::new(0, CLOCK));
        let packet = RspPacket::parse(&bytes).unwrap();
        assert_eq!(
            writer.write_packet(&packet).unwrap(),
            PacketDisposition::ForeignBoard
        );
        assert_eq!(writer.stats().malformed, 1);
        assert_eq!(writer.expected_next(), None);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u32, PacketStats)>>);

    impl StatisticsSink for Recorder {
        fn report(&self, board: u32, stats: &PacketStats) {
            self.0.lock().push((board, *stats));
        }
    }

    #[test]
    fn test_sink_receives_statistics() {
        let (_buffer, writer, factory) = setup(100);
        let recorder = Arc::new(Recorder::default());
        let mut writer = writer.with_sink(recorder.clone());
        write_at(&mut writer, &factory, 1000);
        writer.log_statistics();

        let reports = recorder.0.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, 0);
        assert_eq!(reports[0].1.written, 1);
        assert_eq!(
            serde_json::to_value(reports[0].1).unwrap()["received"],
            serde_json::json!(1)
        );
    }
}
