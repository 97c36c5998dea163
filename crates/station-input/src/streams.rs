//! Station-wide ingestion: one thread per board plus a supervisor.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use station_buffer::SampleBuffer;

use crate::error::InputError;
use crate::reader::PacketReader;
use crate::stop::StopSignal;
use crate::transport::PacketSource;
use crate::writer::{
    PacketStats, PacketWriter, StatisticsSink, Termination, DEFAULT_STATS_INTERVAL,
};

/// How often the supervisor looks for a stop requested through shared memory.
const SUPERVISOR_POLL: Duration = Duration::from_millis(50);

/// Result of one board's ingestion.
#[derive(Debug)]
pub struct BoardOutcome {
    /// Board index
    pub board: u32,
    /// Final counters
    pub stats: PacketStats,
    /// Why the board stopped
    pub termination: Termination,
}

/// Feeds every board of a station into one [`SampleBuffer`].
pub struct StationStreams {
    buffer: Arc<SampleBuffer>,
    boards: Vec<(u32, Box<dyn PacketSource>)>,
    sink: Option<Arc<dyn StatisticsSink>>,
    stats_interval: Duration,
}

impl std::fmt::Debug for StationStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let boards: Vec<_> = self
            .boards
            .iter()
            .map(|(board, source)| format!("{board}: {}", source.describe()))
            .collect();
        f.debug_struct("StationStreams")
            .field("buffer", &self.buffer)
            .field("boards", &boards)
            .field("stats_interval", &self.stats_interval)
            .finish_non_exhaustive()
    }
}

impl StationStreams {
    /// Ingest into `buffer`; add sources with [`add_board`](Self::add_board).
    pub fn new(buffer: Arc<SampleBuffer>) -> Self {
        Self {
            buffer,
            boards: Vec::new(),
            sink: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    /// Read `board`'s packets from `source`.
    pub fn add_board(mut self, board: u32, source: Box<dyn PacketSource>) -> Self {
        self.boards.push((board, source));
        self
    }

    /// Report every board's statistics to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn StatisticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Period between statistics reports.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Run until `stop` fires, a stop is requested through the buffer, or
    /// every board's source has ended.
    ///
    /// On the way out the buffer is stopped, so readers blocked on it return
    /// [`ReadError::EndOfStream`](station_buffer::ReadError::EndOfStream).
    pub fn run(self, stop: &StopSignal) -> Result<Vec<BoardOutcome>, InputError> {
        let Self {
            buffer,
            boards,
            sink,
            stats_interval,
        } = self;

        // claim every board before starting anything, so a busy board fails cleanly
        let mut writers = Vec::with_capacity(boards.len());
        for (board, source) in boards {
            writers.push((buffer.claim_writer(board)?, source));
        }

        let station = buffer.settings().station.clone();
        let mut handles = Vec::with_capacity(writers.len());
        for (writer, source) in writers {
            let board = writer.board();
            let mut packet_writer = PacketWriter::new(writer).with_stats_interval(stats_interval);
            if let Some(sink) = &sink {
                packet_writer = packet_writer.with_sink(Arc::clone(sink));
            }
            let mut reader = PacketReader::new(source, station.clone());
            let board_stop = stop.clone();

            let spawned = thread::Builder::new()
                .name(format!("board-{board}"))
                .spawn(move || {
                    let termination = packet_writer.run(&mut reader, &board_stop);
                    BoardOutcome {
                        board,
                        stats: packet_writer.stats(),
                        termination,
                    }
                });
            match spawned {
                Ok(handle) => handles.push((board, handle)),
                Err(source) => {
                    tracing::error!(board, error = %source, "Failed to spawn board thread");
                    shutdown(&buffer, stop);
                    // the boards already running are joined and discarded
                    let _ = join_all(handles);
                    return Err(InputError::Spawn { board, source });
                }
            }
        }

        tracing::info!(station = %station, boards = handles.len(), "Station streams running");

        loop {
            if handles.iter().all(|(_, handle)| handle.is_finished()) {
                tracing::info!("All board streams finished");
                break;
            }
            if buffer.stop_requested() {
                tracing::info!("Stop requested through the sample buffer");
                break;
            }
            if stop.wait_timeout(SUPERVISOR_POLL) {
                tracing::info!("Stop signal received");
                break;
            }
        }

        shutdown(&buffer, stop);
        join_all(handles)
    }
}

fn shutdown(buffer: &SampleBuffer, stop: &StopSignal) {
    stop.stop();
    buffer.stop();
}

fn join_all(
    handles: Vec<(u32, JoinHandle<BoardOutcome>)>,
) -> Result<Vec<BoardOutcome>, InputError> {
    let mut outcomes = Vec::with_capacity(handles.len());
    let mut panicked = None;
    for (board, handle) in handles {
        match handle.join() {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => {
                tracing::error!(board, "Board thread panicked");
                panicked.get_or_insert(board);
            }
        }
    }
    match panicked {
        Some(board) => Err(InputError::Panicked { board }),
        None => Ok(outcomes),
    }
}
