//! Subcommand implementations.

use anyhow::{bail, Context, Result};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use station_buffer::{Backing, BlockReader, ReadError, SampleBuffer};
use station_core::{Ring, TimeStamp};
use station_input::{InputConfig, PacketFactory, StationStreams, StopSignal, Termination};

/// Parameters of the `read` subcommand.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub board: u32,
    pub rank: u32,
    pub ranks: u32,
    pub block_size: u64,
    pub blocks: u64,
    pub max_delay: Duration,
}

/// Fire `stop` on Ctrl+C.
fn stop_on_ctrl_c(stop: StopSignal) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                stop.stop();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}

fn shm_dir(config: &InputConfig) -> Result<std::path::PathBuf> {
    match config.backing() {
        Backing::Shared(dir) => Ok(dir),
        Backing::Heap => {
            bail!("buffer.shared_memory is off; no other process can reach the buffer")
        }
    }
}

pub async fn run(config: InputConfig) -> Result<()> {
    let settings = config.buffer_settings()?;
    let buffer = Arc::new(
        SampleBuffer::create(settings, config.backing())
            .context("Failed to create sample buffer")?,
    );

    let mut streams =
        StationStreams::new(Arc::clone(&buffer)).with_stats_interval(config.stats_interval);
    for (board, spec) in config.sources()? {
        let source = spec
            .open(config.read_timeout)
            .with_context(|| format!("Failed to open {spec} for board {board}"))?;
        streams = streams.add_board(board, source);
    }

    let stop = StopSignal::new();
    stop_on_ctrl_c(stop.clone());

    let outcomes = tokio::task::spawn_blocking(move || streams.run(&stop))
        .await
        .context("Ingestion supervisor panicked")??;

    let mut failed = 0;
    for outcome in &outcomes {
        let stats = &outcome.stats;
        match &outcome.termination {
            Termination::Failed(e) => {
                failed += 1;
                error!(board = outcome.board, error = %e, "Board failed");
            }
            termination => info!(
                board = outcome.board,
                ?termination,
                written = stats.written,
                gaps = stats.gaps,
                late = stats.late,
                malformed = stats.malformed,
                "Board finished"
            ),
        }
    }
    if failed > 0 {
        bail!("{failed} of {} boards failed", outcomes.len());
    }
    info!("Ingestion complete");
    Ok(())
}

pub fn stop(config: &InputConfig) -> Result<()> {
    let station = config.station_id()?;
    let dir = shm_dir(config)?;
    let buffer = SampleBuffer::attach(&station, &dir)
        .with_context(|| format!("No running buffer for {station} in {}", dir.display()))?;
    buffer.stop();
    info!(station = %station, "Stop requested");
    Ok(())
}

pub async fn read(config: InputConfig, request: ReadRequest) -> Result<()> {
    let station = config.station_id()?;
    let dir = shm_dir(&config)?;
    let buffer = Arc::new(
        SampleBuffer::attach(&station, &dir)
            .with_context(|| format!("No running buffer for {station} in {}", dir.display()))?,
    );

    let nr_beamlets = buffer.settings().nr_beamlets;
    let ring = Ring::new(0, nr_beamlets, request.rank, request.ranks)?;
    let beamlets = ring.list();
    info!(rank = request.rank, ranks = request.ranks, %ring, ?beamlets, "Selected beamlets");

    if request.block_size == 0 {
        bail!("--block-size must be positive");
    }
    // start at the next block boundary after now
    let block = i64::try_from(request.block_size).context("--block-size too large")?;
    let now = station.now().count();
    let start = TimeStamp::new((now / block + 1) * block, station.clock_hz);
    let mut reader = BlockReader::new(
        Arc::clone(&buffer),
        request.board,
        start,
        request.block_size,
        request.max_delay,
    )?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        for _ in 0..request.blocks {
            let window = match reader.read_block() {
                Ok(window) => window,
                Err(ReadError::EndOfStream) => {
                    info!("Buffer stopped");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let mut power = 0.0;
            let mut count = 0u64;
            for &beamlet in &beamlets {
                let Some(samples) = window.samples(beamlet) else {
                    continue;
                };
                for (offset, sample) in samples.iter().enumerate() {
                    if !window.missing().test(offset as u64) {
                        power += sample.power();
                        count += 1;
                    }
                }
            }
            let mean_power = if count > 0 { power / count as f64 } else { 0.0 };
            info!(
                board = request.board,
                start = %window.start(),
                flagged_pct = 100.0 * window.flagged_fraction(),
                mean_power,
                "Block"
            );
        }
        Ok(())
    })
    .await
    .context("Reader panicked")?
}

pub async fn generate(config: InputConfig, board: u8, target: String, seconds: f64) -> Result<()> {
    let station = config.station_id()?;
    let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind UDP socket")?;
    socket
        .connect(&target)
        .with_context(|| format!("Failed to connect to {target}"))?;

    let blocks = i64::from(station_core::BLOCKS_PER_PACKET);
    let now = station.now().count();
    let start = TimeStamp::new(now - now % blocks, station.clock_hz);
    let mut factory = PacketFactory::new(&station, board, start)?;
    let duration = Duration::try_from_secs_f64(seconds).context("Invalid --seconds")?;

    let stop = StopSignal::new();
    stop_on_ctrl_c(stop.clone());
    info!(board, target = %target, seconds, "Generating packets");

    tokio::task::spawn_blocking(move || -> Result<()> {
        let started = Instant::now();
        let mut sent = 0u64;
        while started.elapsed() < duration && !stop.is_stopped() {
            // send everything that would have left the station by now
            let now = station.now();
            while factory.next_time() + blocks <= now {
                socket.send(&factory.next_packet()).context("Failed to send packet")?;
                sent += 1;
            }
            stop.wait_timeout(Duration::from_millis(1));
        }
        info!(sent, "Generator finished");
        Ok(())
    })
    .await
    .context("Generator panicked")?
}

pub fn check(config: &InputConfig) -> Result<()> {
    let settings = config.buffer_settings()?;
    info!(
        station = %settings.station,
        boards = settings.nr_boards,
        beamlets = settings.nr_beamlets,
        samples = settings.nr_samples,
        seconds = settings.seconds(),
        "Configuration valid"
    );
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}
