//! End-to-end ingestion from packet sources into a sample buffer.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use station_buffer::{Backing, BufferError, ReadMode, SampleBuffer};
use station_core::{BufferSettings, StationId, TimeStamp};
use station_input::{
    InputError, MemorySource, PacketDisposition, PacketFactory, PacketReader, PacketWriter,
    RspPacket, SourceSpec, StationStreams, StopSignal, Termination, UdpSource,
};
use tempfile::TempDir;

const CLOCK: u32 = 200_000_000;

fn station() -> StationId {
    StationId::new("CS003", "HBA_DUAL_INNER", CLOCK, 16).unwrap()
}

fn settings(boards: u32, samples: u64) -> BufferSettings {
    BufferSettings::new(station(), boards, 1.0)
        .unwrap()
        .with_beamlets(3)
        .unwrap()
        .with_samples(samples)
        .unwrap()
}

fn ts(count: i64) -> TimeStamp {
    TimeStamp::new(count, CLOCK)
}

fn factory(board: u8, start: i64, blocks: u8) -> PacketFactory {
    PacketFactory::new(&station(), board, ts(start))
        .unwrap()
        .with_beamlets(3)
        .unwrap()
        .with_blocks(blocks)
        .unwrap()
}

fn missing(buffer: &SampleBuffer, board: u32, start: i64, length: u64) -> String {
    buffer
        .read_window(board, ts(start), length, ReadMode::BestEffort)
        .unwrap()
        .missing()
        .to_string()
}

#[test]
fn test_gap_then_late_fill() {
    let buffer = Arc::new(SampleBuffer::create(settings(1, 1000), Backing::Heap).unwrap());
    let mut writer = PacketWriter::new(buffer.claim_writer(0).unwrap());
    let packets = factory(0, 0, 5);
    let mut write = |t: i64| {
        let bytes = packets.packet_at(ts(t));
        writer.write_packet(&RspPacket::parse(&bytes).unwrap()).unwrap()
    };

    assert_eq!(write(95), PacketDisposition::InOrder);
    assert_eq!(write(105), PacketDisposition::AfterGap { missing: 5 });
    assert_eq!(missing(&buffer, 0, 100, 5), "[0..5)");
    assert_eq!(missing(&buffer, 0, 105, 5), "");
    assert_eq!(missing(&buffer, 0, 95, 15), "[5..10)");

    let before = buffer.flags(0).unwrap();
    assert_eq!(write(100), PacketDisposition::Late);
    let after = buffer.flags(0).unwrap();
    assert_eq!(missing(&buffer, 0, 95, 15), "");
    assert_eq!(before.horizon(), after.horizon());
    assert_eq!(
        after.valid().count() - before.valid().count(),
        5,
        "late packet must only fill its own window"
    );

    let window = buffer
        .read_window(0, ts(100), 5, ReadMode::BestEffort)
        .unwrap();
    assert_eq!(
        window.samples(2).unwrap()[4],
        PacketFactory::sample_value(2, 104)
    );
}

#[test]
fn test_duplicates_and_too_old_leave_buffer_alone() {
    let buffer = Arc::new(SampleBuffer::create(settings(1, 64), Backing::Heap).unwrap());
    let mut writer = PacketWriter::new(buffer.claim_writer(0).unwrap());
    let packets = factory(0, 0, 16);
    let mut write = |t: i64| {
        let bytes = packets.packet_at(ts(t));
        writer.write_packet(&RspPacket::parse(&bytes).unwrap()).unwrap()
    };

    for t in [0, 16, 32, 48] {
        assert_eq!(write(t), PacketDisposition::InOrder);
    }
    let before = buffer.flags(0).unwrap();
    assert_eq!(write(32), PacketDisposition::Duplicate);
    assert_eq!(buffer.flags(0).unwrap(), before);

    assert_eq!(write(64), PacketDisposition::InOrder);
    // floor is now 80 - 64 = 16
    let before = buffer.flags(0).unwrap();
    assert_eq!(write(0), PacketDisposition::TooOld);
    assert_eq!(buffer.flags(0).unwrap(), before);
}

#[test]
fn test_streams_ingest_every_board() {
    let buffer = Arc::new(SampleBuffer::create(settings(2, 4096), Backing::Heap).unwrap());

    let mut board0 = factory(0, 10_000, 16);
    let mut board1 = factory(1, 10_000, 16);
    let source0 = MemorySource::new((0..8).map(|_| board0.next_packet()));
    let mut packets1: Vec<_> = (0..8).map(|_| board1.next_packet()).collect();
    // lose one packet and garble another
    packets1.remove(3);
    packets1[5].truncate(20);
    let source1 = MemorySource::new(packets1);

    let stop = StopSignal::new();
    let mut outcomes = StationStreams::new(Arc::clone(&buffer))
        .add_board(0, Box::new(source0))
        .add_board(1, Box::new(source1))
        .with_stats_interval(Duration::from_millis(1))
        .run(&stop)
        .unwrap();
    outcomes.sort_by_key(|outcome| outcome.board);

    assert!(stop.is_stopped());
    assert!(buffer.stop_requested());
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(matches!(outcome.termination, Termination::EndOfStream));
    }

    assert_eq!(outcomes[0].stats.written, 8);
    assert_eq!(outcomes[0].stats.gaps, 0);
    assert_eq!(outcomes[1].stats.written, 6);
    assert_eq!(outcomes[1].stats.malformed, 1);
    assert_eq!(outcomes[1].stats.gaps, 2);

    assert_eq!(missing(&buffer, 0, 10_000, 128), "");
    assert_eq!(missing(&buffer, 1, 10_000, 128), "[48..64) [96..112)");
}

#[test]
fn test_busy_board_fails_before_starting() {
    let buffer = Arc::new(SampleBuffer::create(settings(2, 256), Backing::Heap).unwrap());
    let _held = buffer.claim_writer(1).unwrap();

    let result = StationStreams::new(Arc::clone(&buffer))
        .add_board(0, Box::new(MemorySource::default()))
        .add_board(1, Box::new(MemorySource::default()))
        .run(&StopSignal::new());
    assert!(matches!(
        result,
        Err(InputError::Buffer(BufferError::WriterBusy { board: 1 }))
    ));
    assert!(!buffer.stop_requested());
}

#[test]
fn test_file_source_replays_recording() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("board0.raw");
    let mut packets = factory(0, 5_000, 16);
    {
        let mut file = std::fs::File::create(&path).unwrap();
        for _ in 0..4 {
            file.write_all(&packets.next_packet()).unwrap();
        }
    }

    let spec: SourceSpec = format!("file:{}", path.display()).parse().unwrap();
    let buffer = Arc::new(SampleBuffer::create(settings(1, 1024), Backing::Heap).unwrap());
    let mut writer = PacketWriter::new(buffer.claim_writer(0).unwrap());
    let mut reader = PacketReader::new(spec.open(Duration::from_millis(10)).unwrap(), station());

    let termination = writer.run(&mut reader, &StopSignal::new());
    assert!(matches!(termination, Termination::EndOfStream));
    assert_eq!(writer.stats().written, 4);
    assert_eq!(missing(&buffer, 0, 5_000, 64), "");
}

#[test]
fn test_stop_through_shared_memory() {
    let dir = TempDir::new().unwrap();
    let backing = Backing::Shared(dir.path().to_path_buf());
    let buffer = Arc::new(SampleBuffer::create(settings(1, 1024), backing).unwrap());
    let source = UdpSource::bind("127.0.0.1:0", Duration::from_millis(5)).unwrap();

    let stop = StopSignal::new();
    let runner = {
        let buffer = Arc::clone(&buffer);
        let stop = stop.clone();
        thread::spawn(move || {
            StationStreams::new(buffer)
                .add_board(0, Box::new(source))
                .run(&stop)
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!runner.is_finished());

    let started = Instant::now();
    let controller = SampleBuffer::attach(&station(), dir.path()).unwrap();
    controller.stop();

    let outcomes = runner.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(outcomes[0].termination, Termination::Stopped));
    assert!(stop.is_stopped());
}

#[test]
fn test_in_order_packet_inside_late_fill_at_range_cap() {
    let settings = settings(1, 1000).with_flag_ranges(1).unwrap();
    let buffer = Arc::new(SampleBuffer::create(settings, Backing::Heap).unwrap());
    let mut writer = PacketWriter::new(buffer.claim_writer(0).unwrap());
    let short = factory(0, 0, 5);
    let long = factory(0, 0, 32);
    let mut write = |packets: &PacketFactory, t: i64| {
        let bytes = packets.packet_at(ts(t));
        writer.write_packet(&RspPacket::parse(&bytes).unwrap()).unwrap()
    };

    assert_eq!(write(&short, 0), PacketDisposition::InOrder);
    assert_eq!(write(&long, 3), PacketDisposition::Late);
    // rewriting [5, 10) splits the single valid range
    assert_eq!(write(&short, 5), PacketDisposition::InOrder);
    assert_eq!(missing(&buffer, 0, 0, 35), "[0..5)");
}
