//! Validating packet reader.

use station_core::StationId;

use crate::error::{PacketError, TransportError};
use crate::packet::{RspHeader, RspPacket, MAX_PACKET_SIZE};
use crate::transport::PacketSource;

/// Pulls packets from a source and drops the ones that do not belong to the station.
///
/// Malformed packets are logged at `warn` and counted; packets the station
/// itself flagged as corrupt are counted only. Neither reaches the caller.
pub struct PacketReader {
    source: Box<dyn PacketSource>,
    station: StationId,
    buf: Vec<u8>,
    malformed: u64,
    payload_errors: u64,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("source", &self.source.describe())
            .field("station", &self.station.name)
            .field("malformed", &self.malformed)
            .field("payload_errors", &self.payload_errors)
            .finish()
    }
}

impl PacketReader {
    /// Read packets of `station` from `source`.
    pub fn new(source: Box<dyn PacketSource>, station: StationId) -> Self {
        Self {
            source,
            station,
            buf: vec![0u8; MAX_PACKET_SIZE],
            malformed: 0,
            payload_errors: 0,
        }
    }

    /// Next valid packet.
    ///
    /// Transport errors (including [`TransportError::Timeout`]) are passed on;
    /// bad packets are skipped.
    pub fn read(&mut self) -> Result<RspPacket<'_>, TransportError> {
        let (header, len) = loop {
            let len = self.source.next_packet(&mut self.buf)?;
            match check(&self.buf[..len], &self.station) {
                Ok(header) => break (header, len),
                Err(PacketError::PayloadError) => {
                    self.payload_errors += 1;
                    tracing::debug!(
                        source = %self.source.describe(),
                        "Skipped packet with payload error"
                    );
                }
                Err(error) => {
                    self.malformed += 1;
                    tracing::warn!(
                        source = %self.source.describe(),
                        len,
                        malformed = self.malformed,
                        %error,
                        "Dropped malformed packet"
                    );
                }
            }
        };
        Ok(RspPacket::from_parts(header, &self.buf[RspHeader::SIZE..len]))
    }

    /// Packets dropped as malformed.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Packets dropped because the station flagged a payload error.
    pub fn payload_errors(&self) -> u64 {
        self.payload_errors
    }

    /// Station packets are checked against.
    pub fn station(&self) -> &StationId {
        &self.station
    }

    /// Description of the underlying source.
    pub fn describe(&self) -> String {
        self.source.describe()
    }
}

fn check(bytes: &[u8], station: &StationId) -> Result<RspHeader, PacketError> {
    let packet = RspPacket::parse(bytes)?;
    packet.validate(station)?;
    Ok(packet.header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemorySource, StreamSource};
    use std::io::Cursor;
    use tracing_test::traced_test;

    const CLOCK: u32 = 200_000_000;

    fn station() -> StationId {
        StationId::new("CS002", "LBA_OUTER", CLOCK, 16).unwrap()
    }

    fn packet(board: u8, payload_error: bool, beamlets: u8) -> Vec<u8> {
        let header = RspHeader {
            version: 3,
            board,
            payload_error,
            clock_hz: CLOCK,
            bits_per_sample: 16,
            configuration: 0,
            station: 2,
            nr_beamlets: beamlets,
            nr_blocks: 16,
            timestamp: 1_600_000_000,
            block_sequence: 0,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.resize(RspHeader::SIZE + header.payload_size(), 0);
        bytes
    }

    #[test]
    #[traced_test]
    fn test_bad_packets_are_skipped_and_counted() {
        let mut truncated = packet(0, false, 4);
        truncated.truncate(100);
        let source = MemorySource::new([
            truncated,
            packet(0, true, 4),
            // more beamlets than a 16-bit board carries
            packet(0, false, 62),
            packet(1, false, 4),
        ]);
        let mut reader = PacketReader::new(Box::new(source), station());

        let good = reader.read().unwrap();
        assert_eq!(good.header.board, 1);
        assert_eq!(good.header.nr_beamlets, 4);
        assert!(matches!(reader.read(), Err(TransportError::EndOfStream)));

        assert_eq!(reader.malformed(), 2);
        assert_eq!(reader.payload_errors(), 1);
        assert!(logs_contain("Dropped malformed packet"));
    }

    #[test]
    fn test_oversized_stream_frame_is_dropped_not_fatal() {
        let mut oversized = packet(0, false, 61);
        oversized[7] = 255;
        oversized.resize(RspHeader::SIZE + 61 * 255 * 4, 0);
        let mut bytes = oversized;
        bytes.extend(packet(2, false, 4));
        let source = StreamSource::new(Cursor::new(bytes), "recording");
        let mut reader = PacketReader::new(Box::new(source), station());

        let good = reader.read().unwrap();
        assert_eq!(good.header.board, 2);
        assert_eq!(reader.malformed(), 1);
        assert!(matches!(reader.read(), Err(TransportError::EndOfStream)));
    }
}
