//! Synthetic RSP packets for tests and the packet generator.

use station_core::{DualPol, SampleFormat, SettingsError, StationId, TimeStamp, BLOCKS_PER_PACKET};

use crate::packet::{RspHeader, MIN_VERSION};

/// Builds well-formed packets for one board with deterministic contents.
#[derive(Debug, Clone)]
pub struct PacketFactory {
    station: StationId,
    format: SampleFormat,
    board: u8,
    nr_beamlets: u8,
    nr_blocks: u8,
    next: TimeStamp,
}

impl PacketFactory {
    /// Full-size packets for `board`, the first one at `start`.
    pub fn new(station: &StationId, board: u8, start: TimeStamp) -> Result<Self, SettingsError> {
        station.validate()?;
        if board > 31 {
            return Err(SettingsError::Invalid(format!("board {board} does not fit 5 bits")));
        }
        let nr_beamlets = u8::try_from(station.nr_beamlets_per_board())
            .map_err(|_| SettingsError::Invalid("too many beamlets per board".into()))?;
        Ok(Self {
            station: station.clone(),
            format: SampleFormat::from_bits(station.bits_per_sample)?,
            board,
            nr_beamlets,
            nr_blocks: BLOCKS_PER_PACKET as u8,
            next: start,
        })
    }

    /// Carry `nr_beamlets` beamlets per packet.
    pub fn with_beamlets(mut self, nr_beamlets: u8) -> Result<Self, SettingsError> {
        if nr_beamlets == 0 || u32::from(nr_beamlets) > self.station.nr_beamlets_per_board() {
            return Err(SettingsError::Invalid(format!(
                "{nr_beamlets} beamlets per packet, board carries at most {}",
                self.station.nr_beamlets_per_board()
            )));
        }
        self.nr_beamlets = nr_beamlets;
        Ok(self)
    }

    /// Carry `nr_blocks` time slots per packet.
    pub fn with_blocks(mut self, nr_blocks: u8) -> Result<Self, SettingsError> {
        if nr_blocks == 0 {
            return Err(SettingsError::Invalid("packets need at least one block".into()));
        }
        self.nr_blocks = nr_blocks;
        Ok(self)
    }

    /// Time slots per packet.
    pub fn nr_blocks(&self) -> u8 {
        self.nr_blocks
    }

    /// Timestamp of the packet [`next_packet`](Self::next_packet) returns.
    pub fn next_time(&self) -> TimeStamp {
        self.next
    }

    /// Header of a packet starting at `time`.
    pub fn header_at(&self, time: TimeStamp) -> RspHeader {
        RspHeader {
            version: MIN_VERSION,
            board: self.board,
            payload_error: false,
            clock_hz: self.station.clock_hz,
            bits_per_sample: self.station.bits_per_sample,
            configuration: 0,
            station: 0,
            nr_beamlets: self.nr_beamlets,
            nr_blocks: self.nr_blocks,
            timestamp: time.rsp_seconds() as u32,
            block_sequence: time.rsp_block() as u32,
        }
    }

    /// Encoded packet starting at `time`.
    pub fn packet_at(&self, time: TimeStamp) -> Vec<u8> {
        let header = self.header_at(time);
        let sample_bytes = self.format.sample_bytes();
        let mut packet = Vec::with_capacity(RspHeader::SIZE + header.payload_size());
        packet.extend_from_slice(&header.to_bytes());

        let mut sample = vec![0u8; sample_bytes];
        for beamlet in 0..u32::from(self.nr_beamlets) {
            for block in 0..i64::from(self.nr_blocks) {
                let value = Self::sample_value(beamlet, time.count() + block);
                self.format.encode(&value, &mut sample);
                packet.extend_from_slice(&sample);
            }
        }
        packet
    }

    /// The next packet in sequence.
    pub fn next_packet(&mut self) -> Vec<u8> {
        let packet = self.packet_at(self.next);
        self.next += i64::from(self.nr_blocks);
        packet
    }

    /// Move the sequence to `time`.
    pub fn seek(&mut self, time: TimeStamp) {
        self.next = time;
    }

    /// Contents of `beamlet` at sample `time`; fits every bit mode exactly.
    pub fn sample_value(beamlet: u32, time: i64) -> DualPol {
        let phase = time.rem_euclid(15) as i16 - 7;
        let offset = (beamlet % 8) as i16 - 4;
        DualPol::new(phase, offset, -phase, 7 - (beamlet % 15) as i16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RspPacket;

    #[test]
    fn test_packets_decode_back() {
        for bits in [16, 8, 4] {
            let station = StationId::new("DE601", "LBA_INNER", 200_000_000, bits).unwrap();
            let start = TimeStamp::from_rsp(1_700_000_000, 5, 200_000_000);
            let mut factory = PacketFactory::new(&station, 7, start).unwrap();

            let bytes = factory.next_packet();
            let packet = RspPacket::parse(&bytes).unwrap();
            packet.validate(&station).unwrap();
            assert_eq!(packet.time(), start);
            assert_eq!(packet.header.board, 7);
            assert_eq!(u32::from(packet.header.nr_beamlets), station.nr_beamlets_per_board());

            let format = packet.format().unwrap();
            let samples = format.decode_all(packet.beamlet(60).unwrap());
            assert_eq!(samples[9], PacketFactory::sample_value(60, start.count() + 9));

            let next = RspPacket::parse(&factory.next_packet()).unwrap().time();
            assert_eq!(next, start + 16);
        }
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let station = StationId::new("CS001", "HBA_DUAL", 160_000_000, 16).unwrap();
        let start = TimeStamp::new(0, 160_000_000);
        assert!(PacketFactory::new(&station, 32, start).is_err());
        let factory = PacketFactory::new(&station, 0, start).unwrap();
        assert!(factory.clone().with_beamlets(62).is_err());
        assert!(factory.with_blocks(0).is_err());
    }
}
