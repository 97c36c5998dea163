//! RSP packet codec.
//!
//! Every packet is a 16-byte little-endian header followed by the samples of
//! `nr_beamlets` beamlets for `nr_blocks` consecutive time slots:
//!
//! ```text
//! byte  0      version (>= 3)
//! byte  1      bits 0-4 board, bit 6 payload error, bit 7 clock (1 = 200 MHz)
//! byte  2      bits 0-1 bit mode (0 = 16, 1 = 8, 2 = 4 bits)
//! byte  3      configuration (ignored)
//! bytes 4-5    station id
//! byte  6      number of beamlets
//! byte  7      number of blocks
//! bytes 8-11   timestamp (whole seconds)
//! bytes 12-15  block sequence number
//! payload      [beamlet][block][X re, X im, Y re, Y im]
//! ```

use station_core::{SampleFormat, StationId, TimeStamp};

use crate::error::PacketError;

/// Lowest header version understood.
pub const MIN_VERSION: u8 = 3;

/// Largest payload a station sends (61 beamlets x 16 blocks x 8 bytes).
pub const MAX_PAYLOAD_SIZE: usize = 7808;

/// Largest packet on the wire.
pub const MAX_PACKET_SIZE: usize = RspHeader::SIZE + MAX_PAYLOAD_SIZE;

const CLOCK_200_MHZ: u32 = 200_000_000;
const CLOCK_160_MHZ: u32 = 160_000_000;

const BOARD_MASK: u8 = 0x1f;
const PAYLOAD_ERROR_BIT: u8 = 1 << 6;
const CLOCK_BIT: u8 = 1 << 7;
const BIT_MODE_MASK: u8 = 0x03;

/// Decoded RSP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspHeader {
    /// Protocol version
    pub version: u8,
    /// Board (RSP) number within the station, 0-31
    pub board: u8,
    /// Station flagged the payload as corrupt
    pub payload_error: bool,
    /// Station clock in Hz
    pub clock_hz: u32,
    /// Sample width in bits
    pub bits_per_sample: u32,
    /// Configuration byte, passed through untouched
    pub configuration: u8,
    /// Numeric station id
    pub station: u16,
    /// Beamlets in the payload
    pub nr_beamlets: u8,
    /// Time slots in the payload
    pub nr_blocks: u8,
    /// Whole seconds since the epoch
    pub timestamp: u32,
    /// Block index within the second
    pub block_sequence: u32,
}

impl RspHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 16;

    /// Decode the first 16 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let Some(header) = bytes.get(..Self::SIZE) else {
            return Err(PacketError::TooShort { len: bytes.len() });
        };

        let bits_per_sample = match header[2] & BIT_MODE_MASK {
            0 => 16,
            1 => 8,
            2 => 4,
            other => return Err(PacketError::InvalidBitMode(other)),
        };
        let clock_hz = if header[1] & CLOCK_BIT != 0 {
            CLOCK_200_MHZ
        } else {
            CLOCK_160_MHZ
        };

        Ok(Self {
            version: header[0],
            board: header[1] & BOARD_MASK,
            payload_error: header[1] & PAYLOAD_ERROR_BIT != 0,
            clock_hz,
            bits_per_sample,
            configuration: header[3],
            station: u16::from_le_bytes([header[4], header[5]]),
            nr_beamlets: header[6],
            nr_blocks: header[7],
            timestamp: u32::from_le_bytes([header[8], header[9], header[10], header[11]]),
            block_sequence: u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
        })
    }

    /// Encode into wire format.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.version;
        out[1] = (self.board & BOARD_MASK)
            | if self.payload_error { PAYLOAD_ERROR_BIT } else { 0 }
            | if self.clock_hz == CLOCK_200_MHZ { CLOCK_BIT } else { 0 };
        out[2] = match self.bits_per_sample {
            8 => 1,
            4 => 2,
            _ => 0,
        };
        out[3] = self.configuration;
        out[4..6].copy_from_slice(&self.station.to_le_bytes());
        out[6] = self.nr_beamlets;
        out[7] = self.nr_blocks;
        out[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        out[12..16].copy_from_slice(&self.block_sequence.to_le_bytes());
        out
    }

    /// Bytes per dual-polarisation sample.
    pub fn sample_bytes(&self) -> usize {
        4 * self.bits_per_sample as usize / 8
    }

    /// Payload size the header implies.
    pub fn payload_size(&self) -> usize {
        usize::from(self.nr_beamlets) * usize::from(self.nr_blocks) * self.sample_bytes()
    }

    /// Absolute time of the first block.
    pub fn time(&self) -> TimeStamp {
        TimeStamp::from_rsp(self.timestamp, self.block_sequence, self.clock_hz)
    }
}

/// A header plus a borrowed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspPacket<'a> {
    /// Decoded header
    pub header: RspHeader,
    payload: &'a [u8],
}

impl<'a> RspPacket<'a> {
    /// Decode a complete packet; the payload must match the header exactly.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        let header = RspHeader::parse(bytes)?;
        let payload = &bytes[RspHeader::SIZE..];
        let expected = header.payload_size();
        if payload.len() != expected {
            return Err(PacketError::PayloadLength {
                expected,
                actual: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }

    /// Reassemble a packet whose header was already parsed from `payload`'s frame.
    pub(crate) fn from_parts(header: RspHeader, payload: &'a [u8]) -> Self {
        debug_assert_eq!(payload.len(), header.payload_size());
        Self { header, payload }
    }

    /// Check the packet against the station it should come from.
    pub fn validate(&self, station: &StationId) -> Result<(), PacketError> {
        let header = &self.header;
        if header.version < MIN_VERSION {
            return Err(PacketError::UnsupportedVersion(header.version));
        }
        if header.clock_hz != station.clock_hz {
            return Err(PacketError::ClockMismatch {
                expected: station.clock_hz,
                actual: header.clock_hz,
            });
        }
        if header.bits_per_sample != station.bits_per_sample {
            return Err(PacketError::BitModeMismatch {
                expected: station.bits_per_sample,
                actual: header.bits_per_sample,
            });
        }
        let max_beamlets = station.nr_beamlets_per_board();
        if header.nr_beamlets == 0
            || header.nr_blocks == 0
            || u32::from(header.nr_beamlets) > max_beamlets
        {
            return Err(PacketError::Geometry {
                beamlets: header.nr_beamlets,
                blocks: header.nr_blocks,
                max_beamlets,
            });
        }
        if header.payload_error {
            return Err(PacketError::PayloadError);
        }
        Ok(())
    }

    /// Raw payload.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Absolute time of the first block.
    pub fn time(&self) -> TimeStamp {
        self.header.time()
    }

    /// Number of time slots carried.
    pub fn nr_blocks(&self) -> u64 {
        u64::from(self.header.nr_blocks)
    }

    /// One beamlet's samples in wire layout, `None` past the last beamlet.
    pub fn beamlet(&self, beamlet: u32) -> Option<&'a [u8]> {
        let size = usize::from(self.header.nr_blocks) * self.header.sample_bytes();
        let offset = beamlet as usize * size;
        if beamlet >= u32::from(self.header.nr_beamlets) {
            return None;
        }
        self.payload.get(offset..offset + size)
    }

    /// Sample format of the payload.
    pub fn format(&self) -> Option<SampleFormat> {
        SampleFormat::from_bits(self.header.bits_per_sample).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RspHeader {
        RspHeader {
            version: 3,
            board: 5,
            payload_error: false,
            clock_hz: CLOCK_200_MHZ,
            bits_per_sample: 8,
            configuration: 0xaa,
            station: 0x0102,
            nr_beamlets: 2,
            nr_blocks: 3,
            timestamp: 1_700_000_000,
            block_sequence: 77,
        }
    }

    fn station(bits: u32) -> StationId {
        StationId::new("CS001", "HBA_DUAL", CLOCK_200_MHZ, bits).unwrap()
    }

    #[test]
    fn test_header_bytes_are_little_endian() {
        let bytes = header().to_bytes();
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], 0x85);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[3], 0xaa);
        assert_eq!(&bytes[4..6], &[0x02, 0x01]);
        assert_eq!(&bytes[8..12], &1_700_000_000u32.to_le_bytes());
        assert_eq!(bytes[12], 77);
        assert_eq!(RspHeader::parse(&bytes).unwrap(), header());
    }

    #[test]
    fn test_flags_in_source_info() {
        let mut bytes = header().to_bytes();
        bytes[1] = 0x40 | 31;
        bytes[2] = 2;
        let parsed = RspHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.board, 31);
        assert!(parsed.payload_error);
        assert_eq!(parsed.clock_hz, CLOCK_160_MHZ);
        assert_eq!(parsed.bits_per_sample, 4);

        bytes[2] = 3;
        assert_eq!(
            RspHeader::parse(&bytes).unwrap_err(),
            PacketError::InvalidBitMode(3)
        );
    }

    #[test]
    fn test_payload_layout_is_beamlet_major() {
        let mut bytes = header().to_bytes().to_vec();
        bytes.extend((0..24).map(|i| i as u8));
        let packet = RspPacket::parse(&bytes).unwrap();
        assert_eq!(packet.beamlet(0).unwrap(), &(0..12).collect::<Vec<u8>>()[..]);
        assert_eq!(packet.beamlet(1).unwrap(), &(12..24).collect::<Vec<u8>>()[..]);
        assert!(packet.beamlet(2).is_none());
        assert_eq!(packet.time(), TimeStamp::from_rsp(1_700_000_000, 77, CLOCK_200_MHZ));
    }

    #[test]
    fn test_malformed_packets_rejected() {
        let bytes = header().to_bytes();
        assert_eq!(
            RspPacket::parse(&bytes[..10]).unwrap_err(),
            PacketError::TooShort { len: 10 }
        );
        assert_eq!(
            RspPacket::parse(&bytes).unwrap_err(),
            PacketError::PayloadLength {
                expected: 24,
                actual: 0
            }
        );

        let mut full = bytes.to_vec();
        full.extend([0u8; 24]);
        let packet = RspPacket::parse(&full).unwrap();
        assert!(packet.validate(&station(8)).is_ok());
        assert!(matches!(
            packet.validate(&station(16)),
            Err(PacketError::BitModeMismatch { expected: 16, actual: 8 })
        ));

        let mut old = header();
        old.version = 2;
        let mut bytes = old.to_bytes().to_vec();
        bytes.extend([0u8; 24]);
        assert_eq!(
            RspPacket::parse(&bytes).unwrap().validate(&station(8)),
            Err(PacketError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_max_payload_fits_every_bit_mode() {
        for bits in [16, 8, 4] {
            let station = station(bits);
            let header = RspHeader {
                bits_per_sample: bits,
                nr_beamlets: station.nr_beamlets_per_board() as u8,
                nr_blocks: 16,
                ..header()
            };
            assert_eq!(header.payload_size(), MAX_PAYLOAD_SIZE);
        }
    }
}
