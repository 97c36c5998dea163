//! Station identity and the buffer geometry derived from it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::SettingsError;
use crate::timestamp::{TimeStamp, SUBBAND_FFT_SIZE};

/// Beamlets a board carries at 16-bit samples.
pub const BEAMLETS_PER_BOARD_16BIT: u32 = 61;

/// Time slots in a full-size RSP packet.
pub const BLOCKS_PER_PACKET: u32 = 16;

/// Station clock rates the hardware supports.
pub const SUPPORTED_CLOCKS_HZ: [u32; 2] = [160_000_000, 200_000_000];

/// Sample widths the hardware supports.
pub const SUPPORTED_BIT_MODES: [u32; 3] = [16, 8, 4];

/// Identity of one station's input stream.
///
/// Two processes looking at the same station must agree on every field; the
/// shared-memory key is derived from all of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StationId {
    /// Station name, e.g. `CS001`
    pub name: String,
    /// Antenna field configuration, e.g. `HBA_DUAL`
    pub antenna_set: String,
    /// Station clock in Hz (160 or 200 MHz)
    pub clock_hz: u32,
    /// Sample width in bits (4, 8 or 16)
    pub bits_per_sample: u32,
}

impl StationId {
    /// Build and validate a station identity.
    pub fn new(
        name: impl Into<String>,
        antenna_set: impl Into<String>,
        clock_hz: u32,
        bits_per_sample: u32,
    ) -> Result<Self, SettingsError> {
        let id = Self {
            name: name.into(),
            antenna_set: antenna_set.into(),
            clock_hz,
            bits_per_sample,
        };
        id.validate()?;
        Ok(id)
    }

    /// Check clock and bit mode.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !SUPPORTED_CLOCKS_HZ.contains(&self.clock_hz) {
            return Err(SettingsError::UnsupportedClock(self.clock_hz));
        }
        if !SUPPORTED_BIT_MODES.contains(&self.bits_per_sample) {
            return Err(SettingsError::UnsupportedBitMode(self.bits_per_sample));
        }
        if self.name.is_empty() {
            return Err(SettingsError::Invalid("station name is empty".into()));
        }
        Ok(())
    }

    /// Beamlets one board delivers; fewer bits per sample fit more beamlets
    /// in the same payload.
    pub fn nr_beamlets_per_board(&self) -> u32 {
        BEAMLETS_PER_BOARD_16BIT * 16 / self.bits_per_sample.max(1)
    }

    /// Bytes for one time slot of one beamlet (X and Y, re and im).
    pub fn bytes_per_sample(&self) -> usize {
        4 * self.bits_per_sample as usize / 8
    }

    /// Subband samples per second.
    pub fn samples_per_second(&self) -> f64 {
        f64::from(self.clock_hz) / SUBBAND_FFT_SIZE as f64
    }

    /// Current wall-clock time on this station's sample clock.
    pub fn now(&self) -> TimeStamp {
        TimeStamp::now(self.clock_hz)
    }

    /// Key naming this station's shared-memory segment.
    ///
    /// First four bytes of SHA-256 over the identity fields, big-endian.
    pub fn shm_key(&self) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.antenna_set.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.clock_hz.to_le_bytes());
        hasher.update(self.bits_per_sample.to_le_bytes());
        let digest = hasher.finalize();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} MHz {}-bit",
            self.name,
            self.antenna_set,
            self.clock_hz / 1_000_000,
            self.bits_per_sample
        )
    }
}

/// Geometry of a station's sample buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Station the buffer belongs to
    pub station: StationId,
    /// Beamlets stored per board
    pub nr_beamlets: u32,
    /// Number of boards (independent packet streams)
    pub nr_boards: u32,
    /// Capacity `N` in samples per board
    pub nr_samples: u64,
    /// Maximum ranges in a board's validity set
    pub nr_flag_ranges: u32,
}

impl BufferSettings {
    /// Default bound on validity ranges per board.
    pub const DEFAULT_FLAG_RANGES: u32 = 64;

    /// Geometry holding `seconds` of data for `nr_boards` boards, using every
    /// beamlet a board can deliver.
    pub fn new(station: StationId, nr_boards: u32, seconds: f64) -> Result<Self, SettingsError> {
        station.validate()?;
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(SettingsError::Invalid(format!(
                "buffer length must be positive, got {seconds} s"
            )));
        }
        // rounded up to whole packets
        let raw = (seconds * station.samples_per_second()).ceil() as u64;
        let per_packet = u64::from(BLOCKS_PER_PACKET);
        let nr_samples = (raw + per_packet - 1) / per_packet * per_packet;
        let settings = Self {
            nr_beamlets: station.nr_beamlets_per_board(),
            station,
            nr_boards,
            nr_samples,
            nr_flag_ranges: Self::DEFAULT_FLAG_RANGES,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Override the number of stored beamlets.
    pub fn with_beamlets(mut self, nr_beamlets: u32) -> Result<Self, SettingsError> {
        self.nr_beamlets = nr_beamlets;
        self.validate()?;
        Ok(self)
    }

    /// Override the validity range bound.
    pub fn with_flag_ranges(mut self, nr_flag_ranges: u32) -> Result<Self, SettingsError> {
        self.nr_flag_ranges = nr_flag_ranges;
        self.validate()?;
        Ok(self)
    }

    /// Override the capacity in samples.
    pub fn with_samples(mut self, nr_samples: u64) -> Result<Self, SettingsError> {
        self.nr_samples = nr_samples;
        self.validate()?;
        Ok(self)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.station.validate()?;
        if self.nr_boards == 0 {
            return Err(SettingsError::Invalid("nr_boards must be at least 1".into()));
        }
        if self.nr_beamlets == 0 || self.nr_beamlets > self.station.nr_beamlets_per_board() {
            return Err(SettingsError::Invalid(format!(
                "nr_beamlets must be in 1..={}, got {}",
                self.station.nr_beamlets_per_board(),
                self.nr_beamlets
            )));
        }
        if self.nr_samples == 0 || self.nr_samples > i64::MAX as u64 {
            return Err(SettingsError::Invalid(format!(
                "nr_samples out of range: {}",
                self.nr_samples
            )));
        }
        if self.nr_flag_ranges == 0 {
            return Err(SettingsError::Invalid(
                "nr_flag_ranges must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Bytes for one board's sample region.
    pub fn board_bytes(&self) -> usize {
        self.nr_beamlets as usize * self.nr_samples as usize * self.station.bytes_per_sample()
    }

    /// Buffer length in seconds.
    pub fn seconds(&self) -> f64 {
        self.nr_samples as f64 / self.station.samples_per_second()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(bits: u32) -> StationId {
        StationId::new("CS001", "HBA_DUAL", 200_000_000, bits).unwrap()
    }

    #[test]
    fn test_beamlets_per_board_by_bit_mode() {
        assert_eq!(station(16).nr_beamlets_per_board(), 61);
        assert_eq!(station(8).nr_beamlets_per_board(), 122);
        assert_eq!(station(4).nr_beamlets_per_board(), 244);

        let slow = StationId::new("CS001", "HBA_DUAL", 160_000_000, 8).unwrap();
        assert_eq!(slow.nr_beamlets_per_board(), 122);
    }

    #[test]
    fn test_bytes_per_sample() {
        assert_eq!(station(16).bytes_per_sample(), 8);
        assert_eq!(station(8).bytes_per_sample(), 4);
        assert_eq!(station(4).bytes_per_sample(), 2);
    }

    #[test]
    fn test_invalid_station_rejected() {
        assert_eq!(
            StationId::new("CS001", "LBA", 100_000_000, 16).unwrap_err(),
            SettingsError::UnsupportedClock(100_000_000)
        );
        assert_eq!(
            StationId::new("CS001", "LBA", 200_000_000, 12).unwrap_err(),
            SettingsError::UnsupportedBitMode(12)
        );
        assert!(StationId::new("", "LBA", 200_000_000, 16).is_err());
    }

    #[test]
    fn test_shm_key_depends_on_identity() {
        let a = station(16);
        let b = station(8);
        assert_eq!(a.shm_key(), station(16).shm_key());
        assert_ne!(a.shm_key(), b.shm_key());
    }

    #[test]
    fn test_buffer_settings_geometry() {
        let settings = BufferSettings::new(station(16), 4, 1.0).unwrap();
        assert_eq!(settings.nr_beamlets, 61);
        // 195_312.5 samples rounded up to whole packets
        assert_eq!(settings.nr_samples, 195_328);
        assert_eq!(settings.nr_samples % u64::from(BLOCKS_PER_PACKET), 0);
        assert_eq!(settings.board_bytes(), 61 * 195_328 * 8);

        let narrowed = settings.clone().with_beamlets(10).unwrap();
        assert_eq!(narrowed.nr_beamlets, 10);
        assert!(settings.clone().with_beamlets(62).is_err());
        assert!(settings.with_flag_ranges(0).is_err());
        assert!(BufferSettings::new(station(16), 0, 1.0).is_err());
        assert!(BufferSettings::new(station(16), 1, -1.0).is_err());
    }
}
