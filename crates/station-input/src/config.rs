//! Ingestion configuration using Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file
//! 3. environment variables prefixed with `STATION_INPUT_`, nested keys
//!    separated by `__` (e.g. `STATION_INPUT_BUFFER__BUFFER_SECONDS=5`)
//!
//! # Example
//! ```toml
//! log_level = "info"
//! stats_interval = "10s"
//!
//! [station]
//! name = "CS001"
//! antenna_set = "HBA_DUAL"
//! clock_mhz = 200
//! bits_per_sample = 16
//!
//! [buffer]
//! buffer_seconds = 2.5
//! shared_memory = true
//!
//! [[boards]]
//! board = 0
//! source = "udp:0.0.0.0:4346"
//! ```

use anyhow::{anyhow, Context};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use station_buffer::Backing;
use station_core::{BufferSettings, SettingsError, StationId};

use crate::error::TransportError;
use crate::transport::SourceSpec;

const ENV_PREFIX: &str = "STATION_INPUT_";

/// Top-level configuration of the ingestion process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Which station is received
    #[serde(default)]
    pub station: StationConfig,
    /// Buffer geometry and placement
    #[serde(default)]
    pub buffer: BufferConfig,
    /// One entry per board to receive
    #[serde(default)]
    pub boards: Vec<BoardSource>,
    /// Period between statistics reports
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
    /// How long a source read may block before the stop flag is checked again
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

/// Station identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station name, e.g. `CS001`
    pub name: String,
    /// Antenna set, e.g. `HBA_DUAL`
    #[serde(default = "default_antenna_set")]
    pub antenna_set: String,
    /// Clock in MHz (160 or 200)
    #[serde(default = "default_clock_mhz")]
    pub clock_mhz: u32,
    /// Sample width (4, 8 or 16)
    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u32,
}

/// Sample buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Boards in the buffer; defaults to one past the highest configured board
    #[serde(default)]
    pub nr_boards: Option<u32>,
    /// Beamlets stored per board; defaults to all a board delivers
    #[serde(default)]
    pub nr_beamlets: Option<u32>,
    /// Seconds of data kept per board
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: f64,
    /// Bound on validity ranges per board
    #[serde(default = "default_flag_ranges")]
    pub nr_flag_ranges: u32,
    /// Place the buffer in a shared segment other processes can attach to
    #[serde(default = "default_shared_memory")]
    pub shared_memory: bool,
    /// Directory for the shared segment
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
}

/// Packet source of one board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSource {
    /// Board index
    pub board: u32,
    /// `udp:<addr>`, `tcp:<addr>` or `file:<path>`
    pub source: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_antenna_set() -> String {
    "HBA_DUAL".to_string()
}

fn default_clock_mhz() -> u32 {
    200
}

fn default_bits_per_sample() -> u32 {
    16
}

fn default_buffer_seconds() -> f64 {
    2.5
}

fn default_flag_ranges() -> u32 {
    BufferSettings::DEFAULT_FLAG_RANGES
}

fn default_shared_memory() -> bool {
    true
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            station: StationConfig::default(),
            buffer: BufferConfig::default(),
            boards: Vec::new(),
            stats_interval: default_stats_interval(),
            read_timeout: default_read_timeout(),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            antenna_set: default_antenna_set(),
            clock_mhz: default_clock_mhz(),
            bits_per_sample: default_bits_per_sample(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            nr_boards: None,
            nr_beamlets: None,
            buffer_seconds: default_buffer_seconds(),
            nr_flag_ranges: default_flag_ranges(),
            shared_memory: default_shared_memory(),
            shm_dir: default_shm_dir(),
        }
    }
}

impl InputConfig {
    /// Load defaults, then `path`, then the environment.
    ///
    /// A missing file contributes nothing; use [`load_validated`](Self::load_validated)
    /// to insist on it.
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Parse a TOML document on top of the defaults, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()
    }

    /// Load `path` (which must exist) and validate the result.
    pub fn load_validated(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Config file not found: {}", path.display()));
        }
        let config = Self::load(path)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration in {}: {e}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            boards = config.boards.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            ));
        }

        // clock, bit mode, station name and buffer geometry
        self.buffer_settings().map_err(|e| e.to_string())?;

        if self.boards.is_empty() {
            return Err("No boards configured".to_string());
        }

        let nr_boards = self.nr_boards();
        let mut seen = HashSet::new();
        for entry in &self.boards {
            if entry.board >= nr_boards {
                return Err(format!(
                    "Board {} out of range, buffer has {} boards",
                    entry.board, nr_boards
                ));
            }
            if !seen.insert(entry.board) {
                return Err(format!("Duplicate board: {}", entry.board));
            }
            entry
                .source
                .parse::<SourceSpec>()
                .map_err(|e| e.to_string())?;
        }

        if self.read_timeout.is_zero() {
            return Err("read_timeout must be positive".to_string());
        }

        Ok(())
    }

    /// Station identity.
    pub fn station_id(&self) -> Result<StationId, SettingsError> {
        let clock_hz = self
            .station
            .clock_mhz
            .checked_mul(1_000_000)
            .ok_or(SettingsError::UnsupportedClock(self.station.clock_mhz))?;
        StationId::new(
            self.station.name.clone(),
            self.station.antenna_set.clone(),
            clock_hz,
            self.station.bits_per_sample,
        )
    }

    /// Boards in the buffer.
    pub fn nr_boards(&self) -> u32 {
        self.buffer.nr_boards.unwrap_or_else(|| {
            self.boards
                .iter()
                .map(|entry| entry.board.saturating_add(1))
                .max()
                .unwrap_or(1)
        })
    }

    /// Buffer geometry.
    pub fn buffer_settings(&self) -> Result<BufferSettings, SettingsError> {
        let mut settings = BufferSettings::new(
            self.station_id()?,
            self.nr_boards(),
            self.buffer.buffer_seconds,
        )?
        .with_flag_ranges(self.buffer.nr_flag_ranges)?;
        if let Some(nr_beamlets) = self.buffer.nr_beamlets {
            settings = settings.with_beamlets(nr_beamlets)?;
        }
        Ok(settings)
    }

    /// Where the buffer lives.
    pub fn backing(&self) -> Backing {
        if self.buffer.shared_memory {
            Backing::Shared(self.buffer.shm_dir.clone())
        } else {
            Backing::Heap
        }
    }

    /// Parsed board sources.
    pub fn sources(&self) -> Result<Vec<(u32, SourceSpec)>, TransportError> {
        self.boards
            .iter()
            .map(|entry| {
                entry
                    .source
                    .parse::<SourceSpec>()
                    .map(|spec| (entry.board, spec))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [station]
        name = "CS001"

        [[boards]]
        board = 0
        source = "udp:0.0.0.0:4346"

        [[boards]]
        board = 3
        source = "file:/tmp/board3.raw"
    "#;

    #[test]
    fn test_defaults_fill_gaps() {
        let config = InputConfig::from_toml_str(MINIMAL).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.stats_interval, Duration::from_secs(10));
        assert_eq!(config.nr_boards(), 4);
        assert_eq!(config.backing(), Backing::Shared(PathBuf::from("/dev/shm")));

        let settings = config.buffer_settings().unwrap();
        assert_eq!(settings.nr_beamlets, 61);
        assert_eq!(settings.station.clock_hz, 200_000_000);

        let sources = config.sources().unwrap();
        assert_eq!(sources[1], (3, SourceSpec::File(PathBuf::from("/tmp/board3.raw"))));
    }

    #[test]
    fn test_full_document() {
        let config = InputConfig::from_toml_str(
            r#"
            log_level = "debug"
            log_format = "json"
            stats_interval = "1m 30s"
            read_timeout = "250ms"

            [station]
            name = "RS106"
            antenna_set = "LBA_OUTER"
            clock_mhz = 160
            bits_per_sample = 8

            [buffer]
            nr_boards = 4
            nr_beamlets = 100
            buffer_seconds = 1.0
            shared_memory = false

            [[boards]]
            board = 1
            source = "tcp:10.0.0.1:4346"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.stats_interval, Duration::from_secs(90));
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.backing(), Backing::Heap);
        let settings = config.buffer_settings().unwrap();
        assert_eq!(settings.nr_boards, 4);
        assert_eq!(settings.nr_beamlets, 100);
        assert_eq!(settings.nr_samples, 156_256);
    }

    #[test]
    fn test_validation_errors() {
        let base = InputConfig::from_toml_str(MINIMAL).unwrap();

        let mut config = base.clone();
        config.log_level = "verbose".into();
        assert!(config.validate().unwrap_err().contains("log_level"));

        let mut config = base.clone();
        config.station.clock_mhz = 150;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.station.bits_per_sample = 12;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.boards.clear();
        assert_eq!(config.validate().unwrap_err(), "No boards configured");

        let mut config = base.clone();
        config.buffer.nr_boards = Some(2);
        assert!(config.validate().unwrap_err().contains("out of range"));

        let mut config = base.clone();
        config.boards[1].board = 0;
        assert!(config.validate().unwrap_err().contains("Duplicate"));

        let mut config = base;
        config.boards[0].source = "serial:/dev/ttyS0".into();
        assert!(config.validate().unwrap_err().contains("serial"));
    }

    #[test]
    fn test_missing_station_name_rejected() {
        let config = InputConfig::from_toml_str(
            r#"
            [[boards]]
            board = 0
            source = "udp:0.0.0.0:4346"
            "#,
        )
        .unwrap();
        assert!(config.validate().unwrap_err().contains("station name"));
    }

    #[test]
    fn test_load_requires_file() {
        let err = InputConfig::load_validated(Path::new("/nonexistent/station.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
