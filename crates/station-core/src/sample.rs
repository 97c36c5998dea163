//! Dual-polarisation complex samples in the station's wire formats.
//!
//! One sample is X(re, im) followed by Y(re, im). At 16 and 8 bits every
//! component is a little-endian two's-complement integer; at 4 bits the two
//! components of a polarisation share one byte, real part in the low nibble.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Both polarisations of one sample, widened to `i16`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualPol {
    /// X polarisation
    pub x: Complex<i16>,
    /// Y polarisation
    pub y: Complex<i16>,
}

impl DualPol {
    /// Build from the four components.
    pub const fn new(x_re: i16, x_im: i16, y_re: i16, y_im: i16) -> Self {
        Self {
            x: Complex::new(x_re, x_im),
            y: Complex::new(y_re, y_im),
        }
    }

    /// Combined power `|x|^2 + |y|^2`.
    pub fn power(&self) -> f64 {
        let x = Complex::new(f64::from(self.x.re), f64::from(self.x.im));
        let y = Complex::new(f64::from(self.y.re), f64::from(self.y.im));
        x.norm_sqr() + y.norm_sqr()
    }
}

/// Sample width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 16-bit components
    Bits16,
    /// 8-bit components
    Bits8,
    /// 4-bit components, two per byte
    Bits4,
}

impl SampleFormat {
    /// Format for a sample width in bits.
    pub fn from_bits(bits: u32) -> Result<Self, SettingsError> {
        match bits {
            16 => Ok(Self::Bits16),
            8 => Ok(Self::Bits8),
            4 => Ok(Self::Bits4),
            other => Err(SettingsError::UnsupportedBitMode(other)),
        }
    }

    /// Component width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits16 => 16,
            Self::Bits8 => 8,
            Self::Bits4 => 4,
        }
    }

    /// Bytes per dual-polarisation sample.
    pub const fn sample_bytes(self) -> usize {
        match self {
            Self::Bits16 => 8,
            Self::Bits8 => 4,
            Self::Bits4 => 2,
        }
    }

    /// Largest representable component.
    pub const fn max_value(self) -> i16 {
        match self {
            Self::Bits16 => i16::MAX,
            Self::Bits8 => i8::MAX as i16,
            Self::Bits4 => 7,
        }
    }

    /// Decode one sample from the first [`sample_bytes`](Self::sample_bytes) bytes.
    ///
    /// `None` when `bytes` is shorter than one sample.
    pub fn decode(self, bytes: &[u8]) -> Option<DualPol> {
        let bytes = bytes.get(..self.sample_bytes())?;
        let sample = match self {
            Self::Bits16 => {
                let c = |i: usize| i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
                DualPol::new(c(0), c(1), c(2), c(3))
            }
            Self::Bits8 => {
                let c = |i: usize| i16::from(bytes[i] as i8);
                DualPol::new(c(0), c(1), c(2), c(3))
            }
            Self::Bits4 => {
                let (x_re, x_im) = unpack_nibbles(bytes[0]);
                let (y_re, y_im) = unpack_nibbles(bytes[1]);
                DualPol::new(x_re, x_im, y_re, y_im)
            }
        };
        Some(sample)
    }

    /// Encode one sample into exactly [`sample_bytes`](Self::sample_bytes) bytes.
    ///
    /// Components outside the format's range are clamped.
    ///
    /// # Panics
    ///
    /// If `out` is shorter than one sample.
    pub fn encode(self, sample: &DualPol, out: &mut [u8]) {
        assert!(out.len() >= self.sample_bytes(), "output shorter than one sample");
        let components = [sample.x.re, sample.x.im, sample.y.re, sample.y.im];
        match self {
            Self::Bits16 => {
                for (chunk, value) in out.chunks_exact_mut(2).zip(components) {
                    chunk.copy_from_slice(&value.to_le_bytes());
                }
            }
            Self::Bits8 => {
                for (byte, value) in out.iter_mut().zip(components) {
                    *byte = value.clamp(-128, 127) as i8 as u8;
                }
            }
            Self::Bits4 => {
                out[0] = pack_nibbles(components[0], components[1]);
                out[1] = pack_nibbles(components[2], components[3]);
            }
        }
    }

    /// Decode a run of samples; trailing partial samples are ignored.
    pub fn decode_all(self, bytes: &[u8]) -> Vec<DualPol> {
        bytes
            .chunks_exact(self.sample_bytes())
            .filter_map(|chunk| self.decode(chunk))
            .collect()
    }

    /// Encode a run of samples into a fresh buffer.
    pub fn encode_all(self, samples: &[DualPol]) -> Vec<u8> {
        let mut out = vec![0u8; samples.len() * self.sample_bytes()];
        for (chunk, sample) in out.chunks_exact_mut(self.sample_bytes()).zip(samples) {
            self.encode(sample, chunk);
        }
        out
    }
}

fn unpack_nibbles(byte: u8) -> (i16, i16) {
    // shift the nibble into the top of an i8, then arithmetic-shift back down
    let re = ((byte << 4) as i8) >> 4;
    let im = (byte as i8) >> 4;
    (i16::from(re), i16::from(im))
}

fn pack_nibbles(re: i16, im: i16) -> u8 {
    let re = (re.clamp(-8, 7) as u8) & 0x0f;
    let im = (im.clamp(-8, 7) as u8) & 0x0f;
    re | (im << 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_16bit_layout_is_little_endian() {
        let sample = DualPol::new(1, -2, 300, -32768);
        let bytes = SampleFormat::Bits16.encode_all(&[sample]);
        assert_eq!(bytes, vec![1, 0, 0xfe, 0xff, 0x2c, 0x01, 0x00, 0x80]);
        assert_eq!(SampleFormat::Bits16.decode(&bytes), Some(sample));
        assert_eq!(SampleFormat::Bits16.decode(&bytes[..7]), None);
    }

    #[test]
    fn test_8bit_clamps() {
        let bytes = SampleFormat::Bits8.encode_all(&[DualPol::new(200, -200, 5, -5)]);
        assert_eq!(bytes, vec![127, 128, 5, 251]);
        assert_eq!(
            SampleFormat::Bits8.decode(&bytes),
            Some(DualPol::new(127, -128, 5, -5))
        );
    }

    #[test]
    fn test_4bit_nibble_order_and_sign() {
        let bytes = SampleFormat::Bits4.encode_all(&[DualPol::new(3, -1, -8, 7)]);
        assert_eq!(bytes, vec![0xf3, 0x78]);
        assert_eq!(
            SampleFormat::Bits4.decode(&bytes),
            Some(DualPol::new(3, -1, -8, 7))
        );
        assert_eq!(unpack_nibbles(0x80), (0, -8));
        assert_eq!(SampleFormat::Bits4.decode(&bytes[..1]), None);
    }

    #[test]
    fn test_format_from_bits() {
        assert_eq!(SampleFormat::from_bits(8).unwrap().sample_bytes(), 4);
        assert!(SampleFormat::from_bits(2).is_err());
        assert!((DualPol::new(3, 4, 0, 1).power() - 26.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dual_pol_serializes_both_polarisations() {
        let sample = DualPol::new(3, -4, 5, -6);
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(serde_json::from_str::<DualPol>(&json).unwrap(), sample);
    }
}
