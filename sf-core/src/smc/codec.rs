//! Typed value codec
//!
//! Converts between the raw big-endian payload bytes of a register and `f64`.
//!
//! # Formats
//! | Format | Type code | Width | Encoding |
//! |---|---|---|---|
//! | `Float32` | `flt ` | 4 | IEEE-754 |
//! | `UInt8` | `ui8 ` | 1 | unsigned |
//! | `UInt16` | `ui16` | 2 | unsigned |
//! | `UInt32` | `ui32` | 4 | unsigned |
//! | `Fixed14_2` | `fpe2` | 2 | 14 integer bits, quarters in the low 2 bits |
//! | `FixedSigned7_8` | `sp78` | 2 | signed, 8 fractional bits |

use std::fmt;

use super::key::RegisterKey;
use crate::error::{Result, SmcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Float32,
    UInt8,
    UInt16,
    UInt32,
    Fixed14_2,
    FixedSigned7_8,
}

impl DataFormat {
    pub const ALL: [DataFormat; 6] = [
        DataFormat::Float32,
        DataFormat::UInt8,
        DataFormat::UInt16,
        DataFormat::UInt32,
        DataFormat::Fixed14_2,
        DataFormat::FixedSigned7_8,
    ];

    /// Payload width in bytes
    pub const fn width(&self) -> usize {
        match self {
            DataFormat::Float32 | DataFormat::UInt32 => 4,
            DataFormat::UInt8 => 1,
            DataFormat::UInt16 | DataFormat::Fixed14_2 | DataFormat::FixedSigned7_8 => 2,
        }
    }

    pub const fn type_code(&self) -> RegisterKey {
        RegisterKey::from_bytes(match self {
            DataFormat::Float32 => *b"flt ",
            DataFormat::UInt8 => *b"ui8 ",
            DataFormat::UInt16 => *b"ui16",
            DataFormat::UInt32 => *b"ui32",
            DataFormat::Fixed14_2 => *b"fpe2",
            DataFormat::FixedSigned7_8 => *b"sp78",
        })
    }

    pub fn from_type_code(code: RegisterKey) -> Result<Self> {
        DataFormat::ALL
            .into_iter()
            .find(|f| f.type_code() == code)
            .ok_or_else(|| SmcError::UnsupportedFormat(code.to_string()))
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_code())
    }
}

/// Decode a payload, returning `0.0` when fewer than `format.width()` bytes
/// are available. Use [`try_decode`] where a short payload must be an error.
pub fn decode(bytes: &[u8], format: DataFormat) -> f64 {
    try_decode(bytes, format).unwrap_or(0.0)
}

/// Strict decode: a payload shorter than the format width is a malformed record.
pub fn try_decode(bytes: &[u8], format: DataFormat) -> Result<f64> {
    let width = format.width();
    if bytes.len() < width {
        return Err(SmcError::MalformedRecord {
            expected: width,
            actual: bytes.len(),
        });
    }

    let value = match format {
        DataFormat::Float32 => {
            f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
        DataFormat::UInt8 => bytes[0] as f64,
        DataFormat::UInt16 => u16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        DataFormat::UInt32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        DataFormat::Fixed14_2 => {
            let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
            (raw >> 2) as f64 + (raw & 0x3) as f64 * 0.25
        }
        DataFormat::FixedSigned7_8 => {
            let raw = i16::from_be_bytes([bytes[0], bytes[1]]);
            raw as f64 / 256.0
        }
    };

    Ok(value)
}

/// Encode a value into exactly `format.width()` big-endian bytes.
///
/// Out-of-range values saturate at the format's bounds.
pub fn encode(value: f64, format: DataFormat) -> Vec<u8> {
    match format {
        DataFormat::Float32 => (value as f32).to_be_bytes().to_vec(),
        DataFormat::UInt8 => vec![saturate(value, u8::MAX as f64) as u8],
        DataFormat::UInt16 => (saturate(value, u16::MAX as f64) as u16).to_be_bytes().to_vec(),
        DataFormat::UInt32 => (saturate(value, u32::MAX as f64) as u32).to_be_bytes().to_vec(),
        DataFormat::Fixed14_2 => {
            let v = value.max(0.0);
            let mut whole = v.trunc() as u32;
            let mut quarters = ((v - v.trunc()) * 4.0).round() as u32;
            if quarters == 4 {
                whole += 1;
                quarters = 0;
            }
            let raw = ((whole << 2) | quarters).min(u16::MAX as u32) as u16;
            raw.to_be_bytes().to_vec()
        }
        DataFormat::FixedSigned7_8 => {
            let scaled = (value * 256.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            (scaled as u16).to_be_bytes().to_vec()
        }
    }
}

fn saturate(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.round().clamp(0.0, max)
}

/// Worst-case absolute round-trip error of a format
pub fn precision(format: DataFormat) -> f64 {
    match format {
        DataFormat::Float32 => 1e-3,
        DataFormat::UInt8 | DataFormat::UInt16 | DataFormat::UInt32 => 0.0,
        DataFormat::Fixed14_2 => 0.25,
        DataFormat::FixedSigned7_8 => 1.0 / 256.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(format: DataFormat) -> &'static [f64] {
        match format {
            DataFormat::Float32 => &[0.0, 1.5, -12.25, 42.123, 3000.0],
            DataFormat::UInt8 => &[0.0, 1.0, 2.0, 127.0, 255.0],
            DataFormat::UInt16 => &[0.0, 1200.0, 6000.0, 65535.0],
            DataFormat::UInt32 => &[0.0, 70_000.0, 4_000_000_000.0],
            DataFormat::Fixed14_2 => &[0.0, 23.5, 1200.25, 5999.75, 3000.1],
            DataFormat::FixedSigned7_8 => &[0.0, 45.5, -10.125, 99.99, 127.0],
        }
    }

    #[test]
    fn test_round_trip_within_precision() {
        for format in DataFormat::ALL {
            for &v in samples(format) {
                let bytes = encode(v, format);
                assert_eq!(bytes.len(), format.width(), "{} width", format);
                let back = decode(&bytes, format);
                assert!(
                    (back - v).abs() <= precision(format),
                    "{}: {} decoded as {}",
                    format,
                    v,
                    back
                );
            }
        }
    }

    #[test]
    fn test_fixed14_2_scenario() {
        let bytes = encode(23.5, DataFormat::Fixed14_2);
        assert_eq!(bytes, vec![0x00, 0x5E]);
        let v = decode(&bytes, DataFormat::Fixed14_2);
        assert!((v - 23.5).abs() <= 0.25);
    }

    #[test]
    fn test_fixed14_2_fraction_carry() {
        // .9 rounds up to a full quarter count of 4
        let v = decode(&encode(9.9, DataFormat::Fixed14_2), DataFormat::Fixed14_2);
        assert_eq!(v, 10.0);
    }

    #[test]
    fn test_sp78_known_bytes() {
        assert_eq!(decode(&[0x2D, 0x80], DataFormat::FixedSigned7_8), 45.5);
        assert_eq!(decode(&[0xFF, 0x00], DataFormat::FixedSigned7_8), -1.0);
        assert_eq!(encode(-1.0, DataFormat::FixedSigned7_8), vec![0xFF, 0x00]);
    }

    #[test]
    fn test_short_payload() {
        assert_eq!(decode(&[], DataFormat::Float32), 0.0);
        assert_eq!(decode(&[0x01], DataFormat::UInt16), 0.0);
        assert!(matches!(
            try_decode(&[0x01], DataFormat::UInt16),
            Err(SmcError::MalformedRecord { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_integer_saturation() {
        assert_eq!(encode(300.0, DataFormat::UInt8), vec![255]);
        assert_eq!(encode(-5.0, DataFormat::UInt16), vec![0, 0]);
        assert_eq!(encode(f64::NAN, DataFormat::UInt8), vec![0]);
    }

    #[test]
    fn test_type_codes() {
        for format in DataFormat::ALL {
            assert_eq!(DataFormat::from_type_code(format.type_code()).unwrap(), format);
        }
        let flag = RegisterKey::parse("flag").unwrap();
        assert!(matches!(
            DataFormat::from_type_code(flag),
            Err(SmcError::UnsupportedFormat(_))
        ));
    }
}
