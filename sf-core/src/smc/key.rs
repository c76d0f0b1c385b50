//! FourCC register keys

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SmcError};

/// A 4-character register identifier packed big-endian into a `u32`.
///
/// The same packing is used for the type code the channel reports for a key
/// (`"sp78"`, `"fpe2"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterKey(u32);

impl RegisterKey {
    /// Number of fans (`ui8`)
    pub const FAN_COUNT: RegisterKey = RegisterKey::from_bytes(*b"FNum");
    /// Total number of keys (`ui32`)
    pub const KEY_COUNT: RegisterKey = RegisterKey::from_bytes(*b"#KEY");
    /// Legacy forced-fan bitmask (`ui16`)
    pub const FORCE_BITS: RegisterKey = RegisterKey::from_bytes(*b"FS! ");

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    pub const fn from_code(code: u32) -> Self {
        Self(code)
    }

    pub fn parse(s: &str) -> Result<Self> {
        sf_protocol::validate_key(s).map_err(|e| SmcError::InvalidKey(format!("{:?}: {}", s, e)))?;
        let b = s.as_bytes();
        Ok(Self::from_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Per-fan key such as `F0Ac` for `(0, "Ac")`.
    pub fn fan(index: u8, suffix: &str) -> Result<Self> {
        if index > sf_protocol::MAX_FAN_INDEX {
            return Err(SmcError::InvalidFanIndex {
                index,
                count: sf_protocol::MAX_FAN_INDEX + 1,
            });
        }
        Self::parse(&format!("F{}{}", index, suffix))
    }

    pub const fn code(&self) -> u32 {
        self.0
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Temperature sensors all live under `T`.
    pub fn is_temperature(&self) -> bool {
        self.to_bytes()[0] == b'T'
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for RegisterKey {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
