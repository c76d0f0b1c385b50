//! Fixed-layout wire record
//!
//! Every exchange with the SMC user client is one 80-byte record in and one
//! 80-byte record out. The layout is written field by field at explicit
//! offsets instead of relying on a native struct layout; a record of any other
//! size is rejected by the kernel, and that failure is silent until it meets
//! real hardware.
//!
//! Scalars are little-endian (host order on every machine with this channel).
//! The payload is opaque here; the codec interprets it big-endian.

use super::key::RegisterKey;
use crate::error::{Result, SmcError};

pub const WIRE_RECORD_SIZE: usize = 80;
pub const PAYLOAD_SIZE: usize = 32;

const OFFSET_KEY: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_POWER_LIMIT: usize = 12;
const OFFSET_KEY_INFO_SIZE: usize = 28;
const OFFSET_KEY_INFO_TYPE: usize = 32;
const OFFSET_KEY_INFO_ATTRS: usize = 36;
const OFFSET_RESULT: usize = 40;
const OFFSET_STATUS: usize = 41;
const OFFSET_COMMAND: usize = 42;
const OFFSET_DATA32: usize = 44;
const OFFSET_PAYLOAD: usize = 48;

const _: () = assert!(OFFSET_PAYLOAD + PAYLOAD_SIZE == WIRE_RECORD_SIZE);

/// Result byte for a successful exchange
pub const RESULT_SUCCESS: u8 = 0x00;
/// Result byte when the requested key does not exist
pub const RESULT_KEY_NOT_FOUND: u8 = 0x84;

/// Command codes carried in the `command` byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ReadBytes = 5,
    WriteBytes = 6,
    ReadIndex = 8,
    ReadKeyInfo = 9,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            5 => Some(Command::ReadBytes),
            6 => Some(Command::WriteBytes),
            8 => Some(Command::ReadIndex),
            9 => Some(Command::ReadKeyInfo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub reserved: u8,
    pub release: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerLimit {
    pub version: u16,
    pub length: u16,
    pub cpu: u32,
    pub gpu: u32,
    pub mem: u32,
}

/// Declared size, type and attribute bits of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub data_size: u32,
    pub data_type: RegisterKey,
    pub attributes: u8,
}

impl Default for KeyInfo {
    fn default() -> Self {
        Self {
            data_size: 0,
            data_type: RegisterKey::from_code(0),
            attributes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub key: RegisterKey,
    pub version: FirmwareVersion,
    pub power_limit: PowerLimit,
    pub key_info: KeyInfo,
    pub result: u8,
    pub status: u8,
    pub command: u8,
    pub data32: u32,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Default for WireRecord {
    fn default() -> Self {
        Self {
            key: RegisterKey::from_code(0),
            version: FirmwareVersion::default(),
            power_limit: PowerLimit::default(),
            key_info: KeyInfo::default(),
            result: RESULT_SUCCESS,
            status: 0,
            command: 0,
            data32: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }
}

impl WireRecord {
    pub fn read_key_info(key: RegisterKey) -> Self {
        Self {
            key,
            command: Command::ReadKeyInfo as u8,
            ..Self::default()
        }
    }

    pub fn read_bytes(key: RegisterKey, info: KeyInfo) -> Self {
        Self {
            key,
            key_info: info,
            command: Command::ReadBytes as u8,
            ..Self::default()
        }
    }

    /// Payloads longer than 32 bytes are truncated; key sizes never exceed it.
    pub fn write_bytes(key: RegisterKey, info: KeyInfo, data: &[u8]) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        let n = data.len().min(PAYLOAD_SIZE);
        payload[..n].copy_from_slice(&data[..n]);
        Self {
            key,
            key_info: info,
            command: Command::WriteBytes as u8,
            payload,
            ..Self::default()
        }
    }

    pub fn read_index(index: u32) -> Self {
        Self {
            command: Command::ReadIndex as u8,
            data32: index,
            ..Self::default()
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    /// Payload bytes up to the declared key size
    pub fn data(&self) -> &[u8] {
        let n = (self.key_info.data_size as usize).min(PAYLOAD_SIZE);
        &self.payload[..n]
    }

    pub fn to_bytes(&self) -> [u8; WIRE_RECORD_SIZE] {
        let mut buf = [0u8; WIRE_RECORD_SIZE];

        put_u32(&mut buf, OFFSET_KEY, self.key.code());

        buf[OFFSET_VERSION] = self.version.major;
        buf[OFFSET_VERSION + 1] = self.version.minor;
        buf[OFFSET_VERSION + 2] = self.version.build;
        buf[OFFSET_VERSION + 3] = self.version.reserved;
        put_u16(&mut buf, OFFSET_VERSION + 4, self.version.release);

        put_u16(&mut buf, OFFSET_POWER_LIMIT, self.power_limit.version);
        put_u16(&mut buf, OFFSET_POWER_LIMIT + 2, self.power_limit.length);
        put_u32(&mut buf, OFFSET_POWER_LIMIT + 4, self.power_limit.cpu);
        put_u32(&mut buf, OFFSET_POWER_LIMIT + 8, self.power_limit.gpu);
        put_u32(&mut buf, OFFSET_POWER_LIMIT + 12, self.power_limit.mem);

        put_u32(&mut buf, OFFSET_KEY_INFO_SIZE, self.key_info.data_size);
        put_u32(&mut buf, OFFSET_KEY_INFO_TYPE, self.key_info.data_type.code());
        buf[OFFSET_KEY_INFO_ATTRS] = self.key_info.attributes;

        buf[OFFSET_RESULT] = self.result;
        buf[OFFSET_STATUS] = self.status;
        buf[OFFSET_COMMAND] = self.command;
        put_u32(&mut buf, OFFSET_DATA32, self.data32);

        buf[OFFSET_PAYLOAD..].copy_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != WIRE_RECORD_SIZE {
            return Err(SmcError::MalformedRecord {
                expected: WIRE_RECORD_SIZE,
                actual: bytes.len(),
            });
        }

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[OFFSET_PAYLOAD..]);

        Ok(Self {
            key: RegisterKey::from_code(get_u32(bytes, OFFSET_KEY)),
            version: FirmwareVersion {
                major: bytes[OFFSET_VERSION],
                minor: bytes[OFFSET_VERSION + 1],
                build: bytes[OFFSET_VERSION + 2],
                reserved: bytes[OFFSET_VERSION + 3],
                release: get_u16(bytes, OFFSET_VERSION + 4),
            },
            power_limit: PowerLimit {
                version: get_u16(bytes, OFFSET_POWER_LIMIT),
                length: get_u16(bytes, OFFSET_POWER_LIMIT + 2),
                cpu: get_u32(bytes, OFFSET_POWER_LIMIT + 4),
                gpu: get_u32(bytes, OFFSET_POWER_LIMIT + 8),
                mem: get_u32(bytes, OFFSET_POWER_LIMIT + 12),
            },
            key_info: KeyInfo {
                data_size: get_u32(bytes, OFFSET_KEY_INFO_SIZE),
                data_type: RegisterKey::from_code(get_u32(bytes, OFFSET_KEY_INFO_TYPE)),
                attributes: bytes[OFFSET_KEY_INFO_ATTRS],
            },
            result: bytes[OFFSET_RESULT],
            status: bytes[OFFSET_STATUS],
            command: bytes[OFFSET_COMMAND],
            data32: get_u32(bytes, OFFSET_DATA32),
            payload,
        })
    }
}

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::codec::DataFormat;

    #[test]
    fn test_serialized_size() {
        let rec = WireRecord::read_key_info(RegisterKey::parse("TC0P").unwrap());
        assert_eq!(rec.to_bytes().len(), WIRE_RECORD_SIZE);
        assert_eq!(WIRE_RECORD_SIZE, 80);
    }

    #[test]
    fn test_rejects_other_sizes() {
        for len in [0usize, 53, 79, 81, 84] {
            let err = WireRecord::from_bytes(&vec![0u8; len]).unwrap_err();
            assert!(matches!(
                err,
                SmcError::MalformedRecord { expected: 80, actual } if actual == len
            ));
        }
    }

    #[test]
    fn test_field_offsets() {
        let key = RegisterKey::parse("F0Tg").unwrap();
        let info = KeyInfo {
            data_size: 2,
            data_type: DataFormat::Fixed14_2.type_code(),
            attributes: 0xD0,
        };
        let rec = WireRecord::write_bytes(key, info, &[0x2E, 0xE0]);
        let bytes = rec.to_bytes();

        assert_eq!(&bytes[0..4], &key.code().to_le_bytes());
        assert_eq!(&bytes[28..32], &2u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &DataFormat::Fixed14_2.type_code().code().to_le_bytes());
        assert_eq!(bytes[36], 0xD0);
        assert_eq!(bytes[42], Command::WriteBytes as u8);
        assert_eq!(&bytes[48..50], &[0x2E, 0xE0]);
        assert!(bytes[50..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_restores_record() {
        let mut rec = WireRecord::read_index(17);
        rec.version = FirmwareVersion { major: 2, minor: 1, build: 0xF0, reserved: 0, release: 0x1234 };
        rec.power_limit = PowerLimit { version: 1, length: 16, cpu: 45, gpu: 30, mem: 5 };
        rec.result = RESULT_KEY_NOT_FOUND;
        rec.status = 3;
        let back = WireRecord::from_bytes(&rec.to_bytes()).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.command(), Some(Command::ReadIndex));
    }

    #[test]
    fn test_data_is_bounded_by_declared_size() {
        let key = RegisterKey::parse("TC0P").unwrap();
        let mut rec = WireRecord::read_bytes(
            key,
            KeyInfo { data_size: 2, data_type: DataFormat::FixedSigned7_8.type_code(), attributes: 0 },
        );
        rec.payload[0] = 0x2D;
        rec.payload[1] = 0x80;
        rec.payload[2] = 0xFF;
        assert_eq!(rec.data(), &[0x2D, 0x80]);
    }
}
