//! In-memory SMC that speaks the 80-byte record protocol.
//!
//! Used by the helper's `--emulate` mode and by tests. Clones share the same
//! register map, so a test can keep a handle after moving a clone into a
//! connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::codec::{self, DataFormat};
use super::driver::SmcDriver;
use super::key::RegisterKey;
use super::wire::{
    Command, KeyInfo, WireRecord, RESULT_KEY_NOT_FOUND, RESULT_SUCCESS, WIRE_RECORD_SIZE,
};
use crate::error::{Result, SmcError};

/// Result byte for a rejected write
const RESULT_REJECTED: u8 = 0x85;

/// Attribute bits reported for readable / writable keys
const ATTR_READ: u8 = 0x80;
const ATTR_WRITE: u8 = 0x40;

/// How `open` should fail, for exercising the permission paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    ServiceNotFound,
    PermissionDenied,
    ConnectionFailed,
}

#[derive(Debug, Clone)]
struct Register {
    format: DataFormat,
    bytes: Vec<u8>,
    writable: bool,
}

#[derive(Debug, Default)]
struct State {
    registers: BTreeMap<RegisterKey, Register>,
    open: bool,
    open_failure: Option<OpenFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct EmulatedSmc {
    state: Arc<Mutex<State>>,
    exchanges: Arc<AtomicU64>,
}

impl EmulatedSmc {
    /// An empty register map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Two fans with mode keys and a handful of temperature sensors.
    pub fn macbook_pro() -> Self {
        let smc = Self::new();
        smc.insert(RegisterKey::FAN_COUNT, DataFormat::UInt8, 2.0, false);
        smc.insert_fan(0, 1200.0, 6000.0, 2000.0, true);
        smc.insert_fan(1, 1300.0, 5500.0, 2100.0, true);
        smc.insert_temperatures();
        smc
    }

    /// A single fan without `F0Md`; forced mode goes through `FS! `.
    pub fn legacy() -> Self {
        let smc = Self::new();
        smc.insert(RegisterKey::FAN_COUNT, DataFormat::UInt8, 1.0, false);
        smc.insert(RegisterKey::FORCE_BITS, DataFormat::UInt16, 0.0, true);
        smc.insert_fan(0, 1000.0, 5000.0, 1800.0, false);
        smc.insert_temperatures();
        smc
    }

    fn insert_fan(&self, index: u8, min: f64, max: f64, actual: f64, mode_key: bool) {
        let key = |suffix: &str| RegisterKey::from_bytes([b'F', b'0' + index, suffix.as_bytes()[0], suffix.as_bytes()[1]]);
        self.insert(key("Mn"), DataFormat::Fixed14_2, min, true);
        self.insert(key("Mx"), DataFormat::Fixed14_2, max, false);
        self.insert(key("Ac"), DataFormat::Fixed14_2, actual, false);
        self.insert(key("Tg"), DataFormat::Fixed14_2, actual, true);
        if mode_key {
            self.insert(key("Md"), DataFormat::UInt8, 0.0, true);
        }
    }

    fn insert_temperatures(&self) {
        for (key, value) in [
            (*b"TC0P", 45.5),
            (*b"TC0D", 48.25),
            (*b"TG0P", 52.0),
            (*b"TA0P", 27.5),
            (*b"Tm0P", 38.75),
            (*b"TB0T", 30.5),
        ] {
            self.insert(RegisterKey::from_bytes(key), DataFormat::FixedSigned7_8, value, false);
        }
    }

    pub fn insert(&self, key: RegisterKey, format: DataFormat, value: f64, writable: bool) {
        self.state.lock().registers.insert(
            key,
            Register {
                format,
                bytes: codec::encode(value, format),
                writable,
            },
        );
    }

    pub fn remove(&self, key: RegisterKey) {
        self.state.lock().registers.remove(&key);
    }

    /// Overwrite a value as the firmware would, ignoring writability.
    pub fn set(&self, key: RegisterKey, value: f64) {
        if let Some(reg) = self.state.lock().registers.get_mut(&key) {
            reg.bytes = codec::encode(value, reg.format);
        }
    }

    pub fn value(&self, key: RegisterKey) -> Option<f64> {
        self.state
            .lock()
            .registers
            .get(&key)
            .map(|reg| codec::decode(&reg.bytes, reg.format))
    }

    pub fn set_open_failure(&self, failure: Option<OpenFailure>) {
        self.state.lock().open_failure = failure;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of records exchanged so far
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    fn respond(state: &mut State, request: WireRecord) -> WireRecord {
        let mut reply = request.clone();
        reply.result = RESULT_SUCCESS;
        reply.payload = [0; 32];

        let key_count = state.registers.len() + 1;

        match request.command() {
            Some(Command::ReadKeyInfo) => {
                if request.key == RegisterKey::KEY_COUNT {
                    reply.key_info = KeyInfo {
                        data_size: 4,
                        data_type: DataFormat::UInt32.type_code(),
                        attributes: ATTR_READ,
                    };
                } else if let Some(reg) = state.registers.get(&request.key) {
                    reply.key_info = key_info(reg);
                } else {
                    reply.result = RESULT_KEY_NOT_FOUND;
                }
            }
            Some(Command::ReadBytes) => {
                if request.key == RegisterKey::KEY_COUNT {
                    reply.payload[..4].copy_from_slice(&(key_count as u32).to_be_bytes());
                    reply.key_info.data_size = 4;
                } else if let Some(reg) = state.registers.get(&request.key) {
                    reply.payload[..reg.bytes.len()].copy_from_slice(&reg.bytes);
                    reply.key_info = key_info(reg);
                } else {
                    reply.result = RESULT_KEY_NOT_FOUND;
                }
            }
            Some(Command::WriteBytes) => match state.registers.get_mut(&request.key) {
                Some(reg) if reg.writable => {
                    let width = reg.format.width();
                    reg.bytes = request.payload[..width].to_vec();
                    apply_side_effects(state, request.key);
                }
                Some(_) => reply.result = RESULT_REJECTED,
                None => reply.result = RESULT_KEY_NOT_FOUND,
            },
            Some(Command::ReadIndex) => {
                // #KEY itself is listed first
                let index = request.data32 as usize;
                if index == 0 {
                    reply.key = RegisterKey::KEY_COUNT;
                } else if let Some(key) = state.registers.keys().nth(index - 1) {
                    reply.key = *key;
                } else {
                    reply.result = RESULT_KEY_NOT_FOUND;
                }
            }
            None => reply.result = RESULT_REJECTED,
        }

        reply
    }
}

fn key_info(reg: &Register) -> KeyInfo {
    KeyInfo {
        data_size: reg.format.width() as u32,
        data_type: reg.format.type_code(),
        attributes: if reg.writable { ATTR_READ | ATTR_WRITE } else { ATTR_READ },
    }
}

/// A target write on a fan in forced mode moves its actual speed.
fn apply_side_effects(state: &mut State, key: RegisterKey) {
    let b = key.to_bytes();
    if b[0] != b'F' || &b[2..] != b"Tg" {
        return;
    }
    let actual = RegisterKey::from_bytes([b'F', b[1], b'A', b'c']);
    if let Some(target) = state.registers.get(&key).map(|r| r.bytes.clone()) {
        if let Some(reg) = state.registers.get_mut(&actual) {
            reg.bytes = target;
        }
    }
}

impl SmcDriver for EmulatedSmc {
    fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        match state.open_failure {
            Some(OpenFailure::ServiceNotFound) => {
                Err(SmcError::ServiceNotFound("AppleSMC (emulated)".into()))
            }
            Some(OpenFailure::PermissionDenied) => {
                Err(SmcError::PermissionDenied("emulated privilege check".into()))
            }
            Some(OpenFailure::ConnectionFailed) => {
                Err(SmcError::ConnectionFailed("emulated open failure".into()))
            }
            None => {
                state.open = true;
                Ok(())
            }
        }
    }

    fn exchange(
        &mut self,
        input: &[u8; WIRE_RECORD_SIZE],
        output: &mut [u8; WIRE_RECORD_SIZE],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SmcError::NotConnected);
        }
        self.exchanges.fetch_add(1, Ordering::Relaxed);

        let request = WireRecord::from_bytes(input)?;
        let reply = Self::respond(&mut state, request);
        *output = reply.to_bytes();
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn name(&self) -> &'static str {
        "emulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(smc: &mut EmulatedSmc, rec: WireRecord) -> WireRecord {
        let mut out = [0u8; WIRE_RECORD_SIZE];
        smc.exchange(&rec.to_bytes(), &mut out).unwrap();
        WireRecord::from_bytes(&out).unwrap()
    }

    #[test]
    fn test_requires_open() {
        let mut smc = EmulatedSmc::macbook_pro();
        let input = WireRecord::read_key_info(RegisterKey::FAN_COUNT).to_bytes();
        let mut out = [0u8; WIRE_RECORD_SIZE];
        assert!(matches!(smc.exchange(&input, &mut out), Err(SmcError::NotConnected)));
    }

    #[test]
    fn test_key_info_and_read() {
        let mut smc = EmulatedSmc::macbook_pro();
        smc.open().unwrap();

        let tc0p = RegisterKey::from_bytes(*b"TC0P");
        let info = call(&mut smc, WireRecord::read_key_info(tc0p));
        assert_eq!(info.result, RESULT_SUCCESS);
        assert_eq!(info.key_info.data_size, 2);
        assert_eq!(info.key_info.data_type, DataFormat::FixedSigned7_8.type_code());

        let data = call(&mut smc, WireRecord::read_bytes(tc0p, info.key_info));
        assert_eq!(codec::decode(data.data(), DataFormat::FixedSigned7_8), 45.5);
    }

    #[test]
    fn test_missing_key() {
        let mut smc = EmulatedSmc::macbook_pro();
        smc.open().unwrap();
        let rec = call(&mut smc, WireRecord::read_key_info(RegisterKey::from_bytes(*b"TZ9Z")));
        assert_eq!(rec.result, RESULT_KEY_NOT_FOUND);
    }

    #[test]
    fn test_read_only_write_is_rejected() {
        let mut smc = EmulatedSmc::macbook_pro();
        smc.open().unwrap();
        let key = RegisterKey::from_bytes(*b"F0Mx");
        let info = call(&mut smc, WireRecord::read_key_info(key)).key_info;
        let rec = call(&mut smc, WireRecord::write_bytes(key, info, &[0, 0]));
        assert_eq!(rec.result, RESULT_REJECTED);
        assert_eq!(smc.value(key), Some(6000.0));
    }

    #[test]
    fn test_index_enumeration_lists_key_count_first() {
        let mut smc = EmulatedSmc::legacy();
        smc.open().unwrap();
        assert_eq!(call(&mut smc, WireRecord::read_index(0)).key, RegisterKey::KEY_COUNT);
        let past_end = call(&mut smc, WireRecord::read_index(10_000));
        assert_eq!(past_end.result, RESULT_KEY_NOT_FOUND);
    }

    #[test]
    fn test_open_failure_injection() {
        let mut smc = EmulatedSmc::macbook_pro();
        smc.set_open_failure(Some(OpenFailure::PermissionDenied));
        assert!(matches!(smc.open(), Err(SmcError::PermissionDenied(_))));
        smc.set_open_failure(None);
        assert!(smc.open().is_ok());
        assert!(smc.is_open());
    }
}
