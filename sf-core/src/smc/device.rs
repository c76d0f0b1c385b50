//! Register-level operations on top of a raw connection
//!
//! This is what the privileged helper drives: typed key reads and writes, fan
//! descriptors, forced/automatic fan mode and temperature key enumeration.

use std::collections::HashMap;

use sf_protocol::FanInfo;
use tracing::{debug, info};

use super::codec::{self, DataFormat};
use super::connection::SmcConnection;
use super::driver::SmcDriver;
use super::key::RegisterKey;
use super::wire::{KeyInfo, WireRecord, RESULT_KEY_NOT_FOUND, RESULT_SUCCESS};
use crate::error::{Result, SmcError};

pub struct SmcDevice {
    conn: SmcConnection<Box<dyn SmcDriver>>,
    key_info: HashMap<RegisterKey, KeyInfo>,
}

impl SmcDevice {
    pub fn new(driver: Box<dyn SmcDriver>) -> Self {
        Self {
            conn: SmcConnection::new(driver),
            key_info: HashMap::new(),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.conn.open()
    }

    pub fn close(&mut self) {
        self.conn.close();
        self.key_info.clear();
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    pub fn driver_name(&self) -> &'static str {
        self.conn.driver_name()
    }

    /// Key metadata, or `None` when the firmware does not know the key.
    fn lookup(&mut self, key: RegisterKey) -> Result<Option<KeyInfo>> {
        if let Some(info) = self.key_info.get(&key) {
            return Ok(Some(*info));
        }

        let reply = self.conn.call(&WireRecord::read_key_info(key))?;
        match reply.result {
            RESULT_SUCCESS => {
                self.key_info.insert(key, reply.key_info);
                Ok(Some(reply.key_info))
            }
            RESULT_KEY_NOT_FOUND => Ok(None),
            code => Err(SmcError::read_failed(
                key.to_string(),
                format!("key info result 0x{:02x}", code),
            )),
        }
    }

    pub fn key_info(&mut self, key: RegisterKey) -> Result<KeyInfo> {
        self.lookup(key)?
            .ok_or_else(|| SmcError::read_failed(key.to_string(), "key not found"))
    }

    pub fn read_value(&mut self, key: RegisterKey) -> Result<f64> {
        let info = self.key_info(key)?;
        let format = DataFormat::from_type_code(info.data_type)?;

        let reply = self.conn.call(&WireRecord::read_bytes(key, info))?;
        if reply.result != RESULT_SUCCESS {
            return Err(SmcError::read_failed(
                key.to_string(),
                format!("read result 0x{:02x}", reply.result),
            ));
        }

        let width = (info.data_size as usize).min(reply.payload.len());
        codec::try_decode(&reply.payload[..width], format)
            .map_err(|e| SmcError::read_failed(key.to_string(), e.to_string()))
    }

    pub fn write_value(&mut self, key: RegisterKey, value: f64) -> Result<()> {
        let info = self
            .lookup(key)?
            .ok_or_else(|| SmcError::write_failed(key.to_string(), "key not found"))?;
        let format = DataFormat::from_type_code(info.data_type)?;
        let bytes = codec::encode(value, format);

        let reply = self.conn.call(&WireRecord::write_bytes(key, info, &bytes))?;
        if reply.result != RESULT_SUCCESS {
            return Err(SmcError::write_failed(
                key.to_string(),
                format!("write result 0x{:02x}", reply.result),
            ));
        }
        debug!("Wrote {} = {} ({})", key, value, format);
        Ok(())
    }

    pub fn key_count(&mut self) -> Result<u32> {
        Ok(self.read_value(RegisterKey::KEY_COUNT)? as u32)
    }

    pub fn key_at(&mut self, index: u32) -> Result<RegisterKey> {
        let reply = self.conn.call(&WireRecord::read_index(index))?;
        if reply.result != RESULT_SUCCESS {
            return Err(SmcError::read_failed(
                format!("#{}", index),
                format!("index result 0x{:02x}", reply.result),
            ));
        }
        Ok(reply.key)
    }

    /// Every readable temperature key, in firmware order.
    pub fn temperature_keys(&mut self) -> Result<Vec<RegisterKey>> {
        let count = self.key_count()?;
        let mut keys = Vec::new();
        for index in 0..count {
            let key = match self.key_at(index) {
                Ok(key) => key,
                Err(e) => {
                    debug!("Stopping key enumeration at {}: {}", index, e);
                    break;
                }
            };
            if key.is_temperature() && self.read_value(key).is_ok() {
                keys.push(key);
            }
        }
        info!("Enumerated {} temperature keys out of {}", keys.len(), count);
        Ok(keys)
    }

    pub fn fan_count(&mut self) -> Result<u8> {
        let n = self.read_value(RegisterKey::FAN_COUNT)?;
        Ok(n.clamp(0.0, (sf_protocol::MAX_FAN_INDEX + 1) as f64) as u8)
    }

    fn check_fan(&mut self, index: u8) -> Result<()> {
        let count = self.fan_count()?;
        if index >= count {
            return Err(SmcError::InvalidFanIndex { index, count });
        }
        Ok(())
    }

    pub fn fan_info(&mut self, index: u8) -> Result<FanInfo> {
        self.check_fan(index)?;
        Ok(FanInfo {
            min: self.read_value(RegisterKey::fan(index, "Mn")?)?,
            max: self.read_value(RegisterKey::fan(index, "Mx")?)?,
            current: self.read_value(RegisterKey::fan(index, "Ac")?)?,
        })
    }

    /// Force a fan to a target speed.
    pub fn set_fan_speed(&mut self, index: u8, rpm: f64) -> Result<()> {
        let info = self.fan_info(index)?;
        if !info.contains(rpm) {
            return Err(SmcError::FanSpeedOutOfRange {
                index,
                rpm,
                min: info.min,
                max: info.max,
            });
        }

        self.set_forced(index, true)?;
        self.write_value(RegisterKey::fan(index, "Tg")?, rpm)?;
        info!("Fan {} forced to {:.0} RPM", index, rpm);
        Ok(())
    }

    /// Hand a fan back to firmware control.
    pub fn set_fan_auto(&mut self, index: u8) -> Result<()> {
        self.check_fan(index)?;
        self.set_forced(index, false)?;
        info!("Fan {} returned to automatic mode", index);
        Ok(())
    }

    /// `F{i}Md` where present, else bit `i` of the `FS! ` mask.
    fn set_forced(&mut self, index: u8, forced: bool) -> Result<()> {
        let mode_key = RegisterKey::fan(index, "Md")?;
        if self.lookup(mode_key)?.is_some() {
            return self.write_value(mode_key, if forced { 1.0 } else { 0.0 });
        }

        let mask = self.read_value(RegisterKey::FORCE_BITS)? as u16;
        let bit = 1u16 << index;
        let mask = if forced { mask | bit } else { mask & !bit };
        self.write_value(RegisterKey::FORCE_BITS, mask as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::emulated::EmulatedSmc;

    fn open_device(smc: &EmulatedSmc) -> SmcDevice {
        let mut dev = SmcDevice::new(Box::new(smc.clone()));
        dev.open().unwrap();
        dev
    }

    fn key(s: &str) -> RegisterKey {
        RegisterKey::parse(s).unwrap()
    }

    #[test]
    fn test_read_temperature() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        assert_eq!(dev.read_value(key("TC0P")).unwrap(), 45.5);
    }

    #[test]
    fn test_key_info_is_cached() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        dev.read_value(key("TC0P")).unwrap();
        let after_first = smc.exchange_count();
        dev.read_value(key("TC0P")).unwrap();
        // second read skips the key-info exchange
        assert_eq!(smc.exchange_count() - after_first, 1);
    }

    #[test]
    fn test_missing_key_is_read_failure() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        let err = dev.read_value(key("TZ9Z")).unwrap_err();
        assert!(matches!(err, SmcError::ReadFailed { ref key, .. } if key == "TZ9Z"));
    }

    #[test]
    fn test_fan_info() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        assert_eq!(dev.fan_count().unwrap(), 2);
        let fan = dev.fan_info(1).unwrap();
        assert_eq!(fan.min, 1300.0);
        assert_eq!(fan.max, 5500.0);
        assert!(matches!(
            dev.fan_info(2),
            Err(SmcError::InvalidFanIndex { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_set_speed_uses_mode_key() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        dev.set_fan_speed(0, 3000.0).unwrap();
        assert_eq!(smc.value(key("F0Md")), Some(1.0));
        assert_eq!(smc.value(key("F0Tg")), Some(3000.0));
        assert_eq!(smc.value(key("F0Ac")), Some(3000.0));

        dev.set_fan_auto(0).unwrap();
        assert_eq!(smc.value(key("F0Md")), Some(0.0));
    }

    #[test]
    fn test_set_speed_falls_back_to_force_mask() {
        let smc = EmulatedSmc::legacy();
        let mut dev = open_device(&smc);
        dev.set_fan_speed(0, 2500.0).unwrap();
        assert_eq!(smc.value(RegisterKey::FORCE_BITS), Some(1.0));
        dev.set_fan_auto(0).unwrap();
        assert_eq!(smc.value(RegisterKey::FORCE_BITS), Some(0.0));
    }

    #[test]
    fn test_out_of_range_speed_writes_nothing() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        let err = dev.set_fan_speed(0, 9000.0).unwrap_err();
        assert!(matches!(err, SmcError::FanSpeedOutOfRange { index: 0, .. }));
        assert_eq!(smc.value(key("F0Md")), Some(0.0));
    }

    #[test]
    fn test_temperature_keys() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        let keys = dev.temperature_keys().unwrap();
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"TC0P".to_string()));
        assert!(names.iter().all(|k| k.starts_with('T')));
    }

    #[test]
    fn test_close_then_read() {
        let smc = EmulatedSmc::macbook_pro();
        let mut dev = open_device(&smc);
        dev.close();
        assert!(matches!(dev.read_value(key("TC0P")), Err(SmcError::NotConnected)));
    }
}
