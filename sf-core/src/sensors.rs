//! Catalog of well-known temperature keys
//!
//! Names and ranges used for display and for simulated readings. Keys not in
//! the table are treated as a generic sensor.

use serde::Serialize;

use crate::constants::fallback::{GENERIC_BASE_CELSIUS, GENERIC_MAX_CELSIUS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorClass {
    Cpu,
    Gpu,
    Ambient,
    Memory,
    Battery,
    Storage,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub class: SensorClass,
    /// Idle reading used by the fallback generator
    pub base_celsius: f64,
    /// Upper bound of the documented range
    pub max_celsius: f64,
}

pub const KNOWN_SENSORS: &[SensorDescriptor] = &[
    SensorDescriptor { key: "TC0P", name: "CPU Proximity", class: SensorClass::Cpu, base_celsius: 45.0, max_celsius: 100.0 },
    SensorDescriptor { key: "TC0D", name: "CPU Die", class: SensorClass::Cpu, base_celsius: 48.0, max_celsius: 100.0 },
    SensorDescriptor { key: "TC0E", name: "CPU Core 1", class: SensorClass::Cpu, base_celsius: 47.0, max_celsius: 100.0 },
    SensorDescriptor { key: "TC0F", name: "CPU Core 2", class: SensorClass::Cpu, base_celsius: 47.0, max_celsius: 100.0 },
    SensorDescriptor { key: "TG0P", name: "GPU Proximity", class: SensorClass::Gpu, base_celsius: 50.0, max_celsius: 105.0 },
    SensorDescriptor { key: "TG0D", name: "GPU Die", class: SensorClass::Gpu, base_celsius: 52.0, max_celsius: 105.0 },
    SensorDescriptor { key: "TA0P", name: "Ambient", class: SensorClass::Ambient, base_celsius: 25.0, max_celsius: 60.0 },
    SensorDescriptor { key: "Tm0P", name: "Memory Proximity", class: SensorClass::Memory, base_celsius: 38.0, max_celsius: 90.0 },
    SensorDescriptor { key: "TB0T", name: "Battery", class: SensorClass::Battery, base_celsius: 30.0, max_celsius: 60.0 },
    SensorDescriptor { key: "TH0P", name: "Storage Proximity", class: SensorClass::Storage, base_celsius: 35.0, max_celsius: 80.0 },
    SensorDescriptor { key: "Ts0P", name: "Palm Rest", class: SensorClass::Other, base_celsius: 30.0, max_celsius: 60.0 },
    SensorDescriptor { key: "TW0P", name: "Wireless Module", class: SensorClass::Other, base_celsius: 40.0, max_celsius: 85.0 },
];

const GENERIC: SensorDescriptor = SensorDescriptor {
    key: "????",
    name: "Temperature Sensor",
    class: SensorClass::Other,
    base_celsius: GENERIC_BASE_CELSIUS,
    max_celsius: GENERIC_MAX_CELSIUS,
};

pub fn lookup(key: &str) -> Option<&'static SensorDescriptor> {
    KNOWN_SENSORS.iter().find(|s| s.key == key)
}

/// Catalog entry for `key`, or the generic sensor.
pub fn describe(key: &str) -> SensorDescriptor {
    lookup(key).copied().unwrap_or(GENERIC)
}

/// Keys polled when the helper cannot enumerate its own.
pub fn default_keys() -> Vec<String> {
    KNOWN_SENSORS.iter().map(|s| s.key.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_key() {
        let s = describe("TC0P");
        assert_eq!(s.class, SensorClass::Cpu);
        assert_eq!(s.max_celsius, 100.0);
    }

    #[test]
    fn test_unknown_key_is_generic() {
        let s = describe("TZ9Z");
        assert_eq!(s.class, SensorClass::Other);
        assert_eq!(s.max_celsius, 105.0);
        assert!(lookup("TZ9Z").is_none());
    }

    #[test]
    fn test_catalog_is_well_formed() {
        assert_eq!(KNOWN_SENSORS.len(), 12);
        for s in KNOWN_SENSORS {
            assert_eq!(s.key.len(), 4);
            assert!(s.key.starts_with('T'));
            assert!(s.base_celsius < s.max_celsius);
        }
    }
}
