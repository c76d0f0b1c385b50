//! Simulated readings
//!
//! Plausible values served when the hardware cannot be reached. Nothing here
//! fails: temperatures stay within the sensor's documented range and fan
//! speeds within the fan's limits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sf_protocol::FanInfo;
use sysinfo::System;

use crate::constants::fallback::{
    FAN_COUNT, FAN_JITTER_RPM, FAN_MAX_RPM, FAN_MIN_RPM, LOAD_TEMPERATURE_OFFSET,
    TEMPERATURE_JITTER,
};
use crate::sensors;

/// Share of the fan range a fully loaded machine would use
const FAN_LOAD_SHARE: f64 = 0.6;

/// System load normalised to `[0, 1]`.
pub trait LoadSource: Send + Sync {
    fn load(&self) -> f64;
}

/// One-minute load average divided by the CPU count.
pub struct SystemLoad {
    cpus: usize,
}

impl SystemLoad {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            cpus: sys.cpus().len().max(1),
        }
    }
}

impl Default for SystemLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for SystemLoad {
    fn load(&self) -> f64 {
        let avg = System::load_average();
        (avg.one / self.cpus as f64).clamp(0.0, 1.0)
    }
}

/// A constant load, for tests and for hosts without load averages.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn load(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

pub struct FallbackGenerator {
    load: Arc<dyn LoadSource>,
    fans: Vec<(f64, f64)>,
    targets: Mutex<HashMap<u8, f64>>,
    tick: AtomicU64,
}

impl FallbackGenerator {
    pub fn new(load: Arc<dyn LoadSource>) -> Self {
        Self::with_fans(load, vec![(FAN_MIN_RPM, FAN_MAX_RPM); FAN_COUNT as usize])
    }

    /// Generator with explicit `(min, max)` fan limits.
    pub fn with_fans(load: Arc<dyn LoadSource>, fans: Vec<(f64, f64)>) -> Self {
        Self {
            load,
            fans,
            targets: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    /// Bounded, deterministic wobble in `[-amplitude, amplitude]`.
    fn jitter(&self, seed: u64, amplitude: f64) -> f64 {
        let t = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
        amplitude * ((seed % 997) as f64 * 0.37 + t * 0.7).sin()
    }

    pub fn temperature(&self, key: &str) -> f64 {
        let sensor = sensors::describe(key);
        let load = self.load.load();
        let value = sensor.base_celsius
            + load * LOAD_TEMPERATURE_OFFSET
            + self.jitter(seed(key), TEMPERATURE_JITTER);
        value.clamp(0.0, sensor.max_celsius)
    }

    pub fn temperature_keys(&self) -> Vec<String> {
        sensors::default_keys()
    }

    pub fn fan_count(&self) -> u8 {
        self.fans.len().min(u8::MAX as usize) as u8
    }

    fn limits(&self, index: u8) -> (f64, f64) {
        self.fans
            .get(index as usize)
            .copied()
            .unwrap_or((FAN_MIN_RPM, FAN_MAX_RPM))
    }

    pub fn fan_info(&self, index: u8) -> FanInfo {
        let (min, max) = self.limits(index);
        let current = match self.targets.lock().get(&index) {
            Some(&target) => target,
            None => {
                let load = self.load.load();
                min + load * (max - min) * FAN_LOAD_SHARE
                    + self.jitter(index as u64 + 1, FAN_JITTER_RPM)
            }
        };
        FanInfo {
            min,
            max,
            current: current.clamp(min, max),
        }
    }

    /// Remember a manual target; later reads report it.
    pub fn set_target(&self, index: u8, rpm: f64) {
        let (min, max) = self.limits(index);
        self.targets.lock().insert(index, rpm.clamp(min, max));
    }

    pub fn clear_target(&self, index: u8) {
        self.targets.lock().remove(&index);
    }
}

/// FNV-1a over the key bytes
fn seed(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}
