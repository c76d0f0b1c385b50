//! Sensor backends
//!
//! The façade talks to exactly one backend at a time: the helper, when the
//! permission probe succeeded, or the fallback generator otherwise.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sf_protocol::FanInfo;

use crate::error::{Result, SmcError};
use crate::fallback::FallbackGenerator;
use crate::helper_client::HelperTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Real,
    Simulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => f.write_str("real"),
            Self::Simulated => f.write_str("simulated"),
        }
    }
}

#[async_trait]
pub trait SensorBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    async fn read_temperature(&self, key: &str) -> Result<f64>;
    async fn temperature_keys(&self) -> Result<Vec<String>>;
    async fn fan_count(&self) -> Result<u8>;
    async fn fan_info(&self, index: u8) -> Result<FanInfo>;
    async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()>;
    async fn set_fan_auto_mode(&self, index: u8) -> Result<()>;
}

/// Hardware through the privileged helper.
pub struct RealBackend {
    transport: Arc<dyn HelperTransport>,
}

impl RealBackend {
    pub fn new(transport: Arc<dyn HelperTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SensorBackend for RealBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn read_temperature(&self, key: &str) -> Result<f64> {
        self.transport.read_key(key).await
    }

    async fn temperature_keys(&self) -> Result<Vec<String>> {
        self.transport.read_all_temperature_keys().await
    }

    async fn fan_count(&self) -> Result<u8> {
        self.transport.get_fan_count().await
    }

    async fn fan_info(&self, index: u8) -> Result<FanInfo> {
        self.transport.get_fan_info(index).await
    }

    async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()> {
        self.transport.set_fan_speed(index, rpm).await
    }

    async fn set_fan_auto_mode(&self, index: u8) -> Result<()> {
        self.transport.set_fan_auto_mode(index).await
    }
}

/// Generated readings; only an out-of-range fan index fails.
pub struct SimulatedBackend {
    generator: Arc<FallbackGenerator>,
}

impl SimulatedBackend {
    pub fn new(generator: Arc<FallbackGenerator>) -> Self {
        Self { generator }
    }

    fn check_index(&self, index: u8) -> Result<()> {
        let count = self.generator.fan_count();
        if index >= count {
            return Err(SmcError::InvalidFanIndex { index, count });
        }
        Ok(())
    }
}

#[async_trait]
impl SensorBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn read_temperature(&self, key: &str) -> Result<f64> {
        Ok(self.generator.temperature(key))
    }

    async fn temperature_keys(&self) -> Result<Vec<String>> {
        Ok(self.generator.temperature_keys())
    }

    async fn fan_count(&self) -> Result<u8> {
        Ok(self.generator.fan_count())
    }

    async fn fan_info(&self, index: u8) -> Result<FanInfo> {
        self.check_index(index)?;
        Ok(self.generator.fan_info(index))
    }

    async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()> {
        self.check_index(index)?;
        self.generator.set_target(index, rpm);
        Ok(())
    }

    async fn set_fan_auto_mode(&self, index: u8) -> Result<()> {
        self.check_index(index)?;
        self.generator.clear_target(index);
        Ok(())
    }
}
