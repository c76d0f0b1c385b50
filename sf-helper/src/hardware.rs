//! Hardware Service
//!
//! Owns the single SMC device. Every exchange runs on the blocking pool behind
//! one mutex, so requests from all clients are strictly serialised.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sf_core::constants;
use sf_core::smc::{RegisterKey, SmcDevice, SmcDriver};
use sf_core::{Result, SmcError};
use sf_protocol::{FanInfo, HelperStatus, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

/// Cached temperature key list with timestamp
struct KeyCache {
    keys: Vec<String>,
    cached_at: Instant,
}

pub struct HardwareService {
    device: Arc<Mutex<SmcDevice>>,
    driver: &'static str,
    sessions: AtomicUsize,
    keys: Mutex<Option<KeyCache>>,
    key_ttl: Duration,
}

impl HardwareService {
    pub fn new(driver: Box<dyn SmcDriver>) -> Self {
        let device = SmcDevice::new(driver);
        let driver = device.driver_name();
        Self {
            device: Arc::new(Mutex::new(device)),
            driver,
            sessions: AtomicUsize::new(0),
            keys: Mutex::new(None),
            key_ttl: constants::cache::KEY_LIST_TTL,
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Run `op` on the blocking pool with the device locked, opening it first
    /// when `open` is set.
    async fn run<T, F>(&self, open: bool, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SmcDevice) -> Result<T> + Send + 'static,
    {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            let mut device = device.lock();
            if open && !device.is_open() {
                device.open()?;
            }
            op(&mut device)
        })
        .await
        .map_err(|e| SmcError::generic(format!("hardware task failed: {}", e)))?
    }

    pub async fn connect(&self) -> Result<()> {
        self.run(true, |_| Ok(())).await?;
        let sessions = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!("SMC channel open ({} sessions)", sessions);
        Ok(())
    }

    /// Drop one session; the channel closes when the last one goes.
    ///
    /// A disconnect without a matching connect changes nothing, so it cannot
    /// close a channel that lazy operations opened.
    pub async fn disconnect(&self) -> Result<()> {
        let previous = match self
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous,
            Err(_) => {
                debug!("Disconnect without an open session ignored");
                return Ok(());
            }
        };
        if previous == 1 {
            self.run(false, |device| {
                device.close();
                Ok(())
            })
            .await?;
            *self.keys.lock() = None;
            info!("SMC channel closed");
        } else {
            debug!("SMC session released ({} remain)", previous - 1);
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> Result<bool> {
        self.run(false, |device| Ok(device.is_open())).await
    }

    pub async fn read_key(&self, key: &str) -> Result<f64> {
        let reg = RegisterKey::parse(key)?;
        let result = self.run(true, move |device| device.read_value(reg)).await;
        match &result {
            Ok(value) => debug!("READ {} = {}", reg, value),
            Err(e) => warn!("READ {} failed: {}", reg, e),
        }
        result
    }

    /// Readable temperature keys, cached for the key-list TTL.
    pub async fn temperature_keys(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.keys.lock().as_ref() {
            if cached.cached_at.elapsed() < self.key_ttl {
                return Ok(cached.keys.clone());
            }
        }

        let keys: Vec<String> = self
            .run(true, |device| device.temperature_keys())
            .await
            .map_err(|e| {
                warn!("Temperature key enumeration failed: {}", e);
                e
            })?
            .into_iter()
            .map(|k| k.to_string())
            .collect();

        info!("Enumerated {} temperature keys", keys.len());
        *self.keys.lock() = Some(KeyCache {
            keys: keys.clone(),
            cached_at: Instant::now(),
        });
        Ok(keys)
    }

    pub async fn fan_count(&self) -> Result<u8> {
        self.run(true, |device| device.fan_count()).await
    }

    pub async fn fan_info(&self, index: u8) -> Result<FanInfo> {
        let result = self.run(true, move |device| device.fan_info(index)).await;
        if let Err(e) = &result {
            warn!("FAN {} info failed: {}", index, e);
        }
        result
    }

    pub async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()> {
        let result = self
            .run(true, move |device| device.set_fan_speed(index, rpm))
            .await;
        match &result {
            Ok(()) => info!("FAN {} -> {:.0} RPM", index, rpm),
            Err(e) => warn!("FAN {} -> {:.0} RPM failed: {}", index, rpm, e),
        }
        result
    }

    pub async fn set_fan_auto(&self, index: u8) -> Result<()> {
        let result = self.run(true, move |device| device.set_fan_auto(index)).await;
        match &result {
            Ok(()) => info!("FAN {} -> auto", index),
            Err(e) => warn!("FAN {} -> auto failed: {}", index, e),
        }
        result
    }

    pub async fn status(&self) -> Result<HelperStatus> {
        let connected = self.is_connected().await?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(HelperStatus {
            version: constants::helper::VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            connected,
            timestamp,
            driver: self.driver.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::smc::{EmulatedSmc, OpenFailure};

    fn service() -> (HardwareService, EmulatedSmc) {
        let smc = EmulatedSmc::macbook_pro();
        (HardwareService::new(Box::new(smc.clone())), smc)
    }

    #[tokio::test]
    async fn test_sessions_close_channel_at_zero() {
        let (hw, smc) = service();
        hw.connect().await.unwrap();
        hw.connect().await.unwrap();
        assert_eq!(hw.sessions(), 2);

        hw.disconnect().await.unwrap();
        assert!(smc.is_open());
        hw.disconnect().await.unwrap();
        assert!(!smc.is_open());
        assert_eq!(hw.sessions(), 0);

        // extra disconnects are harmless
        hw.disconnect().await.unwrap();
        assert_eq!(hw.sessions(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_disconnect_keeps_lazy_channel() {
        let (hw, smc) = service();
        assert_eq!(hw.read_key("TC0P").await.unwrap(), 45.5);
        assert!(smc.is_open());

        hw.disconnect().await.unwrap();
        assert!(smc.is_open());
        assert_eq!(hw.sessions(), 0);
    }

    #[tokio::test]
    async fn test_operations_open_lazily() {
        let (hw, smc) = service();
        assert!(!hw.is_connected().await.unwrap());
        assert_eq!(hw.read_key("TC0P").await.unwrap(), 45.5);
        assert!(smc.is_open());
    }

    #[tokio::test]
    async fn test_key_list_is_cached() {
        let (hw, smc) = service();
        let keys = hw.temperature_keys().await.unwrap();
        assert!(keys.contains(&"TC0P".to_string()));
        let exchanges = smc.exchange_count();

        assert_eq!(hw.temperature_keys().await.unwrap(), keys);
        assert_eq!(smc.exchange_count(), exchanges);
    }

    #[tokio::test]
    async fn test_open_failure_surfaces() {
        let (hw, smc) = service();
        smc.set_open_failure(Some(OpenFailure::PermissionDenied));
        let err = hw.connect().await.unwrap_err();
        assert!(matches!(err, SmcError::PermissionDenied(_)));
        assert_eq!(hw.sessions(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_driver() {
        let (hw, _smc) = service();
        let status = hw.status().await.unwrap();
        assert_eq!(status.driver, "emulated");
        assert_eq!(status.protocol_version, PROTOCOL_VERSION);
        assert!(!status.connected);
    }
}
