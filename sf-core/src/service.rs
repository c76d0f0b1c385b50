//! SMC Service
//!
//! The single entry point for consumers. Reads go through the TTL caches,
//! then the selected backend; failures run through the recovery policy and,
//! for monitoring reads, end at the fallback generator instead of an error.
//!
//! ```no_run
//! # async fn demo() -> sf_core::Result<()> {
//! use sf_core::{SmcService, SmcSettings};
//!
//! let service = SmcService::new(SmcSettings::default());
//! let _ = service.connect().await;
//! let cpu = service.read_temperature("TC0P").await?;
//! println!("CPU proximity: {:.1}°C", cpu);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use sf_protocol::{validate_key, FanInfo, HelperStatus};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, RealBackend, SensorBackend, SimulatedBackend};
use crate::cache::TtlCache;
use crate::constants;
use crate::error::{Result, SmcError};
use crate::fallback::{FallbackGenerator, LoadSource, SystemLoad};
use crate::helper_client::{HelperClient, HelperTransport};
use crate::optimizer::{
    CacheMaintenance, CleanupReport, PerformanceOptimizer, PerformanceSnapshot, Suggestion,
};
use crate::permission::{PermissionProber, PermissionState};
use crate::pool::PoolMetrics;
use crate::recovery::{RecoveryAction, RecoveryPolicy};
use crate::sensors;
use crate::settings::SmcSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub key: String,
    pub name: String,
    pub celsius: f64,
    /// Produced by the fallback generator rather than the hardware
    pub simulated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FanReading {
    pub index: u8,
    pub info: FanInfo,
    pub simulated: bool,
}

/// Cheap to clone; clones share caches, backend and statistics.
#[derive(Clone)]
pub struct SmcService {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn HelperTransport>,
    prober: PermissionProber,
    policy: RecoveryPolicy,
    backend: RwLock<Arc<dyn SensorBackend>>,
    real: Arc<dyn SensorBackend>,
    simulated: Arc<dyn SensorBackend>,
    generator: Arc<FallbackGenerator>,
    temperatures: Arc<TtlCache<String, (f64, bool)>>,
    fans: Arc<TtlCache<u8, (FanInfo, bool)>>,
    fan_count: Arc<TtlCache<(), (u8, bool)>>,
    keys: Arc<TtlCache<(), (Vec<String>, bool)>>,
    optimizer: Arc<PerformanceOptimizer>,
    settings: SmcSettings,
    reprobe_pending: AtomicBool,
    /// Bumped after every fan write; reads started before it are not cached.
    fan_writes: AtomicU64,
}

impl SmcService {
    /// Service talking to the helper socket named in `settings`.
    pub fn new(settings: SmcSettings) -> Self {
        let client = Arc::new(HelperClient::from_settings(&settings));
        let pool = client.pool_metrics();
        Self::with_parts(client, Some(pool), settings, Arc::new(SystemLoad::new()))
    }

    pub fn with_transport(
        transport: Arc<dyn HelperTransport>,
        settings: SmcSettings,
        load: Arc<dyn LoadSource>,
    ) -> Self {
        Self::with_parts(transport, None, settings, load)
    }

    fn with_parts(
        transport: Arc<dyn HelperTransport>,
        pool: Option<Arc<dyn PoolMetrics>>,
        settings: SmcSettings,
        load: Arc<dyn LoadSource>,
    ) -> Self {
        let max = settings.cache.max_entries;
        let temperatures = Arc::new(TtlCache::new(settings.temperature_ttl(), max));
        let fans = Arc::new(TtlCache::new(settings.fan_ttl(), max));
        let fan_count = Arc::new(TtlCache::new(settings.fan_ttl(), 1));
        let keys = Arc::new(TtlCache::new(constants::cache::KEY_LIST_TTL, 1));

        let caches: Vec<Arc<dyn CacheMaintenance>> = vec![
            temperatures.clone() as Arc<dyn CacheMaintenance>,
            fans.clone() as Arc<dyn CacheMaintenance>,
            fan_count.clone() as Arc<dyn CacheMaintenance>,
            keys.clone() as Arc<dyn CacheMaintenance>,
        ];
        let optimizer = Arc::new(PerformanceOptimizer::new(
            caches,
            pool,
            settings.pool.min_idle,
            settings.cleanup_interval(),
        ));

        let generator = Arc::new(FallbackGenerator::new(load));
        let real: Arc<dyn SensorBackend> = Arc::new(RealBackend::new(transport.clone()));
        let simulated: Arc<dyn SensorBackend> = Arc::new(SimulatedBackend::new(generator.clone()));

        Self {
            inner: Arc::new(Inner {
                transport,
                prober: PermissionProber::new(),
                policy: RecoveryPolicy::new(settings.reprobe_backoff()),
                backend: RwLock::new(simulated.clone()),
                real,
                simulated,
                generator,
                temperatures,
                fans,
                fan_count,
                keys,
                optimizer,
                settings,
                reprobe_pending: AtomicBool::new(false),
                fan_writes: AtomicU64::new(0),
            }),
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Probe the channel and pick the backend.
    ///
    /// The probe error, if any, is returned here and only here; reads keep
    /// working from the simulated backend.
    pub async fn connect(&self) -> Result<PermissionState> {
        let (state, err) = self.inner.prober.probe(self.inner.transport.as_ref()).await;
        self.select_backend(state);
        match err {
            None => Ok(state),
            Some(e) => Err(e),
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.optimizer.stop();
        self.clear_caches();
        if self.backend_kind() == BackendKind::Real {
            self.inner.transport.disconnect().await?;
        }
        info!("SMC service disconnected");
        Ok(())
    }

    pub fn permission_state(&self) -> PermissionState {
        self.inner.prober.state()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend().kind()
    }

    fn backend(&self) -> Arc<dyn SensorBackend> {
        self.inner.backend.read().clone()
    }

    fn select_backend(&self, state: PermissionState) {
        let next = if state == PermissionState::Granted {
            self.inner.real.clone()
        } else {
            self.inner.simulated.clone()
        };
        let previous = {
            let mut current = self.inner.backend.write();
            std::mem::replace(&mut *current, next.clone()).kind()
        };
        if previous != next.kind() {
            self.clear_caches();
            info!("Using {} backend (permission {})", next.kind(), state);
        }
    }

    fn clear_caches(&self) {
        self.inner.temperatures.clear();
        self.inner.fans.clear();
        self.inner.fan_count.clear();
        self.inner.keys.clear();
    }

    async fn reprobe(&self) {
        let (state, _) = self.inner.prober.probe(self.inner.transport.as_ref()).await;
        self.select_backend(state);
    }

    /// At most one pending re-probe at a time.
    fn schedule_reprobe(&self, delay: Duration) {
        if self.inner.reprobe_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Re-probing SMC access in {:?}", delay);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reprobe().await;
            this.inner.reprobe_pending.store(false, Ordering::SeqCst);
        });
    }

    /// Run `op` against the current backend with the recovery policy applied.
    ///
    /// Returns the value and whether it was simulated. `fallback` receives the
    /// final error and decides between a generated value and failing.
    async fn attempt<T, Op, Fut, Fb>(&self, label: &str, op: Op, fallback: Fb) -> Result<(T, bool)>
    where
        Op: Fn(Arc<dyn SensorBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce(&FallbackGenerator, SmcError) -> Result<T>,
    {
        let mut retries = 0;
        loop {
            let backend = self.backend();
            let simulated = backend.kind() == BackendKind::Simulated;
            let started = Instant::now();
            let result = op(backend).await;
            self.inner
                .optimizer
                .record_access(label, started.elapsed(), result.is_ok());

            let err = match result {
                Ok(value) => return Ok((value, simulated)),
                Err(e) if simulated => return Err(e),
                Err(e) => e,
            };

            match self.inner.policy.classify(&err, self.permission_state(), retries) {
                RecoveryAction::Surface => return Err(err),
                RecoveryAction::RetryOnce => {
                    debug!("{} failed ({}), retrying once", label, err);
                    retries += 1;
                    continue;
                }
                RecoveryAction::Reprobe => self.schedule_reprobe(Duration::ZERO),
                RecoveryAction::DelayedReprobe(delay) => self.schedule_reprobe(delay),
                RecoveryAction::Fallback => {}
            }

            if !self.inner.settings.fallback.enabled {
                return Err(err);
            }
            warn!("{} failed after recovery: {}", label, err);
            return fallback(&self.inner.generator, err).map(|v| (v, true));
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn read_temperature(&self, key: &str) -> Result<f64> {
        self.temperature(key).await.map(|(celsius, _)| celsius)
    }

    async fn temperature(&self, key: &str) -> Result<(f64, bool)> {
        validate_key(key).map_err(SmcError::InvalidKey)?;

        let cache_key = key.to_string();
        if let Some(cached) = self.inner.temperatures.get(&cache_key) {
            self.inner.optimizer.record_cache(key, true);
            return Ok(cached);
        }
        self.inner.optimizer.record_cache(key, false);

        let reading = self
            .attempt(
                key,
                |b| async move { b.read_temperature(key).await },
                |g, _| Ok(g.temperature(key)),
            )
            .await?;
        self.inner.temperatures.insert(cache_key, reading);
        Ok(reading)
    }

    async fn temperature_keys(&self) -> Result<(Vec<String>, bool)> {
        if let Some(keys) = self.inner.keys.get(&()) {
            return Ok(keys);
        }
        let keys = self
            .attempt(
                "keys",
                |b| async move { b.temperature_keys().await },
                |g, _| Ok(g.temperature_keys()),
            )
            .await?;
        self.inner.keys.insert((), keys.clone());
        Ok(keys)
    }

    pub async fn fan_count(&self) -> Result<u8> {
        self.fan_count_reading().await.map(|(count, _)| count)
    }

    async fn fan_count_reading(&self) -> Result<(u8, bool)> {
        if let Some(count) = self.inner.fan_count.get(&()) {
            return Ok(count);
        }
        let count = self
            .attempt(
                "FNum",
                |b| async move { b.fan_count().await },
                |g, _| Ok(g.fan_count()),
            )
            .await?;
        self.inner.fan_count.insert((), count);
        Ok(count)
    }

    async fn check_fan_index(&self, index: u8) -> Result<()> {
        let count = self.fan_count().await?;
        if index >= count {
            return Err(SmcError::InvalidFanIndex { index, count });
        }
        Ok(())
    }

    pub async fn fan_info(&self, index: u8) -> Result<FanInfo> {
        self.fan_reading(index).await.map(|r| r.info)
    }

    async fn fan_reading(&self, index: u8) -> Result<FanReading> {
        self.check_fan_index(index).await?;

        let label = format!("F{}", index);
        if let Some((info, simulated)) = self.inner.fans.get(&index) {
            self.inner.optimizer.record_cache(&label, true);
            return Ok(FanReading { index, info, simulated });
        }
        self.inner.optimizer.record_cache(&label, false);

        let writes = self.inner.fan_writes.load(Ordering::SeqCst);
        let (info, simulated) = self
            .attempt(
                &label,
                |b| async move { b.fan_info(index).await },
                |g, _| Ok(g.fan_info(index)),
            )
            .await?;
        if self.inner.fan_writes.load(Ordering::SeqCst) == writes {
            self.inner.fans.insert(index, (info, simulated));
        } else {
            debug!("Fan {} changed during read, not caching", index);
        }
        Ok(FanReading { index, info, simulated })
    }

    /// Every known temperature; keys that cannot be read are skipped.
    pub async fn all_temperatures(&self) -> Result<Vec<TemperatureReading>> {
        let (keys, _) = self.temperature_keys().await?;
        let mut readings = Vec::with_capacity(keys.len());
        for key in keys {
            match self.temperature(&key).await {
                Ok((celsius, simulated)) => readings.push(TemperatureReading {
                    name: sensors::describe(&key).name.to_string(),
                    key,
                    celsius,
                    simulated,
                }),
                Err(e) => debug!("Skipping {}: {}", key, e),
            }
        }
        Ok(readings)
    }

    pub async fn all_fans(&self) -> Result<Vec<FanReading>> {
        let count = self.fan_count().await?;
        let mut fans = Vec::with_capacity(count as usize);
        for index in 0..count {
            fans.push(self.fan_reading(index).await?);
        }
        Ok(fans)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Force a fan to `rpm`.
    ///
    /// The range is checked against the fan's descriptor before anything is
    /// sent to the helper.
    pub async fn set_fan_speed(&self, index: u8, rpm: f64) -> Result<()> {
        let info = self.fan_info(index).await?;
        if !info.contains(rpm) {
            return Err(SmcError::FanSpeedOutOfRange {
                index,
                rpm,
                min: info.min,
                max: info.max,
            });
        }

        let label = format!("F{}Tg", index);
        self.attempt(
            &label,
            |b| async move { b.set_fan_speed(index, rpm).await },
            |_, e| Err(e),
        )
        .await?;

        self.fan_written(index);
        info!("Fan {} set to {:.0} RPM", index, rpm);
        Ok(())
    }

    pub async fn set_fan_auto_mode(&self, index: u8) -> Result<()> {
        self.check_fan_index(index).await?;

        let label = format!("F{}Md", index);
        self.attempt(
            &label,
            |b| async move { b.set_fan_auto_mode(index).await },
            |_, e| Err(e),
        )
        .await?;

        self.fan_written(index);
        info!("Fan {} returned to automatic control", index);
        Ok(())
    }

    fn fan_written(&self, index: u8) {
        self.inner.fan_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.fans.invalidate(&index);
    }

    // ========================================================================
    // Helper and diagnostics
    // ========================================================================

    pub async fn helper_version(&self) -> Result<String> {
        self.inner.transport.get_version().await
    }

    pub async fn helper_status(&self) -> Result<HelperStatus> {
        self.inner.transport.check_status().await
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        self.inner.optimizer.snapshot()
    }

    pub fn optimization_suggestions(&self) -> Vec<Suggestion> {
        self.inner.optimizer.suggestions()
    }

    /// One cleanup pass now, independent of the maintenance loop.
    pub fn cleanup(&self) -> CleanupReport {
        self.inner.optimizer.cleanup()
    }

    /// Start periodic cache and pool cleanup; `None` if already running.
    pub fn start_maintenance(&self) -> Option<JoinHandle<()>> {
        self.inner.optimizer.start()
    }

    pub fn stop_maintenance(&self) {
        self.inner.optimizer.stop();
    }

    pub fn settings(&self) -> &SmcSettings {
        &self.inner.settings
    }
}
