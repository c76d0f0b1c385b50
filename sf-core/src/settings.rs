//! Application Settings
//!
//! Persistent settings stored as JSON in ~/.config/smcfan/settings.json.
//! Every field has a default, so a partial or missing file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::constants;
use crate::error::{Result, SmcError};

// ============================================================================
// Cached Settings
// ============================================================================

static SETTINGS_CACHE: OnceLock<RwLock<Option<SmcSettings>>> = OnceLock::new();

fn get_cache() -> &'static RwLock<Option<SmcSettings>> {
    SETTINGS_CACHE.get_or_init(|| RwLock::new(None))
}

/// Get cached settings, loading from disk on first use.
/// A missing or unreadable file yields defaults.
pub fn get_cached_settings() -> SmcSettings {
    if let Ok(guard) = get_cache().read() {
        if let Some(ref settings) = *guard {
            return settings.clone();
        }
    }

    let settings = load_settings().unwrap_or_else(|e| {
        tracing::warn!("Using default settings: {}", e);
        SmcSettings::default()
    });
    update_cache(&settings);
    settings
}

/// Drop the cached copy so the next access rereads the file.
pub fn invalidate_settings_cache() {
    if let Ok(mut guard) = get_cache().write() {
        *guard = None;
    }
}

fn update_cache(settings: &SmcSettings) {
    if let Ok(mut guard) = get_cache().write() {
        *guard = Some(settings.clone());
    }
}

// ============================================================================
// Settings Types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmcSettings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub ipc: IpcSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub fallback: FallbackSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Monitoring poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_temperature_ttl")]
    pub temperature_ttl_ms: u64,

    #[serde(default = "default_fan_ttl")]
    pub fan_ttl_ms: u64,

    /// Entries per cache before the oldest are evicted
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_size")]
    pub max_connections: usize,

    /// Period of the cleanup task
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Idle connections left open by cleanup
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcSettings {
    /// Overrides the platform socket path
    #[serde(default)]
    pub socket_path: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Maximum requests per second from this client
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_reprobe_backoff")]
    pub reprobe_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSettings {
    /// Serve simulated readings when the hardware is unreachable
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_poll_interval() -> u64 { constants::monitor::POLL_INTERVAL.as_millis() as u64 }
fn default_temperature_ttl() -> u64 { constants::cache::TEMPERATURE_TTL.as_millis() as u64 }
fn default_fan_ttl() -> u64 { constants::cache::FAN_TTL.as_millis() as u64 }
fn default_cache_entries() -> usize { constants::cache::MAX_ENTRIES }
fn default_pool_size() -> usize { constants::pool::MAX_CONNECTIONS }
fn default_cleanup_interval() -> u64 { constants::pool::CLEANUP_INTERVAL.as_secs() }
fn default_min_idle() -> usize { constants::pool::MIN_IDLE }
fn default_timeout() -> u64 { constants::ipc::REQUEST_TIMEOUT.as_millis() as u64 }
fn default_rate_limit() -> u32 { constants::ipc::CLIENT_RATE_LIMIT }
fn default_reprobe_backoff() -> u64 { constants::recovery::REPROBE_BACKOFF.as_millis() as u64 }
fn default_true() -> bool { true }

impl Default for GeneralSettings {
    fn default() -> Self {
        Self { poll_interval_ms: default_poll_interval() }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            temperature_ttl_ms: default_temperature_ttl(),
            fan_ttl_ms: default_fan_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_pool_size(),
            cleanup_interval_secs: default_cleanup_interval(),
            min_idle: default_min_idle(),
        }
    }
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout_ms: default_timeout(),
            rate_limit: default_rate_limit(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self { reprobe_backoff_ms: default_reprobe_backoff() }
    }
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl SmcSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.general.poll_interval_ms)
    }

    pub fn temperature_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.temperature_ttl_ms)
    }

    pub fn fan_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.fan_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.pool.cleanup_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc.timeout_ms)
    }

    pub fn reprobe_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery.reprobe_backoff_ms)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.ipc
            .socket_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(constants::paths::SOCKET_PATH))
    }

    /// Reject values that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        if self.general.poll_interval_ms < 100 {
            return Err(SmcError::config("poll_interval_ms must be at least 100"));
        }
        if self.cache.temperature_ttl_ms == 0 || self.cache.fan_ttl_ms == 0 {
            return Err(SmcError::config("cache TTLs must be non-zero"));
        }
        if self.cache.max_entries == 0 {
            return Err(SmcError::config("cache.max_entries must be non-zero"));
        }
        if self.pool.max_connections == 0 {
            return Err(SmcError::config("pool.max_connections must be non-zero"));
        }
        if self.pool.min_idle > self.pool.max_connections {
            return Err(SmcError::config(format!(
                "pool.min_idle ({}) exceeds pool.max_connections ({})",
                self.pool.min_idle, self.pool.max_connections
            )));
        }
        if self.pool.cleanup_interval_secs == 0 {
            return Err(SmcError::config("pool.cleanup_interval_secs must be non-zero"));
        }
        if self.ipc.timeout_ms == 0 {
            return Err(SmcError::config("ipc.timeout_ms must be non-zero"));
        }
        if self.ipc.rate_limit == 0 {
            return Err(SmcError::config("ipc.rate_limit must be non-zero"));
        }
        if let Some(ref path) = self.ipc.socket_path {
            if !Path::new(path).is_absolute() {
                return Err(SmcError::config(format!("socket path {:?} is not absolute", path)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Persistence
// ============================================================================

fn get_settings_path() -> Result<PathBuf> {
    constants::paths::settings_path()
        .ok_or_else(|| SmcError::config("Could not determine config directory"))
}

/// Load settings from the default location.
pub fn load_settings() -> Result<SmcSettings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from a file; a missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<SmcSettings> {
    if !path.exists() {
        return Ok(SmcSettings::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| SmcError::config(format!("Failed to read settings file: {}", e)))?;

    let settings: SmcSettings = serde_json::from_str(&content)
        .map_err(|e| SmcError::config(format!("Failed to parse settings JSON: {}", e)))?;

    settings.validate()?;
    Ok(settings)
}

/// Save settings to the default location and refresh the cache.
pub fn save_settings(settings: &SmcSettings) -> Result<()> {
    save_settings_to(settings, &get_settings_path()?)?;
    update_cache(settings);
    Ok(())
}

/// Atomic write: temp file, fsync, rename.
pub fn save_settings_to(settings: &SmcSettings, path: &Path) -> Result<()> {
    use std::io::Write;

    settings.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SmcError::config(format!("Failed to create config directory: {}", e)))?;
    }

    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| SmcError::config(format!("Failed to serialize settings: {}", e)))?;

    let temp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&temp_path)
        .map_err(|e| SmcError::config(format!("Failed to create temp file: {}", e)))?;
    file.write_all(json.as_bytes())
        .map_err(|e| SmcError::config(format!("Failed to write to temp file: {}", e)))?;
    file.sync_all()
        .map_err(|e| SmcError::config(format!("Failed to sync temp file: {}", e)))?;

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        SmcError::config(format!("Failed to rename temp file: {}", e))
    })?;

    Ok(())
}
