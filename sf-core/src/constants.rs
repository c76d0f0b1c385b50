//! Constants and configuration defaults for smcfan
//!
//! Centralizes the magic numbers shared by the client library, the helper and
//! the CLI. Settings override the ones marked as defaults.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    use std::path::PathBuf;

    /// Helper socket
    #[cfg(target_os = "linux")]
    pub const SOCKET_PATH: &str = "/run/smcfan.sock";

    #[cfg(not(target_os = "linux"))]
    pub const SOCKET_PATH: &str = "/var/run/smcfan.sock";

    /// Helper PID file
    #[cfg(target_os = "linux")]
    pub const PID_FILE: &str = "/run/smcfand.pid";

    #[cfg(not(target_os = "linux"))]
    pub const PID_FILE: &str = "/var/run/smcfand.pid";

    /// Application directory name under the user config dir
    pub const APP_DIR: &str = "smcfan";

    /// Settings file name
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Per-user configuration directory.
    ///
    /// `XDG_CONFIG_HOME` wins when set, so tests and sandboxed runs can
    /// redirect it; otherwise the platform config dir is used.
    pub fn user_config_dir() -> Option<PathBuf> {
        let base = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(xdg) if !xdg.is_empty() => Some(PathBuf::from(xdg)),
            _ => dirs::config_dir(),
        };
        base.map(|p| p.join(APP_DIR))
    }

    pub fn settings_path() -> Option<PathBuf> {
        user_config_dir().map(|d| d.join(SETTINGS_FILE))
    }
}

/// Client/helper IPC
pub mod ipc {
    use super::Duration;

    /// Per-request timeout (default)
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Client-side request budget per second (default)
    pub const CLIENT_RATE_LIMIT: u32 = 100;

    /// Helper-side request budget per client uid per second
    pub const SERVER_RATE_LIMIT: u32 = 200;

    /// Helper-side concurrent connection cap
    pub const MAX_CONNECTIONS: usize = 64;

    /// Helper read timeout on an idle client connection
    pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Helper write timeout for a reply
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Reading caches
pub mod cache {
    use super::Duration;

    /// Temperature entry lifetime (default)
    pub const TEMPERATURE_TTL: Duration = Duration::from_millis(1000);

    /// Fan descriptor entry lifetime (default)
    pub const FAN_TTL: Duration = Duration::from_millis(5000);

    /// Entries per cache (default)
    pub const MAX_ENTRIES: usize = 1000;

    /// Helper-side lifetime of the enumerated temperature key list
    pub const KEY_LIST_TTL: Duration = Duration::from_secs(30);
}

/// Helper connection pool
pub mod pool {
    use super::Duration;

    /// Concurrent connections (default)
    pub const MAX_CONNECTIONS: usize = 3;

    /// Period of the cleanup task (default)
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

    /// Idle connections kept by cleanup (default)
    pub const MIN_IDLE: usize = 1;
}

/// Performance optimizer
pub mod optimizer {
    use super::Duration;

    /// Hit rate under which a longer TTL is suggested
    pub const LOW_HIT_RATE: f64 = 0.5;

    /// Pool utilisation over which a larger pool is suggested
    pub const HIGH_POOL_UTILISATION: f64 = 0.8;

    /// Mean latency over which slower polling is suggested
    pub const HIGH_LATENCY: Duration = Duration::from_millis(100);
}

/// Permission recovery
pub mod recovery {
    use super::Duration;

    /// Wait before re-probing after a connectivity error (default)
    pub const REPROBE_BACKOFF: Duration = Duration::from_millis(2000);
}

/// Monitoring loop
pub mod monitor {
    use super::Duration;

    /// Default poll period
    pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Buffered samples before the producer waits
    pub const CHANNEL_CAPACITY: usize = 16;
}

/// Simulated readings
pub mod fallback {
    /// Generic temperature range for keys outside the catalog
    pub const GENERIC_BASE_CELSIUS: f64 = 40.0;
    pub const GENERIC_MAX_CELSIUS: f64 = 105.0;

    /// Temperature rise at full load
    pub const LOAD_TEMPERATURE_OFFSET: f64 = 35.0;

    /// Peak jitter amplitude
    pub const TEMPERATURE_JITTER: f64 = 1.5;
    pub const FAN_JITTER_RPM: f64 = 40.0;

    /// Default simulated fans
    pub const FAN_COUNT: u8 = 2;
    pub const FAN_MIN_RPM: f64 = 1200.0;
    pub const FAN_MAX_RPM: f64 = 6000.0;
}

/// Helper identity
pub mod helper {
    /// Version reported by `GetVersion`
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_xdg_config_home_wins() {
        let dir = tempfile::tempdir().unwrap();
        let old = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", dir.path());

        let path = paths::settings_path().unwrap();
        assert_eq!(path, dir.path().join("smcfan").join("settings.json"));

        match old {
            Some(v) => std::env::set_var("XDG_CONFIG_HOME", v),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }

    #[test]
    fn test_defaults_are_consistent() {
        assert!(cache::TEMPERATURE_TTL < cache::FAN_TTL);
        assert!(pool::MIN_IDLE < pool::MAX_CONNECTIONS);
        assert!(fallback::FAN_MIN_RPM < fallback::FAN_MAX_RPM);
    }
}
