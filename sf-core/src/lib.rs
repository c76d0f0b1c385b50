//! smcfan Core Library
//!
//! Temperature and fan access on machines whose sensors sit behind the
//! System Management Controller.
//!
//! # Layers
//!
//! - **Register protocol** (`smc/`): typed value codec, the 80-byte wire
//!   record, the raw channel and the SMC device used by the privileged helper
//! - **Helper client**: pooled, rate limited IPC to `smcfand`
//! - **Service**: the façade consumers use, with TTL caching, permission
//!   probing, retry and simulated fallback readings
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> sf_core::Result<()> {
//! use sf_core::{SmcService, SmcSettings};
//!
//! let service = SmcService::new(SmcSettings::default());
//! let _ = service.connect().await;
//! for fan in service.all_fans().await? {
//!     println!("fan {}: {:.0} RPM", fan.index, fan.info.current);
//! }
//! # Ok(())
//! # }
//! ```

// Register protocol
pub mod smc;

// Client side
pub mod backend;
pub mod cache;
pub mod fallback;
pub mod helper_client;
pub mod monitor;
pub mod optimizer;
pub mod permission;
pub mod pool;
pub mod recovery;
pub mod service;

// Standalone modules
pub mod constants;
pub mod error;
pub mod sensors;
pub mod settings;

// Re-export error types
pub use error::{ErrorClass, Result, SmcError};

// Re-export protocol value types used in the public API
pub use sf_protocol::{FanInfo, HelperStatus};

pub use backend::{BackendKind, RealBackend, SensorBackend, SimulatedBackend};
pub use cache::{CacheStats, CachedValue, TtlCache};
pub use fallback::{FallbackGenerator, FixedLoad, LoadSource, SystemLoad};
pub use helper_client::{HelperClient, HelperTransport, SocketConnector};
pub use monitor::{Monitor, MonitorSample};
pub use optimizer::{AccessStat, CleanupReport, PerformanceOptimizer, PerformanceSnapshot, Suggestion};
pub use permission::{PermissionProber, PermissionState};
pub use pool::{ConnectionPool, Connector, PoolMetrics, PoolStats, PooledConnection};
pub use recovery::{RecoveryAction, RecoveryPolicy};
pub use sensors::{SensorClass, SensorDescriptor};
pub use service::{FanReading, SmcService, TemperatureReading};

// Re-export settings functions
pub use settings::{
    get_cached_settings, invalidate_settings_cache, load_settings, load_settings_from,
    save_settings, save_settings_to, SmcSettings,
};

pub use smc::{DataFormat, RegisterKey, SmcDevice};
