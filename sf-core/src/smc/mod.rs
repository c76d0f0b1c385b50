//! SMC register access
//!
//! - `key` / `codec` - register identifiers and typed value conversion
//! - `wire` - the fixed 80-byte exchange record
//! - `driver` / `iokit` / `emulated` - the platform seam and its implementations
//! - `connection` / `device` - the channel lifecycle and register operations

pub mod codec;
pub mod connection;
pub mod device;
pub mod driver;
pub mod emulated;
#[cfg(target_os = "macos")]
pub mod iokit;
pub mod key;
pub mod wire;

pub use codec::{decode, encode, precision, try_decode, DataFormat};
pub use connection::{ConnectionState, SmcConnection};
pub use device::SmcDevice;
pub use driver::{platform_driver, SmcDriver, UnsupportedDriver};
pub use emulated::{EmulatedSmc, OpenFailure};
pub use key::RegisterKey;
pub use wire::{Command, KeyInfo, WireRecord, WIRE_RECORD_SIZE};
