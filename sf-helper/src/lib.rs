//! smcfand internals
//!
//! The helper owns the one SMC connection on the machine and serves it over a
//! Unix socket. Split out of the binary so the server can be driven in tests.

pub mod hardware;
pub mod server;

pub use hardware::HardwareService;
pub use server::{bind, run_server, serve, ServerConfig};
