//! smcfan command-line front end
//!
//! The binary is a thin layer over [`sf_core::SmcService`]; the argument
//! definitions live here so they can be tested without spawning a process.

pub mod cli;
