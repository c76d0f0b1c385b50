//! IOKit user-client driver for the AppleSMC service.
//!
//! # Safety
//!
//! This module contains the only unsafe FFI in the crate. Each unsafe block
//! carries a SAFETY comment.

use std::ffi::{c_void, CString};

use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;
use tracing::{debug, warn};

use super::driver::SmcDriver;
use super::wire::WIRE_RECORD_SIZE;
use crate::error::{Result, SmcError};

type IoObjectT = u32;
type IoConnectT = u32;

const SERVICE_NAME: &str = "AppleSMC";
const MAIN_PORT_DEFAULT: mach_port_t = 0;
/// Struct-method selector of the SMC user client
const SELECTOR_STRUCT_METHOD: u32 = 2;
const IO_RETURN_NOT_PRIVILEGED: kern_return_t = 0xe00002c1_u32 as kern_return_t;

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOServiceMatching(name: *const libc::c_char) -> *mut c_void;
    fn IOServiceGetMatchingService(main_port: mach_port_t, matching: *mut c_void) -> IoObjectT;
    fn IOServiceOpen(
        service: IoObjectT,
        owning_task: mach_port_t,
        kind: u32,
        connect: *mut IoConnectT,
    ) -> kern_return_t;
    fn IOServiceClose(connect: IoConnectT) -> kern_return_t;
    fn IOObjectRelease(object: IoObjectT) -> kern_return_t;
    fn IOConnectCallStructMethod(
        connection: IoConnectT,
        selector: u32,
        input: *const c_void,
        input_size: usize,
        output: *mut c_void,
        output_size: *mut usize,
    ) -> kern_return_t;
}

#[derive(Debug, Default)]
pub struct IoKitDriver {
    service: IoObjectT,
    connection: IoConnectT,
}

impl IoKitDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn release_service(&mut self) {
        if self.service != 0 {
            // SAFETY: service came from IOServiceGetMatchingService and is released once.
            unsafe {
                IOObjectRelease(self.service);
            }
            self.service = 0;
        }
    }
}

impl SmcDriver for IoKitDriver {
    fn open(&mut self) -> Result<()> {
        let name = CString::new(SERVICE_NAME).map_err(|e| SmcError::generic(e.to_string()))?;

        // SAFETY: IOServiceMatching copies the C string; the returned dictionary
        // is consumed by IOServiceGetMatchingService, so no release is needed.
        let service = unsafe {
            let matching = IOServiceMatching(name.as_ptr());
            if matching.is_null() {
                return Err(SmcError::ServiceNotFound(SERVICE_NAME.to_string()));
            }
            IOServiceGetMatchingService(MAIN_PORT_DEFAULT, matching)
        };

        if service == 0 {
            return Err(SmcError::ServiceNotFound(SERVICE_NAME.to_string()));
        }
        self.service = service;

        let mut connection: IoConnectT = 0;
        // SAFETY: service is a valid io_service_t and connection points to a live local.
        let kr = unsafe { IOServiceOpen(self.service, mach_task_self(), 0, &mut connection) };

        if kr != KERN_SUCCESS {
            self.release_service();
            return Err(if kr == IO_RETURN_NOT_PRIVILEGED {
                SmcError::PermissionDenied(format!("IOServiceOpen: 0x{:08x}", kr as u32))
            } else {
                SmcError::ConnectionFailed(format!("IOServiceOpen: 0x{:08x}", kr as u32))
            });
        }

        debug!("Opened {} user client", SERVICE_NAME);
        self.connection = connection;
        Ok(())
    }

    fn exchange(
        &mut self,
        input: &[u8; WIRE_RECORD_SIZE],
        output: &mut [u8; WIRE_RECORD_SIZE],
    ) -> Result<()> {
        if self.connection == 0 {
            return Err(SmcError::NotConnected);
        }

        let mut output_size = WIRE_RECORD_SIZE;
        // SAFETY: both buffers are exactly WIRE_RECORD_SIZE bytes and outlive the call.
        let kr = unsafe {
            IOConnectCallStructMethod(
                self.connection,
                SELECTOR_STRUCT_METHOD,
                input.as_ptr() as *const c_void,
                WIRE_RECORD_SIZE,
                output.as_mut_ptr() as *mut c_void,
                &mut output_size,
            )
        };

        if kr != KERN_SUCCESS {
            return Err(if kr == IO_RETURN_NOT_PRIVILEGED {
                SmcError::PermissionDenied(format!("IOConnectCallStructMethod: 0x{:08x}", kr as u32))
            } else {
                SmcError::generic(format!("IOConnectCallStructMethod: 0x{:08x}", kr as u32))
            });
        }

        if output_size != WIRE_RECORD_SIZE {
            return Err(SmcError::MalformedRecord {
                expected: WIRE_RECORD_SIZE,
                actual: output_size,
            });
        }

        Ok(())
    }

    fn close(&mut self) {
        if self.connection != 0 {
            // SAFETY: connection came from IOServiceOpen and is closed once.
            let kr = unsafe { IOServiceClose(self.connection) };
            if kr != KERN_SUCCESS {
                warn!("IOServiceClose returned 0x{:08x}", kr as u32);
            }
            self.connection = 0;
        }
        self.release_service();
    }

    fn name(&self) -> &'static str {
        "iokit"
    }
}

impl Drop for IoKitDriver {
    fn drop(&mut self) {
        self.close();
    }
}
