//! Platform seam for the SMC user client
//!
//! A driver performs exactly one blocking 80-byte exchange per call. Drivers
//! are `Send` so the helper can move them onto a blocking thread, but they are
//! never shared: the connection owning a driver takes `&mut self` everywhere.

use super::wire::WIRE_RECORD_SIZE;
use crate::error::{Result, SmcError};

pub trait SmcDriver: Send {
    /// Locate the hardware service and open a handle to it.
    fn open(&mut self) -> Result<()>;

    /// One request/response exchange on the open handle.
    fn exchange(
        &mut self,
        input: &[u8; WIRE_RECORD_SIZE],
        output: &mut [u8; WIRE_RECORD_SIZE],
    ) -> Result<()>;

    /// Release the handle. Must be safe to call on a closed driver.
    fn close(&mut self);

    /// Short name for logs and status replies
    fn name(&self) -> &'static str;
}

impl<D: SmcDriver + ?Sized> SmcDriver for Box<D> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn exchange(
        &mut self,
        input: &[u8; WIRE_RECORD_SIZE],
        output: &mut [u8; WIRE_RECORD_SIZE],
    ) -> Result<()> {
        (**self).exchange(input, output)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Driver for platforms without an SMC user client.
#[derive(Debug, Default)]
pub struct UnsupportedDriver;

impl SmcDriver for UnsupportedDriver {
    fn open(&mut self) -> Result<()> {
        Err(SmcError::ServiceNotFound(format!(
            "AppleSMC is not available on {}",
            std::env::consts::OS
        )))
    }

    fn exchange(
        &mut self,
        _input: &[u8; WIRE_RECORD_SIZE],
        _output: &mut [u8; WIRE_RECORD_SIZE],
    ) -> Result<()> {
        Err(SmcError::NotConnected)
    }

    fn close(&mut self) {}

    fn name(&self) -> &'static str {
        "unsupported"
    }
}

/// The hardware driver for the current platform.
pub fn platform_driver() -> Box<dyn SmcDriver> {
    #[cfg(target_os = "macos")]
    {
        Box::new(super::iokit::IoKitDriver::new())
    }

    #[cfg(not(target_os = "macos"))]
    {
        Box::new(UnsupportedDriver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_driver_reports_missing_service() {
        let mut driver = UnsupportedDriver;
        assert!(matches!(driver.open(), Err(SmcError::ServiceNotFound(_))));
        let input = [0u8; WIRE_RECORD_SIZE];
        let mut output = [0u8; WIRE_RECORD_SIZE];
        assert!(matches!(
            driver.exchange(&input, &mut output),
            Err(SmcError::NotConnected)
        ));
        driver.close();
    }
}
