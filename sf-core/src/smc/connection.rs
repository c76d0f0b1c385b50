//! Raw channel connection
//!
//! Owns one driver and tracks the open/close lifecycle. All operations take
//! `&mut self`, so a connection is never used by two callers at once.

use tracing::{debug, trace};

use super::driver::SmcDriver;
use super::wire::{WireRecord, WIRE_RECORD_SIZE};
use crate::error::{Result, SmcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

pub struct SmcConnection<D: SmcDriver> {
    driver: D,
    state: ConnectionState,
}

impl<D: SmcDriver> SmcConnection<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: ConnectionState::Closed,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Open the channel. A no-op when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Open {
            return Ok(());
        }

        self.state = ConnectionState::Opening;
        match self.driver.open() {
            Ok(()) => {
                self.state = ConnectionState::Open;
                debug!("SMC channel open ({})", self.driver.name());
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Close the channel. A no-op when already closed.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.driver.close();
        self.state = ConnectionState::Closed;
        debug!("SMC channel closed ({})", self.driver.name());
    }

    /// Send one record and decode the reply.
    pub fn call(&mut self, request: &WireRecord) -> Result<WireRecord> {
        if self.state != ConnectionState::Open {
            return Err(SmcError::NotConnected);
        }

        let input = request.to_bytes();
        let mut output = [0u8; WIRE_RECORD_SIZE];
        self.driver.exchange(&input, &mut output)?;

        let reply = WireRecord::from_bytes(&output)?;
        trace!(
            "SMC {} cmd={} result=0x{:02x}",
            request.key,
            request.command,
            reply.result
        );
        Ok(reply)
    }
}

impl<D: SmcDriver> Drop for SmcConnection<D> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::emulated::{EmulatedSmc, OpenFailure};
    use crate::smc::key::RegisterKey;

    #[test]
    fn test_lifecycle() {
        let smc = EmulatedSmc::macbook_pro();
        let mut conn = SmcConnection::new(smc.clone());
        assert_eq!(conn.state(), ConnectionState::Closed);

        conn.open().unwrap();
        assert!(conn.is_open());
        assert!(smc.is_open());

        // idempotent both ways
        conn.open().unwrap();
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!smc.is_open());
    }

    #[test]
    fn test_call_while_closed() {
        let mut conn = SmcConnection::new(EmulatedSmc::macbook_pro());
        let rec = WireRecord::read_key_info(RegisterKey::FAN_COUNT);
        assert!(matches!(conn.call(&rec), Err(SmcError::NotConnected)));
    }

    #[test]
    fn test_failed_open_returns_to_closed() {
        let smc = EmulatedSmc::macbook_pro();
        smc.set_open_failure(Some(OpenFailure::ServiceNotFound));
        let mut conn = SmcConnection::new(smc);
        assert!(matches!(conn.open(), Err(SmcError::ServiceNotFound(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_drop_closes_driver() {
        let smc = EmulatedSmc::macbook_pro();
        {
            let mut conn = SmcConnection::new(smc.clone());
            conn.open().unwrap();
        }
        assert!(!smc.is_open());
    }
}
