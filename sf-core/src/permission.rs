//! Permission probing
//!
//! Decides whether the hardware channel is usable by asking the helper to
//! open it and immediately close it again.

use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SmcError};
use crate::helper_client::HelperTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Unknown,
    Checking,
    Granted,
    Denied,
    Restricted,
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Checking => "checking",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Restricted => "restricted",
        };
        f.write_str(s)
    }
}

/// Map a probe outcome to the state it leaves behind.
pub fn classify(outcome: &Result<()>) -> PermissionState {
    match outcome {
        Ok(()) => PermissionState::Granted,
        Err(
            SmcError::ConnectionFailed(_)
            | SmcError::PermissionDenied(_)
            | SmcError::Timeout(_)
            | SmcError::Io(_)
            | SmcError::NotConnected,
        ) => PermissionState::Denied,
        Err(SmcError::ServiceNotFound(_) | SmcError::Restricted(_)) => PermissionState::Restricted,
        Err(_) => PermissionState::Unknown,
    }
}

/// Owner of the permission state; nothing else mutates it.
pub struct PermissionProber {
    state: RwLock<PermissionState>,
}

impl Default for PermissionProber {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionProber {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PermissionState::Unknown),
        }
    }

    pub fn state(&self) -> PermissionState {
        *self.state.read()
    }

    /// Open and close the channel through the helper.
    ///
    /// Returns the new state and the error that produced it, if any.
    pub async fn probe(&self, transport: &dyn HelperTransport) -> (PermissionState, Option<SmcError>) {
        *self.state.write() = PermissionState::Checking;
        debug!("Probing SMC channel access");

        let outcome = match transport.connect().await {
            Ok(()) => {
                if let Err(e) = transport.disconnect().await {
                    debug!("Disconnect after probe failed: {}", e);
                }
                Ok(())
            }
            Err(e) => Err(e),
        };

        let state = classify(&outcome);
        *self.state.write() = state;

        match &outcome {
            Ok(()) => info!("SMC access {}", state),
            Err(e) => warn!("SMC access {}: {}", state, e),
        }
        (state, outcome.err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper_client::MockHelperTransport;

    #[test]
    fn test_classify() {
        assert_eq!(classify(&Ok(())), PermissionState::Granted);
        assert_eq!(
            classify(&Err(SmcError::ConnectionFailed("helper unreachable".into()))),
            PermissionState::Denied
        );
        assert_eq!(
            classify(&Err(SmcError::PermissionDenied("x".into()))),
            PermissionState::Denied
        );
        assert_eq!(
            classify(&Err(SmcError::ServiceNotFound("AppleSMC".into()))),
            PermissionState::Restricted
        );
        assert_eq!(
            classify(&Err(SmcError::IpcProtocol("garbled".into()))),
            PermissionState::Unknown
        );
    }

    #[tokio::test]
    async fn test_probe_granted_closes_channel() {
        let mut mock = MockHelperTransport::new();
        mock.expect_connect().times(1).returning(|| Ok(()));
        mock.expect_disconnect().times(1).returning(|| Ok(()));

        let prober = PermissionProber::new();
        assert_eq!(prober.state(), PermissionState::Unknown);
        let (state, err) = prober.probe(&mock).await;
        assert_eq!(state, PermissionState::Granted);
        assert!(err.is_none());
        assert_eq!(prober.state(), PermissionState::Granted);
    }

    #[tokio::test]
    async fn test_probe_denied_keeps_error() {
        let mut mock = MockHelperTransport::new();
        mock.expect_connect()
            .returning(|| Err(SmcError::PermissionDenied("not privileged".into())));
        mock.expect_disconnect().times(0);

        let prober = PermissionProber::new();
        let (state, err) = prober.probe(&mock).await;
        assert_eq!(state, PermissionState::Denied);
        assert!(matches!(err, Some(SmcError::PermissionDenied(_))));
    }
}
