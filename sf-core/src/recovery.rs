//! Recovery policy for failed hardware calls

use std::time::Duration;

use crate::constants;
use crate::error::{ErrorClass, SmcError};
use crate::permission::PermissionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Probe again now; do not retry the call.
    Reprobe,
    /// Probe again after the backoff.
    DelayedReprobe(Duration),
    /// Transient failure; try the same call once more.
    RetryOnce,
    /// Serve the call from the fallback generator.
    Fallback,
    /// Return the error to the caller.
    Surface,
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    backoff: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(constants::recovery::REPROBE_BACKOFF)
    }
}

impl RecoveryPolicy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// What to do after `err`, given the permission state and how many
    /// retries this call has already had.
    pub fn classify(&self, err: &SmcError, state: PermissionState, attempt: u32) -> RecoveryAction {
        match err.class() {
            ErrorClass::Validation => RecoveryAction::Surface,
            ErrorClass::Permission => RecoveryAction::Reprobe,
            ErrorClass::Connectivity => RecoveryAction::DelayedReprobe(self.backoff),
            ErrorClass::Operation if state == PermissionState::Granted && attempt == 0 => {
                RecoveryAction::RetryOnce
            }
            ErrorClass::Operation | ErrorClass::Protocol => RecoveryAction::Fallback,
        }
    }
}
