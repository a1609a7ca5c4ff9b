//! DeviceCommunicationControl state.
//!
//! A peer can tell this device to stop talking (`Disable`) or to stop
//! starting conversations (`DisableInitiation`), optionally for a number of
//! minutes. Once the duration runs out communication is enabled again.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use log::info;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::util::{lock, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum CommunicationState {
    #[default]
    Enable = 0,
    Disable = 1,
    DisableInitiation = 2,
}

impl TryFrom<u32> for CommunicationState {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Enable),
            1 => Ok(Self::Disable),
            2 => Ok(Self::DisableInitiation),
            other => Err(other),
        }
    }
}

#[derive(Debug, Default)]
struct Status {
    state: CommunicationState,
    expires_at: Option<Duration>,
}

/// Current DCC state with its optional expiry.
pub struct CommunicationControl {
    status: Mutex<Status>,
    clock: Arc<dyn Clock>,
}

impl CommunicationControl {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            status: Mutex::new(Status::default()),
            clock,
        }
    }

    /// Enters `state` for `minutes`, or indefinitely for 0.
    ///
    /// Enabling always clears any pending duration.
    pub fn set(&self, state: CommunicationState, minutes: u16) {
        let mut status = lock(&self.status);
        status.state = state;
        status.expires_at = match state {
            CommunicationState::Enable => None,
            _ if minutes == 0 => None,
            _ => Some(self.clock.now() + Duration::from_secs(minutes as u64 * 60)),
        };
        info!("Communication {:?} for {} minutes", state, minutes);
    }

    /// State in force now, reverting to `Enable` once the duration is over.
    pub fn state(&self) -> CommunicationState {
        let mut status = lock(&self.status);
        if let Some(expires_at) = status.expires_at {
            if self.clock.now() >= expires_at {
                info!("Communication control duration over, enabling");
                *status = Status::default();
            }
        }
        status.state
    }

    /// Time left before the current state reverts, if it is timed.
    pub fn remaining(&self) -> Option<Duration> {
        let status = lock(&self.status);
        status
            .expires_at
            .map(|at| at.saturating_sub(self.clock.now()))
    }

    pub fn communication_enabled(&self) -> bool {
        self.state() == CommunicationState::Enable
    }

    pub fn communication_disabled(&self) -> bool {
        self.state() == CommunicationState::Disable
    }

    pub fn initiation_disabled(&self) -> bool {
        self.state() == CommunicationState::DisableInitiation
    }
}

impl std::fmt::Debug for CommunicationControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = lock(&self.status);
        f.debug_struct("CommunicationControl")
            .field("state", &status.state)
            .field("expires_at", &status.expires_at)
            .finish()
    }
}
