//! Host stand-in for the chip.

use super::{Platform, PlatformError, WakeCause};
use std::time::Duration;

/// Reports a configurable wake cause and records the armed timer.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    wake_cause: WakeCause,
    mac: [u8; 6],
    armed: Option<Duration>,
}

impl HostPlatform {
    pub fn new(wake_cause: WakeCause) -> Self {
        Self {
            wake_cause,
            mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            armed: None,
        }
    }

    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    /// Timer armed by the last cycle, if any.
    pub fn armed(&self) -> Option<Duration> {
        self.armed
    }
}

impl Platform for HostPlatform {
    fn wake_cause(&self) -> WakeCause {
        self.wake_cause
    }

    fn device_mac(&self) -> [u8; 6] {
        self.mac
    }

    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), PlatformError> {
        self.armed = Some(after);
        Ok(())
    }
}
