//! Chip services the wake cycle depends on.
//!
//! - [`HostPlatform`] - development builds and tests
//! - `EspPlatform` - wakeup cause, MAC and deep sleep on ESP32

#[cfg(feature = "esp32")]
mod esp;
mod host;

#[cfg(feature = "esp32")]
pub use esp::EspPlatform;
pub use host::HostPlatform;

use std::fmt;
use std::time::Duration;

/// Why the chip started executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// Woken from deep sleep by the wake timer.
    Timer,
    /// Power-on, reset or any other wakeup source.
    Other,
}

pub trait Platform {
    fn wake_cause(&self) -> WakeCause;

    /// Station MAC address, used to tag telemetry.
    fn device_mac(&self) -> [u8; 6];

    /// Arm the timer that ends the next suspension.
    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The wake timer could not be armed.
    Timer(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timer(msg) => write!(f, "wake timer: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}
