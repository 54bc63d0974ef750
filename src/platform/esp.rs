//! ESP32 wakeup cause, MAC and deep sleep.

use super::{Platform, PlatformError, WakeCause};
use esp_idf_sys as sys;
use log::info;
use std::time::Duration;

/// Chip services from ESP-IDF.
#[derive(Debug, Default)]
pub struct EspPlatform;

impl EspPlatform {
    pub fn new() -> Self {
        Self
    }

    /// Power down the RTC peripherals and enter deep sleep. Never returns;
    /// the next wake starts from reset.
    pub fn enter_deep_sleep(&self) -> ! {
        info!("Entering deep sleep");
        // SAFETY: plain FFI calls with valid enum constants.
        unsafe {
            sys::esp_sleep_pd_config(
                sys::esp_sleep_pd_domain_t_ESP_PD_DOMAIN_RTC_PERIPH,
                sys::esp_sleep_pd_option_t_ESP_PD_OPTION_OFF,
            );
            sys::esp_deep_sleep_start();
        }
    }
}

impl Platform for EspPlatform {
    fn wake_cause(&self) -> WakeCause {
        // SAFETY: reads a value latched by the ROM at boot.
        let cause = unsafe { sys::esp_sleep_get_wakeup_cause() };
        if cause == sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER {
            WakeCause::Timer
        } else {
            WakeCause::Other
        }
    }

    fn device_mac(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        // SAFETY: `mac` is six writable bytes, as the call requires.
        let rc = sys::esp!(unsafe {
            sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_WIFI_STA)
        });
        if let Err(e) = rc {
            log::warn!("esp_read_mac failed ({:?}), using zero MAC", e);
        }
        mac
    }

    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), PlatformError> {
        let micros = u64::try_from(after.as_micros())
            .map_err(|_| PlatformError::Timer(format!("{:?} out of range", after)))?;
        // SAFETY: plain FFI call.
        sys::esp!(unsafe { sys::esp_sleep_enable_timer_wakeup(micros) })
            .map_err(|e| PlatformError::Timer(format!("{:?}", e)))?;
        info!("Enabling timer wakeup, {}s", after.as_secs());
        Ok(())
    }
}
