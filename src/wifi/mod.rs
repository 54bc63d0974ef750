//! WiFi station support.
//!
//! # Components
//!
//! - [`credentials`] - validated network name / secret pair
//! - [`radio`] - driver collaborator trait and its events
//! - [`manager`] - join/retry policy and connection state
//! - `esp` - ESP-IDF driver adapter (ESP32 only)

pub mod credentials;
pub mod manager;
pub mod radio;

#[cfg(feature = "esp32")]
mod esp;

pub use credentials::{CredentialError, WirelessCredentials};
pub use manager::{ConnectionManager, ConnectionState, LinkInfo, WifiNotice};
pub use radio::{ApRecord, NetworkMode, RadioError, RadioEvent, WifiRadio};

#[cfg(feature = "esp32")]
pub use esp::EspRadio;
