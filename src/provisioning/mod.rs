//! Credential provisioning over a short-range link.
//!
//! # Components
//!
//! - [`message`] - frame codec for requests and replies
//! - [`fragment`] - splitting frames to fit the BLE MTU
//! - [`session`] - per-attempt state machine driven by [`LinkEvent`]s
//! - `ble` - NimBLE GATT link (ESP32 only)

pub mod fragment;
pub mod message;
pub mod session;

#[cfg(feature = "esp32")]
mod ble;

pub use message::{
    ConnectionReport, ErrorCode, ProtocolError, ProvisioningMessage, Reply, SecretBytes,
};
pub use session::{
    LinkError, LinkEvent, Phase, ProvisioningLink, ProvisioningSession, ProvisioningSessionState,
};

#[cfg(feature = "esp32")]
pub use ble::BleLink;
