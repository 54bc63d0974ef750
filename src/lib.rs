//! Sensor node firmware library.
//!
//! Everything except the ESP-IDF adapters is platform-independent and runs
//! on the host, where the [`sim`] collaborators stand in for the radio, the
//! BLE link and the broker.
//!
//! # Modules
//!
//! - [`orchestrator`] - per-wake state machine
//! - [`provisioning`] - credential exchange with a peer
//! - [`wifi`] - join/retry policy and connection state
//! - [`store`] - key-value persistence across deep sleep
//! - [`telemetry`] - readings and the publish window
//! - [`duty`] - reading schedule counters

pub mod config;
pub mod console;
pub mod duty;
pub mod event;
pub mod orchestrator;
pub mod platform;
pub mod provisioning;
pub mod sim;
pub mod store;
pub mod telemetry;
pub mod wifi;

// Re-export commonly used items
pub use config::{ConfigError, NodeConfig};
pub use duty::SensorDutyConfig;
pub use event::{Event, EventReceiver, EventSender};
pub use orchestrator::{CycleReport, CycleState, NodeContext, Orchestrator};
pub use platform::{Platform, WakeCause};
pub use store::{PersistentStore, Storage, StoreError};
pub use wifi::{ConnectionManager, ConnectionState, WirelessCredentials};
