//! Simulated collaborators for host builds and tests.
//!
//! - [`RecordingRadio`] - records requests, emits nothing
//! - [`SimulatedRadio`] - answers requests with driver events on the channel
//! - [`ChannelLink`] - provisioning link with a shared outbox
//! - [`LogPublisher`] - logs telemetry, optional failure injection

mod link;
mod publisher;
mod radio;

pub use link::ChannelLink;
pub use publisher::LogPublisher;
pub use radio::{RadioStats, RecordingRadio, SimulatedRadio};
