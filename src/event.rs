//! Node event channel.
//!
//! Driver callbacks run outside the wake cycle's control flow. Adapters turn
//! them into [`Event`] values and post them here; the orchestrator is the
//! only consumer.

use crate::provisioning::LinkEvent;
use crate::wifi::RadioEvent;
use tokio::sync::mpsc;

/// Everything the orchestrator reacts to while a cycle is running.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Radio(RadioEvent),
    Link(LinkEvent),
}

impl From<RadioEvent> for Event {
    fn from(event: RadioEvent) -> Self {
        Self::Radio(event)
    }
}

impl From<LinkEvent> for Event {
    fn from(event: LinkEvent) -> Self {
        Self::Link(event)
    }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the channel for one wake cycle.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Post an event, logging if the cycle has already ended.
pub fn post(tx: &EventSender, event: impl Into<Event>) {
    if tx.send(event.into()).is_err() {
        log::debug!("Event dropped: cycle finished");
    }
}
