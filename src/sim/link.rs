use crate::event::{self, EventSender};
use crate::provisioning::{LinkError, LinkEvent, ProvisioningLink, Reply};
use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LinkLog {
    advertising: bool,
    sent: Vec<Vec<u8>>,
    disconnects: usize,
    fail_start: bool,
}

/// Provisioning link whose outbox can be inspected from outside.
///
/// With an event sender attached it also plays the link stack: the secure
/// handshake succeeds at once and a disconnect is reported as
/// [`LinkEvent::Unlinked`].
#[derive(Debug, Clone, Default)]
pub struct ChannelLink {
    log: Arc<Mutex<LinkLog>>,
    events: Option<EventSender>,
    echo: bool,
}

impl ChannelLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Print every reply on stdout.
    pub fn echo_replies(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Make the next `start_advertising` fail.
    pub fn fail_start(&self) {
        self.log().fail_start = true;
    }

    fn log(&self) -> MutexGuard<'_, LinkLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_advertising(&self) -> bool {
        self.log().advertising
    }

    pub fn disconnects(&self) -> usize {
        self.log().disconnects
    }

    /// Replies sent so far, decoded.
    pub fn sent(&self) -> Vec<Reply> {
        self.log()
            .sent
            .iter()
            .filter_map(|frame| Reply::decode(frame).ok())
            .collect()
    }

    fn post(&self, event: LinkEvent) {
        if let Some(tx) = &self.events {
            event::post(tx, event);
        }
    }
}

impl ProvisioningLink for ChannelLink {
    fn start_advertising(&mut self) -> Result<(), LinkError> {
        let mut log = self.log();
        if std::mem::take(&mut log.fail_start) {
            return Err(LinkError::Init("simulated controller failure".into()));
        }
        log.advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), LinkError> {
        self.log().advertising = false;
        Ok(())
    }

    fn begin_security(&mut self) -> Result<(), LinkError> {
        self.post(LinkEvent::SecurityEstablished);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.log().disconnects += 1;
        self.post(LinkEvent::Unlinked);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.echo {
            match Reply::decode(frame) {
                Ok(reply) => println!("< {:?}", reply),
                Err(e) => warn!("Undecodable reply frame: {}", e),
            }
        } else {
            info!("Reply frame: {} bytes", frame.len());
        }
        self.log().sent.push(frame.to_vec());
        Ok(())
    }
}
