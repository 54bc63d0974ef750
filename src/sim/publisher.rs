use crate::telemetry::{PublishError, Publisher};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Outbox {
    count: usize,
    last: Option<(String, Vec<u8>)>,
    fail_next: u32,
}

/// Publisher that logs payloads. Clones share counters.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher {
    outbox: Arc<Mutex<Outbox>>,
}

impl LogPublisher {
    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: u32) {
        self.outbox().fail_next = n;
    }

    pub fn published_count(&self) -> usize {
        self.outbox().count
    }

    /// Topic and payload of the last successful publish.
    pub fn last(&self) -> Option<(String, Vec<u8>)> {
        self.outbox().last.clone()
    }
}

impl Publisher for LogPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut outbox = self.outbox();
        if outbox.fail_next > 0 {
            outbox.fail_next -= 1;
            return Err(PublishError::NotConnected);
        }
        debug!("{} <- {}", topic, String::from_utf8_lossy(payload));
        outbox.count += 1;
        outbox.last = Some((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}
