//! Telemetry: sensor readings and the publish window.
//!
//! During Operate the node publishes one log line over and over for a fixed
//! window, paced by the configured send interval. Failed publishes are
//! counted and the window keeps going. Nothing is queued for a later cycle.

#[cfg(feature = "esp32")]
mod mqtt;

#[cfg(feature = "esp32")]
pub use mqtt::MqttPublisher;

use log::{debug, info};
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// One sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Degrees Celsius.
    pub temperature: i32,
    pub ph: f32,
}

/// Raw sensor acquisition.
pub trait SensorReader {
    fn read(&mut self) -> Reading;
}

/// Fixed reading used until probes are wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubSensor;

impl SensorReader for StubSensor {
    fn read(&mut self) -> Reading {
        Reading {
            temperature: 30,
            ph: 7.0,
        }
    }
}

/// Build the log line `"<mac> <n> <t1> <ph1> <t2> <ph2> ..."`.
pub fn format_log_line(mac: &[u8; 6], readings: &[Reading]) -> String {
    let mut line = mac
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");
    let _ = write!(line, " {}", readings.len());
    for r in readings {
        let _ = write!(line, " {} {:.1}", r.temperature, r.ph);
    }
    line
}

/// Messaging collaborator.
pub trait Publisher {
    /// Fire-and-forget publish.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Errors returned by a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No broker session.
    NotConnected,
    /// The client refused the message.
    Rejected(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to broker"),
            Self::Rejected(msg) => write!(f, "publish rejected: {}", msg),
        }
    }
}

impl std::error::Error for PublishError {}

/// Outcome of one publish window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowReport {
    pub sent: u32,
    pub failed: u32,
    pub elapsed: Duration,
}

/// Paced publisher for the Operate window.
pub struct TelemetryPublisher<P: Publisher> {
    publisher: P,
    send_interval: Duration,
}

impl<P: Publisher> TelemetryPublisher<P> {
    /// `send_interval` must be non-zero.
    pub fn new(publisher: P, send_interval: Duration) -> Self {
        Self {
            publisher,
            send_interval,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publish `payload` to `topic` until `window` elapses.
    ///
    /// `pump` runs after every attempt so pending events are handled while
    /// the window is open.
    pub async fn run_window<F: FnMut()>(
        &mut self,
        topic: &str,
        payload: &[u8],
        window: Duration,
        mut pump: F,
    ) -> WindowReport {
        let start = Instant::now();
        let deadline = start + window;
        let mut report = WindowReport::default();

        info!("Sending messages on {} for {:?}", topic, window);
        while Instant::now() < deadline {
            match self.publisher.publish(topic, payload) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!("Publish failed: {}", e);
                }
            }
            pump();
            sleep_until((Instant::now() + self.send_interval).min(deadline)).await;
        }

        report.elapsed = start.elapsed();
        info!(
            "{} messages sent, {} failed, {:?} spent",
            report.sent, report.failed, report.elapsed
        );
        report
    }
}
