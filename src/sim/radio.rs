use crate::event::{self, EventSender};
use crate::wifi::{
    ApRecord, NetworkMode, RadioError, RadioEvent, WifiRadio, WirelessCredentials,
};
use log::debug;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// 802.11 reason: no AP found.
const REASON_NO_AP_FOUND: u8 = 201;
/// 802.11 reason: 4-way handshake timeout (wrong secret).
const REASON_HANDSHAKE_TIMEOUT: u8 = 15;
/// 802.11 reason: station left.
const REASON_ASSOC_LEAVE: u8 = 8;

/// Radio that records requests and never raises events.
#[derive(Debug, Default)]
pub struct RecordingRadio {
    pub started: bool,
    pub joins: u32,
    pub modes: Vec<NetworkMode>,
    pub configs: Vec<WirelessCredentials>,
    /// Refuse join requests.
    pub reject_joins: bool,
    /// Refuse scan requests.
    pub reject_scans: bool,
}

impl WifiRadio for RecordingRadio {
    fn start(&mut self) -> Result<(), RadioError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.started = false;
        Ok(())
    }

    fn set_mode(&mut self, mode: NetworkMode) -> Result<(), RadioError> {
        self.modes.push(mode);
        Ok(())
    }

    fn set_config(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError> {
        self.configs.push(credentials.clone());
        Ok(())
    }

    fn join(&mut self) -> Result<(), RadioError> {
        self.joins += 1;
        if self.reject_joins {
            return Err(RadioError::Rejected("join refused".into()));
        }
        Ok(())
    }

    fn leave(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        if self.reject_scans {
            return Err(RadioError::Rejected("scan refused".into()));
        }
        Ok(())
    }
}

/// Counters shared between a [`SimulatedRadio`] and its test.
#[derive(Debug, Default)]
pub struct RadioStats {
    starts: AtomicU32,
    stops: AtomicU32,
    joins: AtomicU32,
}

impl RadioStats {
    pub fn joins(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

struct AccessPoint {
    ssid: Vec<u8>,
    secret: Vec<u8>,
    bssid: [u8; 6],
    rssi: i8,
}

/// Radio with one simulated access point. Replies go to the event channel.
pub struct SimulatedRadio {
    events: EventSender,
    access_point: Option<AccessPoint>,
    config: Option<WirelessCredentials>,
    associated: bool,
    reachable: bool,
    fail_start: bool,
    stats: Arc<RadioStats>,
}

impl SimulatedRadio {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            access_point: None,
            config: None,
            associated: false,
            reachable: true,
            fail_start: false,
            stats: Arc::new(RadioStats::default()),
        }
    }

    /// Add a visible access point.
    pub fn with_access_point(mut self, ssid: &str, secret: &str) -> Self {
        self.access_point = Some(AccessPoint {
            ssid: ssid.as_bytes().to_vec(),
            secret: secret.as_bytes().to_vec(),
            bssid: [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01],
            rssi: -48,
        });
        self
    }

    /// Joins are accepted but never answered.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// `start` fails as if the driver could not initialize.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn stats(&self) -> Arc<RadioStats> {
        Arc::clone(&self.stats)
    }

    fn post(&self, event: RadioEvent) {
        debug!("Simulated radio: {:?}", event);
        event::post(&self.events, event);
    }
}

impl WifiRadio for SimulatedRadio {
    fn start(&mut self) -> Result<(), RadioError> {
        if self.fail_start {
            return Err(RadioError::Init("simulated driver failure".into()));
        }
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        self.post(RadioEvent::StationStart);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        self.associated = false;
        Ok(())
    }

    fn set_mode(&mut self, _mode: NetworkMode) -> Result<(), RadioError> {
        Ok(())
    }

    fn set_config(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError> {
        self.config = Some(credentials.clone());
        Ok(())
    }

    fn join(&mut self) -> Result<(), RadioError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| RadioError::InvalidConfig("no station config".into()))?;
        self.stats.joins.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Ok(());
        }

        let outcome = match &self.access_point {
            Some(ap) if ap.ssid == config.network_name() => {
                if ap.secret == config.secret() {
                    Ok((ap.bssid, ap.ssid.clone()))
                } else {
                    Err((ap.rssi, REASON_HANDSHAKE_TIMEOUT))
                }
            }
            _ => Err((-90, REASON_NO_AP_FOUND)),
        };
        match outcome {
            Ok((bssid, ssid)) => {
                self.associated = true;
                self.post(RadioEvent::Connected { bssid, ssid });
                self.post(RadioEvent::GotAddress {
                    ip: Ipv4Addr::new(192, 168, 4, 20),
                });
            }
            Err((rssi, reason)) => self.post(RadioEvent::Disconnected { rssi, reason }),
        }
        Ok(())
    }

    fn leave(&mut self) -> Result<(), RadioError> {
        if std::mem::take(&mut self.associated) {
            let rssi = self.access_point.as_ref().map_or(-90, |ap| ap.rssi);
            self.post(RadioEvent::Disconnected {
                rssi,
                reason: REASON_ASSOC_LEAVE,
            });
        }
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        let records = self
            .access_point
            .iter()
            .map(|ap| ApRecord {
                ssid: ap.ssid.clone(),
                rssi: ap.rssi,
            })
            .collect();
        self.post(RadioEvent::ScanDone(records));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, Event};

    #[test]
    fn test_join_known_network() {
        let (tx, mut rx) = event::channel();
        let mut radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        radio
            .set_config(&WirelessCredentials::new("Lab", "pass1234").unwrap())
            .unwrap();
        radio.join().unwrap();

        assert!(matches!(
            rx.try_recv(),
            Ok(Event::Radio(RadioEvent::Connected { .. }))
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::Radio(RadioEvent::GotAddress { .. }))
        ));
        assert_eq!(radio.stats().joins(), 1);
    }

    #[test]
    fn test_wrong_secret_fails_join() {
        let (tx, mut rx) = event::channel();
        let mut radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        radio
            .set_config(&WirelessCredentials::new("Lab", "wrongpass").unwrap())
            .unwrap();
        radio.join().unwrap();

        assert_eq!(
            rx.try_recv().ok(),
            Some(Event::Radio(RadioEvent::Disconnected {
                rssi: -48,
                reason: REASON_HANDSHAKE_TIMEOUT
            }))
        );
    }

    #[test]
    fn test_join_without_config_is_rejected() {
        let (tx, _rx) = event::channel();
        let mut radio = SimulatedRadio::new(tx);
        assert!(matches!(radio.join(), Err(RadioError::InvalidConfig(_))));
    }
}
