//! WiFi connection management.
//!
//! Owns the join/retry policy and the connection state. Requests go out
//! through a [`WifiRadio`]; driver callbacks come back through
//! [`ConnectionManager::handle_event`].
//!
//! A join that fails before the station ever associated is retried up to
//! [`MAX_JOIN_RETRIES`] times. A link that drops after association is not
//! retried; the next wake cycle reconnects.

use super::credentials::WirelessCredentials;
use super::radio::{ApRecord, NetworkMode, RadioError, RadioEvent, WifiRadio};
use crate::config::MAX_JOIN_RETRIES;
use log::{debug, info, warn};
use std::net::Ipv4Addr;

/// Snapshot of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    /// Associated with an access point.
    pub connected: bool,
    /// A join request is in flight.
    pub connecting: bool,
    /// Retries issued for the current join.
    pub retry_count: u8,
    /// RSSI of the last failed join or dropped link.
    pub last_rssi: Option<i8>,
    /// Driver reason code of the last failed join or dropped link.
    pub last_disconnect_reason: Option<u8>,
    /// DHCP address acquired.
    pub got_address: bool,
}

/// Details of the current association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    pub address: Option<Ipv4Addr>,
}

/// What a radio event meant for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiNotice {
    StationStarted,
    Associated,
    AddressAcquired(Ipv4Addr),
    /// A failed join was re-issued.
    Retrying { attempt: u8 },
    /// The join failed and retries are exhausted.
    JoinFailed,
    /// An established link dropped.
    Dropped,
    ScanComplete(Vec<ApRecord>),
}

/// WiFi connection manager.
pub struct ConnectionManager<R: WifiRadio> {
    radio: R,
    state: ConnectionState,
    link: Option<LinkInfo>,
    pending: Option<WirelessCredentials>,
    mode: NetworkMode,
}

impl<R: WifiRadio> ConnectionManager<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            state: ConnectionState::default(),
            link: None,
            pending: None,
            mode: NetworkMode::Station,
        }
    }

    /// Bring the radio up.
    pub fn start(&mut self) -> Result<(), RadioError> {
        self.radio.set_mode(self.mode)?;
        self.radio.start()
    }

    /// Shut the radio down and forget the association.
    pub fn stop(&mut self) -> Result<(), RadioError> {
        self.state.connecting = false;
        self.clear_link();
        self.radio.stop()
    }

    /// Apply credentials as the pending station configuration.
    pub fn configure(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError> {
        if self.pending.as_ref() == Some(credentials) {
            debug!("Station config unchanged");
            return Ok(());
        }
        self.radio.set_config(credentials)?;
        info!(
            "Station config set for {}",
            credentials.network_name_lossy()
        );
        self.pending = Some(credentials.clone());
        Ok(())
    }

    pub fn set_mode(&mut self, mode: NetworkMode) -> Result<(), RadioError> {
        self.radio.set_mode(mode)?;
        self.mode = mode;
        Ok(())
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn is_configured(&self) -> bool {
        self.pending.is_some()
    }

    /// Issue a join request. Never blocks; the outcome arrives as events.
    pub fn connect(&mut self) {
        self.state.retry_count = 0;
        self.issue_join();
    }

    /// Leave the current network without retrying.
    pub fn disconnect(&mut self) {
        self.state.connecting = false;
        if let Err(e) = self.radio.leave() {
            warn!("WiFi disconnect request failed: {}", e);
        }
    }

    /// Start a scan. Results arrive as [`WifiNotice::ScanComplete`].
    pub fn scan(&mut self) -> Result<(), RadioError> {
        self.radio.start_scan()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Current state snapshot.
    pub fn status(&self) -> ConnectionState {
        self.state
    }

    /// Current association, if any.
    pub fn link_info(&self) -> Option<&LinkInfo> {
        self.link.as_ref()
    }

    /// True once associated and addressed.
    pub fn is_online(&self) -> bool {
        self.state.connected && self.state.got_address
    }

    /// Apply a radio event to the connection state.
    pub fn handle_event(&mut self, event: RadioEvent) -> Option<WifiNotice> {
        match event {
            RadioEvent::StationStart => {
                debug!("Station started");
                if self.pending.is_some() && !self.state.connecting && !self.state.connected {
                    self.connect();
                }
                Some(WifiNotice::StationStarted)
            }
            RadioEvent::Connected { bssid, ssid } => {
                self.state.connected = true;
                self.state.connecting = false;
                info!("WiFi associated with {}", String::from_utf8_lossy(&ssid));
                self.link = Some(LinkInfo {
                    ssid,
                    bssid,
                    address: None,
                });
                Some(WifiNotice::Associated)
            }
            RadioEvent::GotAddress { ip } => {
                self.state.got_address = true;
                if let Some(link) = self.link.as_mut() {
                    link.address = Some(ip);
                }
                info!("WiFi got address {}", ip);
                Some(WifiNotice::AddressAcquired(ip))
            }
            RadioEvent::Disconnected { rssi, reason } => Some(self.on_disconnected(rssi, reason)),
            RadioEvent::ScanDone(records) => {
                debug!("Scan found {} access points", records.len());
                Some(WifiNotice::ScanComplete(records))
            }
        }
    }

    fn on_disconnected(&mut self, rssi: i8, reason: u8) -> WifiNotice {
        let was_connected = self.state.connected;
        self.clear_link();

        if was_connected {
            self.record_diagnostics(rssi, reason);
            warn!("WiFi link dropped (reason {}, rssi {})", reason, rssi);
            return WifiNotice::Dropped;
        }

        if self.state.connecting && self.state.retry_count < MAX_JOIN_RETRIES {
            self.state.retry_count += 1;
            info!(
                "WiFi join failed (reason {}), retry {}/{}",
                reason, self.state.retry_count, MAX_JOIN_RETRIES
            );
            self.issue_join();
            return WifiNotice::Retrying {
                attempt: self.state.retry_count,
            };
        }

        self.state.connecting = false;
        self.record_diagnostics(rssi, reason);
        warn!("WiFi join failed (reason {}, rssi {}), giving up", reason, rssi);
        WifiNotice::JoinFailed
    }

    fn issue_join(&mut self) {
        self.state.last_rssi = None;
        self.state.last_disconnect_reason = None;
        match self.radio.join() {
            Ok(()) => self.state.connecting = true,
            Err(e) => {
                warn!("WiFi join request rejected: {}", e);
                self.state.connecting = false;
            }
        }
    }

    fn record_diagnostics(&mut self, rssi: i8, reason: u8) {
        self.state.last_rssi = Some(rssi);
        self.state.last_disconnect_reason = Some(reason);
    }

    fn clear_link(&mut self) {
        self.state.connected = false;
        self.state.got_address = false;
        self.link = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingRadio;

    fn configured_manager() -> ConnectionManager<RecordingRadio> {
        let mut manager = ConnectionManager::new(RecordingRadio::default());
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        manager.configure(&creds).unwrap();
        manager
    }

    fn fail(manager: &mut ConnectionManager<RecordingRadio>) -> Option<WifiNotice> {
        manager.handle_event(RadioEvent::Disconnected {
            rssi: -81,
            reason: 201,
        })
    }

    #[test]
    fn test_connect_sets_connecting() {
        let mut manager = configured_manager();
        manager.connect();
        let status = manager.status();
        assert!(status.connecting);
        assert!(!status.connected);
        assert_eq!(manager.radio.joins, 1);
    }

    #[test]
    fn test_rejected_join_is_not_connecting() {
        let mut manager = configured_manager();
        manager.radio.reject_joins = true;
        manager.connect();
        assert!(!manager.status().connecting);
    }

    #[test]
    fn test_retry_bound() {
        let mut manager = configured_manager();
        manager.connect();

        assert_eq!(fail(&mut manager), Some(WifiNotice::Retrying { attempt: 1 }));
        assert_eq!(fail(&mut manager), Some(WifiNotice::Retrying { attempt: 2 }));
        assert_eq!(fail(&mut manager), Some(WifiNotice::JoinFailed));

        let status = manager.status();
        assert_eq!(status.retry_count, 2);
        assert!(!status.connecting);
        assert!(!status.connected);
        assert_eq!(status.last_rssi, Some(-81));
        assert_eq!(status.last_disconnect_reason, Some(201));
        // Initial join plus exactly two retries.
        assert_eq!(manager.radio.joins, 3);

        // Further failures do not trigger more joins.
        fail(&mut manager);
        assert_eq!(manager.radio.joins, 3);
    }

    #[test]
    fn test_diagnostics_cleared_while_retrying() {
        let mut manager = configured_manager();
        manager.connect();
        fail(&mut manager);
        let status = manager.status();
        assert!(status.connecting);
        assert_eq!(status.last_rssi, None);
        assert_eq!(status.last_disconnect_reason, None);
    }

    #[test]
    fn test_successful_join() {
        let mut manager = configured_manager();
        manager.connect();
        manager.handle_event(RadioEvent::Connected {
            bssid: [1, 2, 3, 4, 5, 6],
            ssid: b"Lab".to_vec(),
        });
        let ip = Ipv4Addr::new(192, 168, 1, 50);
        assert_eq!(
            manager.handle_event(RadioEvent::GotAddress { ip }),
            Some(WifiNotice::AddressAcquired(ip))
        );

        let status = manager.status();
        assert!(status.connected);
        assert!(!status.connecting);
        assert!(status.got_address);
        assert!(manager.is_online());
        let link = manager.link_info().unwrap();
        assert_eq!(link.ssid, b"Lab");
        assert_eq!(link.address, Some(ip));
    }

    #[test]
    fn test_drop_after_connect_does_not_retry() {
        let mut manager = configured_manager();
        manager.connect();
        manager.handle_event(RadioEvent::Connected {
            bssid: [0; 6],
            ssid: b"Lab".to_vec(),
        });
        manager.handle_event(RadioEvent::GotAddress {
            ip: Ipv4Addr::new(10, 0, 0, 2),
        });

        assert_eq!(
            manager.handle_event(RadioEvent::Disconnected {
                rssi: -70,
                reason: 8
            }),
            Some(WifiNotice::Dropped)
        );
        let status = manager.status();
        assert!(!status.connected);
        assert!(!status.connecting);
        assert!(!status.got_address);
        assert_eq!(status.last_disconnect_reason, Some(8));
        assert!(manager.link_info().is_none());
        assert_eq!(manager.radio.joins, 1);
    }

    #[test]
    fn test_connected_and_connecting_exclusive() {
        let mut manager = configured_manager();
        manager.connect();
        assert!(!(manager.status().connected && manager.status().connecting));
        manager.handle_event(RadioEvent::Connected {
            bssid: [0; 6],
            ssid: b"Lab".to_vec(),
        });
        assert!(!(manager.status().connected && manager.status().connecting));
    }

    #[test]
    fn test_station_start_joins_when_configured() {
        let mut manager = configured_manager();
        manager.handle_event(RadioEvent::StationStart);
        assert_eq!(manager.radio.joins, 1);
        // A second start while joining does not issue another request.
        manager.handle_event(RadioEvent::StationStart);
        assert_eq!(manager.radio.joins, 1);
    }

    #[test]
    fn test_station_start_without_config_does_nothing() {
        let mut manager = ConnectionManager::new(RecordingRadio::default());
        manager.handle_event(RadioEvent::StationStart);
        assert_eq!(manager.radio.joins, 0);
        assert!(!manager.status().connecting);
    }

    #[test]
    fn test_configure_is_idempotent() {
        let mut manager = configured_manager();
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        manager.configure(&creds).unwrap();
        assert_eq!(manager.radio.configs.len(), 1);
    }

    #[test]
    fn test_disconnect_while_joining_stops_retries() {
        let mut manager = configured_manager();
        manager.connect();
        manager.disconnect();
        assert_eq!(fail(&mut manager), Some(WifiNotice::JoinFailed));
        assert_eq!(manager.radio.joins, 1);
    }

    #[test]
    fn test_scan_results_are_relayed() {
        let mut manager = configured_manager();
        manager.scan().unwrap();
        let notice = manager.handle_event(RadioEvent::ScanDone(Vec::new()));
        assert_eq!(notice, Some(WifiNotice::ScanComplete(Vec::new())));
    }
}
