//! WiFi radio collaborator.
//!
//! The connection manager never talks to a driver directly. It issues
//! requests through [`WifiRadio`] and receives the driver's asynchronous
//! callbacks as [`RadioEvent`] values on the node event channel.

use super::credentials::{WirelessCredentials, MAX_NETWORK_NAME_LEN, PEER_ADDRESS_LEN};
use std::fmt;
use std::net::Ipv4Addr;

/// RSSI reported when a disconnect carries no signal information.
pub const INVALID_RSSI: i8 = -128;

/// Disconnect reason reported when the driver supplies none.
pub const INVALID_REASON: u8 = 255;

/// Operating mode of the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    Off,
    #[default]
    Station,
    AccessPoint,
    StationAccessPoint,
}

impl NetworkMode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Station => 1,
            Self::AccessPoint => 2,
            Self::StationAccessPoint => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Station),
            2 => Some(Self::AccessPoint),
            3 => Some(Self::StationAccessPoint),
            _ => None,
        }
    }
}

/// One access point seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApRecord {
    pub ssid: Vec<u8>,
    pub rssi: i8,
}

/// Asynchronous notifications from the radio driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Station interface is up and ready to join.
    StationStart,
    /// Associated with an access point.
    Connected { bssid: [u8; 6], ssid: Vec<u8> },
    /// Association ended or a join attempt failed.
    Disconnected { rssi: i8, reason: u8 },
    /// DHCP assigned an address.
    GotAddress { ip: Ipv4Addr },
    /// A scan finished.
    ScanDone(Vec<ApRecord>),
}

impl RadioEvent {
    /// Build [`RadioEvent::Connected`] from a driver association payload.
    ///
    /// `ssid` may carry trailing NULs from a fixed-size driver buffer.
    pub fn connected(ssid: &[u8], bssid: &[u8]) -> Self {
        let len = ssid
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ssid.len())
            .min(MAX_NETWORK_NAME_LEN);
        Self::Connected {
            bssid: bssid.try_into().unwrap_or([0; PEER_ADDRESS_LEN]),
            ssid: ssid[..len].to_vec(),
        }
    }

    /// Build [`RadioEvent::Disconnected`] from a driver disconnect payload.
    ///
    /// Reason codes outside one byte map to [`INVALID_REASON`].
    pub fn disconnected(rssi: i8, reason: u16) -> Self {
        Self::Disconnected {
            rssi,
            reason: u8::try_from(reason).unwrap_or(INVALID_REASON),
        }
    }
}

/// Requests the connection manager can make of the radio driver.
pub trait WifiRadio {
    /// Bring the station interface up. Emits [`RadioEvent::StationStart`].
    fn start(&mut self) -> Result<(), RadioError>;

    /// Shut the radio down.
    fn stop(&mut self) -> Result<(), RadioError>;

    fn set_mode(&mut self, mode: NetworkMode) -> Result<(), RadioError>;

    /// Load the station configuration used by the next join.
    fn set_config(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError>;

    /// Issue a join request. Completion arrives as an event.
    fn join(&mut self) -> Result<(), RadioError>;

    /// Leave the current network.
    fn leave(&mut self) -> Result<(), RadioError>;

    /// Start a scan. Results arrive as [`RadioEvent::ScanDone`].
    fn start_scan(&mut self) -> Result<(), RadioError>;
}

/// Errors returned by the radio driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Driver or interface failed to initialize.
    Init(String),
    /// The driver rejected the station configuration.
    InvalidConfig(String),
    /// The driver refused the request in its current state.
    Rejected(String),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(msg) => write!(f, "radio init failed: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "invalid station config: {}", msg),
            Self::Rejected(msg) => write!(f, "radio request rejected: {}", msg),
        }
    }
}

impl std::error::Error for RadioError {}
