//! Provisioning frame codec.
//!
//! The link carries opaque frames. Each frame is one opcode byte followed
//! by its payload:
//!
//! ```text
//! Requests (peer → node)            Replies (node → peer)
//! 0x01 set mode      [mode:1]       0x81 connection report
//! 0x02 peer address  [bssid:6]      0x82 network list
//! 0x03 network name  [name:N]       0x83 error         [code:1]
//! 0x04 secret        [secret:N]
//! 0x05 list networks
//! 0x06 status
//! 0x07 connect
//! 0x08 disconnect
//! 0x09 close link
//! 0x0A custom data   [data:N]
//! 0x0B report error  [code:1]
//! ```

use crate::wifi::radio::{INVALID_REASON, INVALID_RSSI};
use crate::wifi::{ApRecord, NetworkMode};
use std::fmt;
use std::net::Ipv4Addr;
use zeroize::Zeroizing;

const OP_SET_MODE: u8 = 0x01;
const OP_SET_PEER_ADDRESS: u8 = 0x02;
const OP_SET_NETWORK_NAME: u8 = 0x03;
const OP_SET_SECRET: u8 = 0x04;
const OP_REQUEST_NETWORK_LIST: u8 = 0x05;
const OP_REQUEST_STATUS: u8 = 0x06;
const OP_CONNECT: u8 = 0x07;
const OP_DISCONNECT: u8 = 0x08;
const OP_CLOSE_LINK: u8 = 0x09;
const OP_CUSTOM_DATA: u8 = 0x0A;
const OP_REPORT_ERROR: u8 = 0x0B;

const OP_CONNECTION_REPORT: u8 = 0x81;
const OP_NETWORK_LIST: u8 = 0x82;
const OP_ERROR: u8 = 0x83;

const REPORT_CONNECTED: u8 = 0;
const REPORT_CONNECTING: u8 = 1;
const REPORT_FAILED: u8 = 2;

/// Secret bytes received from the peer. Wiped on drop, hidden from `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes({} bytes)", self.0.len())
    }
}

/// Error codes carried in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Frame could not be decoded.
    DataFormat,
    /// Network scan could not be started.
    WifiScanFail,
    /// Request arrived before the secure channel was up.
    NotReady,
    /// Network name or secret failed validation.
    InvalidCredentials,
    /// Credentials could not be made durable.
    StoreFailed,
    /// The radio refused the requested configuration.
    RadioRejected,
    /// Any other code, passed through verbatim.
    Unknown(u8),
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::DataFormat => 9,
            Self::WifiScanFail => 11,
            Self::NotReady => 12,
            Self::InvalidCredentials => 0x20,
            Self::StoreFailed => 0x21,
            Self::RadioRejected => 0x22,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            9 => Self::DataFormat,
            11 => Self::WifiScanFail,
            12 => Self::NotReady,
            0x20 => Self::InvalidCredentials,
            0x21 => Self::StoreFailed,
            0x22 => Self::RadioRejected,
            other => Self::Unknown(other),
        }
    }
}

/// A request decoded from a peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningMessage {
    SetNetworkMode(NetworkMode),
    SetPeerAddress([u8; 6]),
    SetNetworkName(Vec<u8>),
    SetSecret(SecretBytes),
    RequestNetworkList,
    RequestConnectionStatus,
    ConnectToNetwork,
    DisconnectFromNetwork,
    CloseLink,
    CustomData(Vec<u8>),
    ReportError(ErrorCode),
}

/// Station status sent in answer to a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionReport {
    Connected {
        ssid: Vec<u8>,
        bssid: [u8; 6],
        /// `None` while associated but not yet addressed.
        address: Option<Ipv4Addr>,
    },
    Connecting {
        max_retries: u8,
    },
    Failed {
        rssi: Option<i8>,
        reason: Option<u8>,
    },
}

/// A frame sent from the node to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    ConnectionReport(ConnectionReport),
    NetworkList(Vec<ApRecord>),
    Error(ErrorCode),
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Zero-length frame.
    Empty,
    /// Opcode not in the message set.
    UnknownOpcode(u8),
    /// Payload length does not fit the opcode.
    BadLength { opcode: u8, len: usize },
    /// A payload field holds an out-of-range value.
    InvalidField(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode 0x{:02x}", op),
            Self::BadLength { opcode, len } => {
                write!(f, "bad payload length {} for opcode 0x{:02x}", len, opcode)
            }
            Self::InvalidField(field) => write!(f, "invalid {}", field),
        }
    }
}

impl std::error::Error for ProtocolError {}

fn exact<const N: usize>(opcode: u8, payload: &[u8]) -> Result<[u8; N], ProtocolError> {
    payload.try_into().map_err(|_| ProtocolError::BadLength {
        opcode,
        len: payload.len(),
    })
}

fn empty(
    opcode: u8,
    payload: &[u8],
    message: ProvisioningMessage,
) -> Result<ProvisioningMessage, ProtocolError> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(ProtocolError::BadLength {
            opcode,
            len: payload.len(),
        })
    }
}

impl ProvisioningMessage {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&opcode, payload) = frame.split_first().ok_or(ProtocolError::Empty)?;
        match opcode {
            OP_SET_MODE => {
                let [mode] = exact::<1>(opcode, payload)?;
                NetworkMode::from_u8(mode)
                    .map(Self::SetNetworkMode)
                    .ok_or(ProtocolError::InvalidField("network mode"))
            }
            OP_SET_PEER_ADDRESS => Ok(Self::SetPeerAddress(exact::<6>(opcode, payload)?)),
            OP_SET_NETWORK_NAME => Ok(Self::SetNetworkName(payload.to_vec())),
            OP_SET_SECRET => Ok(Self::SetSecret(SecretBytes::new(payload))),
            OP_REQUEST_NETWORK_LIST => empty(opcode, payload, Self::RequestNetworkList),
            OP_REQUEST_STATUS => empty(opcode, payload, Self::RequestConnectionStatus),
            OP_CONNECT => empty(opcode, payload, Self::ConnectToNetwork),
            OP_DISCONNECT => empty(opcode, payload, Self::DisconnectFromNetwork),
            OP_CLOSE_LINK => empty(opcode, payload, Self::CloseLink),
            OP_CUSTOM_DATA => Ok(Self::CustomData(payload.to_vec())),
            OP_REPORT_ERROR => {
                let [code] = exact::<1>(opcode, payload)?;
                Ok(Self::ReportError(ErrorCode::from_u8(code)))
            }
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SetNetworkMode(mode) => vec![OP_SET_MODE, mode.as_u8()],
            Self::SetPeerAddress(addr) => {
                let mut frame = vec![OP_SET_PEER_ADDRESS];
                frame.extend_from_slice(addr);
                frame
            }
            Self::SetNetworkName(name) => {
                let mut frame = vec![OP_SET_NETWORK_NAME];
                frame.extend_from_slice(name);
                frame
            }
            Self::SetSecret(secret) => {
                let mut frame = vec![OP_SET_SECRET];
                frame.extend_from_slice(secret.as_bytes());
                frame
            }
            Self::RequestNetworkList => vec![OP_REQUEST_NETWORK_LIST],
            Self::RequestConnectionStatus => vec![OP_REQUEST_STATUS],
            Self::ConnectToNetwork => vec![OP_CONNECT],
            Self::DisconnectFromNetwork => vec![OP_DISCONNECT],
            Self::CloseLink => vec![OP_CLOSE_LINK],
            Self::CustomData(data) => {
                let mut frame = vec![OP_CUSTOM_DATA];
                frame.extend_from_slice(data);
                frame
            }
            Self::ReportError(code) => vec![OP_REPORT_ERROR, code.as_u8()],
        }
    }
}

impl Reply {
    /// Encode a reply frame.
    ///
    /// Connection report payloads:
    /// - connected: `[0][bssid:6][ssid_len:1][ssid][has_addr:1][addr:4?]`
    /// - connecting: `[1][max_retries:1]`
    /// - failed: `[2][rssi:1][reason:1]`, with -128 / 255 meaning unknown
    ///
    /// Network list: `[count:1]` then `[rssi:1][ssid_len:1][ssid]` per entry.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ConnectionReport(report) => {
                let mut frame = vec![OP_CONNECTION_REPORT];
                match report {
                    ConnectionReport::Connected {
                        ssid,
                        bssid,
                        address,
                    } => {
                        frame.push(REPORT_CONNECTED);
                        frame.extend_from_slice(bssid);
                        frame.push(ssid.len() as u8);
                        frame.extend_from_slice(ssid);
                        match address {
                            Some(ip) => {
                                frame.push(1);
                                frame.extend_from_slice(&ip.octets());
                            }
                            None => frame.push(0),
                        }
                    }
                    ConnectionReport::Connecting { max_retries } => {
                        frame.push(REPORT_CONNECTING);
                        frame.push(*max_retries);
                    }
                    ConnectionReport::Failed { rssi, reason } => {
                        frame.push(REPORT_FAILED);
                        frame.push(rssi.unwrap_or(INVALID_RSSI) as u8);
                        frame.push(reason.unwrap_or(INVALID_REASON));
                    }
                }
                frame
            }
            Self::NetworkList(records) => {
                // Count is one byte; a scan never returns more in practice.
                let records = &records[..records.len().min(u8::MAX as usize)];
                let mut frame = vec![OP_NETWORK_LIST, records.len() as u8];
                for ap in records {
                    frame.push(ap.rssi as u8);
                    frame.push(ap.ssid.len() as u8);
                    frame.extend_from_slice(&ap.ssid);
                }
                frame
            }
            Self::Error(code) => vec![OP_ERROR, code.as_u8()],
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&opcode, payload) = frame.split_first().ok_or(ProtocolError::Empty)?;
        let bad_length = || ProtocolError::BadLength {
            opcode,
            len: payload.len(),
        };
        match opcode {
            OP_CONNECTION_REPORT => {
                let (&kind, body) = payload.split_first().ok_or_else(bad_length)?;
                let report = match kind {
                    REPORT_CONNECTED => {
                        let mut reader = Reader::new(body);
                        let bssid = reader.array::<6>().ok_or_else(bad_length)?;
                        let ssid = reader.prefixed().ok_or_else(bad_length)?.to_vec();
                        let address = match reader.byte().ok_or_else(bad_length)? {
                            0 => None,
                            1 => Some(Ipv4Addr::from(reader.array::<4>().ok_or_else(bad_length)?)),
                            _ => return Err(ProtocolError::InvalidField("address flag")),
                        };
                        if !reader.is_empty() {
                            return Err(bad_length());
                        }
                        ConnectionReport::Connected {
                            ssid,
                            bssid,
                            address,
                        }
                    }
                    REPORT_CONNECTING => {
                        let [max_retries] = exact::<1>(opcode, body)?;
                        ConnectionReport::Connecting { max_retries }
                    }
                    REPORT_FAILED => {
                        let [rssi, reason] = exact::<2>(opcode, body)?;
                        let rssi = rssi as i8;
                        ConnectionReport::Failed {
                            rssi: (rssi != INVALID_RSSI).then_some(rssi),
                            reason: (reason != INVALID_REASON).then_some(reason),
                        }
                    }
                    _ => return Err(ProtocolError::InvalidField("report kind")),
                };
                Ok(Self::ConnectionReport(report))
            }
            OP_NETWORK_LIST => {
                let mut reader = Reader::new(payload);
                let count = reader.byte().ok_or_else(bad_length)?;
                let mut records = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let rssi = reader.byte().ok_or_else(bad_length)? as i8;
                    let ssid = reader.prefixed().ok_or_else(bad_length)?.to_vec();
                    records.push(ApRecord { ssid, rssi });
                }
                if !reader.is_empty() {
                    return Err(bad_length());
                }
                Ok(Self::NetworkList(records))
            }
            OP_ERROR => {
                let [code] = exact::<1>(opcode, payload)?;
                Ok(Self::Error(ErrorCode::from_u8(code)))
            }
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn byte(&mut self) -> Option<u8> {
        let (&b, rest) = self.bytes.split_first()?;
        self.bytes = rest;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Some(head)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.byte()? as usize;
        self.take(len)
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
