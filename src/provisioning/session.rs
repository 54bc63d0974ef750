//! Provisioning session state machine.
//!
//! ```text
//! Idle ──start──▶ Advertising ──Linked──▶ Linked ──▶ SecurityNegotiating
//!                      ▲                                     │
//!                      │                          SecurityEstablished
//!                      │                                     ▼
//!                      └────────────Unlinked──────────── Active
//! ```
//!
//! Requests are only honoured in `Active`. A successful set-secret is the
//! single terminal event: the credentials are applied to the radio and
//! committed to the store before the session reports itself complete.

use super::message::{ConnectionReport, ErrorCode, ProvisioningMessage, Reply, SecretBytes};
use crate::config::MAX_JOIN_RETRIES;
use crate::orchestrator::NodeContext;
use crate::store::Storage;
use crate::wifi::credentials::{validate_network_name, PEER_ADDRESS_LEN};
use crate::wifi::{ConnectionManager, WifiNotice, WifiRadio, WirelessCredentials};
use log::{debug, error, info, warn};
use std::fmt;

/// Events raised by the provisioning link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peer connected.
    Linked,
    /// The peer went away.
    Unlinked,
    SecurityEstablished,
    SecurityFailed,
    /// One application frame from the peer.
    Frame(Vec<u8>),
}

/// Short-range link that carries provisioning frames.
pub trait ProvisioningLink {
    fn start_advertising(&mut self) -> Result<(), LinkError>;

    fn stop_advertising(&mut self) -> Result<(), LinkError>;

    /// Start the secure handshake with a linked peer.
    fn begin_security(&mut self) -> Result<(), LinkError>;

    /// Drop the current peer. Completion arrives as [`LinkEvent::Unlinked`].
    fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Send one frame to the peer.
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
}

/// Errors returned by the provisioning link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Controller or host stack failed to come up.
    Init(String),
    /// No peer is linked.
    NotLinked,
    /// The stack rejected the operation.
    Io(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(msg) => write!(f, "link init failed: {}", msg),
            Self::NotLinked => write!(f, "no peer linked"),
            Self::Io(msg) => write!(f, "link error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Advertising,
    Linked,
    SecurityNegotiating,
    Active,
    Closing,
}

/// Progress of the current provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProvisioningSessionState {
    pub peer_linked: bool,
    pub secure_channel_established: bool,
    pub credentials_received: bool,
}

/// Fields received so far, before a secret completes them.
#[derive(Debug, Default)]
struct CredentialDraft {
    network_name: Option<Vec<u8>>,
    peer_address: Option<[u8; PEER_ADDRESS_LEN]>,
}

/// One provisioning attempt over a [`ProvisioningLink`].
pub struct ProvisioningSession<L: ProvisioningLink> {
    link: L,
    phase: Phase,
    state: ProvisioningSessionState,
    draft: CredentialDraft,
    complete: bool,
}

impl<L: ProvisioningLink> ProvisioningSession<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            phase: Phase::Idle,
            state: ProvisioningSessionState::default(),
            draft: CredentialDraft::default(),
            complete: false,
        }
    }

    /// Reset the attempt and start advertising.
    pub fn start(&mut self) -> Result<(), LinkError> {
        self.reset();
        self.complete = false;
        self.link.start_advertising()?;
        self.phase = Phase::Advertising;
        info!("Provisioning: advertising");
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> ProvisioningSessionState {
        self.state
    }

    /// True once credentials were received and committed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Stop advertising and drop the peer.
    pub fn close(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        self.phase = Phase::Closing;
        if let Err(e) = self.link.stop_advertising() {
            debug!("Stop advertising on close: {}", e);
        }
        if self.state.peer_linked {
            if let Err(e) = self.link.disconnect() {
                debug!("Disconnect on close: {}", e);
            }
        }
        self.reset();
        self.phase = Phase::Idle;
        info!("Provisioning: closed");
    }

    pub fn handle_link_event<S: Storage, R: WifiRadio>(
        &mut self,
        event: LinkEvent,
        ctx: &mut NodeContext<S, R>,
    ) {
        match event {
            LinkEvent::Linked => self.on_linked(),
            LinkEvent::SecurityEstablished => {
                if self.phase == Phase::SecurityNegotiating {
                    self.state.secure_channel_established = true;
                    self.phase = Phase::Active;
                    info!("Provisioning: secure channel up");
                } else {
                    debug!("Security established in phase {:?}, ignored", self.phase);
                }
            }
            LinkEvent::SecurityFailed => {
                warn!("Provisioning: secure handshake failed, dropping peer");
                if let Err(e) = self.link.disconnect() {
                    warn!("Failed to drop peer: {}", e);
                }
            }
            LinkEvent::Unlinked => self.on_unlinked(),
            LinkEvent::Frame(frame) => self.on_frame(&frame, ctx),
        }
    }

    /// Relay radio outcomes the peer is waiting for.
    pub fn on_wifi_notice<R: WifiRadio>(
        &mut self,
        notice: &WifiNotice,
        wifi: &ConnectionManager<R>,
    ) {
        if self.phase != Phase::Active {
            return;
        }
        match notice {
            WifiNotice::ScanComplete(records) => {
                self.reply(&Reply::NetworkList(records.clone()));
            }
            WifiNotice::AddressAcquired(_) => {
                self.reply(&Reply::ConnectionReport(connection_report(wifi)));
            }
            _ => {}
        }
    }

    fn on_linked(&mut self) {
        if self.phase != Phase::Advertising {
            debug!("Peer linked in phase {:?}, ignored", self.phase);
            return;
        }
        self.state.peer_linked = true;
        self.phase = Phase::Linked;
        info!("Provisioning: peer linked");
        if let Err(e) = self.link.stop_advertising() {
            warn!("Failed to stop advertising: {}", e);
        }
        match self.link.begin_security() {
            Ok(()) => self.phase = Phase::SecurityNegotiating,
            Err(e) => {
                warn!("Cannot start secure handshake: {}", e);
                if let Err(e) = self.link.disconnect() {
                    warn!("Failed to drop peer: {}", e);
                }
            }
        }
    }

    fn on_unlinked(&mut self) {
        match self.phase {
            Phase::Idle | Phase::Closing => return,
            Phase::Advertising => {
                debug!("Unlinked while advertising, ignored");
                return;
            }
            Phase::Linked | Phase::SecurityNegotiating | Phase::Active => {}
        }
        info!("Provisioning: peer unlinked, discarding draft");
        self.reset();
        match self.link.start_advertising() {
            Ok(()) => self.phase = Phase::Advertising,
            Err(e) => {
                error!("Cannot re-arm advertising: {}", e);
                self.phase = Phase::Idle;
            }
        }
    }

    fn on_frame<S: Storage, R: WifiRadio>(&mut self, frame: &[u8], ctx: &mut NodeContext<S, R>) {
        if self.phase != Phase::Active {
            warn!("Frame received in phase {:?}, rejecting", self.phase);
            self.reply(&Reply::Error(ErrorCode::NotReady));
            return;
        }
        let message = match ProvisioningMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed provisioning frame: {}", e);
                self.reply(&Reply::Error(ErrorCode::DataFormat));
                return;
            }
        };
        debug!("Provisioning request: {:?}", message);
        self.apply(message, ctx);
    }

    fn apply<S: Storage, R: WifiRadio>(
        &mut self,
        message: ProvisioningMessage,
        ctx: &mut NodeContext<S, R>,
    ) {
        match message {
            ProvisioningMessage::SetNetworkMode(mode) => {
                info!("Provisioning: network mode {:?}", mode);
                if let Err(e) = ctx.wifi.set_mode(mode) {
                    warn!("Radio rejected mode {:?}: {}", mode, e);
                    self.reply(&Reply::Error(ErrorCode::RadioRejected));
                }
            }
            ProvisioningMessage::SetPeerAddress(addr) => {
                info!("Provisioning: peer address {}", format_mac(&addr));
                self.draft.peer_address = Some(addr);
            }
            ProvisioningMessage::SetNetworkName(name) => match validate_network_name(&name) {
                Ok(()) => {
                    info!(
                        "Provisioning: network name {}",
                        String::from_utf8_lossy(&name)
                    );
                    self.draft.network_name = Some(name);
                }
                Err(e) => {
                    warn!("Rejected network name: {}", e);
                    self.reply(&Reply::Error(ErrorCode::InvalidCredentials));
                }
            },
            ProvisioningMessage::SetSecret(secret) => self.complete_credentials(secret, ctx),
            ProvisioningMessage::RequestNetworkList => {
                if let Err(e) = ctx.wifi.scan() {
                    warn!("Scan could not start: {}", e);
                    self.reply(&Reply::Error(ErrorCode::WifiScanFail));
                }
            }
            ProvisioningMessage::RequestConnectionStatus => {
                self.reply(&Reply::ConnectionReport(connection_report(&ctx.wifi)));
            }
            ProvisioningMessage::ConnectToNetwork => {
                if !ctx.wifi.is_configured() {
                    warn!("Connect requested before credentials were set");
                    self.reply(&Reply::Error(ErrorCode::NotReady));
                    return;
                }
                // No association event fires for a network we are already on.
                ctx.wifi.disconnect();
                ctx.wifi.connect();
            }
            ProvisioningMessage::DisconnectFromNetwork => ctx.wifi.disconnect(),
            ProvisioningMessage::CloseLink => {
                info!("Provisioning: peer asked to close the link");
                if let Err(e) = self.link.disconnect() {
                    warn!("Failed to drop peer: {}", e);
                }
            }
            ProvisioningMessage::CustomData(data) => {
                info!("Custom data ({} bytes): {}", data.len(), hex(&data));
            }
            ProvisioningMessage::ReportError(code) => {
                error!("Peer reported error {:?}", code);
                self.reply(&Reply::Error(code));
            }
        }
    }

    fn complete_credentials<S: Storage, R: WifiRadio>(
        &mut self,
        secret: SecretBytes,
        ctx: &mut NodeContext<S, R>,
    ) {
        let name = match self.draft.network_name.as_ref() {
            Some(name) => name.clone(),
            None => {
                warn!("Secret received before a network name, rejecting");
                self.reply(&Reply::Error(ErrorCode::InvalidCredentials));
                return;
            }
        };
        let credentials = match WirelessCredentials::new(name, secret.as_bytes()) {
            Ok(creds) => creds.with_peer_address(self.draft.peer_address),
            Err(e) => {
                warn!("Rejected credentials: {}", e);
                self.reply(&Reply::Error(ErrorCode::InvalidCredentials));
                return;
            }
        };

        if let Err(e) = ctx.wifi.configure(&credentials) {
            warn!("Radio rejected station config, persisting anyway: {}", e);
        }
        if let Err(e) = ctx.store.save_credentials(&credentials) {
            error!("Failed to persist credentials: {}", e);
            self.reply(&Reply::Error(ErrorCode::StoreFailed));
            return;
        }

        self.state.credentials_received = true;
        self.complete = true;
        info!(
            "Provisioning complete for {}",
            credentials.network_name_lossy()
        );
    }

    fn reply(&mut self, reply: &Reply) {
        if let Err(e) = self.link.send(&reply.encode()) {
            warn!("Failed to send {:?}: {}", reply, e);
        }
    }

    fn reset(&mut self) {
        self.state = ProvisioningSessionState::default();
        self.draft = CredentialDraft::default();
    }
}

/// Report for the live connection state.
pub fn connection_report<R: WifiRadio>(wifi: &ConnectionManager<R>) -> ConnectionReport {
    let status = wifi.status();
    if status.connected {
        let (ssid, bssid, address) = match wifi.link_info() {
            Some(link) => (link.ssid.clone(), link.bssid, link.address),
            None => (Vec::new(), [0; 6], None),
        };
        ConnectionReport::Connected {
            ssid,
            bssid,
            address,
        }
    } else if status.connecting {
        ConnectionReport::Connecting {
            max_retries: MAX_JOIN_RETRIES,
        }
    } else {
        ConnectionReport::Failed {
            rssi: status.last_rssi,
            reason: status.last_disconnect_reason,
        }
    }
}

pub(crate) fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
