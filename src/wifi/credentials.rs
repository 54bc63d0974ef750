//! Wireless credentials.
//!
//! Platform-independent credential type shared by the provisioning session,
//! the persistent store and the connection manager.
//!
//! # Example
//!
//! ```
//! use sensor_node_fw::wifi::WirelessCredentials;
//!
//! let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
//! let restored = WirelessCredentials::from_bytes(&creds.to_bytes()).unwrap();
//! assert_eq!(creds, restored);
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum network name length per IEEE 802.11 standard.
pub const MAX_NETWORK_NAME_LEN: usize = 32;

/// Maximum secret length for WPA2.
pub const MAX_SECRET_LEN: usize = 64;

/// Length of a BSSID.
pub const PEER_ADDRESS_LEN: usize = 6;

/// Credentials for joining an access point.
///
/// A value can only be built with a non-empty network name, so a secret is
/// never stored without the network it belongs to.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WirelessCredentials {
    network_name: Vec<u8>,
    secret: Vec<u8>,
    peer_address: Option<[u8; PEER_ADDRESS_LEN]>,
}

impl WirelessCredentials {
    /// Create and validate credentials.
    pub fn new(
        network_name: impl Into<Vec<u8>>,
        secret: impl Into<Vec<u8>>,
    ) -> Result<Self, CredentialError> {
        let creds = Self {
            network_name: network_name.into(),
            secret: secret.into(),
            peer_address: None,
        };
        creds.validate()?;
        Ok(creds)
    }

    /// Pin the credentials to one access point.
    pub fn with_peer_address(mut self, peer_address: Option<[u8; PEER_ADDRESS_LEN]>) -> Self {
        self.peer_address = peer_address;
        self
    }

    pub fn validate(&self) -> Result<(), CredentialError> {
        validate_network_name(&self.network_name)?;
        validate_secret(&self.secret)
    }

    pub fn network_name(&self) -> &[u8] {
        &self.network_name
    }

    /// Network name for logs and driver configuration.
    pub fn network_name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.network_name).into_owned()
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn peer_address(&self) -> Option<[u8; PEER_ADDRESS_LEN]> {
        self.peer_address
    }

    /// Check if this is an open network (no secret).
    pub fn is_open(&self) -> bool {
        self.secret.is_empty()
    }

    /// Serialize to bytes for the persistent store.
    ///
    /// Format: `[name_len:1][name:N][secret_len:1][secret:M][has_peer:1][peer:6?]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(3 + self.network_name.len() + self.secret.len() + PEER_ADDRESS_LEN);
        bytes.push(self.network_name.len() as u8);
        bytes.extend_from_slice(&self.network_name);
        bytes.push(self.secret.len() as u8);
        bytes.extend_from_slice(&self.secret);
        match self.peer_address {
            Some(addr) => {
                bytes.push(1);
                bytes.extend_from_slice(&addr);
            }
            None => bytes.push(0),
        }
        bytes
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CredentialError> {
        let (name, rest) = take_prefixed(bytes, "network name")?;
        let (secret, rest) = take_prefixed(rest, "secret")?;

        let peer_address = match rest.split_first() {
            Some((0, _)) => None,
            Some((1, addr)) if addr.len() == PEER_ADDRESS_LEN => {
                let mut peer = [0u8; PEER_ADDRESS_LEN];
                peer.copy_from_slice(addr);
                Some(peer)
            }
            _ => return Err(CredentialError::InvalidFormat("bad peer address".into())),
        };

        Ok(Self::new(name, secret)?.with_peer_address(peer_address))
    }
}

impl fmt::Debug for WirelessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WirelessCredentials")
            .field("network_name", &self.network_name_lossy())
            .field("secret_len", &self.secret.len())
            .field("peer_address", &self.peer_address)
            .finish()
    }
}

fn take_prefixed<'a>(
    bytes: &'a [u8],
    what: &str,
) -> Result<(&'a [u8], &'a [u8]), CredentialError> {
    let (&len, rest) = bytes
        .split_first()
        .ok_or_else(|| CredentialError::InvalidFormat(format!("missing {} length", what)))?;
    let len = len as usize;
    if rest.len() < len {
        return Err(CredentialError::InvalidFormat(format!("truncated {}", what)));
    }
    Ok(rest.split_at(len))
}

/// Check a network name received over the provisioning link.
pub fn validate_network_name(name: &[u8]) -> Result<(), CredentialError> {
    if name.is_empty() {
        return Err(CredentialError::NetworkNameEmpty);
    }
    if name.len() > MAX_NETWORK_NAME_LEN {
        return Err(CredentialError::NetworkNameTooLong {
            len: name.len(),
            max: MAX_NETWORK_NAME_LEN,
        });
    }
    Ok(())
}

/// Check a secret received over the provisioning link (empty is an open network).
///
/// Only the upper bound is enforced; the access point decides whether a
/// short secret is acceptable.
pub fn validate_secret(secret: &[u8]) -> Result<(), CredentialError> {
    if secret.len() > MAX_SECRET_LEN {
        return Err(CredentialError::SecretTooLong {
            len: secret.len(),
            max: MAX_SECRET_LEN,
        });
    }
    Ok(())
}

/// Errors that can occur validating or decoding credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Network name is empty.
    NetworkNameEmpty,
    /// Network name exceeds maximum length.
    NetworkNameTooLong { len: usize, max: usize },
    /// Secret exceeds maximum length.
    SecretTooLong { len: usize, max: usize },
    /// Invalid data format during deserialization.
    InvalidFormat(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkNameEmpty => write!(f, "network name cannot be empty"),
            Self::NetworkNameTooLong { len, max } => {
                write!(f, "network name too long: {} bytes (max {})", len, max)
            }
            Self::SecretTooLong { len, max } => {
                write!(f, "secret too long: {} bytes (max {})", len, max)
            }
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for CredentialError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_credentials() {
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        assert_eq!(creds.network_name(), b"Lab");
        assert_eq!(creds.secret(), b"pass1234");
        assert!(creds.peer_address().is_none());
    }

    #[test]
    fn test_open_network() {
        let creds = WirelessCredentials::new("OpenNet", "").unwrap();
        assert!(creds.is_open());
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = WirelessCredentials::new("", "pass1234");
        assert_eq!(result, Err(CredentialError::NetworkNameEmpty));
    }

    #[test]
    fn test_name_length_limits() {
        assert!(WirelessCredentials::new("a".repeat(32), "pass1234").is_ok());
        let result = WirelessCredentials::new("a".repeat(33), "pass1234");
        assert!(matches!(result, Err(CredentialError::NetworkNameTooLong { .. })));
    }

    #[test]
    fn test_secret_length_limits() {
        let creds = WirelessCredentials::new("Lab", "abc12").unwrap();
        assert_eq!(creds.secret(), b"abc12");
        assert!(WirelessCredentials::new("Lab", "x").is_ok());
        assert!(WirelessCredentials::new("Lab", "a".repeat(64)).is_ok());
        assert!(matches!(
            WirelessCredentials::new("Lab", "a".repeat(65)),
            Err(CredentialError::SecretTooLong { .. })
        ));
    }

    #[test]
    fn test_serialize_with_peer_address() {
        let creds = WirelessCredentials::new("Lab", "pass1234")
            .unwrap()
            .with_peer_address(Some([1, 2, 3, 4, 5, 6]));
        let restored = WirelessCredentials::from_bytes(&creds.to_bytes()).unwrap();
        assert_eq!(restored.peer_address(), Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(creds, restored);
    }

    #[test]
    fn test_byte_layout() {
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        let mut expected = vec![3];
        expected.extend_from_slice(b"Lab");
        expected.push(8);
        expected.extend_from_slice(b"pass1234");
        expected.push(0);
        assert_eq!(creds.to_bytes(), expected);
    }

    #[test]
    fn test_deserialize_empty() {
        let result = WirelessCredentials::from_bytes(&[]);
        assert!(matches!(result, Err(CredentialError::InvalidFormat(_))));
    }

    #[test]
    fn test_deserialize_truncated() {
        let result = WirelessCredentials::from_bytes(&[5, b'h', b'e', b'l', b'l']);
        assert!(matches!(result, Err(CredentialError::InvalidFormat(_))));
    }

    #[test]
    fn test_deserialize_bad_peer_flag() {
        let mut bytes = WirelessCredentials::new("Lab", "pass1234").unwrap().to_bytes();
        *bytes.last_mut().unwrap() = 7;
        let result = WirelessCredentials::from_bytes(&bytes);
        assert!(matches!(result, Err(CredentialError::InvalidFormat(_))));
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = WirelessCredentials::new("Lab", "pass1234").unwrap();
        let debug = format!("{:?}", creds);
        assert!(debug.contains("Lab"));
        assert!(!debug.contains("pass1234"));
    }
}
