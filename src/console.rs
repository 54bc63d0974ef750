//! Console stand-in for the provisioning peer.
//!
//! The host binary reads lines from stdin and turns them into the link
//! events and request frames a phone app would produce over BLE.
//!
//! # Commands
//!
//! - `link` / `unlink` - peer connects or goes away
//! - `name <ssid>` - set the network name
//! - `secret <password>` - set the secret (completes provisioning)
//! - `peer <aa:bb:cc:dd:ee:ff>` - set the access point address
//! - `mode <0-3>` - set the radio mode
//! - `scan`, `status`, `connect`, `disconnect`, `close`
//! - `data <text>` - send custom data
//! - `help`
//!
//! # Example Session
//!
//! ```text
//! > link
//! > name Lab
//! > secret pass1234
//! ```

use crate::event::Event;
use crate::provisioning::{LinkEvent, ProvisioningMessage, SecretBytes};
use crate::wifi::NetworkMode;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Raise a link event.
    Link(LinkEvent),
    /// Send a request frame as the peer.
    Request(ProvisioningMessage),
    Help,
    /// Unknown or invalid command, with a hint for the user.
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a command from an input line.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return Self::Unknown(String::new());
        }

        let mut parts = input.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match cmd.to_lowercase().as_str() {
            "link" => Self::Link(LinkEvent::Linked),
            "unlink" => Self::Link(LinkEvent::Unlinked),
            "name" => {
                if args.is_empty() {
                    Self::Unknown("Usage: name <ssid>".to_string())
                } else {
                    Self::Request(ProvisioningMessage::SetNetworkName(
                        args.as_bytes().to_vec(),
                    ))
                }
            }
            // An empty secret selects an open network.
            "secret" => {
                Self::Request(ProvisioningMessage::SetSecret(SecretBytes::new(args)))
            }
            "peer" => match parse_mac(args) {
                Some(mac) => Self::Request(ProvisioningMessage::SetPeerAddress(mac)),
                None => Self::Unknown("Usage: peer <aa:bb:cc:dd:ee:ff>".to_string()),
            },
            "mode" => match args.parse::<u8>().ok().and_then(NetworkMode::from_u8) {
                Some(mode) => Self::Request(ProvisioningMessage::SetNetworkMode(mode)),
                None => Self::Unknown("Usage: mode <0-3>".to_string()),
            },
            "scan" => Self::Request(ProvisioningMessage::RequestNetworkList),
            "status" => Self::Request(ProvisioningMessage::RequestConnectionStatus),
            "connect" => Self::Request(ProvisioningMessage::ConnectToNetwork),
            "disconnect" => Self::Request(ProvisioningMessage::DisconnectFromNetwork),
            "close" => Self::Request(ProvisioningMessage::CloseLink),
            "data" => Self::Request(ProvisioningMessage::CustomData(args.as_bytes().to_vec())),
            "help" => Self::Help,
            _ => Self::Unknown(format!(
                "Unknown command: {}. Type 'help' for commands.",
                cmd
            )),
        }
    }

    /// The event the command raises, if any.
    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::Link(event) => Some(event.into()),
            Self::Request(message) => Some(LinkEvent::Frame(message.encode()).into()),
            Self::Help | Self::Unknown(_) => None,
        }
    }
}

fn parse_mac(input: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut octets = input.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(octets.next()?, 16).ok()?;
    }
    if octets.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Help text for available commands.
pub const HELP_TEXT: &str = r#"
Available commands:
  link / unlink       Peer connects / goes away
  name <ssid>         Set network name
  secret <password>   Set secret and finish provisioning
  peer <mac>          Set access point address
  mode <0-3>          Set radio mode (0 off, 1 station, 2 AP, 3 both)
  scan                List visible networks
  status              Report connection status
  connect             Join the configured network
  disconnect          Leave the network
  close               Ask the node to drop the link
  data <text>         Send custom data
  help                Show this help
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name() {
        assert_eq!(
            ConsoleCommand::parse("name Lab"),
            ConsoleCommand::Request(ProvisioningMessage::SetNetworkName(b"Lab".to_vec()))
        );
        assert!(matches!(
            ConsoleCommand::parse("name"),
            ConsoleCommand::Unknown(_)
        ));
    }

    #[test]
    fn test_parse_secret_keeps_spaces() {
        assert_eq!(
            ConsoleCommand::parse("secret correct horse"),
            ConsoleCommand::Request(ProvisioningMessage::SetSecret(SecretBytes::new(
                "correct horse"
            )))
        );
    }

    #[test]
    fn test_parse_peer_address() {
        assert_eq!(
            ConsoleCommand::parse("peer 02:aa:bb:cc:dd:01"),
            ConsoleCommand::Request(ProvisioningMessage::SetPeerAddress([
                0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01
            ]))
        );
        assert!(matches!(
            ConsoleCommand::parse("peer 02:aa:bb"),
            ConsoleCommand::Unknown(_)
        ));
        assert!(matches!(
            ConsoleCommand::parse("peer 02:aa:bb:cc:dd:01:ff"),
            ConsoleCommand::Unknown(_)
        ));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            ConsoleCommand::parse("mode 1"),
            ConsoleCommand::Request(ProvisioningMessage::SetNetworkMode(NetworkMode::Station))
        );
        assert!(matches!(
            ConsoleCommand::parse("mode 9"),
            ConsoleCommand::Unknown(_)
        ));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            ConsoleCommand::parse("LINK"),
            ConsoleCommand::Link(LinkEvent::Linked)
        );
        assert_eq!(ConsoleCommand::parse("HELP"), ConsoleCommand::Help);
    }

    #[test]
    fn test_unknown_command() {
        match ConsoleCommand::parse("foo") {
            ConsoleCommand::Unknown(msg) => assert!(msg.contains("foo")),
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_request_becomes_frame() {
        let event = ConsoleCommand::parse("status").into_event();
        assert_eq!(
            event,
            Some(Event::Link(LinkEvent::Frame(
                ProvisioningMessage::RequestConnectionStatus.encode()
            )))
        );
        assert_eq!(ConsoleCommand::Help.into_event(), None);
    }
}
