//! Back-channel control messages
//!
//! Plain UTF-8 datagrams exchanged between a producer's control socket and a
//! consumer connection. `port:<n>` registers the sender's reply port; any
//! other text is an application command passed through untouched.

const PORT_PREFIX: &str = "port:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Sender listens for commands on this port
    ReturnPort(u16),
    /// Free-form command
    Command(String),
}

impl ControlMessage {
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let text = text.trim_end_matches('\0');
        if let Some(rest) = text.strip_prefix(PORT_PREFIX) {
            if let Ok(port) = rest.trim().parse::<u16>() {
                if port != 0 {
                    return ControlMessage::ReturnPort(port);
                }
            }
        }
        ControlMessage::Command(text.to_string())
    }

    pub fn encode(&self) -> String {
        match self {
            ControlMessage::ReturnPort(port) => format!("{}{}", PORT_PREFIX, port),
            ControlMessage::Command(text) => text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        assert_eq!(ControlMessage::parse(b"port:2345"), ControlMessage::ReturnPort(2345));
        assert_eq!(ControlMessage::parse(b"port: 80\0"), ControlMessage::ReturnPort(80));
        assert_eq!(ControlMessage::ReturnPort(2345).encode(), "port:2345");
    }

    #[test]
    fn test_bad_port_is_command() {
        assert_eq!(
            ControlMessage::parse(b"port:abc"),
            ControlMessage::Command("port:abc".into())
        );
        assert_eq!(
            ControlMessage::parse(b"port:0"),
            ControlMessage::Command("port:0".into())
        );
    }

    #[test]
    fn test_command_passthrough() {
        assert_eq!(
            ControlMessage::parse(b"volume 0.5"),
            ControlMessage::Command("volume 0.5".into())
        );
        assert_eq!(ControlMessage::Command("mute".into()).encode(), "mute");
    }
}
