//! Application-layer protocol tags.

use std::fmt;

/// Application protocol a session or handler is associated with.
///
/// Handlers declare the tag they recognize; the port-based guesser uses the
/// tag's well-known ports to assign client and server roles on sessions
/// whose handshake was not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApplicationProtocol {
    Http,
    Dns,
    Ftp,
    Smtp,
    Pop3,
    Imap,
    Smb,
    Ssh,
    Tls,
    Telnet,
    Unknown,
}

impl ApplicationProtocol {
    /// Every known tag, in the order the guesser consults them.
    pub const ALL: [ApplicationProtocol; 10] = [
        ApplicationProtocol::Http,
        ApplicationProtocol::Dns,
        ApplicationProtocol::Ftp,
        ApplicationProtocol::Smtp,
        ApplicationProtocol::Pop3,
        ApplicationProtocol::Imap,
        ApplicationProtocol::Smb,
        ApplicationProtocol::Ssh,
        ApplicationProtocol::Tls,
        ApplicationProtocol::Telnet,
    ];

    pub fn default_ports(&self) -> &'static [u16] {
        match self {
            ApplicationProtocol::Http => &[80, 8080, 8000, 3128],
            ApplicationProtocol::Dns => &[53],
            ApplicationProtocol::Ftp => &[21, 20],
            ApplicationProtocol::Smtp => &[25, 587],
            ApplicationProtocol::Pop3 => &[110],
            ApplicationProtocol::Imap => &[143],
            ApplicationProtocol::Smb => &[445, 139],
            ApplicationProtocol::Ssh => &[22],
            ApplicationProtocol::Tls => &[443, 993, 995, 465],
            ApplicationProtocol::Telnet => &[23],
            ApplicationProtocol::Unknown => &[],
        }
    }

    /// Tag whose default ports include `port`.
    pub fn from_port(port: u16) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|proto| proto.default_ports().contains(&port))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationProtocol::Http => "HTTP",
            ApplicationProtocol::Dns => "DNS",
            ApplicationProtocol::Ftp => "FTP",
            ApplicationProtocol::Smtp => "SMTP",
            ApplicationProtocol::Pop3 => "POP3",
            ApplicationProtocol::Imap => "IMAP",
            ApplicationProtocol::Smb => "SMB",
            ApplicationProtocol::Ssh => "SSH",
            ApplicationProtocol::Tls => "TLS",
            ApplicationProtocol::Telnet => "Telnet",
            ApplicationProtocol::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_port() {
        assert_eq!(ApplicationProtocol::from_port(80), Some(ApplicationProtocol::Http));
        assert_eq!(ApplicationProtocol::from_port(445), Some(ApplicationProtocol::Smb));
        assert_eq!(ApplicationProtocol::from_port(51234), None);
        assert!(ApplicationProtocol::Unknown.default_ports().is_empty());
    }
}
