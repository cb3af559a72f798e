//! Connection identity.

use std::net::{IpAddr, SocketAddr};

use super::Direction;

/// Normalized connection key (lower address/port first) so both directions
/// of a flow resolve to the same entry.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ConnectionKey {
    a: SocketAddr,
    b: SocketAddr,
}

impl ConnectionKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        if (src.ip(), src.port()) <= (dst.ip(), dst.port()) {
            Self { a: src, b: dst }
        } else {
            Self { a: dst, b: src }
        }
    }

    pub fn from_parts(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self::new(
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        )
    }

    /// The two endpoints, lower first.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.a, self.b)
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.a == addr || self.b == addr
    }
}

/// Endpoint roles of an established flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoints {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl Endpoints {
    /// Direction of a packet from `src` to `dst`, if it belongs here.
    pub fn direction(&self, src: SocketAddr, dst: SocketAddr) -> Option<Direction> {
        if src == self.client && dst == self.server {
            Some(Direction::ToServer)
        } else if src == self.server && dst == self.client {
            Some(Direction::ToClient)
        } else {
            None
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.client, self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_is_direction_independent() {
        let k1 = ConnectionKey::new(addr("10.0.0.2:40000"), addr("10.0.0.1:80"));
        let k2 = ConnectionKey::new(addr("10.0.0.1:80"), addr("10.0.0.2:40000"));
        assert_eq!(k1, k2);
        assert_eq!(k1.endpoints().0, addr("10.0.0.1:80"));
        assert!(k1.contains(addr("10.0.0.2:40000")));
    }

    #[test]
    fn test_endpoint_direction() {
        let ep = Endpoints {
            client: addr("10.0.0.2:40000"),
            server: addr("10.0.0.1:80"),
        };
        assert_eq!(ep.direction(ep.client, ep.server), Some(Direction::ToServer));
        assert_eq!(ep.direction(ep.server, ep.client), Some(Direction::ToClient));
        assert_eq!(ep.direction(ep.client, addr("10.0.0.3:80")), None);
    }
}
