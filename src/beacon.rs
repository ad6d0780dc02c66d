//! LAN discovery beacon.
//!
//! A periodic UDP broadcast of (rules-hash, own identity, listening port).
//! Receivers that share the rules hash register the sender as an
//! address-verified peer candidate. Best-effort only; every error here is
//! logged and swallowed.

use crate::types::{Hash, NetAddr, PeerId};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fixed datagram layout: 32 rules hash + 32 identity + 2 port (BE).
const BEACON_LEN: usize = 66;

/// A validated sighting delivered to the node loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconSighting {
    pub id: PeerId,
    pub addr: NetAddr,
}

pub struct Beacon {
    sock: UdpSocket,
    port: u16,
    msg: [u8; BEACON_LEN],
    rules_hash: Hash,
    own_id: PeerId,
}

impl Beacon {
    pub async fn bind(
        port: u16,
        rules_hash: Hash,
        own_id: PeerId,
        listen_port: u16,
    ) -> io::Result<Self> {
        let sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        sock.set_broadcast(true)?;

        let mut msg = [0u8; BEACON_LEN];
        msg[..32].copy_from_slice(&rules_hash);
        msg[32..64].copy_from_slice(&own_id.0);
        msg[64..].copy_from_slice(&listen_port.to_be_bytes());

        Ok(Beacon { sock, port, msg, rules_hash, own_id })
    }

    /// Drive one beacon: broadcast every `period_ms`, forward sightings.
    /// Runs until the receiver side of `out` goes away.
    pub async fn run(self, period_ms: u64, out: mpsc::UnboundedSender<BeaconSighting>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(period_ms.max(100)));
        let mut buf = [0u8; BEACON_LEN];
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sock.send_to(&self.msg, target).await {
                        debug!("beacon send failed: {e}");
                    }
                }
                res = self.sock.recv_from(&mut buf) => {
                    match res {
                        Ok((n, from)) => {
                            if let Some(s) = self.parse(n, &buf, from) {
                                if out.send(s).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("beacon recv failed: {e}");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn parse(&self, n: usize, buf: &[u8; BEACON_LEN], from: SocketAddr) -> Option<BeaconSighting> {
        if n != BEACON_LEN {
            return None;
        }
        if buf[..32] != self.rules_hash {
            return None;
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&buf[32..64]);
        let id = PeerId(id);
        if id == self.own_id {
            return None;
        }
        let port = u16::from_be_bytes([buf[64], buf[65]]);
        let SocketAddr::V4(sa) = from else { return None };
        Some(BeaconSighting { id, addr: NetAddr::new(*sa.ip(), port) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon_for_parse(rules: Hash, own: PeerId) -> Beacon {
        // std sockets are fine for constructing a parse-only instance
        let std_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_sock.set_nonblocking(true).unwrap();
        Beacon {
            sock: UdpSocket::from_std(std_sock).unwrap(),
            port: 0,
            msg: [0u8; BEACON_LEN],
            rules_hash: rules,
            own_id: own,
        }
    }

    fn datagram(rules: Hash, id: PeerId, port: u16) -> [u8; BEACON_LEN] {
        let mut buf = [0u8; BEACON_LEN];
        buf[..32].copy_from_slice(&rules);
        buf[32..64].copy_from_slice(&id.0);
        buf[64..].copy_from_slice(&port.to_be_bytes());
        buf
    }

    #[tokio::test]
    async fn parse_accepts_matching_rules() {
        let b = beacon_for_parse([1; 32], PeerId([9; 32]));
        let from: SocketAddr = "10.0.0.5:4444".parse().unwrap();

        let buf = datagram([1; 32], PeerId([2; 32]), 10005);
        let s = b.parse(BEACON_LEN, &buf, from).unwrap();
        assert_eq!(s.id, PeerId([2; 32]));
        assert_eq!(s.addr, NetAddr::new(Ipv4Addr::new(10, 0, 0, 5), 10005));
    }

    #[tokio::test]
    async fn parse_rejects_foreign_rules_self_and_runts() {
        let b = beacon_for_parse([1; 32], PeerId([9; 32]));
        let from: SocketAddr = "10.0.0.5:4444".parse().unwrap();

        let foreign = datagram([2; 32], PeerId([2; 32]), 10005);
        assert!(b.parse(BEACON_LEN, &foreign, from).is_none());

        let own = datagram([1; 32], PeerId([9; 32]), 10005);
        assert!(b.parse(BEACON_LEN, &own, from).is_none());

        let runt = datagram([1; 32], PeerId([2; 32]), 10005);
        assert!(b.parse(10, &runt, from).is_none());
    }
}
