//! Core identifiers and shared constants for the weft substrate.
//!
//! Everything that crosses a module boundary by value lives here: peer
//! identities, stream ids, block ids, tips, bye reasons, login capability
//! bits. All of it is `Copy` or cheaply clonable so that components exchange
//! stable keys instead of references (handlers may delete the objects those
//! references would point into).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol magic / version triple, first 3 bytes of every frame header.
/// Bump the last byte on breaking wire changes.
pub const PROTOCOL_MAGIC: [u8; 3] = [0x77, 0x46, 0x01];

/// Frame MAC length once the secure channel is up (truncated HMAC-SHA3-256).
pub const MAC_SIZE: usize = 8;

/// Fixed wire header size: magic(3) + type(1) + length(4, LE).
pub const HEADER_SIZE: usize = 8;

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 10005;

// =============================================================================
// TIME
// =============================================================================

/// Seconds since the unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// PEER IDENTITY
// =============================================================================

/// Opaque 32-byte public identity (ed25519 verifying key bytes).
///
/// Ordering is lexicographic on the raw bytes; duplicate-connection
/// tie-breaks depend on this being total and identical on both sides.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub const ZERO: PeerId = PeerId([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Short hex prefix for log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fingerprint())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(b: [u8; 32]) -> Self {
        PeerId(b)
    }
}

/// Which identity a peer proved during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdentityType {
    Node = b'N',
    Owner = b'O',
    Viewer = b'V',
}

impl IdentityType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'N' => Some(IdentityType::Node),
            b'O' => Some(IdentityType::Owner),
            b'V' => Some(IdentityType::Viewer),
            _ => None,
        }
    }
}

// =============================================================================
// ADDRESSES AND STREAM IDS
// =============================================================================

/// An (IPv4, port) pair with total equality and ordering.
///
/// Port 0 is the "unspecified port" sentinel: the peer cannot accept
/// inbound connections and its address must never be dialed or recommended.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    pub ip: [u8; 4],
    pub port: u16,
}

impl NetAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        NetAddr { ip: ip.octets(), port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(), self.port)
    }

    /// True when the peer advertises a dialable listening port.
    pub fn is_dialable(&self) -> bool {
        self.port != 0
    }

    pub fn as_u64(&self) -> u64 {
        ((u32::from_be_bytes(self.ip) as u64) << 16) | self.port as u64
    }

    pub fn from_u64(v: u64) -> Self {
        NetAddr {
            ip: ((v >> 16) as u32).to_be_bytes(),
            port: (v & 0xffff) as u16,
        }
    }
}

impl From<SocketAddrV4> for NetAddr {
    fn from(sa: SocketAddrV4) -> Self {
        NetAddr::new(*sa.ip(), sa.port())
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

/// State bits carried inside a [`StreamId`].
pub struct StreamFlags;

impl StreamFlags {
    pub const OUTBOUND: u16 = 1;
    pub const INBOUND: u16 = 2;
    pub const ACCEPTED: u16 = 4;
    pub const HANDSHAKING: u16 = 8;
}

/// Stable 64-bit key for an in-flight connection: address plus state flags.
///
/// The id survives state transitions of the same connection (the flags
/// change, the address part does not), so it is what components store when
/// they need to refer to a connection without owning it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(addr: NetAddr, flags: u16) -> Self {
        StreamId((addr.as_u64() << 16) | flags as u64)
    }

    pub fn addr(&self) -> NetAddr {
        NetAddr::from_u64(self.0 >> 16)
    }

    pub fn flags(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn with_flags(self, flags: u16) -> Self {
        StreamId((self.0 & !0xffff) | flags as u64)
    }

    pub fn is_outbound(&self) -> bool {
        self.flags() & StreamFlags::OUTBOUND != 0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({}, {:#x})", self.addr(), self.flags())
    }
}

// =============================================================================
// CHAIN IDENTIFIERS
// =============================================================================

/// Hash output used throughout (SHA3-256).
pub type Hash = [u8; 32];

/// A state on the chain: height plus header hash.
///
/// Height 0 with a zero hash addresses the treasury (the pre-genesis blob).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct BlockId {
    pub height: u64,
    pub hash: Hash,
}

impl BlockId {
    pub const TREASURY: BlockId = BlockId { height: 0, hash: [0u8; 32] };
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, hex::encode(&self.hash[..6]))
    }
}

/// Best-chain header description as advertised by a peer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Tip {
    pub height: u64,
    pub hash: Hash,
    pub prev: Hash,
    pub chain_work: u128,
    pub timestamp: u64,
}

impl Tip {
    pub fn id(&self) -> BlockId {
        BlockId { height: self.height, hash: self.hash }
    }
}

// =============================================================================
// LOGIN CAPABILITIES AND BYE REASONS
// =============================================================================

/// Capability bits exchanged in the Login frame.
pub mod login_flags {
    /// Peer relays transactions and accepts ours.
    pub const SPREAD_TXS: u32 = 1;
    /// Peer speaks the bulletin-board protocol.
    pub const BBS: u32 = 2;
    /// Peer sends periodic peer recommendations.
    pub const SEND_PEERS: u32 = 4;
    /// Peer wants dependent-state change notifications.
    pub const WANT_DEPENDENT_STATE: u32 = 8;

    pub const RECOGNIZED: u32 = SPREAD_TXS | BBS | SEND_PEERS | WANT_DEPENDENT_STATE;
}

/// Single-byte goodbye codes sent in the Bye frame.
pub mod bye_reason {
    pub const STOPPING: u8 = b's';
    pub const BAN: u8 = b'b';
    pub const LOOPBACK: u8 = b'L';
    pub const DUPLICATE: u8 = b'd';
    pub const TIMEOUT: u8 = b't';
    pub const PROBED: u8 = b'p';
    pub const OTHER: u8 = b'o';
}

// =============================================================================
// DISCONNECT REASONS
// =============================================================================

/// Why a connection is being torn down; decides the rating consequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// TCP-level read/write failure.
    Io(String),
    /// Wire framing or protocol-semantics violation. Ban-grade.
    Protocol(ProtocolViolation),
    /// Peer said goodbye.
    Bye(u8),
    /// The assigned request did not complete in time.
    RequestTimeout,
    /// Outbound queue exceeded the drown threshold.
    Drown,
    /// Second live connection to the same identity.
    Duplicate,
    /// We connected to ourselves.
    Loopback,
    /// The block processor judged data from this peer invalid.
    Insane,
    /// Dropped by peer-manager policy (rotation, shutdown).
    Policy,
}

/// Ban-grade wire and protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// First 3 header bytes disagree with [`PROTOCOL_MAGIC`].
    BadMagic,
    /// Message code outside the dispatch table.
    MsgType(u8),
    /// Announced size outside the per-type {min, max} policy.
    MsgSize { msg_type: u8, size: u32 },
    /// Frame MAC verification failed (or cipher desync).
    BadMac,
    /// Payload failed to deserialize.
    Corrupt(u8),
    /// Known type, disabled on this connection right now.
    UnexpectedMsg(u8),
    /// Semantic rule broken (e.g. chain-work went backwards).
    RuleViolation,
    /// Incompatible configuration (rules hash mismatch).
    Incompatible,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Io(e) => write!(f, "io error: {e}"),
            DisconnectReason::Protocol(v) => write!(f, "protocol violation: {v:?}"),
            DisconnectReason::Bye(r) => write!(f, "bye ({})", *r as char),
            DisconnectReason::RequestTimeout => f.write_str("request timeout"),
            DisconnectReason::Drown => f.write_str("outbound queue overflow"),
            DisconnectReason::Duplicate => f.write_str("duplicate connection"),
            DisconnectReason::Loopback => f.write_str("loopback"),
            DisconnectReason::Insane => f.write_str("insane data"),
            DisconnectReason::Policy => f.write_str("policy drop"),
        }
    }
}

impl DisconnectReason {
    /// Ban-grade reasons zero the peer's rating.
    pub fn is_ban(&self) -> bool {
        matches!(self, DisconnectReason::Protocol(_) | DisconnectReason::Insane)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_round_trip() {
        let addr = NetAddr::new(Ipv4Addr::new(10, 1, 2, 3), 10005);
        let sid = StreamId::new(addr, StreamFlags::OUTBOUND | StreamFlags::HANDSHAKING);
        assert_eq!(sid.addr(), addr);
        assert_eq!(sid.flags(), StreamFlags::OUTBOUND | StreamFlags::HANDSHAKING);
        assert!(sid.is_outbound());

        let sid2 = sid.with_flags(StreamFlags::OUTBOUND);
        assert_eq!(sid2.addr(), addr);
        assert_eq!(sid2.flags(), StreamFlags::OUTBOUND);
    }

    #[test]
    fn net_addr_u64_round_trip() {
        let addr = NetAddr::new(Ipv4Addr::new(192, 168, 1, 77), 4321);
        assert_eq!(NetAddr::from_u64(addr.as_u64()), addr);
    }

    #[test]
    fn peer_id_ordering_is_lexicographic() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 1;
        b[0] = 2;
        assert!(PeerId(a) < PeerId(b));
        a[0] = 2;
        a[31] = 1;
        assert!(PeerId(b) < PeerId(a));
    }
}
