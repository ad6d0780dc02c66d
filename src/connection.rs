//! Per-connection state.
//!
//! One `Connection` wraps the codec and secure channel for a single duplex
//! peer link, tracks the outbound-queue depth against the choke and drown
//! watermarks, and carries the peer-visible state the node accumulates
//! (login flags, tip, rejected keys, broadcast cursors, deadlines).
//!
//! The actual socket halves live in the node's reader/writer tasks; the
//! writer drains a byte channel and decrements the shared unsent counter,
//! which is all the coupling the loop needs for backpressure decisions.

use crate::codec::{write_frame, MsgReader};
use crate::msgs::Msg;
use crate::peer_man::RecordId;
use crate::schannel::SChannel;
use crate::tasks::TaskKey;
use crate::types::{now_ms, Hash, NetAddr, PeerId, StreamId, Tip};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection lifecycle within the node façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket up, nonce exchange in flight.
    Securing,
    /// Ciphers up, waiting for authentication and login.
    Authenticating,
    /// Capability exchange done; a full peer.
    LoggedIn,
    /// Actively exchanging chain data.
    Serving,
    /// Bye sent, letting the write queue flush.
    Draining,
}

/// Boolean facts about a connection, teacher-style bit constants.
pub struct ConnFlags;

impl ConnFlags {
    /// Outbound TCP connect completed (we may send Bye on drop).
    pub const CONNECTED: u32 = 1;
    /// Peer's identity proof (Node type) verified.
    pub const PI_RCVD: u32 = 2;
    /// Peer proved the Owner identity.
    pub const OWNER: u32 = 4;
    /// Peer proved the Viewer identity.
    pub const VIEWER: u32 = 8;
    /// Dialed only to verify reachability; dropped after login.
    pub const PROBE: u32 = 16;
    /// Peer holds the treasury blob (claimed via its first NewTip).
    pub const HAS_TREASURY: u32 = 32;
    /// Outbound queue crossed the choke watermark; broadcasts paused.
    pub const CHOKING: u32 = 64;
    /// We asked for our external address and await the answer.
    pub const AWAIT_EXT: u32 = 128;
    /// We asked for the peer's clock and await the answer.
    pub const AWAIT_TIME: u32 = 256;
}

/// Outbound write failure.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue past drown threshold")]
    Drown,
    #[error("writer task gone")]
    Closed,
    #[error("serialization failed")]
    Encode,
}

pub struct Connection {
    pub stream_id: StreamId,
    pub addr: NetAddr,
    pub state: ConnState,
    pub flags: u32,
    pub reader: MsgReader,
    pub sc: SChannel,

    /// Capability bits from the peer's Login.
    pub login_flags: u32,
    pub peer_id: Option<PeerId>,
    pub record: Option<RecordId>,
    /// Advertised listening port; 0 = inbound-only.
    pub port: u16,
    pub tip: Option<Tip>,
    /// Keys this peer answered DataMissing for; never re-asked here.
    pub rejected: HashSet<TaskKey>,

    /// Broadcast cursor into the shared transaction ring.
    pub tx_cursor: u64,
    /// Last bulletin announcement this peer got, (time, key) order.
    pub bbs_floor: (u64, Hash),
    /// Subscribed bulletin channels → per-channel replay floor.
    pub subscriptions: HashMap<u32, (u64, Hash)>,

    pub connected_at_ms: u64,
    /// Armed while the head task is outstanding.
    pub request_deadline_ms: Option<u64>,
    /// Next scheduled peer-recommendation send.
    pub recommend_at_ms: Option<u64>,

    /// Exponentially weighted delivery estimate, bytes per second.
    pub bw_ewma_bps: u64,

    unsent: Arc<AtomicUsize>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    choke_bytes: usize,
    drown_bytes: usize,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: StreamId,
        addr: NetAddr,
        out: mpsc::UnboundedSender<Vec<u8>>,
        unsent: Arc<AtomicUsize>,
        read_buf_size: usize,
        choke_bytes: usize,
        drown_bytes: usize,
    ) -> Self {
        let mut reader = MsgReader::new(read_buf_size);
        // plaintext phase: only the handshake family is legal
        reader.disable_all();
        reader.enable(0x01); // bye
        reader.enable(0x04); // schannel-init

        Connection {
            stream_id,
            addr,
            state: ConnState::Securing,
            flags: 0,
            reader,
            sc: SChannel::new(),
            login_flags: 0,
            peer_id: None,
            record: None,
            port: 0,
            tip: None,
            rejected: HashSet::new(),
            tx_cursor: 0,
            bbs_floor: (0, [0u8; 32]),
            subscriptions: HashMap::new(),
            connected_at_ms: now_ms(),
            request_deadline_ms: None,
            recommend_at_ms: None,
            bw_ewma_bps: 0,
            unsent,
            out,
            choke_bytes,
            drown_bytes,
        }
    }

    pub fn is(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    /// Bytes accepted for write but not yet on the wire.
    pub fn unsent(&self) -> usize {
        self.unsent.load(Ordering::Relaxed)
    }

    /// Serialize, encrypt and enqueue one frame.
    ///
    /// Failing the drown check is terminal for the connection; the caller
    /// schedules the drop.
    pub fn send(&mut self, msg: &Msg) -> Result<(), SendError> {
        let frame = write_frame(msg, &mut self.sc).map_err(|_| SendError::Encode)?;
        let queued = self.unsent.fetch_add(frame.len(), Ordering::Relaxed) + frame.len();
        if queued > self.drown_bytes {
            debug!(addr = %self.addr, queued, "write queue drowned");
            return Err(SendError::Drown);
        }
        self.out.send(frame).map_err(|_| SendError::Closed)
    }

    /// Chocking check: pass `extra` for bytes a broadcast is about to add.
    /// Crossing the watermark sends a Ping and latches the flag until the
    /// matching Pong.
    pub fn is_choking(&mut self, extra: usize) -> bool {
        if self.is(ConnFlags::CHOKING) {
            return true;
        }
        if self.unsent() + extra <= self.choke_bytes {
            return false;
        }
        self.set(ConnFlags::CHOKING);
        let _ = self.send(&Msg::PING); // best effort; drown is caught on real traffic
        true
    }

    /// Pong observed: resume broadcasting.
    pub fn unchoke(&mut self) {
        self.clear(ConnFlags::CHOKING);
    }

    /// Fold one delivery into the bandwidth estimate.
    pub fn bw_sample(&mut self, bytes: usize, dt_ms: u64) {
        let dt = dt_ms.max(1);
        let sample = (bytes as u64).saturating_mul(1000) / dt;
        // 1/8 weight: ~8 deliveries of memory
        self.bw_ewma_bps = self.bw_ewma_bps - self.bw_ewma_bps / 8 + sample / 8;
    }

    /// Peer has completed login and authentication.
    pub fn is_full_peer(&self) -> bool {
        matches!(self.state, ConnState::LoggedIn | ConnState::Serving)
            && self.is(ConnFlags::PI_RCVD)
    }

    /// Age of the connection, for the early-disconnect penalty window.
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.connected_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn conn(choke: usize, drown: usize) -> (Connection, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = NetAddr::new(Ipv4Addr::LOCALHOST, 1);
        let c = Connection::new(
            StreamId::new(addr, 0),
            addr,
            tx,
            Arc::new(AtomicUsize::new(0)),
            1024,
            choke,
            drown,
        );
        (c, rx)
    }

    #[test]
    fn send_tracks_unsent_bytes() {
        let (mut c, mut rx) = conn(1 << 20, 20 << 20);
        c.send(&Msg::PING).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(c.unsent(), frame.len());
    }

    #[test]
    fn drown_threshold_fails_the_send() {
        let (mut c, _rx) = conn(100, 16);
        // 8-byte plaintext frames; the third crosses the 16-byte mark
        c.send(&Msg::PING).unwrap();
        c.send(&Msg::PING).unwrap();
        assert!(matches!(c.send(&Msg::PING), Err(SendError::Drown)));
    }

    #[test]
    fn choke_latches_until_unchoke() {
        let (mut c, mut rx) = conn(4, 1 << 20);
        assert!(!c.is_choking(0));

        c.send(&Msg::PONG).unwrap(); // 8 bytes queued > 4
        assert!(c.is_choking(0));
        assert!(c.is(ConnFlags::CHOKING));

        // the latch sent a ping
        let first = rx.try_recv().unwrap();
        let ping = rx.try_recv().unwrap();
        assert_eq!(first[3], 0x03);
        assert_eq!(ping[3], 0x02);

        // still choking even though we pass no extra
        assert!(c.is_choking(0));
        c.unchoke();
        // queue still above watermark: chokes again (and re-pings)
        assert!(c.is_choking(0));
    }

    #[test]
    fn extra_bytes_count_toward_choke() {
        let (mut c, _rx) = conn(100, 1 << 20);
        assert!(!c.is_choking(50));
        assert!(c.is_choking(200));
    }

    #[test]
    fn bw_ewma_converges_upward() {
        let (mut c, _rx) = conn(1, 1);
        for _ in 0..64 {
            c.bw_sample(100_000, 1000); // 100 kB/s
        }
        assert!(c.bw_ewma_bps > 90_000 && c.bw_ewma_bps <= 100_000);
    }

    #[test]
    fn plaintext_phase_only_accepts_handshake() {
        let (c, _rx) = conn(1, 1);
        assert!(c.reader.is_enabled(0x04));
        assert!(c.reader.is_enabled(0x01));
        assert!(!c.reader.is_enabled(0x00));
        assert!(!c.reader.is_enabled(0x10));
    }
}
