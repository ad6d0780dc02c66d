//! Node façade: wires the codec, secure channel, peer manager, scheduler,
//! wanted queues, bulletin store and beacon together and owns every
//! connection's lifecycle.
//!
//! The node is an actor. `run()` consumes it; a single loop task owns all
//! mutable state and drains one event queue. Each connection contributes a
//! reader task (raw bytes in) and a writer task (encrypted frames out);
//! collaborators and the embedding application talk to the loop through a
//! cloneable [`NodeHandle`]. Nothing outside the loop ever touches node
//! state, which is what makes handler-triggered connection teardown safe:
//! a deleted connection is just a missing map entry on the next event.

mod dispatch;

use crate::beacon::{Beacon, BeaconSighting};
use crate::bbs::BbsStore;
use crate::config::Config;
use crate::connection::{ConnFlags, Connection, SendError};
use crate::msgs::{self, Msg};
use crate::peer_man::{PeerManager, RecordId};
use crate::relay::SendRing;
use crate::schannel::IdentityKey;
use crate::store::NodeStore;
use crate::tasks::{ConnKey, TaskKey, TaskScheduler};
use crate::types::{
    bye_reason, login_flags, now, now_ms, BlockId, DisconnectReason, Hash, NetAddr, PeerId,
    StreamFlags, StreamId, Tip,
};
use crate::wanted::Wanted;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 64 * 1024;
const TICK_MS: u64 = 100;
const DIAL_TIMEOUT_MS: u64 = 10_000;
const RECOMMEND_BATCH: usize = 8;
const TX_RING_CAP: usize = 4096;
/// Bytes/sec worth one rating point in the bandwidth feedback loop.
const BPS_PER_RATING_POINT: u64 = 8192;

// =============================================================================
// COLLABORATOR INTERFACES
// =============================================================================

/// Verdict on delivered chain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Accepted,
    /// Known already or not interesting; no rating consequence.
    Rejected,
    /// Provably invalid; the sender gets banned (via the deferred queue
    /// for block data).
    Invalid,
    /// Cannot be evaluated yet (unknown parent).
    Unreachable,
}

/// Transaction dissemination phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Private per-hop forwarding.
    Stem,
    /// Full fan-out.
    Fluff,
}

/// Verdict on an admitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    Duplicate,
    /// Malformed or failing validation; not ban-grade.
    Invalid,
    /// Hostile (e.g. forged proofs); ban-grade.
    InvalidBan,
}

/// Errors surfaced to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    TimeDiffTooLarge,
    IncompatiblePeer,
}

/// The blockchain state machine, as the substrate sees it.
///
/// Implementations report congestions back through
/// [`NodeHandle::request_data`]; the handle posts an event, so the report
/// lands after the current handler returns and never re-enters dispatch.
pub trait ChainHandler: Send {
    /// Our current best header.
    fn tip(&self) -> Tip;
    /// Whether a remote tip is worth fetching toward.
    fn is_tip_needed(&self, remote: &Tip) -> bool;

    fn on_header(&mut self, hdr: Tip, from: PeerId) -> DataStatus;
    fn on_header_pack(&mut self, headers: Vec<Tip>, from: PeerId) -> DataStatus;
    fn on_block(&mut self, id: BlockId, payload: Vec<u8>, from: PeerId) -> DataStatus;
    fn on_block_pack(&mut self, top: BlockId, bodies: Vec<Vec<u8>>, from: PeerId) -> DataStatus;

    fn get_hdr(&self, id: &BlockId) -> Option<Tip>;
    fn get_hdr_pack(&self, top: &BlockId, count: u32) -> Vec<Tip>;
    fn get_body(&self, id: &BlockId) -> Option<Vec<u8>>;
    fn get_body_pack(&self, req: &msgs::GetBodyPack) -> Vec<Vec<u8>>;

    fn get_proof_state(&self, height: u64) -> Option<Vec<u8>>;
    fn get_proof_kernel(&self, id: &Hash) -> Option<Vec<u8>>;
    fn get_proof_utxo(&self, req: &msgs::GetProofUtxo) -> Option<Vec<u8>>;
    fn get_proof_chainwork(&self, lower_bound: u128) -> Option<Vec<u8>>;
    fn get_common_state(&self, ids: &[BlockId]) -> Option<(u32, Vec<u8>)>;

    /// Owner-restricted queries.
    fn get_events(&self, height_min: u64) -> Option<Vec<u8>>;
    fn finalize_block(&mut self, height: u64, fees: u64) -> Option<Vec<u8>>;
}

/// The transaction pool, as the substrate sees it.
pub trait TxHandler: Send {
    /// Pool key of a serialized transaction.
    fn tx_key(&self, tx: &[u8]) -> Hash;
    fn has_transaction(&self, id: &Hash) -> bool;
    fn get_transaction(&self, id: &Hash) -> Option<Vec<u8>>;
    fn on_transaction(&mut self, tx: Vec<u8>, from: Option<PeerId>, mode: TxMode) -> TxStatus;
}

/// Operator-facing notifications.
pub trait Observer: Send {
    fn on_state_changed(&mut self) {}
    fn on_sync_error(&mut self, _err: SyncError) {}
    fn on_peer_connected(&mut self, _id: PeerId) {}
    fn on_peer_disconnected(&mut self, _id: PeerId, _reason: &DisconnectReason) {}
    /// A bulletin was accepted into the local store.
    fn on_bbs_msg(&mut self, _channel: u32, _key: &Hash, _payload: &[u8]) {}
}

/// Stand-in chain for nodes that only relay.
pub struct NullChain;

impl ChainHandler for NullChain {
    fn tip(&self) -> Tip {
        Tip::default()
    }
    fn is_tip_needed(&self, _remote: &Tip) -> bool {
        false
    }
    fn on_header(&mut self, _hdr: Tip, _from: PeerId) -> DataStatus {
        DataStatus::Rejected
    }
    fn on_header_pack(&mut self, _headers: Vec<Tip>, _from: PeerId) -> DataStatus {
        DataStatus::Rejected
    }
    fn on_block(&mut self, _id: BlockId, _payload: Vec<u8>, _from: PeerId) -> DataStatus {
        DataStatus::Rejected
    }
    fn on_block_pack(&mut self, _top: BlockId, _bodies: Vec<Vec<u8>>, _from: PeerId) -> DataStatus {
        DataStatus::Rejected
    }
    fn get_hdr(&self, _id: &BlockId) -> Option<Tip> {
        None
    }
    fn get_hdr_pack(&self, _top: &BlockId, _count: u32) -> Vec<Tip> {
        Vec::new()
    }
    fn get_body(&self, _id: &BlockId) -> Option<Vec<u8>> {
        None
    }
    fn get_body_pack(&self, _req: &msgs::GetBodyPack) -> Vec<Vec<u8>> {
        Vec::new()
    }
    fn get_proof_state(&self, _height: u64) -> Option<Vec<u8>> {
        None
    }
    fn get_proof_kernel(&self, _id: &Hash) -> Option<Vec<u8>> {
        None
    }
    fn get_proof_utxo(&self, _req: &msgs::GetProofUtxo) -> Option<Vec<u8>> {
        None
    }
    fn get_proof_chainwork(&self, _lower_bound: u128) -> Option<Vec<u8>> {
        None
    }
    fn get_common_state(&self, _ids: &[BlockId]) -> Option<(u32, Vec<u8>)> {
        None
    }
    fn get_events(&self, _height_min: u64) -> Option<Vec<u8>> {
        None
    }
    fn finalize_block(&mut self, _height: u64, _fees: u64) -> Option<Vec<u8>> {
        None
    }
}

/// Stand-in pool that accepts nothing.
pub struct NullTxPool;

impl TxHandler for NullTxPool {
    fn tx_key(&self, tx: &[u8]) -> Hash {
        use sha3::{Digest, Sha3_256};
        Sha3_256::digest(tx).into()
    }
    fn has_transaction(&self, _id: &Hash) -> bool {
        false
    }
    fn get_transaction(&self, _id: &Hash) -> Option<Vec<u8>> {
        None
    }
    fn on_transaction(&mut self, _tx: Vec<u8>, _from: Option<PeerId>, _mode: TxMode) -> TxStatus {
        TxStatus::Invalid
    }
}

// =============================================================================
// EVENTS AND THE HANDLE
// =============================================================================

/// Calls collaborators may post into the loop.
pub enum ApiCall {
    RequestData { id: BlockId, is_block: bool, target: BlockId },
    PeerInsane(PeerId),
    BroadcastTx { id: Hash, tx: Vec<u8>, mode: TxMode },
    BroadcastBbs(msgs::BbsMsg),
    AnnounceTip,
    PeerCount(oneshot::Sender<usize>),
    AccessibleAddrs(oneshot::Sender<Vec<NetAddr>>),
    Stop(oneshot::Sender<()>),
}

pub(crate) enum Event {
    Accepted(TcpStream, SocketAddr),
    DialDone {
        rid: Option<RecordId>,
        addr: NetAddr,
        probe: bool,
        result: std::io::Result<TcpStream>,
    },
    Data { conn: ConnKey, bytes: Vec<u8> },
    ConnIo { conn: ConnKey, error: String },
    Beacon(BeaconSighting),
    Api(ApiCall),
}

/// Cloneable entry point into a running node.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl NodeHandle {
    /// Congestion report: fetch `id` (header or block) toward `target`.
    pub fn request_data(&self, id: BlockId, is_block: bool, target: BlockId) {
        let _ = self.tx.send(Event::Api(ApiCall::RequestData { id, is_block, target }));
    }

    /// The verifier rejected this peer's block; ban it once the loop is
    /// back in control (never re-enters the scheduler mid-verdict).
    pub fn on_peer_insane(&self, id: PeerId) {
        let _ = self.tx.send(Event::Api(ApiCall::PeerInsane(id)));
    }

    pub fn broadcast_tx(&self, id: Hash, tx: Vec<u8>, mode: TxMode) {
        let _ = self.tx.send(Event::Api(ApiCall::BroadcastTx { id, tx, mode }));
    }

    pub fn broadcast_bbs_msg(&self, msg: msgs::BbsMsg) {
        let _ = self.tx.send(Event::Api(ApiCall::BroadcastBbs(msg)));
    }

    /// Our chain advanced; push NewTip to every logged-in peer.
    pub fn announce_tip(&self) {
        let _ = self.tx.send(Event::Api(ApiCall::AnnounceTip));
    }

    pub async fn peer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Api(ApiCall::PeerCount(tx))).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn accessible_addrs(&self) -> Vec<NetAddr> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Api(ApiCall::AccessibleAddrs(tx))).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown: Bye(stopping) to everyone, flush, stop the loop.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Api(ApiCall::Stop(tx))).is_ok() {
            let _ = rx.await;
        }
    }
}

// =============================================================================
// THE NODE
// =============================================================================

pub struct Node {
    cfg: Config,
    identity: IdentityKey,
    my_id: PeerId,

    chain: Box<dyn ChainHandler>,
    txpool: Box<dyn TxHandler>,
    observer: Option<Box<dyn Observer>>,

    peer_man: PeerManager,
    tasks: TaskScheduler,
    conns: HashMap<ConnKey, Connection>,
    by_peer: HashMap<PeerId, ConnKey>,
    next_conn: ConnKey,

    wanted_tx: Wanted,
    wanted_bbs: Wanted,
    bbs: BbsStore,
    tx_ring: SendRing,

    store: Option<NodeStore>,
    insane_queue: Vec<PeerId>,

    listener: Option<TcpListener>,
    listen_addr: NetAddr,
    external_ip: Option<[u8; 4]>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    next_peers_update_ms: u64,
    next_flush_ms: u64,
    next_bbs_cleanup_ms: u64,
}

impl Node {
    /// Bind the listener, load (or mint) the identity, seed the address
    /// book from the store and the configured bootstrap addresses.
    pub async fn bind(cfg: Config, store: Option<NodeStore>) -> std::io::Result<Node> {
        let listener = TcpListener::bind(cfg.listen.socket_addr()).await?;
        let local = match listener.local_addr()? {
            SocketAddr::V4(sa) => NetAddr::from(sa),
            SocketAddr::V6(_) => cfg.listen,
        };

        let identity = match &store {
            Some(s) => match s.identity().ok().flatten() {
                Some(secret) => IdentityKey::from_bytes(&secret),
                None => {
                    let key = IdentityKey::generate();
                    if let Err(e) = s.set_identity(&key.secret_bytes()) {
                        warn!("failed to persist identity: {e}");
                    }
                    key
                }
            },
            None => IdentityKey::generate(),
        };
        let my_id = identity.peer_id();
        info!(id = %my_id, addr = %local, "node up");

        let mut peer_man = PeerManager::new(cfg.clone());
        if let Some(s) = &store {
            match s.load_peers() {
                Ok(peers) => peer_man.seed(&my_id, peers),
                Err(e) => warn!("address book load failed: {e}"),
            }
        }
        for addr in &cfg.connect {
            peer_man.on_peer(PeerId::ZERO, *addr, true);
        }

        let mut bbs = BbsStore::new(cfg.bbs.clone());
        if let Some(s) = &store {
            if let Ok(stored) = s.load_bbs() {
                let t = now();
                for (_, rec) in stored {
                    bbs.insert(
                        msgs::BbsMsg {
                            channel: rec.channel,
                            time_posted: rec.time_posted,
                            payload: rec.payload,
                            nonce: rec.nonce,
                        },
                        t,
                    );
                }
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let t = now_ms();
        Ok(Node {
            tasks: TaskScheduler::new(cfg.bandwidth.clone()),
            wanted_tx: Wanted::new(cfg.timeout.get_tx_ms),
            wanted_bbs: Wanted::new(cfg.timeout.get_bbs_msg_ms),
            bbs,
            tx_ring: SendRing::new(TX_RING_CAP),
            peer_man,
            cfg,
            identity,
            my_id,
            chain: Box::new(NullChain),
            txpool: Box::new(NullTxPool),
            observer: None,
            conns: HashMap::new(),
            by_peer: HashMap::new(),
            next_conn: 1,
            store,
            insane_queue: Vec::new(),
            listener: Some(listener),
            listen_addr: local,
            external_ip: None,
            events_tx,
            events_rx,
            next_peers_update_ms: t,
            next_flush_ms: t,
            next_bbs_cleanup_ms: t,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle { tx: self.events_tx.clone() }
    }

    pub fn peer_id(&self) -> PeerId {
        self.my_id
    }

    pub fn listen_addr(&self) -> NetAddr {
        self.listen_addr
    }

    pub fn set_chain(&mut self, chain: Box<dyn ChainHandler>) {
        self.chain = chain;
    }

    pub fn set_tx_pool(&mut self, pool: Box<dyn TxHandler>) {
        self.txpool = pool;
    }

    pub fn set_observer(&mut self, obs: Box<dyn Observer>) {
        self.observer = Some(obs);
    }

    /// Drive the node until `stop()` is called. Consumes the node: all
    /// state lives and dies with the loop task.
    pub async fn run(mut self) {
        // acceptor task
        let listener = self.listener.take().expect("run called once");
        let acc_tx = self.events_tx.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, sa)) => {
                        if acc_tx.send(Event::Accepted(stream, sa)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
            }
        });

        // beacon task
        let mut beacon_task = None;
        if self.cfg.beacon_period_ms != 0 {
            let (b_tx, mut b_rx) = mpsc::unbounded_channel();
            match Beacon::bind(
                self.cfg.beacon_port(),
                self.cfg.rules_hash,
                self.my_id,
                self.listen_addr.port,
            )
            .await
            {
                Ok(beacon) => {
                    let period = self.cfg.beacon_period_ms;
                    beacon_task = Some(tokio::spawn(beacon.run(period, b_tx)));
                    let fwd = self.events_tx.clone();
                    tokio::spawn(async move {
                        while let Some(s) = b_rx.recv().await {
                            if fwd.send(Event::Beacon(s)).is_err() {
                                return;
                            }
                        }
                    });
                }
                Err(e) => warn!("beacon disabled: {e}"),
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
        loop {
            tokio::select! {
                maybe = self.events_rx.recv() => {
                    match maybe {
                        Some(ev) => {
                            if !self.on_event(ev) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => self.on_tick(),
            }
        }

        acceptor.abort();
        if let Some(b) = beacon_task {
            b.abort();
        }
    }

    fn on_event(&mut self, ev: Event) -> bool {
        match ev {
            Event::Accepted(stream, sa) => self.on_accepted(stream, sa),
            Event::DialDone { rid, addr, probe, result } => {
                self.on_dial_done(rid, addr, probe, result)
            }
            Event::Data { conn, bytes } => self.on_data(conn, &bytes),
            Event::ConnIo { conn, error } => {
                if self.conns.contains_key(&conn) {
                    self.drop_conn(conn, DisconnectReason::Io(error), None);
                }
            }
            Event::Beacon(s) => {
                debug!(peer = %s.id, addr = %s.addr, "beacon sighting");
                self.peer_man.on_peer(s.id, s.addr, true);
            }
            Event::Api(call) => return self.on_api(call),
        }
        true
    }

    // -- connection plumbing --------------------------------------------------

    fn install_conn(&mut self, stream: TcpStream, addr: NetAddr, flags: u16) -> ConnKey {
        let key = self.next_conn;
        self.next_conn += 1;

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let unsent = Arc::new(AtomicUsize::new(0));

        tokio::spawn(reader_task(read_half, self.events_tx.clone(), key));
        tokio::spawn(writer_task(write_half, out_rx, unsent.clone(), self.events_tx.clone(), key));

        let conn = Connection::new(
            StreamId::new(addr, flags | StreamFlags::HANDSHAKING),
            addr,
            out_tx,
            unsent,
            READ_BUF_SIZE,
            self.cfg.bandwidth.choke_bytes,
            self.cfg.bandwidth.drown_bytes,
        );
        self.conns.insert(key, conn);
        key
    }

    fn on_accepted(&mut self, stream: TcpStream, sa: SocketAddr) {
        let SocketAddr::V4(sa) = sa else { return };
        let addr = NetAddr::from(sa);
        debug!(%addr, "inbound connection");
        let key = self.install_conn(stream, addr, StreamFlags::INBOUND | StreamFlags::ACCEPTED);
        if let Some(conn) = self.conns.get_mut(&key) {
            conn.set(ConnFlags::CONNECTED);
            // the initiator speaks first; we answer its nonce
        }
    }

    fn dial(&mut self, rid: Option<RecordId>, addr: NetAddr, probe: bool) {
        if let Some(rid) = rid {
            self.peer_man.on_active(rid, true);
        }
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                Duration::from_millis(DIAL_TIMEOUT_MS),
                TcpStream::connect(addr.socket_addr()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))
            });
            let _ = tx.send(Event::DialDone { rid, addr, probe, result });
        });
    }

    fn on_dial_done(
        &mut self,
        rid: Option<RecordId>,
        addr: NetAddr,
        probe: bool,
        result: std::io::Result<TcpStream>,
    ) {
        match result {
            Ok(stream) => {
                debug!(%addr, probe, "outbound connection up");
                let key = self.install_conn(stream, addr, StreamFlags::OUTBOUND);
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.set(ConnFlags::CONNECTED);
                    if probe {
                        conn.set(ConnFlags::PROBE);
                    }
                    conn.record = rid;
                    // initiate the secure channel
                    let init = Msg::SChannelInitiate(msgs::SChannelInitiate {
                        nonce_pub: conn.sc.nonce_pub(),
                    });
                    if conn.send(&init).is_err() {
                        self.drop_conn(key, DisconnectReason::Drown, None);
                    }
                }
            }
            Err(e) => {
                debug!(%addr, "dial failed: {e}");
                if probe {
                    self.peer_man.on_addr_unreachable(&addr);
                }
                if let Some(rid) = rid {
                    self.peer_man.on_active(rid, false);
                    self.peer_man.on_remote_error(rid, false);
                }
            }
        }
    }

    /// Feed raw bytes through the connection's codec, dispatching each
    /// frame. A handler may delete this (or any) connection; the liveness
    /// check per iteration is what keeps that safe.
    fn on_data(&mut self, key: ConnKey, bytes: &[u8]) {
        let mut consumed = 0;
        loop {
            let Some(conn) = self.conns.get_mut(&key) else {
                return; // deleted by a handler; drop the tail silently
            };
            let outcome = match conn.reader.next(&mut conn.sc, bytes, &mut consumed) {
                Ok(o) => o,
                Err(v) => {
                    self.drop_conn(key, DisconnectReason::Protocol(v), Some(bye_reason::BAN));
                    return;
                }
            };
            match outcome {
                crate::codec::ReadOutcome::NeedMore => return,
                crate::codec::ReadOutcome::Frame { msg_type, payload } => {
                    let wire_len = payload.len();
                    let msg = match Msg::decode(msg_type, &payload) {
                        Ok(m) => m,
                        Err(_) => {
                            self.drop_conn(
                                key,
                                DisconnectReason::Protocol(
                                    crate::types::ProtocolViolation::Corrupt(msg_type),
                                ),
                                Some(bye_reason::BAN),
                            );
                            return;
                        }
                    };
                    if let Err(reason) = self.on_msg(key, msg, wire_len) {
                        let bye = if reason.is_ban() { Some(bye_reason::BAN) } else { None };
                        self.drop_conn(key, reason, bye);
                        return;
                    }
                }
            }
        }
    }

    /// Tear down one connection: bye, task release, rating policy, removal.
    fn drop_conn(&mut self, key: ConnKey, reason: DisconnectReason, bye: Option<u8>) {
        let Some(mut conn) = self.conns.remove(&key) else { return };
        info!(addr = %conn.addr, %reason, "-peer");

        if let Some(code) = bye {
            if conn.is(ConnFlags::CONNECTED) {
                let _ = conn.send(&Msg::Bye(msgs::Bye { reason: code }));
            }
        }

        if let Some(id) = conn.peer_id {
            if self.by_peer.get(&id) == Some(&key) {
                self.by_peer.remove(&id);
            }
            if let Some(obs) = self.observer.as_mut() {
                obs.on_peer_disconnected(id, &reason);
            }
        }

        // release this connection's tasks and try to re-home them
        let requeued = self.tasks.release_conn(key);

        if let Some(rid) = conn.record {
            // a duplicate-resolution survivor may still hold this record
            let still_held = self.conns.values().any(|c| c.record == Some(rid));
            if !still_held {
                self.peer_man.on_active(rid, false);
            }
            match &reason {
                DisconnectReason::Protocol(_) | DisconnectReason::Insane => {
                    self.peer_man.ban(rid);
                }
                DisconnectReason::RequestTimeout => {
                    let penalty = self.cfg.rating.penalty_timeout;
                    self.peer_man.rating_modify(rid, penalty, false);
                }
                DisconnectReason::Io(_) | DisconnectReason::Drown => {
                    self.peer_man.on_remote_error(rid, false);
                }
                DisconnectReason::Bye(_)
                | DisconnectReason::Duplicate
                | DisconnectReason::Loopback
                | DisconnectReason::Policy => {}
            }
        }

        drop(conn); // closes the writer channel; reader dies on socket close
        for task in requeued {
            self.try_assign_task(task);
        }
    }

    // -- task assignment ------------------------------------------------------

    /// Peers eligible for assignments, best rating first.
    fn peers_by_rating(&self) -> Vec<ConnKey> {
        let mut keys: Vec<(u32, ConnKey)> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_full_peer())
            .map(|(k, c)| {
                let rating = c
                    .record
                    .and_then(|rid| self.peer_man.get(rid))
                    .map(|r| r.rating)
                    .unwrap_or(0);
                (rating, *k)
            })
            .collect();
        keys.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        keys.into_iter().map(|(_, k)| k).collect()
    }

    fn try_assign_task(&mut self, tkey: TaskKey) {
        for ckey in self.peers_by_rating() {
            if self.tasks.get(&tkey).map(|t| t.owner.is_some()).unwrap_or(true) {
                return; // gone or already assigned
            }
            if self.try_assign_to(tkey, ckey) {
                return;
            }
        }
    }

    /// Hand every unassigned task this peer qualifies for.
    fn take_tasks(&mut self, ckey: ConnKey) {
        for tkey in self.tasks.unassigned_keys() {
            self.try_assign_to(tkey, ckey);
        }
    }

    fn try_assign_to(&mut self, tkey: TaskKey, ckey: ConnKey) -> bool {
        let Some(task) = self.tasks.get(&tkey) else { return false };
        if task.owner.is_some() {
            return false;
        }
        let target = task.target;

        let Some(conn) = self.conns.get(&ckey) else { return false };
        if !conn.is_full_peer() {
            return false;
        }
        let Some(tip) = conn.tip else { return false };
        let (id, is_block) = tkey;

        if tip.height < id.height {
            return false;
        }
        if tip.height == id.height {
            if id.height != 0 {
                if tip.hash != id.hash {
                    return false;
                }
            } else if !conn.is(ConnFlags::HAS_TREASURY) {
                return false;
            }
        }
        if conn.rejected.contains(&tkey) {
            return false;
        }
        if self.tasks.conn_has_block(ckey) {
            return false; // one body transfer per peer at a time
        }

        let fast = self.cfg.fast_sync;
        let (msg, count) = if is_block {
            if !self.tasks.body_budget_left() {
                return false;
            }
            let (req, count) = self.tasks.compose_body_request(&tkey, &target, fast.as_ref());
            (Msg::GetBodyPack(req), count)
        } else {
            if self.tasks.hdr_budget_left() == 0 {
                return false;
            }
            let cursor = self.chain.tip().height;
            let (req, count) = self.tasks.compose_hdr_request(&tkey, cursor);
            (Msg::GetHdrPack(req), count)
        };

        let Some(conn) = self.conns.get_mut(&ckey) else { return false };
        match conn.send(&msg) {
            Ok(()) => {}
            Err(SendError::Drown) => {
                self.drop_conn(ckey, DisconnectReason::Drown, None);
                return false;
            }
            Err(_) => return false,
        }

        self.tasks.assign(tkey, ckey, count, fast.as_ref());
        if let Some(rid) = self.conns.get(&ckey).and_then(|c| c.record) {
            self.peer_man.on_active(rid, true); // spends the starvation boost
        }
        self.refresh_request_timer(ckey);
        true
    }

    /// Re-arm the per-connection request timer from the head task.
    fn refresh_request_timer(&mut self, ckey: ConnKey) {
        let deadline = self.tasks.head_of(ckey).map(|t| {
            let timeout = if t.key.1 {
                self.cfg.timeout.get_block_ms
            } else {
                self.cfg.timeout.get_hdr_ms
            };
            t.assigned_at_ms + timeout
        });
        if let Some(conn) = self.conns.get_mut(&ckey) {
            conn.request_deadline_ms = deadline;
        }
    }

    /// Bandwidth-estimate → rating delta mapping (the feedback loop).
    fn bw_rating_delta(&self, ckey: ConnKey) -> u32 {
        let ewma = self.conns.get(&ckey).map(|c| c.bw_ewma_bps).unwrap_or(0);
        ((ewma / BPS_PER_RATING_POINT) as u32).clamp(1, self.cfg.rating.reward_block)
    }

    // -- broadcast ------------------------------------------------------------

    /// Announce pool transactions from this connection's cursor until the
    /// ring runs dry or the peer chokes.
    fn broadcast_txs(&mut self, ckey: ConnKey) {
        let mut extra = 0usize;
        loop {
            let Some(conn) = self.conns.get_mut(&ckey) else { return };
            if conn.login_flags & login_flags::SPREAD_TXS == 0 || conn.is_choking(extra) {
                return;
            }
            let Some(item) = self.tx_ring.since(conn.tx_cursor).next().copied() else {
                return;
            };
            let msg = Msg::HaveTransaction(msgs::HaveTransaction { id: item.key });
            if conn.send(&msg).is_err() {
                self.drop_conn(ckey, DisconnectReason::Drown, None);
                return;
            }
            conn.tx_cursor = item.seq + 1;
            extra += item.size_hint;
        }
    }

    /// Announce bulletin keys from this connection's floor.
    fn broadcast_bbs(&mut self, ckey: ConnKey) {
        let mut extra = 0usize;
        loop {
            let Some(conn) = self.conns.get_mut(&ckey) else { return };
            if conn.login_flags & login_flags::BBS == 0 || conn.is_choking(extra) {
                return;
            }
            let Some(&(key, t, size)) = self.bbs.keys_after(conn.bbs_floor, None).first() else {
                return;
            };
            let msg = Msg::BbsHaveMsg(msgs::BbsHaveMsg { key });
            if conn.send(&msg).is_err() {
                self.drop_conn(ckey, DisconnectReason::Drown, None);
                return;
            }
            conn.bbs_floor = (t, key);
            extra += size;
        }
    }

    /// Push full bulletins for one subscribed channel, resuming from the
    /// per-channel floor.
    fn broadcast_bbs_channel(&mut self, ckey: ConnKey, channel: u32) {
        let mut extra = 0usize;
        loop {
            let Some(conn) = self.conns.get_mut(&ckey) else { return };
            let Some(floor) = conn.subscriptions.get(&channel).copied() else { return };
            if conn.is_choking(extra) {
                return;
            }
            let Some(&(key, t, size)) = self.bbs.keys_after(floor, Some(channel)).first() else {
                return;
            };
            let Some(rec) = self.bbs.get(&key) else { return };
            let (_, wire) = rec.wire(&key);
            if conn.send(&Msg::BbsMsg(wire)).is_err() {
                self.drop_conn(ckey, DisconnectReason::Drown, None);
                return;
            }
            conn.subscriptions.insert(channel, (t, key));
            extra += size;
        }
    }

    /// New bulletin arrived (from a peer or locally): store + announce.
    fn accept_bbs(&mut self, msg: msgs::BbsMsg, from: Option<ConnKey>) {
        let (key, status) = self.bbs.insert(msg, now());
        if status != crate::bbs::BbsStatus::Stored {
            return;
        }
        self.wanted_bbs.delete(&key);
        if let Some(obs) = self.observer.as_mut() {
            if let Some(rec) = self.bbs.get(&key) {
                obs.on_bbs_msg(rec.channel, &key, &rec.payload);
            }
        }
        let keys: Vec<ConnKey> = self.conns.keys().copied().collect();
        for ckey in keys {
            if Some(ckey) == from {
                continue;
            }
            self.broadcast_bbs(ckey);
            let channels: Vec<u32> = self
                .conns
                .get(&ckey)
                .map(|c| c.subscriptions.keys().copied().collect())
                .unwrap_or_default();
            for ch in channels {
                self.broadcast_bbs_channel(ckey, ch);
            }
        }
    }

    /// Fluff a transaction id into the ring and drain every peer's cursor.
    fn announce_tx(&mut self, id: Hash, size_hint: usize, skip: Option<ConnKey>) {
        self.wanted_tx.delete(&id);
        self.tx_ring.push(id, size_hint);
        let keys: Vec<ConnKey> = self.conns.keys().copied().collect();
        for ckey in keys {
            if Some(ckey) == skip {
                continue;
            }
            self.broadcast_txs(ckey);
        }
    }

    /// Forward a stem transaction to one capable peer; fall back to fluff.
    fn stem_tx(&mut self, id: Hash, tx: Vec<u8>) {
        let size = tx.len();
        let candidates: Vec<ConnKey> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_full_peer() && c.login_flags & login_flags::SPREAD_TXS != 0)
            .map(|(k, _)| *k)
            .collect();
        if !candidates.is_empty() {
            let ckey = candidates[rand::random::<usize>() % candidates.len()];
            let msg = Msg::NewTransaction(msgs::NewTransaction { tx, fluff: false });
            if let Some(conn) = self.conns.get_mut(&ckey) {
                if conn.send(&msg).is_ok() {
                    return;
                }
            }
        }
        self.announce_tx(id, size, None);
    }

    fn send_recommendations(&mut self, ckey: ConnKey) {
        let peers = self.peer_man.recommend(RECOMMEND_BATCH);
        let Some(conn) = self.conns.get_mut(&ckey) else { return };
        for (id, last_addr) in peers {
            if Some(id) == conn.peer_id {
                continue;
            }
            let _ = conn.send(&Msg::PeerInfo(msgs::PeerInfo { id, last_addr }));
        }
        conn.recommend_at_ms = Some(now_ms() + self.cfg.timeout.recommend_ms);
    }

    // -- maintenance ----------------------------------------------------------

    fn on_tick(&mut self) {
        let t = now_ms();

        // deferred verifier verdicts: flush outside any handler
        if !self.insane_queue.is_empty() {
            let queue = std::mem::take(&mut self.insane_queue);
            for id in queue {
                info!(peer = %id, "insane peer");
                if let Some(rid) = self.peer_man.find(&id) {
                    self.peer_man.ban(rid);
                }
                if let Some(&ckey) = self.by_peer.get(&id) {
                    self.drop_conn(ckey, DisconnectReason::Insane, Some(bye_reason::BAN));
                }
            }
        }

        // request timers
        let expired: Vec<ConnKey> = self
            .conns
            .iter()
            .filter(|(_, c)| c.request_deadline_ms.map(|d| d <= t).unwrap_or(false))
            .map(|(k, _)| *k)
            .collect();
        for ckey in expired {
            self.drop_conn(ckey, DisconnectReason::RequestTimeout, Some(bye_reason::TIMEOUT));
        }

        // wanted expirations: re-request by broadcast, then forget
        for key in self.wanted_tx.take_expired(t) {
            let msg = Msg::GetTransaction(msgs::GetTransaction { id: key });
            self.send_to_capable(&msg, login_flags::SPREAD_TXS);
        }
        for key in self.wanted_bbs.take_expired(t) {
            let msg = Msg::BbsGetMsg(msgs::BbsGetMsg { key });
            self.send_to_capable(&msg, login_flags::BBS);
        }

        // per-connection recommendation timers
        let due: Vec<ConnKey> = self
            .conns
            .iter()
            .filter(|(_, c)| c.recommend_at_ms.map(|d| d <= t).unwrap_or(false))
            .map(|(k, _)| *k)
            .collect();
        for ckey in due {
            self.send_recommendations(ckey);
        }

        // peer-manager activation pass
        if t >= self.next_peers_update_ms {
            self.next_peers_update_ms = t + self.cfg.timeout.peers_update_ms;
            let actions = self.peer_man.update();
            for (rid, addr) in actions.activate {
                if self.peer_man.is_banned(rid) {
                    continue;
                }
                self.dial(Some(rid), addr, false);
            }
            for rid in actions.deactivate {
                let victim = self
                    .conns
                    .iter()
                    .find(|(_, c)| c.record == Some(rid))
                    .map(|(k, _)| *k);
                if let Some(ckey) = victim {
                    self.drop_conn(ckey, DisconnectReason::Policy, Some(bye_reason::OTHER));
                }
            }
        }

        // persistence flush
        if t >= self.next_flush_ms {
            self.next_flush_ms = t + self.cfg.timeout.peers_flush_ms;
            self.flush();
        }

        // bulletin cleanup rides the flush cadence
        if t >= self.next_bbs_cleanup_ms {
            self.next_bbs_cleanup_ms = t + self.cfg.timeout.peers_flush_ms;
            self.bbs.cleanup(now());
        }
    }

    fn send_to_capable(&mut self, msg: &Msg, capability: u32) {
        let keys: Vec<ConnKey> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_full_peer() && c.login_flags & capability != 0)
            .map(|(k, _)| *k)
            .collect();
        for ckey in keys {
            if let Some(conn) = self.conns.get_mut(&ckey) {
                if conn.send(msg).is_err() {
                    self.drop_conn(ckey, DisconnectReason::Drown, None);
                }
            }
        }
    }

    fn flush(&mut self) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save_peers(&self.peer_man.snapshot()) {
            warn!("address book flush failed: {e}");
        }
        if let Err(e) = store.save_bbs(self.bbs.iter().map(|(k, r)| (*k, r.clone()))) {
            warn!("bulletin flush failed: {e}");
        }
    }

    // -- api ------------------------------------------------------------------

    fn on_api(&mut self, call: ApiCall) -> bool {
        match call {
            ApiCall::RequestData { id, is_block, target } => {
                if self.tasks.request_data(id, is_block, target) {
                    self.try_assign_task((id, is_block));
                }
            }
            ApiCall::PeerInsane(id) => {
                self.insane_queue.push(id);
            }
            ApiCall::BroadcastTx { id, tx, mode } => match mode {
                TxMode::Stem => self.stem_tx(id, tx),
                TxMode::Fluff => self.announce_tx(id, tx.len(), None),
            },
            ApiCall::BroadcastBbs(msg) => self.accept_bbs(msg, None),
            ApiCall::AnnounceTip => {
                let tip = self.chain.tip();
                let keys: Vec<ConnKey> = self
                    .conns
                    .iter()
                    .filter(|(_, c)| c.is_full_peer())
                    .map(|(k, _)| *k)
                    .collect();
                for ckey in keys {
                    if let Some(conn) = self.conns.get_mut(&ckey) {
                        if conn.send(&Msg::NewTip(msgs::NewTip { tip })).is_err() {
                            self.drop_conn(ckey, DisconnectReason::Drown, None);
                        }
                    }
                }
            }
            ApiCall::PeerCount(reply) => {
                let n = self.conns.values().filter(|c| c.is_full_peer()).count();
                let _ = reply.send(n);
            }
            ApiCall::AccessibleAddrs(reply) => {
                let mut out = Vec::new();
                if let Some(ip) = self.external_ip {
                    out.push(NetAddr { ip, port: self.listen_addr.port });
                }
                out.push(self.listen_addr);
                let _ = reply.send(out);
            }
            ApiCall::Stop(reply) => {
                let keys: Vec<ConnKey> = self.conns.keys().copied().collect();
                for ckey in keys {
                    self.drop_conn(ckey, DisconnectReason::Policy, Some(bye_reason::STOPPING));
                }
                self.flush();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

// =============================================================================
// PER-CONNECTION IO TASKS
// =============================================================================

async fn reader_task(mut r: OwnedReadHalf, tx: mpsc::UnboundedSender<Event>, key: ConnKey) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match r.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(Event::ConnIo { conn: key, error: "eof".into() });
                return;
            }
            Ok(n) => {
                if tx.send(Event::Data { conn: key, bytes: buf[..n].to_vec() }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Event::ConnIo { conn: key, error: e.to_string() });
                return;
            }
        }
    }
}

async fn writer_task(
    mut w: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    unsent: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<Event>,
    key: ConnKey,
) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len();
        if let Err(e) = w.write_all(&frame).await {
            let _ = tx.send(Event::ConnIo { conn: key, error: e.to_string() });
            return;
        }
        unsent.fetch_sub(len, Ordering::Relaxed);
    }
    let _ = w.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.listen = NetAddr::new(Ipv4Addr::LOCALHOST, 0);
        cfg.beacon_period_ms = 0;
        cfg
    }

    #[tokio::test]
    async fn bind_mints_identity_and_port() {
        let node = Node::bind(test_cfg(), None).await.unwrap();
        assert!(!node.peer_id().is_zero());
        assert_ne!(node.listen_addr().port, 0);
    }

    #[tokio::test]
    async fn bootstrap_addresses_seed_the_book() {
        let mut cfg = test_cfg();
        let seed = NetAddr::new(Ipv4Addr::new(10, 1, 1, 1), 10005);
        cfg.connect = vec![seed];
        let node = Node::bind(cfg, None).await.unwrap();
        assert!(node.peer_man.find_by_addr(&seed).is_some());
    }

    #[tokio::test]
    async fn handle_answers_while_idle_and_stops() {
        let node = Node::bind(test_cfg(), None).await.unwrap();
        let handle = node.handle();
        let listen = node.listen_addr();
        let run = tokio::spawn(node.run());

        assert_eq!(handle.peer_count().await, 0);
        let addrs = handle.accessible_addrs().await;
        assert!(addrs.contains(&listen));

        handle.stop().await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn request_data_with_no_peers_parks_the_task() {
        let mut node = Node::bind(test_cfg(), None).await.unwrap();
        node.on_api(ApiCall::RequestData {
            id: BlockId { height: 3, hash: [3; 32] },
            is_block: true,
            target: BlockId { height: 3, hash: [3; 32] },
        });
        assert_eq!(node.tasks.unassigned_keys().len(), 1);
    }

    #[tokio::test]
    async fn insane_verdict_is_deferred_to_the_tick() {
        let mut node = Node::bind(test_cfg(), None).await.unwrap();
        let villain = PeerId([9; 32]);
        let rid = node.peer_man.on_peer(villain, NetAddr::new(Ipv4Addr::LOCALHOST, 1), true).unwrap();

        node.on_api(ApiCall::PeerInsane(villain));
        assert!(!node.peer_man.is_banned(rid), "ban must not land mid-handler");

        node.on_tick();
        assert!(node.peer_man.is_banned(rid));
    }

    #[test]
    fn duplicate_tie_break_is_symmetric() {
        let small = PeerId([1; 32]);
        let big = PeerId([2; 32]);
        // the small side keeps its outbound link; the big side keeps its
        // inbound one. Both descriptions name the same TCP connection.
        assert!(dispatch::duplicate_survivor_is_outbound(&small, &big));
        assert!(!dispatch::duplicate_survivor_is_outbound(&big, &small));
    }
}
