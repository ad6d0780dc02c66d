//! End-to-end scenarios over real localhost sockets.
//!
//! Each test stands up one or two full nodes plus, where a misbehaving or
//! scripted peer is needed, a hand-driven wire client built from the same
//! codec and secure-channel primitives the node uses.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use weft::msgs::{self, Msg};
use weft::node::{ChainHandler, DataStatus, Node, NodeHandle, TxHandler, TxMode, TxStatus};
use weft::{
    write_frame, BlockId, Config, Hash, IdentityKey, MsgReader, NetAddr, NodeStore, PeerId,
    ReadOutcome, SChannel, Tip,
};

const RULES: Hash = [7u8; 32];

fn tip_at(height: u64, work: u128) -> Tip {
    Tip { height, hash: [height as u8; 32], prev: [0; 32], chain_work: work, timestamp: 1 }
}

fn bid(height: u64) -> BlockId {
    BlockId { height, hash: [height as u8; 32] }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_peers(handle: &NodeHandle, want: usize, what: &str) {
    for _ in 0..200 {
        if handle.peer_count().await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// TEST COLLABORATORS
// =============================================================================

#[derive(Default)]
struct ChainState {
    tip: Tip,
    headers: Vec<(Tip, PeerId)>,
    blocks: Vec<(BlockId, PeerId)>,
    bodies: HashMap<BlockId, Vec<u8>>,
}

#[derive(Clone, Default)]
struct TestChain {
    state: Arc<Mutex<ChainState>>,
}

impl TestChain {
    fn with_tip(tip: Tip) -> Self {
        let chain = TestChain::default();
        chain.state.lock().unwrap().tip = tip;
        chain
    }

    fn blocks_from(&self) -> Vec<(BlockId, PeerId)> {
        self.state.lock().unwrap().blocks.clone()
    }
}

impl ChainHandler for TestChain {
    fn tip(&self) -> Tip {
        self.state.lock().unwrap().tip
    }
    fn is_tip_needed(&self, remote: &Tip) -> bool {
        remote.height > self.state.lock().unwrap().tip.height
    }
    fn on_header(&mut self, hdr: Tip, from: PeerId) -> DataStatus {
        self.state.lock().unwrap().headers.push((hdr, from));
        DataStatus::Accepted
    }
    fn on_header_pack(&mut self, headers: Vec<Tip>, from: PeerId) -> DataStatus {
        let mut st = self.state.lock().unwrap();
        for h in headers {
            st.headers.push((h, from));
        }
        DataStatus::Accepted
    }
    fn on_block(&mut self, id: BlockId, _payload: Vec<u8>, from: PeerId) -> DataStatus {
        self.state.lock().unwrap().blocks.push((id, from));
        DataStatus::Accepted
    }
    fn on_block_pack(&mut self, top: BlockId, _bodies: Vec<Vec<u8>>, from: PeerId) -> DataStatus {
        self.state.lock().unwrap().blocks.push((top, from));
        DataStatus::Accepted
    }
    fn get_hdr(&self, _id: &BlockId) -> Option<Tip> {
        None
    }
    fn get_hdr_pack(&self, _top: &BlockId, _count: u32) -> Vec<Tip> {
        Vec::new()
    }
    fn get_body(&self, id: &BlockId) -> Option<Vec<u8>> {
        self.state.lock().unwrap().bodies.get(id).cloned()
    }
    fn get_body_pack(&self, req: &msgs::GetBodyPack) -> Vec<Vec<u8>> {
        match self.state.lock().unwrap().bodies.get(&req.top) {
            Some(b) => vec![b.clone()],
            None => Vec::new(),
        }
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

#[derive(Clone, Default)]
struct TestPool {
    txs: Arc<Mutex<HashMap<Hash, Vec<u8>>>>,
    received_order: Arc<Mutex<Vec<Hash>>>,
}

impl TestPool {
    fn seed(&self, tx: Vec<u8>) -> Hash {
        let id = self.tx_key(&tx);
        self.txs.lock().unwrap().insert(id, tx);
        id
    }

    fn received(&self) -> Vec<Hash> {
        self.received_order.lock().unwrap().clone()
    }
}

impl TxHandler for TestPool {
    fn tx_key(&self, tx: &[u8]) -> Hash {
        use sha3::{Digest, Sha3_256};
        Sha3_256::digest(tx).into()
    }
    fn has_transaction(&self, id: &Hash) -> bool {
        self.txs.lock().unwrap().contains_key(id)
    }
    fn get_transaction(&self, id: &Hash) -> Option<Vec<u8>> {
        self.txs.lock().unwrap().get(id).cloned()
    }
    fn on_transaction(&mut self, tx: Vec<u8>, _from: Option<PeerId>, _mode: TxMode) -> TxStatus {
        let id = self.tx_key(&tx);
        let mut txs = self.txs.lock().unwrap();
        if txs.contains_key(&id) {
            return TxStatus::Duplicate;
        }
        txs.insert(id, tx);
        self.received_order.lock().unwrap().push(id);
        TxStatus::Ok
    }
}

fn quick_config() -> Config {
    let mut cfg = Config::default();
    cfg.listen = NetAddr::new(Ipv4Addr::LOCALHOST, 0);
    cfg.rules_hash = RULES;
    cfg.beacon_period_ms = 0;
    cfg.timeout.peers_update_ms = 100;
    cfg.timeout.peers_flush_ms = 200;
    cfg
}

struct NodeUnderTest {
    handle: NodeHandle,
    id: PeerId,
    addr: NetAddr,
    chain: TestChain,
    pool: TestPool,
    task: tokio::task::JoinHandle<()>,
}

async fn spawn_node(cfg: Config, store: Option<NodeStore>) -> NodeUnderTest {
    let chain = TestChain::with_tip(Tip::default());
    let pool = TestPool::default();

    let mut node = Node::bind(cfg, store).await.expect("bind");
    let handle = node.handle();
    let id = node.peer_id();
    let addr = node.listen_addr();
    node.set_chain(Box::new(chain.clone()));
    node.set_tx_pool(Box::new(pool.clone()));
    let task = tokio::spawn(node.run());

    NodeUnderTest { handle, id, addr, chain, pool, task }
}

// =============================================================================
// SCRIPTED WIRE CLIENT
// =============================================================================

/// A hand-driven peer speaking the real protocol; used to script silence,
/// rejections and corruption that an honest node would never produce.
struct WireClient {
    stream: TcpStream,
    sc: SChannel,
    reader: MsgReader,
    identity: IdentityKey,
    pending: Vec<u8>,
    consumed: usize,
}

impl WireClient {
    async fn connect(addr: NetAddr) -> WireClient {
        let stream = TcpStream::connect(addr.socket_addr()).await.expect("connect");
        stream.set_nodelay(true).ok();
        WireClient {
            stream,
            sc: SChannel::new(),
            reader: MsgReader::new(4096),
            identity: IdentityKey::generate(),
            pending: Vec::new(),
            consumed: 0,
        }
    }

    async fn send(&mut self, msg: &Msg) {
        let frame = write_frame(msg, &mut self.sc).expect("encode");
        self.stream.write_all(&frame).await.expect("write");
    }

    /// Send a frame with its last byte flipped (corrupts the MAC).
    async fn send_corrupted(&mut self, msg: &Msg) {
        let mut frame = write_frame(msg, &mut self.sc).expect("encode");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        self.stream.write_all(&frame).await.expect("write");
    }

    async fn recv(&mut self) -> Option<Msg> {
        loop {
            if self.consumed < self.pending.len() {
                match self
                    .reader
                    .next(&mut self.sc, &self.pending.clone(), &mut self.consumed)
                    .ok()?
                {
                    ReadOutcome::Frame { msg_type, payload } => {
                        return Msg::decode(msg_type, &payload).ok();
                    }
                    ReadOutcome::NeedMore => {}
                }
            }
            if self.consumed >= self.pending.len() {
                self.pending.clear();
                self.consumed = 0;
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn recv_expect<F: Fn(&Msg) -> bool>(&mut self, what: &str, pred: F) -> Msg {
        for _ in 0..50 {
            match self.recv().await {
                Some(m) if pred(&m) => return m,
                Some(_) => continue,
                None => break,
            }
        }
        panic!("did not receive {what}");
    }

    /// Full secure-channel + login dance against a listening node.
    async fn login(&mut self, tip: Option<Tip>) {
        let init = Msg::SChannelInitiate(msgs::SChannelInitiate { nonce_pub: self.sc.nonce_pub() });
        self.send(&init).await;

        let m = self.recv_expect("peer nonce", |m| matches!(m, Msg::SChannelInitiate(_))).await;
        let Msg::SChannelInitiate(peer_init) = m else { unreachable!() };
        self.sc.init_ciphers(&peer_init.nonce_pub);

        self.recv_expect("schannel ready", |m| matches!(m, Msg::SChannelReady(_))).await;
        self.send(&Msg::SChannelReady(msgs::Empty)).await;

        let sig = self
            .identity
            .sign_auth(&peer_init.nonce_pub, weft::IdentityType::Node);
        self.send(&Msg::Authentication(msgs::Authentication {
            id: self.identity.peer_id(),
            id_type: b'N',
            sig,
        }))
        .await;
        self.send(&Msg::PeerInfoSelf(msgs::PeerInfoSelf { port: 0 })).await;
        self.send(&Msg::Login(msgs::Login { rules_hash: RULES, flags: 3 })).await;

        // the node greets a logged-in peer with its own login
        self.recv_expect("node login", |m| matches!(m, Msg::Login(_))).await;

        if let Some(tip) = tip {
            self.send(&Msg::NewTip(msgs::NewTip { tip })).await;
        }
    }
}

// =============================================================================
// E1: HANDSHAKE
// =============================================================================

#[tokio::test]
async fn e1_handshake_and_login() {
    let b = spawn_node(quick_config(), None).await;

    let mut cfg = quick_config();
    cfg.connect = vec![b.addr];
    let a = spawn_node(cfg, None).await;

    wait_peers(&a.handle, 1, "A logged in").await;
    wait_peers(&b.handle, 1, "B logged in").await;

    // each side sees the other exactly once
    assert_eq!(a.handle.peer_count().await, 1);
    assert_eq!(b.handle.peer_count().await, 1);

    a.task.abort();
    b.task.abort();
}

// =============================================================================
// E2: DUPLICATE CONNECTION RACE
// =============================================================================

#[tokio::test]
async fn e2_simultaneous_dial_leaves_one_connection() {
    // reserve two ports so both configs can name each other up front
    let (pa, pb) = {
        let la = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let lb = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        (la.local_addr().unwrap().port(), lb.local_addr().unwrap().port())
    };
    let addr_a = NetAddr::new(Ipv4Addr::LOCALHOST, pa);
    let addr_b = NetAddr::new(Ipv4Addr::LOCALHOST, pb);

    let mut cfg_a = quick_config();
    cfg_a.listen = addr_a;
    cfg_a.connect = vec![addr_b];
    let mut cfg_b = quick_config();
    cfg_b.listen = addr_b;
    cfg_b.connect = vec![addr_a];

    let a = spawn_node(cfg_a, None).await;
    let b = spawn_node(cfg_b, None).await;

    wait_peers(&a.handle, 1, "A settled on one connection").await;
    wait_peers(&b.handle, 1, "B settled on one connection").await;

    // stable: still one connection each after the dust settles
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.handle.peer_count().await, 1);
    assert_eq!(b.handle.peer_count().await, 1);

    a.task.abort();
    b.task.abort();
}

// =============================================================================
// E3: BAN ON BAD MAC
// =============================================================================

#[tokio::test]
async fn e3_bad_mac_bans_and_refuses_reconnect() {
    let node = spawn_node(quick_config(), None).await;

    let mut client = WireClient::connect(node.addr).await;
    client.login(None).await;

    wait_peers(&node.handle, 1, "client logged in").await;

    // tamper one frame; the node must cut us off
    client.send_corrupted(&Msg::PING).await;
    wait_peers(&node.handle, 0, "client dropped").await;

    // the identity is banned: a clean reconnect is refused with Bye(ban)
    let identity = IdentityKey::from_bytes(&client.identity.secret_bytes());
    let mut again = WireClient::connect(node.addr).await;
    again.identity = identity;

    let init = Msg::SChannelInitiate(msgs::SChannelInitiate { nonce_pub: again.sc.nonce_pub() });
    again.send(&init).await;
    let m = again.recv_expect("peer nonce", |m| matches!(m, Msg::SChannelInitiate(_))).await;
    let Msg::SChannelInitiate(peer_init) = m else { unreachable!() };
    again.sc.init_ciphers(&peer_init.nonce_pub);
    again.recv_expect("ready", |m| matches!(m, Msg::SChannelReady(_))).await;
    again.send(&Msg::SChannelReady(msgs::Empty)).await;
    let sig = again.identity.sign_auth(&peer_init.nonce_pub, weft::IdentityType::Node);
    again
        .send(&Msg::Authentication(msgs::Authentication {
            id: again.identity.peer_id(),
            id_type: b'N',
            sig,
        }))
        .await;

    let bye = again.recv_expect("bye(ban)", |m| matches!(m, Msg::Bye(_))).await;
    assert_eq!(bye, Msg::Bye(msgs::Bye { reason: weft::bye_reason::BAN }));
    assert_eq!(node.handle.peer_count().await, 0);

    node.task.abort();
}

// =============================================================================
// E4: TASK REASSIGNMENT ON TIMEOUT
// =============================================================================

#[tokio::test]
async fn e4_silent_peer_times_out_and_task_moves() {
    let mut cfg = quick_config();
    cfg.timeout.get_block_ms = 700; // fail fast
    let node = spawn_node(cfg, None).await;

    let tip = tip_at(5, 100);

    let mut p = WireClient::connect(node.addr).await;
    p.login(Some(tip)).await;
    let mut q = WireClient::connect(node.addr).await;
    q.login(Some(tip)).await;

    wait_peers(&node.handle, 2, "both scripted peers in").await;

    // ask for block 5; P (first connection) gets the task and goes silent
    node.handle.request_data(bid(5), true, bid(5));
    let got_request = p
        .recv_expect("body request to P", |m| matches!(m, Msg::GetBodyPack(_)))
        .await;
    assert!(matches!(got_request, Msg::GetBodyPack(r) if r.top == bid(5)));

    // after the timeout the node drops P and re-asks Q, who delivers
    let req = q
        .recv_expect("body request to Q", |m| matches!(m, Msg::GetBodyPack(_)))
        .await;
    assert!(matches!(req, Msg::GetBodyPack(r) if r.top == bid(5)));
    q.send(&Msg::BodyPack(msgs::BodyPack { bodies: vec![vec![0xAB; 64]] })).await;

    let chain = node.chain.clone();
    let q_id = q.identity.peer_id();
    wait_for("block delivered by Q", || {
        chain.blocks_from().iter().any(|(id, from)| *id == bid(5) && *from == q_id)
    })
    .await;

    // P was disconnected with a timeout bye (or a straight close)
    wait_peers(&node.handle, 1, "P dropped").await;

    node.task.abort();
}

// =============================================================================
// E5: REJECTION ISOLATION
// =============================================================================

#[tokio::test]
async fn e5_data_missing_releases_to_another_peer() {
    let node = spawn_node(quick_config(), None).await;
    let tip = tip_at(5, 100);

    let mut p = WireClient::connect(node.addr).await;
    p.login(Some(tip)).await;
    let mut q = WireClient::connect(node.addr).await;
    q.login(Some(tip)).await;

    wait_peers(&node.handle, 2, "both scripted peers in").await;

    node.handle.request_data(bid(5), true, bid(5));

    // P rejects; the key lands in P's rejected set and moves to Q
    p.recv_expect("body request to P", |m| matches!(m, Msg::GetBodyPack(_))).await;
    p.send(&Msg::DATA_MISSING).await;

    q.recv_expect("body request to Q", |m| matches!(m, Msg::GetBodyPack(_))).await;
    q.send(&Msg::BodyPack(msgs::BodyPack { bodies: vec![vec![0xCD; 64]] })).await;

    let chain = node.chain.clone();
    let q_id = q.identity.peer_id();
    wait_for("block delivered by Q", || {
        chain.blocks_from().iter().any(|(id, from)| *id == bid(5) && *from == q_id)
    })
    .await;

    // P is still a peer in good standing (no penalty, no disconnect)
    assert_eq!(node.handle.peer_count().await, 2);

    node.task.abort();
}

// =============================================================================
// E6: CHOCKING BACKPRESSURE
// =============================================================================

#[tokio::test]
async fn e6_choked_broadcast_delivers_each_tx_once() {
    let b = spawn_node(quick_config(), None).await;

    let mut cfg_a = quick_config();
    cfg_a.connect = vec![b.addr];
    // tiny choke watermark so the broadcast trips mid-walk
    cfg_a.bandwidth.choke_bytes = 96;
    let a = spawn_node(cfg_a, None).await;

    wait_peers(&a.handle, 1, "A linked").await;
    wait_peers(&b.handle, 1, "B linked").await;

    // flood: 40 transactions of 64 bytes each
    let mut sent = HashSet::new();
    for i in 0..40u8 {
        let tx = vec![i; 64];
        let id = a.pool.seed(tx.clone());
        sent.insert(id);
        a.handle.broadcast_tx(id, tx, TxMode::Fluff);
    }

    let pool_b = b.pool.clone();
    wait_for("all txs at B", || pool_b.received().len() == sent.len()).await;

    let received: HashSet<Hash> = b.pool.received().into_iter().collect();
    assert_eq!(received, sent);
    // exactly once each: the order log has no duplicates
    assert_eq!(b.pool.received().len(), received.len());

    a.task.abort();
    b.task.abort();
}

// =============================================================================
// E7: PERSISTENCE ROUND-TRIP
// =============================================================================

#[tokio::test]
async fn e7_address_book_survives_restart() {
    let dir = std::env::temp_dir().join(format!("weft_e7_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let store = NodeStore::open(&dir).unwrap();
    let node = spawn_node(quick_config(), Some(store)).await;
    let node_id = node.id;
    let node_addr = node.addr;

    // two honest sessions and one that earns a ban
    let mut good1 = WireClient::connect(node_addr).await;
    good1.login(None).await;
    let mut good2 = WireClient::connect(node_addr).await;
    good2.login(None).await;
    let mut bad = WireClient::connect(node_addr).await;
    bad.login(None).await;

    wait_peers(&node.handle, 3, "three peers in").await;

    bad.send_corrupted(&Msg::PING).await;
    wait_peers(&node.handle, 2, "bad peer dropped").await;

    let (g1, g2, bad_id) =
        (good1.identity.peer_id(), good2.identity.peer_id(), bad.identity.peer_id());

    // stop flushes and releases the store
    node.handle.stop().await;
    let _ = node.task.await;

    // the flushed address book holds all three, the banned one at rating 0
    let store = NodeStore::open(&dir).unwrap();
    let stored: HashMap<PeerId, u32> =
        store.load_peers().unwrap().into_iter().map(|p| (p.id, p.rating)).collect();
    assert!(stored.get(&g1).copied().unwrap_or(0) > 0, "good peer 1 persisted");
    assert!(stored.get(&g2).copied().unwrap_or(0) > 0, "good peer 2 persisted");
    assert_eq!(stored.get(&bad_id).copied(), Some(0), "ban persisted");

    // restart on the same store: same identity, ban still effective
    let node2 = spawn_node(quick_config(), Some(store)).await;
    assert_eq!(node2.id, node_id, "identity persisted");

    let mut again = WireClient::connect(node2.addr).await;
    again.identity = IdentityKey::from_bytes(&bad.identity.secret_bytes());
    let init = Msg::SChannelInitiate(msgs::SChannelInitiate { nonce_pub: again.sc.nonce_pub() });
    again.send(&init).await;
    let m = again.recv_expect("peer nonce", |m| matches!(m, Msg::SChannelInitiate(_))).await;
    let Msg::SChannelInitiate(peer_init) = m else { unreachable!() };
    again.sc.init_ciphers(&peer_init.nonce_pub);
    again.recv_expect("ready", |m| matches!(m, Msg::SChannelReady(_))).await;
    again.send(&Msg::SChannelReady(msgs::Empty)).await;
    let sig = again.identity.sign_auth(&peer_init.nonce_pub, weft::IdentityType::Node);
    again
        .send(&Msg::Authentication(msgs::Authentication {
            id: again.identity.peer_id(),
            id_type: b'N',
            sig,
        }))
        .await;
    let bye = again.recv_expect("bye(ban)", |m| matches!(m, Msg::Bye(_))).await;
    assert_eq!(bye, Msg::Bye(msgs::Bye { reason: weft::bye_reason::BAN }));

    node2.task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}
