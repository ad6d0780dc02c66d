//! Per-message handlers.
//!
//! Every frame the codec yields lands here. Handlers return
//! `Err(DisconnectReason)` to tear the connection down; `on_data` in the
//! parent module applies the bye/penalty policy. A handler may also drop a
//! connection directly (its own or another's); the dispatch loop re-checks
//! liveness before touching the codec again.

use super::*;
use crate::connection::ConnState;
use crate::schannel::verify_auth;
use crate::types::{IdentityType, ProtocolViolation};

/// Advertised bulletin channel band for pick-channel.
const BBS_CHANNEL_BAND: u32 = 1024;

/// Tolerated peer clock skew before the observer hears about it.
const MAX_CLOCK_DRIFT_S: u64 = 600;

/// Duplicate-connection tie-break: the surviving link between two nodes is
/// the one dialed by the lexicographically smaller identity. Both sides
/// evaluate this from their own (local, remote) pair and agree.
pub(super) fn duplicate_survivor_is_outbound(my_id: &PeerId, peer_id: &PeerId) -> bool {
    my_id < peer_id
}

fn unexpected(code: u8) -> DisconnectReason {
    DisconnectReason::Protocol(ProtocolViolation::UnexpectedMsg(code))
}

fn violation(v: ProtocolViolation) -> DisconnectReason {
    DisconnectReason::Protocol(v)
}

impl Node {
    pub(super) fn on_msg(
        &mut self,
        key: ConnKey,
        msg: Msg,
        wire_len: usize,
    ) -> Result<(), DisconnectReason> {
        let code = msg.code();
        match msg {
            // secure channel and session
            Msg::SChannelInitiate(m) => self.on_schannel_init(key, m),
            Msg::SChannelReady(_) => self.on_schannel_ready(key),
            Msg::Authentication(m) => self.on_authentication(key, m),
            Msg::Login(m) => self.on_login(key, m),
            Msg::Bye(m) => {
                self.drop_conn(key, DisconnectReason::Bye(m.reason), None);
                Ok(())
            }
            Msg::Ping(_) => self.send_or_drop(key, &Msg::PONG),
            Msg::Pong(_) => self.on_pong(key),

            // peer exchange and small services
            Msg::PeerInfoSelf(m) => {
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.port = m.port;
                }
                Ok(())
            }
            Msg::PeerInfo(m) => {
                if m.id != self.my_id && m.last_addr.is_dialable() {
                    self.peer_man.on_peer(m.id, m.last_addr, false);
                }
                Ok(())
            }
            Msg::GetExternalAddr(_) => {
                let ip = match self.conns.get(&key) {
                    Some(c) => c.addr.ip,
                    None => return Ok(()),
                };
                self.send_or_drop(key, &Msg::ExternalAddr(msgs::ExternalAddr { ip }))
            }
            Msg::ExternalAddr(m) => {
                let conn = self.conns.get_mut(&key).ok_or_else(|| unexpected(code))?;
                if !conn.is(ConnFlags::AWAIT_EXT) {
                    return Err(unexpected(code));
                }
                conn.clear(ConnFlags::AWAIT_EXT);
                self.external_ip = Some(m.ip);
                Ok(())
            }
            Msg::GetTime(_) => self.send_or_drop(key, &Msg::Time(msgs::Time { value: now() })),
            Msg::Time(m) => {
                let conn = self.conns.get_mut(&key).ok_or_else(|| unexpected(code))?;
                if !conn.is(ConnFlags::AWAIT_TIME) {
                    return Err(unexpected(code));
                }
                conn.clear(ConnFlags::AWAIT_TIME);
                if m.value.abs_diff(now()) > MAX_CLOCK_DRIFT_S {
                    warn!(addr = %conn.addr, peer_time = m.value, "peer clock far off");
                    if let Some(obs) = self.observer.as_mut() {
                        obs.on_sync_error(SyncError::TimeDiffTooLarge);
                    }
                }
                Ok(())
            }

            // chain status and sync
            Msg::NewTip(m) => self.on_new_tip(key, m),
            Msg::GetHdr(m) => {
                self.require_full(key, code)?;
                match self.chain.get_hdr(&m.id) {
                    Some(hdr) => self.send_or_drop(key, &Msg::Hdr(msgs::Hdr { hdr })),
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }
            Msg::GetHdrPack(m) => {
                self.require_full(key, code)?;
                if m.count == 0 || m.count > self.cfg.bandwidth.hdr_pack_max {
                    return Err(violation(ProtocolViolation::RuleViolation));
                }
                let headers = self.chain.get_hdr_pack(&m.top, m.count);
                if headers.is_empty() {
                    self.send_or_drop(key, &Msg::DATA_MISSING)
                } else {
                    self.send_or_drop(key, &Msg::HdrPack(msgs::HdrPack { headers }))
                }
            }
            Msg::HdrPack(m) => self.on_hdr_pack(key, m, wire_len),
            Msg::GetBody(m) => {
                self.require_full(key, code)?;
                match self.chain.get_body(&m.id) {
                    Some(payload) => self.send_or_drop(key, &Msg::Body(msgs::Body { payload })),
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }
            Msg::GetBodyPack(m) => {
                self.require_full(key, code)?;
                let mut bodies = self.chain.get_body_pack(&m);
                bodies.truncate(self.cfg.bandwidth.body_pack_max as usize + 1);
                if bodies.is_empty() {
                    self.send_or_drop(key, &Msg::DATA_MISSING)
                } else {
                    self.send_or_drop(key, &Msg::BodyPack(msgs::BodyPack { bodies }))
                }
            }
            Msg::Body(m) => self.on_body(key, m, wire_len),
            Msg::BodyPack(m) => self.on_body_pack(key, m, wire_len),
            Msg::DataMissing(_) => self.on_data_missing(key),

            // proof serving (we answer; we never ask)
            Msg::GetProofState(m) => self.serve_proof(key, self.chain.get_proof_state(m.height), ProofKind::State),
            Msg::GetProofKernel(m) => self.serve_proof(key, self.chain.get_proof_kernel(&m.id), ProofKind::Kernel),
            Msg::GetProofUtxo(m) => {
                let proof = self.chain.get_proof_utxo(&m);
                self.serve_proof(key, proof, ProofKind::Utxo)
            }
            Msg::GetProofChainWork(m) => {
                self.serve_proof(key, self.chain.get_proof_chainwork(m.lower_bound), ProofKind::ChainWork)
            }
            Msg::GetCommonState(m) => {
                self.require_full(key, code)?;
                match self.chain.get_common_state(&m.ids) {
                    Some((i_state, proof)) => self.send_or_drop(
                        key,
                        &Msg::ProofCommonState(msgs::ProofCommonState { i_state, proof }),
                    ),
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }

            // owner-restricted
            Msg::GetEvents(m) => {
                self.require_owner(key, code)?;
                match self.chain.get_events(m.height_min) {
                    Some(events) => self.send_or_drop(key, &Msg::Events(msgs::Events { events })),
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }
            Msg::GetBlockFinalization(m) => {
                self.require_owner(key, code)?;
                match self.chain.finalize_block(m.height, m.fees) {
                    Some(payload) => self.send_or_drop(
                        key,
                        &Msg::BlockFinalization(msgs::BlockFinalization { payload }),
                    ),
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }

            // transactions
            Msg::NewTransaction(m) => self.on_new_transaction(key, m),
            Msg::HaveTransaction(m) => self.on_have_transaction(key, m),
            Msg::GetTransaction(m) => {
                self.require_full(key, code)?;
                match self.txpool.get_transaction(&m.id) {
                    Some(tx) => self.send_or_drop(
                        key,
                        &Msg::NewTransaction(msgs::NewTransaction { tx, fluff: true }),
                    ),
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }

            // bulletins
            Msg::BbsMsg(m) => self.on_bbs_msg(key, m),
            Msg::BbsHaveMsg(m) => self.on_bbs_have(key, m),
            Msg::BbsGetMsg(m) => {
                self.require_bbs(key, code)?;
                match self.bbs.get(&m.key) {
                    Some(rec) => {
                        let (_, wire) = rec.wire(&m.key);
                        self.send_or_drop(key, &Msg::BbsMsg(wire))
                    }
                    None => self.send_or_drop(key, &Msg::DATA_MISSING),
                }
            }
            Msg::BbsSubscribe(m) => self.on_bbs_subscribe(key, m),
            Msg::BbsPickChannel(_) => {
                self.require_bbs(key, code)?;
                let channel = self.bbs.pick_channel(BBS_CHANNEL_BAND);
                self.send_or_drop(key, &Msg::BbsPickChannelRes(msgs::BbsPickChannelRes { channel }))
            }
            Msg::BbsResetSync(m) => {
                self.require_bbs(key, code)?;
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.bbs_floor = (m.time_from.saturating_sub(1), [0xff; 32]);
                }
                self.broadcast_bbs(key);
                Ok(())
            }

            // responses we never solicit
            Msg::Hdr(_)
            | Msg::Boolean(_)
            | Msg::ProofState(_)
            | Msg::ProofKernel(_)
            | Msg::ProofUtxo(_)
            | Msg::ProofChainWork(_)
            | Msg::ProofCommonState(_)
            | Msg::Events(_)
            | Msg::EventsSerif(_)
            | Msg::BlockFinalization(_)
            | Msg::BbsPickChannelRes(_) => Err(unexpected(code)),
        }
    }

    // -- helpers --------------------------------------------------------------

    fn send_or_drop(&mut self, key: ConnKey, msg: &Msg) -> Result<(), DisconnectReason> {
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        match conn.send(msg) {
            Ok(()) => Ok(()),
            Err(SendError::Drown) => {
                self.drop_conn(key, DisconnectReason::Drown, None);
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    fn require_full(&self, key: ConnKey, code: u8) -> Result<(), DisconnectReason> {
        match self.conns.get(&key) {
            Some(c) if c.is_full_peer() => Ok(()),
            _ => Err(unexpected(code)),
        }
    }

    fn require_owner(&self, key: ConnKey, code: u8) -> Result<(), DisconnectReason> {
        self.require_full(key, code)?;
        match self.conns.get(&key) {
            Some(c) if c.is(ConnFlags::OWNER) => Ok(()),
            _ => Err(unexpected(code)),
        }
    }

    fn require_bbs(&self, key: ConnKey, code: u8) -> Result<(), DisconnectReason> {
        if !self.cfg.bbs.enabled {
            return Err(unexpected(code));
        }
        self.require_full(key, code)
    }

    // -- secure channel -------------------------------------------------------

    fn on_schannel_init(
        &mut self,
        key: ConnKey,
        m: msgs::SChannelInitiate,
    ) -> Result<(), DisconnectReason> {
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        if conn.sc.is_secure_in() {
            return Err(unexpected(0x04)); // a second initiate mid-session
        }

        // the accepting side answers with its own nonce, still in plaintext
        if !conn.stream_id.is_outbound() {
            let init = Msg::SChannelInitiate(msgs::SChannelInitiate {
                nonce_pub: conn.sc.nonce_pub(),
            });
            if conn.send(&init).is_err() {
                self.drop_conn(key, DisconnectReason::Drown, None);
                return Ok(());
            }
        }

        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        conn.sc.init_ciphers(&m.nonce_pub);
        conn.reader.enable(0x05);
        // first encrypted frame in our direction
        if conn.send(&Msg::SChannelReady(msgs::Empty)).is_err() {
            self.drop_conn(key, DisconnectReason::Drown, None);
        }
        Ok(())
    }

    fn on_schannel_ready(&mut self, key: ConnKey) -> Result<(), DisconnectReason> {
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        if !conn.sc.is_secure_in() || conn.sc.mode() == crate::schannel::Mode::Duplex {
            return Err(unexpected(0x05));
        }
        conn.sc.on_ready();
        conn.state = ConnState::Authenticating;
        conn.reader.enable_all();

        // a probe stays silent: it only wants the peer's proof and login,
        // so the probed side never has to reconcile a second identity
        if conn.is(ConnFlags::PROBE) {
            return Ok(());
        }

        // prove who we are, advertise how to reach us, then login
        let Some(remote_nonce) = conn.sc.remote_nonce_pub() else {
            return Err(unexpected(0x05));
        };
        let sig = self.identity.sign_auth(&remote_nonce, IdentityType::Node);
        let auth = Msg::Authentication(msgs::Authentication {
            id: self.my_id,
            id_type: IdentityType::Node as u8,
            sig,
        });
        let info = Msg::PeerInfoSelf(msgs::PeerInfoSelf { port: self.listen_addr.port });
        let login = Msg::Login(msgs::Login {
            rules_hash: self.cfg.rules_hash,
            flags: self.cfg.login_flags,
        });

        let outbound = conn.stream_id.is_outbound();
        for msg in [auth, info, login] {
            let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
            if conn.send(&msg).is_err() {
                self.drop_conn(key, DisconnectReason::Drown, None);
                return Ok(());
            }
        }
        if outbound {
            let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
            conn.set(ConnFlags::AWAIT_EXT | ConnFlags::AWAIT_TIME);
            for msg in [Msg::GetExternalAddr(msgs::Empty), Msg::GetTime(msgs::Empty)] {
                if conn.send(&msg).is_err() {
                    self.drop_conn(key, DisconnectReason::Drown, None);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn on_authentication(
        &mut self,
        key: ConnKey,
        m: msgs::Authentication,
    ) -> Result<(), DisconnectReason> {
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        let Some(id_type) = IdentityType::from_u8(m.id_type) else {
            return Err(violation(ProtocolViolation::RuleViolation));
        };
        if !verify_auth(&m.id, m.id_type, &m.sig, &conn.sc.nonce_pub()) {
            return Err(violation(ProtocolViolation::RuleViolation));
        }

        match id_type {
            IdentityType::Node => {
                if m.id == self.my_id {
                    info!(addr = %conn.addr, "loopback connection");
                    self.drop_conn(key, DisconnectReason::Loopback, Some(bye_reason::LOOPBACK));
                    return Ok(());
                }

                // a probe conn has learned all it came for once the peer
                // proves its identity: mark the address verified, back out
                if conn.is(ConnFlags::PROBE) {
                    let addr = conn.addr;
                    self.peer_man.on_peer(m.id, addr, true);
                    self.drop_conn(key, DisconnectReason::Policy, Some(bye_reason::PROBED));
                    return Ok(());
                }

                // duplicate resolution: the surviving link is the one dialed
                // by the lexicographically smaller identity
                if let Some(&existing) = self.by_peer.get(&m.id) {
                    if existing != key {
                        let survivor_outbound = duplicate_survivor_is_outbound(&self.my_id, &m.id);
                        let new_outbound = conn.stream_id.is_outbound();
                        if new_outbound == survivor_outbound {
                            self.drop_conn(
                                existing,
                                DisconnectReason::Duplicate,
                                Some(bye_reason::DUPLICATE),
                            );
                        } else {
                            self.drop_conn(
                                key,
                                DisconnectReason::Duplicate,
                                Some(bye_reason::DUPLICATE),
                            );
                            return Ok(());
                        }
                    }
                }

                // a banned record refuses service for the ban window
                if let Some(rid) = self.peer_man.find(&m.id) {
                    if self.peer_man.is_banned(rid) {
                        info!(peer = %m.id, "refusing banned peer");
                        self.drop_conn(key, DisconnectReason::Policy, Some(bye_reason::BAN));
                        return Ok(());
                    }
                }

                let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
                conn.peer_id = Some(m.id);
                conn.set(ConnFlags::PI_RCVD);
                self.by_peer.insert(m.id, key);
            }
            IdentityType::Owner => {
                if self.cfg.owner_keys.contains(&m.id) {
                    conn.set(ConnFlags::OWNER);
                }
            }
            IdentityType::Viewer => {
                if self.cfg.viewer_keys.contains(&m.id) {
                    conn.set(ConnFlags::VIEWER);
                }
            }
        }
        Ok(())
    }

    fn on_login(&mut self, key: ConnKey, m: msgs::Login) -> Result<(), DisconnectReason> {
        if m.rules_hash != self.cfg.rules_hash {
            if let Some(obs) = self.observer.as_mut() {
                obs.on_sync_error(SyncError::IncompatiblePeer);
            }
            return Err(violation(ProtocolViolation::Incompatible));
        }
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        if !conn.is(ConnFlags::PI_RCVD) {
            return Err(unexpected(0x00)); // login before identity proof
        }
        conn.login_flags = m.flags;
        conn.state = ConnState::LoggedIn;
        conn.stream_id = conn.stream_id.with_flags(
            (conn.stream_id.flags() & !StreamFlags::HANDSHAKING) | StreamFlags::ACCEPTED,
        );
        let id = conn.peer_id.unwrap_or(PeerId::ZERO);
        let outbound = conn.stream_id.is_outbound();
        let peer_flags = m.flags;

        // bind the address-book record: the dialed address is verified, an
        // advertised one is not, and port 0 never becomes dialable
        let addr = if outbound {
            conn.addr
        } else {
            NetAddr { ip: conn.addr.ip, port: conn.port }
        };
        // a first-heard advertised address gets checked from our side
        let needs_probe =
            !outbound && addr.is_dialable() && self.peer_man.find_by_addr(&addr).is_none();
        let rid = if addr.is_dialable() {
            self.peer_man.on_peer(id, addr, outbound)
        } else {
            Some(self.peer_man.find_create(id))
        };
        if let Some(rid) = rid {
            self.peer_man.on_seen(rid);
            self.peer_man.on_active(rid, true);
            if let Some(conn) = self.conns.get_mut(&key) {
                conn.record = Some(rid);
            }
        }
        info!(peer = %id, %addr, "peer logged in");
        if let Some(obs) = self.observer.as_mut() {
            obs.on_peer_connected(id);
        }
        if needs_probe {
            debug!(%addr, "probing advertised address");
            self.dial(None, addr, true);
        }

        // announce our tip
        let tip = self.chain.tip();
        if tip.height > 0 {
            self.send_or_drop(key, &Msg::NewTip(msgs::NewTip { tip }))?;
        }

        if peer_flags & login_flags::SEND_PEERS != 0 {
            self.send_recommendations(key);
        }
        if self.cfg.bbs.enabled
            && peer_flags & login_flags::BBS != 0
            && self.cfg.login_flags & login_flags::BBS != 0
        {
            let time_from = now().saturating_sub(self.cfg.bbs.max_ahead_s);
            self.send_or_drop(key, &Msg::BbsResetSync(msgs::BbsResetSync { time_from }))?;
        }

        self.broadcast_txs(key);
        self.broadcast_bbs(key);
        Ok(())
    }

    fn on_pong(&mut self, key: ConnKey) -> Result<(), DisconnectReason> {
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        if !conn.is(ConnFlags::CHOKING) {
            return Err(unexpected(0x03)); // pong without a pending choke ping
        }
        conn.unchoke();
        let channels: Vec<u32> = conn.subscriptions.keys().copied().collect();

        self.broadcast_txs(key);
        self.broadcast_bbs(key);
        for ch in channels {
            self.broadcast_bbs_channel(key, ch);
        }
        Ok(())
    }

    // -- chain sync -----------------------------------------------------------

    fn on_new_tip(&mut self, key: ConnKey, m: msgs::NewTip) -> Result<(), DisconnectReason> {
        self.require_full(key, 0x10)?;
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };

        if let Some(prev) = conn.tip {
            if m.tip.chain_work < prev.chain_work {
                return Err(violation(ProtocolViolation::RuleViolation));
            }
        }
        conn.tip = Some(m.tip);
        conn.rejected.clear();
        conn.set(ConnFlags::HAS_TREASURY);
        conn.state = ConnState::Serving;
        let id = conn.peer_id.unwrap_or(PeerId::ZERO);
        debug!(peer = %id, height = m.tip.height, "new tip");

        if let Some(rid) = conn.record {
            self.peer_man.on_seen(rid);
        }

        if self.chain.is_tip_needed(&m.tip) {
            if self.chain.on_header(m.tip, id) == DataStatus::Invalid {
                // a tip from the future is a clock problem, not hostility
                if m.tip.timestamp > now() {
                    if let Some(obs) = self.observer.as_mut() {
                        obs.on_sync_error(SyncError::TimeDiffTooLarge);
                    }
                }
                return Err(violation(ProtocolViolation::RuleViolation));
            }
        }
        self.take_tasks(key);
        Ok(())
    }

    fn on_hdr_pack(
        &mut self,
        key: ConnKey,
        m: msgs::HdrPack,
        wire_len: usize,
    ) -> Result<(), DisconnectReason> {
        let Some(head) = self.tasks.head_of(key) else { return Err(unexpected(0x14)) };
        if head.key.1 {
            return Err(unexpected(0x14)); // expected a body, got headers
        }
        let tkey = head.key;
        let requested = head.count;
        let dt = now_ms().saturating_sub(head.assigned_at_ms);

        let n = m.headers.len() as u32;
        if n == 0 || n > requested {
            return Err(violation(ProtocolViolation::RuleViolation));
        }

        if let Some(conn) = self.conns.get_mut(&key) {
            conn.bw_sample(wire_len, dt);
        }

        let id = self.peer_id_of(key);
        let status = self.chain.on_header_pack(m.headers, id);
        self.tasks.complete(tkey);
        self.refresh_request_timer(key);

        match status {
            DataStatus::Invalid => return Err(violation(ProtocolViolation::RuleViolation)),
            DataStatus::Accepted => {
                if let Some(rid) = self.record_of(key) {
                    let delta = self
                        .cfg
                        .rating
                        .reward_header
                        .saturating_mul(n)
                        .min(self.cfg.rating.reward_block);
                    self.peer_man.rating_modify(rid, delta, true);
                    self.peer_man.on_seen(rid);
                }
            }
            _ => {}
        }
        self.take_tasks(key);
        Ok(())
    }

    fn on_body(&mut self, key: ConnKey, m: msgs::Body, wire_len: usize) -> Result<(), DisconnectReason> {
        let Some(head) = self.tasks.head_of(key) else { return Err(unexpected(0x16)) };
        if !head.key.1 {
            return Err(unexpected(0x16));
        }
        let tkey = head.key;
        let dt = now_ms().saturating_sub(head.assigned_at_ms);

        if let Some(conn) = self.conns.get_mut(&key) {
            conn.bw_sample(wire_len, dt);
        }
        let id = self.peer_id_of(key);
        let status = self.chain.on_block(tkey.0, m.payload, id);
        self.tasks.complete(tkey);
        self.refresh_request_timer(key);
        self.settle_block_delivery(key, id, status);
        Ok(())
    }

    fn on_body_pack(
        &mut self,
        key: ConnKey,
        m: msgs::BodyPack,
        wire_len: usize,
    ) -> Result<(), DisconnectReason> {
        let Some(head) = self.tasks.head_of(key) else { return Err(unexpected(0x21)) };
        if !head.key.1 {
            return Err(unexpected(0x21));
        }
        let tkey = head.key;
        let requested = head.count;
        let dt = now_ms().saturating_sub(head.assigned_at_ms);

        if m.bodies.is_empty() || m.bodies.len() as u32 > requested {
            return Err(violation(ProtocolViolation::RuleViolation));
        }

        if let Some(conn) = self.conns.get_mut(&key) {
            conn.bw_sample(wire_len, dt);
        }
        let id = self.peer_id_of(key);
        let status = self.chain.on_block_pack(tkey.0, m.bodies, id);
        self.tasks.complete(tkey);
        self.refresh_request_timer(key);
        self.settle_block_delivery(key, id, status);
        Ok(())
    }

    /// Shared tail of a body delivery: reward or defer the insanity verdict.
    fn settle_block_delivery(&mut self, key: ConnKey, id: PeerId, status: DataStatus) {
        match status {
            DataStatus::Invalid => {
                // never ban from inside dispatch; the verdict may have come
                // out of the verifier mid-transaction
                self.insane_queue.push(id);
            }
            DataStatus::Accepted => {
                if let Some(rid) = self.record_of(key) {
                    let delta = (self.cfg.rating.reward_block / 2 + self.bw_rating_delta(key))
                        .min(self.cfg.rating.reward_block);
                    self.peer_man.rating_modify(rid, delta, true);
                    self.peer_man.on_seen(rid);
                }
                if let Some(obs) = self.observer.as_mut() {
                    obs.on_state_changed();
                }
            }
            _ => {}
        }
        self.take_tasks(key);
    }

    fn on_data_missing(&mut self, key: ConnKey) -> Result<(), DisconnectReason> {
        self.require_full(key, 0x0d)?;
        // with no task outstanding this answers a tx or bulletin fetch;
        // the wanted queues handle those by expiry
        let Some(head) = self.tasks.head_of(key) else { return Ok(()) };
        let tkey = head.key;

        if let Some(conn) = self.conns.get_mut(&key) {
            conn.rejected.insert(tkey);
        }
        if self.tasks.release(tkey) == crate::tasks::Released::Requeued {
            self.try_assign_task(tkey);
        }
        self.refresh_request_timer(key);
        Ok(())
    }

    // -- transactions ---------------------------------------------------------

    fn on_new_transaction(
        &mut self,
        key: ConnKey,
        m: msgs::NewTransaction,
    ) -> Result<(), DisconnectReason> {
        self.require_full(key, 0x30)?;
        let id = self.peer_id_of(key);
        let tid = self.txpool.tx_key(&m.tx);
        let size = m.tx.len();
        let mode = if m.fluff { TxMode::Fluff } else { TxMode::Stem };

        match self.txpool.on_transaction(m.tx, Some(id), mode) {
            TxStatus::InvalidBan => Err(violation(ProtocolViolation::RuleViolation)),
            TxStatus::Ok => {
                if let Some(rid) = self.record_of(key) {
                    self.peer_man.rating_modify(rid, self.cfg.rating.reward_tx, true);
                }
                if m.fluff {
                    self.announce_tx(tid, size, Some(key));
                } else {
                    // stem phase: the pool decides the next hop through the
                    // handle; nothing to fan out here
                    self.wanted_tx.delete(&tid);
                }
                Ok(())
            }
            TxStatus::Duplicate | TxStatus::Invalid => {
                self.wanted_tx.delete(&tid);
                Ok(())
            }
        }
    }

    fn on_have_transaction(
        &mut self,
        key: ConnKey,
        m: msgs::HaveTransaction,
    ) -> Result<(), DisconnectReason> {
        self.require_full(key, 0x31)?;
        if self.txpool.has_transaction(&m.id) || self.wanted_tx.contains(&m.id) {
            return Ok(());
        }
        if self.wanted_tx.add(m.id, now_ms()) {
            // ask the announcer directly; expiry falls back to broadcast
            return self.send_or_drop(key, &Msg::GetTransaction(msgs::GetTransaction { id: m.id }));
        }
        Ok(())
    }

    // -- bulletins ------------------------------------------------------------

    fn on_bbs_msg(&mut self, key: ConnKey, m: msgs::BbsMsg) -> Result<(), DisconnectReason> {
        self.require_bbs(key, 0x38)?;
        self.accept_bbs(m, Some(key));
        Ok(())
    }

    fn on_bbs_have(&mut self, key: ConnKey, m: msgs::BbsHaveMsg) -> Result<(), DisconnectReason> {
        self.require_bbs(key, 0x39)?;
        if self.bbs.contains(&m.key) || self.wanted_bbs.contains(&m.key) {
            return Ok(());
        }
        if self.wanted_bbs.add(m.key, now_ms()) {
            return self.send_or_drop(key, &Msg::BbsGetMsg(msgs::BbsGetMsg { key: m.key }));
        }
        Ok(())
    }

    fn on_bbs_subscribe(
        &mut self,
        key: ConnKey,
        m: msgs::BbsSubscribe,
    ) -> Result<(), DisconnectReason> {
        self.require_bbs(key, 0x3b)?;
        let Some(conn) = self.conns.get_mut(&key) else { return Ok(()) };
        if m.on {
            conn.subscriptions
                .insert(m.channel, (m.time_from.saturating_sub(1), [0xff; 32]));
            self.broadcast_bbs_channel(key, m.channel);
        } else {
            conn.subscriptions.remove(&m.channel);
        }
        Ok(())
    }

    // -- small lookups --------------------------------------------------------

    fn peer_id_of(&self, key: ConnKey) -> PeerId {
        self.conns
            .get(&key)
            .and_then(|c| c.peer_id)
            .unwrap_or(PeerId::ZERO)
    }

    fn record_of(&self, key: ConnKey) -> Option<RecordId> {
        self.conns.get(&key).and_then(|c| c.record)
    }
}

// Local alias so serve_proof reads like the dispatch table.
enum ProofKind {
    State,
    Kernel,
    Utxo,
    ChainWork,
}

impl Node {
    fn serve_proof(
        &mut self,
        key: ConnKey,
        proof: Option<Vec<u8>>,
        kind: ProofKind,
    ) -> Result<(), DisconnectReason> {
        let code = match kind {
            ProofKind::State => 0x17,
            ProofKind::Kernel => 0x19,
            ProofKind::Utxo => 0x1b,
            ProofKind::ChainWork => 0x1d,
        };
        self.require_full(key, code)?;
        let msg = match (kind, proof) {
            (_, None) => Msg::DATA_MISSING,
            (ProofKind::State, Some(p)) => Msg::ProofState(msgs::ProofState { proof: p }),
            (ProofKind::Kernel, Some(p)) => Msg::ProofKernel(msgs::ProofKernel { proof: p }),
            (ProofKind::Utxo, Some(p)) => Msg::ProofUtxo(msgs::ProofUtxo { proofs: p }),
            (ProofKind::ChainWork, Some(p)) => {
                Msg::ProofChainWork(msgs::ProofChainWork { proof: p })
            }
        };
        self.send_or_drop(key, &msg)
    }
}
