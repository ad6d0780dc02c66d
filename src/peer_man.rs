//! Address book and peer manager.
//!
//! Keeps one record per ever-heard-of peer across reconnects and restarts,
//! scores behavior into a bounded rating, and decides which peers to keep
//! active. Two overlapping selections are maintained: the best-rated peers,
//! and the best by *adjusted* rating (raw plus a starvation bonus growing
//! while a peer sits unconnected) so the node keeps sampling beyond its
//! current clique.
//!
//! Records live in an arena keyed by `RecordId`; identity and address
//! indexes resolve to ids, never references, so callers can hold a key
//! while the manager mutates freely.

use crate::config::Config;
use crate::types::{now, now_ms, NetAddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Stable handle into the manager's record arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

/// One persistent peer record.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Dialable address; `None` once detached (address moved to another id).
    pub addr: Option<NetAddr>,
    /// 0 is banned; saturation is maximally trusted.
    pub rating: u32,
    /// Unix seconds; 0 means never seen alive.
    pub last_seen: u64,
    /// Last connect attempt or disconnect, ms clock.
    pub last_activity_ms: u64,
    /// While in the future, activation and inbound accepts are refused.
    pub banned_until_ms: u64,
    /// Currently activated (live or dialing).
    pub active: bool,
    /// Starvation bonus on top of the raw rating.
    pub boost: u32,
}

impl PeerRecord {
    pub fn adjusted_rating(&self) -> u32 {
        self.rating.saturating_add(self.boost)
    }

    pub fn is_banned(&self) -> bool {
        self.rating == 0
    }
}

/// Persisted form of a record (bincode into the store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPeer {
    pub id: PeerId,
    pub addr: u64,
    pub rating: u32,
    pub last_seen: u64,
}

/// What a periodic update pass wants the node to do.
#[derive(Debug, Default)]
pub struct UpdateActions {
    /// Dial these.
    pub activate: Vec<(RecordId, NetAddr)>,
    /// Drop these currently active peers (policy rotation).
    pub deactivate: Vec<RecordId>,
}

pub struct PeerManager {
    cfg: Config,
    records: HashMap<RecordId, PeerRecord>,
    by_id: HashMap<PeerId, RecordId>,
    by_addr: HashMap<NetAddr, RecordId>,
    next_id: u64,
    last_tick_ms: u64,
}

impl PeerManager {
    pub fn new(cfg: Config) -> Self {
        PeerManager {
            cfg,
            records: HashMap::new(),
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 0,
            last_tick_ms: now_ms(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, rid: RecordId) -> Option<&PeerRecord> {
        self.records.get(&rid)
    }

    pub fn find(&self, id: &PeerId) -> Option<RecordId> {
        self.by_id.get(id).copied()
    }

    pub fn find_by_addr(&self, addr: &NetAddr) -> Option<RecordId> {
        self.by_addr.get(addr).copied()
    }

    /// Upsert a peer sighting.
    ///
    /// A zero identity records a bare address (a configured bootstrap
    /// entry); the identity is learned later at login. When a known
    /// identity shows up under a new address, the old address is replaced
    /// unless the sighting is unverified and the old address is still
    /// recent.
    pub fn on_peer(&mut self, id: PeerId, addr: NetAddr, addr_verified: bool) -> Option<RecordId> {
        if !id.is_zero() {
            if let Some(rid) = self.find(&id) {
                self.maybe_update_addr(rid, addr, addr_verified);
                return Some(rid);
            }
        }

        if let Some(rid) = self.find_by_addr(&addr) {
            let rec = self.records.get_mut(&rid)?;
            if rec.id.is_zero() && !id.is_zero() {
                rec.id = id;
                self.by_id.insert(id, rid);
                return Some(rid);
            }
            if rec.id == id || id.is_zero() {
                return Some(rid);
            }
            // the address changed hands
            if !addr_verified {
                return None;
            }
            self.detach_addr(rid);
        }

        let rid = self.insert(id, Some(addr));
        Some(rid)
    }

    /// Find a record by identity, creating an addressless one if missing.
    /// Inbound-only peers (advertised port 0) are valid task targets but
    /// must never gain a dialable address entry.
    pub fn find_create(&mut self, id: PeerId) -> RecordId {
        if let Some(rid) = self.find(&id) {
            return rid;
        }
        self.insert(id, None)
    }

    fn insert(&mut self, id: PeerId, addr: Option<NetAddr>) -> RecordId {
        let rid = RecordId(self.next_id);
        self.next_id += 1;
        self.records.insert(
            rid,
            PeerRecord {
                id,
                addr,
                rating: self.cfg.rating.initial,
                last_seen: 0,
                last_activity_ms: 0,
                banned_until_ms: 0,
                active: false,
                boost: 0,
            },
        );
        if !id.is_zero() {
            self.by_id.insert(id, rid);
        }
        if let Some(addr) = addr {
            self.by_addr.insert(addr, rid);
            debug!(peer = %id, %addr, "new peer record");
        }
        rid
    }

    fn maybe_update_addr(&mut self, rid: RecordId, addr: NetAddr, verified: bool) {
        let Some(rec) = self.records.get(&rid) else { return };
        if rec.addr == Some(addr) {
            return;
        }
        if !verified {
            let fresh = now().saturating_sub(rec.last_seen) < self.cfg.timeout.addr_change_s;
            if rec.addr.is_some() && fresh {
                return;
            }
        }
        // the new address may currently belong to another record
        if let Some(other) = self.find_by_addr(&addr) {
            if other != rid {
                self.detach_addr(other);
            }
        }
        self.detach_addr(rid);
        if let Some(rec) = self.records.get_mut(&rid) {
            rec.addr = Some(addr);
        }
        self.by_addr.insert(addr, rid);
    }

    /// A probe could not reach this advertised address: detach it so the
    /// activation pass never dials a dead advert.
    pub fn on_addr_unreachable(&mut self, addr: &NetAddr) {
        if let Some(rid) = self.find_by_addr(addr) {
            self.detach_addr(rid);
        }
    }

    fn detach_addr(&mut self, rid: RecordId) {
        if let Some(rec) = self.records.get_mut(&rid) {
            if let Some(a) = rec.addr.take() {
                self.by_addr.remove(&a);
            }
        }
    }

    /// Saturating rating arithmetic. A saturated rating cannot grow; a
    /// decrement never reaches 0 (0 is reserved for an explicit ban).
    pub fn rating_modify(&mut self, rid: RecordId, delta: u32, add: bool) {
        let max = self.cfg.rating.max;
        if let Some(rec) = self.records.get_mut(&rid) {
            if rec.rating == 0 {
                return; // banned stays banned until the timeout expires
            }
            rec.rating = if add {
                rec.rating.saturating_add(delta).min(max)
            } else {
                rec.rating.saturating_sub(delta).max(1)
            };
        }
    }

    /// Zero the rating and suppress activation for the ban window.
    pub fn ban(&mut self, rid: RecordId) {
        let until = now_ms() + self.cfg.timeout.ban_ms;
        if let Some(rec) = self.records.get_mut(&rid) {
            info!(peer = %rec.id, "banned");
            rec.rating = 0;
            rec.banned_until_ms = until;
        }
    }

    /// True while the record must be refused (dialing and inbound).
    pub fn is_banned(&mut self, rid: RecordId) -> bool {
        self.maybe_unban(rid);
        self.records.get(&rid).map(|r| r.rating == 0).unwrap_or(false)
    }

    fn maybe_unban(&mut self, rid: RecordId) {
        if let Some(rec) = self.records.get_mut(&rid) {
            if rec.rating == 0 && rec.banned_until_ms <= now_ms() {
                rec.rating = 1; // back on probation
            }
        }
    }

    pub fn on_seen(&mut self, rid: RecordId) {
        if let Some(rec) = self.records.get_mut(&rid) {
            rec.last_seen = now();
        }
    }

    /// Bookkeeping for activation/deactivation of a record.
    pub fn on_active(&mut self, rid: RecordId, active: bool) {
        if let Some(rec) = self.records.get_mut(&rid) {
            rec.active = active;
            rec.last_activity_ms = now_ms();
            if active {
                rec.boost = 0; // the starvation bonus is spent
            }
        }
    }

    /// Apply the disconnect-time rating policy.
    pub fn on_remote_error(&mut self, rid: RecordId, should_ban: bool) {
        if should_ban {
            self.ban(rid);
            return;
        }
        let penalty = self.cfg.rating.penalty_network_err;
        let window = self.cfg.timeout.early_disconnect_ms;
        if let Some(rec) = self.records.get(&rid) {
            let dt = now_ms().saturating_sub(rec.last_activity_ms);
            if dt < window {
                self.rating_modify(rid, penalty, false);
            }
        }
    }

    /// Delete a record outright (bookkeeping shrink, never called on live peers).
    pub fn delete(&mut self, rid: RecordId) {
        if let Some(rec) = self.records.remove(&rid) {
            if !rec.id.is_zero() {
                self.by_id.remove(&rec.id);
            }
            if let Some(a) = rec.addr {
                self.by_addr.remove(&a);
            }
        }
    }

    /// Periodic pass: advance starvation boosts, unban expired bans, and
    /// compute the desired active set.
    pub fn update(&mut self) -> UpdateActions {
        let t = now_ms();
        let dt_s = (t.saturating_sub(self.last_tick_ms) / 1000) as u32;
        self.last_tick_ms = t;

        let inc = self.cfg.rating.starvation_inc_per_sec.saturating_mul(dt_s);
        let dec = self.cfg.rating.starvation_dec_per_sec.saturating_mul(dt_s);
        let boost_cap = self.cfg.rating.max;
        let rids: Vec<RecordId> = self.records.keys().copied().collect();
        for rid in &rids {
            self.maybe_unban(*rid);
            if let Some(rec) = self.records.get_mut(rid) {
                if rec.active {
                    rec.boost = rec.boost.saturating_sub(dec);
                } else {
                    rec.boost = rec.boost.saturating_add(inc).min(boost_cap);
                }
            }
        }

        let desired = self.desired_set();

        let mut actions = UpdateActions::default();
        for &rid in &desired {
            let rec = &self.records[&rid];
            if rec.active {
                continue;
            }
            if let Some(addr) = rec.addr {
                actions.activate.push((rid, addr));
            }
        }

        // rotate out active peers that fell off the desired set, but not
        // ones that only just connected
        let min_age = self.cfg.timeout.early_disconnect_ms;
        for (rid, rec) in &self.records {
            if rec.active && !desired.contains(rid) && t.saturating_sub(rec.last_activity_ms) >= min_age
            {
                actions.deactivate.push(*rid);
            }
        }
        actions
    }

    /// The two-selection policy: top raw ratings, then fill the total
    /// budget by adjusted rating.
    fn desired_set(&self) -> Vec<RecordId> {
        let eligible = |rec: &PeerRecord| {
            rec.rating > 0 && rec.addr.map(|a| a.is_dialable()).unwrap_or(false)
        };

        let mut by_raw: Vec<(&RecordId, &PeerRecord)> =
            self.records.iter().filter(|(_, r)| eligible(r)).collect();
        by_raw.sort_by(|a, b| b.1.rating.cmp(&a.1.rating).then(a.0.cmp(b.0)));

        let mut desired: Vec<RecordId> = by_raw
            .iter()
            .take(self.cfg.desired_highest as usize)
            .map(|(rid, _)| **rid)
            .collect();

        let mut by_adj: Vec<(&RecordId, &PeerRecord)> = by_raw
            .into_iter()
            .filter(|(rid, _)| !desired.contains(rid))
            .collect();
        by_adj.sort_by(|a, b| {
            b.1.adjusted_rating().cmp(&a.1.adjusted_rating()).then(a.0.cmp(b.0))
        });

        desired.extend(
            by_adj
                .into_iter()
                .take((self.cfg.desired_total as usize).saturating_sub(desired.len()))
                .map(|(rid, _)| *rid),
        );
        desired
    }

    /// Peers worth recommending to SEND_PEERS subscribers: best-rated,
    /// recently seen, with a dialable address and a known identity.
    pub fn recommend(&self, limit: usize) -> Vec<(PeerId, NetAddr)> {
        let stale = self.cfg.timeout.recommend_stale_s;
        let t = now();
        let mut out: Vec<(&RecordId, &PeerRecord)> = self
            .records
            .iter()
            .filter(|(_, r)| {
                !r.id.is_zero()
                    && r.rating > 0
                    && r.last_seen != 0
                    && t.saturating_sub(r.last_seen) < stale
                    && r.addr.map(|a| a.is_dialable()).unwrap_or(false)
            })
            .collect();
        out.sort_by(|a, b| b.1.rating.cmp(&a.1.rating).then(a.0.cmp(b.0)));
        out.into_iter()
            .take(limit)
            .filter_map(|(_, r)| r.addr.map(|a| (r.id, a)))
            .collect()
    }

    /// Everything worth writing to the store: every ever-seen record,
    /// banned ones included (they come back banned).
    pub fn snapshot(&self) -> Vec<StoredPeer> {
        let mut out: Vec<StoredPeer> = self
            .records
            .values()
            .filter(|r| r.last_seen != 0 && !r.id.is_zero())
            .map(|r| StoredPeer {
                id: r.id,
                addr: r.addr.map(|a| a.as_u64()).unwrap_or(0),
                rating: r.rating,
                last_seen: r.last_seen,
            })
            .collect();
        out.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.id.cmp(&b.id)));
        out
    }

    /// Seed the in-memory index from the store at startup.
    pub fn seed(&mut self, own_id: &PeerId, stored: Vec<StoredPeer>) {
        for sp in stored {
            if &sp.id == own_id {
                continue; // leftover from a previous run
            }
            // addr 0 marks an inbound-only record; it must stay out of the
            // address index where every such peer would collide
            let rid = if sp.addr == 0 {
                self.find_create(sp.id)
            } else {
                match self.on_peer(sp.id, NetAddr::from_u64(sp.addr), false) {
                    Some(rid) => rid,
                    None => continue,
                }
            };
            if let Some(rec) = self.records.get_mut(&rid) {
                rec.last_seen = sp.last_seen;
                rec.last_activity_ms = 0;
            }
            if sp.rating == 0 {
                self.ban(rid);
            } else if let Some(rec) = self.records.get_mut(&rid) {
                rec.rating = sp.rating.min(self.cfg.rating.max);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> impl Iterator<Item = (&RecordId, &PeerRecord)> {
        self.records.iter()
    }
}
