//! Bulletin-board store: channeled store-and-forward messages.
//!
//! Each message is keyed by `SHA3-256(payload ‖ channel)`; duplicates are
//! detected by that key. The cache honors a hard age cap and a soft total
//! size cap; when both are exceeded, eviction is age-first, then size-first.

use crate::config::BbsCfg;
use crate::msgs;
use crate::types::Hash;
use sha3::{Digest, Sha3_256};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One stored bulletin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbsRecord {
    pub channel: u32,
    pub time_posted: u64,
    pub payload: Vec<u8>,
    pub nonce: u64,
}

impl BbsRecord {
    pub fn wire(&self, key: &Hash) -> (Hash, msgs::BbsMsg) {
        (
            *key,
            msgs::BbsMsg {
                channel: self.channel,
                time_posted: self.time_posted,
                payload: self.payload.clone(),
                nonce: self.nonce,
            },
        )
    }
}

/// Derived message key: hash of (payload, channel).
pub fn msg_key(payload: &[u8], channel: u32) -> Hash {
    let mut h = Sha3_256::new();
    h.update(payload);
    h.update(channel.to_le_bytes());
    h.finalize().into()
}

#[derive(Debug, PartialEq, Eq)]
pub enum BbsStatus {
    Stored,
    Duplicate,
    /// Timestamp outside the accepted window or payload too large.
    Rejected,
}

pub struct BbsStore {
    cfg: BbsCfg,
    msgs: HashMap<Hash, BbsRecord>,
    /// (time_posted, key) for age-ordered scans and eviction.
    by_time: BTreeMap<(u64, Hash), ()>,
    total_bytes: usize,
}

impl BbsStore {
    pub fn new(cfg: BbsCfg) -> Self {
        BbsStore { cfg, msgs: HashMap::new(), by_time: BTreeMap::new(), total_bytes: 0 }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn get(&self, key: &Hash) -> Option<&BbsRecord> {
        self.msgs.get(key)
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.msgs.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &BbsRecord)> {
        self.msgs.iter()
    }

    /// Admit one message. Returns the derived key alongside the status.
    pub fn insert(&mut self, msg: msgs::BbsMsg, now_s: u64) -> (Hash, BbsStatus) {
        let key = msg_key(&msg.payload, msg.channel);

        if msg.payload.len() > self.cfg.msg_max_bytes {
            return (key, BbsStatus::Rejected);
        }
        if msg.time_posted > now_s + self.cfg.max_ahead_s
            || msg.time_posted + self.cfg.retention_s < now_s
        {
            return (key, BbsStatus::Rejected);
        }
        if self.msgs.contains_key(&key) {
            return (key, BbsStatus::Duplicate);
        }

        self.total_bytes += msg.payload.len();
        self.by_time.insert((msg.time_posted, key), ());
        self.msgs.insert(
            key,
            BbsRecord {
                channel: msg.channel,
                time_posted: msg.time_posted,
                payload: msg.payload,
                nonce: msg.nonce,
            },
        );
        self.enforce_caps(now_s);
        (key, BbsStatus::Stored)
    }

    /// Age out expired messages and shrink back under the soft size cap.
    pub fn cleanup(&mut self, now_s: u64) {
        self.enforce_caps(now_s);
    }

    fn enforce_caps(&mut self, now_s: u64) {
        let horizon = now_s.saturating_sub(self.cfg.retention_s);
        // age first
        loop {
            let Some((&(t, key), _)) = self.by_time.iter().next() else { break };
            if t >= horizon {
                break;
            }
            self.remove(&key);
        }
        // then size, still oldest-first
        while self.total_bytes > self.cfg.store_soft_bytes {
            let Some((&(_, key), _)) = self.by_time.iter().next() else { break };
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &Hash) {
        if let Some(rec) = self.msgs.remove(key) {
            self.total_bytes -= rec.payload.len();
            self.by_time.remove(&(rec.time_posted, *key));
            debug!(key = %hex::encode(&key[..6]), "bbs message evicted");
        }
    }

    /// Keys posted at or after `time_from`, oldest first. Used both for the
    /// per-connection announce cursor and for subscription replay.
    pub fn keys_since(&self, time_from: u64, channel: Option<u32>) -> Vec<(Hash, u64, usize)> {
        self.by_time
            .range((time_from, [0u8; 32])..)
            .filter_map(|(&(t, key), _)| {
                let rec = self.msgs.get(&key)?;
                if let Some(ch) = channel {
                    if rec.channel != ch {
                        return None;
                    }
                }
                Some((key, t, rec.payload.len()))
            })
            .collect()
    }

    /// Keys strictly after `floor` in (time, key) order. The floor is the
    /// last announcement a connection got; walking from it resumes a
    /// choked broadcast without repeats.
    pub fn keys_after(
        &self,
        floor: (u64, Hash),
        channel: Option<u32>,
    ) -> Vec<(Hash, u64, usize)> {
        use std::ops::Bound;
        self.by_time
            .range((Bound::Excluded(floor), Bound::Unbounded))
            .filter_map(|(&(t, key), _)| {
                let rec = self.msgs.get(&key)?;
                if let Some(ch) = channel {
                    if rec.channel != ch {
                        return None;
                    }
                }
                Some((key, t, rec.payload.len()))
            })
            .collect()
    }

    /// Recommend the least-populated channel of the advertised band (the
    /// pick-channel service).
    pub fn pick_channel(&self, band: u32) -> u32 {
        let mut counts: BTreeMap<u32, usize> = (0..band).map(|c| (c, 0)).collect();
        for rec in self.msgs.values() {
            if let Entry::Occupied(mut e) = counts.entry(rec.channel) {
                *e.get_mut() += 1;
            }
        }
        counts
            .into_iter()
            .min_by_key(|&(ch, n)| (n, ch))
            .map(|(ch, _)| ch)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BbsCfg {
        BbsCfg::default()
    }

    fn msg(channel: u32, t: u64, payload: &[u8]) -> msgs::BbsMsg {
        msgs::BbsMsg { channel, time_posted: t, payload: payload.to_vec(), nonce: 0 }
    }

    #[test]
    fn derived_key_commits_to_payload_and_channel() {
        let k1 = msg_key(b"hello", 1);
        assert_eq!(k1, msg_key(b"hello", 1));
        assert_ne!(k1, msg_key(b"hello", 2));
        assert_ne!(k1, msg_key(b"hellp", 1));
    }

    #[test]
    fn duplicates_detected_by_key() {
        let mut store = BbsStore::new(cfg());
        let now = 1_000_000;
        let (k1, s1) = store.insert(msg(1, now, b"abc"), now);
        assert_eq!(s1, BbsStatus::Stored);
        // same payload+channel, different nonce/time: still the same message
        let (k2, s2) = store.insert(msg(1, now - 5, b"abc"), now);
        assert_eq!(k1, k2);
        assert_eq!(s2, BbsStatus::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stored_key_matches_hash_invariant() {
        let mut store = BbsStore::new(cfg());
        let now = 1_000_000;
        let (key, _) = store.insert(msg(7, now, b"payload"), now);
        let rec = store.get(&key).unwrap();
        assert_eq!(key, msg_key(&rec.payload, rec.channel));
    }

    #[test]
    fn rejects_far_future_and_expired() {
        let mut store = BbsStore::new(cfg());
        let now = 1_000_000;
        let ahead = now + cfg().max_ahead_s + 1;
        assert_eq!(store.insert(msg(1, ahead, b"x"), now).1, BbsStatus::Rejected);

        let ancient = now - cfg().retention_s - 1;
        assert_eq!(store.insert(msg(1, ancient, b"y"), now).1, BbsStatus::Rejected);
    }

    #[test]
    fn age_cap_evicts_on_cleanup() {
        let mut store = BbsStore::new(cfg());
        let t0 = 1_000_000;
        let (old_key, _) = store.insert(msg(1, t0, b"old"), t0);
        let later = t0 + cfg().retention_s + 10;
        let (new_key, _) = store.insert(msg(1, later, b"new"), later);

        store.cleanup(later);
        assert!(!store.contains(&old_key));
        assert!(store.contains(&new_key));
    }

    #[test]
    fn size_cap_evicts_oldest_first() {
        let mut c = cfg();
        c.store_soft_bytes = 25;
        let mut store = BbsStore::new(c);
        let now = 1_000_000;
        let (k1, _) = store.insert(msg(1, now, &[1u8; 10]), now);
        let (k2, _) = store.insert(msg(1, now + 1, &[2u8; 10]), now);
        let (k3, _) = store.insert(msg(1, now + 2, &[3u8; 10]), now);

        assert!(!store.contains(&k1));
        assert!(store.contains(&k2));
        assert!(store.contains(&k3));
        assert!(store.total_bytes() <= 25);
    }

    #[test]
    fn keys_since_orders_and_filters() {
        let mut store = BbsStore::new(cfg());
        let now = 1_000_000;
        store.insert(msg(1, now + 2, b"c"), now);
        store.insert(msg(2, now + 1, b"b"), now);
        store.insert(msg(1, now, b"a"), now);

        let all = store.keys_since(0, None);
        let times: Vec<u64> = all.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(times, vec![now, now + 1, now + 2]);

        let ch1 = store.keys_since(now + 1, Some(1));
        assert_eq!(ch1.len(), 1);
        assert_eq!(ch1[0].1, now + 2);
    }

    #[test]
    fn keys_after_excludes_the_floor() {
        let mut store = BbsStore::new(cfg());
        let now = 1_000_000;
        let (k1, _) = store.insert(msg(1, now, b"a"), now);
        store.insert(msg(1, now + 1, b"b"), now);

        let rest = store.keys_after((now, k1), None);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1, now + 1);
    }

    #[test]
    fn pick_channel_prefers_quiet_ones() {
        let mut store = BbsStore::new(cfg());
        let now = 1_000_000;
        store.insert(msg(0, now, b"one"), now);
        store.insert(msg(0, now + 1, b"two"), now);
        store.insert(msg(1, now, b"three"), now);
        assert_eq!(store.pick_channel(3), 2);
    }
}
