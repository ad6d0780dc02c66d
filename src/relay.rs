//! Outbound broadcast rings.
//!
//! Announcements (transaction ids, bulletin keys) are appended to a shared
//! ring; every connection keeps a cursor, the sequence number of the next
//! item it owes the peer. Broadcast walks from the cursor forward and stops
//! when the ring is exhausted or the connection starts chocking; resuming
//! from the saved cursor sends each item exactly once per peer.
//!
//! Cursors are plain sequence numbers, so a connection dying mid-broadcast
//! leaves nothing to unlink.

use crate::types::Hash;
use std::collections::VecDeque;

/// One announced item: key plus a wire-size hint for choke accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingItem {
    pub seq: u64,
    pub key: Hash,
    pub size_hint: usize,
}

/// Bounded append-only ring with monotonically increasing sequence numbers.
pub struct SendRing {
    items: VecDeque<RingItem>,
    next_seq: u64,
    cap: usize,
}

impl SendRing {
    pub fn new(cap: usize) -> Self {
        SendRing { items: VecDeque::new(), next_seq: 0, cap }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sequence number a fresh connection starts from (nothing owed).
    pub fn head_cursor(&self) -> u64 {
        self.next_seq
    }

    /// Append an item; old entries fall off the front past the capacity.
    pub fn push(&mut self, key: Hash, size_hint: usize) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(RingItem { seq, key, size_hint });
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
        seq
    }

    /// Remove a withdrawn item (e.g. a transaction that left the pool).
    pub fn remove(&mut self, key: &Hash) {
        self.items.retain(|i| &i.key != key);
    }

    /// Items at or after `cursor`, oldest first.
    pub fn since(&self, cursor: u64) -> impl Iterator<Item = &RingItem> {
        // the ring is seq-ordered; skip the already-sent prefix
        let start = self.items.partition_point(|i| i.seq < cursor);
        self.items.range(start..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Hash {
        [b; 32]
    }

    #[test]
    fn cursor_walk_sees_each_item_once() {
        let mut ring = SendRing::new(16);
        let mut cursor = ring.head_cursor();
        ring.push(key(1), 10);
        ring.push(key(2), 10);

        let mut sent = Vec::new();
        for item in ring.since(cursor) {
            sent.push(item.key);
            cursor = item.seq + 1;
        }
        assert_eq!(sent, vec![key(1), key(2)]);

        // nothing new: the walk is empty
        assert_eq!(ring.since(cursor).count(), 0);

        // resume after more pushes picks up only the new items
        ring.push(key(3), 10);
        let fresh: Vec<Hash> = ring.since(cursor).map(|i| i.key).collect();
        assert_eq!(fresh, vec![key(3)]);
    }

    #[test]
    fn interrupted_walk_resumes_where_it_stopped() {
        let mut ring = SendRing::new(16);
        for b in 1..=5u8 {
            ring.push(key(b), 10);
        }

        // send two, then "choke"
        let mut cursor = 0;
        for item in ring.since(cursor).take(2) {
            cursor = item.seq + 1;
        }
        assert_eq!(cursor, 2);

        let rest: Vec<Hash> = ring.since(cursor).map(|i| i.key).collect();
        assert_eq!(rest, vec![key(3), key(4), key(5)]);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut ring = SendRing::new(3);
        for b in 1..=5u8 {
            ring.push(key(b), 1);
        }
        assert_eq!(ring.len(), 3);
        let all: Vec<Hash> = ring.since(0).map(|i| i.key).collect();
        assert_eq!(all, vec![key(3), key(4), key(5)]);
    }

    #[test]
    fn withdrawn_items_disappear() {
        let mut ring = SendRing::new(16);
        ring.push(key(1), 1);
        ring.push(key(2), 1);
        ring.remove(&key(1));
        let all: Vec<Hash> = ring.since(0).map(|i| i.key).collect();
        assert_eq!(all, vec![key(2)]);
    }
}
