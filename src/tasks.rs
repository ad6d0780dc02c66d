//! Fetch-task scheduler bookkeeping.
//!
//! A task is a pending header(-pack) or block(-pack) fetch, identified by
//! its key: two tasks with the same key never coexist. The scheduler owns
//! every task and the per-owner lists; connections refer to tasks only
//! through keys, so releasing a dead connection's work is a map operation.
//!
//! Global counters charge the number of requested units (headers or
//! bodies) per in-flight request and refund on release, capping how much
//! the node asks the network for at once.

use crate::config::{BandwidthCfg, FastSyncWindow};
use crate::msgs::{GetBodyPack, GetHdrPack};
use crate::types::{now_ms, BlockId};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Stable key of a live connection (the node's arena index).
pub type ConnKey = u64;

/// Task identity: the wanted state plus whether the body is wanted.
pub type TaskKey = (BlockId, bool);

#[derive(Debug, Clone)]
pub struct Task {
    pub key: TaskKey,
    /// The tip that justifies this fetch; only ever raised.
    pub target: BlockId,
    /// Re-armed by every congestion report; a released un-needed task dies.
    pub needed: bool,
    pub owner: Option<ConnKey>,
    /// Units charged to the global counter while assigned.
    pub count: u32,
    pub assigned_at_ms: u64,
    /// Fast-sync stamps captured at assignment time.
    pub h0: u64,
    pub horizon_lo: u64,
}

/// What became of a released task.
#[derive(Debug, PartialEq, Eq)]
pub enum Released {
    /// Back on the unassigned list, wants a new owner.
    Requeued,
    /// No longer needed; removed.
    Deleted,
}

pub struct TaskScheduler {
    bw: BandwidthCfg,
    tasks: HashMap<TaskKey, Task>,
    unassigned: VecDeque<TaskKey>,
    owned: HashMap<ConnKey, Vec<TaskKey>>,
    pack_hdr: u32,
    pack_body: u32,
}

impl TaskScheduler {
    pub fn new(bw: BandwidthCfg) -> Self {
        TaskScheduler {
            bw,
            tasks: HashMap::new(),
            unassigned: VecDeque::new(),
            owned: HashMap::new(),
            pack_hdr: 0,
            pack_body: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    /// Outstanding (header, body) units.
    pub fn counters(&self) -> (u32, u32) {
        (self.pack_hdr, self.pack_body)
    }

    /// Keys waiting for an owner, oldest first.
    pub fn unassigned_keys(&self) -> Vec<TaskKey> {
        self.unassigned.iter().copied().collect()
    }

    /// Keys currently assigned to a connection, assignment order.
    pub fn tasks_of(&self, conn: ConnKey) -> &[TaskKey] {
        self.owned.get(&conn).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The connection's head task, whose deadline drives the request timer.
    pub fn head_of(&self, conn: ConnKey) -> Option<&Task> {
        self.owned.get(&conn)?.first().and_then(|k| self.tasks.get(k))
    }

    /// Congestion report from the block processor: ensure a task exists and
    /// is armed. Returns true when the key may need an assignment pass.
    pub fn request_data(&mut self, id: BlockId, is_block: bool, target: BlockId) -> bool {
        let key = (id, is_block);
        match self.tasks.get_mut(&key) {
            None => {
                debug!(%id, is_block, "requesting data");
                self.tasks.insert(
                    key,
                    Task {
                        key,
                        target,
                        needed: true,
                        owner: None,
                        count: 0,
                        assigned_at_ms: 0,
                        h0: 0,
                        horizon_lo: 0,
                    },
                );
                self.unassigned.push_back(key);
                true
            }
            Some(t) => {
                t.needed = true;
                if t.owner.is_none() {
                    if t.target.height < target.height {
                        t.target = target;
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether a new block-body request fits under the global cap.
    pub fn body_budget_left(&self) -> bool {
        self.pack_body < self.bw.blocks_concurrent_max
    }

    /// Header-pack units still available under the global cap.
    pub fn hdr_budget_left(&self) -> u32 {
        self.bw.hdr_requests_max.saturating_sub(self.pack_hdr)
    }

    /// Size a header-pack request: bounded by the network maximum, the
    /// remaining global budget, and the height delta between our cursor
    /// and the wanted state (avoids overlap without starving big syncs).
    pub fn hdr_pack_count(&self, key_height: u64, cursor_height: u64) -> u32 {
        let mut n = self.bw.hdr_pack_max.min(self.hdr_budget_left());
        let dh = key_height.abs_diff(cursor_height);
        if u64::from(n) > dh {
            n = dh.max(1) as u32;
        }
        n
    }

    /// Compose the body(-pack) request for a task. Fast-sync bounds are
    /// filled only when the key falls inside the window.
    pub fn compose_body_request(
        &self,
        key: &TaskKey,
        target: &BlockId,
        fast: Option<&FastSyncWindow>,
    ) -> (GetBodyPack, u32) {
        let msg = match fast {
            Some(w) if key.0.height <= w.target.height => GetBodyPack {
                top: w.target,
                count_extra: w.target.height - key.0.height,
                h0: w.h0,
                horizon_lo: w.horizon_lo,
                horizon_hi: w.target.height,
            },
            _ => GetBodyPack {
                top: *target,
                count_extra: target.height.saturating_sub(key.0.height),
                h0: 0,
                horizon_lo: 0,
                horizon_hi: 0,
            },
        };
        // an estimate: the actual number of bodies may come up short
        let count = (msg.count_extra.min(u64::from(self.bw.body_pack_max)) as u32) + 1;
        (msg, count)
    }

    /// Compose a header-pack request.
    pub fn compose_hdr_request(&self, key: &TaskKey, cursor_height: u64) -> (GetHdrPack, u32) {
        let count = self.hdr_pack_count(key.0.height, cursor_height);
        (GetHdrPack { top: key.0, count }, count)
    }

    /// Bind an unassigned task to a connection and charge the counter.
    pub fn assign(&mut self, key: TaskKey, conn: ConnKey, count: u32, fast: Option<&FastSyncWindow>) {
        let Some(t) = self.tasks.get_mut(&key) else { return };
        debug_assert!(t.owner.is_none());
        t.owner = Some(conn);
        t.count = count;
        t.assigned_at_ms = now_ms();
        if let Some(w) = fast {
            t.h0 = w.h0;
            t.horizon_lo = w.horizon_lo;
        }
        if key.1 {
            self.pack_body += count;
        } else {
            self.pack_hdr += count;
        }
        self.unassigned.retain(|k| k != &key);
        self.owned.entry(conn).or_default().push(key);
    }

    /// Whether the connection is already transferring a block body.
    pub fn conn_has_block(&self, conn: ConnKey) -> bool {
        self.tasks_of(conn).iter().any(|k| k.1)
    }

    /// Detach a task from its owner, refund the counter, and either
    /// requeue it (still needed) or delete it.
    pub fn release(&mut self, key: TaskKey) -> Released {
        let Some(t) = self.tasks.get_mut(&key) else { return Released::Deleted };
        if let Some(conn) = t.owner.take() {
            if let Some(list) = self.owned.get_mut(&conn) {
                list.retain(|k| k != &key);
                if list.is_empty() {
                    self.owned.remove(&conn);
                }
            }
            let refund = std::mem::take(&mut t.count);
            if key.1 {
                self.pack_body -= refund;
            } else {
                self.pack_hdr -= refund;
            }
        } else {
            self.unassigned.retain(|k| k != &key);
        }

        if t.needed {
            t.owner = None;
            self.unassigned.push_back(key);
            Released::Requeued
        } else {
            self.tasks.remove(&key);
            Released::Deleted
        }
    }

    /// Delivery arrived: the task is finished for good.
    pub fn complete(&mut self, key: TaskKey) {
        if let Some(t) = self.tasks.get_mut(&key) {
            t.needed = false;
        }
        self.release(key);
    }

    /// Release everything a dying connection owned. Returns the requeued keys.
    pub fn release_conn(&mut self, conn: ConnKey) -> Vec<TaskKey> {
        let keys = self.owned.remove(&conn).unwrap_or_default();
        let mut requeued = Vec::new();
        for key in keys {
            // re-insert the list entry so release() bookkeeping stays uniform
            self.owned.entry(conn).or_default().push(key);
            if self.release(key) == Released::Requeued {
                requeued.push(key);
            }
        }
        self.owned.remove(&conn);
        requeued
    }

    /// Drop an unassigned, no-longer-needed task (post-sync cleanup).
    pub fn prune_unneeded(&mut self) {
        let dead: Vec<TaskKey> = self
            .unassigned
            .iter()
            .filter(|k| self.tasks.get(k).map(|t| !t.needed).unwrap_or(true))
            .copied()
            .collect();
        for key in dead {
            self.unassigned.retain(|k| k != &key);
            self.tasks.remove(&key);
        }
    }

    /// Structural invariant: every task is either unowned and queued, or
    /// owned and on exactly that owner's list. Counter invariant: the
    /// global counters equal the per-task charge sums.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut hdr = 0u32;
        let mut body = 0u32;
        for (key, t) in &self.tasks {
            match t.owner {
                None => {
                    assert_eq!(self.unassigned.iter().filter(|k| *k == key).count(), 1);
                    assert_eq!(t.count, 0);
                }
                Some(conn) => {
                    assert!(!self.unassigned.contains(key));
                    assert_eq!(
                        self.owned.get(&conn).map(|l| l.iter().filter(|k| *k == key).count()),
                        Some(1)
                    );
                    if key.1 {
                        body += t.count;
                    } else {
                        hdr += t.count;
                    }
                }
            }
        }
        assert_eq!((hdr, body), (self.pack_hdr, self.pack_body));
        for (conn, list) in &self.owned {
            for key in list {
                assert_eq!(self.tasks.get(key).and_then(|t| t.owner), Some(*conn));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bw() -> BandwidthCfg {
        BandwidthCfg::default()
    }

    fn bid(h: u64) -> BlockId {
        BlockId { height: h, hash: [h as u8; 32] }
    }

    #[test]
    fn request_data_deduplicates_by_key() {
        let mut ts = TaskScheduler::new(bw());
        assert!(ts.request_data(bid(5), true, bid(10)));
        assert!(ts.request_data(bid(5), true, bid(12)));
        assert_eq!(ts.len(), 1);
        // target raised while unassigned
        assert_eq!(ts.get(&(bid(5), true)).unwrap().target, bid(12));
        ts.check_invariants();
    }

    #[test]
    fn header_and_body_tasks_are_distinct() {
        let mut ts = TaskScheduler::new(bw());
        ts.request_data(bid(5), true, bid(10));
        ts.request_data(bid(5), false, bid(10));
        assert_eq!(ts.len(), 2);
        ts.check_invariants();
    }

    #[test]
    fn assign_charges_and_release_refunds() {
        let mut ts = TaskScheduler::new(bw());
        ts.request_data(bid(5), true, bid(10));
        let key = (bid(5), true);

        let (_, count) = ts.compose_body_request(&key, &bid(10), None);
        ts.assign(key, 1, count, None);
        assert_eq!(ts.counters(), (0, count));
        assert!(ts.conn_has_block(1));
        ts.check_invariants();

        assert_eq!(ts.release(key), Released::Requeued);
        assert_eq!(ts.counters(), (0, 0));
        assert!(!ts.conn_has_block(1));
        assert_eq!(ts.unassigned_keys(), vec![key]);
        ts.check_invariants();
    }

    #[test]
    fn complete_removes_the_task() {
        let mut ts = TaskScheduler::new(bw());
        ts.request_data(bid(5), false, bid(10));
        let key = (bid(5), false);
        let (_, count) = ts.compose_hdr_request(&key, 0);
        ts.assign(key, 1, count, None);

        ts.complete(key);
        assert_eq!(ts.len(), 0);
        assert_eq!(ts.counters(), (0, 0));
        ts.check_invariants();
    }

    #[test]
    fn release_conn_requeues_needed_tasks() {
        let mut ts = TaskScheduler::new(bw());
        for h in 1..=3 {
            ts.request_data(bid(h), h % 2 == 0, bid(10));
        }
        for key in ts.unassigned_keys() {
            ts.assign(key, 7, 2, None);
        }
        ts.check_invariants();

        let requeued = ts.release_conn(7);
        assert_eq!(requeued.len(), 3);
        assert_eq!(ts.counters(), (0, 0));
        assert!(ts.tasks_of(7).is_empty());
        ts.check_invariants();
    }

    #[test]
    fn key_survives_reassignment() {
        // E4 shape: released task keeps its identity and can move to a
        // fresh owner with the counters balanced throughout
        let mut ts = TaskScheduler::new(bw());
        ts.request_data(bid(5), true, bid(10));
        let key = (bid(5), true);

        ts.assign(key, 1, 6, None);
        ts.check_invariants();
        ts.release(key);
        ts.check_invariants();
        ts.assign(key, 2, 6, None);
        ts.check_invariants();

        assert_eq!(ts.get(&key).unwrap().owner, Some(2));
        assert_eq!(ts.get(&key).unwrap().key, key);
    }

    #[test]
    fn hdr_pack_count_is_bounded_by_delta() {
        let ts = TaskScheduler::new(bw());
        // far target: full pack
        assert_eq!(ts.hdr_pack_count(1000, 0), bw().hdr_pack_max);
        // close target: just the gap
        assert_eq!(ts.hdr_pack_count(3, 1), 2);
        // equal heights still ask for one
        assert_eq!(ts.hdr_pack_count(5, 5), 1);
    }

    #[test]
    fn hdr_budget_depletes() {
        let mut ts = TaskScheduler::new(bw());
        let total = bw().hdr_requests_max;
        ts.request_data(bid(1000), false, bid(2000));
        let key = (bid(1000), false);
        let (_, count) = ts.compose_hdr_request(&key, 0);
        ts.assign(key, 1, count, None);

        assert_eq!(ts.hdr_budget_left(), total - count);
        ts.check_invariants();
    }

    #[test]
    fn fast_sync_window_fills_bounds() {
        let ts = TaskScheduler::new(bw());
        let window = FastSyncWindow { h0: 10, horizon_lo: 50, target: bid(100) };
        let key = (bid(40), true);

        let (msg, _) = ts.compose_body_request(&key, &bid(60), Some(&window));
        assert_eq!(msg.top, bid(100));
        assert_eq!(msg.count_extra, 60);
        assert_eq!(msg.h0, 10);
        assert_eq!(msg.horizon_lo, 50);
        assert_eq!(msg.horizon_hi, 100);

        // outside the window: a plain ranged request
        let key2 = (bid(150), true);
        let (msg2, _) = ts.compose_body_request(&key2, &bid(160), Some(&window));
        assert_eq!(msg2.top, bid(160));
        assert_eq!(msg2.h0, 0);
    }

    #[test]
    fn unneeded_unassigned_tasks_prune() {
        let mut ts = TaskScheduler::new(bw());
        ts.request_data(bid(5), false, bid(10));
        let key = (bid(5), false);
        ts.tasks.get_mut(&key).unwrap().needed = false;
        ts.prune_unneeded();
        assert_eq!(ts.len(), 0);
        ts.check_invariants();
    }
}
