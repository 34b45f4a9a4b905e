// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The idle-worker registry.
//!
//! When a worker's `get` finds nothing, it parks here until a matching
//! task arrives (or shutdown). Requests are kept FIFO per type, with an
//! O(1) side table answering "is this worker waiting, and for what
//! type?", which the put path uses to match targeted work without
//! scanning.
//!
//! Only workers homed on this server ever appear here; targeted work for
//! other workers never arrives at this server in the first place.
//!
//! A worker has at most one outstanding request. A second `add` for a
//! rank already waiting is an invariant violation in the RPC stream and
//! panics.

use abi::{Rank, WorkType};
use slablist::{Handle, SlabList};

use crate::layout::Layout;

#[derive(Copy, Clone, Debug)]
struct Request {
    rank: Rank,
    work_type: WorkType,
}

pub struct RequestQueue {
    /// FIFO of waiters per type.
    by_type: Vec<SlabList<Request>>,
    /// Per my-worker index: where that worker's request lives.
    by_worker: Vec<Option<(WorkType, Handle)>>,
    total: usize,
}

impl RequestQueue {
    pub fn new(types: usize, my_workers: usize) -> Self {
        let mut by_type = Vec::with_capacity(types);
        by_type.resize_with(types, || SlabList::with_capacity(my_workers));
        Self {
            by_type,
            by_worker: vec![None; my_workers],
            total: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.total
    }

    /// Parks `rank` waiting for work of `work_type`.
    ///
    /// # Panics
    ///
    /// Panics if the worker is already waiting; one blocked `get` per
    /// worker is a protocol invariant.
    pub fn add(&mut self, rank: Rank, work_type: WorkType, layout: &Layout) {
        log::trace!("requestqueue add(rank={rank}, type={work_type})");
        let ix = layout.my_worker_ix(rank);
        assert!(
            self.by_worker[ix].is_none(),
            "requestqueue: double add: rank: {rank}",
        );
        let handle =
            self.by_type[work_type as usize].push_back(Request { rank, work_type });
        self.by_worker[ix] = Some((work_type, handle));
        self.total += 1;
    }

    /// Is `rank` waiting, and for which type?
    pub fn waiting_type(&self, rank: Rank, layout: &Layout) -> Option<WorkType> {
        self.by_worker[layout.my_worker_ix(rank)].map(|(t, _)| t)
    }

    /// If `rank` itself is waiting for `work_type`, removes and returns
    /// it.
    pub fn matches_target(
        &mut self,
        rank: Rank,
        work_type: WorkType,
        layout: &Layout,
    ) -> Option<Rank> {
        let ix = layout.my_worker_ix(rank);
        let (t, handle) = self.by_worker[ix]?;
        if t != work_type {
            return None;
        }
        let req = self.by_type[t as usize].remove(handle)?;
        self.by_worker[ix] = None;
        self.total -= 1;
        Some(req.rank)
    }

    /// If any worker on `host` is waiting for `work_type`, removes and
    /// returns it.
    pub fn matches_node(
        &mut self,
        host: usize,
        work_type: WorkType,
        layout: &Layout,
    ) -> Option<Rank> {
        // Host fan-out is small (the workers of one node), so a scan is
        // fine here.
        let candidate = layout
            .workers_on_host(host)
            .iter()
            .copied()
            .find(|&w| self.waiting_type(w, layout) == Some(work_type))?;
        self.matches_target(candidate, work_type, layout)
    }

    /// Removes and returns the longest-waiting worker for `work_type`.
    pub fn matches_type(
        &mut self,
        work_type: WorkType,
        layout: &Layout,
    ) -> Option<Rank> {
        let req = self.by_type[work_type as usize].pop_front()?;
        self.by_worker[layout.my_worker_ix(req.rank)] = None;
        self.total -= 1;
        Some(req.rank)
    }

    /// Atomically removes `parallelism` waiters of `work_type`, FIFO
    /// order, or removes none if not enough are waiting.
    pub fn parallel_workers(
        &mut self,
        work_type: WorkType,
        parallelism: i32,
        layout: &Layout,
    ) -> Option<Vec<Rank>> {
        let n = parallelism as usize;
        if self.by_type[work_type as usize].len() < n {
            return None;
        }
        let mut ranks = Vec::with_capacity(n);
        for _ in 0..n {
            ranks.push(
                self.matches_type(work_type, layout)
                    .expect("length checked above"),
            );
        }
        Some(ranks)
    }

    /// Snapshot of all waiters, for the post-steal recheck.
    pub fn entries(&self) -> Vec<(Rank, WorkType)> {
        let mut out = Vec::with_capacity(self.total);
        for list in &self.by_type {
            out.extend(list.iter().map(|r| (r.rank, r.work_type)));
        }
        out
    }

    /// Removes a specific waiter found via [`Self::entries`].
    pub fn remove(&mut self, rank: Rank, layout: &Layout) -> bool {
        let ix = layout.my_worker_ix(rank);
        let Some((t, handle)) = self.by_worker[ix] else {
            return false;
        };
        let removed = self.by_type[t as usize].remove(handle).is_some();
        if removed {
            self.by_worker[ix] = None;
            self.total -= 1;
        }
        removed
    }

    /// Per-type waiter counts, sent with steal requests so we only
    /// solicit types we can actually dispatch.
    pub fn type_counts(&self) -> Vec<i64> {
        let counts: Vec<i64> =
            self.by_type.iter().map(|l| l.len() as i64).collect();
        debug_assert_eq!(
            counts.iter().sum::<i64>(),
            self.total as i64,
        );
        counts
    }

    /// Drains every waiter for shutdown; the caller owes each returned
    /// rank a shutdown response to unblock its `get`.
    pub fn shutdown_drain(&mut self, layout: &Layout) -> Vec<Rank> {
        let mut out = Vec::with_capacity(self.total);
        for t in 0..self.by_type.len() {
            while let Some(rank) = self.matches_type(t as WorkType, layout) {
                out.push(rank);
            }
        }
        debug_assert_eq!(self.total, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_server() -> Layout {
        Layout::new(5, 4, 1, &[]).unwrap()
    }

    #[test]
    fn fifo_within_type() {
        let l = one_server();
        let mut q = RequestQueue::new(2, 4);
        q.add(2, 0, &l);
        q.add(0, 0, &l);
        q.add(1, 1, &l);

        assert_eq!(q.size(), 3);
        assert_eq!(q.matches_type(0, &l), Some(2));
        assert_eq!(q.matches_type(0, &l), Some(0));
        assert_eq!(q.matches_type(0, &l), None);
        assert_eq!(q.matches_type(1, &l), Some(1));
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn target_matching_requires_type() {
        let l = one_server();
        let mut q = RequestQueue::new(2, 4);
        q.add(2, 1, &l);

        assert_eq!(q.matches_target(2, 0, &l), None);
        assert_eq!(q.matches_target(3, 1, &l), None);
        assert_eq!(q.matches_target(2, 1, &l), Some(2));
        // Gone after the match.
        assert_eq!(q.matches_target(2, 1, &l), None);
        assert_eq!(q.size(), 0);
    }

    #[test]
    #[should_panic(expected = "double add")]
    fn double_add_is_fatal() {
        let l = one_server();
        let mut q = RequestQueue::new(1, 4);
        q.add(2, 0, &l);
        q.add(2, 0, &l);
    }

    #[test]
    fn parallel_workers_all_or_nothing() {
        let l = one_server();
        let mut q = RequestQueue::new(1, 4);
        q.add(0, 0, &l);
        q.add(1, 0, &l);

        // Not enough waiters: nothing is removed.
        assert_eq!(q.parallel_workers(0, 3, &l), None);
        assert_eq!(q.size(), 2);

        q.add(3, 0, &l);
        assert_eq!(q.parallel_workers(0, 3, &l), Some(vec![0, 1, 3]));
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn node_matching() {
        let names: Vec<String> =
            ["n0", "n0", "n1", "n1", "srv"].iter().map(|s| s.to_string()).collect();
        let l = Layout::new(5, 4, 1, &names).unwrap();
        let mut q = RequestQueue::new(1, 4);
        q.add(1, 0, &l);
        q.add(3, 0, &l);

        let host_of_0 = l.worker_host(0);
        // Worker 0's host peer is worker 1.
        assert_eq!(q.matches_node(host_of_0, 0, &l), Some(1));
        // No one else on that host is waiting now.
        assert_eq!(q.matches_node(host_of_0, 0, &l), None);
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn entries_and_remove_for_recheck() {
        let l = one_server();
        let mut q = RequestQueue::new(2, 4);
        q.add(0, 0, &l);
        q.add(1, 1, &l);

        let mut entries = q.entries();
        entries.sort_unstable();
        assert_eq!(entries, [(0, 0), (1, 1)]);

        assert!(q.remove(1, &l));
        assert!(!q.remove(1, &l));
        assert_eq!(q.size(), 1);
        assert_eq!(q.type_counts(), [1, 0]);
    }

    #[test]
    fn shutdown_drains_everyone() {
        let l = one_server();
        let mut q = RequestQueue::new(2, 4);
        q.add(0, 0, &l);
        q.add(1, 1, &l);
        q.add(2, 0, &l);

        let mut drained = q.shutdown_drain(&l);
        drained.sort_unstable();
        assert_eq!(drained, [0, 1, 2]);
        assert_eq!(q.size(), 0);
    }
}
