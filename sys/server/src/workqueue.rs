// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-ordered storage for queued tasks.
//!
//! Serial work units live in a slab; the priority indices hold *handles*
//! (slab slots) rather than the units themselves:
//!
//! - untargeted work is indexed per type;
//! - hard rank-targeted work is indexed per (local worker, type);
//! - hard node-targeted work is indexed per (host, type);
//! - soft-targeted work is indexed under its target *and* mirrored into
//!   the untargeted index at a heavily reduced priority, so the target is
//!   preferred but the task can still be dispatched or stolen.
//!
//! Indices are allowed to go stale: removing a unit through one index
//! does not eagerly fix the others. Instead, every pop re-checks the slab
//! slot against the expected type, target, and priority, and discards
//! entries that no longer match. (There is a corner case where a slot was
//! reused by a different unit that matches on all three; either unit is
//! equally dispatchable then, so this is harmless.)
//!
//! Heap keys are negated priorities widened to i64, so the min-heap root
//! is the highest-priority task and `i32::MIN` priorities don't overflow.
//!
//! Parallel (gang) tasks are never targeted and never in the slab; each
//! type has an ordered tree walked in priority order at release time.

use std::collections::BTreeMap;

use abi::{Accuracy, Rank, Strictness, WorkType};
use idxheap::IdxHeap;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::layout::Layout;

/// Priority penalty applied to the untargeted mirror entry of a
/// soft-targeted task. Large enough that any untargeted task beats any
/// mirrored soft-targeted one; the exact value is tunable.
pub const SOFT_TARGET_PRIORITY_PENALTY: i32 = 65536;

/// Minimum fractional imbalance before a steal victim gives work to a
/// stealer whose queue is non-empty.
const STEAL_IMBALANCE: f64 = 0.1;

/// Where a task wants to run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Target {
    /// `None` = untargeted.
    pub rank: Option<Rank>,
    pub strictness: Strictness,
    pub accuracy: Accuracy,
}

impl Target {
    pub fn any() -> Self {
        Self {
            rank: None,
            strictness: Strictness::Hard,
            accuracy: Accuracy::Rank,
        }
    }

    pub fn rank(rank: Rank) -> Self {
        Self {
            rank: Some(rank),
            strictness: Strictness::Hard,
            accuracy: Accuracy::Rank,
        }
    }

    pub fn from_wire(
        rank: Rank,
        strictness: Strictness,
        accuracy: Accuracy,
    ) -> Self {
        Self {
            rank: if rank < 0 { None } else { Some(rank) },
            strictness,
            accuracy,
        }
    }

    pub fn wire_rank(&self) -> Rank {
        self.rank.unwrap_or(abi::RANK_NULL)
    }

    pub fn is_soft(&self) -> bool {
        self.strictness == Strictness::Soft
    }
}

#[derive(Clone, Debug)]
pub struct WorkUnit {
    /// Server-local bookkeeping id.
    pub id: i64,
    pub work_type: WorkType,
    pub priority: i32,
    pub putter: Rank,
    pub answer: Rank,
    pub target: Target,
    pub parallelism: i32,
    pub payload: Vec<u8>,
}

/// Per-type event counters, enabled by `PERF_COUNTERS`.
#[derive(Copy, Clone, Debug, Default)]
pub struct TypeCounters {
    pub targeted_enqueued: u64,
    pub targeted_bypass: u64,
    pub single_enqueued: u64,
    pub single_bypass: u64,
    pub single_stolen: u64,
    pub parallel_enqueued: u64,
    pub parallel_bypass: u64,
    pub parallel_stolen: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WorkQueueError {
    /// Hard-targeted work for a worker homed on a different server.
    NonLocalTarget(Rank),
    /// Task type outside `[0, types)`.
    BadType(WorkType),
}

pub struct WorkQueue {
    types: usize,
    next_id: i64,
    slots: Vec<Option<Box<WorkUnit>>>,
    free: Vec<usize>,
    /// One heap per type.
    untargeted: Vec<IdxHeap<usize>>,
    /// One heap per (local worker, type), row-major by worker.
    targeted: Vec<IdxHeap<usize>>,
    /// One heap per (host, type), row-major by host.
    node_targeted: Vec<IdxHeap<usize>>,
    /// One ordered tree per type, keyed (negated priority, unit id).
    parallel: Vec<BTreeMap<(i64, i64), Box<WorkUnit>>>,
    parallel_count: i64,
    pub counters: Option<Vec<TypeCounters>>,
}

fn neg(priority: i32) -> i64 {
    -(priority as i64)
}

/// Soft-targeted work competes in the untargeted index at reduced
/// priority; saturates instead of underflowing.
pub fn soft_target_priority(base: i32) -> i32 {
    base.saturating_sub(SOFT_TARGET_PRIORITY_PENALTY)
}

impl WorkQueue {
    pub fn new(
        types: usize,
        my_workers: usize,
        hosts: usize,
        counters_enabled: bool,
    ) -> Self {
        assert!(types >= 1, "configured with zero work types");
        let mk = |n: usize| {
            let mut v = Vec::with_capacity(n);
            v.resize_with(n, IdxHeap::new);
            v
        };
        Self {
            types,
            next_id: 1,
            slots: Vec::new(),
            free: Vec::new(),
            untargeted: mk(types),
            targeted: mk(types * my_workers),
            node_targeted: mk(types * hosts),
            parallel: {
                let mut v = Vec::with_capacity(types);
                v.resize_with(types, BTreeMap::new);
                v
            },
            parallel_count: 0,
            counters: counters_enabled
                .then(|| vec![TypeCounters::default(); types]),
        }
    }

    /// Mints a server-local work unit id.
    pub fn unique(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn parallel_task_count(&self) -> i64 {
        self.parallel_count
    }

    fn count(&mut self, t: WorkType, f: impl FnOnce(&mut TypeCounters)) {
        if let Some(c) = &mut self.counters {
            f(&mut c[t as usize]);
        }
    }

    /// Records a bypass dispatch (task handed to a waiter without ever
    /// being enqueued).
    pub fn count_bypass(&mut self, t: WorkType, parallelism: i32, targeted: bool) {
        self.count(t, |c| {
            if parallelism > 1 {
                c.parallel_bypass += 1;
            } else if targeted {
                c.targeted_bypass += 1;
            } else {
                c.single_bypass += 1;
            }
        });
    }

    fn targeted_ix(&self, layout: &Layout, rank: Rank, t: WorkType) -> usize {
        layout.my_worker_ix(rank) * self.types + t as usize
    }

    fn node_ix(&self, host: usize, t: WorkType) -> usize {
        host * self.types + t as usize
    }

    fn slab_insert(&mut self, wu: Box<WorkUnit>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                debug_assert!(self.slots[slot].is_none());
                self.slots[slot] = Some(wu);
                slot
            }
            None => {
                self.slots.push(Some(wu));
                self.slots.len() - 1
            }
        }
    }

    fn slab_remove(&mut self, slot: usize) -> Box<WorkUnit> {
        let wu = self.slots[slot].take().expect("removing empty slot");
        self.free.push(slot);
        wu
    }

    /// Adds a task to the queue.
    pub fn add(
        &mut self,
        wu: Box<WorkUnit>,
        layout: &Layout,
    ) -> Result<(), WorkQueueError> {
        let t = wu.work_type;
        if t < 0 || t as usize >= self.types {
            return Err(WorkQueueError::BadType(t));
        }

        if wu.parallelism > 1 {
            debug_assert!(wu.target.rank.is_none());
            log::trace!(
                "workq add parallel: {{{}}} x{} type {t}",
                wu.id,
                wu.parallelism,
            );
            self.parallel[t as usize].insert((neg(wu.priority), wu.id), wu);
            self.parallel_count += 1;
            self.count(t, |c| c.parallel_enqueued += 1);
            return Ok(());
        }

        match wu.target.rank {
            None => {
                let key = neg(wu.priority);
                let slot = self.slab_insert(wu);
                self.untargeted[t as usize].insert(key, slot);
                self.count(t, |c| c.single_enqueued += 1);
            }
            Some(rank) => {
                let local = layout.map_to_server(rank) == layout.rank;
                let soft = wu.target.is_soft();
                if !local && !soft {
                    // Hard-targeted work must have been routed to the
                    // target's home server.
                    return Err(WorkQueueError::NonLocalTarget(rank));
                }
                let key = neg(wu.priority);
                let soft_key = neg(soft_target_priority(wu.priority));
                let accuracy = wu.target.accuracy;
                let slot = self.slab_insert(wu);
                if local {
                    match accuracy {
                        Accuracy::Rank => {
                            let ix = self.targeted_ix(layout, rank, t);
                            self.targeted[ix].insert(key, slot);
                        }
                        Accuracy::Node => {
                            let ix = self.node_ix(layout.worker_host(rank), t);
                            self.node_targeted[ix].insert(key, slot);
                        }
                    }
                }
                if soft {
                    // Stolen soft-targeted work lands on a server that
                    // can't reach its target; the untargeted mirror is
                    // then its only index.
                    self.untargeted[t as usize].insert(soft_key, slot);
                }
                self.count(t, |c| c.targeted_enqueued += 1);
            }
        }
        Ok(())
    }

    /// Checks a slot against what an untargeted index entry promised.
    fn try_remove_untargeted(
        &mut self,
        slot: usize,
        t: WorkType,
        key: i64,
    ) -> Option<Box<WorkUnit>> {
        let wu = self.slots.get(slot)?.as_ref()?;
        if wu.work_type != t {
            return None;
        }
        if wu.target.rank.is_some() && !wu.target.is_soft() {
            return None;
        }
        let expected = if wu.target.rank.is_some() {
            neg(soft_target_priority(wu.priority))
        } else {
            neg(wu.priority)
        };
        if expected != key {
            return None;
        }
        Some(self.slab_remove(slot))
    }

    /// Checks a slot against a (worker, type) index entry.
    fn try_remove_targeted(
        &mut self,
        slot: usize,
        t: WorkType,
        target: Rank,
        key: i64,
    ) -> Option<Box<WorkUnit>> {
        let wu = self.slots.get(slot)?.as_ref()?;
        if wu.work_type != t
            || wu.target.rank != Some(target)
            || wu.target.accuracy != Accuracy::Rank
            || neg(wu.priority) != key
        {
            return None;
        }
        Some(self.slab_remove(slot))
    }

    /// Checks a slot against a (host, type) index entry.
    fn try_remove_node_targeted(
        &mut self,
        slot: usize,
        t: WorkType,
        host: usize,
        key: i64,
        layout: &Layout,
    ) -> Option<Box<WorkUnit>> {
        let wu = self.slots.get(slot)?.as_ref()?;
        let rank = wu.target.rank?;
        if wu.work_type != t
            || wu.target.accuracy != Accuracy::Node
            || neg(wu.priority) != key
            || layout.map_to_server(rank) != layout.rank
            || layout.worker_host(rank) != host
        {
            return None;
        }
        Some(self.slab_remove(slot))
    }

    fn pop_heap(
        heap: &mut IdxHeap<usize>,
        mut check: impl FnMut(usize, i64) -> Option<Box<WorkUnit>>,
    ) -> Option<Box<WorkUnit>> {
        while let Some((key, slot)) = heap.pop_root() {
            if let Some(wu) = check(slot, key) {
                return Some(wu);
            }
            // Stale entry; keep draining.
        }
        None
    }

    /// Finds the best serial task for `(worker, t)`: its own targeted
    /// work first, then work targeted at its host, then untargeted.
    pub fn pop(
        &mut self,
        worker: Rank,
        t: WorkType,
        layout: &Layout,
    ) -> Option<Box<WorkUnit>> {
        if t < 0 || t as usize >= self.types {
            return None;
        }

        let ix = self.targeted_ix(layout, worker, t);
        let mut heap = std::mem::take(&mut self.targeted[ix]);
        let found =
            Self::pop_heap(&mut heap, |s, k| self.try_remove_targeted(s, t, worker, k));
        self.targeted[ix] = heap;
        if let Some(wu) = found {
            log::trace!("workq pop targeted: {{{}}}", wu.id);
            return Some(wu);
        }

        let host = layout.worker_host(worker);
        let ix = self.node_ix(host, t);
        let mut heap = std::mem::take(&mut self.node_targeted[ix]);
        let found = Self::pop_heap(&mut heap, |s, k| {
            self.try_remove_node_targeted(s, t, host, k, layout)
        });
        self.node_targeted[ix] = heap;
        if let Some(wu) = found {
            log::trace!("workq pop node-targeted: {{{}}}", wu.id);
            return Some(wu);
        }

        let mut heap = std::mem::take(&mut self.untargeted[t as usize]);
        let found =
            Self::pop_heap(&mut heap, |s, k| self.try_remove_untargeted(s, t, k));
        self.untargeted[t as usize] = heap;
        if let Some(wu) = &found {
            log::trace!("workq pop untargeted: {{{}}}", wu.id);
        }
        found
    }

    /// Walks the parallel tree for `t` in priority order, asking
    /// `workers_for(parallelism)` for a gang at each node; dispatches the
    /// first task a gang forms for.
    pub fn pop_parallel(
        &mut self,
        t: WorkType,
        mut workers_for: impl FnMut(i32) -> Option<Vec<Rank>>,
    ) -> Option<(Box<WorkUnit>, Vec<Rank>)> {
        if self.parallel_count == 0 {
            return None;
        }
        let tree = &self.parallel[t as usize];
        let mut hit = None;
        for (key, wu) in tree.iter() {
            if let Some(ranks) = workers_for(wu.parallelism) {
                hit = Some((*key, ranks));
                break;
            }
        }
        let (key, ranks) = hit?;
        let wu = self.parallel[t as usize].remove(&key).unwrap();
        self.parallel_count -= 1;
        Some((wu, ranks))
    }

    /// Selects work to hand to a stealer reporting `stealer_counts` idle
    /// requests per type.
    ///
    /// For each type where the stealer is significantly behind (empty, or
    /// imbalance above [`STEAL_IMBALANCE`]), sends roughly half the
    /// surplus, sampling untargeted entries randomly in proportion to the
    /// serial/parallel split. Whenever the threshold is met at least one
    /// task is sent, even if probabilistic rounding would have sent none.
    pub fn steal_batch(
        &mut self,
        stealer_counts: &[i64],
        rng: &mut SmallRng,
    ) -> Vec<Box<WorkUnit>> {
        let mut batch: Vec<Box<WorkUnit>> = Vec::new();

        for t in 0..self.types {
            let stealer_count = stealer_counts.get(t).copied().unwrap_or(0);
            let single_count = self.untargeted[t].len() as i64;
            let par_count = self.parallel[t].len() as i64;
            let tot = single_count + par_count;
            if tot == 0 {
                continue;
            }

            let send = if stealer_count == 0 {
                true
            } else {
                let imbalance =
                    (tot - stealer_count) as f64 / stealer_count as f64;
                imbalance > STEAL_IMBALANCE
            };
            if !send {
                continue;
            }

            let to_send = ((tot - stealer_count) / 2).max(1);
            let single_pc = single_count as f64 / tot as f64;
            let par_to_send =
                ((par_count as f64 / tot as f64) * to_send as f64) as i64;

            let before = batch.len();
            self.steal_untargeted(t as WorkType, single_pc, to_send, rng, &mut batch);
            let singles = (batch.len() - before) as u64;
            self.steal_parallel(t as WorkType, par_to_send, rng, &mut batch);
            let pars = (batch.len() - before) as u64 - singles;

            if batch.len() == before {
                // Rounding sent nothing despite a real surplus; force one
                // task across so small imbalances still drain.
                if let Some(wu) = self.force_one(t as WorkType) {
                    if wu.parallelism > 1 {
                        self.count(t as WorkType, |c| c.parallel_stolen += 1);
                    } else {
                        self.count(t as WorkType, |c| c.single_stolen += 1);
                    }
                    batch.push(wu);
                }
            } else {
                self.count(t as WorkType, |c| {
                    c.single_stolen += singles;
                    c.parallel_stolen += pars;
                });
            }
        }
        batch
    }

    fn steal_untargeted(
        &mut self,
        t: WorkType,
        p: f64,
        cap: i64,
        rng: &mut SmallRng,
        batch: &mut Vec<Box<WorkUnit>>,
    ) {
        let mut taken = 0;
        // Iterate backwards: removal sifts entries down, so taking from
        // the bottom first leaves earlier slots intact.
        let mut heap = std::mem::take(&mut self.untargeted[t as usize]);
        for slot_ix in (0..heap.len()).rev() {
            if taken >= cap {
                break;
            }
            if rng.gen::<f64>() >= p {
                continue;
            }
            let (key, slot) = heap.remove(slot_ix);
            if let Some(wu) = self.try_remove_untargeted(slot, t, key) {
                batch.push(wu);
                taken += 1;
            }
        }
        self.untargeted[t as usize] = heap;
    }

    fn steal_parallel(
        &mut self,
        t: WorkType,
        n: i64,
        rng: &mut SmallRng,
        batch: &mut Vec<Box<WorkUnit>>,
    ) {
        for _ in 0..n {
            let tree = &self.parallel[t as usize];
            if tree.is_empty() {
                break;
            }
            let pick = rng.gen_range(0..tree.len());
            let key = *tree.keys().nth(pick).unwrap();
            let wu = self.parallel[t as usize].remove(&key).unwrap();
            self.parallel_count -= 1;
            batch.push(wu);
        }
    }

    fn force_one(&mut self, t: WorkType) -> Option<Box<WorkUnit>> {
        let mut heap = std::mem::take(&mut self.untargeted[t as usize]);
        let found =
            Self::pop_heap(&mut heap, |s, k| self.try_remove_untargeted(s, t, k));
        self.untargeted[t as usize] = heap;
        if found.is_some() {
            return found;
        }
        let key = *self.parallel[t as usize].keys().next()?;
        let wu = self.parallel[t as usize].remove(&key).unwrap();
        self.parallel_count -= 1;
        Some(wu)
    }

    /// Reports work still queued at shutdown. Tasks left here were never
    /// requested; that usually means a targeting or type-configuration
    /// bug in the application.
    pub fn finalize(&mut self) -> (usize, usize) {
        let serial_left = self.slots.iter().filter(|s| s.is_some()).count();
        if serial_left > 0 {
            log::warn!("server holds {serial_left} serial tasks never requested");
            for wu in self.slots.iter().flatten() {
                match wu.target.rank {
                    None => log::warn!("  untargeted: type {}", wu.work_type),
                    Some(r) => log::warn!(
                        "  targeted: type {} target rank {r}",
                        wu.work_type,
                    ),
                }
            }
        }
        let parallel_left = self.parallel_count as usize;
        if parallel_left > 0 {
            log::warn!(
                "server holds {parallel_left} parallel tasks never requested",
            );
        }
        (serial_left, parallel_left)
    }

    /// Emits the per-type counter summary.
    pub fn print_counters(&self) {
        let Some(counters) = &self.counters else { return };
        for (t, c) in counters.iter().enumerate() {
            log::info!(
                "worktype_{t}_targeted_total={}",
                c.targeted_enqueued + c.targeted_bypass,
            );
            log::info!("worktype_{t}_targeted_enqueued={}", c.targeted_enqueued);
            log::info!("worktype_{t}_targeted_bypass={}", c.targeted_bypass);
            log::info!(
                "worktype_{t}_single_net={}",
                c.single_enqueued + c.single_bypass - c.single_stolen,
            );
            log::info!("worktype_{t}_single_enqueued={}", c.single_enqueued);
            log::info!("worktype_{t}_single_bypass={}", c.single_bypass);
            log::info!("worktype_{t}_single_stolen={}", c.single_stolen);
            log::info!(
                "worktype_{t}_parallel_net={}",
                c.parallel_enqueued + c.parallel_bypass - c.parallel_stolen,
            );
            log::info!("worktype_{t}_parallel_enqueued={}", c.parallel_enqueued);
            log::info!("worktype_{t}_parallel_bypass={}", c.parallel_bypass);
            log::info!("worktype_{t}_parallel_stolen={}", c.parallel_stolen);
        }
    }
}
