// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The data-dependency engine.
//!
//! A *transform* is the in-memory record of a data-dependent task: the
//! task to release, the list of input ids and (id, subscript) pairs it
//! waits on, and a bitfield of which inputs have closed. The `blocker`
//! index points at the first unsatisfied input; every input before it is
//! closed. When the bitfield completes, the transform surrenders its work
//! unit to the caller and is freed — `ready` is a transient state, never
//! stored.
//!
//! Transforms wait in a slab; two multimaps (`id → transforms`,
//! `(id, sub) → transforms`) find the transforms a close can advance. A
//! transform may appear several times under one key (the same input
//! listed twice); duplicates land consecutively at insertion and are
//! collapsed during the close walk. When a transform completes, the final
//! close's list entry was its last live entry, so the slab slot can be
//! reused safely.
//!
//! The engine also bookkeeps *subscriptions*: which ids / id+subs this
//! server has already subscribed to (to suppress duplicate subscribe
//! round-trips), and LRU caches of keys *remote* servers reported closed.
//! Local closes are authoritative in the data store, so only remote
//! closes are cached. The engine never talks to the transport itself: the
//! server consults [`Engine::check_input`] before subscribing and reports
//! the outcome back, keeping the RPC machinery out of this module.

use std::collections::HashMap;

use abi::DataId;
use lrucache::LruSet;

use crate::workqueue::WorkUnit;

pub type SubKey = (DataId, Vec<u8>);

/// How to treat one transform input, per the engine's bookkeeping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InputState {
    /// This engine already subscribed; no round-trip needed, input
    /// pending.
    AlreadySubscribed,
    /// A remote server told us this key closed recently; input
    /// satisfied.
    KnownClosed,
    /// Not known either way: the caller must subscribe and report back.
    MustSubscribe,
}

/// Counters over subscribe outcomes, enabled by `PERF_COUNTERS`.
#[derive(Copy, Clone, Debug, Default)]
pub struct SubscribeCounters {
    pub id_subscribed: u64,
    pub id_subscribe_local: u64,
    pub id_subscribe_remote: u64,
    pub id_subscribe_cached: u64,
    pub id_ready: u64,
    pub id_sub_subscribed: u64,
    pub id_sub_subscribe_local: u64,
    pub id_sub_subscribe_remote: u64,
    pub id_sub_subscribe_cached: u64,
    pub id_sub_ready: u64,
}

#[derive(Debug)]
struct Transform {
    /// Debugging name from the submitting rule.
    name: Option<String>,
    work: Option<Box<WorkUnit>>,
    input_ids: Vec<DataId>,
    input_id_subs: Vec<SubKey>,
    /// One bit per input: ids first, then id/sub pairs.
    closed: Vec<u64>,
    /// Index of the first unsatisfied input; everything before it is
    /// closed.
    blocker: usize,
}

impl Transform {
    fn total_inputs(&self) -> usize {
        self.input_ids.len() + self.input_id_subs.len()
    }

    fn input_closed(&self, i: usize) -> bool {
        self.closed[i / 64] >> (i % 64) & 1 != 0
    }

    fn mark_input_closed(&mut self, i: usize) {
        self.closed[i / 64] |= 1 << (i % 64);
    }

    /// Advances `blocker` over the closed prefix; true when every input
    /// is satisfied.
    fn progress(&mut self) -> bool {
        while self.blocker < self.total_inputs()
            && self.input_closed(self.blocker)
        {
            self.blocker += 1;
        }
        self.blocker == self.total_inputs()
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        if let Some(name) = &self.name {
            out.push_str(name);
            out.push(' ');
        }
        out.push('(');
        let mut first = true;
        for (i, id) in self.input_ids.iter().enumerate() {
            if !std::mem::take(&mut first) {
                out.push(' ');
            }
            if self.input_closed(i) {
                out.push_str(&format!("<{id}>"));
            } else {
                out.push_str(&format!("/<{id}>/"));
            }
        }
        for (i, (id, sub)) in self.input_id_subs.iter().enumerate() {
            if !std::mem::take(&mut first) {
                out.push(' ');
            }
            let blocked = !self.input_closed(i + self.input_ids.len());
            let sub = String::from_utf8_lossy(sub);
            if blocked {
                out.push_str(&format!("/<{id}>[{sub}]/"));
            } else {
                out.push_str(&format!("<{id}>[{sub}]"));
            }
        }
        out.push(')');
        out
    }
}

pub struct Engine {
    transforms: Vec<Option<Transform>>,
    free: Vec<usize>,
    waiting: usize,
    blockers_by_id: HashMap<DataId, Vec<usize>>,
    blockers_by_id_sub: HashMap<SubKey, Vec<usize>>,
    subscribed_id: std::collections::HashSet<DataId>,
    subscribed_id_sub: std::collections::HashSet<SubKey>,
    closed_cache_id: LruSet<DataId>,
    closed_cache_id_sub: LruSet<SubKey>,
    pub counters: Option<SubscribeCounters>,
}

impl Engine {
    pub fn new(closed_cache_size: usize, counters_enabled: bool) -> Self {
        Self {
            transforms: Vec::new(),
            free: Vec::new(),
            waiting: 0,
            blockers_by_id: HashMap::new(),
            blockers_by_id_sub: HashMap::new(),
            subscribed_id: std::collections::HashSet::new(),
            subscribed_id_sub: std::collections::HashSet::new(),
            closed_cache_id: LruSet::new(closed_cache_size),
            closed_cache_id_sub: LruSet::new(closed_cache_size),
            counters: counters_enabled.then(SubscribeCounters::default),
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting
    }

    /// Consults the engine's bookkeeping for one input before any
    /// subscribe round-trip. `remote` gates the closed cache: local data
    /// is authoritative in the store and is never cached here.
    pub fn check_input(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        remote: bool,
    ) -> InputState {
        match sub {
            None => {
                if self.subscribed_id.contains(&id) {
                    self.count(|c| c.id_subscribed += 1);
                    return InputState::AlreadySubscribed;
                }
                if remote && self.closed_cache_id.contains(&id) {
                    self.count(|c| c.id_subscribe_cached += 1);
                    return InputState::KnownClosed;
                }
            }
            Some(sub) => {
                // Key construction allocates; only on the miss paths
                // that need it.
                let key = (id, sub.to_vec());
                if self.subscribed_id_sub.contains(&key) {
                    self.count(|c| c.id_sub_subscribed += 1);
                    return InputState::AlreadySubscribed;
                }
                if remote && self.closed_cache_id_sub.contains(&key) {
                    self.count(|c| c.id_sub_subscribe_cached += 1);
                    return InputState::KnownClosed;
                }
            }
        }
        InputState::MustSubscribe
    }

    /// Records the outcome of an actual subscribe: `subscribed = false`
    /// means the data was already closed.
    pub fn record_subscribe(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        subscribed: bool,
        remote: bool,
    ) {
        match sub {
            None => {
                if subscribed {
                    self.subscribed_id.insert(id);
                    self.count(|c| {
                        if remote {
                            c.id_subscribe_remote += 1;
                        } else {
                            c.id_subscribe_local += 1;
                        }
                    });
                } else {
                    self.count(|c| c.id_ready += 1);
                }
            }
            Some(sub) => {
                if subscribed {
                    self.subscribed_id_sub.insert((id, sub.to_vec()));
                    self.count(|c| {
                        if remote {
                            c.id_sub_subscribe_remote += 1;
                        } else {
                            c.id_sub_subscribe_local += 1;
                        }
                    });
                } else {
                    self.count(|c| c.id_sub_ready += 1);
                }
            }
        }
    }

    /// Registers a data-dependent task. `pending[i]` says whether input
    /// `i` (ids first, then id/subs) is still awaited — i.e. a
    /// subscription exists for it. Returns the work unit right back if
    /// every input is already satisfied.
    pub fn add_rule(
        &mut self,
        name: Option<String>,
        input_ids: Vec<DataId>,
        input_id_subs: Vec<SubKey>,
        pending: &[bool],
        work: Box<WorkUnit>,
    ) -> Option<Box<WorkUnit>> {
        let total = input_ids.len() + input_id_subs.len();
        assert_eq!(pending.len(), total);

        let mut t = Transform {
            name,
            work: Some(work),
            input_ids,
            input_id_subs,
            closed: vec![0; total.div_ceil(64)],
            blocker: 0,
        };
        for (i, p) in pending.iter().enumerate() {
            if !*p {
                t.mark_input_closed(i);
            }
        }

        if t.progress() {
            log::debug!("engine: ready {{{}}}", t.work.as_ref().unwrap().id);
            return t.work;
        }

        log::debug!("engine: waiting {{{}}}", t.work.as_ref().unwrap().id);
        let ix = match self.free.pop() {
            Some(ix) => {
                self.transforms[ix] = Some(t);
                ix
            }
            None => {
                self.transforms.push(Some(t));
                self.transforms.len() - 1
            }
        };
        self.waiting += 1;

        // Index the transform under every input still pending. The same
        // key may be pushed more than once; duplicates are adjacent and
        // collapse during the close walk.
        let t = self.transforms[ix].as_ref().unwrap();
        let mut id_keys = Vec::new();
        let mut sub_keys = Vec::new();
        for (i, id) in t.input_ids.iter().enumerate() {
            if !t.input_closed(i) {
                id_keys.push(*id);
            }
        }
        for (i, key) in t.input_id_subs.iter().enumerate() {
            if !t.input_closed(i + t.input_ids.len()) {
                sub_keys.push(key.clone());
            }
        }
        for id in id_keys {
            self.blockers_by_id.entry(id).or_default().push(ix);
        }
        for key in sub_keys {
            self.blockers_by_id_sub.entry(key).or_default().push(ix);
        }
        None
    }

    /// A whole datum closed. Appends any released work to `ready`.
    pub fn close(
        &mut self,
        id: DataId,
        remote: bool,
        ready: &mut Vec<Box<WorkUnit>>,
    ) {
        log::debug!("engine: close <{id}>");
        self.subscribed_id.remove(&id);
        if remote {
            self.closed_cache_id.insert(id);
        }
        let Some(blocked) = self.blockers_by_id.remove(&id) else {
            return;
        };
        self.close_update(&blocked, id, None, ready);
    }

    /// One subscript of a datum closed.
    pub fn sub_close(
        &mut self,
        id: DataId,
        sub: &[u8],
        remote: bool,
        ready: &mut Vec<Box<WorkUnit>>,
    ) {
        log::debug!(
            "engine: close <{id}>[{}]",
            String::from_utf8_lossy(sub),
        );
        let key = (id, sub.to_vec());
        self.subscribed_id_sub.remove(&key);
        if remote {
            self.closed_cache_id_sub.insert(key.clone());
        }
        let Some(blocked) = self.blockers_by_id_sub.remove(&key) else {
            return;
        };
        self.close_update(&blocked, id, Some(sub), ready);
    }

    fn close_update(
        &mut self,
        blocked: &[usize],
        id: DataId,
        sub: Option<&[u8]>,
        ready: &mut Vec<Box<WorkUnit>>,
    ) {
        log::debug!("engine: {} blocked", blocked.len());
        let mut prev = usize::MAX;
        for &ix in blocked {
            // An input listed twice lands in the list twice, adjacently;
            // process the transform once.
            if ix == prev {
                continue;
            }
            prev = ix;

            let Some(t) = self.transforms[ix].as_mut() else {
                continue;
            };

            match sub {
                None => {
                    for i in t.blocker..t.input_ids.len() {
                        if t.input_ids[i] == id {
                            t.mark_input_closed(i);
                        }
                    }
                }
                Some(sub) => {
                    let first = t.blocker.saturating_sub(t.input_ids.len());
                    for i in first..t.input_id_subs.len() {
                        let (tid, tsub) = &t.input_id_subs[i];
                        if *tid == id && tsub == sub {
                            let bit = i + t.input_ids.len();
                            t.mark_input_closed(bit);
                        }
                    }
                }
            }

            if t.progress() {
                let work = t.work.take().unwrap();
                log::debug!("engine: ready {{{}}}", work.id);
                ready.push(work);
                self.transforms[ix] = None;
                self.free.push(ix);
                self.waiting -= 1;
            }
        }
    }

    /// Logs every transform still waiting; these are the deadlocked
    /// survivors at shutdown. Returns how many there were.
    pub fn finalize(&self) -> usize {
        if self.waiting > 0 {
            log::warn!("waiting transforms: {}", self.waiting);
            for t in self.transforms.iter().flatten() {
                log::warn!(
                    "  {{{}}} {}",
                    t.work.as_ref().map(|w| w.id).unwrap_or(-1),
                    t.describe(),
                );
            }
        }
        self.waiting
    }

    pub fn print_counters(&self) {
        let Some(c) = &self.counters else { return };
        log::info!(
            "engine_subscribed={}",
            c.id_subscribed + c.id_sub_subscribed,
        );
        log::info!(
            "engine_subscribe_local={}",
            c.id_subscribe_local + c.id_sub_subscribe_local,
        );
        log::info!(
            "engine_subscribe_remote={}",
            c.id_subscribe_remote + c.id_sub_subscribe_remote,
        );
        log::info!(
            "engine_subscribe_cached={}",
            c.id_subscribe_cached + c.id_sub_subscribe_cached,
        );
        log::info!("engine_ready={}", c.id_ready + c.id_sub_ready);
    }

    fn count(&mut self, f: impl FnOnce(&mut SubscribeCounters)) {
        if let Some(c) = &mut self.counters {
            f(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workqueue::Target;

    fn work(id: i64) -> Box<WorkUnit> {
        Box::new(WorkUnit {
            id,
            work_type: 0,
            priority: 0,
            putter: 0,
            answer: 0,
            target: Target::any(),
            parallelism: 1,
            payload: vec![],
        })
    }

    fn engine() -> Engine {
        Engine::new(16, false)
    }

    #[test]
    fn rule_with_no_inputs_is_ready_immediately() {
        let mut e = engine();
        let out = e.add_rule(None, vec![], vec![], &[], work(1));
        assert_eq!(out.unwrap().id, 1);
        assert_eq!(e.waiting_count(), 0);
    }

    #[test]
    fn rule_with_satisfied_inputs_is_ready_immediately() {
        let mut e = engine();
        let out = e.add_rule(None, vec![5, 6], vec![], &[false, false], work(1));
        assert!(out.is_some());
    }

    #[test]
    fn close_releases_when_all_inputs_done() {
        let mut e = engine();
        assert!(e
            .add_rule(None, vec![5, 6], vec![], &[true, true], work(9))
            .is_none());
        assert_eq!(e.waiting_count(), 1);

        let mut ready = Vec::new();
        e.close(5, false, &mut ready);
        assert!(ready.is_empty());

        e.close(6, false, &mut ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, 9);
        assert_eq!(e.waiting_count(), 0);
    }

    #[test]
    fn out_of_order_closes_release_once() {
        let mut e = engine();
        e.add_rule(None, vec![1, 2, 3], vec![], &[true, true, true], work(9));

        let mut ready = Vec::new();
        e.close(3, false, &mut ready);
        e.close(1, false, &mut ready);
        assert!(ready.is_empty());
        e.close(2, false, &mut ready);
        assert_eq!(ready.len(), 1);

        // Closing again releases nothing further.
        e.close(2, false, &mut ready);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn duplicate_inputs_collapse() {
        let mut e = engine();
        e.add_rule(None, vec![4, 4], vec![], &[true, true], work(9));
        let mut ready = Vec::new();
        e.close(4, false, &mut ready);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn subscript_inputs() {
        let mut e = engine();
        e.add_rule(
            None,
            vec![1],
            vec![(2, b"k".to_vec())],
            &[true, true],
            work(9),
        );

        let mut ready = Vec::new();
        // A different subscript of id 2 does nothing.
        e.sub_close(2, b"other", false, &mut ready);
        e.close(1, false, &mut ready);
        assert!(ready.is_empty());

        e.sub_close(2, b"k", false, &mut ready);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn one_close_releases_all_blocked_transforms() {
        let mut e = engine();
        e.add_rule(None, vec![7], vec![], &[true], work(1));
        e.add_rule(None, vec![7], vec![], &[true], work(2));
        let mut ready = Vec::new();
        e.close(7, false, &mut ready);
        let mut ids: Vec<i64> = ready.iter().map(|w| w.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn subscription_bookkeeping() {
        let mut e = engine();
        assert_eq!(e.check_input(5, None, true), InputState::MustSubscribe);
        e.record_subscribe(5, None, true, true);
        assert_eq!(e.check_input(5, None, true), InputState::AlreadySubscribed);

        // A remote close drops the subscription and feeds the cache.
        let mut ready = Vec::new();
        e.close(5, true, &mut ready);
        assert_eq!(e.check_input(5, None, true), InputState::KnownClosed);

        // The cache only answers for remote data.
        assert_eq!(e.check_input(5, None, false), InputState::MustSubscribe);
    }

    #[test]
    fn local_closes_are_not_cached() {
        let mut e = engine();
        e.record_subscribe(6, None, true, false);
        let mut ready = Vec::new();
        e.close(6, false, &mut ready);
        assert_eq!(e.check_input(6, None, true), InputState::MustSubscribe);
    }

    #[test]
    fn sub_key_bookkeeping_is_separate() {
        let mut e = engine();
        e.record_subscribe(5, Some(b"k"), true, true);
        assert_eq!(e.check_input(5, None, true), InputState::MustSubscribe);
        assert_eq!(
            e.check_input(5, Some(b"k"), true),
            InputState::AlreadySubscribed,
        );
    }

    #[test]
    fn finalize_reports_survivors() {
        let mut e = engine();
        e.add_rule(
            Some("stuck".into()),
            vec![5],
            vec![],
            &[true],
            work(1),
        );
        assert_eq!(e.finalize(), 1);
    }

    #[test]
    fn slab_slots_are_reused() {
        let mut e = engine();
        for round in 0..3 {
            e.add_rule(None, vec![round], vec![], &[true], work(round));
            let mut ready = Vec::new();
            e.close(round, false, &mut ready);
            assert_eq!(ready.len(), 1, "round {round}");
        }
        assert_eq!(e.transforms.len(), 1);
    }
}
