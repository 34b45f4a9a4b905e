// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source-initiated work stealing.
//!
//! A server with idle workers and nothing queued picks a random peer,
//! syncs, and sends its per-type waiter counts. The victim answers with
//! a count, then the task descriptors in one message, then each payload.
//! Stolen tasks re-enter the local work queue as if freshly put, and the
//! request queue is rechecked.
//!
//! Rate limiting: at most one attempt per `steal_rate_limit`, stretched
//! to `steal_backoff` after an attempt that came back empty, so an idle
//! cluster isn't all steal traffic.

use std::time::Instant;

use abi::{PutHeader, StealCountResponse, StealHeader, SyncHeader, Tag};
use comm::Transport;
use rand::Rng;

use crate::server::{Server, ServerError};
use crate::workqueue::{Target, WorkUnit};

pub struct StealState {
    last_attempt: Option<Instant>,
    last_was_empty: bool,
}

impl StealState {
    pub fn new() -> Self {
        Self {
            last_attempt: None,
            last_was_empty: false,
        }
    }
}

impl Default for StealState {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Server<'_, T> {
    pub(crate) fn steal_allowed(&self) -> bool {
        if self.layout.servers == 1 {
            // No one to steal from.
            return false;
        }
        let Some(last) = self.steal.last_attempt else {
            return true;
        };
        let gap = if self.steal.last_was_empty {
            self.settings.steal_backoff
        } else {
            self.settings.steal_rate_limit
        };
        Instant::now() - last >= gap
    }

    /// Main-loop steal check: only bothers when we have idle workers.
    pub(crate) fn check_steal(&mut self) -> Result<(), ServerError> {
        if self.shutting_down
            || self.requestq.size() == 0
            || !self.steal_allowed()
        {
            return Ok(());
        }
        let stole = self.try_steal()?;
        // The handshake may have deferred work.
        self.serve_pending_syncs()?;
        if stole {
            self.recheck_queues()?;
        }
        Ok(())
    }

    /// One steal attempt against a random peer. Returns whether any
    /// tasks arrived.
    pub(crate) fn try_steal(&mut self) -> Result<bool, ServerError> {
        self.steal.last_attempt = Some(Instant::now());
        self.steal.last_was_empty = true;

        let target = self.random_peer_server();
        log::trace!("[{}] steal attempt on {target}", self.layout.rank);

        if self.sync_with(target, SyncHeader::Steal, &[])?.is_shutdown() {
            return Ok(false);
        }

        // Only solicit types we have requests for; anything else could
        // be stolen right back by a peer in the same position.
        let counts = self.requestq.type_counts();
        let mut blob = Vec::with_capacity(counts.len() * 8);
        for c in &counts {
            abi::pack_id(&mut blob, *c);
        }
        let hdr = StealHeader {
            max_memory: self.max_memory,
            type_count: counts.len() as u32,
        };
        self.comm
            .send(target, Tag::Steal, &abi::encode_with_blob(&hdr, &blob))?;

        let bytes = self.comm.recv(target, Tag::ResponseStealCount)?;
        let (resp, _): (StealCountResponse, _) = abi::decode(&bytes)?;
        log::debug!("[{}] stole {} from {target}", self.layout.rank, resp.count);
        if resp.count == 0 {
            return Ok(false);
        }

        let descriptors = self.comm.recv(target, Tag::ResponseSteal)?;
        let mut rest: &[u8] = &descriptors;
        for _ in 0..resp.count {
            let (h, r): (PutHeader, _) = abi::decode(rest)?;
            rest = r;
            let payload = self.comm.recv(target, Tag::ResponseSteal)?;
            if payload.len() != h.length as usize {
                return Err(ServerError::Protocol("stolen payload length"));
            }
            let id = self.workq.unique();
            let wu = Box::new(WorkUnit {
                id,
                work_type: h.work_type,
                priority: h.priority,
                putter: h.putter,
                answer: h.answer,
                target: Target::from_wire(h.target, h.strictness, h.accuracy),
                parallelism: h.parallelism,
                payload,
            });
            self.workq.add(wu, &self.layout)?;
        }

        self.steal.last_was_empty = false;
        Ok(true)
    }

    /// Victim side: select and ship work for the stealer's reported
    /// demand.
    pub(crate) fn handle_steal(
        &mut self,
        caller: abi::Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (hdr, blob): (StealHeader, _) = abi::decode(bytes)?;
        let mut counts = Vec::with_capacity(hdr.type_count as usize);
        let mut rest = blob;
        for _ in 0..hdr.type_count {
            let (c, r) = abi::unpack_id(rest)
                .ok_or(ServerError::Protocol("short steal counts"))?;
            counts.push(c);
            rest = r;
        }

        let batch = self.workq.steal_batch(&counts, &mut self.rng);
        let resp = StealCountResponse { count: batch.len() as u32 };
        self.comm
            .send(caller, Tag::ResponseStealCount, &abi::encode(&resp))?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut descriptors = Vec::new();
        for wu in &batch {
            let h = PutHeader {
                work_type: wu.work_type,
                putter: wu.putter,
                priority: wu.priority,
                answer: wu.answer,
                target: wu.target.wire_rank(),
                strictness: wu.target.strictness,
                accuracy: wu.target.accuracy,
                parallelism: wu.parallelism,
                length: wu.payload.len() as u32,
                has_inline: false,
            };
            descriptors.extend_from_slice(&abi::encode(&h));
        }
        self.comm.send(caller, Tag::ResponseSteal, &descriptors)?;
        for wu in &batch {
            self.comm.send(caller, Tag::ResponseSteal, &wu.payload)?;
        }
        log::debug!(
            "[{}] gave {} tasks to {caller}",
            self.layout.rank,
            batch.len(),
        );
        Ok(())
    }

    fn random_peer_server(&mut self) -> abi::Rank {
        loop {
            let pick = self
                .rng
                .gen_range(self.layout.master_server_rank..self.layout.size);
            if pick != self.layout.rank {
                return pick;
            }
        }
    }
}
