// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The server-to-server sync handshake.
//!
//! Two servers that send each other an RPC at the same moment would both
//! block. Every cross-server operation therefore starts with a sync
//! handshake: the initiator sends a `SyncRequest` carrying the operation
//! kind (with small operations piggy-backed in the header) and then
//! probes three things in a loop until one resolves:
//!
//! 1. a `SyncResponse` from the target — accepted means proceed with the
//!    follow-up operation; rejected means sleep briefly and resend;
//! 2. a `SyncRequest` from some *other* server — served immediately if
//!    that server outranks us (ties in the all-to-all pattern break
//!    toward higher ranks, which kills the cycle a symmetric deadlock
//!    needs), otherwise deferred into a fixed ring, or rejected when the
//!    ring is full;
//! 3. a shutdown broadcast — the sync aborts.
//!
//! A server never initiates a sync while one is in progress
//! (`in_progress`); operations that would need one are deferred and
//! drained from the main loop instead.

use abi::{DataId, Rank, Refcounts, SyncAck, SyncHeader, Tag};
use comm::Transport;
use zerocopy::{FromBytes, IntoBytes};

use crate::backoffs;
use crate::datastore::RefStore;
use crate::server::{Server, ServerError};
use crate::workqueue::WorkUnit;

/// Capacity of the pending-sync ring. Past this, lower-ranked initiators
/// are rejected and retry with backoff.
const PENDING_SYNC_CAPACITY: usize = 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncOutcome {
    Accepted,
    /// Shutdown arrived mid-handshake; the operation is abandoned.
    Shutdown,
}

impl SyncOutcome {
    pub fn is_shutdown(self) -> bool {
        self == SyncOutcome::Shutdown
    }
}

/// An inbound sync we chose to defer rather than serve or reject.
#[derive(Debug)]
pub struct PendingSync {
    pub rank: Rank,
    pub hdr: SyncHeader,
    pub blob: Vec<u8>,
}

/// Fixed-capacity FIFO ring of deferred inbound syncs.
pub struct PendingRing {
    buf: Vec<Option<PendingSync>>,
    head: usize,
    count: usize,
}

impl PendingRing {
    fn with_capacity(cap: usize) -> Self {
        let mut buf = Vec::with_capacity(cap);
        buf.resize_with(cap, || None);
        Self { buf, head: 0, count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Enqueues at the tail; hands the entry back if the ring is full.
    pub fn push(&mut self, p: PendingSync) -> Result<(), PendingSync> {
        if self.count == self.buf.len() {
            return Err(p);
        }
        let tail = (self.head + self.count) % self.buf.len();
        debug_assert!(self.buf[tail].is_none());
        self.buf[tail] = Some(p);
        self.count += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<PendingSync> {
        if self.count == 0 {
            return None;
        }
        let p = self.buf[self.head].take();
        debug_assert!(p.is_some());
        self.head = (self.head + 1) % self.buf.len();
        self.count -= 1;
        p
    }
}

/// A cross-server operation that arose while a sync was already in
/// progress; performed from the main loop once the handshake machinery
/// is free again.
#[derive(Debug)]
pub enum DeferredOp {
    Notify {
        server: Rank,
        id: DataId,
        sub: Option<Vec<u8>>,
    },
    Refcount {
        server: Rank,
        id: DataId,
        change: Refcounts,
    },
    Put {
        home: Rank,
        wu: Box<WorkUnit>,
    },
    Store {
        server: Rank,
        rs: RefStore,
    },
}

pub struct SyncState {
    pub in_progress: bool,
    pub pending: PendingRing,
    pub deferred: Vec<DeferredOp>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            in_progress: false,
            pending: PendingRing::with_capacity(PENDING_SYNC_CAPACITY),
            deferred: Vec::new(),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Server<'_, T> {
    /// Performs the initiator side of the handshake with `target`.
    ///
    /// On `Accepted`, the target is committed to serving exactly the
    /// operation named by `hdr` (piggy-backed kinds are already done and
    /// their response is in flight). Must not be called reentrantly; the
    /// deferral machinery exists so that it never is.
    pub(crate) fn sync_with(
        &mut self,
        target: Rank,
        hdr: SyncHeader,
        blob: &[u8],
    ) -> Result<SyncOutcome, ServerError> {
        assert!(!self.syncst.in_progress, "reentrant server sync");
        self.syncst.in_progress = true;
        let outcome = self.sync_loop(target, hdr, blob);
        self.syncst.in_progress = false;
        outcome
    }

    fn sync_loop(
        &mut self,
        target: Rank,
        hdr: SyncHeader,
        blob: &[u8],
    ) -> Result<SyncOutcome, ServerError> {
        log::trace!("[{}] sync with {target}: {hdr:?}", self.layout.rank);
        let request = abi::encode_with_blob(&hdr, blob);
        self.comm.send(target, Tag::SyncRequest, &request)?;

        loop {
            // 1. Response from the target?
            if self
                .comm
                .try_probe(Some(target), Some(Tag::SyncResponse))?
                .is_some()
            {
                let bytes = self.comm.recv(target, Tag::SyncResponse)?;
                let ack = SyncAck::read_from_bytes(&bytes)
                    .map_err(|_| ServerError::Protocol("bad sync ack"))?;
                if ack.accept != 0 {
                    log::trace!("[{}] sync accepted", self.layout.rank);
                    return Ok(SyncOutcome::Accepted);
                }
                log::trace!("[{}] sync rejected, retrying", self.layout.rank);
                backoffs::backoff_sync_rejected();
                self.comm.send(target, Tag::SyncRequest, &request)?;
                continue;
            }

            // 2. Another server wants to sync with us?
            if let Some(env) =
                self.comm.try_probe(None, Some(Tag::SyncRequest))?
            {
                let other = env.source;
                if other > self.layout.rank {
                    // Serve the higher rank in full before continuing;
                    // the asymmetry breaks circular waits.
                    let mut rejected = false;
                    self.serve_one_rpc_from(other, &mut rejected)?;
                    if other == target && rejected {
                        // Our request crossed with the target's own; it
                        // rejected us while we served it. Try again.
                        backoffs::backoff_sync_rejected();
                        self.comm.send(target, Tag::SyncRequest, &request)?;
                    }
                } else {
                    let bytes = self.comm.recv(other, Tag::SyncRequest)?;
                    let (other_hdr, other_blob): (SyncHeader, _) =
                        abi::decode(&bytes)?;
                    let p = PendingSync {
                        rank: other,
                        hdr: other_hdr,
                        blob: other_blob.to_vec(),
                    };
                    if let Err(_p) = self.syncst.pending.push(p) {
                        log::trace!(
                            "[{}] pending ring full, rejecting {other}",
                            self.layout.rank,
                        );
                        self.comm.send(
                            other,
                            Tag::SyncResponse,
                            SyncAck { accept: 0 }.as_bytes(),
                        )?;
                    }
                }
                continue;
            }

            // 3. Shutdown?
            if let Some(env) =
                self.comm.try_probe(None, Some(Tag::ShutdownServer))?
            {
                let _ = self.comm.recv(env.source, Tag::ShutdownServer)?;
                log::debug!(
                    "[{}] sync cancelled by shutdown",
                    self.layout.rank,
                );
                self.shutting_down = true;
                return Ok(SyncOutcome::Shutdown);
            }

            // Nothing moved; don't poll too aggressively.
            backoffs::backoff_sync();
        }
    }

    /// Serves messages from `source` until exactly one real RPC has been
    /// handled. A rejection of our own outstanding sync request may
    /// arrive first; it sets `rejected` and is not counted.
    pub(crate) fn serve_one_rpc_from(
        &mut self,
        source: Rank,
        rejected: &mut bool,
    ) -> Result<(), ServerError> {
        loop {
            let Some(env) = self.comm.try_probe(Some(source), None)? else {
                // No backoff: the peer is blocked on us.
                continue;
            };
            if env.tag == Tag::SyncResponse {
                let bytes = self.comm.recv(source, Tag::SyncResponse)?;
                let ack = SyncAck::read_from_bytes(&bytes)
                    .map_err(|_| ServerError::Protocol("bad sync ack"))?;
                // An accepted response is consumed by the sync loop, so
                // anything seen here is a rejection.
                debug_assert_eq!(ack.accept, 0);
                *rejected = true;
                continue;
            }
            return self.handle_envelope(env);
        }
    }

    /// Accepts an inbound sync: sends the ack, then performs the
    /// piggy-backed operation or serves the follow-up RPC.
    pub(crate) fn accept_sync(
        &mut self,
        rank: Rank,
        hdr: SyncHeader,
        blob: &[u8],
    ) -> Result<(), ServerError> {
        self.comm.send(
            rank,
            Tag::SyncResponse,
            SyncAck { accept: 1 }.as_bytes(),
        )?;

        match hdr {
            SyncHeader::Subscribe { id, sub_len, work_type } => {
                let sub = sub_slice(blob, sub_len)?;
                let subscribed = match self.data.subscribe(
                    id,
                    sub,
                    rank,
                    work_type,
                ) {
                    Ok(b) => b,
                    // Freed already: both refcounts hit zero, so the
                    // datum closed long ago.
                    Err(crate::datastore::DataError::NotFound) => false,
                    Err(e) => {
                        log::warn!("sync subscribe <{id}> failed: {e:?}");
                        false
                    }
                };
                let resp = abi::SubscribeResponse {
                    code: abi::Code::Success,
                    subscribed,
                };
                self.comm.send(rank, Tag::Response, &abi::encode(&resp))?;
            }
            SyncHeader::Notify { id, sub_len } => {
                let sub = sub_slice(blob, sub_len)?;
                self.notify_closed(id, sub, true)?;
                let resp =
                    abi::SimpleResponse { code: abi::Code::Success };
                self.comm.send(rank, Tag::Response, &abi::encode(&resp))?;
            }
            SyncHeader::Refcount { id, change } => {
                let (code, closes, refs, notifs) =
                    match self.data.refcount_incr(id, change) {
                        Ok(n) => (
                            abi::Code::Success,
                            n.closes.len() as u32,
                            n.refs.len() as u32,
                            Some(n),
                        ),
                        Err(e) => (e.code(), 0, 0, None),
                    };
                let resp = abi::RefcountResponse {
                    code,
                    close_notifies: closes,
                    ref_notifies: refs,
                };
                self.comm.send(rank, Tag::Response, &abi::encode(&resp))?;
                if let Some(n) = notifs {
                    self.process_notifications(n)?;
                }
            }
            SyncHeader::Put
            | SyncHeader::Store
            | SyncHeader::Steal
            | SyncHeader::Generic => {
                let mut rejected = false;
                self.serve_one_rpc_from(rank, &mut rejected)?;
            }
        }
        Ok(())
    }

    /// Drains deferred inbound syncs and deferred outbound operations.
    /// Called from the main loop after every served RPC; never from
    /// inside a handshake.
    pub(crate) fn serve_pending_syncs(&mut self) -> Result<(), ServerError> {
        while let Some(p) = self.syncst.pending.pop_front() {
            log::trace!(
                "[{}] serving deferred sync from {}",
                self.layout.rank,
                p.rank,
            );
            self.accept_sync(p.rank, p.hdr, &p.blob)?;
        }

        while !self.syncst.deferred.is_empty() && !self.syncst.in_progress {
            let op = self.syncst.deferred.remove(0);
            if self.shutting_down {
                continue;
            }
            match op {
                DeferredOp::Notify { server, id, sub } => {
                    self.remote_notify(server, id, sub.as_deref())?;
                }
                DeferredOp::Refcount { server, id, change } => {
                    self.remote_refcount(server, id, change)?;
                }
                DeferredOp::Put { home, wu } => {
                    self.remote_put(home, wu)?;
                }
                DeferredOp::Store { server, rs } => {
                    self.remote_ref_store(server, rs)?;
                }
            }
        }
        Ok(())
    }

    /// Cross-server subscribe, piggy-backed on the sync header. Returns
    /// `None` if shutdown interrupted.
    pub(crate) fn remote_subscribe(
        &mut self,
        server: Rank,
        id: DataId,
        sub: Option<&[u8]>,
    ) -> Result<Option<bool>, ServerError> {
        let hdr = SyncHeader::Subscribe {
            id,
            sub_len: sub.map(|s| s.len()).unwrap_or(0) as u32,
            work_type: 0,
        };
        if self.sync_with(server, hdr, sub.unwrap_or(&[]))?.is_shutdown() {
            return Ok(None);
        }
        let bytes = self.comm.recv(server, Tag::Response)?;
        let (resp, _): (abi::SubscribeResponse, _) = abi::decode(&bytes)?;
        Ok(Some(resp.subscribed))
    }

    /// Cross-server close notification, piggy-backed.
    pub(crate) fn remote_notify(
        &mut self,
        server: Rank,
        id: DataId,
        sub: Option<&[u8]>,
    ) -> Result<(), ServerError> {
        if self.syncst.in_progress {
            self.syncst.deferred.push(DeferredOp::Notify {
                server,
                id,
                sub: sub.map(|s| s.to_vec()),
            });
            return Ok(());
        }
        let hdr = SyncHeader::Notify {
            id,
            sub_len: sub.map(|s| s.len()).unwrap_or(0) as u32,
        };
        if self.sync_with(server, hdr, sub.unwrap_or(&[]))?.is_shutdown() {
            return Ok(());
        }
        let bytes = self.comm.recv(server, Tag::Response)?;
        let (_resp, _): (abi::SimpleResponse, _) = abi::decode(&bytes)?;
        Ok(())
    }

    /// Cross-server refcount change, piggy-backed.
    pub(crate) fn remote_refcount(
        &mut self,
        server: Rank,
        id: DataId,
        change: Refcounts,
    ) -> Result<(), ServerError> {
        if self.syncst.in_progress {
            self.syncst.deferred.push(DeferredOp::Refcount {
                server,
                id,
                change,
            });
            return Ok(());
        }
        let hdr = SyncHeader::Refcount { id, change };
        if self.sync_with(server, hdr, &[])?.is_shutdown() {
            return Ok(());
        }
        let bytes = self.comm.recv(server, Tag::Response)?;
        let (resp, _): (abi::RefcountResponse, _) = abi::decode(&bytes)?;
        if resp.code != abi::Code::Success {
            log::warn!("remote refcount <{id}> failed: {:?}", resp.code);
        }
        Ok(())
    }

    /// Forwards a task to another server (sync, then an ordinary inline
    /// put).
    pub(crate) fn remote_put(
        &mut self,
        home: Rank,
        wu: Box<WorkUnit>,
    ) -> Result<(), ServerError> {
        if self.syncst.in_progress {
            self.syncst.deferred.push(DeferredOp::Put { home, wu });
            return Ok(());
        }
        if self.sync_with(home, SyncHeader::Put, &[])?.is_shutdown() {
            return Ok(());
        }
        let hdr = abi::PutHeader {
            work_type: wu.work_type,
            putter: self.layout.rank,
            priority: wu.priority,
            answer: wu.answer,
            target: wu.target.wire_rank(),
            strictness: wu.target.strictness,
            accuracy: wu.target.accuracy,
            parallelism: wu.parallelism,
            length: wu.payload.len() as u32,
            has_inline: true,
        };
        self.comm.send(
            home,
            Tag::Put,
            &abi::encode_with_blob(&hdr, &wu.payload),
        )?;
        let bytes = self.comm.recv(home, Tag::ResponsePut)?;
        let resp = abi::PutResponse::read_from_bytes(&bytes)
            .map_err(|_| ServerError::Protocol("bad put response"))?;
        if resp.code != abi::Code::Success.as_wire() {
            log::warn!("forwarded put rejected: code {}", resp.code);
        }
        Ok(())
    }

    /// Stores a resolved reference value into a datum on another server
    /// (sync, then an ordinary store).
    pub(crate) fn remote_ref_store(
        &mut self,
        server: Rank,
        rs: RefStore,
    ) -> Result<(), ServerError> {
        if self.syncst.in_progress {
            self.syncst.deferred.push(DeferredOp::Store { server, rs });
            return Ok(());
        }
        if self.sync_with(server, SyncHeader::Store, &[])?.is_shutdown() {
            return Ok(());
        }
        let sub = rs.sub.as_deref().unwrap_or(&[]);
        let hdr = abi::StoreHeader {
            id: rs.id,
            sub_len: sub.len() as u32,
            dtype: rs.dtype,
            decr: Refcounts::WRITE_ONE,
            store_refs: rs.store_refs,
            length: rs.value.len() as u32,
        };
        let mut blob = sub.to_vec();
        blob.extend_from_slice(&rs.value);
        self.comm
            .send(server, Tag::Store, &abi::encode_with_blob(&hdr, &blob))?;
        let bytes = self.comm.recv(server, Tag::Response)?;
        let (resp, _): (abi::StoreResponse, _) = abi::decode(&bytes)?;
        if resp.code != abi::Code::Success
            && resp.code != abi::Code::Rejected
        {
            log::warn!(
                "reference store into <{}> failed: {:?}",
                rs.id,
                resp.code,
            );
        }
        Ok(())
    }

    /// Applies a close that reached this server (locally or from a
    /// peer): updates the engine and releases whatever became ready.
    pub(crate) fn notify_closed(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        remote: bool,
    ) -> Result<(), ServerError> {
        let mut ready = Vec::new();
        match sub {
            None => self.engine.close(id, remote, &mut ready),
            Some(s) => self.engine.sub_close(id, s, remote, &mut ready),
        }
        for wu in ready {
            self.put_local(wu)?;
        }
        Ok(())
    }
}

fn sub_slice(blob: &[u8], sub_len: u32) -> Result<Option<&[u8]>, ServerError> {
    if sub_len == 0 {
        return Ok(None);
    }
    blob.get(..sub_len as usize)
        .map(Some)
        .ok_or(ServerError::Protocol("short subscript"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(rank: Rank) -> PendingSync {
        PendingSync {
            rank,
            hdr: SyncHeader::Generic,
            blob: Vec::new(),
        }
    }

    #[test]
    fn ring_is_fifo() {
        let mut r = PendingRing::with_capacity(4);
        assert!(r.is_empty());
        for i in 0..3 {
            r.push(pending(i)).unwrap();
        }
        assert_eq!(r.len(), 3);
        for i in 0..3 {
            assert_eq!(r.pop_front().unwrap().rank, i);
        }
        assert!(r.pop_front().is_none());
    }

    #[test]
    fn ring_rejects_when_full() {
        let mut r = PendingRing::with_capacity(2);
        r.push(pending(0)).unwrap();
        r.push(pending(1)).unwrap();
        let back = r.push(pending(2)).unwrap_err();
        assert_eq!(back.rank, 2);
        // Draining one makes room again.
        assert_eq!(r.pop_front().unwrap().rank, 0);
        r.push(pending(2)).unwrap();
    }

    #[test]
    fn ring_survives_many_wraps() {
        let mut r = PendingRing::with_capacity(3);
        for round in 0..100 {
            r.push(pending(round)).unwrap();
            r.push(pending(round + 1000)).unwrap();
            assert_eq!(r.pop_front().unwrap().rank, round);
            assert_eq!(r.pop_front().unwrap().rank, round + 1000);
        }
        assert!(r.is_empty());
    }
}
