// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One handler per RPC tag.
//!
//! Handlers are atomic with respect to the serve loop: each receives its
//! message, works the components, and sends its replies before the next
//! envelope is looked at. Handlers never send to another server except
//! through the sync handshake, and never block on a receive the peer has
//! not already committed to (the one blocking receive is the put
//! payload, whose sender is waiting on our routing decision).
//!
//! Application-level failures are carried back to the caller as status
//! codes; a `ServerError` out of here means the protocol itself broke.

use abi::{
    Code, CreateHeader, EnumerateHeader, ExistsHeader, FailHeader,
    GetHeader, GetResponse, InsertAtomicHeader, LockHeader, MulticreateHeader,
    NotifyHeader, Placement, PutHeader, PutResponse, Rank, RetrieveHeader,
    RuleHeader, StoreHeader, SubscribeHeader, SyncHeader, Tag, TypeofHeader,
    UnlockHeader, RANK_NULL,
};
use comm::{Envelope, Transport};
use zerocopy::IntoBytes;

use crate::datastore::{DataError, Notifications};
use crate::engine::InputState;
use crate::server::{Server, ServerError};
use crate::workqueue::{Target, WorkUnit};

impl<T: Transport> Server<'_, T> {
    /// Receives and dispatches one probed message.
    pub(crate) fn handle_envelope(
        &mut self,
        env: Envelope,
    ) -> Result<(), ServerError> {
        let bytes = self.comm.recv(env.source, env.tag)?;
        self.update_last_action(env.tag);
        let caller = env.source;
        log::trace!("[{}] handle {:?} from {caller}", self.layout.rank, env.tag);

        match env.tag {
            Tag::SyncRequest => {
                let (hdr, blob): (SyncHeader, _) = abi::decode(&bytes)?;
                let blob = blob.to_vec();
                self.accept_sync(caller, hdr, &blob)
            }
            Tag::SyncResponse => {
                // A stale rejection from a peer we were syncing with
                // earlier; the handshake consumed the acceptance path.
                Ok(())
            }
            Tag::Put => self.handle_put(caller, &bytes),
            Tag::Get => self.handle_get(caller, &bytes),
            Tag::Iget => self.handle_iget(caller, &bytes),
            Tag::Create => self.handle_create(caller, &bytes),
            Tag::Multicreate => self.handle_multicreate(caller, &bytes),
            Tag::Exists => self.handle_exists(caller, &bytes),
            Tag::Store => self.handle_store(caller, &bytes),
            Tag::Retrieve => self.handle_retrieve(caller, &bytes),
            Tag::Enumerate => self.handle_enumerate(caller, &bytes),
            Tag::Subscribe => self.handle_subscribe(caller, &bytes),
            Tag::RefcountIncr => self.handle_refcount_incr(caller, &bytes),
            Tag::InsertAtomic => self.handle_insert_atomic(caller, &bytes),
            Tag::ContainerReference => {
                self.handle_container_reference(caller, &bytes)
            }
            Tag::ContainerSize => self.handle_container_size(caller, &bytes),
            Tag::ContainerTypeof => {
                self.handle_container_typeof(caller, &bytes)
            }
            Tag::Typeof => self.handle_typeof(caller, &bytes),
            Tag::Unique => self.handle_unique(caller),
            Tag::Lock => self.handle_lock(caller, &bytes),
            Tag::Unlock => self.handle_unlock(caller, &bytes),
            Tag::CheckIdle => self.handle_check_idle(caller),
            Tag::ShutdownWorker => self.handle_shutdown_worker(caller),
            Tag::ShutdownServer => {
                log::debug!("[{}] told to shut down", self.layout.rank);
                self.shutting_down = true;
                Ok(())
            }
            Tag::Fail => self.handle_fail(&bytes),
            Tag::Steal => self.handle_steal(caller, &bytes),
            Tag::Notify => self.handle_notify(caller, &bytes),
            Tag::Rule => self.handle_rule(caller, &bytes),
            Tag::Response
            | Tag::ResponseGet
            | Tag::ResponsePut
            | Tag::ResponseSteal
            | Tag::ResponseStealCount
            | Tag::Work => Err(ServerError::Protocol("response tag to server")),
        }
    }

    fn valid_put(&self, h: &PutHeader) -> bool {
        h.work_type >= 0
            && (h.work_type as usize) < self.types
            && h.parallelism >= 1
            && (h.parallelism == 1 || h.target == RANK_NULL)
            && h.length as usize <= abi::PAYLOAD_MAX
    }

    fn handle_put(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (PutHeader, _) = abi::decode(bytes)?;
        let target = Target::from_wire(h.target, h.strictness, h.accuracy);
        // Hard-targeted work must arrive at the target's home server;
        // misrouted puts get an error, not silent rerouting.
        let misrouted = match target.rank {
            Some(r) if !target.is_soft() => {
                self.layout.map_to_server(r) != self.layout.rank
            }
            _ => false,
        };
        if !self.valid_put(&h) || misrouted {
            self.comm.send(
                caller,
                Tag::ResponsePut,
                PutResponse::error(Code::Invalid).as_bytes(),
            )?;
            return Ok(());
        }

        if h.has_inline {
            let payload = blob
                .get(..h.length as usize)
                .ok_or(ServerError::Protocol("short inline payload"))?
                .to_vec();
            let wu = Box::new(WorkUnit {
                id: self.workq.unique(),
                work_type: h.work_type,
                priority: h.priority,
                putter: h.putter,
                answer: h.answer,
                target,
                parallelism: h.parallelism,
                payload,
            });
            self.put_local(wu)?;
            self.comm.send(
                caller,
                Tag::ResponsePut,
                PutResponse::done().as_bytes(),
            )?;
            return self.check_parallel(h.work_type).map(|_| ());
        }

        // Payload is still with the putter. If a matching worker is
        // already waiting, tell both sides to talk to each other and
        // never touch the payload at all.
        if h.parallelism == 1 {
            let waiter = match target.rank {
                // A soft target homed elsewhere can't be waiting here.
                Some(r) if self.layout.map_to_server(r) != self.layout.rank => {
                    None
                }
                Some(r) => match target.accuracy {
                    abi::Accuracy::Rank => self.requestq.matches_target(
                        r,
                        h.work_type,
                        &self.layout,
                    ),
                    abi::Accuracy::Node => {
                        let host = self.layout.worker_host(r);
                        self.requestq.matches_node(
                            host,
                            h.work_type,
                            &self.layout,
                        )
                    }
                },
                None => {
                    self.requestq.matches_type(h.work_type, &self.layout)
                }
            };
            if let Some(worker) = waiter {
                log::debug!(
                    "[{}] redirect {caller}->{worker}",
                    self.layout.rank,
                );
                let g = GetResponse {
                    code: Code::Success.as_wire(),
                    answer_rank: h.answer,
                    payload_source: caller,
                    work_type: h.work_type,
                    length: h.length,
                    parallelism: 1,
                };
                self.comm.send(worker, Tag::ResponseGet, g.as_bytes())?;
                self.comm.send(
                    caller,
                    Tag::ResponsePut,
                    PutResponse::to(worker).as_bytes(),
                )?;
                self.workq.count_bypass(
                    h.work_type,
                    1,
                    target.rank.is_some(),
                );
                return Ok(());
            }
        }

        // Pull the payload here and queue the task. The putter is
        // blocked on our response, so the follow-up receive cannot
        // deadlock.
        self.comm.send(
            caller,
            Tag::ResponsePut,
            PutResponse::to(self.layout.rank).as_bytes(),
        )?;
        let payload = self.comm.recv(caller, Tag::Work)?;
        if payload.len() != h.length as usize {
            return Err(ServerError::Protocol("put payload length"));
        }
        let wu = Box::new(WorkUnit {
            id: self.workq.unique(),
            work_type: h.work_type,
            priority: h.priority,
            putter: h.putter,
            answer: h.answer,
            target,
            parallelism: h.parallelism,
            payload,
        });
        self.put_local(wu)?;
        self.check_parallel(h.work_type).map(|_| ())
    }

    /// Finds work for `caller` and sends it; reports whether anything
    /// was dispatched.
    fn check_workqueue(
        &mut self,
        caller: Rank,
        work_type: abi::WorkType,
    ) -> Result<bool, ServerError> {
        match self.workq.pop(caller, work_type, &self.layout) {
            Some(wu) => {
                self.send_work(caller, &wu)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn handle_get(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (GetHeader, _) = abi::decode(bytes)?;
        let t = h.work_type;

        if self.shutting_down {
            self.comm.send(
                caller,
                Tag::ResponseGet,
                GetResponse::shutdown().as_bytes(),
            )?;
            return Ok(());
        }
        if t < 0 || t as usize >= self.types {
            let mut g = GetResponse::nothing(self.layout.rank);
            g.code = Code::Invalid.as_wire();
            self.comm.send(caller, Tag::ResponseGet, g.as_bytes())?;
            return Ok(());
        }

        if self.check_workqueue(caller, t)? {
            return Ok(());
        }

        // Nothing local. Try to steal before parking the worker.
        let mut found = false;
        let mut stole = false;
        if !self.syncst.in_progress && self.steal_allowed() {
            stole = self.try_steal()?;
            self.serve_pending_syncs()?;
            if stole {
                found = self.check_workqueue(caller, t)?;
            }
        }

        if !found {
            if self.shutting_down {
                // The steal attempt can observe the shutdown broadcast.
                self.comm.send(
                    caller,
                    Tag::ResponseGet,
                    GetResponse::shutdown().as_bytes(),
                )?;
                return Ok(());
            }
            self.requestq.add(caller, t, &self.layout);
        }
        if stole {
            self.recheck_queues()?;
        }
        self.check_parallel(t).map(|_| ())
    }

    fn handle_iget(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (GetHeader, _) = abi::decode(bytes)?;
        if self.shutting_down {
            self.comm.send(
                caller,
                Tag::ResponseGet,
                GetResponse::shutdown().as_bytes(),
            )?;
            return Ok(());
        }
        let t = h.work_type;
        if t < 0 || t as usize >= self.types || !self.check_workqueue(caller, t)? {
            self.comm.send(
                caller,
                Tag::ResponseGet,
                GetResponse::nothing(self.layout.rank).as_bytes(),
            )?;
        }
        Ok(())
    }

    fn handle_create(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (CreateHeader, _) = abi::decode(bytes)?;

        // Random placement rotates new data across the servers: the
        // create is handed to the next server in rotation, which mints
        // the id and stores the datum. `Default` data stays where the
        // caller's client routed it; `Local` data always stays here.
        if h.props.placement == Placement::Random
            && h.id == abi::DATA_ID_NULL
            && !self.syncst.in_progress
        {
            let dest = self.rotate_placement();
            if dest != self.layout.rank {
                return self.forward_create(caller, h, dest);
            }
        }

        let resp = match self.data.create(h.id, h.dtype, h.props, h.extras) {
            Ok(id) => abi::CreateResponse { code: Code::Success, id },
            Err(e) => abi::CreateResponse {
                code: e.code(),
                id: abi::DATA_ID_NULL,
            },
        };
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    /// Next server in the placement rotation; cycles through every
    /// server, this one included.
    fn rotate_placement(&mut self) -> Rank {
        let dest = self.layout.master_server_rank
            + self.place_rotate % self.layout.servers;
        self.place_rotate = (self.place_rotate + 1) % self.layout.servers;
        dest
    }

    /// Ships a rotated create to `dest` and relays its response to the
    /// caller. The forwarded copy is pinned `Local` so the peer doesn't
    /// rotate it again.
    fn forward_create(
        &mut self,
        caller: Rank,
        mut h: CreateHeader,
        dest: Rank,
    ) -> Result<(), ServerError> {
        h.props.placement = Placement::Local;
        if self.sync_with(dest, SyncHeader::Generic, &[])?.is_shutdown() {
            let resp = abi::CreateResponse {
                code: Code::Shutdown,
                id: abi::DATA_ID_NULL,
            };
            return self
                .comm
                .send(caller, Tag::Response, &abi::encode(&resp))
                .map_err(Into::into);
        }
        self.comm.send(dest, Tag::Create, &abi::encode(&h))?;
        let bytes = self.comm.recv(dest, Tag::Response)?;
        self.comm.send(caller, Tag::Response, &bytes)?;
        self.serve_pending_syncs()
    }

    fn handle_multicreate(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (MulticreateHeader, _) = abi::decode(bytes)?;
        let mut rest = blob;
        let mut ids = Vec::with_capacity(h.count as usize);
        let mut code = Code::Success;
        for _ in 0..h.count {
            let (spec, r): (CreateHeader, _) = abi::decode(rest)?;
            rest = r;
            if spec.id != abi::DATA_ID_NULL {
                // Batch creation always assigns fresh ids.
                code = Code::Invalid;
                break;
            }
            match self.data.create(spec.id, spec.dtype, spec.props, spec.extras)
            {
                Ok(id) => ids.push(id),
                Err(e) => {
                    code = e.code();
                    break;
                }
            }
        }

        let mut id_blob = Vec::with_capacity(ids.len() * 8);
        for id in &ids {
            abi::pack_id(&mut id_blob, *id);
        }
        let resp =
            abi::MulticreateResponse { code, count: ids.len() as u32 };
        self.comm
            .send(caller, Tag::Response, &abi::encode_with_blob(&resp, &id_blob))
            .map_err(Into::into)
    }

    fn handle_exists(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (ExistsHeader, _) = abi::decode(bytes)?;
        let sub = opt_sub(blob, h.sub_len)?;
        let (resp, notifs) = match self.data.exists(h.id, sub, h.decr) {
            Ok((exists, n)) => (
                abi::ExistsResponse { code: Code::Success, exists },
                Some(n),
            ),
            Err(e) => {
                (abi::ExistsResponse { code: e.code(), exists: false }, None)
            }
        };
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
        self.process_some(notifs)
    }

    fn handle_store(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (StoreHeader, _) = abi::decode(bytes)?;
        let sub_len = h.sub_len as usize;
        let total = sub_len + h.length as usize;
        if blob.len() < total {
            return Err(ServerError::Protocol("short store payload"));
        }
        let sub = if sub_len > 0 { Some(&blob[..sub_len]) } else { None };
        let value = &blob[sub_len..total];

        let (resp, notifs) = match self.data.store(
            h.id,
            sub,
            h.dtype,
            value,
            h.decr,
            h.store_refs,
        ) {
            Ok(n) => (
                abi::StoreResponse {
                    code: Code::Success,
                    close_notifies: n.closes.len() as u32,
                    ref_notifies: n.refs.len() as u32,
                },
                Some(n),
            ),
            Err(e) => (
                abi::StoreResponse {
                    code: e.code(),
                    close_notifies: 0,
                    ref_notifies: 0,
                },
                None,
            ),
        };
        // Unblock the caller before paying for deliveries, which may
        // involve cross-server syncs.
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
        self.process_some(notifs)
    }

    fn handle_retrieve(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (RetrieveHeader, _) = abi::decode(bytes)?;
        let sub = opt_sub(blob, h.sub_len)?;
        match self.data.retrieve(h.id, sub, h.decr, h.acquire) {
            Ok((dtype, value, n)) => {
                let resp = abi::RetrieveResponse {
                    code: Code::Success,
                    dtype,
                    length: value.len() as u32,
                };
                self.comm.send(
                    caller,
                    Tag::Response,
                    &abi::encode_with_blob(&resp, &value),
                )?;
                self.process_notifications(n)
            }
            Err(e) => {
                let resp = abi::RetrieveResponse {
                    code: e.code(),
                    dtype: abi::DataType::Blob,
                    length: 0,
                };
                self.comm
                    .send(caller, Tag::Response, &abi::encode(&resp))
                    .map_err(Into::into)
            }
        }
    }

    fn handle_enumerate(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (EnumerateHeader, _) = abi::decode(bytes)?;
        match self.data.enumerate(
            h.id,
            h.count,
            h.offset,
            h.want_subscripts,
            h.want_members,
            h.decr,
        ) {
            Ok((actual, subs, members, n)) => {
                let resp = abi::EnumerateResponse {
                    code: Code::Success,
                    actual,
                    subscripts_len: subs.len() as u32,
                    members_len: members.len() as u32,
                };
                let mut blob = subs;
                blob.extend_from_slice(&members);
                self.comm.send(
                    caller,
                    Tag::Response,
                    &abi::encode_with_blob(&resp, &blob),
                )?;
                self.process_notifications(n)
            }
            Err(e) => {
                let resp = abi::EnumerateResponse {
                    code: e.code(),
                    actual: 0,
                    subscripts_len: 0,
                    members_len: 0,
                };
                self.comm
                    .send(caller, Tag::Response, &abi::encode(&resp))
                    .map_err(Into::into)
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (SubscribeHeader, _) = abi::decode(bytes)?;
        let sub = opt_sub(blob, h.sub_len)?;
        let resp = match self.data.subscribe(h.id, sub, caller, h.work_type) {
            Ok(subscribed) => {
                abi::SubscribeResponse { code: Code::Success, subscribed }
            }
            // Already freed means already closed: nothing to wait for.
            Err(DataError::NotFound) => abi::SubscribeResponse {
                code: Code::Success,
                subscribed: false,
            },
            Err(e) => abi::SubscribeResponse {
                code: e.code(),
                subscribed: false,
            },
        };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_refcount_incr(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (abi::RefcountHeader, _) = abi::decode(bytes)?;
        let (resp, notifs) = match self.data.refcount_incr(h.id, h.change) {
            Ok(n) => (
                abi::RefcountResponse {
                    code: Code::Success,
                    close_notifies: n.closes.len() as u32,
                    ref_notifies: n.refs.len() as u32,
                },
                Some(n),
            ),
            Err(e) => (
                abi::RefcountResponse {
                    code: e.code(),
                    close_notifies: 0,
                    ref_notifies: 0,
                },
                None,
            ),
        };
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
        self.process_some(notifs)
    }

    fn handle_insert_atomic(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (InsertAtomicHeader, _) = abi::decode(bytes)?;
        let sub = blob
            .get(..h.sub_len as usize)
            .ok_or(ServerError::Protocol("short subscript"))?;
        match self.data.insert_atomic(h.id, sub, h.acquire, h.return_value) {
            Ok((created, value, n)) => {
                let (dtype, bytes) = match &value {
                    Some((d, v)) => (*d, v.as_slice()),
                    None => (abi::DataType::Blob, &[][..]),
                };
                let resp = abi::InsertAtomicResponse {
                    code: Code::Success,
                    created,
                    value_present: value.is_some(),
                    dtype,
                    length: bytes.len() as u32,
                };
                self.comm.send(
                    caller,
                    Tag::Response,
                    &abi::encode_with_blob(&resp, bytes),
                )?;
                self.process_notifications(n)
            }
            Err(e) => {
                let resp = abi::InsertAtomicResponse {
                    code: e.code(),
                    created: false,
                    value_present: false,
                    dtype: abi::DataType::Blob,
                    length: 0,
                };
                self.comm
                    .send(caller, Tag::Response, &abi::encode(&resp))
                    .map_err(Into::into)
            }
        }
    }

    fn handle_container_reference(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (abi::ContainerRefHeader, _) = abi::decode(bytes)?;
        let sub_len = h.sub_len as usize;
        let ref_sub_len = h.ref_sub_len as usize;
        if blob.len() < sub_len + ref_sub_len {
            return Err(ServerError::Protocol("short subscripts"));
        }
        let sub = &blob[..sub_len];
        let ref_sub = if ref_sub_len > 0 {
            Some(&blob[sub_len..sub_len + ref_sub_len])
        } else {
            None
        };

        let (resp, notifs) = match self.data.container_reference(
            h.id,
            sub,
            h.ref_id,
            ref_sub,
            h.ref_type,
            h.transfer,
            h.decr,
        ) {
            Ok(n) => (abi::SimpleResponse { code: Code::Success }, Some(n)),
            Err(e) => (abi::SimpleResponse { code: e.code() }, None),
        };
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
        self.process_some(notifs)
    }

    fn handle_container_size(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (abi::ContainerSizeHeader, _) = abi::decode(bytes)?;
        let (resp, notifs) = match self.data.container_size(h.id, h.decr) {
            Ok((size, n)) => (
                abi::ContainerSizeResponse { code: Code::Success, size },
                Some(n),
            ),
            Err(e) => {
                (abi::ContainerSizeResponse { code: e.code(), size: -1 }, None)
            }
        };
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
        self.process_some(notifs)
    }

    fn handle_container_typeof(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (TypeofHeader, _) = abi::decode(bytes)?;
        let resp = match self.data.container_typeof(h.id) {
            Ok((key_type, val_type)) => abi::ContainerTypeofResponse {
                code: Code::Success,
                key_type,
                val_type,
            },
            Err(e) => abi::ContainerTypeofResponse {
                code: e.code(),
                key_type: abi::DataType::Blob,
                val_type: abi::DataType::Blob,
            },
        };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_typeof(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (TypeofHeader, _) = abi::decode(bytes)?;
        let resp = match self.data.typeof_(h.id) {
            Ok(dtype) => abi::TypeofResponse { code: Code::Success, dtype },
            Err(e) => abi::TypeofResponse {
                code: e.code(),
                dtype: abi::DataType::Blob,
            },
        };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_unique(&mut self, caller: Rank) -> Result<(), ServerError> {
        let id = self.data.unique();
        let resp = abi::UniqueResponse { code: Code::Success, id };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_lock(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (LockHeader, _) = abi::decode(bytes)?;
        let resp = match self.data.lock(h.id, caller) {
            Ok(granted) => abi::LockResponse { code: Code::Success, granted },
            Err(e) => abi::LockResponse { code: e.code(), granted: false },
        };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_unlock(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, _): (UnlockHeader, _) = abi::decode(bytes)?;
        let resp = match self.data.unlock(h.id) {
            Ok(()) => abi::SimpleResponse { code: Code::Success },
            Err(e) => abi::SimpleResponse { code: e.code() },
        };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_check_idle(&mut self, caller: Rank) -> Result<(), ServerError> {
        let resp = abi::IdleResponse { idle: self.check_idle_local() };
        log::debug!("[{}] check_idle -> {}", self.layout.rank, resp.idle);
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    fn handle_shutdown_worker(
        &mut self,
        caller: Rank,
    ) -> Result<(), ServerError> {
        log::debug!("[{}] worker {caller} shut down", self.layout.rank);
        let ix = self.layout.my_worker_ix(caller);
        if !self.workers_shutdown[ix] {
            self.workers_shutdown[ix] = true;
            self.workers_shutdown_count += 1;
        }
        Ok(())
    }

    fn handle_fail(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        let (h, _): (FailHeader, _) = abi::decode(bytes)?;
        log::warn!("[{}] fail rpc: code {}", self.layout.rank, h.exit_code);
        self.fail_code = Some(h.exit_code);
        if self.layout.is_master() {
            self.initiate_shutdown()?;
        } else {
            self.shutting_down = true;
        }
        Ok(())
    }

    /// A peer chose to send a close notification as a standalone RPC
    /// rather than piggy-backed on its sync header.
    fn handle_notify(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (NotifyHeader, _) = abi::decode(bytes)?;
        let sub = opt_sub(blob, h.sub_len)?.map(|s| s.to_vec());
        self.notify_closed(h.id, sub.as_deref(), true)?;
        let resp = abi::SimpleResponse { code: Code::Success };
        self.comm
            .send(caller, Tag::Response, &abi::encode(&resp))
            .map_err(Into::into)
    }

    /// Data-dependent put: subscribe to every input, then hand the
    /// transform to the engine (or release the task straight away if
    /// everything is already closed).
    fn handle_rule(
        &mut self,
        caller: Rank,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let (h, blob): (RuleHeader, _) = abi::decode(bytes)?;

        let put_shape = PutHeader {
            work_type: h.work_type,
            putter: caller,
            priority: h.priority,
            answer: h.answer,
            target: h.target,
            strictness: h.strictness,
            accuracy: h.accuracy,
            parallelism: h.parallelism,
            length: h.length,
            has_inline: true,
        };
        if !self.valid_put(&put_shape) {
            let resp =
                abi::RuleResponse { code: Code::Invalid, ready: false };
            self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
            return Ok(());
        }

        // Blob: name, input ids, (id, subscript) pairs, payload.
        let mut rest = blob;
        let name = rest
            .get(..h.name_len as usize)
            .ok_or(ServerError::Protocol("short rule name"))?;
        let name = (!name.is_empty())
            .then(|| String::from_utf8_lossy(name).into_owned());
        rest = &rest[h.name_len as usize..];

        let mut input_ids = Vec::with_capacity(h.n_ids as usize);
        for _ in 0..h.n_ids {
            let (id, r) = abi::unpack_id(rest)
                .ok_or(ServerError::Protocol("short rule inputs"))?;
            input_ids.push(id);
            rest = r;
        }
        let mut input_id_subs = Vec::with_capacity(h.n_id_subs as usize);
        for _ in 0..h.n_id_subs {
            let (id, r) = abi::unpack_id(rest)
                .ok_or(ServerError::Protocol("short rule inputs"))?;
            let (sub, r) = abi::unpack_bytes(r)
                .ok_or(ServerError::Protocol("short rule inputs"))?;
            input_id_subs.push((id, sub.to_vec()));
            rest = r;
        }
        let payload = rest
            .get(..h.length as usize)
            .ok_or(ServerError::Protocol("short rule payload"))?
            .to_vec();

        // Subscribe to each input; inputs that turn out closed are
        // marked satisfied immediately.
        let mut pending = Vec::with_capacity(input_ids.len() + input_id_subs.len());
        let mut shutdown = false;
        let mut invalid = false;
        {
            let inputs = input_ids
                .iter()
                .map(|id| (*id, None))
                .chain(
                    input_id_subs
                        .iter()
                        .map(|(id, sub)| (*id, Some(sub.as_slice()))),
                )
                .collect::<Vec<_>>();
            for (id, sub) in inputs {
                if id == abi::DATA_ID_NULL {
                    invalid = true;
                    break;
                }
                let home = self.layout.locate(id);
                let remote = home != self.layout.rank;
                let state = self.engine.check_input(id, sub, remote);
                let is_pending = match state {
                    InputState::AlreadySubscribed => true,
                    InputState::KnownClosed => false,
                    InputState::MustSubscribe => {
                        let subscribed = if remote {
                            match self.remote_subscribe(home, id, sub)? {
                                Some(b) => b,
                                None => {
                                    shutdown = true;
                                    break;
                                }
                            }
                        } else {
                            match self.data.subscribe(
                                id,
                                sub,
                                self.layout.rank,
                                0,
                            ) {
                                Ok(b) => b,
                                Err(DataError::NotFound) => false,
                                Err(_) => {
                                    invalid = true;
                                    break;
                                }
                            }
                        };
                        self.engine.record_subscribe(
                            id, sub, subscribed, remote,
                        );
                        subscribed
                    }
                };
                pending.push(is_pending);
            }
        }

        if shutdown || invalid {
            let resp = abi::RuleResponse {
                code: if shutdown { Code::Shutdown } else { Code::Invalid },
                ready: false,
            };
            self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;
            return Ok(());
        }

        let wu = Box::new(WorkUnit {
            id: self.workq.unique(),
            work_type: h.work_type,
            priority: h.priority,
            putter: caller,
            answer: h.answer,
            target: Target::from_wire(h.target, h.strictness, h.accuracy),
            parallelism: h.parallelism,
            payload,
        });
        let released =
            self.engine.add_rule(name, input_ids, input_id_subs, &pending, wu);

        let resp = abi::RuleResponse {
            code: Code::Success,
            ready: released.is_some(),
        };
        self.comm.send(caller, Tag::Response, &abi::encode(&resp))?;

        if let Some(wu) = released {
            let t = wu.work_type;
            self.put_local(wu)?;
            self.check_parallel(t)?;
        }
        Ok(())
    }

    fn process_some(
        &mut self,
        notifs: Option<Notifications>,
    ) -> Result<(), ServerError> {
        match notifs {
            Some(n) if !n.is_empty() => self.process_notifications(n),
            _ => Ok(()),
        }
    }
}

fn opt_sub(blob: &[u8], sub_len: u32) -> Result<Option<&[u8]>, ServerError> {
    if sub_len == 0 {
        return Ok(None);
    }
    blob.get(..sub_len as usize)
        .map(Some)
        .ok_or(ServerError::Protocol("short subscript"))
}
