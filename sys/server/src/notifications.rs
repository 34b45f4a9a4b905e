// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delivery of data-store notification bundles.
//!
//! The data store reports what a mutation caused — closes to announce,
//! references to resolve, refcounts to transfer — and this module routes
//! each entry:
//!
//! - a close owed to *this* server is an engine subscription: the engine
//!   updates its transforms and released work is dispatched;
//! - a close owed to another server is forwarded through a sync
//!   handshake;
//! - a close owed to a worker becomes a control task targeted at that
//!   worker, payload `close <id> [sub]`, dispatched through the ordinary
//!   targeted-put path (so it reaches the worker via its blocked `get`);
//! - reference resolutions and refcount transfers are stores/updates
//!   against local or remote datums.
//!
//! Local follow-on effects (a reference store closing another datum,
//! which resolves more references, ...) are worked breadth-first through
//! a queue, so one store+close storm pays one traversal.

use std::collections::VecDeque;

use abi::{Refcounts, RANK_NULL};
use comm::Transport;

use crate::datastore::{Notifications, RcOp, RefStore};
use crate::server::{Server, ServerError};
use crate::workqueue::{Target, WorkUnit};

/// Priority of close-notification control tasks.
const NOTIFY_PRIORITY: i32 = 1;

impl<T: Transport> Server<'_, T> {
    /// Delivers a notification bundle and all of its local follow-on
    /// bundles.
    pub(crate) fn process_notifications(
        &mut self,
        first: Notifications,
    ) -> Result<(), ServerError> {
        let mut queue: VecDeque<Notifications> = VecDeque::new();
        queue.push_back(first);

        while let Some(n) = queue.pop_front() {
            for close in n.closes {
                self.deliver_close(
                    close.rank,
                    close.work_type,
                    close.id,
                    close.sub,
                )?;
            }
            for rs in n.refs {
                self.deliver_ref_store(rs, &mut queue)?;
            }
            for rc in n.rc_ops {
                self.deliver_rc_op(rc, &mut queue)?;
            }
        }
        Ok(())
    }

    fn deliver_close(
        &mut self,
        rank: abi::Rank,
        work_type: abi::WorkType,
        id: abi::DataId,
        sub: Option<Vec<u8>>,
    ) -> Result<(), ServerError> {
        if rank == self.layout.rank {
            // Our own engine subscribed to this datum.
            return self.notify_closed(id, sub.as_deref(), false);
        }
        if self.layout.is_server(rank) {
            // Another server's engine subscribed.
            return self.remote_notify(rank, id, sub.as_deref());
        }

        // A worker subscribed: encode the close as a targeted control
        // task of the type the subscriber asked for.
        let payload = abi::notify_payload(id, sub.as_deref());
        let wu = Box::new(WorkUnit {
            id: self.workq.unique(),
            work_type,
            priority: NOTIFY_PRIORITY,
            putter: self.layout.rank,
            answer: RANK_NULL,
            target: Target::rank(rank),
            parallelism: 1,
            payload,
        });
        let home = self.layout.map_to_server(rank);
        if home == self.layout.rank {
            self.put_local(wu)
        } else {
            self.remote_put(home, wu)
        }
    }

    fn deliver_ref_store(
        &mut self,
        rs: RefStore,
        queue: &mut VecDeque<Notifications>,
    ) -> Result<(), ServerError> {
        let home = self.layout.locate(rs.id);
        if home != self.layout.rank {
            return self.remote_ref_store(home, rs);
        }
        match self.data.store(
            rs.id,
            rs.sub.as_deref(),
            rs.dtype,
            &rs.value,
            Refcounts::WRITE_ONE,
            rs.store_refs,
        ) {
            Ok(more) => queue.push_back(more),
            // A concurrent writer got there first; single-assignment
            // semantics say first wins.
            Err(crate::datastore::DataError::DoubleWrite) => {}
            Err(e) => {
                log::warn!("reference store into <{}> failed: {e:?}", rs.id);
            }
        }
        Ok(())
    }

    fn deliver_rc_op(
        &mut self,
        rc: RcOp,
        queue: &mut VecDeque<Notifications>,
    ) -> Result<(), ServerError> {
        let home = self.layout.locate(rc.id);
        if home != self.layout.rank {
            return self.remote_refcount(home, rc.id, rc.change);
        }
        match self.data.refcount_incr(rc.id, rc.change) {
            Ok(more) => queue.push_back(more),
            Err(e) => {
                log::warn!("refcount transfer to <{}> failed: {e:?}", rc.id);
            }
        }
        Ok(())
    }
}
