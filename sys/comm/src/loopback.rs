// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process loopback fabric.
//!
//! One mailbox per rank, each a mutex-protected arrival queue plus a
//! condvar for blocking receives. Messages are kept in global arrival
//! order within a mailbox, and filtered probes/receives always take the
//! *oldest* match, which gives both the per-pair FIFO guarantee and probe
//! fairness (earliest arrival wins regardless of source or tag).
//!
//! This is deliberately simple: it exists so the engine can be driven
//! end-to-end on threads. It is not a model of a high-performance fabric.

use std::sync::{Arc, Condvar, Mutex};

use abi::{Rank, Tag};

use crate::{CommError, Envelope, Transport};

#[derive(Debug)]
struct Message {
    source: Rank,
    tag: Tag,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<Message>>,
    arrived: Condvar,
}

/// The shared fabric. Create one, then take an endpoint per rank.
pub struct Fabric {
    mailboxes: Vec<Mailbox>,
}

impl Fabric {
    pub fn new(size: usize) -> Arc<Self> {
        let mut mailboxes = Vec::with_capacity(size);
        mailboxes.resize_with(size, Mailbox::default);
        Arc::new(Self { mailboxes })
    }

    /// Returns the endpoint for `rank`.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is out of range.
    pub fn endpoint(self: &Arc<Self>, rank: Rank) -> Endpoint {
        assert!((rank as usize) < self.mailboxes.len());
        Endpoint {
            fabric: Arc::clone(self),
            rank,
        }
    }
}

/// One rank's handle on the fabric.
#[derive(Clone)]
pub struct Endpoint {
    fabric: Arc<Fabric>,
    rank: Rank,
}

impl Endpoint {
    fn mailbox(&self, rank: Rank) -> Result<&Mailbox, CommError> {
        self.fabric
            .mailboxes
            .get(rank as usize)
            .ok_or(CommError::BadRank(rank))
    }
}

fn matches(m: &Message, source: Option<Rank>, tag: Option<Tag>) -> bool {
    source.map(|s| s == m.source).unwrap_or(true)
        && tag.map(|t| t == m.tag).unwrap_or(true)
}

impl Transport for Endpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> i32 {
        self.fabric.mailboxes.len() as i32
    }

    fn send(&self, dest: Rank, tag: Tag, msg: &[u8]) -> Result<(), CommError> {
        let mailbox = self.mailbox(dest)?;
        let mut queue = mailbox.queue.lock().unwrap();
        queue.push(Message {
            source: self.rank,
            tag,
            bytes: msg.to_vec(),
        });
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn try_probe(
        &self,
        source: Option<Rank>,
        tag: Option<Tag>,
    ) -> Result<Option<Envelope>, CommError> {
        let mailbox = self.mailbox(self.rank)?;
        let queue = mailbox.queue.lock().unwrap();
        Ok(queue.iter().find(|m| matches(m, source, tag)).map(|m| {
            Envelope {
                source: m.source,
                tag: m.tag,
                len: m.bytes.len(),
            }
        }))
    }

    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>, CommError> {
        let mailbox = self.mailbox(self.rank)?;
        let mut queue = mailbox.queue.lock().unwrap();
        loop {
            if let Some(at) =
                queue.iter().position(|m| matches(m, Some(source), Some(tag)))
            {
                return Ok(queue.remove(at).bytes);
            }
            queue = mailbox.arrived.wait(queue).unwrap();
        }
    }
}
