// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport contract the engine is written against.
//!
//! The real messaging layer (MPI or similar) is out of scope; the engine
//! only assumes a point-to-point layer with world rank/size, tagged
//! send/receive with (source, tag) filtering, and a non-blocking probe
//! supporting wildcards. That assumption is this crate's [`Transport`]
//! trait.
//!
//! Contract requirements, which implementations must uphold:
//!
//! - Messages between one (sender, receiver) pair on one tag are received
//!   in send order.
//! - A wildcard probe returns pending messages fairly across sources and
//!   tags (no starvation).
//! - `recv` with a (source, tag) filter blocks until a matching message
//!   arrives, and never consumes non-matching messages.
//!
//! [`loopback`] provides an in-process implementation used by the test
//! suite and by host runtimes that co-locate workers and servers in one
//! process.

use abi::{Rank, Tag};

pub mod loopback;

/// Description of a pending message, from a probe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub source: Rank,
    pub tag: Tag,
    pub len: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommError {
    /// The destination rank is outside the world.
    BadRank(Rank),
    /// The fabric has been torn down.
    Closed,
}

pub trait Transport {
    /// This process's world rank.
    fn rank(&self) -> Rank;

    /// Total number of ranks.
    fn size(&self) -> i32;

    /// Sends `msg` to `dest` under `tag`. Does not block on the receiver.
    fn send(&self, dest: Rank, tag: Tag, msg: &[u8]) -> Result<(), CommError>;

    /// Checks for a pending message matching the filters without
    /// receiving it. `None` filters are wildcards.
    fn try_probe(
        &self,
        source: Option<Rank>,
        tag: Option<Tag>,
    ) -> Result<Option<Envelope>, CommError>;

    /// Receives the oldest pending message from `source` under `tag`,
    /// blocking until one arrives.
    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>, CommError>;
}
