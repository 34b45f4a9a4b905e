// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rank-space layout: who is a worker, who is a server, and who is home
//! to whom.
//!
//! Ranks `[0, workers)` are workers; ranks `[workers, size)` are servers.
//! Each worker has one home server, `workers + (rank mod servers)`, which
//! services all of its RPCs. Each datum id `d` lives on exactly one
//! server, `workers + (d mod servers)`, with negative ids wrapped into
//! range. The master server is the lowest-ranked server.
//!
//! A server also knows the host topology of *its own* workers, to support
//! node-accuracy targeting: `worker → host` and its inverse, with host
//! indices assigned in first-seen order.

use abi::{DataId, Rank};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayoutError {
    /// servers < 1, workers < 1, or rank out of range.
    BadPartition,
    /// Hostnames were supplied but not one per rank.
    BadHostnames,
}

#[derive(Clone, Debug)]
pub struct Layout {
    pub size: i32,
    pub rank: Rank,
    pub servers: i32,
    pub workers: i32,
    pub master_server_rank: Rank,
    /// Number of workers homed on this server.
    pub my_workers: i32,
    /// Host index per my-worker index.
    worker2host: Vec<usize>,
    /// My workers on each host, by host index.
    host2workers: Vec<Vec<Rank>>,
}

impl Layout {
    pub fn new(
        size: i32,
        rank: Rank,
        servers: i32,
        hostnames: &[String],
    ) -> Result<Self, LayoutError> {
        if servers < 1 || size <= servers || rank < 0 || rank >= size {
            return Err(LayoutError::BadPartition);
        }
        if !hostnames.is_empty() && hostnames.len() != size as usize {
            return Err(LayoutError::BadHostnames);
        }

        let workers = size - servers;
        let mut layout = Self {
            size,
            rank,
            servers,
            workers,
            master_server_rank: workers,
            my_workers: 0,
            worker2host: Vec::new(),
            host2workers: Vec::new(),
        };

        if layout.is_server(rank) {
            let mine: Vec<Rank> = (0..workers)
                .filter(|w| layout.map_to_server(*w) == rank)
                .collect();
            layout.my_workers = mine.len() as i32;
            layout.build_hostmap(&mine, hostnames);
        }

        Ok(layout)
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.workers && rank < self.size
    }

    pub fn is_worker(&self, rank: Rank) -> bool {
        rank >= 0 && rank < self.workers
    }

    pub fn am_server(&self) -> bool {
        self.is_server(self.rank)
    }

    pub fn is_master(&self) -> bool {
        self.rank == self.master_server_rank
    }

    /// Server number in `[0, servers)`; only meaningful for server ranks.
    pub fn server_number(&self, rank: Rank) -> i32 {
        rank - self.workers
    }

    /// The server that services `rank`'s RPCs. Servers map to themselves.
    pub fn map_to_server(&self, rank: Rank) -> Rank {
        if self.is_server(rank) {
            rank
        } else {
            self.workers + rank % self.servers
        }
    }

    /// The unique server storing datum `id`. Negative ids wrap: with S
    /// servers, `locate(-1)` is the last server and `locate(-S)` the
    /// first.
    pub fn locate(&self, id: DataId) -> Rank {
        let s = self.servers as i64;
        let offset = id.rem_euclid(s) as i32;
        self.workers + offset
    }

    /// Index of `rank` within this server's worker set.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is not one of this server's workers; callers
    /// check with [`Self::map_to_server`] first.
    pub fn my_worker_ix(&self, rank: Rank) -> usize {
        assert_eq!(self.map_to_server(rank), self.rank);
        (rank / self.servers) as usize
    }

    /// Inverse of [`Self::my_worker_ix`].
    pub fn rank_of_my_worker(&self, ix: usize) -> Rank {
        ix as Rank * self.servers + self.server_number(self.rank)
    }

    /// Number of distinct hosts among this server's workers.
    pub fn host_count(&self) -> usize {
        self.host2workers.len()
    }

    /// Host index of one of this server's workers.
    pub fn worker_host(&self, rank: Rank) -> usize {
        self.worker2host[self.my_worker_ix(rank)]
    }

    /// This server's workers located on `host`.
    pub fn workers_on_host(&self, host: usize) -> &[Rank] {
        &self.host2workers[host]
    }

    fn build_hostmap(&mut self, mine: &[Rank], hostnames: &[String]) {
        if hostnames.is_empty() {
            // Everything on one host.
            self.worker2host = vec![0; mine.len()];
            self.host2workers = vec![mine.to_vec()];
            return;
        }

        let mut index_of: std::collections::HashMap<&str, usize> =
            std::collections::HashMap::new();
        for &w in mine {
            let name = hostnames[w as usize].as_str();
            let next = index_of.len();
            let host = *index_of.entry(name).or_insert(next);
            self.worker2host.push(host);
            if host == self.host2workers.len() {
                self.host2workers.push(Vec::new());
            }
            self.host2workers[host].push(w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: i32, rank: Rank, servers: i32) -> Layout {
        Layout::new(size, rank, servers, &[]).unwrap()
    }

    #[test]
    fn partitioning() {
        let l = layout(10, 8, 2);
        assert_eq!(l.workers, 8);
        assert_eq!(l.master_server_rank, 8);
        assert!(l.is_server(8));
        assert!(l.is_server(9));
        assert!(!l.is_server(7));
        assert!(l.is_worker(0));
        assert!(!l.is_worker(8));
        assert!(l.is_master());
        assert!(!layout(10, 9, 2).is_master());
    }

    #[test]
    fn worker_homes() {
        let l = layout(10, 8, 2);
        for w in 0..8 {
            assert_eq!(l.map_to_server(w), 8 + w % 2);
        }
        // Servers are their own home.
        assert_eq!(l.map_to_server(9), 9);
    }

    #[test]
    fn my_worker_indices_invert() {
        let l = layout(10, 9, 2);
        assert_eq!(l.my_workers, 4);
        for ix in 0..4 {
            let r = l.rank_of_my_worker(ix);
            assert_eq!(l.map_to_server(r), 9);
            assert_eq!(l.my_worker_ix(r), ix);
        }
    }

    #[test]
    fn locate_wraps_negative_ids() {
        let l = layout(10, 8, 2);
        // workers = 8, servers = 2.
        assert_eq!(l.locate(1), 9);
        assert_eq!(l.locate(2), 8);
        assert_eq!(l.locate(-1), 8 + 2 - 1);
        assert_eq!(l.locate(-2), 8);
        assert_eq!(l.locate(i64::MIN + 1), l.locate(-1));
    }

    #[test]
    fn hostmap_groups_workers() {
        let names: Vec<String> = [
            "n0", "n0", "n1", "n1", // workers 0-3
            "n2",                   // server
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let l = Layout::new(5, 4, 1, &names).unwrap();
        assert_eq!(l.my_workers, 4);
        assert_eq!(l.host_count(), 2);
        assert_eq!(l.worker_host(0), l.worker_host(1));
        assert_ne!(l.worker_host(1), l.worker_host(2));
        assert_eq!(l.workers_on_host(l.worker_host(2)), &[2, 3]);
    }

    #[test]
    fn empty_hostnames_mean_one_host() {
        let l = layout(5, 4, 1);
        assert_eq!(l.host_count(), 1);
        assert_eq!(l.workers_on_host(0), &[0, 1, 2, 3]);
    }

    #[test]
    fn bad_configs_are_rejected() {
        assert_eq!(
            Layout::new(2, 0, 2, &[]).unwrap_err(),
            LayoutError::BadPartition,
        );
        assert_eq!(
            Layout::new(4, 0, 1, &["x".into()]).unwrap_err(),
            LayoutError::BadHostnames,
        );
    }
}
