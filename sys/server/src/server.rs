// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The server control loop.
//!
//! One [`Server`] value owns every subsystem — work queue, request
//! queue, data store, dependency engine, sync state — and a single
//! thread drives it: serve a budget of RPCs, try to release a parallel
//! task, try to steal, repeat. There is no other thread and no lock.
//!
//! The master server (the lowest-ranked one) additionally runs the
//! distributed idle check: when its own workers have all gone quiet for
//! `max_idle`, it polls every other server, and if the whole cluster is
//! idle it broadcasts shutdown. Shutdown releases every worker blocked
//! in `get` with a shutdown response.

use std::time::Instant;

use abi::{Code, GetResponse, Rank, SyncHeader, Tag, WireError, WorkType};
use comm::{CommError, Envelope, Transport};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use zerocopy::IntoBytes;

use crate::datastore::DataStore;
use crate::engine::Engine;
use crate::layout::{Layout, LayoutError};
use crate::requestqueue::RequestQueue;
use crate::settings::{Settings, SettingsError};
use crate::steal::StealState;
use crate::sync::SyncState;
use crate::workqueue::{WorkQueue, WorkQueueError};
use crate::{backoffs, ServerConfig};

/// How often the serve loop prefers sync probes over the wildcard, so
/// blocked peers get unblocked promptly.
const SYNC_CHECK_FREQ: u32 = 16;

/// Errors that terminate the server loop. Application-level failures
/// travel back to callers as status codes instead.
#[derive(Debug)]
pub enum ServerError {
    Comm(CommError),
    Wire(WireError),
    Layout(LayoutError),
    Settings(SettingsError),
    /// A peer violated the protocol (bad tag, bad framing).
    Protocol(&'static str),
    /// This rank is not a server rank.
    NotAServer,
    /// Invalid startup configuration.
    BadConfig(&'static str),
}

impl From<CommError> for ServerError {
    fn from(e: CommError) -> Self {
        Self::Comm(e)
    }
}

impl From<WireError> for ServerError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<LayoutError> for ServerError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<SettingsError> for ServerError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}

impl From<WorkQueueError> for ServerError {
    fn from(_: WorkQueueError) -> Self {
        // Work-queue rejections at this level are routing bugs: the
        // handlers validate targets before enqueueing.
        Self::Protocol("misrouted work unit")
    }
}

pub struct Server<'c, T: Transport> {
    pub(crate) comm: &'c T,
    pub(crate) layout: Layout,
    pub(crate) settings: Settings,
    pub(crate) types: usize,
    pub(crate) max_memory: i64,
    pub(crate) workq: WorkQueue,
    pub(crate) requestq: RequestQueue,
    pub(crate) data: DataStore,
    pub(crate) engine: Engine,
    pub(crate) syncst: SyncState,
    pub(crate) steal: StealState,
    pub(crate) rng: SmallRng,
    /// Cached timestamp, refreshed at loop boundaries.
    pub(crate) now: Instant,
    /// Last time this server did work that counts against idleness.
    pub(crate) time_last_action: Instant,
    pub(crate) shutting_down: bool,
    pub(crate) fail_code: Option<i32>,
    /// Local workers that have announced shutdown, by my-worker index.
    pub(crate) workers_shutdown: Vec<bool>,
    pub(crate) workers_shutdown_count: i32,
    /// Rotation cursor for `Random`-placement creates.
    pub(crate) place_rotate: i32,
    backoff_attempt: u32,
    start: Instant,
}

/// Runs the server loop for this rank until cluster shutdown. Returns
/// the process exit code: 0 for a clean shutdown, or the positive code
/// carried by a `Fail` RPC.
pub fn run_server<T: Transport>(
    comm: &T,
    config: &ServerConfig,
) -> Result<i32, ServerError> {
    let settings = Settings::from_env()?;
    Server::new(comm, config, settings)?.run()
}

impl<'c, T: Transport> Server<'c, T> {
    pub fn new(
        comm: &'c T,
        config: &ServerConfig,
        settings: Settings,
    ) -> Result<Self, ServerError> {
        if config.types == 0 {
            return Err(ServerError::BadConfig("no work types configured"));
        }
        let layout = Layout::new(
            comm.size(),
            comm.rank(),
            config.servers,
            &config.hostnames,
        )?;
        if !layout.am_server() {
            return Err(ServerError::NotAServer);
        }

        let server_number = layout.server_number(layout.rank);
        let now = Instant::now();
        Ok(Self {
            comm,
            workq: WorkQueue::new(
                config.types,
                layout.my_workers as usize,
                layout.host_count(),
                settings.perf_counters,
            ),
            requestq: RequestQueue::new(
                config.types,
                layout.my_workers as usize,
            ),
            data: DataStore::new(
                server_number,
                config.servers,
                config.struct_types.clone(),
            ),
            engine: Engine::new(
                settings.closed_cache_size,
                settings.perf_counters,
            ),
            syncst: SyncState::new(),
            steal: StealState::new(),
            // Seeded by rank so test runs are reproducible.
            rng: SmallRng::seed_from_u64(layout.rank as u64),
            types: config.types,
            max_memory: config.max_memory,
            workers_shutdown: vec![false; layout.my_workers as usize],
            workers_shutdown_count: 0,
            place_rotate: 0,
            now,
            time_last_action: now,
            shutting_down: false,
            fail_code: None,
            backoff_attempt: 0,
            start: now,
            layout,
            settings,
        })
    }

    pub fn run(mut self) -> Result<i32, ServerError> {
        log::debug!(
            "[{}] server up: {} workers here, {} servers",
            self.layout.rank,
            self.layout.my_workers,
            self.layout.servers,
        );

        loop {
            if self.shutting_down {
                break;
            }
            if self.layout.is_master() {
                self.master_check_idle()?;
            }
            if self.shutting_down {
                break;
            }

            self.now = Instant::now();
            self.serve_several()?;
            self.now = Instant::now();

            for t in 0..self.types {
                self.check_parallel(t as WorkType)?;
            }
            self.check_steal()?;
        }

        self.finalize()?;
        Ok(self.fail_code.unwrap_or(0))
    }

    /// Serves a budget of requests, backing off adaptively when the
    /// queue runs dry.
    fn serve_several(&mut self) -> Result<bool, ServerError> {
        let mut reqs = 0;
        let mut polls = 0;
        let mut sleeps = 0;
        while reqs < self.settings.loop_max_requests
            && polls < self.settings.loop_max_polls
            && sleeps < self.settings.loop_max_sleeps
            && !self.shutting_down
        {
            // Prioritize server-to-server syncs so we don't leave a
            // peer spinning in its handshake loop.
            let prefer_sync = reqs % SYNC_CHECK_FREQ == 0;
            match self.poll(prefer_sync)? {
                Some(env) => {
                    self.handle_envelope(env)?;
                    reqs += 1;
                    self.serve_pending_syncs()?;
                    self.backoff_attempt /= 2;
                }
                None => {
                    let (again, slept) =
                        backoffs::backoff_server(self.backoff_attempt);
                    if !again {
                        break;
                    }
                    if slept {
                        sleeps += 1;
                    }
                    self.backoff_attempt += 1;
                }
            }
            polls += 1;
        }
        Ok(reqs > 0)
    }

    fn poll(&self, prefer_sync: bool) -> Result<Option<Envelope>, ServerError> {
        if prefer_sync {
            if let Some(env) =
                self.comm.try_probe(None, Some(Tag::SyncRequest))?
            {
                return Ok(Some(env));
            }
        }
        Ok(self.comm.try_probe(None, None)?)
    }

    /// Every served RPC except idle checks and sync requests counts as
    /// activity for quiescence purposes.
    pub(crate) fn update_last_action(&mut self, tag: Tag) {
        if tag != Tag::CheckIdle && tag != Tag::SyncRequest {
            self.time_last_action = self.now;
        }
    }

    /// This server's contribution to the idle check: every local worker
    /// parked or shut down, and nothing served recently.
    pub(crate) fn check_idle_local(&self) -> bool {
        let queued = self.requestq.size() as i32;
        let shut = self.workers_shutdown_count;
        debug_assert!(queued + shut <= self.layout.my_workers);
        if queued + shut != self.layout.my_workers {
            return false;
        }
        Instant::now() - self.time_last_action >= self.settings.max_idle
    }

    /// Master only: if the whole cluster has gone quiet, broadcast
    /// shutdown.
    fn master_check_idle(&mut self) -> Result<(), ServerError> {
        if !self.check_idle_local() {
            return Ok(());
        }
        log::debug!("[{}] idle check: polling servers", self.layout.rank);

        for s in self.layout.master_server_rank + 1..self.layout.size {
            if self.sync_with(s, SyncHeader::Generic, &[])?.is_shutdown() {
                return Ok(());
            }
            self.comm.send(s, Tag::CheckIdle, &[])?;
            let bytes = self.comm.recv(s, Tag::Response)?;
            let (resp, _): (abi::IdleResponse, _) = abi::decode(&bytes)?;
            self.serve_pending_syncs()?;
            if !resp.idle {
                return Ok(());
            }
        }

        self.initiate_shutdown()
    }

    pub(crate) fn initiate_shutdown(&mut self) -> Result<(), ServerError> {
        log::debug!("[{}] broadcasting shutdown", self.layout.rank);
        self.shutting_down = true;
        for s in self.layout.master_server_rank..self.layout.size {
            if s != self.layout.rank {
                self.comm.send(s, Tag::ShutdownServer, &[])?;
            }
        }
        Ok(())
    }

    /// Sends one queued task to `worker`, who is blocked in `get`.
    pub(crate) fn send_work(
        &mut self,
        worker: Rank,
        wu: &crate::workqueue::WorkUnit,
    ) -> Result<(), ServerError> {
        log::debug!(
            "[{}] send_work to {worker}: {{{}}}",
            self.layout.rank,
            wu.id,
        );
        let g = GetResponse {
            code: Code::Success.as_wire(),
            answer_rank: wu.answer,
            payload_source: self.layout.rank,
            work_type: wu.work_type,
            length: wu.payload.len() as u32,
            parallelism: wu.parallelism,
        };
        self.comm.send(worker, Tag::ResponseGet, g.as_bytes())?;
        self.comm.send(worker, Tag::Work, &wu.payload)?;
        Ok(())
    }

    /// Dispatches a task the server already holds: straight to a
    /// matching waiter when one exists, otherwise into the work queue.
    pub(crate) fn put_local(
        &mut self,
        wu: Box<crate::workqueue::WorkUnit>,
    ) -> Result<(), ServerError> {
        use abi::Accuracy;

        // Server-originated work (released rules, close notifications)
        // may name a worker homed elsewhere; forward it rather than
        // queue it where its target can never ask.
        if let Some(r) = wu.target.rank {
            let home = self.layout.map_to_server(r);
            if home != self.layout.rank && !wu.target.is_soft() {
                return self.remote_put(home, wu);
            }
        }

        if wu.parallelism == 1 {
            let waiter = match wu.target.rank {
                // A non-local soft target has no waiter here; its task
                // is reachable through the untargeted index only.
                Some(r) if self.layout.map_to_server(r) != self.layout.rank => {
                    None
                }
                Some(r) => match wu.target.accuracy {
                    Accuracy::Rank => self.requestq.matches_target(
                        r,
                        wu.work_type,
                        &self.layout,
                    ),
                    Accuracy::Node => {
                        let host = self.layout.worker_host(r);
                        self.requestq.matches_node(
                            host,
                            wu.work_type,
                            &self.layout,
                        )
                    }
                },
                None => {
                    self.requestq.matches_type(wu.work_type, &self.layout)
                }
            };
            if let Some(w) = waiter {
                self.send_work(w, &wu)?;
                self.workq.count_bypass(
                    wu.work_type,
                    1,
                    wu.target.rank.is_some(),
                );
                return Ok(());
            }
        }

        let t = wu.work_type;
        let parallel = wu.parallelism > 1;
        self.workq.add(wu, &self.layout)?;
        if parallel {
            self.check_parallel(t)?;
        }
        Ok(())
    }

    /// Tries to release one parallel task of type `t`: the
    /// highest-priority task for which a full gang of waiters exists.
    pub(crate) fn check_parallel(
        &mut self,
        t: WorkType,
    ) -> Result<bool, ServerError> {
        if self.workq.parallel_task_count() == 0 {
            return Ok(false);
        }

        let Self { workq, requestq, layout, .. } = self;
        let Some((wu, ranks)) =
            workq.pop_parallel(t, |n| requestq.parallel_workers(t, n, layout))
        else {
            return Ok(false);
        };

        // Everyone in the gang gets the same response and payload,
        // followed by the rank list so they can find each other.
        let mut rank_blob = Vec::with_capacity(ranks.len() * 4);
        for r in &ranks {
            rank_blob.extend_from_slice(&r.to_le_bytes());
        }
        for &r in &ranks {
            self.send_work(r, &wu)?;
            self.comm.send(r, Tag::ResponseGet, &rank_blob)?;
        }
        Ok(true)
    }

    /// After new work arrives outside the put path (stealing), walk the
    /// waiters and dispatch everything that now matches.
    pub(crate) fn recheck_queues(&mut self) -> Result<(), ServerError> {
        for (rank, t) in self.requestq.entries() {
            if let Some(wu) = self.workq.pop(rank, t, &self.layout) {
                self.requestq.remove(rank, &self.layout);
                self.send_work(rank, &wu)?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ServerError> {
        log::debug!("[{}] server down", self.layout.rank);

        // Unblock every worker still parked in get.
        for rank in self.requestq.shutdown_drain(&self.layout) {
            self.comm.send(
                rank,
                Tag::ResponseGet,
                GetResponse::shutdown().as_bytes(),
            )?;
        }

        self.engine.finalize();
        self.workq.finalize();
        self.data.finalize();

        if self.settings.perf_counters_print {
            self.workq.print_counters();
            self.engine.print_counters();
            log::info!(
                "total elapsed: {:.3}s",
                self.start.elapsed().as_secs_f64(),
            );
        }
        Ok(())
    }
}
