// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixture: an in-process cluster on the loopback fabric, plus a
//! worker-side protocol harness.
//!
//! The servers here are the real thing — `Server::run` on its own
//! thread per server rank. Workers are scripted from test code through
//! [`Worker`], which speaks the wire protocol a real client library
//! would.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use abi::{
    Accuracy, Code, CreateExtras, CreateProps, DataId, DataType, GetHeader,
    GetResponse, Placement, PutHeader, PutResponse, Rank, Refcounts,
    RuleHeader, StoreHeader, Strictness, SubscribeHeader, Tag, RANK_NULL,
};
use comm::loopback::{Endpoint, Fabric};
use comm::Transport;
use server::{Server, ServerConfig, Settings};
use zerocopy::FromBytes;

pub struct Cluster {
    fabric: Arc<Fabric>,
    pub workers: i32,
    pub servers: i32,
    handles: Vec<JoinHandle<i32>>,
}

impl Cluster {
    pub fn start(workers: i32, servers: i32, types: usize) -> Self {
        Self::start_with(workers, servers, types, Vec::new(), |s| {
            // Keep end-of-test quiescence detection snappy.
            s.max_idle = Duration::from_millis(30);
        })
    }

    pub fn start_with(
        workers: i32,
        servers: i32,
        types: usize,
        hostnames: Vec<String>,
        tweak: impl Fn(&mut Settings),
    ) -> Self {
        let size = (workers + servers) as usize;
        let fabric = Fabric::new(size);
        let mut config = ServerConfig::new(servers, types);
        config.hostnames = hostnames;

        let mut handles = Vec::new();
        for rank in workers..workers + servers {
            let ep = fabric.endpoint(rank);
            let config = config.clone();
            let mut settings = Settings::default();
            tweak(&mut settings);
            handles.push(std::thread::spawn(move || {
                Server::new(&ep, &config, settings)
                    .expect("server init")
                    .run()
                    .expect("server run")
            }));
        }

        Self { fabric, workers, servers, handles }
    }

    pub fn worker(&self, rank: Rank) -> Worker {
        assert!(rank < self.workers);
        Worker {
            ep: self.fabric.endpoint(rank),
            workers: self.workers,
            servers: self.servers,
        }
    }

    /// Waits for cluster shutdown and returns every server's exit code.
    pub fn join(self) -> Vec<i32> {
        self.handles
            .into_iter()
            .map(|h| h.join().expect("server thread panicked"))
            .collect()
    }
}

/// What a `get` came back with.
#[derive(Debug, PartialEq, Eq)]
pub enum GetResult {
    Work(GotWork),
    Nothing,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
pub struct GotWork {
    pub work_type: i32,
    pub answer: Rank,
    pub payload: Vec<u8>,
    pub parallelism: i32,
    /// Gang members, for parallel tasks.
    pub ranks: Vec<Rank>,
}

/// A scripted worker rank.
pub struct Worker {
    pub ep: Endpoint,
    workers: i32,
    servers: i32,
}

impl Worker {
    pub fn rank(&self) -> Rank {
        self.ep.rank()
    }

    /// This worker's home server.
    pub fn home(&self) -> Rank {
        self.workers + self.ep.rank() % self.servers
    }

    /// The server storing datum `id`.
    pub fn locate(&self, id: DataId) -> Rank {
        self.workers + id.rem_euclid(self.servers as i64) as i32
    }

    pub fn put(&self, work_type: i32, priority: i32, payload: &[u8]) {
        self.put_opts(work_type, priority, RANK_NULL, 1, payload, true);
    }

    /// Full-control put. Non-inline puts exercise the redirect path.
    pub fn put_opts(
        &self,
        work_type: i32,
        priority: i32,
        target: Rank,
        parallelism: i32,
        payload: &[u8],
        inline: bool,
    ) {
        let dest = if target >= 0 {
            self.workers + target % self.servers
        } else {
            self.home()
        };
        let hdr = PutHeader {
            work_type,
            putter: self.rank(),
            priority,
            answer: self.rank(),
            target,
            strictness: Strictness::Hard,
            accuracy: Accuracy::Rank,
            parallelism,
            length: payload.len() as u32,
            has_inline: inline,
        };
        let msg = if inline {
            abi::encode_with_blob(&hdr, payload)
        } else {
            abi::encode(&hdr)
        };
        self.ep.send(dest, Tag::Put, &msg).unwrap();

        let bytes = self.ep.recv(dest, Tag::ResponsePut).unwrap();
        let resp = PutResponse::read_from_bytes(&bytes).unwrap();
        assert_eq!(resp.code, Code::Success.as_wire(), "put failed");
        if resp.dest != RANK_NULL {
            // Ship the payload where the server told us to.
            self.ep.send(resp.dest, Tag::Work, payload).unwrap();
        }
    }

    pub fn get(&self, work_type: i32) -> GetResult {
        self.get_on(Tag::Get, work_type)
    }

    pub fn iget(&self, work_type: i32) -> GetResult {
        self.get_on(Tag::Iget, work_type)
    }

    fn get_on(&self, tag: Tag, work_type: i32) -> GetResult {
        let home = self.home();
        let hdr = GetHeader { work_type };
        self.ep.send(home, tag, &abi::encode(&hdr)).unwrap();

        let bytes = self.ep.recv(home, Tag::ResponseGet).unwrap();
        let g = GetResponse::read_from_bytes(&bytes).unwrap();
        match Code::from_wire(g.code).unwrap() {
            Code::Success => {}
            Code::Nothing => return GetResult::Nothing,
            Code::Shutdown => return GetResult::Shutdown,
            other => panic!("get returned {other:?}"),
        }

        let payload = self.ep.recv(g.payload_source, Tag::Work).unwrap();
        assert_eq!(payload.len(), g.length as usize);
        let ranks = if g.parallelism > 1 {
            let blob = self.ep.recv(home, Tag::ResponseGet).unwrap();
            blob.chunks_exact(4)
                .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
                .collect()
        } else {
            Vec::new()
        };
        GetResult::Work(GotWork {
            work_type: g.work_type,
            answer: g.answer_rank,
            payload,
            parallelism: g.parallelism,
            ranks,
        })
    }

    pub fn create(&self, dtype: DataType) -> DataId {
        self.create_at(self.home(), dtype)
    }

    pub fn create_at(&self, server: Rank, dtype: DataType) -> DataId {
        self.create_full(server, dtype, CreateProps::default(), CreateExtras::None)
    }

    /// Create with an explicit placement policy; the create enters at
    /// the home server, which applies the policy.
    pub fn create_placed(&self, dtype: DataType, placement: Placement) -> DataId {
        let props = CreateProps { placement, ..CreateProps::default() };
        self.create_full(self.home(), dtype, props, CreateExtras::None)
    }

    pub fn create_container(&self, key: DataType, val: DataType) -> DataId {
        self.create_full(
            self.home(),
            DataType::Container,
            CreateProps::default(),
            CreateExtras::Container { key, val },
        )
    }

    fn create_full(
        &self,
        server: Rank,
        dtype: DataType,
        props: CreateProps,
        extras: CreateExtras,
    ) -> DataId {
        let hdr = abi::CreateHeader {
            id: abi::DATA_ID_NULL,
            dtype,
            props,
            extras,
        };
        self.ep.send(server, Tag::Create, &abi::encode(&hdr)).unwrap();
        let bytes = self.ep.recv(server, Tag::Response).unwrap();
        let (resp, _): (abi::CreateResponse, _) = abi::decode(&bytes).unwrap();
        assert_eq!(resp.code, Code::Success);
        resp.id
    }

    pub fn container_typeof(&self, id: DataId) -> (DataType, DataType) {
        let server = self.locate(id);
        let hdr = abi::TypeofHeader { id };
        self.ep
            .send(server, Tag::ContainerTypeof, &abi::encode(&hdr))
            .unwrap();
        let bytes = self.ep.recv(server, Tag::Response).unwrap();
        let (resp, _): (abi::ContainerTypeofResponse, _) =
            abi::decode(&bytes).unwrap();
        assert_eq!(resp.code, Code::Success);
        (resp.key_type, resp.val_type)
    }

    pub fn store(
        &self,
        id: DataId,
        dtype: DataType,
        value: &[u8],
    ) -> Code {
        let server = self.locate(id);
        let hdr = StoreHeader {
            id,
            sub_len: 0,
            dtype,
            decr: Refcounts::WRITE_ONE,
            store_refs: Refcounts::NONE,
            length: value.len() as u32,
        };
        self.ep
            .send(server, Tag::Store, &abi::encode_with_blob(&hdr, value))
            .unwrap();
        let bytes = self.ep.recv(server, Tag::Response).unwrap();
        let (resp, _): (abi::StoreResponse, _) = abi::decode(&bytes).unwrap();
        resp.code
    }

    pub fn retrieve(&self, id: DataId) -> Result<(DataType, Vec<u8>), Code> {
        let server = self.locate(id);
        let hdr = abi::RetrieveHeader {
            id,
            sub_len: 0,
            decr: Refcounts::NONE,
            acquire: Refcounts::NONE,
        };
        self.ep.send(server, Tag::Retrieve, &abi::encode(&hdr)).unwrap();
        let bytes = self.ep.recv(server, Tag::Response).unwrap();
        let (resp, value): (abi::RetrieveResponse, _) =
            abi::decode(&bytes).unwrap();
        if resp.code != Code::Success {
            return Err(resp.code);
        }
        assert_eq!(value.len(), resp.length as usize);
        Ok((resp.dtype, value.to_vec()))
    }

    pub fn subscribe(
        &self,
        id: DataId,
        work_type: i32,
    ) -> bool {
        let server = self.locate(id);
        let hdr = SubscribeHeader { id, sub_len: 0, work_type };
        self.ep.send(server, Tag::Subscribe, &abi::encode(&hdr)).unwrap();
        let bytes = self.ep.recv(server, Tag::Response).unwrap();
        let (resp, _): (abi::SubscribeResponse, _) =
            abi::decode(&bytes).unwrap();
        assert_eq!(resp.code, Code::Success);
        resp.subscribed
    }

    /// Submits a data-dependent task waiting on whole-datum inputs.
    pub fn rule(
        &self,
        input_ids: &[DataId],
        work_type: i32,
        priority: i32,
        payload: &[u8],
    ) -> bool {
        let hdr = RuleHeader {
            name_len: 0,
            n_ids: input_ids.len() as u32,
            n_id_subs: 0,
            work_type,
            priority,
            answer: self.rank(),
            target: RANK_NULL,
            strictness: Strictness::Hard,
            accuracy: Accuracy::Rank,
            parallelism: 1,
            length: payload.len() as u32,
        };
        let mut blob = Vec::new();
        for id in input_ids {
            abi::pack_id(&mut blob, *id);
        }
        blob.extend_from_slice(payload);
        self.ep
            .send(self.home(), Tag::Rule, &abi::encode_with_blob(&hdr, &blob))
            .unwrap();
        let bytes = self.ep.recv(self.home(), Tag::Response).unwrap();
        let (resp, _): (abi::RuleResponse, _) = abi::decode(&bytes).unwrap();
        assert_eq!(resp.code, Code::Success);
        resp.ready
    }

    /// Announces that this worker is done; it will issue no further
    /// RPCs.
    pub fn shutdown(&self) {
        self.ep.send(self.home(), Tag::ShutdownWorker, &[]).unwrap();
    }
}
