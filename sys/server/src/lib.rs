// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The server-side engine of a distributed, load-balanced task system.
//!
//! A cluster is a set of processes partitioned into workers and servers.
//! Each server owns four tightly coupled subsystems:
//!
//! - the **work queue** ([`workqueue`]): priority-ordered storage for
//!   targeted, untargeted, and parallel tasks;
//! - the **request queue** ([`requestqueue`]): the registry of idle
//!   workers, matched against incoming tasks;
//! - the **data store** ([`datastore`]) and **dependency engine**
//!   ([`engine`]): a small distributed store of typed, set-once data items
//!   whose closure releases data-dependent tasks;
//! - the **control loop** ([`server`]): RPC dispatch interleaved with
//!   peer synchronization ([`sync`]), work stealing ([`steal`]), and
//!   cluster-wide idle detection.
//!
//! The engine is a library: it speaks to the rest of the cluster through
//! the [`comm::Transport`] contract and is embedded in whatever host
//! runtime owns the processes. There is exactly one event-loop thread per
//! server and no intra-process concurrency; everything here is owned by
//! [`server::Server`] and accessed without locks.

pub mod backoffs;
pub mod datastore;
pub mod engine;
pub mod handlers;
pub mod layout;
pub mod notifications;
pub mod requestqueue;
pub mod server;
pub mod settings;
pub mod steal;
pub mod sync;
pub mod workqueue;

pub use server::{run_server, Server, ServerError};
pub use settings::Settings;

use abi::DataType;

/// One field of a registered struct type.
#[derive(Clone, Debug)]
pub struct StructField {
    pub name: String,
    pub dtype: DataType,
    /// For `DataType::Struct` fields, the nested struct type.
    pub struct_type: Option<u32>,
}

/// A struct type, registered cluster-wide at startup. Struct datum
/// subscripts are `.`-separated field-index paths into these.
#[derive(Clone, Debug)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

/// Startup configuration, identical on every server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Number of server ranks (the tail of the rank space).
    pub servers: i32,
    /// Number of task types; every task type is in `[0, types)`.
    pub types: usize,
    /// Hostname per world rank, for node-accuracy targeting. Empty means
    /// "everything on one host".
    pub hostnames: Vec<String>,
    /// Struct types, indexed by the id used in create requests.
    pub struct_types: Vec<StructType>,
    /// Memory budget advertised to steal victims.
    pub max_memory: i64,
}

impl ServerConfig {
    pub fn new(servers: i32, types: usize) -> Self {
        Self {
            servers,
            types,
            hostnames: Vec::new(),
            struct_types: Vec::new(),
            max_memory: 10 * 1024 * 1024,
        }
    }
}
