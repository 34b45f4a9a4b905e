// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios: real server loops on threads, scripted workers
//! over the loopback fabric.

mod common;

use std::collections::HashSet;

use abi::{Code, DataType};
use common::{Cluster, GetResult};

/// One server, two workers: a blocked `get` is answered directly by a
/// later `put`, with the payload redirected putter-to-getter.
#[test]
fn put_meets_waiting_get() {
    let cluster = Cluster::start(2, 1, 2);
    let w0 = cluster.worker(0);
    let w1 = cluster.worker(1);

    let getter = std::thread::spawn(move || w1.get(0));

    // Give the getter time to park so the redirect path is exercised.
    std::thread::sleep(std::time::Duration::from_millis(20));
    w0.put_opts(0, 7, abi::RANK_NULL, 1, b"hello", false);

    let got = match getter.join().unwrap() {
        GetResult::Work(w) => w,
        other => panic!("expected work, got {other:?}"),
    };
    assert_eq!(got.payload, b"hello");
    assert_eq!(got.work_type, 0);
    assert_eq!(got.answer, 0);

    w0.shutdown();
    cluster.worker(1).shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// Two servers: a put hard-targeted at a worker on the other server is
/// routed to that worker's home and dispatched only to it.
#[test]
fn targeted_put_crosses_servers() {
    let cluster = Cluster::start(4, 2, 1);
    let w3 = cluster.worker(3);
    let getter = std::thread::spawn(move || w3.get(0));
    // Workers 1 and 2 also wait; they must not receive the targeted
    // task.
    let w1 = cluster.worker(1);
    let bystander1 = std::thread::spawn(move || w1.get(0));
    let w2 = cluster.worker(2);
    let bystander2 = std::thread::spawn(move || w2.get(0));

    std::thread::sleep(std::time::Duration::from_millis(20));
    let w0 = cluster.worker(0);
    w0.put_opts(0, 0, 3, 1, b"x", false);

    let got = match getter.join().unwrap() {
        GetResult::Work(w) => w,
        other => panic!("expected work, got {other:?}"),
    };
    assert_eq!(got.payload, b"x");

    w0.shutdown();
    cluster.worker(3).shutdown();
    // The bystanders are released by shutdown, not by the task.
    assert_eq!(bystander1.join().unwrap(), GetResult::Shutdown);
    assert_eq!(bystander2.join().unwrap(), GetResult::Shutdown);
    assert_eq!(cluster.join(), [0, 0]);
}

/// Data-dependency release: a rule waiting on a datum runs exactly once
/// when the datum closes, and a subscriber of a second datum sees its
/// close notification exactly once.
#[test]
fn rule_releases_on_close() {
    let cluster = Cluster::start(2, 1, 2);
    let w0 = cluster.worker(0);
    let w1 = cluster.worker(1);

    let a = w0.create(DataType::Integer);
    let b = w0.create(DataType::Integer);

    // The rule's task is not ready while A is open.
    let ready = w0.rule(&[a], 0, 5, b"run");
    assert!(!ready);
    assert_eq!(w0.iget(0), GetResult::Nothing);

    // W1 watches B on the control type (1).
    assert!(w1.subscribe(b, 1));

    // Storing A closes it and releases the rule's task.
    assert_eq!(w1.store(a, DataType::Integer, &abi::integer_bytes(42)), Code::Success);

    let got = match w0.get(0) {
        GetResult::Work(w) => w,
        other => panic!("expected released task, got {other:?}"),
    };
    assert_eq!(got.payload, b"run");

    // The task's job: store 99 into B. That closes B and must notify
    // W1 through an ordinary targeted control task.
    assert_eq!(w0.store(b, DataType::Integer, &abi::integer_bytes(99)), Code::Success);
    let notif = match w1.get(1) {
        GetResult::Work(w) => w,
        other => panic!("expected close notification, got {other:?}"),
    };
    let (closed_id, sub) = abi::parse_notify_payload(&notif.payload).unwrap();
    assert_eq!(closed_id, b);
    assert_eq!(sub, None);
    assert_eq!(
        abi::integer_from_bytes(&w1.retrieve(b).unwrap().1),
        Some(99),
    );

    // A rule whose input is already closed is ready immediately, and a
    // re-subscription after close reports so.
    assert!(w0.rule(&[a], 0, 5, b"again"));
    assert!(!w1.subscribe(b, 1));
    match w0.get(0) {
        GetResult::Work(w) => assert_eq!(w.payload, b"again"),
        other => panic!("expected immediate task, got {other:?}"),
    }

    w0.shutdown();
    w1.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// A rule whose input lives on a different server: the submitting
/// server subscribes across the cluster, and the close comes back
/// through the sync'd notify path.
#[test]
fn cross_server_dependency() {
    let cluster = Cluster::start(4, 2, 1);
    let w0 = cluster.worker(0); // home = server 4
    let w1 = cluster.worker(1); // home = server 5

    // The datum lives on server 4; the rule waits on server 5.
    let id = w1.create_at(4, DataType::Integer);
    assert_eq!(w1.locate(id), 4);
    assert!(!w1.rule(&[id], 0, 0, b"dependent"));

    let getter = std::thread::spawn(move || w1.get(0));
    std::thread::sleep(std::time::Duration::from_millis(20));

    // Closing the datum on server 4 must release the task on server 5.
    assert_eq!(
        w0.store(id, DataType::Integer, &abi::integer_bytes(1)),
        Code::Success,
    );
    match getter.join().unwrap() {
        GetResult::Work(got) => assert_eq!(got.payload, b"dependent"),
        other => panic!("expected released task, got {other:?}"),
    }

    w0.shutdown();
    cluster.worker(1).shutdown();
    for rank in [2, 3] {
        let w = cluster.worker(rank);
        std::thread::spawn(move || w.get(0));
    }
    assert_eq!(cluster.join(), [0, 0]);
}

/// Work stealing: tasks queued on one server reach workers homed on the
/// other, each exactly once.
#[test]
fn steal_redistributes_work() {
    const TASKS: usize = 100;
    let cluster = Cluster::start(4, 2, 1);

    // Workers 1-3 drain until shutdown. Workers 1 and 3 are homed on
    // the non-master server, which never receives a put: stealing is
    // the only way work can reach them.
    let mut consumers = Vec::new();
    for rank in 1..4 {
        let w = cluster.worker(rank);
        consumers.push(std::thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match w.get(0) {
                    GetResult::Work(got) => {
                        seen.push(String::from_utf8(got.payload).unwrap());
                    }
                    GetResult::Shutdown => return seen,
                    GetResult::Nothing => unreachable!("blocking get"),
                }
            }
        }));
    }
    std::thread::sleep(std::time::Duration::from_millis(10));

    // Worker 0 floods its home server (the master) with untargeted
    // tasks, then bows out.
    let w0 = cluster.worker(0);
    for i in 0..TASKS {
        w0.put(0, 0, format!("task-{i}").as_bytes());
    }
    w0.shutdown();

    let per_worker: Vec<Vec<String>> =
        consumers.into_iter().map(|c| c.join().unwrap()).collect();
    assert_eq!(cluster.join(), [0, 0]);

    // Every task ran exactly once.
    let all: Vec<&String> = per_worker.iter().flatten().collect();
    assert_eq!(all.len(), TASKS, "lost or duplicated tasks");
    let unique: HashSet<&String> = all.iter().copied().collect();
    assert_eq!(unique.len(), TASKS);

    // And stealing actually moved work to the other server's workers.
    let other_side = per_worker[0].len() + per_worker[2].len();
    assert!(other_side > 0, "no tasks were stolen");
}

/// Random placement rotates creates across the servers; the datum lives
/// (and is fully usable) wherever its create landed.
#[test]
fn random_placement_rotates_servers() {
    let cluster = Cluster::start(2, 2, 1);
    let w0 = cluster.worker(0);

    let ids: Vec<_> = (0..6)
        .map(|_| w0.create_placed(DataType::Integer, abi::Placement::Random))
        .collect();
    let homes: HashSet<abi::Rank> =
        ids.iter().map(|id| w0.locate(*id)).collect();
    assert_eq!(homes.len(), 2, "rotation never left the first server");

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(
            w0.store(*id, DataType::Integer, &abi::integer_bytes(i as i64)),
            Code::Success,
        );
        assert_eq!(
            abi::integer_from_bytes(&w0.retrieve(*id).unwrap().1),
            Some(i as i64),
        );
    }

    w0.shutdown();
    cluster.worker(1).shutdown();
    assert_eq!(cluster.join(), [0, 0]);
}

/// Workers can read back a container's full typing: subscript key type
/// and member value type.
#[test]
fn container_typing_round_trip() {
    let cluster = Cluster::start(1, 1, 1);
    let w = cluster.worker(0);

    let id = w.create_container(DataType::Str, DataType::Integer);
    assert_eq!(w.container_typeof(id), (DataType::Str, DataType::Integer));

    w.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// Set-once: of two stores to one datum, the first wins and the second
/// is rejected.
#[test]
fn double_store_rejected() {
    let cluster = Cluster::start(2, 1, 1);
    let w0 = cluster.worker(0);
    let w1 = cluster.worker(1);

    let id = w0.create(DataType::Integer);
    assert_eq!(
        w0.store(id, DataType::Integer, &abi::integer_bytes(1)),
        Code::Success,
    );
    assert_eq!(
        w1.store(id, DataType::Integer, &abi::integer_bytes(2)),
        Code::Rejected,
    );
    assert_eq!(
        abi::integer_from_bytes(&w0.retrieve(id).unwrap().1),
        Some(1),
    );

    w0.shutdown();
    w1.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// Quiescence: workers blocked in `get` with no work anywhere are all
/// released by the idle-driven shutdown, and every server exits
/// cleanly.
#[test]
fn idle_cluster_shuts_down() {
    let cluster = Cluster::start(4, 2, 1);
    let mut getters = Vec::new();
    for rank in 0..4 {
        let w = cluster.worker(rank);
        getters.push(std::thread::spawn(move || w.get(0)));
    }
    for g in getters {
        assert_eq!(g.join().unwrap(), GetResult::Shutdown);
    }
    assert_eq!(cluster.join(), [0, 0]);
}

/// Scalar round trip: stored bytes come back exactly, for every scalar
/// type.
#[test]
fn scalar_round_trips() {
    let cluster = Cluster::start(1, 1, 1);
    let w = cluster.worker(0);

    let i = w.create(DataType::Integer);
    w.store(i, DataType::Integer, &abi::integer_bytes(-7));
    assert_eq!(
        w.retrieve(i).unwrap(),
        (DataType::Integer, abi::integer_bytes(-7).to_vec()),
    );

    let f = w.create(DataType::Float);
    w.store(f, DataType::Float, &abi::float_bytes(2.5));
    assert_eq!(abi::float_from_bytes(&w.retrieve(f).unwrap().1), Some(2.5));

    let s = w.create(DataType::Str);
    w.store(s, DataType::Str, b"swift");
    assert_eq!(w.retrieve(s).unwrap().1, b"swift");

    let blob = w.create(DataType::Blob);
    w.store(blob, DataType::Blob, &[0, 1, 2, 255]);
    assert_eq!(w.retrieve(blob).unwrap().1, [0, 1, 2, 255]);

    w.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// Zero-length payloads are legal, inline.
#[test]
fn zero_length_payload() {
    let cluster = Cluster::start(2, 1, 1);
    let w0 = cluster.worker(0);
    w0.put(0, 0, b"");

    let w1 = cluster.worker(1);
    match w1.get(0) {
        GetResult::Work(got) => assert!(got.payload.is_empty()),
        other => panic!("expected empty task, got {other:?}"),
    }

    w0.shutdown();
    w1.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// `iget` never parks: it reports `Nothing` on an empty queue and keeps
/// the worker free to do something else.
#[test]
fn iget_does_not_block() {
    let cluster = Cluster::start(1, 1, 1);
    let w = cluster.worker(0);

    assert_eq!(w.iget(0), GetResult::Nothing);
    w.put(0, 0, b"x");
    match w.iget(0) {
        GetResult::Work(got) => assert_eq!(got.payload, b"x"),
        other => panic!("expected work, got {other:?}"),
    }
    assert_eq!(w.iget(0), GetResult::Nothing);

    w.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// Priority order is respected for a single waiter: the higher-priority
/// task dispatches first.
#[test]
fn priority_dispatch_order() {
    let cluster = Cluster::start(1, 1, 1);
    let w = cluster.worker(0);

    w.put(0, 1, b"low");
    w.put(0, 9, b"high");

    match w.get(0) {
        GetResult::Work(got) => assert_eq!(got.payload, b"high"),
        other => panic!("{other:?}"),
    }
    match w.get(0) {
        GetResult::Work(got) => assert_eq!(got.payload, b"low"),
        other => panic!("{other:?}"),
    }

    w.shutdown();
    assert_eq!(cluster.join(), [0]);
}

/// A parallel task waits for a full gang, then dispatches to all of its
/// members with the rank list.
#[test]
fn parallel_gang_dispatch() {
    let cluster = Cluster::start(3, 1, 1);

    // A gang of three can't form from two waiters.
    let w0 = cluster.worker(0);
    w0.put_opts(0, 0, abi::RANK_NULL, 3, b"gang", true);

    let mut members = Vec::new();
    for rank in 0..3 {
        let w = cluster.worker(rank);
        members.push(std::thread::spawn(move || w.get(0)));
    }

    let mut gangs = Vec::new();
    for m in members {
        match m.join().unwrap() {
            GetResult::Work(got) => {
                assert_eq!(got.payload, b"gang");
                assert_eq!(got.parallelism, 3);
                let mut ranks = got.ranks.clone();
                ranks.sort_unstable();
                gangs.push(ranks);
            }
            other => panic!("expected gang work, got {other:?}"),
        }
    }
    // Everyone saw the same gang.
    assert_eq!(gangs[0], vec![0, 1, 2]);
    assert_eq!(gangs[0], gangs[1]);
    assert_eq!(gangs[1], gangs[2]);

    for rank in 0..3 {
        cluster.worker(rank).shutdown();
    }
    assert_eq!(cluster.join(), [0]);
}
