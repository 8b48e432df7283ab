//! Multi-stream poll: a router spreads keyed messages over 40 branch
//! streams plus a control branch; a single consumer polls them all.

mod common;

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use task_loom::{runtime, Config, Mode, Placement, Stream, StreamSet, Task};

const BRANCHES: usize = 41; // branch 0 is the control/terminator branch

#[test]
fn poll_returns_the_branch_that_delivered() {
    let _gate = common::runtime_gate();
    runtime::init(Config {
        num_workers: 2,
        ..Config::default()
    })
    .unwrap();

    let input = Stream::<String>::create(0);
    let branches: Vec<Arc<Stream<String>>> =
        (0..BRANCHES).map(|_| Stream::create(0)).collect();
    let (done_tx, done_rx) = mpsc::channel::<(usize, usize)>();

    // source: "1\n" .. "40\n", then the terminator
    let sin = input.clone();
    let source = Task::create(
        Placement::Worker(0),
        move || {
            let out = sin.open(Mode::Write);
            for k in 1..BRANCHES {
                out.write(format!("{}\n", k));
            }
            out.write("T\n".to_string());
            out.close(false);
        },
        0,
    );

    // router: keyed on the ASCII integer in the message; the terminator goes
    // out on every branch
    let rin = input.clone();
    let rbranches = branches.clone();
    let router = Task::create(
        Placement::Worker(0),
        move || {
            let inp = rin.open(Mode::Read);
            let outs: Vec<_> = rbranches.iter().map(|s| s.open(Mode::Write)).collect();
            loop {
                let msg = inp.read();
                if msg == "T\n" {
                    for out in &outs {
                        out.write("T\n".to_string());
                    }
                    break;
                }
                let k: usize = msg.trim().parse().expect("router got a non-integer");
                outs[k].write(msg);
            }
            inp.close(true);
            for out in outs {
                out.close(false);
            }
        },
        0,
    );

    // poller: one task, 41 input streams in a set
    let pbranches = branches.clone();
    let poller = Task::create(
        Placement::Worker(1),
        move || {
            let mut set = StreamSet::new();
            let mut branch_of: HashMap<u32, usize> = HashMap::new();
            for (idx, s) in pbranches.iter().enumerate() {
                let sd = s.open(Mode::Read);
                branch_of.insert(sd.stream_id(), idx);
                set.put(sd);
            }
            let mut data_seen = 0usize;
            let mut terms_seen = 0usize;
            while terms_seen < BRANCHES {
                let sd = set.poll();
                let branch = branch_of[&sd.stream_id()];
                let msg = sd.read();
                if msg == "T\n" {
                    terms_seen += 1;
                    set.remove(&sd);
                    sd.close(true);
                } else {
                    // content routing must match the branch it arrived on
                    let k: usize = msg.trim().parse().unwrap();
                    assert_eq!(k, branch, "message {:?} on branch {}", msg, branch);
                    data_seen += 1;
                }
            }
            assert!(set.is_empty());
            done_tx.send((data_seen, terms_seen)).unwrap();
        },
        0,
    );

    source.start();
    router.start();
    poller.start();
    runtime::start().unwrap();

    let (data, terms) = done_rx.recv().unwrap();
    assert_eq!(data, BRANCHES - 1);
    assert_eq!(terms, BRANCHES);

    runtime::stop();
    runtime::cleanup();
}

/// The hook rotation: after a poll delivered from branch `k`, the next scan
/// starts after `k`, so a hot branch cannot monopolise the consumer.
#[test]
fn poll_rotates_past_the_delivering_stream() {
    let _gate = common::runtime_gate();
    runtime::init(Config {
        num_workers: 1,
        ..Config::default()
    })
    .unwrap();

    let a = Stream::<u32>::create(0);
    let b = Stream::<u32>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<Vec<u32>>();

    // One worker, assignment order producer-a, producer-b, poller: both
    // streams are saturated before the first poll, so the outcome is exact.
    for (base, s) in [(10u32, a.clone()), (20u32, b.clone())] {
        let t = Task::create(
            Placement::Worker(0),
            move || {
                let out = s.open(Mode::Write);
                for n in 0..8 {
                    out.write(base + n);
                }
                out.close(false);
            },
            0,
        );
        t.start();
    }

    let (pa, pb) = (a.clone(), b.clone());
    let poller = Task::create(
        Placement::Worker(0),
        move || {
            let mut set = StreamSet::new();
            set.put(pa.open(Mode::Read));
            set.put(pb.open(Mode::Read));
            let mut order = Vec::new();
            for _ in 0..16 {
                let sd = set.poll();
                order.push(sd.read());
            }
            done_tx.send(order).unwrap();
        },
        0,
    );
    poller.start();
    runtime::start().unwrap();

    let order = done_rx.recv().unwrap();
    // rotation after every delivery forces strict alternation
    let expect: Vec<u32> = (0..8).flat_map(|n| [10 + n, 20 + n]).collect();
    assert_eq!(order, expect);

    runtime::stop();
    runtime::cleanup();
}
