//! DECEN pipelines: FIFO delivery, back-pressure, wrappers, termination.

mod common;

use std::sync::mpsc;
use std::sync::Arc;

use task_loom::{runtime, task, Config, Mode, Placement, Stream, Task, TaskHandle};

fn decen_config(num_workers: usize) -> Config {
    Config {
        num_workers,
        ..Config::default()
    }
}

/// A chain of relay tasks between a source and a sink; every hop preserves
/// order, and the terminator drains the whole pipeline.
#[test]
fn relay_chain_preserves_order() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(2)).unwrap();

    const RELAYS: usize = 40;
    let streams: Vec<Arc<Stream<String>>> =
        (0..=RELAYS).map(|_| Stream::create(0)).collect();
    let (done_tx, done_rx) = mpsc::channel::<Vec<String>>();

    let mut handles: Vec<TaskHandle> = Vec::new();

    // source feeds the first stream
    let first = streams[0].clone();
    handles.push(Task::create(
        Placement::Worker(0),
        move || {
            let out = first.open(Mode::Write);
            for msg in ["1\n", "2\n", "T\n"] {
                out.write(msg.to_string());
            }
            out.close(false);
        },
        0,
    ));

    // relays alternate between the two workers
    for i in 0..RELAYS {
        let (sin, sout) = (streams[i].clone(), streams[i + 1].clone());
        handles.push(Task::create(
            Placement::Worker(i % 2),
            move || {
                let inp = sin.open(Mode::Read);
                let out = sout.open(Mode::Write);
                loop {
                    let msg = inp.read();
                    let last = msg == "T\n";
                    out.write(msg);
                    if last {
                        break;
                    }
                }
                inp.close(true);
                out.close(false);
            },
            0,
        ));
    }

    // sink collects everything up to and including the terminator
    let last = streams[RELAYS].clone();
    handles.push(Task::create(
        Placement::Worker(1),
        move || {
            let inp = last.open(Mode::Read);
            let mut seen = Vec::new();
            loop {
                let msg = inp.read();
                let stop = msg == "T\n";
                seen.push(msg);
                if stop {
                    break;
                }
            }
            inp.close(true);
            done_tx.send(seen).unwrap();
        },
        0,
    ));

    for h in &handles {
        h.start();
    }
    runtime::start().unwrap();

    let seen = done_rx.recv().unwrap();
    assert_eq!(seen, vec!["1\n", "2\n", "T\n"]);

    runtime::stop();
    runtime::cleanup();

    // no task left in a non-Zombie state, no leaked stacks
    for h in &handles {
        assert_eq!(h.state(), task_loom::TaskState::Zombie);
    }
}

/// A capacity-1 stream forces strict producer/consumer alternation: the
/// buffer never holds more than one item.
#[test]
fn capacity_one_alternates() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(2)).unwrap();

    let s = Stream::<u64>::create(1);
    let (done_tx, done_rx) = mpsc::channel::<u64>();

    let sp = s.clone();
    let producer = Task::create(
        Placement::Worker(0),
        move || {
            let out = sp.open(Mode::Write);
            for i in 0..100u64 {
                out.write(i);
                assert!(sp.fill_level() <= 1, "capacity-1 stream overfilled");
            }
            out.close(false);
        },
        0,
    );
    let sc = s.clone();
    let consumer = Task::create(
        Placement::Worker(1),
        move || {
            let inp = sc.open(Mode::Read);
            let mut sum = 0;
            for i in 0..100u64 {
                let v = inp.read();
                assert_eq!(v, i);
                sum += v;
            }
            inp.close(true);
            done_tx.send(sum).unwrap();
        },
        0,
    );
    producer.start();
    consumer.start();
    runtime::start().unwrap();

    assert_eq!(done_rx.recv().unwrap(), (0..100).sum::<u64>());
    runtime::stop();
    runtime::cleanup();
}

/// Same-worker producer/consumer pair: the direct (mailbox-free) wake path,
/// plus try_write and peek behaviour against a full/empty stream.
#[test]
fn same_worker_roundtrip_and_try_write() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(1)).unwrap();

    let s = Stream::<u64>::create(4);
    let (done_tx, done_rx) = mpsc::channel::<bool>();

    let sp = s.clone();
    let producer = Task::create(
        Placement::Worker(0),
        move || {
            let out = sp.open(Mode::Write);
            // fill the buffer without blocking
            for i in 0..4u64 {
                out.try_write(i).unwrap();
            }
            // full now: try_write must hand the item back
            assert_eq!(out.try_write(99), Err(99));
            // blocking write parks us until the consumer catches up
            for i in 4..1000u64 {
                out.write(i);
            }
            out.close(false);
        },
        0,
    );
    let sc = s.clone();
    let consumer = Task::create(
        Placement::Worker(0),
        move || {
            let inp = sc.open(Mode::Read);
            assert_eq!(inp.peek(), Some(0));
            for i in 0..1000u64 {
                assert_eq!(inp.read(), i);
            }
            assert_eq!(inp.peek(), None);
            inp.close(true);
            done_tx.send(true).unwrap();
        },
        0,
    );
    producer.start();
    consumer.start();
    runtime::start().unwrap();

    assert!(done_rx.recv().unwrap());
    runtime::stop();
    runtime::cleanup();
}

/// Wrapper tasks run off-worker but speak the same stream protocol.
#[test]
fn wrapper_source_feeds_worker_sink() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(1)).unwrap();

    let s = Stream::<String>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<usize>();

    let sp = s.clone();
    let source = Task::create(
        Placement::Wrapper,
        move || {
            let out = sp.open(Mode::Write);
            for i in 0..64 {
                out.write(format!("{}\n", i));
            }
            out.write("T\n".to_string());
            out.close(false);
        },
        0,
    );
    let sc = s.clone();
    let sink = Task::create(
        Placement::Worker(0),
        move || {
            let inp = sc.open(Mode::Read);
            let mut n = 0;
            while inp.read() != "T\n" {
                n += 1;
            }
            inp.close(true);
            done_tx.send(n).unwrap();
        },
        0,
    );
    source.start();
    sink.start();
    runtime::start().unwrap();

    assert_eq!(done_rx.recv().unwrap(), 64);
    assert!(source.worker_id() < 0, "wrapper ids are negative");
    runtime::stop();
    runtime::cleanup();
}

/// Tiny and zero stack-size requests are clamped, not honoured verbatim.
#[test]
fn stack_sizes_are_clamped() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(1)).unwrap();

    let (done_tx, done_rx) = mpsc::channel::<u32>();
    // 1 byte requested: runs on the minimum stack
    let tiny_tx = done_tx.clone();
    let tiny = Task::create(Placement::Worker(0), move || tiny_tx.send(1).unwrap(), 1);
    // 0 requested: default stack
    let dflt = Task::create(Placement::Worker(0), move || done_tx.send(2).unwrap(), 0);
    tiny.start();
    dflt.start();
    runtime::start().unwrap();

    let mut got = vec![done_rx.recv().unwrap(), done_rx.recv().unwrap()];
    got.sort_unstable();
    assert_eq!(got, vec![1, 2]);
    runtime::stop();
    runtime::cleanup();
}

/// Yielding tasks interleave on one worker instead of running to completion.
#[test]
fn yield_interleaves_tasks() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(1)).unwrap();

    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut handles = Vec::new();
    for id in 0..2u32 {
        let log = log.clone();
        let done_tx = done_tx.clone();
        handles.push(Task::create(
            Placement::Worker(0),
            move || {
                for round in 0..3u32 {
                    log.lock().unwrap().push((id, round));
                    task::yield_now();
                }
                done_tx.send(()).unwrap();
            },
            0,
        ));
    }
    for h in &handles {
        h.start();
    }
    runtime::start().unwrap();
    done_rx.recv().unwrap();
    done_rx.recv().unwrap();

    // one worker, two tasks, FIFO lanes: yields produce strict round-robin
    let log = log.lock().unwrap().clone();
    assert_eq!(log, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]);

    runtime::stop();
    runtime::cleanup();

    // four activations each (three yields plus the exit) left run statistics
    // behind on the handles
    for h in &handles {
        assert!(h.total_run_time() > std::time::Duration::ZERO);
        assert!(h.total_run_time() >= h.last_run_time());
        assert!(h.avg_run_time() > 0.0);
    }
}

/// Scenario: 100 tasks across the workers, a terminator through every
/// pipeline, and a clean join with nothing left running.
#[test]
fn termination_barrier_with_hundred_tasks() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(2)).unwrap();

    const PIPES: usize = 10;
    const STAGES: usize = 10; // 10 x 10 = 100 tasks
    let (done_tx, done_rx) = mpsc::channel::<usize>();
    let mut handles = Vec::new();

    for p in 0..PIPES {
        let streams: Vec<Arc<Stream<String>>> =
            (0..STAGES).map(|_| Stream::create(0)).collect();

        // first stage produces, the rest relay; the last one reports
        let head = streams[0].clone();
        handles.push(Task::create(
            Placement::Worker(p % 2),
            move || {
                let out = head.open(Mode::Write);
                out.write("payload\n".to_string());
                out.write("T\n".to_string());
                out.close(false);
            },
            0,
        ));
        for st in 1..STAGES {
            let sin = streams[st - 1].clone();
            let sout = if st < STAGES - 1 {
                Some(streams[st].clone())
            } else {
                None
            };
            let done_tx = done_tx.clone();
            handles.push(Task::create(
                Placement::Worker((p + st) % 2),
                move || {
                    let inp = sin.open(Mode::Read);
                    let out = sout.as_ref().map(|s| s.open(Mode::Write));
                    let mut items = 0;
                    loop {
                        let msg = inp.read();
                        let last = msg == "T\n";
                        if !last {
                            items += 1;
                        }
                        if let Some(out) = &out {
                            out.write(msg);
                        }
                        if last {
                            break;
                        }
                    }
                    inp.close(true);
                    if let Some(out) = out {
                        out.close(false);
                    } else {
                        done_tx.send(items).unwrap();
                    }
                },
                0,
            ));
        }
    }
    assert_eq!(handles.len(), 100);

    for h in &handles {
        h.start();
    }
    runtime::start().unwrap();

    for _ in 0..PIPES {
        assert_eq!(done_rx.recv().unwrap(), 1);
    }
    runtime::stop();
    runtime::cleanup();

    for h in &handles {
        assert_eq!(h.state(), task_loom::TaskState::Zombie);
    }
}

/// Opening and closing without the destroy flag leaves the stream reusable.
#[test]
fn close_without_destroy_is_idempotent() {
    let _gate = common::runtime_gate();
    runtime::init(decen_config(1)).unwrap();

    let s = Stream::<u64>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let su = s.clone();
    let user = Task::create(
        Placement::Worker(0),
        move || {
            // two open/close rounds against the same stream
            for round in 0..2u64 {
                let out = su.open(Mode::Write);
                out.write(round);
                out.close(false);
                let inp = su.open(Mode::Read);
                assert_eq!(inp.read(), round);
                inp.close(false);
            }
            done_tx.send(()).unwrap();
        },
        0,
    );
    user.start();
    runtime::start().unwrap();
    done_rx.recv().unwrap();
    runtime::stop();
    runtime::cleanup();
}
