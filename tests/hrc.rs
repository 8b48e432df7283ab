//! The HRC backend: demand-driven scheduling, the negative-demand throttle,
//! static priorities, wrappers against the pool.

mod common;

use std::sync::mpsc;
use std::sync::Arc;

use task_loom::{
    runtime, Backend, Config, Mode, Placement, PrioPolicy, Stream, Task, TaskState,
};

/// Five fast sources feed one slow sink. With the default demand function
/// (`in - out`) and a negative-demand limit, no stream grows past the limit
/// plus the sources' yield granularity, and everything still drains.
#[test]
fn sources_are_throttled_by_negative_demand() {
    let _gate = common::runtime_gate();
    const SOURCES: usize = 5;
    const ITEMS: u64 = 40;
    const LIMIT: i64 = 10;

    runtime::init(Config {
        backend: Backend::Hrc,
        num_workers: 3, // master + 2 pulling workers
        neg_demand_limit: Some(LIMIT),
        ..Config::default()
    })
    .unwrap();

    let streams: Vec<Arc<Stream<(usize, u64)>>> =
        (0..SOURCES).map(|_| Stream::create(0)).collect();
    let (done_tx, done_rx) = mpsc::channel::<(u64, usize)>();

    let mut handles = Vec::new();
    for (src, s) in streams.iter().enumerate() {
        let s = s.clone();
        let h = Task::create(
            Placement::Pool,
            move || {
                let out = s.open(Mode::Write);
                for seq in 0..ITEMS {
                    out.write((src, seq));
                }
                out.close(false);
            },
            0,
        );
        // yield every couple of items so the master gets to re-evaluate us
        h.set_rec_limit(2);
        h.start();
        handles.push(h);
    }

    let sink_streams = streams.clone();
    let sink = Task::create(
        Placement::Pool,
        move || {
            let mut max_fill = 0usize;
            let inputs: Vec<_> = sink_streams.iter().map(|s| s.open(Mode::Read)).collect();
            let mut total = 0u64;
            for (src, inp) in inputs.iter().enumerate() {
                for seq in 0..ITEMS {
                    for s in &sink_streams {
                        max_fill = max_fill.max(s.fill_level());
                    }
                    let (got_src, got_seq) = inp.read();
                    assert_eq!((got_src, got_seq), (src, seq), "per-stream FIFO");
                    total += 1;
                }
            }
            for inp in inputs {
                inp.close(true);
            }
            done_tx.send((total, max_fill)).unwrap();
        },
        0,
    );
    sink.start();
    handles.push(sink);

    runtime::start().unwrap();

    let (total, max_fill) = done_rx.recv().unwrap();
    assert_eq!(total, SOURCES as u64 * ITEMS);
    // limit + one activation's worth of writes + scheduling slack
    assert!(
        max_fill as i64 <= LIMIT + 8,
        "a source outran the negative-demand limit: fill {}",
        max_fill
    );

    runtime::stop();
    runtime::cleanup();
    for h in &handles {
        assert_eq!(h.state(), TaskState::Zombie);
    }
}

/// Static priorities: the master performs no neighbour updates and runs with
/// whatever the host assigned.
#[test]
fn static_priority_pipeline_completes() {
    let _gate = common::runtime_gate();
    runtime::init(Config {
        backend: Backend::Hrc,
        num_workers: 2,
        prio: PrioPolicy::Static,
        ..Config::default()
    })
    .unwrap();

    let s = Stream::<u64>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<u64>();

    let sp = s.clone();
    let producer = Task::create(
        Placement::Pool,
        move || {
            let out = sp.open(Mode::Write);
            for i in 0..256u64 {
                out.write(i);
            }
            out.close(false);
        },
        0,
    );
    producer.set_static_priority(2.0);

    let sc = s.clone();
    let consumer = Task::create(
        Placement::Pool,
        move || {
            let inp = sc.open(Mode::Read);
            let mut sum = 0;
            for i in 0..256u64 {
                let v = inp.read();
                assert_eq!(v, i);
                sum += v;
            }
            inp.close(true);
            done_tx.send(sum).unwrap();
        },
        0,
    );
    consumer.set_static_priority(1.0);

    producer.start();
    consumer.start();
    runtime::start().unwrap();

    assert_eq!(done_rx.recv().unwrap(), (0..256).sum::<u64>());
    runtime::stop();
    runtime::cleanup();
}

/// A wrapper task cooperates with pool tasks: wake-ups to the wrapper go to
/// its own mailbox, wake-ups to pool tasks go through the master.
#[test]
fn wrapper_and_pool_exchange() {
    let _gate = common::runtime_gate();
    runtime::init(Config {
        backend: Backend::Hrc,
        num_workers: 2,
        ..Config::default()
    })
    .unwrap();

    let ping = Stream::<u64>::create(0);
    let pong = Stream::<u64>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<u64>();

    let (ping_w, pong_r) = (ping.clone(), pong.clone());
    let wrapper = Task::create(
        Placement::Wrapper,
        move || {
            let out = ping_w.open(Mode::Write);
            let inp = pong_r.open(Mode::Read);
            let mut acc = 0;
            for i in 0..64u64 {
                out.write(i);
                acc += inp.read(); // blocks on the wrapper's own mailbox
            }
            out.close(false);
            inp.close(true);
            done_tx.send(acc).unwrap();
        },
        0,
    );
    let (ping_r, pong_w) = (ping.clone(), pong.clone());
    let echo = Task::create(
        Placement::Pool,
        move || {
            let inp = ping_r.open(Mode::Read);
            let out = pong_w.open(Mode::Write);
            for _ in 0..64u64 {
                let v = inp.read();
                out.write(v * 2);
            }
            inp.close(true);
            out.close(false);
        },
        0,
    );
    wrapper.start();
    echo.start();
    runtime::start().unwrap();

    assert_eq!(done_rx.recv().unwrap(), (0..64).map(|i| i * 2).sum::<u64>());
    runtime::stop();
    runtime::cleanup();
}

/// Entry/exit marking keeps boundary streams out of the demand tallies, so a
/// relay fed only by an entry stream behaves as an entry task.
#[test]
fn entry_marked_streams_are_not_counted() {
    let _gate = common::runtime_gate();
    runtime::init(Config {
        backend: Backend::Hrc,
        num_workers: 2,
        neg_demand_limit: Some(4),
        ..Config::default()
    })
    .unwrap();

    let boundary = Stream::<u64>::create(0);
    boundary.mark_entry();
    let inner = Stream::<u64>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<u64>();

    let bw = boundary.clone();
    let feeder = Task::create(
        Placement::Pool,
        move || {
            let out = bw.open(Mode::Write);
            for i in 0..32u64 {
                out.write(i);
            }
            out.close(false);
        },
        0,
    );
    // relay's only input is entry-marked: for priority purposes it is a
    // source, and the negative-demand limit applies to its output
    let (br, iw) = (boundary.clone(), inner.clone());
    let relay = Task::create(
        Placement::Pool,
        move || {
            let inp = br.open(Mode::Read);
            let out = iw.open(Mode::Write);
            for _ in 0..32u64 {
                out.write(inp.read());
            }
            inp.close(true);
            out.close(false);
        },
        0,
    );
    relay.set_rec_limit(1);
    let ir = inner.clone();
    let sink = Task::create(
        Placement::Pool,
        move || {
            let inp = ir.open(Mode::Read);
            let mut sum = 0;
            for _ in 0..32u64 {
                sum += inp.read();
            }
            inp.close(true);
            done_tx.send(sum).unwrap();
        },
        0,
    );
    feeder.start();
    relay.start();
    sink.start();
    runtime::start().unwrap();

    assert_eq!(done_rx.recv().unwrap(), (0..32).sum::<u64>());
    runtime::stop();
    runtime::cleanup();
}
