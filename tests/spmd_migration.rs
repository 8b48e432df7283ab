//! The SPMD collective and the cooperative migration policies (DECEN).

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use task_loom::{
    migration, runtime, task, Config, MigrationConfig, MigrationPolicy, Mode, Placement, Stream,
    Task,
};

/// `enter_spmd` runs the function once per worker and only then resumes the
/// requesting task.
#[test]
fn spmd_runs_on_every_worker() {
    let _gate = common::runtime_gate();
    migration::init(MigrationConfig {
        policy: MigrationPolicy::Disabled,
    });
    const WORKERS: usize = 3;
    runtime::init(Config {
        num_workers: WORKERS,
        ..Config::default()
    })
    .unwrap();

    let (done_tx, done_rx) = mpsc::channel::<(usize, usize)>();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = hits.clone();
    let requester = Task::create(
        Placement::Worker(0),
        move || {
            let h1 = task_hits.clone();
            task::enter_spmd(move || {
                h1.fetch_add(1, Ordering::SeqCst);
            });
            let after_first = task_hits.load(Ordering::SeqCst);

            // a second rendezvous from the same task
            let h2 = task_hits.clone();
            task::enter_spmd(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            });
            let after_second = task_hits.load(Ordering::SeqCst);

            done_tx.send((after_first, after_second)).unwrap();
        },
        0,
    );
    requester.start();
    runtime::start().unwrap();

    let (first, second) = done_rx.recv().unwrap();
    assert_eq!(first, WORKERS, "all workers entered the first collective");
    assert_eq!(second, 2 * WORKERS, "and the second one");

    runtime::stop();
    runtime::cleanup();
}

/// A pipeline with RANDOM migration enabled: relays hop between workers at
/// their checkpoints, and delivery order still holds.
#[test]
fn random_migration_preserves_order() {
    let _gate = common::runtime_gate();
    migration::init(MigrationConfig {
        policy: MigrationPolicy::Random { threshold: 0.5 },
    });
    runtime::init(Config {
        num_workers: 2,
        ..Config::default()
    })
    .unwrap();

    const ITEMS: u64 = 200;
    let a = Stream::<u64>::create(0);
    let b = Stream::<u64>::create(0);
    let (done_tx, done_rx) = mpsc::channel::<Vec<u64>>();

    let sa = a.clone();
    let source = Task::create(
        Placement::Worker(0),
        move || {
            let out = sa.open(Mode::Write);
            for i in 0..ITEMS {
                out.write(i);
            }
            out.close(false);
        },
        0,
    );
    let (ra, wb) = (a.clone(), b.clone());
    let relay = Task::create(
        Placement::Worker(0),
        move || {
            let inp = ra.open(Mode::Read);
            let out = wb.open(Mode::Write);
            for _ in 0..ITEMS {
                let v = inp.read();
                out.write(v);
                // the host-driven migration checkpoint
                task::check_migrate();
            }
            inp.close(true);
            out.close(false);
        },
        0,
    );
    let rb = b.clone();
    let sink = Task::create(
        Placement::Worker(1),
        move || {
            let inp = rb.open(Mode::Read);
            let got: Vec<u64> = (0..ITEMS).map(|_| inp.read()).collect();
            inp.close(true);
            done_tx.send(got).unwrap();
        },
        0,
    );
    source.start();
    relay.start();
    sink.start();
    runtime::start().unwrap();

    let got = done_rx.recv().unwrap();
    assert_eq!(got, (0..ITEMS).collect::<Vec<_>>());

    runtime::stop();
    runtime::cleanup();
    // migration must leave the policy global clean for other binaries
    migration::init(MigrationConfig {
        policy: MigrationPolicy::Disabled,
    });
}
