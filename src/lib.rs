/*!
A cooperative task runtime for stream-dataflow programs: thousands of
fine-grained coroutine tasks are multiplexed over a small pool of worker
threads pinned to CPU cores, and communicate exclusively through bounded
single-producer/single-consumer streams.

The intended use-case for this library is pretty specific:

* Your program is a graph of pipelines (sources, relays, sinks) with far
  more stages than cores.
* Stages block *only* on their streams; back-pressure and wake-up should fall
  out of stream reads and writes, not out of locks and condvars.
* You want to choose between fully distributed scheduling (every worker owns
  its ready queue) and demand-driven central scheduling (one master orders
  all tasks by how much input they have waiting), without rewriting the
  pipeline.

If that is not your situation, a general-purpose async runtime will serve you
better. If it is, usage looks like this:

```
use std::sync::mpsc;
use task_loom::{runtime, Config, Mode, Placement, Stream, Task};

let mut cfg = Config::default();
cfg.num_workers = 2;
runtime::init(cfg).unwrap();

// Host wiring happens between init and start.
let s = Stream::<String>::create(0); // 0 = default capacity (16)
let (done_tx, done_rx) = mpsc::channel();

let producer = Task::create(
    Placement::Worker(0),
    {
        let s = s.clone();
        move || {
            let out = s.open(Mode::Write);
            out.write("ping".to_string()); // blocks when the stream is full
            out.close(false);
        }
    },
    0, // 0 = default stack size
);
let consumer = Task::create(
    Placement::Worker(1),
    {
        let s = s.clone();
        move || {
            let inp = s.open(Mode::Read);
            assert_eq!(inp.read(), "ping"); // blocks while the stream is empty
            inp.close(true); // last one out destroys the stream
            done_tx.send(()).unwrap();
        }
    },
    0,
);
producer.start();
consumer.start();

runtime::start().unwrap();
done_rx.recv().unwrap();
runtime::stop();
runtime::cleanup();
```

## Design

A *task* is a stackful coroutine: its own page-aligned stack plus a
callee-saved register save area, switched with a dozen instructions of inline
asm. Tasks are never preempted; they run until a stream read/write cannot
proceed, an explicit [`task::yield_now`], or exit. Every suspension point
funnels through the owning worker's dispatcher, which switches straight into
the next ready task when there is one, so the common handover costs a single
context switch.

A *stream* couples exactly one producer to exactly one consumer through a
circular buffer gated by two signed atomic semaphores; the semaphore dropping
below zero encodes "my peer is blocked in here and must be woken". Same-worker
wake-ups are a direct ready-queue insertion; cross-worker wake-ups travel as
mailbox messages to the worker that owns the sleeper. A consumer can also
[`poll`](StreamSet::poll) a whole set of streams; a token on the task
arbitrates the producers so exactly one of them performs the wake-up.

Two scheduling dialects share all of that machinery ([`Backend`]):

* **DECEN**: every worker owns a two-lane FIFO scheduler and decides alone.
  Optional cooperative migration policies (and a placement scheduler task)
  rebalance tasks between workers.
* **HRC**: `num_workers - 1` workers pull tasks from a single master thread
  that keeps all ready tasks in one priority heap, ordered by pluggable
  demand functions (default: items pending on inputs minus items pending on
  outputs). HRC streams are unbounded; over-producing sources are parked by
  the negative-demand limit instead of blocking.

Monitoring is a table of optional callbacks ([`MonitoringCallbacks`]) stamped
in at init; with no observers installed the hot paths pay one branch per
event.

## Portability

Unix on x86-64 and AArch64 only, due to the hand-rolled context switch.
Thread pinning is Linux-only and degrades to a no-op elsewhere.
*/

pub mod config;
pub mod migration;
pub mod monitor;
pub mod runtime;
pub mod sema;
pub mod stream;
pub mod streamset;
pub mod task;
pub mod timing;

mod buffer;
mod hrc;
mod mailbox;
mod mctx;
mod spmd;
mod taskqueue;
mod worker;

pub use config::{Backend, Config, ConfigError, ConfigFlags, PrioPolicy};
pub use mctx::{STACK_DEFAULT, STACK_MIN};
pub use migration::{MigrationConfig, MigrationPolicy};
pub use monitor::{MonHandle, MonitoringCallbacks};
pub use sema::{BiSema, TaskMutex};
pub use stream::{Mode, Stream, StreamDesc, DEFAULT_CAPACITY};
pub use streamset::{StreamIter, StreamSet};
pub use task::{Placement, Task, TaskHandle, TaskState};
pub use taskqueue::SCHED_NUM_PRIO;
