/*! Binary semaphore and task mutex.

Both are a cache-padded atomic flag with test-and-set acquisition. The
difference is in how they wait: [`BiSema`] spins with a bounded backoff and
reschedules its worker at most once per millisecond (it exists for hosts that
build fast barriers on dedicated workers, where contention is rare and short);
[`TaskMutex`] yields through the scheduler on every failed attempt. Neither
implements priority inheritance, and a waiter has no timeout.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::task::{self, TaskState};
use crate::worker;

const RESCHED_PERIOD: Duration = Duration::from_millis(1);

/// A binary semaphore, signalled by default.
pub struct BiSema {
    /// true = taken (non-signalled)
    flag: CachePadded<AtomicBool>,
}

impl Default for BiSema {
    fn default() -> Self {
        BiSema::new()
    }
}

impl BiSema {
    pub fn new() -> BiSema {
        BiSema {
            flag: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Wait on the semaphore.
    ///
    /// Spins while it is taken; when a full [`RESCHED_PERIOD`] of wall-clock
    /// waiting has passed, lets another task run on this worker (if called
    /// from a task) before spinning on.
    pub fn wait(&self) {
        let mut since_yield: Option<Instant> = None;
        while self.flag.swap(true, Ordering::Acquire) {
            match since_yield {
                None => since_yield = Some(Instant::now()),
                Some(t0) if t0.elapsed() >= RESCHED_PERIOD => {
                    since_yield = Some(Instant::now());
                    self.resched();
                }
                Some(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Signal the semaphore, releasing one waiter (eventually).
    pub fn signal(&self) {
        self.flag.store(false, Ordering::Release);
    }

    fn resched(&self) {
        match worker::current_task() {
            Some(ct) => {
                debug_assert_eq!(ct.state(), TaskState::Running);
                ct.set_state(TaskState::Ready);
                worker::self_task_yield(&ct);
                ct.stop_running();
                worker::dispatch(&ct);
                ct.start_running();
            }
            // not on a worker: plain OS-level yield
            None => std::thread::yield_now(),
        }
    }
}

/// A mutex for tasks: the loser of the test-and-set is marked Ready and
/// yielded rather than spun.
pub struct TaskMutex {
    flag: CachePadded<AtomicBool>,
}

impl Default for TaskMutex {
    fn default() -> Self {
        TaskMutex::new()
    }
}

impl TaskMutex {
    pub fn new() -> TaskMutex {
        TaskMutex {
            flag: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Acquire; must be called from within a task.
    pub fn enter(&self) {
        debug_assert!(
            task::try_current().is_some(),
            "TaskMutex::enter outside a task"
        );
        while self.flag.swap(true, Ordering::Acquire) {
            /* busy: let another task have the worker */
            task::yield_now();
        }
    }

    /// Release. No ownership tracking; pairing enter/leave correctly is the
    /// caller's contract.
    pub fn leave(&self) {
        self.flag.store(false, Ordering::Release);
    }
}
