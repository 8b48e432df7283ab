/*! Ready queues for the DECEN scheduler.

Every DECEN worker owns a [`SchedCtx`]: one FIFO lane per priority level
(`SCHED_NUM_PRIO` lanes; task priorities clamp into range). Pushes go to the
tail, pops come from the head of the highest non-empty lane. Each lane carries
its own mutex: the owning worker is the only pusher/popper, but the placement
scheduler walks the lanes from outside.
*/

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::task::Task;

/// Number of priority lanes in a DECEN scheduler.
pub const SCHED_NUM_PRIO: usize = 2;

/// A single FIFO of ready tasks.
pub(crate) struct TaskQueue {
    inner: Mutex<VecDeque<Arc<Task>>>,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, t: Arc<Task>) {
        self.inner.lock().unwrap().push_back(t);
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Call `f` on every queued task, front to back.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Task>)) {
        for t in self.inner.lock().unwrap().iter() {
            f(t);
        }
    }
}

/// Per-worker DECEN scheduler context.
pub(crate) struct SchedCtx {
    lanes: [TaskQueue; SCHED_NUM_PRIO],
}

impl SchedCtx {
    pub fn new() -> SchedCtx {
        SchedCtx {
            lanes: std::array::from_fn(|_| TaskQueue::new()),
        }
    }

    /// Insert a ready task into the lane selected by its priority.
    pub fn make_ready(&self, t: Arc<Task>) {
        let prio = t.lane_priority().clamp(0, SCHED_NUM_PRIO as i32 - 1) as usize;
        self.lanes[prio].push(t);
    }

    /// Pop the next ready task, highest lane first.
    pub fn fetch_ready(&self) -> Option<Arc<Task>> {
        for lane in self.lanes.iter().rev() {
            if let Some(t) = lane.pop() {
                return Some(t);
            }
        }
        None
    }

    pub fn ready_count(&self) -> usize {
        self.lanes.iter().map(|l| l.len()).sum()
    }

    /// Walk all queued tasks (placement scheduler).
    pub fn for_each_ready(&self, mut f: impl FnMut(&Arc<Task>)) {
        for lane in &self.lanes {
            lane.for_each(&mut f);
        }
    }
}
