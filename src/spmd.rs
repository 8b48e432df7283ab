/*! SPMD rendezvous: run one function on every DECEN worker.

A task calls [`crate::task::enter_spmd`]; the request lands in a global queue
and an `SpmdReq` notice wakes every sleeping worker. At its next scheduling
decision each worker drains the queue: a generation barrier gathers all
workers, everyone runs the function, a second barrier collects them, and the
worker that owns the requesting task makes it ready again. A third barrier
holds the others until the served request has left the queue, so nobody runs
it twice.

Workers never share stack: each runs the function on its own loop context.
The collective is DECEN-only (HRC has no per-worker decision points to hook).
*/

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use log::trace;

use crate::mailbox::WorkerMsg;
use crate::runtime;
use crate::task::{self, Task, TaskState};
use crate::worker;

struct SpmdReq {
    func: Box<dyn Fn() + Send + Sync>,
    task: Arc<Task>,
    from_wid: i32,
}

struct BarrierState {
    arrived: usize,
    phase: u64,
}

pub(crate) struct SpmdRegistry {
    nworkers: usize,
    queue: Mutex<VecDeque<Arc<SpmdReq>>>,
    bar: Mutex<BarrierState>,
    cv: Condvar,
}

impl SpmdRegistry {
    pub fn new(nworkers: usize) -> SpmdRegistry {
        SpmdRegistry {
            nworkers,
            queue: Mutex::new(VecDeque::new()),
            bar: Mutex::new(BarrierState {
                arrived: 0,
                phase: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Generation barrier across all workers.
    fn barrier(&self) {
        let mut st = self.bar.lock().unwrap();
        let phase = st.phase;
        st.arrived += 1;
        if st.arrived == self.nworkers {
            st.arrived = 0;
            st.phase += 1;
            self.cv.notify_all();
        } else {
            while st.phase == phase {
                st = self.cv.wait(st).unwrap();
            }
        }
    }
}

/// File a request and suspend the calling task until every worker ran `f`.
pub(crate) fn request(f: impl Fn() + Send + Sync + 'static) {
    let rt = runtime::get();
    let reg = rt
        .spmd()
        .expect("SPMD collectives only exist on the DECEN backend");
    let ct = task::current_arc();
    assert_eq!(ct.state(), TaskState::Running);
    let wc = ct.worker_ctx().expect("SPMD request from an unowned task");
    assert!(wc.wid >= 0, "SPMD request from a wrapper task");

    reg.queue.lock().unwrap().push_back(Arc::new(SpmdReq {
        func: Box::new(f),
        task: ct.clone(),
        from_wid: wc.wid,
    }));
    // wake sleeping workers; the queue entry does the real work
    worker::broadcast(|| WorkerMsg::SpmdReq(wc.wid));

    ct.set_state(TaskState::Blocked);
    ct.stop_running();
    worker::dispatch(&ct);
    ct.start_running();
}

/// Drain pending requests. Every worker calls this at each scheduling
/// decision point.
pub(crate) fn handle_requests(wid: i32) {
    let rt = runtime::get();
    let Some(reg) = rt.spmd() else { return };

    loop {
        let req = reg.queue.lock().unwrap().front().cloned();
        let Some(req) = req else { break };

        trace!("worker {}: entering spmd for task {}", wid, req.task.uid());
        reg.barrier(); /* start barrier: all workers saw the request */

        (req.func)();

        reg.barrier(); /* stop barrier: all workers are done */

        if wid == req.from_wid {
            reg.queue.lock().unwrap().pop_front();
            // resume the requester; the Wakeup lands in our own mailbox and
            // is fetched with the other pending messages
            worker::task_wakeup(None, &req.task);
        }

        reg.barrier(); /* release: the request is off the queue */
    }
}
