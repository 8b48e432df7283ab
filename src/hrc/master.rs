/*! The HRC master: sole owner of the ready heap.

The master thread sits in a receive loop on its mailbox. Workers never touch
the heap: they `Request` work and `Return` suspended tasks; stream wake-ups
arrive as `Wakeup`. Confinement to one thread is what makes the heap and the
waiting-worker table lock-free.

The delicate case is a `Wakeup` racing the `Return` of the task it concerns:
the waking side posts to the master as soon as the semaphore says "blocked",
possibly before the blocking worker has switched the task out and returned
it. A wake-up for a not-yet-returned task only sets the task's `wakedup`
flag; the eventual `Return` then treats the task as Ready.
*/

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::hrc::heap::TaskHeap;
use crate::hrc::prio::{self, PRIO_PARKED};
use crate::mailbox::{Mailbox, WorkerMsg};
use crate::runtime;
use crate::task::{Task, TaskState};
use crate::worker;

pub(crate) struct MasterCtx {
    pub mailbox: Mailbox,
    pub thread: Mutex<Option<JoinHandle<()>>>,
    local: UnsafeCell<MasterLocal>,
}

// Safety: `local` is only touched by the master thread.
unsafe impl Send for MasterCtx {}
unsafe impl Sync for MasterCtx {}

struct MasterLocal {
    heap: TaskHeap,
    /// Workers that asked for a task while the heap was empty (or parked).
    waitworkers: Vec<bool>,
    terminate: bool,
}

impl MasterCtx {
    pub fn new(num_workers: usize) -> Arc<MasterCtx> {
        Arc::new(MasterCtx {
            mailbox: Mailbox::new(),
            thread: Mutex::new(None),
            local: UnsafeCell::new(MasterLocal {
                heap: TaskHeap::new(),
                waitworkers: vec![false; num_workers],
                terminate: false,
            }),
        })
    }
}

/// Thread body of the master.
pub(crate) fn master_thread(mc: Arc<MasterCtx>) {
    runtime::thread_assign(0); // processor slot 0 belongs to the master
    debug!("master up");
    master_loop(&mc);
    // heap drained, terminate observed: now stop the workers
    worker::terminate_all();
    debug!("master down");
}

fn master_loop(mc: &Arc<MasterCtx>) {
    // Safety: this function runs on the master thread only.
    let ml = unsafe { &mut *mc.local.get() };
    loop {
        match mc.mailbox.recv() {
            WorkerMsg::Assign(t) => {
                /* a newly created pool task arrives */
                assert_eq!(t.state(), TaskState::Created);
                t.set_state(TaskState::Ready);
                trace!("master: new task {}", t.uid());
                if serve_pending(ml, &t).is_none() {
                    // it has not opened its streams yet; run it once, soon
                    t.sched.lock().unwrap().prior = f64::MAX;
                    t.set_state(TaskState::InQueue);
                    ml.heap.push(t);
                }
            }

            WorkerMsg::Return(t) => {
                trace!("master: task {} returned as {:?}", t.uid(), t.state());
                match t.state() {
                    TaskState::Blocked => {
                        if t.wakedup.swap(false, std::sync::atomic::Ordering::AcqRel) {
                            /* the wake-up overtook us; returned task is ready */
                            t.set_state(TaskState::Ready);
                            enqueue_ready(ml, t, true);
                        } else {
                            t.set_state(TaskState::Returned);
                            update_neighbours(ml, &t);
                        }
                    }
                    TaskState::Ready => enqueue_ready(ml, t, true),
                    TaskState::Zombie => {
                        update_neighbours(ml, &t);
                        drop(t); // the runtime's reference ends here
                    }
                    s => panic!("master: task returned in state {:?}. Please report this error.", s),
                }
            }

            WorkerMsg::Wakeup(t) => {
                if t.state() != TaskState::Returned {
                    /* not back from its worker yet; coalesce with the Return */
                    t.wakedup.store(true, std::sync::atomic::Ordering::Release);
                } else {
                    trace!("master: unblock task {}", t.uid());
                    t.set_state(TaskState::Ready);
                    enqueue_ready(ml, t, false);
                }
            }

            WorkerMsg::Request(wid) => {
                trace!("master: request from worker {}", wid);
                let parked_top = ml
                    .heap
                    .peek()
                    .map(|t| t.sched.lock().unwrap().prior == PRIO_PARKED);
                match parked_top {
                    None | Some(true) => ml.waitworkers[wid as usize] = true,
                    Some(false) => {
                        let t = ml.heap.pop().unwrap();
                        t.set_state(TaskState::Ready);
                        send_task(wid, t);
                    }
                }
            }

            WorkerMsg::Terminate => {
                trace!("master: terminate");
                ml.terminate = true;
            }

            _ => panic!("master: unexpected message. Please report this error."),
        }

        // A neighbour update may have raised the priority of a task that was
        // parked while workers went to sleep; no further message would ever
        // pair the two, so sweep here.
        serve_waiting(ml);

        if ml.terminate && ml.heap.is_empty() {
            break;
        }
    }
}

/// Hand queued, unparked tasks to workers that are marked waiting.
fn serve_waiting(ml: &mut MasterLocal) {
    loop {
        let top_runnable = match ml.heap.peek() {
            Some(t) => t.sched.lock().unwrap().prior != PRIO_PARKED,
            None => false,
        };
        if !top_runnable {
            break;
        }
        let Some(wid) = ml.waitworkers.iter().position(|&w| w) else {
            break;
        };
        ml.waitworkers[wid] = false;
        let t = ml.heap.pop().unwrap();
        t.set_state(TaskState::Ready);
        trace!("master: serving waiting worker {} with task {}", wid, t.uid());
        send_task(wid as i32, t);
    }
}

fn send_task(wid: i32, t: Arc<Task>) {
    debug_assert_eq!(t.state(), TaskState::Ready);
    runtime::get()
        .worker(wid as usize)
        .mailbox
        .send(WorkerMsg::Assign(t));
}

/// Hand the task to a waiting worker if there is one. Recomputes the task's
/// priority either way.
fn serve_pending(ml: &mut MasterLocal, t: &Arc<Task>) -> Option<usize> {
    let prior = prio::calc_priority(t);
    t.sched.lock().unwrap().prior = prior;
    if prior == PRIO_PARKED {
        return None;
    }
    for wid in 0..ml.waitworkers.len() {
        if ml.waitworkers[wid] {
            ml.waitworkers[wid] = false;
            trace!("master: task {} straight to waiting worker {}", t.uid(), wid);
            send_task(wid as i32, t.clone());
            return Some(wid);
        }
    }
    None
}

/// A task became ready: serve a waiting worker or insert into the heap.
fn enqueue_ready(ml: &mut MasterLocal, t: Arc<Task>, refresh_neighbours: bool) {
    let prior = prio::calc_priority(&t);
    t.sched.lock().unwrap().prior = prior;
    if prior == PRIO_PARKED {
        /* parked: stays in the heap, never handed out, until a neighbour
         * update raises it */
        t.set_state(TaskState::InQueue);
        ml.heap.push(t);
        return;
    }
    if serve_pending(ml, &t).is_some() {
        return;
    }
    if refresh_neighbours {
        update_neighbours(ml, &t);
    }
    let prior = prio::calc_priority(&t);
    t.sched.lock().unwrap().prior = prior;
    t.set_state(TaskState::InQueue);
    ml.heap.push(t);
}

/// Refresh the heap keys of every producer feeding `t` and every consumer
/// draining it. Only the master calls this, so heap access is race-free.
fn update_neighbours(ml: &mut MasterLocal, t: &Arc<Task>) {
    if !prio::update_neighbours() {
        return;
    }
    let (ins, outs) = {
        let si = t.sched.lock().unwrap();
        (si.in_streams.clone(), si.out_streams.clone())
    };
    for s in &ins {
        if let Some(p) = s.producer_task() {
            refresh_if_queued(ml, &p);
        }
    }
    for s in &outs {
        if let Some(c) = s.consumer_task() {
            refresh_if_queued(ml, &c);
        }
    }
}

fn refresh_if_queued(ml: &mut MasterLocal, t: &Arc<Task>) {
    if t.state() == TaskState::InQueue {
        let np = prio::calc_priority(t);
        ml.heap.update_priority(t, np);
    }
}
