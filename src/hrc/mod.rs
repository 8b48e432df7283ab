/*! The hierarchic (HRC) backend: master + pulling workers.

DECEN workers decide for themselves; HRC workers are deliberately dumb. A
worker asks the master for work (`Request`), runs whatever `Assign` comes
back until the task suspends, then hands it back (`Return`) and waits for the
next assignment. The request for the *next* task is sent from the task-side
suspension hooks, before the context switches back; by the time the worker
loop is listening again, the master is already choosing.

Wrappers are the same as under DECEN and share the wrapper loop.
*/

pub(crate) mod heap;
pub(crate) mod master;
pub(crate) mod prio;

use std::sync::Arc;

use log::trace;

use crate::mailbox::WorkerMsg;
use crate::mctx;
use crate::runtime;
use crate::task::{Task, TaskState};
use crate::worker::WorkerCtx;

pub(crate) use master::{master_thread, MasterCtx};

pub(crate) fn send_to_master(msg: WorkerMsg) {
    runtime::get().master().mailbox.send(msg);
}

fn request_task(wc: &WorkerCtx) {
    trace!("worker {}: requesting a task", wc.wid);
    send_to_master(WorkerMsg::Request(wc.wid));
}

/// Task-side hook: about to block on a stream. Ask for a replacement before
/// we leave the worker.
pub(crate) fn task_block(t: &Arc<Task>) {
    let wc = t.worker_ctx().expect("blocking task without a worker");
    if wc.wid >= 0 {
        request_task(&wc);
    }
}

/// Task-side hook: voluntary yield.
pub(crate) fn self_task_yield(t: &Arc<Task>) {
    let wc = t.worker_ctx().expect("yielding task without a worker");
    if wc.wid < 0 {
        /* wrapper: just run the same task again */
        unsafe { wc.local() }.wraptask = Some(t.clone());
    } else {
        request_task(&wc);
    }
}

/// Task-side hook: the task is done.
pub(crate) fn self_task_exit(t: &Arc<Task>) {
    let wc = t.worker_ctx().expect("exiting task without a worker");
    if wc.wid >= 0 {
        request_task(&wc);
    } else {
        /* wrappers terminate with their task */
        unsafe { wc.local() }.terminate = true;
    }
}

/// Wake a blocked task: wrappers get the message directly, everything else
/// goes through the master.
pub(crate) fn task_wakeup(whom: &Arc<Task>) {
    match whom.worker_ctx() {
        Some(wc) if wc.wid < 0 => wc.mailbox.send(WorkerMsg::Wakeup(whom.clone())),
        _ => send_to_master(WorkerMsg::Wakeup(whom.clone())),
    }
}

/// Suspension switch: HRC tasks always fall back to their worker's loop
/// context (no task-to-task shortcut; the master owns all placement).
pub(crate) fn dispatch(t: &Task) {
    let wc = t
        .worker_ctx()
        .expect("dispatching a task without a worker");
    unsafe { wc.local() }.current = None;
    unsafe { mctx::mctx_switch(t.mctx.get(), wc.worker_mctx()) };
}

/// The HRC worker loop.
pub(crate) fn worker_loop(wc: &Arc<WorkerCtx>) {
    let rt = runtime::get();
    request_task(wc); // ask for the first time

    loop {
        let msg = {
            let wl = unsafe { wc.local() };
            rt.mon().on_worker_waitstart(&wl.mon);
            wl.wait_time.start();
            let msg = wc.mailbox.recv();
            wl.wait_time.end();
            rt.mon().on_worker_waitstop(&wl.mon);
            msg
        };

        match msg {
            WorkerMsg::Assign(t) => {
                assert_eq!(t.state(), TaskState::Ready);
                trace!("worker {}: got task {}", wc.wid, t.uid());
                t.set_worker(Some(wc.clone()));
                rt.mon()
                    .on_task_assign(&t.mon_handle(), &unsafe { wc.local() }.mon);

                // `t` lives in this frame across the switch, keeping the TCB
                // alive however the task leaves.
                let t_mctx = t.mctx.get();
                unsafe { wc.local() }.current = Some(t.clone());
                unsafe { mctx::mctx_switch(wc.worker_mctx(), t_mctx) };
                unsafe { wc.local() }.current = None;

                /* the task suspended; give it back */
                assert_ne!(t.state(), TaskState::Running);
                t.set_worker(None);
                trace!(
                    "worker {}: returning task {} as {:?}",
                    wc.wid,
                    t.uid(),
                    t.state()
                );
                send_to_master(WorkerMsg::Return(t));
            }
            WorkerMsg::Terminate => break,
            _ => panic!(
                "worker {}: unexpected message in the HRC loop. Please report this error.",
                wc.wid
            ),
        }
    }
}
