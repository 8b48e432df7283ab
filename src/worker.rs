/*! Worker contexts and the DECEN dispatch machinery.

A worker is one OS thread plus a [`WorkerCtx`]: a mailbox that any thread may
send to, and a bundle of state ([`WorkerLocal`]) that only the owning thread
ever touches: the machine context of the worker loop, the task currently in
flight, the deferred-deletion slot, the terminate flag. Cross-worker
interaction is messages; there is no other shared mutable state.

Workers with `wid >= 0` run the full scheduler loop. Wrappers (`wid < 0`) are
degenerate workers that run exactly one task on a dedicated detached thread
and terminate when it exits.

## The dispatcher

Suspension points run on the *task's* stack: the task marks itself
Ready/Blocked/Zombie and calls [`dispatch`], which picks the next ready task
and switches straight into it, or, with nothing ready, switches back to the
worker loop. In the good case a task-to-task handover costs one context
switch instead of two.

## Zombie reclamation

A dying task's stack must survive its final context switch, so Zombies are
never dropped on their own stack. [`self_task_exit`] parks the TCB in the
worker's marked-for-delete slot; the slot is cleared (and the stack freed) by
whichever context performs the *next* dispatch decision, which by then runs
on a different stack.
*/

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::config::Backend;
use crate::hrc;
use crate::mailbox::{Mailbox, WorkerMsg};
use crate::mctx::{self, MachineContext};
use crate::monitor::MonHandle;
use crate::runtime;
use crate::task::{Task, TaskState};
use crate::taskqueue::SchedCtx;
use crate::timing::Timing;

/// Wrapper ids count down from -1.
static WRAPPER_SEQ: AtomicI32 = AtomicI32::new(-1);

/// State owned exclusively by the worker's own thread.
pub(crate) struct WorkerLocal {
    pub mctx: MachineContext,
    pub current: Option<Arc<Task>>,
    pub marked_del: Option<Arc<Task>>,
    /// Wrapper: the single task to (re)run.
    pub wraptask: Option<Arc<Task>>,
    /// DECEN: task that asked to migrate away; forwarded post-switch.
    pub migrated: Option<Arc<Task>>,
    pub terminate: bool,
    pub num_tasks: u32,
    pub mon: Option<MonHandle>,
    pub wait_time: Timing,
}

pub(crate) struct WorkerCtx {
    pub wid: i32,
    pub mailbox: Mailbox,
    /// DECEN workers own a scheduler; wrappers and HRC workers do not.
    pub sched: Option<SchedCtx>,
    pub thread: Mutex<Option<JoinHandle<()>>>,
    local: UnsafeCell<WorkerLocal>,
}

// Safety: `local` is only ever accessed by the thread registered as this
// worker's owner (see worker_thread / wrapper threads); everything else on
// the struct is Sync by construction.
unsafe impl Send for WorkerCtx {}
unsafe impl Sync for WorkerCtx {}

impl WorkerCtx {
    pub fn new(wid: i32, with_sched: bool) -> Arc<WorkerCtx> {
        Arc::new(WorkerCtx {
            wid,
            mailbox: Mailbox::new(),
            sched: if with_sched { Some(SchedCtx::new()) } else { None },
            thread: Mutex::new(None),
            local: UnsafeCell::new(WorkerLocal {
                mctx: MachineContext::zeroed(),
                current: None,
                marked_del: None,
                wraptask: None,
                migrated: None,
                terminate: false,
                num_tasks: 0,
                mon: None,
                wait_time: Timing::new(),
            }),
        })
    }

    /// Access the owner-confined state.
    ///
    /// # Safety
    ///
    /// Caller must be the owning worker thread, and must not hold the
    /// returned reference across a context switch.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn local(&self) -> &mut WorkerLocal {
        &mut *self.local.get()
    }

    pub fn worker_mctx(&self) -> *mut MachineContext {
        unsafe { &mut (*self.local.get()).mctx as *mut MachineContext }
    }

    fn sched(&self) -> &SchedCtx {
        self.sched.as_ref().expect("worker without a scheduler")
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerCtx> = const { Cell::new(std::ptr::null()) };
}

fn register_current(wc: &Arc<WorkerCtx>) {
    CURRENT_WORKER.with(|c| c.set(Arc::as_ptr(wc)));
}

/// The worker context owning the calling thread, if any.
pub(crate) fn current_worker() -> Option<&'static WorkerCtx> {
    let p = CURRENT_WORKER.with(|c| c.get());
    if p.is_null() {
        None
    } else {
        // Safety: the owning thread keeps an Arc alive for its entire
        // lifetime, and the runtime's worker table outlives all workers.
        Some(unsafe { &*p })
    }
}

/// The task currently running on the calling thread, if any.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    current_worker().and_then(|wc| unsafe { wc.local() }.current.clone())
}

/* ------------------------------------------------------------------------ */
/* Message plumbing                                                          */
/* ------------------------------------------------------------------------ */

fn send_assign(target: &Arc<WorkerCtx>, t: Arc<Task>) {
    target.mailbox.send(WorkerMsg::Assign(t));
}

fn send_wakeup(target: &WorkerCtx, t: Arc<Task>) {
    target.mailbox.send(WorkerMsg::Wakeup(t));
}

/// Send `Assign` to the task's owner (or the HRC master). Entry point for
/// `TaskHandle::start`.
pub(crate) fn run_task(t: &Arc<Task>) {
    debug_assert_eq!(t.state(), TaskState::Created);
    match t.worker_ctx() {
        Some(wc) => send_assign(&wc, t.clone()),
        None => hrc::send_to_master(WorkerMsg::Assign(t.clone())),
    }
}

/// Broadcast a message to all pool workers (not wrappers).
pub(crate) fn broadcast(mk: impl Fn() -> WorkerMsg) {
    let rt = runtime::get();
    for wc in rt.workers() {
        wc.mailbox.send(mk());
    }
}

/// Broadcast Terminate to all pool workers.
pub(crate) fn terminate_all() {
    broadcast(|| WorkerMsg::Terminate);
}

/* ------------------------------------------------------------------------ */
/* Task-side entry points (run on the task's stack)                          */
/* ------------------------------------------------------------------------ */

/// Backend hook run when a task is about to block on a stream.
pub(crate) fn task_block(t: &Arc<Task>) {
    match runtime::get().backend() {
        Backend::Decen => { /* the stream holds the reference; nothing to do */ }
        Backend::Hrc => hrc::task_block(t),
    }
}

/// Wake `whom` after a stream operation by `by` (or by no task at all).
///
/// Same-worker wake-ups go straight into the local scheduler; everything
/// else travels by mailbox.
pub(crate) fn task_wakeup(by: Option<&Arc<Task>>, whom: &Arc<Task>) {
    match runtime::get().backend() {
        Backend::Hrc => hrc::task_wakeup(whom),
        Backend::Decen => {
            let wc = whom
                .worker_ctx()
                .expect("wakeup for a task without a worker");
            if wc.wid < 0 {
                send_wakeup(&wc, whom.clone());
                return;
            }
            let same_worker = by.is_some()
                && current_worker().is_some_and(|cur| std::ptr::eq(cur, Arc::as_ptr(&wc)));
            if same_worker {
                assert_ne!(whom.state(), TaskState::Ready);
                whom.set_state(TaskState::Ready);
                make_task_ready(&wc, whom.clone());
            } else {
                send_wakeup(&wc, whom.clone());
            }
        }
    }
}

/// The just-suspended task wants to run again (yield path).
pub(crate) fn self_task_yield(t: &Arc<Task>) {
    match runtime::get().backend() {
        Backend::Hrc => hrc::self_task_yield(t),
        Backend::Decen => {
            let wc = t.worker_ctx().expect("yield from an unowned task");
            let wl = unsafe { wc.local() };
            if wc.wid < 0 {
                wl.wraptask = Some(t.clone());
            } else {
                wc.sched().make_ready(t.clone());
            }
        }
    }
}

/// The running task is done. Parks the TCB for deferred deletion and lets
/// wrappers terminate.
pub(crate) fn self_task_exit(t: &Arc<Task>) {
    match runtime::get().backend() {
        Backend::Hrc => hrc::self_task_exit(t),
        Backend::Decen => {
            let wc = t.worker_ctx().expect("exit from an unowned task");
            let wl = unsafe { wc.local() };
            collect_task(wl, Some(t.clone()));
            wl.num_tasks -= 1;
            if wc.wid < 0 {
                /* wrappers die with their task */
                wl.terminate = true;
            }
        }
    }
}

/// Cooperative migration: rebind the task to `target` and fall back to the
/// worker loop, which forwards the TCB by mailbox. Runs on the task's stack;
/// returns when the task is dispatched again on the new worker.
pub(crate) fn self_task_migrate(t: &Arc<Task>, target: i32) {
    let rt = runtime::get();
    debug_assert_eq!(rt.backend(), Backend::Decen);
    let wc = t.worker_ctx().expect("migrate from an unowned task");
    if wc.wid == target {
        return;
    }
    debug!("task {} migrates from worker {} to {}", t.uid(), wc.wid, target);
    t.set_worker(Some(rt.worker(target as usize)));
    let wl = unsafe { wc.local() };
    wl.migrated = Some(t.clone());
    // Don't move the task while standing on its stack: switch back to the
    // worker loop and let it forward.
    unsafe { mctx::mctx_switch(t.mctx.get(), wc.worker_mctx()) };
}

/// Dispatch the next ready task, called at every suspension point on the
/// suspending task's own stack.
pub(crate) fn dispatch(t: &Task) {
    match runtime::get().backend() {
        Backend::Hrc => hrc::dispatch(t),
        Backend::Decen => decen_dispatch(t),
    }
}

fn decen_dispatch(t: &Task) {
    let wc = t.worker_ctx().expect("dispatch from an unowned task");
    if wc.wid >= 0 {
        // Pick up newly arrived Ready tasks and pending SPMD requests before
        // choosing.
        fetch_all_messages(&wc);
        crate::spmd::handle_requests(wc.wid);

        let wl = unsafe { wc.local() };
        match wc.sched().fetch_ready() {
            Some(next) => {
                if std::ptr::eq(Arc::as_ptr(&next), t as *const Task) {
                    /* we are the next task ourselves: short circuit */
                    return;
                }
                let next_mctx = next.mctx.get();
                // The previous `current` Arc (ours) is parked in marked_del
                // if we are a Zombie; dropping the slot's clone here is safe
                // either way because another owner always exists.
                wl.current = Some(next);
                unsafe { mctx::mctx_switch(t.mctx.get(), next_mctx) };
            }
            None => {
                wl.current = None;
                unsafe { mctx::mctx_switch(t.mctx.get(), wc.worker_mctx()) };
            }
        }
    } else {
        /* wrapper: always back to the wrapper loop */
        let wl = unsafe { wc.local() };
        wl.current = None;
        unsafe { mctx::mctx_switch(t.mctx.get(), wc.worker_mctx()) };
    }
    /* …contex switch… the task continues its business here */
}

/* ------------------------------------------------------------------------ */
/* Worker-side machinery (runs on the worker's own stack)                    */
/* ------------------------------------------------------------------------ */

/// Deferred task deletion: drop the previously parked Zombie (its final
/// switch is long done) and optionally park a new one.
fn collect_task(wl: &mut WorkerLocal, park: Option<Arc<Task>>) {
    let _gone = wl.marked_del.take();
    wl.marked_del = park;
}

/// Ready a task on this worker, possibly migrating it away first (WAIT-PROP
/// checks at wake-up time as well as at yield).
fn make_task_ready(wc: &Arc<WorkerCtx>, t: Arc<Task>) {
    debug_assert_eq!(t.state(), TaskState::Ready);
    runtime::get().mon().on_task_ready(&t.mon_handle());
    if let Some(target) = crate::migration::wait_prop_target(&t) {
        if target >= 0 && target != wc.wid {
            let rt = runtime::get();
            t.set_worker(Some(rt.worker(target as usize)));
            let wl = unsafe { wc.local() };
            wl.num_tasks -= 1;
            rt.worker(target as usize)
                .mailbox
                .send(WorkerMsg::TaskMig(t));
            return;
        }
    }
    wc.sched().make_ready(t);
}

fn process_message(wc: &Arc<WorkerCtx>, msg: WorkerMsg) {
    match msg {
        WorkerMsg::Wakeup(t) => {
            assert_ne!(t.state(), TaskState::Ready);
            t.set_state(TaskState::Ready);
            trace!("worker {}: received wakeup for task {}", wc.wid, t.uid());
            if wc.wid < 0 {
                unsafe { wc.local() }.wraptask = Some(t);
            } else {
                make_task_ready(wc, t);
            }
        }
        WorkerMsg::Terminate => {
            trace!("worker {}: received terminate", wc.wid);
            unsafe { wc.local() }.terminate = true;
        }
        WorkerMsg::Assign(t) => {
            assert_eq!(t.state(), TaskState::Created);
            t.set_state(TaskState::Ready);
            unsafe { wc.local() }.num_tasks += 1;
            trace!("worker {}: assigned task {}", wc.wid, t.uid());
            let rt = runtime::get();
            if wc.wid < 0 {
                // a wrapper materialises its monitoring context from the task
                let mon = rt.mon().on_worker_create_wrapper(&t.mon_handle());
                rt.mon().on_task_assign(&t.mon_handle(), &mon);
                let wl = unsafe { wc.local() };
                wl.mon = mon;
                wl.wraptask = Some(t);
            } else {
                let mon = unsafe { wc.local() }.mon.clone();
                rt.mon().on_task_assign(&t.mon_handle(), &mon);
                wc.sched().make_ready(t);
            }
        }
        WorkerMsg::TaskMig(t) => {
            /* a ready task migrated onto this worker */
            assert_eq!(t.state(), TaskState::Ready);
            unsafe { wc.local() }.num_tasks += 1;
            trace!("worker {}: task {} migrated in", wc.wid, t.uid());
            wc.sched().make_ready(t);
        }
        WorkerMsg::SpmdReq(from) => {
            /* only purpose: wake sleeping workers; requests are handled
             * before every dispatch decision */
            trace!("worker {}: spmd request notice from {}", wc.wid, from);
            debug_assert!(wc.wid >= 0);
        }
        WorkerMsg::Request(_) | WorkerMsg::Return(_) => {
            panic!(
                "worker {}: HRC message on the DECEN backend. Please report this error.",
                wc.wid
            )
        }
    }
}

fn wait_for_message(wc: &Arc<WorkerCtx>) {
    let rt = runtime::get();
    let wl = unsafe { wc.local() };
    rt.mon().on_worker_waitstart(&wl.mon);
    wl.wait_time.start();
    let msg = wc.mailbox.recv();
    wl.wait_time.end();
    rt.mon().on_worker_waitstop(&wl.mon);
    process_message(wc, msg);
}

fn fetch_all_messages(wc: &Arc<WorkerCtx>) {
    while wc.mailbox.has_incoming() {
        if let Some(msg) = wc.mailbox.try_recv() {
            process_message(wc, msg);
        }
    }
}

/// The DECEN worker loop.
fn worker_loop(wc: &Arc<WorkerCtx>) {
    loop {
        // handle pending SPMD requests before executing a task
        crate::spmd::handle_requests(wc.wid);

        let next = wc.sched().fetch_ready();
        match next {
            Some(t) => {
                let wl = unsafe { wc.local() };
                let t_mctx = t.mctx.get();
                wl.current = Some(t);
                unsafe { mctx::mctx_switch(wc.worker_mctx(), t_mctx) };

                /* back on the worker stack */
                let wl = unsafe { wc.local() };
                wl.current = None;
                // forward a task that asked to migrate while switched in
                if let Some(mig) = wl.migrated.take() {
                    let target = mig.worker_ctx().expect("migrated task lost its worker");
                    wl.num_tasks -= 1;
                    target.mailbox.send(WorkerMsg::TaskMig(mig));
                }
                collect_task(wl, None);
            }
            None => wait_for_message(wc),
        }

        // fetch (remaining) messages
        fetch_all_messages(wc);

        let wl = unsafe { wc.local() };
        if wl.num_tasks == 0 && wl.terminate {
            break;
        }
    }
}

/// The wrapper loop: runs its single task until it exits.
pub(crate) fn wrapper_loop(wc: &Arc<WorkerCtx>) {
    loop {
        let taken = unsafe { wc.local() }.wraptask.take();
        match taken {
            Some(t) => {
                // `t` stays on this (the wrapper's) stack across the switch,
                // so the task outlives its final context switch even when
                // nothing else references it any more.
                let t_mctx = t.mctx.get();
                unsafe { wc.local() }.current = Some(t.clone());
                unsafe { mctx::mctx_switch(wc.worker_mctx(), t_mctx) };
                unsafe { wc.local() }.current = None;
            }
            None => wait_for_message(wc),
        }
        fetch_all_messages(wc);
        if unsafe { wc.local() }.terminate {
            break;
        }
    }
    collect_task(unsafe { wc.local() }, None);
}

/// Thread body for workers and wrappers (both backends).
pub(crate) fn worker_thread(wc: Arc<WorkerCtx>) {
    register_current(&wc);
    runtime::thread_assign(if wc.wid >= 0 {
        match runtime::get().backend() {
            Backend::Decen => wc.wid,
            Backend::Hrc => wc.wid + 1, // slot 0 belongs to the master
        }
    } else {
        wc.wid
    });

    let rt = runtime::get();
    {
        let wl = unsafe { wc.local() };
        if wc.wid >= 0 {
            wl.mon = rt.mon().on_worker_create(wc.wid);
        }
    }

    debug!("worker {} up", wc.wid);
    if wc.wid >= 0 {
        match rt.backend() {
            Backend::Decen => worker_loop(&wc),
            Backend::Hrc => hrc::worker_loop(&wc),
        }
    } else {
        wrapper_loop(&wc);
    }

    let wl = unsafe { wc.local() };
    rt.mon().on_worker_destroy(&wl.mon);
    debug!(
        "worker {} down (waited {:?} in total)",
        wc.wid,
        wl.wait_time.total()
    );
}

/// Spawn a wrapper context with its own detached thread.
pub(crate) fn spawn_wrapper() -> Arc<WorkerCtx> {
    let wid = WRAPPER_SEQ.fetch_sub(1, Ordering::Relaxed);
    let wc = WorkerCtx::new(wid, false);
    let thread_wc = wc.clone();
    // detached: the handle is dropped, the wrapper dies with its task
    std::thread::Builder::new()
        .name(format!("loom-wrapper{}", wid))
        .spawn(move || worker_thread(thread_wc))
        .expect("failed to spawn wrapper thread");
    wc
}
