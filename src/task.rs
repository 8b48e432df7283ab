/*! Tasks: cooperative coroutines with their own execution stacks.

A task is created in two phases, mirroring how hosts wire up pipelines: first
[`Task::create`] allocates the TCB, the stack and the machine context; then
[`TaskHandle::start`] ships it to its worker (or the HRC master) with an
`Assign` message. From then on the task belongs to the runtime and runs until
its closure returns, it calls [`exit`], or the process ends.

Inside a task, [`yield_now`], [`exit`], stream reads/writes and
[`enter_spmd`](crate::task::enter_spmd) are the only suspension points; each
goes through the owning worker's dispatcher.

## States

```text
Created --Assign--> Ready --dispatch--> Running --yield--> Ready
                                         |  \--block-----> Blocked --wake--> Ready
                                         \---exit--------> Zombie
```

The HRC backend adds `InQueue` (sitting in the master's heap) and `Returned`
(handed back to the master, not yet requeued).
*/

use std::any::Any;
use std::cell::UnsafeCell;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::config::Backend;
use crate::mctx::{self, MachineContext, Stack};
use crate::monitor::MonHandle;
use crate::runtime;
use crate::stream::StreamTally;
use crate::timing::Ema;
use crate::worker::{self, WorkerCtx};

static TASK_SEQ: AtomicU32 = AtomicU32::new(0);

/// Weight of the newest activation in the running-time average.
const RUN_AVG_ALPHA: f64 = 0.1;

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Zombie = 4,
    /// HRC: present in the master's ready heap.
    InQueue = 5,
    /// HRC: handed back to the master, not yet requeued.
    Returned = 6,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            3 => TaskState::Blocked,
            4 => TaskState::Zombie,
            5 => TaskState::InQueue,
            6 => TaskState::Returned,
            x => panic!("task state: bad encoding ({}). Please report this error.", x),
        }
    }
}

/// Where a task should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// DECEN: the worker with this id.
    Worker(usize),
    /// HRC: the master's shared pool.
    Pool,
    /// A dedicated wrapper thread (worker id < 0), for tasks such as I/O
    /// pumps that must not share a worker.
    Wrapper,
}

/// HRC scheduling bookkeeping plus the stream tallies both backends keep.
pub(crate) struct SchedInfo {
    /// HRC heap key. Fresh tasks get `f64::MAX` from the master so they run
    /// once and open their streams.
    pub prior: f64,
    pub rec_cnt: i64,
    pub rec_limit: i64,
    pub rec_limit_factor: i64,
    pub in_streams: Vec<Arc<dyn StreamTally>>,
    pub out_streams: Vec<Arc<dyn StreamTally>>,
}

impl SchedInfo {
    fn new() -> SchedInfo {
        SchedInfo {
            prior: 0.0,
            rec_cnt: 0,
            rec_limit: 0,
            rec_limit_factor: -1,
            in_streams: Vec::new(),
            out_streams: Vec::new(),
        }
    }
}

/// Running-time accounting, updated on every Running -> suspended transition.
struct RunStats {
    started: Option<Instant>,
    last: Duration,
    total: Duration,
    avg: Ema,
}

impl RunStats {
    fn new() -> RunStats {
        RunStats {
            started: None,
            last: Duration::ZERO,
            total: Duration::ZERO,
            avg: Ema::new(RUN_AVG_ALPHA),
        }
    }
}

/// The task control block.
pub struct Task {
    uid: u32,
    state: AtomicU8,
    /// HRC: a Wakeup overtook the Return; treat the Return as Ready.
    pub(crate) wakedup: AtomicBool,
    /// Arbitrates which of several polled producers wakes us.
    pub(crate) poll_token: AtomicI32,
    /// Migration target stamped by the placement scheduler; -1 = none.
    pub(crate) new_worker: AtomicI32,
    /// Owning worker. `None` means the task is HRC pool-managed and only
    /// bound to a worker while it runs there.
    worker: Mutex<Option<Arc<WorkerCtx>>>,

    pub(crate) mctx: UnsafeCell<MachineContext>,
    #[allow(dead_code)] // owned for its lifetime, only the mctx reads it
    stack: Stack,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    outarg: Mutex<Option<Box<dyn Any + Send>>>,

    /// Which stream descriptor woke us from a poll (type-erased).
    pub(crate) wakeup_sd: Mutex<Option<Arc<dyn Any + Send + Sync>>>,

    /// DECEN lane priority.
    lane_prio: AtomicI32,
    pub(crate) sched: Mutex<SchedInfo>,
    run_stats: Mutex<RunStats>,
    pub(crate) mon: Mutex<Option<MonHandle>>,
    usrdata: Mutex<Option<Box<dyn Any + Send>>>,
}

// Safety: the UnsafeCell fields (mctx, entry) are only touched by the thread
// currently running or dispatching the task, and a task runs on at most one
// thread at a time, enforced by the ownership protocol (a task is owned by
// exactly one queue, mailbox message, or worker slot at any instant).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Create a task. `stack_size == 0` selects the default; sizes below the
    /// minimum are clamped up to it.
    pub fn create(
        place: Placement,
        f: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> TaskHandle {
        let rt = runtime::get();

        let worker = match (rt.backend(), place) {
            (Backend::Decen, Placement::Worker(i)) => Some(rt.worker(i)),
            (Backend::Decen, Placement::Wrapper) => Some(worker::spawn_wrapper()),
            (Backend::Hrc, Placement::Pool) => None,
            (Backend::Hrc, Placement::Wrapper) => Some(worker::spawn_wrapper()),
            (backend, place) => panic!(
                "task placement {:?} is not valid on the {:?} backend",
                place, backend
            ),
        };

        let stack = Stack::alloc(mctx::effective_stack_size(stack_size));
        let task = Arc::new(Task {
            uid: TASK_SEQ.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(TaskState::Created as u8),
            wakedup: AtomicBool::new(false),
            poll_token: AtomicI32::new(0),
            new_worker: AtomicI32::new(-1),
            worker: Mutex::new(worker),
            mctx: UnsafeCell::new(MachineContext::zeroed()),
            stack,
            entry: UnsafeCell::new(Some(Box::new(f))),
            outarg: Mutex::new(None),
            wakeup_sd: Mutex::new(None),
            lane_prio: AtomicI32::new(0),
            sched: Mutex::new(SchedInfo::new()),
            run_stats: Mutex::new(RunStats::new()),
            mon: Mutex::new(None),
            usrdata: Mutex::new(None),
        });

        // The trampoline receives the TCB address; the Arc held by whichever
        // container owns the task keeps it valid while it can run.
        unsafe {
            mctx::mctx_create(
                task.mctx.get(),
                &task.stack,
                task_startup,
                Arc::as_ptr(&task) as *mut c_void,
            );
        }

        debug!("created task {} ({:?})", task.uid, place);
        TaskHandle { inner: task }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn worker_ctx(&self) -> Option<Arc<WorkerCtx>> {
        self.worker.lock().unwrap().clone()
    }

    pub(crate) fn set_worker(&self, wc: Option<Arc<WorkerCtx>>) {
        *self.worker.lock().unwrap() = wc;
    }

    /// Current worker id: negative for wrappers and unbound HRC tasks.
    pub fn worker_id(&self) -> i32 {
        match self.worker_ctx() {
            Some(wc) => wc.wid,
            None => -1,
        }
    }

    pub(crate) fn lane_priority(&self) -> i32 {
        self.lane_prio.load(Ordering::Relaxed)
    }

    pub(crate) fn mon_handle(&self) -> Option<MonHandle> {
        self.mon.lock().unwrap().clone()
    }

    /// Ready -> Running, with the monitoring callback. Called on the task's
    /// own stack right after it is dispatched.
    pub(crate) fn start_running(&self) {
        assert_eq!(self.state(), TaskState::Ready);
        runtime::get().mon().on_task_start(&self.mon_handle());
        self.sched.lock().unwrap().rec_cnt = 0;
        self.run_stats.lock().unwrap().started = Some(Instant::now());
        self.set_state(TaskState::Running);
    }

    /// Running-time bookkeeping and the monitoring callback on any
    /// Running -> suspended transition. The new state must already be set.
    pub(crate) fn stop_running(&self) {
        debug_assert_ne!(self.state(), TaskState::Running);
        {
            let mut rs = self.run_stats.lock().unwrap();
            if let Some(t0) = rs.started.take() {
                rs.last = t0.elapsed();
                let last = rs.last;
                rs.total += last;
                let secs = rs.last.as_secs_f64();
                rs.avg.update(secs);
            }
        }
        runtime::get().mon().on_task_stop(&self.mon_handle(), self.state());
    }

    /// Suspend the running task because a stream operation cannot proceed.
    /// Returns when a peer has woken us up and we were dispatched again.
    pub(crate) fn block_on_stream(self: &Arc<Task>) {
        // a reference to the task is held by the stream it blocks on
        assert_eq!(self.state(), TaskState::Running);
        self.set_state(TaskState::Blocked);
        worker::task_block(self);
        self.stop_running();
        worker::dispatch(self);
        self.start_running();
    }

    /// Wake `whom`, previously blocked on a stream `by` just operated on.
    pub(crate) fn unblock(by: &Arc<Task>, whom: &Arc<Task>) {
        worker::task_wakeup(Some(by), whom);
    }

    /// Rec-limit cadence: one tick per item written; yields when the limit is
    /// reached. A negative limit disables the check.
    pub(crate) fn check_yield(self: &Arc<Task>) {
        debug_assert_eq!(self.state(), TaskState::Running);
        let limit = {
            let mut si = self.sched.lock().unwrap();
            if si.rec_limit < 0 {
                return;
            }
            if si.rec_cnt < si.rec_limit {
                si.rec_cnt += 1;
                return;
            }
            si.rec_limit
        };
        debug!("task {} yields after {} items", self.uid, limit);
        yield_current(self);
    }

    pub(crate) fn add_stream(&self, tally: Arc<dyn StreamTally>, write_side: bool) {
        let mut si = self.sched.lock().unwrap();
        if write_side {
            si.rec_limit += si.rec_limit_factor;
            si.out_streams.push(tally);
        } else {
            si.in_streams.push(tally);
        }
    }

    pub(crate) fn remove_stream(&self, uid: u32, write_side: bool) {
        let mut si = self.sched.lock().unwrap();
        let list = if write_side {
            si.rec_limit -= si.rec_limit_factor;
            &mut si.out_streams
        } else {
            &mut si.in_streams
        };
        let pos = list
            .iter()
            .position(|s| s.uid() == uid)
            .expect("closing a stream the task never opened");
        list.remove(pos);
    }

    /// Run the user-data destructor, if data is still attached.
    fn drop_usrdata(&self) {
        drop(self.usrdata.lock().unwrap().take());
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Either it ran to Zombie, or the host dropped a handle it never
        // started. Anything else means a stack may still be live.
        debug_assert!(
            matches!(self.state(), TaskState::Zombie | TaskState::Created),
            "task {} destroyed in state {:?}",
            self.uid,
            self.state()
        );
        if let Some(rt) = runtime::try_get() {
            rt.mon().on_task_destroy(&self.mon_handle());
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("uid", &self.uid)
            .field("state", &self.state())
            .field("worker", &self.worker_id())
            .finish()
    }
}

/// The host's handle on a created task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) inner: Arc<Task>,
}

impl TaskHandle {
    /// Let the previously created task run: sends it to its owner.
    pub fn start(&self) {
        assert_eq!(self.inner.state(), TaskState::Created);
        worker::run_task(&self.inner);
    }

    pub fn uid(&self) -> u32 {
        self.inner.uid()
    }

    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    pub fn worker_id(&self) -> i32 {
        self.inner.worker_id()
    }

    /// DECEN lane priority; clamped into range on insertion.
    pub fn set_priority(&self, prio: i32) {
        self.inner.lane_prio.store(prio, Ordering::Relaxed);
    }

    /// HRC static priority (only meaningful under `PrioPolicy::Static`).
    pub fn set_static_priority(&self, prio: f64) {
        self.inner.sched.lock().unwrap().prior = prio;
    }

    /// Set the rec-limit factor: the task yields after
    /// `factor * (open output streams)` written items. Negative disables.
    pub fn set_rec_limit(&self, factor: i64) {
        self.inner.sched.lock().unwrap().rec_limit_factor = factor;
    }

    /// Attach an opaque monitoring handle.
    pub fn monitor(&self, handle: MonHandle) {
        *self.inner.mon.lock().unwrap() = Some(handle);
    }

    pub fn set_user_data(&self, data: Box<dyn Any + Send>) {
        *self.inner.usrdata.lock().unwrap() = Some(data);
    }

    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.usrdata.lock().unwrap().take()
    }

    /// Collect the value the task passed to [`exit`], once it has died.
    pub fn take_output(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.outarg.lock().unwrap().take()
    }

    /// Wall-clock length of the most recently completed activation.
    pub fn last_run_time(&self) -> Duration {
        self.inner.run_stats.lock().unwrap().last
    }

    /// Total wall-clock time across all completed activations.
    pub fn total_run_time(&self) -> Duration {
        self.inner.run_stats.lock().unwrap().total
    }

    /// Exponential moving average of activation lengths, in seconds; the
    /// newest activation carries a weight of 0.1.
    pub fn avg_run_time(&self) -> f64 {
        self.inner.run_stats.lock().unwrap().avg.get()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

/* ------------------------------------------------------------------------ */
/* In-task API                                                              */
/* ------------------------------------------------------------------------ */

/// The currently running task.
///
/// # Panics
///
/// When called from outside a task context, a common host bug, so this
/// asserts instead of returning garbage.
pub fn current() -> TaskHandle {
    TaskHandle {
        inner: current_arc(),
    }
}

/// Like [`current`], but `None` outside a task context.
pub fn try_current() -> Option<TaskHandle> {
    worker::current_task().map(|inner| TaskHandle { inner })
}

pub(crate) fn current_arc() -> Arc<Task> {
    worker::current_task().expect("not in a task context")
}

/// Voluntarily yield execution back to the scheduler.
pub fn yield_now() {
    let ct = current_arc();
    assert_eq!(ct.state(), TaskState::Running);
    yield_current(&ct);
}

fn yield_current(ct: &Arc<Task>) {
    ct.set_state(TaskState::Ready);

    // The placement scheduler may have stamped a target; WAIT-PROP picks one
    // itself at yield time. Either way the move is cooperative: park the task
    // on the worker and let the worker forward it.
    let stamped = ct.new_worker.swap(-1, Ordering::Relaxed);
    let target = if stamped >= 0 {
        Some(stamped)
    } else {
        crate::migration::wait_prop_target(ct)
    };
    if let Some(target) = target {
        if target != ct.worker_id() {
            ct.stop_running();
            worker::self_task_migrate(ct, target);
            ct.start_running();
            return;
        }
    }

    worker::self_task_yield(ct);
    ct.stop_running();
    worker::dispatch(ct);
    ct.start_running();
}

/// Exit the current task, optionally leaving an output value in the TCB.
/// Never returns.
pub fn exit(outarg: Option<Box<dyn Any + Send>>) -> ! {
    let ct = current_arc();
    assert_eq!(ct.state(), TaskState::Running);
    *ct.outarg.lock().unwrap() = outarg;
    finish_off(ct);
}

/// Migration checkpoint for the RANDOM policy; hosts call this at convenient
/// points (e.g. once per processed record). No-op for other policies and on
/// wrappers.
pub fn check_migrate() {
    if runtime::get().backend() != Backend::Decen || !crate::migration::random_enabled() {
        return;
    }
    let ct = current_arc();
    let wid = ct.worker_id();
    if wid < 0 {
        return; // wrapper tasks do not migrate
    }
    assert_eq!(ct.state(), TaskState::Running);
    if let Some(target) = crate::migration::pick_target() {
        if target != wid {
            ct.set_state(TaskState::Ready);
            ct.stop_running();
            worker::self_task_migrate(&ct, target);
            ct.start_running();
        }
    }
}

/// Request an SPMD rendezvous: every DECEN worker runs `f` at its next
/// scheduling decision; the calling task resumes afterwards.
pub fn enter_spmd(f: impl Fn() + Send + Sync + 'static) {
    crate::spmd::request(f);
}

fn finish_off(ct: Arc<Task>) -> ! {
    ct.drop_usrdata();
    // the context switch happens, the task is cleaned up afterwards
    ct.set_state(TaskState::Zombie);
    worker::self_task_exit(&ct);
    ct.stop_running();

    // This frame never unwinds, so the Arc it holds would never be released.
    // Drop it here: the worker's `current` slot (and the marked-for-delete
    // slot) still own the task, which keeps this stack alive across the final
    // switch.
    let uid = ct.uid();
    let raw = Arc::as_ptr(&ct);
    drop(ct);
    unsafe { worker::dispatch(&*raw) };
    unreachable!("zombie task {} was dispatched again", uid);
}

/// First activation of every task: runs on the task's own stack.
extern "C" fn task_startup(arg: *mut c_void) {
    // Safety: `arg` is the TCB address planted by Task::create; the worker's
    // Arc keeps it alive for as long as the task can run.
    let ct: Arc<Task> = unsafe {
        let raw = arg as *const Task;
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    };

    ct.start_running();

    let f = unsafe { (*ct.entry.get()).take() }.expect("task started twice");
    // A panic must not unwind into the context-switch shim; treat it as an
    // early exit.
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let what = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".into());
        error!("task {} panicked: {}", ct.uid(), what);
    }

    finish_off(ct);
}
