/*! Process-wide runtime: lifecycle and thread placement.

The runtime is configured exactly once per lifetime with [`init`], brought up
with [`start`], wound down with [`stop`] and reclaimed with [`cleanup`] (after
which a fresh `init` is allowed again; test binaries cycle the runtime).
Between `init` and `start` the host creates its initial tasks and streams;
their `Assign` messages queue up in the worker mailboxes until the threads
spawn.

Thread placement follows the configuration: with `pinned`, worker slot `n`
goes to processor `n % proc_workers`; wrappers (and any other runtime
threads) share the `proc_others` processors above the worker range. With
`exclusive` the workers are additionally lifted into the real-time FIFO
class.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use log::{info, warn};

use crate::config::{self, Backend, Config, ConfigError, PrioPolicy};
use crate::hrc::MasterCtx;
use crate::mailbox::WorkerMsg;
use crate::monitor::MonitoringCallbacks;
use crate::spmd::SpmdRegistry;
use crate::worker::{self, WorkerCtx};

pub(crate) struct Runtime {
    cfg: Config,
    /// Pool workers (excluding the HRC master and all wrappers).
    workers: Vec<Arc<WorkerCtx>>,
    master: Option<Arc<MasterCtx>>,
    spmd: Option<SpmdRegistry>,
    started: AtomicBool,
    terminating: AtomicBool,
}

impl Runtime {
    pub fn backend(&self) -> Backend {
        self.cfg.backend
    }

    pub fn mon(&self) -> &MonitoringCallbacks {
        &self.cfg.mon
    }

    /// Cloned callback table, for callers that must not hold `self` borrowed.
    pub fn mon_owned(&self) -> MonitoringCallbacks {
        self.cfg.mon.clone()
    }

    pub fn prio_policy(&self) -> PrioPolicy {
        self.cfg.prio
    }

    pub fn neg_demand_limit(&self) -> Option<i64> {
        self.cfg.neg_demand_limit
    }

    /// The configured worker count (HRC: including the master).
    pub fn worker_count(&self) -> usize {
        self.cfg.num_workers
    }

    pub fn worker(&self, idx: usize) -> Arc<WorkerCtx> {
        self.workers
            .get(idx)
            .unwrap_or_else(|| panic!("no worker with id {}", idx))
            .clone()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<WorkerCtx>> {
        self.workers.iter()
    }

    pub fn master(&self) -> &Arc<MasterCtx> {
        self.master.as_ref().expect("no master on this backend")
    }

    pub fn spmd(&self) -> Option<&SpmdRegistry> {
        self.spmd.as_ref()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }
}

lazy_static! {
    static ref RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);
}

pub(crate) fn get() -> Arc<Runtime> {
    try_get().expect("runtime not initialised")
}

pub(crate) fn try_get() -> Option<Arc<Runtime>> {
    RUNTIME.read().unwrap().clone()
}

/// Install the process-wide configuration and build the worker table (with
/// mailboxes), the master context (HRC) and the SPMD registry (DECEN).
pub fn init(cfg: Config) -> Result<(), ConfigError> {
    config::validate(&cfg, Some(num_cpus::get()))?;

    let mut slot = RUNTIME.write().unwrap();
    if slot.is_some() {
        return Err(ConfigError::Invalid(
            "runtime already initialised (cleanup first)".into(),
        ));
    }

    let (workers, master, spmd) = match cfg.backend {
        Backend::Decen => {
            let workers = (0..cfg.num_workers)
                .map(|i| WorkerCtx::new(i as i32, true))
                .collect::<Vec<_>>();
            (workers, None, Some(SpmdRegistry::new(cfg.num_workers)))
        }
        Backend::Hrc => {
            let pool = cfg.num_workers - 1; // one slot is the master
            let workers = (0..pool)
                .map(|i| WorkerCtx::new(i as i32, false))
                .collect::<Vec<_>>();
            (workers, Some(MasterCtx::new(pool)), None)
        }
    };

    *slot = Some(Arc::new(Runtime {
        cfg,
        workers,
        master,
        spmd,
        started: AtomicBool::new(false),
        terminating: AtomicBool::new(false),
    }));
    Ok(())
}

/// Spawn the worker threads (and the master under HRC).
pub fn start() -> Result<(), ConfigError> {
    let rt = get();
    if rt.started.swap(true, Ordering::AcqRel) {
        return Err(ConfigError::Invalid("runtime already started".into()));
    }

    if let Some(master) = &rt.master {
        let mc = master.clone();
        let handle = std::thread::Builder::new()
            .name("loom-master".into())
            .spawn(move || crate::hrc::master_thread(mc))
            .map_err(|e| ConfigError::Invalid(format!("spawning master: {}", e)))?;
        *master.thread.lock().unwrap() = Some(handle);
    }

    for wc in rt.workers() {
        let thread_wc = wc.clone();
        let handle = std::thread::Builder::new()
            .name(format!("loom-worker{}", wc.wid))
            .spawn(move || worker::worker_thread(thread_wc))
            .map_err(|e| ConfigError::Invalid(format!("spawning worker: {}", e)))?;
        *wc.thread.lock().unwrap() = Some(handle);
    }

    if rt.cfg.placement {
        crate::migration::spawn_placement_task();
    }

    info!(
        "runtime up: {:?}, {} workers, {} worker procs, {} other procs",
        rt.cfg.backend, rt.cfg.num_workers, rt.cfg.proc_workers, rt.cfg.proc_others
    );
    Ok(())
}

/// Begin termination. DECEN: broadcast `Terminate` to every worker. HRC: tell
/// the master, which drains its heap and then stops the workers.
pub fn stop() {
    let rt = get();
    rt.terminating.store(true, Ordering::Release);
    match rt.backend() {
        Backend::Decen => worker::terminate_all(),
        Backend::Hrc => rt.master().mailbox.send(WorkerMsg::Terminate),
    }
    info!("runtime stopping");
}

/// Join all runtime threads and drop the worker table. The runtime slot is
/// freed; a new `init` may follow.
pub fn cleanup() {
    let rt = get();
    if let Some(master) = &rt.master {
        if let Some(handle) = master.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
    for wc in rt.workers() {
        if let Some(handle) = wc.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
    drop(rt);
    *RUNTIME.write().unwrap() = None;
    info!("runtime cleaned up");
}

/// Total workers as configured (HRC: including the master).
pub fn worker_count() -> usize {
    get().worker_count()
}

/// Number of online processors.
pub fn available_cores() -> usize {
    num_cpus::get()
}

/// Pin the calling thread according to its slot: `slot >= 0` is a worker
/// processor slot, `slot < 0` means "others" (wrappers etc).
pub(crate) fn thread_assign(slot: i32) {
    let rt = get();
    let cfg = &rt.cfg;
    if slot >= 0 {
        if cfg.flags.pinned {
            set_affinity(std::iter::once(slot as usize % cfg.proc_workers));
            if cfg.flags.exclusive {
                set_realtime();
            }
        } else {
            set_affinity(0..cfg.proc_workers);
        }
    } else if cfg.proc_others > 0 {
        set_affinity(cfg.proc_workers..cfg.proc_workers + cfg.proc_others);
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(cpus: impl IntoIterator<Item = usize>) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for cpu in cpus {
        if set.set(cpu).is_err() {
            warn!("cpu {} out of range for affinity mask", cpu);
        }
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!("could not pin thread: {}", e);
    }
}

/// Thread affinity is not exposed on this platform; pinning degrades to a
/// no-op (the PINNED flag still validates).
#[cfg(not(target_os = "linux"))]
fn set_affinity(cpus: impl IntoIterator<Item = usize>) {
    let _ = cpus.into_iter();
}

fn set_realtime() {
    let param = libc::sched_param { sched_priority: 1 };
    let rc = unsafe {
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if rc != 0 {
        warn!("could not enter the real-time class (errno {})", rc);
    }
}
