/*! Task placement and migration (DECEN).

Two cooperative policies decide when a task should move to another worker:

* RANDOM: at host-chosen checkpoints ([`crate::task::check_migrate`]), a
  coin weighted by `threshold` picks a uniformly random target worker.
* WAIT-PROP: at yield and wake-up time, a task migrates when its own wait
  ratio exceeds its worker's and the worker's exceeds the global average; the
  target is the most-waiting worker. The ratios come from the monitoring
  query hooks, so this policy silently disables itself unless the host
  installed all four.

The move itself is always the cooperative path: the task parks itself on its
worker and the worker forwards the TCB by mailbox.

The optional placement scheduler is an ordinary task on worker 0 that
periodically walks every worker's ready lanes and stamps migration targets;
the stamped task migrates at its next yield.
*/

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::debug;
use rand::Rng;

use crate::runtime;
use crate::task::{self, Placement, Task};

/// Migration policy selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MigrationPolicy {
    Disabled,
    /// Migrate with probability `1 - threshold` at every checkpoint.
    Random { threshold: f64 },
    /// Migrate on wait-ratio imbalance (needs the monitoring query hooks).
    WaitProp,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationConfig {
    pub policy: MigrationPolicy,
}

lazy_static! {
    static ref TM_CONF: Mutex<MigrationPolicy> = Mutex::new(MigrationPolicy::Disabled);
}

/// Choose the process-wide migration policy. May be called any time after
/// `runtime::init`.
pub fn init(cfg: MigrationConfig) {
    *TM_CONF.lock().unwrap() = cfg.policy;
}

pub(crate) fn policy() -> MigrationPolicy {
    *TM_CONF.lock().unwrap()
}

pub(crate) fn random_enabled() -> bool {
    matches!(policy(), MigrationPolicy::Random { .. })
}

/// RANDOM policy: pick a target worker, or `None` to stay put.
pub(crate) fn pick_target() -> Option<i32> {
    let MigrationPolicy::Random { threshold } = policy() else {
        return None;
    };
    let mut rng = rand::thread_rng();
    if rng.gen::<f64>() > threshold {
        Some(rng.gen_range(0..runtime::get().worker_count() as i32))
    } else {
        None
    }
}

/// WAIT-PROP policy: consult the monitoring ratios for `t`. `None` when the
/// policy is off, a hook is missing, or the ratios say "stay".
pub(crate) fn wait_prop_target(t: &Arc<Task>) -> Option<i32> {
    if policy() != MigrationPolicy::WaitProp {
        return None;
    }
    if runtime::get().backend() != crate::config::Backend::Decen {
        return None;
    }
    let mon = t.mon_handle()?;
    let cb = runtime::get().mon_owned();
    let task_wait = cb.get_task_wait_prop.as_ref()?(&mon);
    let worker_wait = cb.get_worker_wait_prop.as_ref()?(&mon);
    let global_wait = cb.get_global_wait_prop.as_ref()?();
    if task_wait > worker_wait && worker_wait > global_wait {
        Some(cb.worker_most_wait_prop.as_ref()?())
    } else {
        None
    }
}

const PLACEMENT_PERIOD: Duration = Duration::from_millis(1);

/// Spawn the placement scheduler task on worker 0.
pub(crate) fn spawn_placement_task() {
    let h = Task::create(Placement::Worker(0), placement_body, 0);
    h.start();
    debug!("placement scheduler task {} started", h.uid());
}

fn placement_body() {
    let rt = runtime::get();
    let mut next_sweep = Instant::now() + PLACEMENT_PERIOD;
    while !rt.is_terminating() {
        if Instant::now() >= next_sweep {
            next_sweep = Instant::now() + PLACEMENT_PERIOD;
            for wc in rt.workers() {
                let Some(sched) = &wc.sched else { continue };
                sched.for_each_ready(|t| {
                    if let Some(target) = wait_prop_target(t) {
                        if target != wc.wid {
                            t.new_worker.store(target, Ordering::Relaxed);
                        }
                    }
                });
            }
        }
        task::yield_now();
    }
    /* runtime is shutting down; let worker 0 reach num_tasks == 0 */
}
