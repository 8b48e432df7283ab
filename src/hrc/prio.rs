/*! The task priority function family.

Fourteen numbered demand functions over the tallies `in` (items pending on
the task's input streams) and `out` (items pending on its outputs). `None`
tallies mark entry tasks (no countable input) and exit tasks (no countable
output); the numbered functions give those the extreme values tabulated
below. Function 14, the default, is plain `in - out`.

```text
 f       middle task          entry task      exit task
 1,2    (I+1)/(O+1)           0               MAX   resp.  I+1
 3,4    (I+1)/(O+1)           1/(O+1)         MAX   resp.  I+1
 5,6    (I+1)^2/(O+1)         0               MAX   resp.  (I+1)^2
 7,8    (I+1)^2/(O+1)         1/(O+1)         MAX   resp.  (I+1)^2
 9,10   (I+1)/(O+1)^2         0               MAX   resp.  I+1
 11,12  (I+1)/(O+1)^2         1/(O+1)^2       MAX   resp.  I+1
 13     random
 14     I - O                 -O              I
```

The negative-demand limit turns an over-producing entry task's priority into
the parking sentinel; the master keeps a parked task in the heap but never
hands it to a worker. A later neighbour update (downstream draining) raises
the priority again.
*/

use std::sync::Arc;

use crate::config::PrioPolicy;
use crate::runtime;
use crate::stream::StreamKind;
use crate::task::Task;

/// Heap key meaning "do not schedule": below every priority any demand
/// function can produce.
pub(crate) const PRIO_PARKED: f64 = f64::NEG_INFINITY;

pub(crate) type PrioFn = fn(Option<i64>, Option<i64>) -> f64;

fn i(v: Option<i64>) -> f64 {
    v.unwrap_or(0) as f64
}

fn priorfunc1(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, _) => 0.0,
        (_, None) => f64::MAX,
        (Some(inn), Some(out)) => (inn as f64 + 1.0) / (out as f64 + 1.0),
    }
}

fn priorfunc2(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, _) => 0.0,
        (Some(inn), None) => inn as f64 + 1.0,
        (Some(inn), Some(out)) => (inn as f64 + 1.0) / (out as f64 + 1.0),
    }
}

fn priorfunc3(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, out) => 1.0 / (1.0 + i(out)),
        (_, None) => f64::MAX,
        (Some(inn), Some(out)) => (inn as f64 + 1.0) / (out as f64 + 1.0),
    }
}

fn priorfunc4(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, out) => 1.0 / (1.0 + i(out)),
        (Some(inn), None) => inn as f64 + 1.0,
        (Some(inn), Some(out)) => (inn as f64 + 1.0) / (out as f64 + 1.0),
    }
}

fn priorfunc5(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, _) => 0.0,
        (_, None) => f64::MAX,
        (Some(inn), Some(out)) => {
            let inn = inn as f64 + 1.0;
            inn * inn / (out as f64 + 1.0)
        }
    }
}

fn priorfunc6(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, _) => 0.0,
        (Some(inn), None) => {
            let inn = inn as f64 + 1.0;
            inn * inn
        }
        (Some(inn), Some(out)) => {
            let inn = inn as f64 + 1.0;
            inn * inn / (out as f64 + 1.0)
        }
    }
}

fn priorfunc7(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, out) => 1.0 / (1.0 + i(out)),
        (_, None) => f64::MAX,
        (Some(inn), Some(out)) => {
            let inn = inn as f64 + 1.0;
            inn * inn / (out as f64 + 1.0)
        }
    }
}

fn priorfunc8(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, out) => 1.0 / (1.0 + i(out)),
        (Some(inn), None) => {
            let inn = inn as f64 + 1.0;
            inn * inn
        }
        (Some(inn), Some(out)) => {
            let inn = inn as f64 + 1.0;
            inn * inn / (out as f64 + 1.0)
        }
    }
}

fn priorfunc9(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, _) => 0.0,
        (_, None) => f64::MAX,
        (Some(inn), Some(out)) => {
            let out = out as f64 + 1.0;
            (inn as f64 + 1.0) / out / out
        }
    }
}

fn priorfunc10(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, _) => 0.0,
        (Some(inn), None) => inn as f64 + 1.0,
        (Some(inn), Some(out)) => {
            let out = out as f64 + 1.0;
            (inn as f64 + 1.0) / out / out
        }
    }
}

fn priorfunc11(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, out) => {
            let out = i(out) + 1.0;
            1.0 / out / out
        }
        (_, None) => f64::MAX,
        (Some(inn), Some(out)) => {
            let out = out as f64 + 1.0;
            (inn as f64 + 1.0) / out / out
        }
    }
}

fn priorfunc12(inn: Option<i64>, out: Option<i64>) -> f64 {
    match (inn, out) {
        (None, out) => {
            let out = i(out) + 1.0;
            1.0 / out / out
        }
        (Some(inn), None) => inn as f64 + 1.0,
        (Some(inn), Some(out)) => {
            let out = out as f64 + 1.0;
            (inn as f64 + 1.0) / out / out
        }
    }
}

fn priorrandom(_inn: Option<i64>, _out: Option<i64>) -> f64 {
    rand::random::<f64>()
}

fn priorfunc14(inn: Option<i64>, out: Option<i64>) -> f64 {
    i(inn) - i(out)
}

pub(crate) fn prio_fn(index: u8) -> PrioFn {
    match index {
        1 => priorfunc1,
        2 => priorfunc2,
        3 => priorfunc3,
        4 => priorfunc4,
        5 => priorfunc5,
        6 => priorfunc6,
        7 => priorfunc7,
        8 => priorfunc8,
        9 => priorfunc9,
        10 => priorfunc10,
        11 => priorfunc11,
        12 => priorfunc12,
        13 => priorrandom,
        _ => priorfunc14,
    }
}

/// Tally the countable pending items of one stream list. `None` flags an
/// entry/exit task: either the list is empty, or it holds only entry/exit
/// streams with nothing pending.
fn count_items(list: &[Arc<dyn crate::stream::StreamTally>], skip: StreamKind) -> Option<i64> {
    if list.is_empty() {
        return None;
    }
    let mut cnt: i64 = 0;
    let mut skipped = false;
    for s in list {
        if s.kind() == skip {
            skipped = true;
        } else {
            cnt += s.fill() as i64;
        }
    }
    if skipped && cnt == 0 {
        None
    } else {
        Some(cnt)
    }
}

/// Evaluate the configured priority function for a task.
pub(crate) fn calc_priority(t: &Arc<Task>) -> f64 {
    let rt = runtime::get();
    let (inn, out) = {
        let si = t.sched.lock().unwrap();
        (
            count_items(&si.in_streams, StreamKind::Entry),
            count_items(&si.out_streams, StreamKind::Exit),
        )
    };

    match rt.prio_policy() {
        PrioPolicy::Static => t.sched.lock().unwrap().prior,
        PrioPolicy::Random => priorrandom(inn, out),
        PrioPolicy::Indexed(idx) => {
            // an over-producing entry task is parked until downstream drains
            if inn.is_none() {
                if let Some(limit) = rt.neg_demand_limit() {
                    if out.unwrap_or(0) > limit {
                        return PRIO_PARKED;
                    }
                }
            }
            prio_fn(idx)(inn, out)
        }
    }
}

/// Should the master refresh neighbour priorities after queue transitions?
pub(crate) fn update_neighbours() -> bool {
    !matches!(runtime::get().prio_policy(), PrioPolicy::Static)
}
