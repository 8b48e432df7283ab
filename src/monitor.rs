/*! Monitoring callback table.

The host may observe the runtime through a table of optional hooks stamped
into the [`Config`](crate::Config) at init. Every hook is checked for
presence before each dispatch, so an empty table costs a branch per event.

Handles are opaque: the `*_create`/`open` hooks return an
`Arc<dyn Any + Send + Sync>` of the host's choosing, and later events for the
same entity hand that value back. Hooks run on the calling task's worker and
must not block.
*/

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::stream::Mode;
use crate::task::TaskState;

/// Opaque monitoring handle, produced and consumed by the host's hooks.
pub type MonHandle = Arc<dyn Any + Send + Sync>;

macro_rules! hook {
    ($($arg:ty),* $(=> $ret:ty)?) => {
        Option<Arc<dyn Fn($($arg),*) $(-> $ret)? + Send + Sync>>
    };
}

/// The callback table. All fields default to `None`.
#[derive(Default, Clone)]
pub struct MonitoringCallbacks {
    /* worker hooks */
    pub worker_create: hook!(i32 => Option<MonHandle>),
    pub worker_create_wrapper: hook!(&MonHandle => Option<MonHandle>),
    pub worker_destroy: hook!(&MonHandle),
    pub worker_waitstart: hook!(&MonHandle),
    pub worker_waitstop: hook!(&MonHandle),

    /* task hooks; there is no creation hook, the host attaches a handle
     * through TaskHandle::monitor */
    pub task_destroy: hook!(&MonHandle),
    pub task_assign: hook!(&MonHandle, Option<&MonHandle>),
    pub task_start: hook!(&MonHandle),
    pub task_stop: hook!(&MonHandle, TaskState),
    pub task_ready: hook!(&MonHandle),

    /* wait-ratio queries for WAIT-PROP migration */
    pub get_task_wait_prop: hook!(&MonHandle => f64),
    pub get_worker_wait_prop: hook!(&MonHandle => f64),
    pub get_global_wait_prop: hook!(=> f64),
    pub worker_most_wait_prop: hook!(=> i32),

    /* stream hooks */
    pub stream_open: hook!(Option<&MonHandle>, u32, Mode => Option<MonHandle>),
    pub stream_close: hook!(&MonHandle),
    pub stream_replace: hook!(&MonHandle, u32),
    pub stream_readprepare: hook!(&MonHandle),
    pub stream_readfinish: hook!(&MonHandle),
    pub stream_writeprepare: hook!(&MonHandle),
    pub stream_writefinish: hook!(&MonHandle),
    pub stream_blockon: hook!(&MonHandle),
    pub stream_wakeup: hook!(&MonHandle),
}

impl fmt::Debug for MonitoringCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringCallbacks").finish_non_exhaustive()
    }
}

impl MonitoringCallbacks {
    /* Dispatch helpers: every call site funnels through these, which
     * centralises the handle-and-hook presence checks. */

    pub(crate) fn on_worker_create(&self, wid: i32) -> Option<MonHandle> {
        self.worker_create.as_ref().and_then(|f| f(wid))
    }

    pub(crate) fn on_worker_create_wrapper(&self, tm: &Option<MonHandle>) -> Option<MonHandle> {
        match (&self.worker_create_wrapper, tm) {
            (Some(f), Some(tm)) => f(tm),
            _ => None,
        }
    }

    pub(crate) fn on_worker_destroy(&self, wm: &Option<MonHandle>) {
        if let (Some(f), Some(wm)) = (&self.worker_destroy, wm) {
            f(wm);
        }
    }

    pub(crate) fn on_worker_waitstart(&self, wm: &Option<MonHandle>) {
        if let (Some(f), Some(wm)) = (&self.worker_waitstart, wm) {
            f(wm);
        }
    }

    pub(crate) fn on_worker_waitstop(&self, wm: &Option<MonHandle>) {
        if let (Some(f), Some(wm)) = (&self.worker_waitstop, wm) {
            f(wm);
        }
    }

    pub(crate) fn on_task_destroy(&self, tm: &Option<MonHandle>) {
        if let (Some(f), Some(tm)) = (&self.task_destroy, tm) {
            f(tm);
        }
    }

    pub(crate) fn on_task_assign(&self, tm: &Option<MonHandle>, wm: &Option<MonHandle>) {
        if let (Some(f), Some(tm)) = (&self.task_assign, tm) {
            f(tm, wm.as_ref());
        }
    }

    pub(crate) fn on_task_start(&self, tm: &Option<MonHandle>) {
        if let (Some(f), Some(tm)) = (&self.task_start, tm) {
            f(tm);
        }
    }

    pub(crate) fn on_task_stop(&self, tm: &Option<MonHandle>, state: TaskState) {
        if let (Some(f), Some(tm)) = (&self.task_stop, tm) {
            f(tm, state);
        }
    }

    pub(crate) fn on_task_ready(&self, tm: &Option<MonHandle>) {
        if let (Some(f), Some(tm)) = (&self.task_ready, tm) {
            f(tm);
        }
    }

    pub(crate) fn on_stream_open(
        &self,
        tm: &Option<MonHandle>,
        sid: u32,
        mode: Mode,
    ) -> Option<MonHandle> {
        self.stream_open.as_ref().and_then(|f| f(tm.as_ref(), sid, mode))
    }

    pub(crate) fn on_stream_close(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_close, sm) {
            f(sm);
        }
    }

    pub(crate) fn on_stream_replace(&self, sm: &Option<MonHandle>, sid: u32) {
        if let (Some(f), Some(sm)) = (&self.stream_replace, sm) {
            f(sm, sid);
        }
    }

    pub(crate) fn on_stream_readprepare(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_readprepare, sm) {
            f(sm);
        }
    }

    pub(crate) fn on_stream_readfinish(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_readfinish, sm) {
            f(sm);
        }
    }

    pub(crate) fn on_stream_writeprepare(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_writeprepare, sm) {
            f(sm);
        }
    }

    pub(crate) fn on_stream_writefinish(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_writefinish, sm) {
            f(sm);
        }
    }

    pub(crate) fn on_stream_blockon(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_blockon, sm) {
            f(sm);
        }
    }

    pub(crate) fn on_stream_wakeup(&self, sm: &Option<MonHandle>) {
        if let (Some(f), Some(sm)) = (&self.stream_wakeup, sm) {
            f(sm);
        }
    }
}
