//! Shared test plumbing: the runtime is process-wide, so tests within one
//! binary take a gate before touching it.

use std::sync::{Mutex, MutexGuard};

lazy_static::lazy_static! {
    static ref RUNTIME_GATE: Mutex<()> = Mutex::new(());
}

pub fn runtime_gate() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    // a poisoned gate just means an earlier test failed; the runtime slot is
    // still consistent enough to report that failure
    RUNTIME_GATE.lock().unwrap_or_else(|e| e.into_inner())
}
