/*! MPSC mailboxes for inter-thread runtime messages.

Every worker (and the HRC master) owns exactly one mailbox. Any thread may
send to it; only the owning thread receives. Messages are delivered in FIFO
order and are never lost; in particular, a `Terminate`, once sent, is
guaranteed to be observed.

The implementation is a mutex + condvar around a `VecDeque`; the deque's ring
storage recycles message slots, so a mailbox stops allocating once it has
seen its high-water mark.
*/

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::sync::Arc;

use crate::task::Task;

/// Messages between workers, wrappers and the master.
pub(crate) enum WorkerMsg {
    /// Shut the receiving loop down (after its tasks are gone).
    Terminate,
    /// A blocked task owned by the receiver became ready.
    Wakeup(Arc<Task>),
    /// A newly created task is assigned to the receiver.
    Assign(Arc<Task>),
    /// HRC: worker `wid` asks the master for a task.
    Request(i32),
    /// DECEN: some task requested an SPMD rendezvous; wake up and look.
    SpmdReq(i32),
    /// HRC: worker hands a suspended task back to the master.
    Return(Arc<Task>),
    /// DECEN: a ready task migrates onto the receiving worker.
    TaskMig(Arc<Task>),
}

pub(crate) struct Mailbox {
    inbox: Mutex<VecDeque<WorkerMsg>>,
    notempty: Condvar,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            inbox: Mutex::new(VecDeque::new()),
            notempty: Condvar::new(),
        }
    }

    /// Append a message; never fails, never blocks (beyond the lock).
    pub fn send(&self, msg: WorkerMsg) {
        let mut inbox = self.inbox.lock().unwrap();
        let was_empty = inbox.is_empty();
        inbox.push_back(msg);
        if was_empty {
            self.notempty.notify_one();
        }
    }

    /// Block until a message arrives, then consume the head.
    pub fn recv(&self) -> WorkerMsg {
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            match inbox.pop_front() {
                Some(msg) => return msg,
                None => inbox = self.notempty.wait(inbox).unwrap(),
            }
        }
    }

    /// Consume the head if there is one.
    pub fn try_recv(&self) -> Option<WorkerMsg> {
        self.inbox.lock().unwrap().pop_front()
    }

    /// Non-blocking probe, used by workers to drain before sleeping. A missed
    /// message is picked up on the next loop iteration.
    pub fn has_incoming(&self) -> bool {
        !self.inbox.lock().unwrap().is_empty()
    }
}
