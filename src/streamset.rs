/*! Stream sets and multi-stream poll.

A [`StreamSet`] collects the reader descriptors one task wants to wait on.
[`StreamSet::poll`] blocks the calling task until at least one of them has an
item, and returns the descriptor that caused the wake-up. After a successful
poll the set's iteration order is rotated so that the next scan starts right
*after* the stream that delivered, the fairness guarantee that keeps one
busy stream from monopolising the consumer.

The wake-up arbitration: the consumer plants a token on itself and an
`is_poll` flag on every empty stream (under each stream's producer lock). The
first producer to write into any of those streams exchanges the token; only
the producer that obtains the 1 wakes the consumer. If the consumer finds data
during the arming pass it tries to claim its own token and, on success, skips
the context switch entirely.
*/

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::stream::{PollArm, StreamDesc};
use crate::task::Task;

/// An ordered collection of reader descriptors belonging to one task.
///
/// Must only ever be used by the task that opened the descriptors.
pub struct StreamSet<T: Send + 'static> {
    items: Vec<Arc<StreamDesc<T>>>,
}

impl<T: Send + 'static> Default for StreamSet<T> {
    fn default() -> Self {
        StreamSet::new()
    }
}

impl<T: Send + 'static> StreamSet<T> {
    pub fn new() -> StreamSet<T> {
        StreamSet { items: Vec::new() }
    }

    /// Add a descriptor to the set.
    pub fn put(&mut self, sd: Arc<StreamDesc<T>>) {
        self.items.push(sd);
    }

    /// Remove a descriptor; returns whether it was present.
    pub fn remove(&mut self, sd: &Arc<StreamDesc<T>>) -> bool {
        match self.items.iter().position(|x| Arc::ptr_eq(x, sd)) {
            Some(i) => {
                self.items.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Rotate so that `idx` becomes the last element: the next scan starts
    /// one past the stream that just delivered.
    fn rotate_after(&mut self, idx: usize) {
        let len = self.items.len();
        self.items.rotate_left((idx + 1) % len);
    }

    /// Wait for data on any stream in the set.
    ///
    /// # Panics
    ///
    /// The set must not be empty, and every descriptor must belong to the
    /// calling task.
    pub fn poll(&mut self) -> Arc<StreamDesc<T>> {
        assert!(!self.items.is_empty(), "poll on an empty stream set");
        let self_task: Arc<Task> = self.items[0].task.clone();

        // 1. Fast path: scan for a stream that already has data.
        for i in 0..self.items.len() {
            if self.items[i].has_data() {
                let sd = self.items[i].clone();
                self.rotate_after(i);
                return sd;
            }
        }

        // 2. Place the poll token, then arm every stream under its producer
        //    lock. Finding data during this pass means racing the producers
        //    for our own token.
        self_task.poll_token.store(1, Ordering::Release);

        let mut armed = 0usize;
        let mut do_ctx_switch = true;
        for i in 0..self.items.len() {
            match self.items[i].poll_arm(&self_task) {
                PollArm::Armed => armed += 1,
                PollArm::DataClaimed => {
                    do_ctx_switch = false;
                    let erased: Arc<dyn std::any::Any + Send + Sync> = self.items[i].clone();
                    *self_task.wakeup_sd.lock().unwrap() = Some(erased);
                    break;
                }
                PollArm::DataNotClaimed => {
                    /* the winning producer also sets our wakeup_sd */
                    break;
                }
            }
        }

        // 3. Sleep until the winning producer wakes us.
        if do_ctx_switch {
            self_task.block_on_stream();
        }
        debug_assert_eq!(self_task.poll_token.load(Ordering::Acquire), 0);

        // 4. Disarm. Necessary even on the no-switch path: a consumer that
        //    closes a stream while its producer still sees is_poll would let
        //    the producer chase a dangling descriptor.
        for sd in &self.items {
            if armed == 0 {
                break;
            }
            sd.clear_poll();
            armed -= 1;
        }

        // 5. Rotate the hook to the stream that woke us.
        let erased = self_task
            .wakeup_sd
            .lock()
            .unwrap()
            .take()
            .expect("poll: woken without a wakeup descriptor. Please report this error.");
        let sd = erased
            .downcast::<StreamDesc<T>>()
            .expect("poll: wakeup descriptor of a foreign item type. Please report this error.");
        let idx = self
            .items
            .iter()
            .position(|x| Arc::ptr_eq(x, &sd))
            .expect("poll: woken by a stream outside the set. Please report this error.");
        self.rotate_after(idx);
        sd
    }

    fn get(&self, idx: usize) -> Option<&Arc<StreamDesc<T>>> {
        self.items.get(idx)
    }
}

/// Explicit iterator over a stream set, with append/remove during iteration
/// (the shape collector-style tasks need when their stream population changes
/// underfoot).
pub struct StreamIter<'a, T: Send + 'static> {
    set: &'a mut StreamSet<T>,
    /// Index of the next element to yield.
    next: usize,
    /// Whether an element has been yielded and not removed.
    yielded: bool,
}

impl<'a, T: Send + 'static> StreamIter<'a, T> {
    pub fn new(set: &'a mut StreamSet<T>) -> StreamIter<'a, T> {
        StreamIter {
            set,
            next: 0,
            yielded: false,
        }
    }

    /// Restart from the beginning of the set.
    pub fn reset(&mut self) {
        self.next = 0;
        self.yielded = false;
    }

    pub fn has_next(&self) -> bool {
        self.next < self.set.items.len()
    }

    pub fn next(&mut self) -> Arc<StreamDesc<T>> {
        let sd = self
            .set
            .get(self.next)
            .expect("stream iterator ran past the end")
            .clone();
        self.next += 1;
        self.yielded = true;
        sd
    }

    /// Append a descriptor behind the iteration point; it will be yielded by
    /// this very iteration.
    pub fn append(&mut self, sd: Arc<StreamDesc<T>>) {
        self.set.items.push(sd);
    }

    /// Remove the element last yielded by `next`.
    pub fn remove(&mut self) {
        assert!(self.yielded, "remove before next");
        self.next -= 1;
        self.set.items.remove(self.next);
        self.yielded = false;
    }
}
