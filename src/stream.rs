/*! SPSC streams: the communication and synchronisation primitive.

A stream connects exactly one producer task to exactly one consumer task. To
use a stream a task must *open* it, which yields a stream descriptor; all
reads and writes go through the descriptor. Only streams are shared, never
descriptors.

Synchronisation is a pair of signed counting semaphores over atomics:

* `n_sem` counts items available to the reader. A read decrements it; a
  previous value of 0 means the buffer was empty and the reader blocks. The
  writer increments it after publishing; a previous value below 0 means the
  reader is blocked in there and must be woken.
* `e_sem` counts free slots, symmetrically, and only exists for bounded
  streams. The HRC backend builds unbounded streams and relies on priorities
  (and the negative-demand limit) to throttle producers instead.

A single outstanding blocker is encoded by the semaphore sitting at -1; with
one reader and one writer per stream there can never be more.

The producer-side lock guards exactly one thing: the `is_poll` flag that a
polling consumer plants on its streams (see [`crate::streamset`]). Writing
into an empty polled stream consults the flag under the lock and exchanges
the consumer's poll token to decide which of the competing producers (one
per polled stream) wakes the consumer. Exactly one wins.
*/

use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::buffer::Buffer;
use crate::config::Backend;
use crate::monitor::MonHandle;
use crate::runtime;
use crate::task::{self, Task};

static STREAM_SEQ: AtomicU32 = AtomicU32::new(0);

/// Default capacity of a bounded stream created with `capacity == 0`.
pub const DEFAULT_CAPACITY: usize = 16;

/// Direction a stream descriptor was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Entry/exit marking, consulted by the HRC priority tallies.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Normal = 0,
    Entry = 1,
    Exit = 2,
}

/// Type-erased view of a stream, held on the task's input/output lists. The
/// HRC master uses it to tally pending items and to walk a task's
/// neighbourhood without knowing the item type.
pub(crate) trait StreamTally: Send + Sync {
    fn uid(&self) -> u32;
    fn fill(&self) -> usize;
    fn kind(&self) -> StreamKind;
    fn producer_task(&self) -> Option<Arc<Task>>;
    fn consumer_task(&self) -> Option<Arc<Task>>;
}

/// A unidirectional SPSC stream of `T` items.
pub struct Stream<T: Send + 'static> {
    uid: u32,
    buffer: Buffer<T>,
    /// Items available; negative encodes a blocked reader.
    n_sem: AtomicI64,
    /// Free slots; negative encodes a blocked writer. `None` on unbounded
    /// (HRC) streams.
    e_sem: Option<AtomicI64>,
    /// Producer-side lock; the guarded bool is the `is_poll` flag.
    prod_lock: Mutex<bool>,
    cons_sd: Mutex<Option<Arc<StreamDesc<T>>>>,
    prod_sd: Mutex<Option<Arc<StreamDesc<T>>>>,
    kind: AtomicU8,
    usr_data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<T: Send + 'static> Stream<T> {
    /// Create a stream. `capacity == 0` selects the default of
    /// [`DEFAULT_CAPACITY`]. Under the HRC backend the stream is unbounded
    /// and `capacity` is ignored.
    pub fn create(capacity: usize) -> Arc<Stream<T>> {
        let rt = runtime::get();
        let buffer = match rt.backend() {
            Backend::Decen => Buffer::bounded(if capacity == 0 {
                DEFAULT_CAPACITY
            } else {
                capacity
            }),
            Backend::Hrc => Buffer::unbounded(),
        };
        let e_sem = buffer.capacity().map(|c| AtomicI64::new(c as i64));
        Arc::new(Stream {
            uid: STREAM_SEQ.fetch_add(1, Ordering::Relaxed),
            buffer,
            n_sem: AtomicI64::new(0),
            e_sem,
            prod_lock: Mutex::new(false),
            cons_sd: Mutex::new(None),
            prod_sd: Mutex::new(None),
            kind: AtomicU8::new(StreamKind::Normal as u8),
            usr_data: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.uid
    }

    /// Mark as an entry stream (feeds the graph from outside). HRC priority
    /// tallies skip it on the input side.
    pub fn mark_entry(&self) {
        self.kind.store(StreamKind::Entry as u8, Ordering::Relaxed);
    }

    /// Mark as an exit stream (drains the graph). HRC priority tallies skip
    /// it on the output side.
    pub fn mark_exit(&self) {
        self.kind.store(StreamKind::Exit as u8, Ordering::Relaxed);
    }

    /// Number of items currently buffered.
    pub fn fill_level(&self) -> usize {
        self.buffer.count()
    }

    pub fn set_user_data(&self, data: Box<dyn Any + Send>) {
        *self.usr_data.lock().unwrap() = Some(data);
    }

    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send>> {
        self.usr_data.lock().unwrap().take()
    }

    /// Open the stream for reading or writing.
    ///
    /// Must be called from within a task. At most one reader descriptor and
    /// one writer descriptor may exist per stream at any time.
    pub fn open(self: &Arc<Stream<T>>, mode: Mode) -> Arc<StreamDesc<T>> {
        let ct = task::current_arc();
        let rt = runtime::get();
        let mon = rt.mon().on_stream_open(&ct.mon_handle(), self.uid, mode);
        let sd = Arc::new(StreamDesc {
            task: ct.clone(),
            stream: Mutex::new(self.clone()),
            mode,
            mon,
        });
        match mode {
            Mode::Read => {
                let mut slot = self.cons_sd.lock().unwrap();
                assert!(slot.is_none(), "stream {} opened for reading twice", self.uid);
                *slot = Some(sd.clone());
            }
            Mode::Write => {
                let mut slot = self.prod_sd.lock().unwrap();
                assert!(slot.is_none(), "stream {} opened for writing twice", self.uid);
                *slot = Some(sd.clone());
            }
        }
        let tally: Arc<dyn StreamTally> = self.clone();
        ct.add_stream(tally, mode == Mode::Write);
        trace!("task {} opened stream {} for {:?}", ct.uid(), self.uid, mode);
        sd
    }

    fn consumer(&self) -> Option<Arc<StreamDesc<T>>> {
        self.cons_sd.lock().unwrap().clone()
    }

    fn producer(&self) -> Option<Arc<StreamDesc<T>>> {
        self.prod_sd.lock().unwrap().clone()
    }
}

impl<T: Send + 'static> StreamTally for Stream<T> {
    fn uid(&self) -> u32 {
        self.uid
    }

    fn fill(&self) -> usize {
        self.buffer.count()
    }

    fn kind(&self) -> StreamKind {
        match self.kind.load(Ordering::Relaxed) {
            1 => StreamKind::Entry,
            2 => StreamKind::Exit,
            _ => StreamKind::Normal,
        }
    }

    fn producer_task(&self) -> Option<Arc<Task>> {
        self.producer().map(|sd| sd.task.clone())
    }

    fn consumer_task(&self) -> Option<Arc<Task>> {
        self.consumer().map(|sd| sd.task.clone())
    }
}

/// A task's handle on a stream in one direction.
pub struct StreamDesc<T: Send + 'static> {
    pub(crate) task: Arc<Task>,
    /// Interior-mutable so `replace` can swap the stream underneath.
    stream: Mutex<Arc<Stream<T>>>,
    mode: Mode,
    mon: Option<MonHandle>,
}

impl<T: Send + 'static> StreamDesc<T> {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stream(&self) -> Arc<Stream<T>> {
        self.stream.lock().unwrap().clone()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream().uid
    }

    /// Non-blocking probe: is an item waiting?
    pub fn has_data(&self) -> bool {
        debug_assert_eq!(self.mode, Mode::Read);
        self.stream().buffer.has_top()
    }

    /// Non-blocking, non-consuming read of the head item.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        debug_assert_eq!(self.mode, Mode::Read);
        self.stream().buffer.top()
    }

    /// Blocking, consuming read. Suspends the calling task while the stream
    /// is empty.
    pub fn read(self: &Arc<Self>) -> T {
        debug_assert_eq!(self.mode, Mode::Read);
        let rt = runtime::get();
        rt.mon().on_stream_readprepare(&self.mon);

        let s = self.stream();
        // quasi P(n_sem)
        if s.n_sem.fetch_sub(1, Ordering::AcqRel) == 0 {
            rt.mon().on_stream_blockon(&self.mon);
            self.task.block_on_stream();
        }

        let item = s
            .buffer
            .pop()
            .expect("read: semaphore granted an empty buffer. Please report this error.");

        // quasi V(e_sem)
        if let Some(e_sem) = &s.e_sem {
            if e_sem.fetch_add(1, Ordering::AcqRel) < 0 {
                /* e_sem was -1: the producer is blocked in there */
                let prod = s
                    .producer_task()
                    .expect("read: blocked producer vanished. Please report this error.");
                Task::unblock(&self.task, &prod);
                rt.mon().on_stream_wakeup(&self.mon);
            }
        }

        rt.mon().on_stream_readfinish(&self.mon);
        item
    }

    /// Blocking write. Suspends the calling task while the stream is full
    /// (bounded streams only; HRC streams never push back).
    pub fn write(self: &Arc<Self>, item: T) {
        debug_assert_eq!(self.mode, Mode::Write);
        let rt = runtime::get();
        self.task.check_yield();
        rt.mon().on_stream_writeprepare(&self.mon);

        let s = self.stream();
        // quasi P(e_sem)
        if let Some(e_sem) = &s.e_sem {
            if e_sem.fetch_sub(1, Ordering::AcqRel) == 0 {
                rt.mon().on_stream_blockon(&self.mon);
                self.task.block_on_stream();
            }
        }

        // Publishing the item and checking for a polling consumer must be one
        // atomic step; that is the sole purpose of the producer lock.
        let mut poll_wakeup = false;
        {
            let mut is_poll = s.prod_lock.lock().unwrap();
            assert!(s.buffer.is_space());
            s.buffer.put(item);
            if *is_poll {
                // claim the consumer's poll token; only one producer across
                // all polled streams gets the 1
                if let Some(cons) = s.consumer() {
                    poll_wakeup = cons.task.poll_token.swap(0, Ordering::AcqRel) == 1;
                }
                *is_poll = false;
            }
        }

        // quasi V(n_sem)
        if s.n_sem.fetch_add(1, Ordering::AcqRel) < 0 {
            /* n_sem was -1: the consumer is blocked in a plain read */
            let cons = s
                .consumer_task()
                .expect("write: blocked consumer vanished. Please report this error.");
            Task::unblock(&self.task, &cons);
            rt.mon().on_stream_wakeup(&self.mon);
        } else if poll_wakeup {
            /* we are the sole producer waking the polling consumer */
            let cons_sd = s
                .consumer()
                .expect("write: polling consumer vanished. Please report this error.");
            let erased: Arc<dyn Any + Send + Sync> = cons_sd.clone();
            *cons_sd.task.wakeup_sd.lock().unwrap() = Some(erased);
            Task::unblock(&self.task, &cons_sd.task);
            rt.mon().on_stream_wakeup(&self.mon);
        }

        rt.mon().on_stream_writefinish(&self.mon);
    }

    /// Non-blocking write: hands the item back if the stream is full.
    pub fn try_write(self: &Arc<Self>, item: T) -> Result<(), T> {
        debug_assert_eq!(self.mode, Mode::Write);
        if !self.stream().buffer.is_space() {
            return Err(item);
        }
        self.write(item);
        Ok(())
    }

    /// Close the descriptor. With `destroy` set, tear the stream down as
    /// well (the closer must be the last side still open).
    pub fn close(&self, destroy: bool) {
        let rt = runtime::get();
        rt.mon().on_stream_close(&self.mon);
        let s = self.stream();
        self.task.remove_stream(s.uid, self.mode == Mode::Write);
        match self.mode {
            Mode::Read => *s.cons_sd.lock().unwrap() = None,
            Mode::Write => *s.prod_sd.lock().unwrap() = None,
        }
        if destroy {
            *s.cons_sd.lock().unwrap() = None;
            *s.prod_sd.lock().unwrap() = None;
        }
        trace!("task {} closed stream {}", self.task.uid(), s.uid);
    }

    /// Replace the stream this (reader) descriptor points at; the old stream
    /// is torn down.
    pub fn replace(self: &Arc<Self>, snew: &Arc<Stream<T>>) {
        assert_eq!(self.mode, Mode::Read);
        let rt = runtime::get();
        let old = {
            let mut slot = self.stream.lock().unwrap();
            std::mem::replace(&mut *slot, snew.clone())
        };
        // tear down the old stream
        *old.cons_sd.lock().unwrap() = None;
        *old.prod_sd.lock().unwrap() = None;
        self.task.remove_stream(old.uid, false);
        // become the new stream's consumer
        *snew.cons_sd.lock().unwrap() = Some(self.clone());
        let tally: Arc<dyn StreamTally> = snew.clone();
        self.task.add_stream(tally, false);
        rt.mon().on_stream_replace(&self.mon, snew.uid);
    }

    /// One arming step of the poll protocol, under the producer lock: if the
    /// buffer is empty, plant the `is_poll` flag; otherwise try to claim the
    /// polling task's own token to decide whether a producer beat us to the
    /// wake-up.
    pub(crate) fn poll_arm(&self, poller: &Arc<Task>) -> PollArm {
        let s = self.stream();
        let mut is_poll = s.prod_lock.lock().unwrap();
        if s.buffer.has_top() {
            if poller.poll_token.swap(0, Ordering::AcqRel) == 1 {
                /* nobody woke us yet, no context switch needed */
                PollArm::DataClaimed
            } else {
                /* a producer already claimed the token and will wake us */
                PollArm::DataNotClaimed
            }
        } else {
            *is_poll = true;
            PollArm::Armed
        }
    }

    pub(crate) fn clear_poll(&self) {
        let s = self.stream();
        *s.prod_lock.lock().unwrap() = false;
    }
}

/// Outcome of [`StreamDesc::poll_arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollArm {
    /// Buffer empty; `is_poll` planted.
    Armed,
    /// Data present and we claimed our own token: skip the context switch.
    DataClaimed,
    /// Data present but a producer holds the token and will wake us.
    DataNotClaimed,
}

