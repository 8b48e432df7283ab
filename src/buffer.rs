/*! SPSC item buffers backing streams.

Two shapes, one interface:

* [`Bounded`]: a circular buffer in the FastForward style: the producer only
  ever touches the write index, the consumer only the read index, and the two
  indices live on separate cache lines. A slot holding `None` is empty.
* [`Unbounded`]: a stub-headed linked queue; the producer appends at the
  tail, the consumer pops behind the head. Used by the HRC backend, which
  throttles producers by priority instead of by blocking.

Neither shape synchronises access on its own: the surrounding stream's
semaphore pair guarantees the producer never writes into a full buffer and the
consumer never pops from an empty one. The shared fill counter is the only
cross-thread rendezvous (release on publish, acquire on observe), which is
what makes the non-consuming `top` probe safe from the consumer side.
*/

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub(crate) enum Buffer<T> {
    Bounded(Bounded<T>),
    Unbounded(Unbounded<T>),
}

impl<T> Buffer<T> {
    pub fn bounded(capacity: usize) -> Buffer<T> {
        Buffer::Bounded(Bounded::new(capacity))
    }

    pub fn unbounded() -> Buffer<T> {
        Buffer::Unbounded(Unbounded::new())
    }

    /// `Some(cap)` for a bounded buffer, `None` for unbounded.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Buffer::Bounded(b) => Some(b.capacity),
            Buffer::Unbounded(_) => None,
        }
    }

    /// Producer side: is there room for another item?
    pub fn is_space(&self) -> bool {
        match self {
            Buffer::Bounded(b) => b.is_space(),
            Buffer::Unbounded(_) => true,
        }
    }

    /// Producer side: append an item. There must be space.
    pub fn put(&self, item: T) {
        match self {
            Buffer::Bounded(b) => b.put(item),
            Buffer::Unbounded(u) => u.put(item),
        }
    }

    /// Is an item visible at the head? Callable from either side.
    pub fn has_top(&self) -> bool {
        self.count() > 0
    }

    /// Consumer side: clone the head without consuming it.
    pub fn top(&self) -> Option<T>
    where
        T: Clone,
    {
        match self {
            Buffer::Bounded(b) => b.top(),
            Buffer::Unbounded(u) => u.top(),
        }
    }

    /// Consumer side: pop the head.
    pub fn pop(&self) -> Option<T> {
        match self {
            Buffer::Bounded(b) => b.pop(),
            Buffer::Unbounded(u) => u.pop(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Buffer::Bounded(b) => b.count.load(Ordering::Acquire),
            Buffer::Unbounded(u) => u.count.load(Ordering::Acquire),
        }
    }
}

/// Bounded SPSC circular buffer.
pub(crate) struct Bounded<T> {
    pread: CachePadded<Cell<usize>>,
    pwrite: CachePadded<Cell<usize>>,
    count: AtomicUsize,
    capacity: usize,
    data: Box<[UnsafeCell<Option<T>>]>,
}

// Safety: the stream layer admits at most one producer (touching pwrite and
// the slot it indexes) and at most one consumer (touching pread likewise);
// publication order is count-Release before count-Acquire.
unsafe impl<T: Send> Send for Bounded<T> {}
unsafe impl<T: Send> Sync for Bounded<T> {}

impl<T> Bounded<T> {
    fn new(capacity: usize) -> Bounded<T> {
        assert!(capacity > 0, "bounded buffer needs capacity >= 1");
        let data = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Bounded {
            pread: CachePadded::new(Cell::new(0)),
            pwrite: CachePadded::new(Cell::new(0)),
            count: AtomicUsize::new(0),
            capacity,
            data,
        }
    }

    fn is_space(&self) -> bool {
        self.count.load(Ordering::Acquire) < self.capacity
    }

    fn put(&self, item: T) {
        debug_assert!(self.is_space());
        let w = self.pwrite.get();
        unsafe { *self.data[w].get() = Some(item) };
        self.pwrite.set(if w + 1 >= self.capacity { 0 } else { w + 1 });
        self.count.fetch_add(1, Ordering::Release);
    }

    fn top(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let r = self.pread.get();
        unsafe { (*self.data[r].get()).clone() }
    }

    fn pop(&self) -> Option<T> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let r = self.pread.get();
        let item = unsafe { (*self.data[r].get()).take() };
        debug_assert!(item.is_some());
        self.pread.set(if r + 1 >= self.capacity { 0 } else { r + 1 });
        self.count.fetch_sub(1, Ordering::Release);
        item
    }
}

struct Node<T> {
    data: Option<T>,
    next: *mut Node<T>,
}

/// Unbounded SPSC linked queue with a stub head node.
pub(crate) struct Unbounded<T> {
    head: CachePadded<Cell<*mut Node<T>>>,
    tail: CachePadded<Cell<*mut Node<T>>>,
    count: AtomicUsize,
}

// Safety: same single-producer/single-consumer discipline as Bounded; the
// `next` link of the tail node is published via the count Release.
unsafe impl<T: Send> Send for Unbounded<T> {}
unsafe impl<T: Send> Sync for Unbounded<T> {}

impl<T> Unbounded<T> {
    fn new() -> Unbounded<T> {
        let stub = Box::into_raw(Box::new(Node {
            data: None,
            next: ptr::null_mut(),
        }));
        Unbounded {
            head: CachePadded::new(Cell::new(stub)),
            tail: CachePadded::new(Cell::new(stub)),
            count: AtomicUsize::new(0),
        }
    }

    fn put(&self, item: T) {
        let node = Box::into_raw(Box::new(Node {
            data: Some(item),
            next: ptr::null_mut(),
        }));
        let tail = self.tail.get();
        unsafe { (*tail).next = node };
        self.tail.set(node);
        self.count.fetch_add(1, Ordering::Release);
    }

    fn top(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let next = unsafe { (*self.head.get()).next };
        debug_assert!(!next.is_null());
        unsafe { (*next).data.clone() }
    }

    fn pop(&self) -> Option<T> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let head = self.head.get();
        let next = unsafe { (*head).next };
        debug_assert!(!next.is_null());
        let item = unsafe { (*next).data.take() };
        self.head.set(next);
        drop(unsafe { Box::from_raw(head) });
        self.count.fetch_sub(1, Ordering::Release);
        item
    }
}

impl<T> Drop for Unbounded<T> {
    fn drop(&mut self) {
        let mut node = self.head.get();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bounded_fifo() {
        let b = Buffer::bounded(4);
        assert!(b.is_space());
        assert!(!b.has_top());
        for i in 0..4 {
            b.put(i);
        }
        assert!(!b.is_space());
        assert_eq!(b.count(), 4);
        for i in 0..4 {
            assert_eq!(b.top(), Some(i));
            assert_eq!(b.pop(), Some(i));
        }
        assert!(b.is_space());
        assert_eq!(b.pop(), None::<i32>);
    }

    #[test]
    fn bounded_wraps_around() {
        let b = Buffer::bounded(2);
        for round in 0..10 {
            b.put(round * 2);
            b.put(round * 2 + 1);
            assert_eq!(b.pop(), Some(round * 2));
            assert_eq!(b.pop(), Some(round * 2 + 1));
        }
    }

    #[test]
    fn unbounded_never_full() {
        let u = Buffer::unbounded();
        assert_eq!(u.capacity(), None);
        for i in 0..1000 {
            assert!(u.is_space());
            u.put(i);
        }
        assert_eq!(u.count(), 1000);
        for i in 0..1000 {
            assert_eq!(u.pop(), Some(i));
        }
        assert_eq!(u.pop(), None::<i32>);
    }

    #[test]
    fn unbounded_drop_frees_pending() {
        let u = Buffer::unbounded();
        for i in 0..16 {
            u.put(Arc::new(i));
        }
        drop(u); // nodes and their items reclaimed
    }

    // One producer thread, one consumer thread, gated the way the stream
    // layer gates access (the consumer spins on count instead of a
    // semaphore).
    #[test]
    fn bounded_spsc_threads() {
        let b = Arc::new(Buffer::bounded(8));
        let prod = {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    while !b.is_space() {
                        thread::yield_now();
                    }
                    b.put(i);
                }
            })
        };
        for i in 0..10_000u64 {
            loop {
                if let Some(v) = b.pop() {
                    assert_eq!(v, i);
                    break;
                }
                thread::yield_now();
            }
        }
        prod.join().unwrap();
    }

    #[test]
    fn unbounded_spsc_threads() {
        let u = Arc::new(Buffer::unbounded());
        let prod = {
            let u = Arc::clone(&u);
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    u.put(i);
                }
            })
        };
        for i in 0..10_000u64 {
            loop {
                if let Some(v) = u.pop() {
                    assert_eq!(v, i);
                    break;
                }
                thread::yield_now();
            }
        }
        prod.join().unwrap();
    }
}
