/*! The master's ready queue: a binary heap over floating-point priorities.

Only the master thread ever touches a [`TaskHeap`], so it needs no locking of
its own. Besides push/pop it supports re-keying a live element; the master
refreshes the priorities of a task's neighbours after every queue transition.
Position lookup is a linear scan; ready queues in this regime hold tens of
tasks, and the scan beats maintaining an index map.

Ties break on the task id (older task first) so the order is deterministic.
*/

use std::sync::Arc;

use crate::task::Task;

const INITIAL_SLOTS: usize = 50;

pub(crate) struct TaskHeap {
    heap: Vec<Arc<Task>>,
}

fn prior_of(t: &Arc<Task>) -> f64 {
    t.sched.lock().unwrap().prior
}

/// Does `a` schedule strictly before `b`?
fn before(a: &Arc<Task>, b: &Arc<Task>) -> bool {
    let (pa, pb) = (prior_of(a), prior_of(b));
    if pa != pb {
        pa > pb
    } else {
        a.uid() < b.uid()
    }
}

impl TaskHeap {
    pub fn new() -> TaskHeap {
        TaskHeap {
            heap: Vec::with_capacity(INITIAL_SLOTS),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, t: Arc<Task>) {
        self.heap.push(t);
        self.sift_up(self.heap.len() - 1);
    }

    /// Highest-priority task without removing it.
    pub fn peek(&self) -> Option<&Arc<Task>> {
        self.heap.first()
    }

    /// Remove and return the highest-priority task.
    pub fn pop(&mut self) -> Option<Arc<Task>> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Re-key a live element. No-op if the task is not in the heap.
    pub fn update_priority(&mut self, t: &Arc<Task>, new_prior: f64) {
        let Some(pos) = self.position(t) else { return };
        t.sched.lock().unwrap().prior = new_prior;
        self.sift_up(pos);
        // sift_up leaves the element somewhere at or above `pos`; if the key
        // shrank, it has not moved and must go down instead
        if let Some(pos) = self.position(t) {
            self.sift_down(pos);
        }
    }

    fn position(&self, t: &Arc<Task>) -> Option<usize> {
        self.heap.iter().position(|x| Arc::ptr_eq(x, t))
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if before(&self.heap[pos], &self.heap[parent]) {
                self.heap.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let mut best = pos;
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < len && before(&self.heap[child], &self.heap[best]) {
                    best = child;
                }
            }
            if best == pos {
                break;
            }
            self.heap.swap(pos, best);
            pos = best;
        }
    }
}
