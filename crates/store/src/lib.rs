//! Subsync store: subaccount-keyed priority queue and the CIS event window.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use rustc_hash::FxHashMap;
use subsync_core::{QueueElement, SubaccountId};
use tracing::debug;

mod window;

pub use window::{EventWindow, NowFn};

pub const DEFAULT_QUEUE_SIZE: usize = 2048;

/// Observers invoked after every mutation, outside the queue lock.
#[derive(Default)]
pub struct QueueHooks {
    /// Called with the queue size after an insert or in-place update.
    pub on_insert: Option<Box<dyn Fn(usize) + Send + Sync>>,
    /// Called with the queue size and the element's time in queue, in nanoseconds.
    pub on_extract: Option<Box<dyn Fn(usize, u128) + Send + Sync>>,
}

struct Slot {
    elem: QueueElement,
    entered: Instant,
}

struct Heap {
    slots: Vec<Slot>,
    idx: FxHashMap<SubaccountId, usize>,
    cap: usize,
}

impl Heap {
    fn key(&self, i: usize) -> i64 { self.slots[i].elem.modified_at }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.idx.insert(self.slots[a].elem.subaccount_id.clone(), a);
        self.idx.insert(self.slots[b].elem.subaccount_id.clone(), b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.key(i) >= self.key(parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.slots.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut min = i;
            if l < n && self.key(l) < self.key(min) { min = l; }
            if r < n && self.key(r) < self.key(min) { min = r; }
            if min == i {
                break;
            }
            self.swap(i, min);
            i = min;
        }
    }

    fn grow_if_full(&mut self) {
        if self.slots.len() < self.cap {
            return;
        }
        self.cap = (self.cap * 2).max(1);
        self.slots.reserve_exact(self.cap - self.slots.len());
        debug!(capacity = self.cap, "queue is full, resized");
    }
}

/// Min-heap on `modified_at` holding at most one pending element per subaccount.
pub struct SubaccountPriorityQueue {
    heap: Mutex<Heap>,
    hooks: QueueHooks,
}

impl SubaccountPriorityQueue {
    pub fn new() -> Self { Self::with_capacity(DEFAULT_QUEUE_SIZE) }

    pub fn with_capacity(cap: usize) -> Self { Self::with_hooks(cap, QueueHooks::default()) }

    pub fn with_hooks(cap: usize, hooks: QueueHooks) -> Self {
        let cap = cap.max(1);
        let heap = Heap { slots: Vec::with_capacity(cap), idx: FxHashMap::default(), cap };
        Self { heap: Mutex::new(heap), hooks }
    }

    fn lock(&self) -> MutexGuard<'_, Heap> { self.heap.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Insert or update the pending element of `elem.subaccount_id`.
    ///
    /// An element older than the pending one is dropped; an equal or newer one
    /// replaces it in place.
    pub fn insert(&self, elem: QueueElement) {
        let size = {
            let mut h = self.lock();
            match h.idx.get(&elem.subaccount_id).copied() {
                Some(i) => {
                    if elem.modified_at < h.slots[i].elem.modified_at {
                        debug!(subaccount = %elem.subaccount_id, modified_at = elem.modified_at, "outdated element dropped");
                        return;
                    }
                    debug!(subaccount = %elem.subaccount_id, beta_enabled = %elem.beta_enabled, "element updated");
                    let id = elem.subaccount_id.clone();
                    h.slots[i] = Slot { elem, entered: Instant::now() };
                    h.sift_up(i);
                    let j = h.idx.get(&id).copied().unwrap_or(i);
                    h.sift_down(j);
                }
                None => {
                    h.grow_if_full();
                    debug!(subaccount = %elem.subaccount_id, beta_enabled = %elem.beta_enabled, "element inserted");
                    let i = h.slots.len();
                    h.idx.insert(elem.subaccount_id.clone(), i);
                    h.slots.push(Slot { elem, entered: Instant::now() });
                    h.sift_up(i);
                }
            }
            h.slots.len()
        };
        if let Some(cb) = &self.hooks.on_insert {
            cb(size);
        }
    }

    /// Remove the element with the smallest `modified_at`.
    pub fn extract(&self) -> Option<QueueElement> {
        let (slot, size) = {
            let mut h = self.lock();
            if h.slots.is_empty() {
                return None;
            }
            let last = h.slots.len() - 1;
            h.swap(0, last);
            let slot = h.slots.pop()?;
            h.idx.remove(&slot.elem.subaccount_id);
            h.sift_down(0);
            (slot, h.slots.len())
        };
        if let Some(cb) = &self.hooks.on_extract {
            cb(size, slot.entered.elapsed().as_nanos());
        }
        debug!(subaccount = %slot.elem.subaccount_id, beta_enabled = %slot.elem.beta_enabled, "element dequeued");
        Some(slot.elem)
    }

    pub fn is_empty(&self) -> bool { self.lock().slots.is_empty() }

    pub fn len(&self) -> usize { self.lock().slots.len() }

    pub fn capacity(&self) -> usize { self.lock().cap }
}

impl Default for SubaccountPriorityQueue {
    fn default() -> Self { Self::new() }
}
