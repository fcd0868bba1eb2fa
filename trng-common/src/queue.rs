//! Bounded drop-oldest queue of random blocks.
//!
//! One instance per source (TRNG, Fortuna, VirtIO). The ring itself sits
//! behind a single mutex; the counters are mirrored into relaxed atomics so
//! `stats()` never touches the lock. Cross-counter consistency of a stats
//! snapshot is not guaranteed, each counter individually is.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

/// A sequence of random bytes produced by one source.
///
/// Blocks live in exactly one queue and are destroyed by consumption,
/// eviction on overflow, or process shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomBlock {
    pub id: u64,
    pub created_at: SystemTime,
    pub data: Vec<u8>,
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub dropped: u64,
    pub consumed: u64,
    pub current_size: usize,
    pub capacity: usize,
}

struct Inner {
    items: VecDeque<RandomBlock>,
    capacity: usize,
    next_id: u64,
}

/// Fixed-capacity FIFO with drop-oldest overflow.
///
/// `current_size + consumed + dropped == total_pushed` after every operation.
pub struct BoundedQueue {
    inner: Mutex<Inner>,
    total_pushed: AtomicU64,
    dropped: AtomicU64,
    consumed: AtomicU64,
    len: AtomicUsize,
    capacity: AtomicUsize,
}

impl BoundedQueue {
    /// Capacity below 1 is clamped to 1; a queue that can hold nothing has
    /// no meaningful drop-oldest semantics.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                next_id: 1,
            }),
            total_pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Append a block, evicting the head when full. Never blocks on I/O and
    /// never fails. Returns the id assigned to the new block.
    pub fn push(&self, data: Vec<u8>) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.items.len() >= inner.capacity {
            inner.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push_back(RandomBlock {
            id,
            created_at: SystemTime::now(),
            data,
        });
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.len.store(inner.items.len(), Ordering::Relaxed);
        id
    }

    /// Read up to `limit` blocks starting at logical index `offset`.
    ///
    /// With `consume = false` the queue is unchanged and the returned blocks
    /// are copies. With `consume = true` the `offset` blocks in front of the
    /// requested range are consumed as well as the returned ones: offset does
    /// NOT mean "skip without deleting" in consume mode.
    pub fn get(&self, limit: usize, offset: usize, consume: bool) -> Vec<RandomBlock> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let size = inner.items.len();
        if offset >= size {
            return Vec::new();
        }
        let n = limit.min(size - offset);
        if !consume {
            return inner.items.iter().skip(offset).take(n).cloned().collect();
        }
        for _ in 0..offset {
            inner.items.pop_front();
            self.consumed.fetch_add(1, Ordering::Relaxed);
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(block) = inner.items.pop_front() {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                out.push(block);
            }
        }
        self.len.store(inner.items.len(), Ordering::Relaxed);
        out
    }

    /// Change the capacity. Shrinking below the current size evicts the
    /// oldest blocks, counted as drops.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while inner.items.len() > capacity {
            inner.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.capacity = capacity;
        self.capacity.store(capacity, Ordering::Relaxed);
        self.len.store(inner.items.len(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            current_size: self.len.load(Ordering::Relaxed),
            capacity: self.capacity.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(q: &BoundedQueue) {
        let s = q.stats();
        assert!(s.current_size <= s.capacity);
        assert_eq!(
            s.current_size as u64 + s.consumed + s.dropped,
            s.total_pushed,
            "size+consumed+dropped must equal total_pushed: {s:?}"
        );
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = BoundedQueue::new(3);
        for b in [0x01u8, 0x02, 0x03, 0x04] {
            q.push(vec![b]);
        }
        let s = q.stats();
        assert_eq!(s.current_size, 3);
        assert_eq!(s.dropped, 1);
        let blocks = q.get(3, 0, false);
        let data: Vec<Vec<u8>> = blocks.into_iter().map(|b| b.data).collect();
        assert_eq!(data, vec![vec![0x02], vec![0x03], vec![0x04]]);
        assert_invariant(&q);
    }

    #[test]
    fn full_queue_counts_every_overflow_push() {
        let q = BoundedQueue::new(4);
        for i in 0..4u8 {
            q.push(vec![i]);
        }
        for i in 0..7u8 {
            q.push(vec![0x10 + i]);
        }
        let s = q.stats();
        assert_eq!(s.dropped, 7);
        assert_eq!(s.current_size, 4);
        assert_invariant(&q);
    }

    #[test]
    fn capacity_one_keeps_exactly_one() {
        let q = BoundedQueue::new(1);
        q.push(vec![1]);
        q.push(vec![2]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(1, 0, false)[0].data, vec![2]);
        assert_invariant(&q);
    }

    #[test]
    fn consume_returns_in_insertion_order_then_empty() {
        let q = BoundedQueue::new(8);
        for i in 0..5u8 {
            q.push(vec![i]);
        }
        let got = q.get(5, 0, true);
        let data: Vec<u8> = got.iter().map(|b| b.data[0]).collect();
        assert_eq!(data, vec![0, 1, 2, 3, 4]);
        assert!(q.get(5, 0, true).is_empty());
        let s = q.stats();
        assert_eq!(s.consumed, 5);
        assert_invariant(&q);
    }

    #[test]
    fn peek_twice_is_identical() {
        let q = BoundedQueue::new(8);
        for i in 0..4u8 {
            q.push(vec![i, i + 1]);
        }
        let a = q.get(3, 1, false);
        let b = q.get(3, 1, false);
        assert_eq!(a, b);
        assert_eq!(q.stats().consumed, 0);
        assert_invariant(&q);
    }

    #[test]
    fn consume_mode_offset_consumes_skipped_blocks() {
        let q = BoundedQueue::new(8);
        for i in 0..6u8 {
            q.push(vec![i]);
        }
        let got = q.get(2, 3, true);
        let data: Vec<u8> = got.iter().map(|b| b.data[0]).collect();
        assert_eq!(data, vec![3, 4]);
        // the three offset blocks are gone too
        assert_eq!(q.len(), 1);
        assert_eq!(q.stats().consumed, 5);
        assert_invariant(&q);
    }

    #[test]
    fn offset_past_end_is_empty_without_side_effects() {
        let q = BoundedQueue::new(4);
        q.push(vec![9]);
        assert!(q.get(10, 1, false).is_empty());
        assert!(q.get(10, 7, true).is_empty());
        let s = q.stats();
        assert_eq!(s.current_size, 1);
        assert_eq!(s.consumed, 0);
        assert_invariant(&q);
    }

    #[test]
    fn ids_are_monotone() {
        let q = BoundedQueue::new(2);
        let a = q.push(vec![1]);
        let b = q.push(vec![2]);
        let c = q.push(vec![3]);
        assert!(a < b && b < c);
    }

    #[test]
    fn shrink_resize_evicts_oldest_as_drops() {
        let q = BoundedQueue::new(8);
        for i in 0..6u8 {
            q.push(vec![i]);
        }
        q.resize(2);
        assert_eq!(q.capacity(), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats().dropped, 4);
        let data: Vec<u8> = q.get(2, 0, false).iter().map(|b| b.data[0]).collect();
        assert_eq!(data, vec![4, 5]);
        assert_invariant(&q);
    }

    #[test]
    fn grow_resize_keeps_content() {
        let q = BoundedQueue::new(2);
        q.push(vec![1]);
        q.push(vec![2]);
        q.resize(10);
        for i in 3..=9u8 {
            q.push(vec![i]);
        }
        assert_eq!(q.len(), 9);
        assert_eq!(q.stats().dropped, 0);
        assert_invariant(&q);
    }
}
