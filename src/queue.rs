//! Lock-free bounded queue of job indices, one per priority class.
//!
//! Implemented as an atomic circular buffer with split reserve/commit
//! counters on both ends. A producer reserves a slot by advancing the
//! uncommitted head, writes its value, then publishes by advancing the
//! committed head in order. Consumers mirror the protocol on the tail. CAS
//! arbitrates races; the loser pauses and retries.

use crossbeam_utils::CachePadded;
use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct AtomicIndexQueue {
    buffer: Box<[AtomicUsize]>,
    capacity: usize,
    head: CachePadded<AtomicUsize>,
    uncommitted_head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    uncommitted_tail: CachePadded<AtomicUsize>,
}

impl AtomicIndexQueue {
    pub fn new(capacity: usize) -> AtomicIndexQueue {
        assert!(capacity > 0);

        let buffer: Box<[AtomicUsize]> = (0..capacity).map(|_| AtomicUsize::new(0)).collect();

        AtomicIndexQueue {
            buffer,
            capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            uncommitted_head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            uncommitted_tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Appends a value. Fails only when the queue holds `capacity` elements,
    /// which the scheduler's sizing makes unreachable (a job index is queued
    /// at most once per priority bit).
    pub fn push(&self, value: usize) -> Result<(), ()> {
        loop {
            let old_head = self.uncommitted_head.load(Ordering::SeqCst);
            let tail = self.tail.load(Ordering::SeqCst);

            if old_head.wrapping_sub(tail) >= self.capacity {
                return Err(());
            }

            if self
                .uncommitted_head
                .compare_exchange(old_head, old_head.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.buffer[old_head % self.capacity].store(value, Ordering::SeqCst);

                // Publish in reservation order.
                while self
                    .head
                    .compare_exchange(old_head, old_head.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    hint::spin_loop();
                }

                return Ok(());
            }

            hint::spin_loop();
        }
    }

    /// Removes the oldest value, or returns `None` when the queue is empty.
    pub fn pop(&self) -> Option<usize> {
        loop {
            let old_tail = self.uncommitted_tail.load(Ordering::SeqCst);
            let head = self.head.load(Ordering::SeqCst);

            if old_tail == head {
                return None;
            }

            if self
                .uncommitted_tail
                .compare_exchange(old_tail, old_tail.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let value = self.buffer[old_tail % self.capacity].load(Ordering::SeqCst);

                while self
                    .tail
                    .compare_exchange(old_tail, old_tail.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    hint::spin_loop();
                }

                return Some(value);
            }

            hint::spin_loop();
        }
    }

    /// Number of committed elements. A racy snapshot.
    pub fn len(&self) -> usize {
        self.head
            .load(Ordering::SeqCst)
            .wrapping_sub(self.tail.load(Ordering::SeqCst))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pops_in_fifo_order() {
        let queue = AtomicIndexQueue::new(8);

        for value in 0..5 {
            queue.push(value).unwrap();
        }
        assert_eq!(queue.len(), 5);

        for value in 0..5 {
            assert_eq!(queue.pop(), Some(value));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_push_when_full() {
        let queue = AtomicIndexQueue::new(2);

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(queue.push(3).is_err());

        assert_eq!(queue.pop(), Some(1));
        queue.push(3).unwrap();
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn wraps_around_the_ring() {
        let queue = AtomicIndexQueue::new(3);

        for round in 0..10 {
            queue.push(round).unwrap();
            assert_eq!(queue.pop(), Some(round));
        }
    }

    #[test]
    fn concurrent_producers_deliver_every_value() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let queue = Arc::new(AtomicIndexQueue::new(PRODUCERS * PER_PRODUCER));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(producer * PER_PRODUCER + i).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        while let Some(value) = queue.pop() {
            assert!(!seen[value], "value {} delivered twice", value);
            seen[value] = true;
        }
        assert!(seen.iter().all(|&present| present));
    }
}
