//! Latent callback scheduling.
//!
//! A single dedicated timer thread owns a fixed pool of callback records and
//! runs each one when its deadline passes. Every timed wait and sleep in the
//! scheduler goes through here; this is the only latency-bound wake-up path,
//! everything else is condition-variable driven.

use crate::error::{Error, Result};
use crate::timing::{Stopwatch, Timeout};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) type CallbackFn = Box<dyn FnOnce() + Send>;

/// Identifies a scheduled callback for cancellation. The generation makes a
/// stale handle harmless after its slot has been recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallbackHandle {
    index: usize,
    generation: u64,
}

struct CallbackSlot {
    active: bool,
    generation: u64,
    started: Stopwatch,
    duration: Timeout,
    callback: Option<CallbackFn>,
}

struct RecordPool {
    slots: Vec<CallbackSlot>,
    free: Vec<usize>,
}

struct CallbackInner {
    records: Mutex<RecordPool>,
    schedule_updated: Condvar,
    shutting_down: AtomicBool,
}

pub(crate) struct CallbackScheduler {
    inner: Arc<CallbackInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackScheduler {
    /// Allocates the record pool and starts the timer thread.
    pub fn new(max_callbacks: usize) -> Result<CallbackScheduler> {
        let slots = (0..max_callbacks)
            .map(|_| CallbackSlot {
                active: false,
                generation: 0,
                started: Stopwatch::start(),
                duration: Timeout::from_millis(0),
                callback: None,
            })
            .collect();

        let inner = Arc::new(CallbackInner {
            records: Mutex::new(RecordPool {
                slots,
                free: (0..max_callbacks).rev().collect(),
            }),
            schedule_updated: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });

        let timer_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("gantry-timer".into())
            .spawn(move || timer_main(timer_inner))
            .map_err(|_| Error::PlatformError)?;

        Ok(CallbackScheduler {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules `callback` to run once `duration` has elapsed. The returned
    /// handle can cancel it; exactly one of fire or cancel wins.
    pub fn schedule(
        &self,
        duration: Timeout,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<CallbackHandle> {
        debug_assert!(!duration.is_infinite());

        let mut records = self.inner.records.lock();

        let index = records.free.pop().ok_or(Error::OutOfCallbacks)?;
        let slot = &mut records.slots[index];
        slot.active = true;
        slot.started = Stopwatch::start();
        slot.duration = duration;
        slot.callback = Some(Box::new(callback));
        let generation = slot.generation;

        self.inner.schedule_updated.notify_all();

        Ok(CallbackHandle { index, generation })
    }

    /// Cancels a scheduled callback. Returns `false` if it already fired or
    /// was already cancelled.
    pub fn cancel(&self, handle: CallbackHandle) -> bool {
        let mut records = self.inner.records.lock();

        let slot = &mut records.slots[handle.index];
        if !slot.active || slot.generation != handle.generation {
            return false;
        }

        slot.active = false;
        slot.callback = None;
        slot.generation += 1;
        records.free.push(handle.index);
        true
    }

    /// Stops the timer thread, dropping any still-pending callbacks.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let _records = self.inner.records.lock();
            self.inner.schedule_updated.notify_all();
        }

        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CallbackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_main(inner: Arc<CallbackInner>) {
    // Reused sweep buffer so firing doesn't allocate per iteration.
    let mut due: Vec<CallbackFn> = Vec::with_capacity(inner.records.lock().slots.len());

    loop {
        let mut records = inner.records.lock();

        if inner.shutting_down.load(Ordering::SeqCst) {
            for index in 0..records.slots.len() {
                let slot = &mut records.slots[index];
                if slot.active {
                    slot.active = false;
                    slot.callback = None;
                    slot.generation += 1;
                }
            }
            return;
        }

        // Sweep out everything that's due, then run it outside the lock so a
        // callback can freely reschedule or cancel.
        let mut next_due_ms: Option<u64> = None;
        for index in 0..records.slots.len() {
            let slot = &mut records.slots[index];
            if !slot.active {
                continue;
            }

            let elapsed = slot.started.elapsed_ms();
            if elapsed >= slot.duration.as_millis() {
                slot.active = false;
                slot.generation += 1;
                if let Some(callback) = slot.callback.take() {
                    due.push(callback);
                }
                records.free.push(index);
            } else {
                let remaining = slot.duration.as_millis() - elapsed;
                next_due_ms = Some(next_due_ms.map_or(remaining, |ms: u64| ms.min(remaining)));
            }
        }

        if !due.is_empty() {
            drop(records);
            for callback in due.drain(..) {
                callback();
            }
            continue;
        }

        match next_due_ms {
            None => {
                inner.schedule_updated.wait(&mut records);
            }
            Some(ms) => {
                inner
                    .schedule_updated
                    .wait_for(&mut records, Duration::from_millis(ms.max(1)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn fires_once_after_the_deadline() {
        let scheduler = CallbackScheduler::new(4).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_callback = Arc::clone(&fired);
        let started = Instant::now();
        scheduler
            .schedule(Timeout::from_millis(30), move || {
                fired_in_callback.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        while fired.load(Ordering::SeqCst) == 0 {
            assert!(started.elapsed() < Duration::from_secs(5), "callback never fired");
            thread::sleep(Duration::from_millis(5));
        }

        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_before_fire_wins() {
        let scheduler = CallbackScheduler::new(4).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_callback = Arc::clone(&fired);
        let handle = scheduler
            .schedule(Timeout::from_millis(200), move || {
                fired_in_callback.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(scheduler.cancel(handle));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_is_a_no_op() {
        let scheduler = CallbackScheduler::new(4).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_callback = Arc::clone(&fired);
        let handle = scheduler
            .schedule(Timeout::from_millis(10), move || {
                fired_in_callback.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let started = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(started.elapsed() < Duration::from_secs(5), "callback never fired");
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!scheduler.cancel(handle));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let scheduler = CallbackScheduler::new(1).unwrap();

        let first = scheduler.schedule(Timeout::from_millis(500), || {}).unwrap();
        assert_eq!(
            scheduler.schedule(Timeout::from_millis(500), || {}).unwrap_err(),
            Error::OutOfCallbacks
        );

        assert!(scheduler.cancel(first));
        scheduler.schedule(Timeout::from_millis(500), || {}).unwrap();
    }

    #[test]
    fn shutdown_drops_pending_callbacks() {
        let scheduler = CallbackScheduler::new(4).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_callback = Arc::clone(&fired);
        scheduler
            .schedule(Timeout::from_millis(100), move || {
                fired_in_callback.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.shutdown();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
