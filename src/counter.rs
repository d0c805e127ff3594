//! Counters: atomic values jobs can block on.
//!
//! A counter supports two wait shapes: `wait_for`, which suspends until the
//! value is exactly the target, and `remove`, which atomically decrements if
//! the value is high enough and otherwise suspends until it is. Suspended
//! jobs sit on an intrusive wait list threaded through the job pool; plain
//! OS threads block on a condition variable instead and re-check their
//! predicate on every value change.
//!
//! All decrements and all `WaitingOnCounter -> Pending` transitions happen
//! under the counter's wait-list lock. That serialization is what makes the
//! wake/timeout race and the decrement-or-wait semantics exact: a peeked
//! decrement cannot vanish before it is taken, and a waiter leaves the
//! waiting state exactly once.

use crate::error::{Error, Result};
use crate::job::{JobStatus, WaitResult, INVALID_INDEX};
use crate::scheduler::Shared;
use crate::timing::{Stopwatch, Timeout};
use crate::worker;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct WaitList {
    pub head: usize,
}

pub(crate) struct CounterSlot {
    pub value: AtomicU64,
    pub ref_count: AtomicU32,
    pub wait_list: Mutex<WaitList>,
    thread_gate: Mutex<()>,
    thread_cvar: Condvar,
}

impl CounterSlot {
    pub fn new() -> CounterSlot {
        CounterSlot {
            value: AtomicU64::new(0),
            ref_count: AtomicU32::new(0),
            wait_list: Mutex::new(WaitList { head: INVALID_INDEX }),
            thread_gate: Mutex::new(()),
            thread_cvar: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
        debug_assert!(self.wait_list.lock().head == INVALID_INDEX);
    }
}

impl Shared {
    pub(crate) fn counter_add(&self, index: usize, value: u64) {
        self.counters.get(index).value.fetch_add(value, Ordering::SeqCst);
        self.counter_notify(index);
    }

    pub(crate) fn counter_set(&self, index: usize, value: u64) {
        self.counters.get(index).value.store(value, Ordering::SeqCst);
        self.counter_notify(index);
    }

    pub(crate) fn counter_get(&self, index: usize) -> u64 {
        self.counters.get(index).value.load(Ordering::SeqCst)
    }

    /// Decrements the value by `amount` if it is at least `amount`. The
    /// counter's wait-list lock must be held; it serializes every decrement.
    fn try_remove_value(&self, index: usize, amount: u64) -> bool {
        let value = &self.counters.get(index).value;
        loop {
            let current = value.load(Ordering::SeqCst);
            if current < amount {
                return false;
            }
            if value
                .compare_exchange(current, current - amount, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Walks the wait list and wakes every waiter whose condition now holds.
    ///
    /// The sweep runs to a fixed point: waking a `remove` waiter changes the
    /// value, which can newly satisfy an equality waiter in the same list.
    pub(crate) fn counter_notify(&self, index: usize) {
        let counter = self.counters.get(index);
        let mut requeued = 0usize;

        {
            let mut list = counter.wait_list.lock();
            loop {
                let mut changed = false;
                let mut prev = INVALID_INDEX;
                let mut cursor = list.head;

                while cursor != INVALID_INDEX {
                    let job = self.jobs.get(cursor);
                    let next = job.wait_next.load(Ordering::SeqCst);
                    let wanted = job.wait_value.load(Ordering::SeqCst);
                    let is_remove = job.wait_remove.load(Ordering::SeqCst);

                    let candidate = if is_remove {
                        counter.value.load(Ordering::SeqCst) >= wanted
                    } else {
                        counter.value.load(Ordering::SeqCst) == wanted
                    };

                    // Claim the waiter before consuming anything, so a lost
                    // race against its timeout can't leak a decrement.
                    if candidate
                        && job
                            .status
                            .transition(JobStatus::WaitingOnCounter, JobStatus::Pending)
                    {
                        if is_remove {
                            let removed = self.try_remove_value(index, wanted);
                            debug_assert!(removed, "headroom vanished under the wait-list lock");
                        }

                        if prev == INVALID_INDEX {
                            list.head = next;
                        } else {
                            self.jobs.get(prev).wait_next.store(next, Ordering::SeqCst);
                        }
                        job.wait_next.store(INVALID_INDEX, Ordering::SeqCst);
                        job.set_wait_result(WaitResult::Signaled);

                        self.requeue_job(cursor);
                        requeued += 1;
                        changed = true;
                        cursor = next;
                        continue;
                    }

                    prev = cursor;
                    cursor = next;
                }

                if !changed {
                    break;
                }
            }
        }

        if requeued > 0 {
            self.notify_job_available();
        }

        // Blocking thread waiters re-check their predicates.
        drop(counter.thread_gate.lock());
        counter.thread_cvar.notify_all();
    }

    pub(crate) fn counter_remove(&self, index: usize, value: u64, timeout: Timeout) -> Result<()> {
        self.counter_wait_impl(index, value, true, timeout)
    }

    pub(crate) fn counter_wait_for(&self, index: usize, value: u64, timeout: Timeout) -> Result<()> {
        self.counter_wait_impl(index, value, false, timeout)
    }

    fn counter_wait_impl(
        &self,
        index: usize,
        value: u64,
        is_remove: bool,
        timeout: Timeout,
    ) -> Result<()> {
        // The fiber path needs the running job to belong to this scheduler;
        // a wait on a foreign scheduler's counter degrades to blocking.
        if let Some((active, job_index)) = worker::active_job() {
            if std::ptr::eq(Arc::as_ptr(&active), self) {
                return self.counter_wait_on_fiber(index, value, is_remove, timeout, job_index);
            }
        }
        self.counter_wait_blocking(index, value, is_remove, timeout)
    }

    fn counter_wait_on_fiber(
        &self,
        index: usize,
        value: u64,
        is_remove: bool,
        timeout: Timeout,
        job_index: usize,
    ) -> Result<()> {
        let job = self.jobs.get(job_index);
        let counter = self.counters.get(index);

        job.wait_value.store(value, Ordering::SeqCst);
        job.wait_remove.store(is_remove, Ordering::SeqCst);
        job.set_wait_result(WaitResult::Signaled);
        job.status.store(JobStatus::WaitingOnCounter);

        {
            let mut list = counter.wait_list.lock();

            // Condition already met? Revert and carry on running.
            let satisfied = if is_remove {
                self.try_remove_value(index, value)
            } else {
                counter.value.load(Ordering::SeqCst) == value
            };
            if satisfied {
                job.status.store(JobStatus::Running);
                drop(list);
                if is_remove {
                    // The decrement may newly satisfy an equality waiter.
                    self.counter_notify(index);
                }
                return Ok(());
            }

            // Arm the wakeup while still holding the list lock; the callback
            // takes the same lock before its status claim, so it cannot fire
            // against a half-parked job. The claim is keyed to this wait's
            // exact status epoch, so a callback that outlives the wait can
            // never touch a later one.
            if !timeout.is_infinite() {
                let armed = job.status.snapshot();
                let weak = self.self_weak.clone();
                match self.callbacks.schedule(timeout, move || {
                    let Some(shared) = weak.upgrade() else { return };
                    let job = shared.jobs.get(job_index);
                    let counter = shared.counters.get(index);

                    let mut list = counter.wait_list.lock();
                    if job.status.transition_exact(armed, JobStatus::Pending) {
                        unlink_counter_waiter(&shared, &mut list, job_index);
                        drop(list);

                        job.set_wait_result(WaitResult::TimedOut);
                        shared.requeue_job(job_index);
                        shared.notify_job_available();
                    }
                }) {
                    Ok(handle) => {
                        job.data.lock().wait_callback = Some(handle);
                    }
                    Err(error) => {
                        job.status.store(JobStatus::Running);
                        return Err(error);
                    }
                }
            }

            job.wait_next.store(list.head, Ordering::SeqCst);
            list.head = job_index;
        }

        worker::yield_to_worker(self);

        let callback = job.data.lock().wait_callback.take();
        match job.wait_result() {
            WaitResult::Signaled => {
                if let Some(callback) = callback {
                    self.callbacks.cancel(callback);
                }
                Ok(())
            }
            WaitResult::TimedOut => Err(Error::Timeout),
        }
    }

    fn counter_wait_blocking(
        &self,
        index: usize,
        value: u64,
        is_remove: bool,
        timeout: Timeout,
    ) -> Result<()> {
        let counter = self.counters.get(index);
        let watch = Stopwatch::start();

        let mut gate = counter.thread_gate.lock();
        loop {
            let satisfied = {
                let _list = counter.wait_list.lock();
                if is_remove {
                    self.try_remove_value(index, value)
                } else {
                    counter.value.load(Ordering::SeqCst) == value
                }
            };

            if satisfied {
                drop(gate);
                if is_remove {
                    self.counter_notify(index);
                }
                return Ok(());
            }

            if timeout.is_infinite() {
                counter.thread_cvar.wait(&mut gate);
            } else {
                let elapsed = watch.elapsed_ms();
                if elapsed >= timeout.as_millis() {
                    return Err(Error::Timeout);
                }
                counter
                    .thread_cvar
                    .wait_for(&mut gate, Duration::from_millis(timeout.as_millis() - elapsed));
            }
        }
    }
}

fn unlink_counter_waiter(shared: &Shared, list: &mut WaitList, job_index: usize) {
    let mut prev = INVALID_INDEX;
    let mut cursor = list.head;

    while cursor != INVALID_INDEX {
        let next = shared.jobs.get(cursor).wait_next.load(Ordering::SeqCst);
        if cursor == job_index {
            if prev == INVALID_INDEX {
                list.head = next;
            } else {
                shared.jobs.get(prev).wait_next.store(next, Ordering::SeqCst);
            }
            shared.jobs.get(cursor).wait_next.store(INVALID_INDEX, Ordering::SeqCst);
            return;
        }
        prev = cursor;
        cursor = next;
    }
}

/// A handle to a counter created by [`Scheduler::create_counter`].
///
/// Counter data is owned by the scheduler; handles are refcounted indices
/// into its pool and the slot is recycled once the last handle is dropped.
///
/// [`Scheduler::create_counter`]: crate::Scheduler::create_counter
pub struct CounterHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: usize,
}

impl CounterHandle {
    pub(crate) fn new(shared: Arc<Shared>, index: usize) -> CounterHandle {
        shared.add_counter_ref(index);
        CounterHandle { shared, index }
    }

    /// Adds to the value and wakes any waiter whose condition now holds.
    /// Never blocks.
    pub fn add(&self, value: u64) {
        self.shared.counter_add(self.index, value);
    }

    /// Replaces the value and wakes any waiter whose condition now holds.
    pub fn set(&self, value: u64) {
        self.shared.counter_set(self.index, value);
    }

    pub fn get(&self) -> u64 {
        self.shared.counter_get(self.index)
    }

    /// Atomically decrements by `value` if the counter is at least `value`,
    /// otherwise suspends until it can. From a job this yields the fiber;
    /// from a plain thread it blocks.
    pub fn remove(&self, value: u64, timeout: Timeout) -> Result<()> {
        self.shared.counter_remove(self.index, value, timeout)
    }

    /// Suspends until the value is exactly `value`.
    pub fn wait_for(&self, value: u64, timeout: Timeout) -> Result<()> {
        self.shared.counter_wait_for(self.index, value, timeout)
    }

    pub fn is_valid(&self) -> bool {
        self.index < self.shared.counters.capacity()
    }
}

impl Clone for CounterHandle {
    fn clone(&self) -> CounterHandle {
        CounterHandle::new(Arc::clone(&self.shared), self.index)
    }
}

impl Drop for CounterHandle {
    fn drop(&mut self) {
        self.shared.release_counter(self.index);
    }
}

impl PartialEq for CounterHandle {
    fn eq(&self, other: &CounterHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.index == other.index
    }
}

impl Eq for CounterHandle {}

impl std::fmt::Debug for CounterHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("CounterHandle")
            .field("index", &self.index)
            .field("value", &self.get())
            .finish_non_exhaustive()
    }
}
