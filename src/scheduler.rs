//! The scheduler core.
//!
//! The scheduler owns every pool (jobs, counters, dependency edges, profile
//! scopes, fibers, callback records), the per-priority ready queues and the
//! worker threads. All allocation happens inside [`SchedulerBuilder::init`];
//! from then on the scheduler only moves indices between pools and queues.
//!
//! Configuration follows the builder pattern: fix the limits and pools on a
//! [`SchedulerBuilder`], then `init` it into a running [`Scheduler`].

use crate::callback::CallbackScheduler;
use crate::counter::{CounterHandle, CounterSlot};
use crate::debug::{DebugLog, DebugOutputFn, LogGroup, LogVerbosity};
use crate::error::{Error, Result};
use crate::event::EventHandle;
use crate::job::{
    DependencyPool, JobHandle, JobSlot, JobStatus, Priority, WaitResult, INVALID_INDEX,
    PRIORITY_COUNT,
};
use crate::pool::FixedPool;
use crate::profile::{ProfileFunctions, ScopeSlot};
use crate::queue::AtomicIndexQueue;
use crate::timing::{Stopwatch, Timeout};
use crate::worker::{self, ScopeList};
use fiber::Fiber;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MAX_THREAD_POOLS: usize = 16;
const MAX_FIBER_POOLS: usize = 16;

const STACK_ALIGN: usize = 16;
const MIN_STACK_SIZE: usize = 4096;

/// User-overridable allocation functions. The scheduler routes its dominant
/// allocations (fiber stacks) through these and accounts the bytes for the
/// init report.
pub struct MemoryFunctions {
    /// `(size, align) -> ptr`; must return null on failure.
    pub alloc: Box<dyn Fn(usize, usize) -> *mut u8 + Send + Sync>,
    /// `(ptr, size, align)`; receives exactly what `alloc` returned.
    pub free: Box<dyn Fn(*mut u8, usize, usize) + Send + Sync>,
}

impl Default for MemoryFunctions {
    fn default() -> MemoryFunctions {
        use std::alloc::Layout;
        MemoryFunctions {
            alloc: Box::new(|size, align| unsafe {
                std::alloc::alloc(Layout::from_size_align(size, align).expect("bad layout"))
            }),
            free: Box::new(|ptr, size, align| unsafe {
                std::alloc::dealloc(ptr, Layout::from_size_align(size, align).expect("bad layout"))
            }),
        }
    }
}

/// A raw stack allocation handed to a pooled fiber. Freed through the memory
/// functions when the scheduler shuts down.
struct StackBlock {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for StackBlock {}
unsafe impl Sync for StackBlock {}

/// A pool of fibers sharing one stack size. Pools are kept sorted ascending
/// by stack size so allocation picks the smallest sufficient stack.
struct FiberPool {
    stack_size: usize,
    free: Mutex<Vec<Fiber>>,
    stacks: Vec<StackBlock>,
}

/// Everything the scheduler and its handles share. Public handles hold an
/// `Arc` to this; internal cross-references are plain pool indices plus
/// explicit refcounts.
pub(crate) struct Shared {
    pub(crate) self_weak: Weak<Shared>,
    pub(crate) jobs: FixedPool<JobSlot>,
    pub(crate) counters: FixedPool<CounterSlot>,
    pub(crate) scopes: FixedPool<ScopeSlot>,
    dependencies: Mutex<DependencyPool>,
    queues: Vec<AtomicIndexQueue>,
    fiber_pools: Vec<FiberPool>,
    pub(crate) callbacks: CallbackScheduler,
    threads: Mutex<Vec<JoinHandle<()>>>,
    active_jobs: AtomicUsize,
    pub(crate) destroying: AtomicBool,
    job_available_mutex: Mutex<()>,
    job_available_cvar: Condvar,
    job_complete_mutex: Mutex<()>,
    job_complete_cvar: Condvar,
    debug: DebugLog,
    pub(crate) profile: Option<ProfileFunctions>,
    memory: MemoryFunctions,
    total_memory_allocated: AtomicUsize,
}

impl Shared {
    pub(crate) fn log(&self, verbosity: LogVerbosity, group: LogGroup, args: fmt::Arguments) {
        self.debug.write(verbosity, group, args);
    }

    // ---- job refcounting ------------------------------------------------

    pub(crate) fn add_job_ref(&self, index: usize) {
        self.jobs.get(index).ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_job(&self, index: usize) {
        if self.jobs.get(index).ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.free_job(index);
        }
    }

    fn free_job(&self, index: usize) {
        let slot = self.jobs.get(index);
        debug_assert!(slot.is_mutable());
        debug_assert_eq!(slot.first_predecessor.load(Ordering::SeqCst), INVALID_INDEX);
        debug_assert_eq!(slot.first_successor.load(Ordering::SeqCst), INVALID_INDEX);

        let completion_counter = {
            let mut data = slot.data.lock();
            if let Some(fiber) = data.fiber.take() {
                self.fiber_pools[data.fiber_pool].free.lock().push(fiber);
            }
            data.work = None;
            data.tag.clear();
            data.stack_size = 0;
            data.priority = Priority::MEDIUM;
            data.wait_callback = None;
            data.fiber_in_flight = false;
            data.profile_head = INVALID_INDEX;
            data.profile_tail = INVALID_INDEX;
            data.profile_depth = 0;
            std::mem::replace(&mut data.completion_counter, INVALID_INDEX)
        };
        if completion_counter != INVALID_INDEX {
            self.release_counter(completion_counter);
        }

        slot.status.store(JobStatus::Initialized);
        slot.pending_predecessors.store(0, Ordering::SeqCst);
        slot.queues_contained_in.store(0, Ordering::SeqCst);
        slot.priority_bits.store(0, Ordering::SeqCst);
        slot.wait_next.store(INVALID_INDEX, Ordering::SeqCst);
        slot.waiter_head.store(INVALID_INDEX, Ordering::SeqCst);

        self.log(
            LogVerbosity::Verbose,
            LogGroup::Scheduler,
            format_args!("job handle freed, index={}", index),
        );
        self.jobs.free(index);
    }

    // ---- counter refcounting --------------------------------------------

    pub(crate) fn add_counter_ref(&self, index: usize) {
        self.counters.get(index).ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_counter(&self, index: usize) {
        if self.counters.get(index).ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counters.get(index).reset();
            self.log(
                LogVerbosity::Verbose,
                LogGroup::Scheduler,
                format_args!("counter handle freed, index={}", index),
            );
            self.counters.free(index);
        }
    }

    // ---- dependency graph -----------------------------------------------

    pub(crate) fn add_job_dependency(&self, successor: usize, predecessor: usize) -> Result<()> {
        if successor == predecessor {
            return Err(Error::InvalidHandle);
        }

        let successor_slot = self.jobs.get(successor);
        let predecessor_slot = self.jobs.get(predecessor);
        if !successor_slot.is_mutable() || !predecessor_slot.is_mutable() {
            return Err(Error::NotMutable);
        }

        let mut deps = self.dependencies.lock();

        let Some(node_in_predecessor) = deps.alloc() else {
            self.log_dependency_pool_exhausted();
            return Err(Error::OutOfDependencies);
        };
        let Some(node_in_successor) = deps.alloc() else {
            deps.free_slot(node_in_predecessor);
            self.log_dependency_pool_exhausted();
            return Err(Error::OutOfDependencies);
        };

        // One node in the predecessor's successor list naming the successor,
        // one in the successor's predecessor list naming the predecessor.
        // Each holds a refcount on the job it names.
        deps.slots[node_in_predecessor].other_job = successor;
        deps.slots[node_in_predecessor].next = predecessor_slot.first_successor.load(Ordering::SeqCst);
        predecessor_slot
            .first_successor
            .store(node_in_predecessor, Ordering::SeqCst);
        self.add_job_ref(successor);

        deps.slots[node_in_successor].other_job = predecessor;
        deps.slots[node_in_successor].next = successor_slot.first_predecessor.load(Ordering::SeqCst);
        successor_slot
            .first_predecessor
            .store(node_in_successor, Ordering::SeqCst);
        self.add_job_ref(predecessor);

        successor_slot.pending_predecessors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn log_dependency_pool_exhausted(&self) {
        self.log(
            LogVerbosity::Warning,
            LogGroup::Job,
            format_args!(
                "attempt to add job dependency, but dependency pool is empty, if unhandled \
                 may cause incorrect job ordering behaviour. Try increasing \
                 SchedulerBuilder::max_dependencies."
            ),
        );
    }

    /// Removes every edge touching `index`, in both directions, including
    /// the twin nodes held by the jobs on the other end.
    pub(crate) fn clear_job_dependencies(&self, index: usize) {
        let slot = self.jobs.get(index);
        let mut deps = self.dependencies.lock();

        let mut cursor = slot.first_predecessor.swap(INVALID_INDEX, Ordering::SeqCst);
        while cursor != INVALID_INDEX {
            let (predecessor, next) = (deps.slots[cursor].other_job, deps.slots[cursor].next);
            deps.free_slot(cursor);

            let predecessor_slot = self.jobs.get(predecessor);
            if remove_edge_from_list(&mut deps, &predecessor_slot.first_successor, index) {
                self.release_job(index);
            }
            self.release_job(predecessor);
            cursor = next;
        }
        slot.pending_predecessors.store(0, Ordering::SeqCst);

        let mut cursor = slot.first_successor.swap(INVALID_INDEX, Ordering::SeqCst);
        while cursor != INVALID_INDEX {
            let (successor, next) = (deps.slots[cursor].other_job, deps.slots[cursor].next);
            deps.free_slot(cursor);

            let successor_slot = self.jobs.get(successor);
            if remove_edge_from_list(&mut deps, &successor_slot.first_predecessor, index) {
                successor_slot.pending_predecessors.fetch_sub(1, Ordering::SeqCst);
                self.release_job(index);
            }
            self.release_job(successor);
            cursor = next;
        }
    }

    // ---- dispatch, requeue, dequeue ---------------------------------------

    pub(crate) fn dispatch_job(&self, index: usize) -> Result<()> {
        let slot = self.jobs.get(index);

        let observed = slot.status.load();
        if observed != JobStatus::Initialized && observed != JobStatus::Completed {
            return Err(Error::AlreadyDispatched);
        }

        self.log(
            LogVerbosity::Verbose,
            LogGroup::Job,
            format_args!("dispatching job, index={}", index),
        );

        // Scheduled hold: the job cannot be freed while in flight.
        self.add_job_ref(index);

        {
            let data = slot.data.lock();
            slot.priority_bits.store(data.priority.bits(), Ordering::SeqCst);
        }
        slot.queues_contained_in.store(0, Ordering::SeqCst);
        slot.set_wait_result(WaitResult::Signaled);

        // Count the job active before it becomes Pending: a predecessor
        // completing right after the transition may requeue and even finish
        // it before this function returns.
        self.active_jobs.fetch_add(1, Ordering::SeqCst);

        if !slot.status.transition(observed, JobStatus::Pending) {
            self.active_jobs.fetch_sub(1, Ordering::SeqCst);
            self.release_job(index);
            return Err(Error::AlreadyDispatched);
        }

        if slot.pending_predecessors.load(Ordering::SeqCst) == 0 {
            self.requeue_job(index);
        }

        self.notify_job_available();
        Ok(())
    }

    /// Pushes the job into every priority queue its mask names and that does
    /// not already contain it. Idempotent: a concurrent dispatcher and
    /// predecessor-completer may both call this for the same wake-up.
    pub(crate) fn requeue_job(&self, index: usize) {
        let slot = self.jobs.get(index);
        debug_assert_eq!(slot.pending_predecessors.load(Ordering::SeqCst), 0);

        let priority_bits = slot.priority_bits.load(Ordering::SeqCst);
        for bit in 0..PRIORITY_COUNT {
            let mask = 1u32 << bit;
            if priority_bits & mask != 0
                && slot.queues_contained_in.fetch_or(mask, Ordering::SeqCst) & mask == 0
            {
                if self.queues[bit].push(index).is_err() {
                    // Queues are sized to max_jobs; this cannot happen unless
                    // the containment bits were corrupted.
                    self.log(
                        LogVerbosity::Error,
                        LogGroup::Scheduler,
                        format_args!("ready queue {} rejected job {}", bit, index),
                    );
                }
            }
        }
    }

    fn get_next_job_from_queue(&self, queue_index: usize, mask: u32) -> Option<usize> {
        let queue = &self.queues[queue_index];

        let count = queue.len();
        for _ in 0..count {
            let index = queue.pop()?;
            let slot = self.jobs.get(index);

            // Off the queue before the status flip.
            slot.queues_contained_in.fetch_and(!mask, Ordering::SeqCst);

            // The predecessor gate also rejects a stale queue entry from an
            // earlier dispatch of a since-recycled job; the real wake-up
            // requeues a fresh entry when the count reaches zero.
            if slot.pending_predecessors.load(Ordering::SeqCst) == 0
                && slot.status.transition(JobStatus::Pending, JobStatus::Running)
            {
                return Some(index);
            }
            // Stale copy, or picked up through another queue already.
        }

        None
    }

    fn get_next_job(&self, priorities: Priority, can_block: bool) -> Option<usize> {
        while !self.destroying.load(Ordering::SeqCst) {
            // Highest priority first.
            for bit in (0..PRIORITY_COUNT).rev() {
                let mask = 1u32 << bit;
                if priorities.bits() & mask == 0 {
                    continue;
                }
                if let Some(index) = self.get_next_job_from_queue(bit, mask) {
                    return Some(index);
                }
            }

            if !can_block {
                return None;
            }
            self.wait_for_job_available(priorities);
        }

        None
    }

    /// Dequeues and runs one job, if any is ready. Returns whether any
    /// progress was made.
    pub(crate) fn execute_next_job(&self, priorities: Priority, can_block: bool) -> bool {
        let Some(index) = self.get_next_job(priorities, can_block) else {
            return false;
        };
        let slot = self.jobs.get(index);

        // Take the job's fiber, binding one on first run. A job that was
        // woken immediately after suspending may be dequeued before its
        // previous worker has parked the fiber handle; spin until it appears.
        let job_fiber = loop {
            let mut data = slot.data.lock();

            if let Some(parked) = data.fiber.take() {
                data.fiber_in_flight = true;
                break parked;
            }

            if data.fiber_in_flight {
                drop(data);
                thread::yield_now();
                continue;
            }

            match self.allocate_fiber(data.stack_size) {
                Ok((fresh, pool_index)) => {
                    data.fiber_pool = pool_index;
                    data.fiber_in_flight = true;
                    break fresh;
                }
                Err(Error::OutOfFibers) => {
                    drop(data);
                    self.log(
                        LogVerbosity::Warning,
                        LogGroup::Job,
                        format_args!("requeuing job as no fibers available, index={}", index),
                    );
                    slot.status.store(JobStatus::Pending);
                    self.requeue_job(index);
                    return true;
                }
                Err(_) => {
                    // No pool can satisfy the stack requirement; already
                    // logged at error level. The job is left unscheduled.
                    drop(data);
                    slot.status.store(JobStatus::Pending);
                    return true;
                }
            }
        };

        worker::set_current_job(index);
        worker::set_job_completed(false);
        worker::set_suppress_requeue(false);

        self.log(
            LogVerbosity::Verbose,
            LogGroup::Job,
            format_args!("switching to job, index={}", index),
        );
        let job_fiber = self.switch_to_job(index, job_fiber);

        if worker::job_completed() {
            let pool_index = {
                let mut data = slot.data.lock();
                data.fiber_in_flight = false;
                data.fiber_pool
            };
            self.free_fiber(job_fiber, pool_index);
            self.complete_job(index);
        } else {
            {
                let mut data = slot.data.lock();
                data.fiber = Some(job_fiber);
                data.fiber_in_flight = false;
            }
            if !worker::suppress_requeue() {
                slot.status.store(JobStatus::Pending);
                self.requeue_job(index);
            }
        }

        worker::set_current_job(INVALID_INDEX);
        true
    }

    // ---- completion -------------------------------------------------------

    fn complete_job(&self, index: usize) {
        let slot = self.jobs.get(index);
        debug_assert_eq!(slot.status.load(), JobStatus::Running);
        slot.status.store(JobStatus::Completed);

        self.log(
            LogVerbosity::Verbose,
            LogGroup::Job,
            format_args!("completed job, index={}", index),
        );

        let completion_counter = slot.data.lock().completion_counter;
        if completion_counter != INVALID_INDEX {
            self.counter_add(completion_counter, 1);
        }

        // Wake every job suspended on this handle.
        let mut woke_waiter = false;
        {
            let _guard = slot.waiter_lock.write();
            let mut cursor = slot.waiter_head.swap(INVALID_INDEX, Ordering::SeqCst);
            while cursor != INVALID_INDEX {
                let waiter = self.jobs.get(cursor);
                let next = waiter.wait_next.load(Ordering::SeqCst);

                if waiter
                    .status
                    .transition(JobStatus::WaitingOnJob, JobStatus::Pending)
                {
                    waiter.wait_next.store(INVALID_INDEX, Ordering::SeqCst);
                    waiter.set_wait_result(WaitResult::Signaled);
                    self.requeue_job(cursor);
                    woke_waiter = true;
                }
                cursor = next;
            }
        }

        // Release successors and drop this job's edges.
        let mut woke_successor = false;
        {
            let mut deps = self.dependencies.lock();

            let mut cursor = slot.first_successor.swap(INVALID_INDEX, Ordering::SeqCst);
            while cursor != INVALID_INDEX {
                let (successor, next) = (deps.slots[cursor].other_job, deps.slots[cursor].next);
                deps.free_slot(cursor);

                let successor_slot = self.jobs.get(successor);
                if successor_slot.pending_predecessors.fetch_sub(1, Ordering::SeqCst) == 1
                    && successor_slot.status.load() == JobStatus::Pending
                {
                    // Already dispatched; not yet dispatched successors are
                    // queued by their own dispatch seeing a zero count.
                    self.requeue_job(successor);
                    woke_successor = true;
                }

                self.release_job(successor);
                cursor = next;
            }

            let mut cursor = slot.first_predecessor.swap(INVALID_INDEX, Ordering::SeqCst);
            while cursor != INVALID_INDEX {
                let (predecessor, next) = (deps.slots[cursor].other_job, deps.slots[cursor].next);
                deps.free_slot(cursor);
                self.release_job(predecessor);
                cursor = next;
            }
        }

        // Drop the scheduled hold taken at dispatch.
        self.release_job(index);
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);

        if woke_waiter || woke_successor {
            self.notify_job_available();
        }
        self.notify_job_complete();
    }

    // ---- job-to-job waits -------------------------------------------------

    pub(crate) fn wait_for_job(&self, target_index: usize, timeout: Timeout) -> Result<()> {
        // The fiber path needs the running job to belong to this scheduler;
        // waiting on a foreign scheduler's job degrades to blocking.
        if let Some((active, waiter_index)) = worker::active_job() {
            if std::ptr::eq(Arc::as_ptr(&active), self) {
                if waiter_index == target_index {
                    return Err(Error::InvalidHandle);
                }
                return self.wait_for_job_on_fiber(target_index, waiter_index, timeout);
            }
        }
        self.wait_for_job_blocking(target_index, timeout)
    }

    fn wait_for_job_on_fiber(
        &self,
        target_index: usize,
        waiter_index: usize,
        timeout: Timeout,
    ) -> Result<()> {
        let target = self.jobs.get(target_index);
        let waiter = self.jobs.get(waiter_index);

        waiter.set_wait_result(WaitResult::Signaled);
        waiter.status.store(JobStatus::WaitingOnJob);

        {
            // Readers attach, the completer drains exclusively. Holding the
            // shared lock also keeps the timeout callback (which claims under
            // the exclusive lock) away until the park is complete.
            let _guard = target.waiter_lock.read();

            if target.status.load() == JobStatus::Completed {
                waiter.status.store(JobStatus::Running);
                return Ok(());
            }

            if !timeout.is_infinite() {
                // Key the claim to this wait's exact status epoch; a callback
                // that outlives the wait can never touch a later one.
                let armed = waiter.status.snapshot();
                let weak = self.self_weak.clone();
                match self.callbacks.schedule(timeout, move || {
                    let Some(shared) = weak.upgrade() else { return };
                    let target = shared.jobs.get(target_index);
                    let waiter = shared.jobs.get(waiter_index);

                    let _guard = target.waiter_lock.write();
                    if waiter.status.transition_exact(armed, JobStatus::Pending) {
                        unlink_job_waiter(&shared, target, waiter_index);
                        waiter.set_wait_result(WaitResult::TimedOut);
                        shared.requeue_job(waiter_index);
                        shared.notify_job_available();
                    }
                }) {
                    Ok(handle) => {
                        waiter.data.lock().wait_callback = Some(handle);
                    }
                    Err(error) => {
                        waiter.status.store(JobStatus::Running);
                        return Err(error);
                    }
                }
            }

            // Lock-free push under the shared lock.
            loop {
                let head = target.waiter_head.load(Ordering::SeqCst);
                waiter.wait_next.store(head, Ordering::SeqCst);
                if target
                    .waiter_head
                    .compare_exchange(head, waiter_index, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        }

        worker::yield_to_worker(self);

        let callback = waiter.data.lock().wait_callback.take();
        match waiter.wait_result() {
            WaitResult::Signaled => {
                if let Some(callback) = callback {
                    self.callbacks.cancel(callback);
                }
                Ok(())
            }
            WaitResult::TimedOut => Err(Error::Timeout),
        }
    }

    fn wait_for_job_blocking(&self, target_index: usize, timeout: Timeout) -> Result<()> {
        let target = self.jobs.get(target_index);
        let watch = Stopwatch::start();

        let mut guard = self.job_complete_mutex.lock();
        while target.status.load() != JobStatus::Completed {
            if timeout.is_infinite() {
                self.job_complete_cvar.wait(&mut guard);
            } else {
                let elapsed = watch.elapsed_ms();
                if elapsed >= timeout.as_millis() {
                    return Err(Error::Timeout);
                }
                self.job_complete_cvar
                    .wait_for(&mut guard, Duration::from_millis(timeout.as_millis() - elapsed));
            }
        }
        Ok(())
    }

    // ---- idle tracking ----------------------------------------------------

    pub(crate) fn is_idle(&self) -> bool {
        self.active_jobs.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn wait_until_idle(&self, timeout: Timeout) -> Result<()> {
        debug_assert!(
            worker::active_job().is_none(),
            "wait_until_idle would block the calling worker"
        );

        let watch = Stopwatch::start();
        let mut guard = self.job_complete_mutex.lock();
        while !self.is_idle() && !self.destroying.load(Ordering::SeqCst) {
            if timeout.is_infinite() {
                self.job_complete_cvar.wait(&mut guard);
            } else {
                let elapsed = watch.elapsed_ms();
                if elapsed >= timeout.as_millis() {
                    return Err(Error::Timeout);
                }
                self.job_complete_cvar
                    .wait_for(&mut guard, Duration::from_millis(timeout.as_millis() - elapsed));
            }
        }
        Ok(())
    }

    // ---- worker wake-up ---------------------------------------------------

    fn any_queued(&self, priorities: Priority) -> bool {
        (0..PRIORITY_COUNT).any(|bit| {
            priorities.bits() & (1 << bit) != 0 && !self.queues[bit].is_empty()
        })
    }

    fn wait_for_job_available(&self, priorities: Priority) {
        let mut guard = self.job_available_mutex.lock();
        // Re-check under the lock; enqueuers tap the same lock before
        // notifying, so a push cannot slip between the check and the wait.
        if self.destroying.load(Ordering::SeqCst) || self.any_queued(priorities) {
            return;
        }
        self.job_available_cvar.wait(&mut guard);
    }

    pub(crate) fn notify_job_available(&self) {
        drop(self.job_available_mutex.lock());
        self.job_available_cvar.notify_all();
    }

    fn notify_job_complete(&self) {
        drop(self.job_complete_mutex.lock());
        self.job_complete_cvar.notify_all();
    }

    // ---- fibers -----------------------------------------------------------

    fn allocate_fiber(&self, required_stack_size: usize) -> Result<(Fiber, usize)> {
        let mut any_suitable_pool = false;

        for (pool_index, pool) in self.fiber_pools.iter().enumerate() {
            if pool.stack_size < required_stack_size {
                continue;
            }
            any_suitable_pool = true;

            if let Some(fiber) = pool.free.lock().pop() {
                self.log(
                    LogVerbosity::Verbose,
                    LogGroup::Job,
                    format_args!("fiber allocated, pool={}", pool_index),
                );
                return Ok((fiber, pool_index));
            }
        }

        if !any_suitable_pool {
            self.log(
                LogVerbosity::Error,
                LogGroup::Job,
                format_args!(
                    "no fiber pool has a large enough stack to fulfil request for {} bytes. \
                     job will never run.",
                    required_stack_size
                ),
            );
            Err(Error::MaximumExceeded)
        } else {
            Err(Error::OutOfFibers)
        }
    }

    fn free_fiber(&self, fiber: Fiber, pool_index: usize) {
        self.log(
            LogVerbosity::Verbose,
            LogGroup::Job,
            format_args!("fiber freed, pool={}", pool_index),
        );
        self.fiber_pools[pool_index].free.lock().push(fiber);
    }

    // ---- context switching ------------------------------------------------

    /// Switches from the worker's context onto a job's fiber, replaying
    /// profile scopes across the boundary, and returns the job's fiber
    /// handle once the job switches back.
    fn switch_to_job(&self, index: usize, job_fiber: Fiber) -> Fiber {
        if self.profile.is_some() {
            let worker_depth = worker::with_worker_scopes(|scopes| scopes.depth);
            self.replay_leave_scopes(worker_depth);

            let job_scopes = {
                let data = self.jobs.get(index).data.lock();
                ScopeList {
                    head: data.profile_head,
                    tail: data.profile_tail,
                    depth: data.profile_depth,
                }
            };
            self.replay_enter_scopes(&job_scopes);
        }
        worker::set_active_is_job(true);

        unsafe { job_fiber.resume() }
    }

    /// The job-side half of a switch back to the worker: unwinds the job's
    /// profile scopes, replays the worker's, and flips the active-context
    /// flag. The actual fiber switch is the caller's.
    pub(crate) fn switch_to_worker_context(&self) {
        if self.profile.is_some() {
            let index = worker::current_job_index();
            let job_depth = self.jobs.get(index).data.lock().profile_depth;
            self.replay_leave_scopes(job_depth);

            let worker_scopes = worker::with_worker_scopes(|scopes| *scopes);
            self.replay_enter_scopes(&worker_scopes);
        }
        worker::set_active_is_job(false);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Job-bound fibers must be gone before their stacks are returned.
        for slot in self.jobs.slots_mut() {
            slot.data.get_mut().fiber = None;
        }

        let memory = &self.memory;
        for pool in &mut self.fiber_pools {
            pool.free.get_mut().clear();
            for block in pool.stacks.drain(..) {
                (memory.free)(block.ptr, block.size, STACK_ALIGN);
            }
        }
    }
}

fn remove_edge_from_list(
    deps: &mut DependencyPool,
    head: &AtomicUsize,
    other_job: usize,
) -> bool {
    let mut prev = INVALID_INDEX;
    let mut cursor = head.load(Ordering::SeqCst);

    while cursor != INVALID_INDEX {
        let (named, next) = (deps.slots[cursor].other_job, deps.slots[cursor].next);
        if named == other_job {
            if prev == INVALID_INDEX {
                head.store(next, Ordering::SeqCst);
            } else {
                deps.slots[prev].next = next;
            }
            deps.free_slot(cursor);
            return true;
        }
        prev = cursor;
        cursor = next;
    }

    false
}

fn unlink_job_waiter(shared: &Shared, target: &JobSlot, waiter_index: usize) {
    let mut prev = INVALID_INDEX;
    let mut cursor = target.waiter_head.load(Ordering::SeqCst);

    while cursor != INVALID_INDEX {
        let next = shared.jobs.get(cursor).wait_next.load(Ordering::SeqCst);
        if cursor == waiter_index {
            if prev == INVALID_INDEX {
                target.waiter_head.store(next, Ordering::SeqCst);
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

/// Suspends the calling job for at least `duration`.
///
/// Inside a job this parks the fiber and arms a timer wakeup, so the worker
/// is free to run other jobs meanwhile; on a plain thread it degrades to
/// `thread::sleep`. An infinite duration is a contract violation: rejected
/// with a debug assertion, and with [`Error::Timeout`] in release builds.
pub fn sleep(duration: Timeout) -> Result<()> {
    debug_assert!(!duration.is_infinite(), "sleep with an infinite timeout");
    if duration.is_infinite() {
        return Err(Error::Timeout);
    }

    if let Some((shared, job_index)) = worker::active_job() {
        let slot = shared.jobs.get(job_index);

        shared.log(
            LogVerbosity::Verbose,
            LogGroup::Job,
            format_args!("sleeping job, index={}", job_index),
        );

        slot.status.store(JobStatus::Sleeping);

        let armed = slot.status.snapshot();
        let weak = shared.self_weak.clone();
        if let Err(error) = shared.callbacks.schedule(duration, move || {
            let Some(shared) = weak.upgrade() else { return };
            let slot = shared.jobs.get(job_index);
            if slot.status.transition_exact(armed, JobStatus::Pending) {
                shared.log(
                    LogVerbosity::Verbose,
                    LogGroup::Job,
                    format_args!("waking job, index={}", job_index),
                );
                shared.requeue_job(job_index);
                shared.notify_job_available();
            }
        }) {
            slot.status.store(JobStatus::Running);
            return Err(error);
        }

        worker::yield_to_worker(&shared);
        Ok(())
    } else {
        thread::sleep(duration.as_duration());
        Ok(())
    }
}

/// Whether the calling code is running inside a job.
pub fn in_job() -> bool {
    worker::active_job().is_some()
}

/// Fixes the scheduler's limits and pools ahead of [`init`], which performs
/// every allocation up front and starts the runtime.
///
/// All setters fail with [`Error::AlreadyInitialized`] once `init` has been
/// called.
///
/// [`init`]: SchedulerBuilder::init
pub struct SchedulerBuilder {
    initialized: bool,
    max_jobs: usize,
    max_dependencies: usize,
    max_counters: usize,
    max_callbacks: usize,
    max_profile_scopes: usize,
    thread_pools: Vec<(usize, Priority)>,
    fiber_pools: Vec<(usize, usize)>,
    memory: Option<MemoryFunctions>,
    profile: Option<ProfileFunctions>,
    debug_sink: Option<Box<DebugOutputFn>>,
    debug_verbosity: LogVerbosity,
}

impl Default for SchedulerBuilder {
    fn default() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("SchedulerBuilder")
            .field("initialized", &self.initialized)
            .field("max_jobs", &self.max_jobs)
            .field("max_dependencies", &self.max_dependencies)
            .field("max_counters", &self.max_counters)
            .field("max_callbacks", &self.max_callbacks)
            .field("max_profile_scopes", &self.max_profile_scopes)
            .field("thread_pools", &self.thread_pools)
            .field("fiber_pools", &self.fiber_pools)
            .finish_non_exhaustive()
    }
}

impl SchedulerBuilder {
    pub fn new() -> SchedulerBuilder {
        SchedulerBuilder {
            initialized: false,
            max_jobs: 100,
            max_dependencies: 100,
            max_counters: 100,
            max_callbacks: 100,
            max_profile_scopes: 1000,
            thread_pools: Vec::new(),
            fiber_pools: Vec::new(),
            memory: None,
            profile: None,
            debug_sink: None,
            debug_verbosity: LogVerbosity::Message,
        }
    }

    fn mutable(&mut self) -> Result<&mut SchedulerBuilder> {
        if self.initialized {
            Err(Error::AlreadyInitialized)
        } else {
            Ok(self)
        }
    }

    /// Overrides the allocation functions used for fiber stacks.
    pub fn set_memory_functions(&mut self, functions: MemoryFunctions) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.memory = Some(functions);
        Ok(this)
    }

    /// Installs the profiling enter/leave hook pair.
    pub fn set_profile_functions(&mut self, functions: ProfileFunctions) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.profile = Some(functions);
        Ok(this)
    }

    /// Installs a sink for all scheduler debug output at or below
    /// `max_verbosity`.
    pub fn set_debug_output(
        &mut self,
        sink: Box<DebugOutputFn>,
        max_verbosity: LogVerbosity,
    ) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.debug_sink = Some(sink);
        this.debug_verbosity = max_verbosity;
        Ok(this)
    }

    /// Maximum number of jobs managed concurrently. Directly sizes the job
    /// pool and each ready queue.
    pub fn set_max_jobs(&mut self, max_jobs: usize) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.max_jobs = max_jobs;
        Ok(this)
    }

    /// Maximum number of dependency edges shared between all jobs at once.
    pub fn set_max_dependencies(&mut self, max_dependencies: usize) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.max_dependencies = max_dependencies;
        Ok(this)
    }

    pub fn set_max_counters(&mut self, max_counters: usize) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.max_counters = max_counters;
        Ok(this)
    }

    /// Maximum number of latent callbacks; one is armed for every wait or
    /// sleep given a finite timeout.
    pub fn set_max_callbacks(&mut self, max_callbacks: usize) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.max_callbacks = max_callbacks;
        Ok(this)
    }

    /// Maximum number of in-flight profile scopes. Raise this for heavily
    /// nested profiled call graphs.
    pub fn set_max_profile_scopes(&mut self, max_profile_scopes: usize) -> Result<&mut Self> {
        let this = self.mutable()?;
        this.max_profile_scopes = max_profile_scopes;
        Ok(this)
    }

    /// Adds a pool of worker threads that will only execute jobs whose
    /// priority intersects `priorities`. Long-running and time-critical work
    /// can be segregated onto different pools this way.
    pub fn add_thread_pool(
        &mut self,
        thread_count: usize,
        priorities: Priority,
    ) -> Result<&mut Self> {
        let this = self.mutable()?;
        if this.thread_pools.len() == MAX_THREAD_POOLS {
            return Err(Error::MaximumExceeded);
        }
        this.thread_pools.push((thread_count, priorities));
        Ok(this)
    }

    /// Adds a pool of fibers with the given stack size. A job always binds a
    /// fiber from the smallest pool that satisfies its stack requirement, so
    /// several pools with graded stack sizes keep memory usage down. The
    /// fiber count bounds how many jobs can be in flight (running or
    /// suspended) at once.
    pub fn add_fiber_pool(&mut self, fiber_count: usize, stack_size: usize) -> Result<&mut Self> {
        let this = self.mutable()?;
        if this.fiber_pools.len() == MAX_FIBER_POOLS {
            return Err(Error::MaximumExceeded);
        }
        this.fiber_pools.push((fiber_count, stack_size));
        Ok(this)
    }

    /// Performs all allocation up front, starts the timer thread and every
    /// worker, and returns the running scheduler.
    pub fn init(&mut self) -> Result<Scheduler> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        if self.thread_pools.is_empty() {
            return Err(Error::NoThreadPools);
        }
        if self.fiber_pools.is_empty() {
            return Err(Error::NoFiberPools);
        }
        self.initialized = true;

        let debug = DebugLog::new(self.debug_sink.take(), self.debug_verbosity);
        let memory = self.memory.take().unwrap_or_default();
        let total_memory_allocated = AtomicUsize::new(0);

        let callbacks = CallbackScheduler::new(self.max_callbacks)?;

        // Sorted ascending by stack size so allocation finds the smallest
        // sufficient stack first.
        let mut fiber_pool_descs = self.fiber_pools.clone();
        fiber_pool_descs.sort_by_key(|&(_, stack_size)| stack_size);

        let mut fiber_pools: Vec<FiberPool> = Vec::with_capacity(fiber_pool_descs.len());
        for &(fiber_count, stack_size) in &fiber_pool_descs {
            match build_fiber_pool(fiber_count, stack_size, &memory, &debug, &total_memory_allocated)
            {
                Ok(pool) => fiber_pools.push(pool),
                Err(error) => {
                    release_fiber_pools(&mut fiber_pools, &memory);
                    return Err(error);
                }
            }
        }

        let max_jobs = self.max_jobs;
        let queues = (0..PRIORITY_COUNT)
            .map(|_| AtomicIndexQueue::new(max_jobs))
            .collect();

        let shared = Arc::new_cyclic(|self_weak| Shared {
            self_weak: self_weak.clone(),
            jobs: FixedPool::new(self.max_jobs, |_| JobSlot::new()),
            counters: FixedPool::new(self.max_counters, |_| CounterSlot::new()),
            scopes: FixedPool::new(self.max_profile_scopes, |_| ScopeSlot::new()),
            dependencies: Mutex::new(DependencyPool::new(self.max_dependencies)),
            queues,
            fiber_pools,
            callbacks,
            threads: Mutex::new(Vec::new()),
            active_jobs: AtomicUsize::new(0),
            destroying: AtomicBool::new(false),
            job_available_mutex: Mutex::new(()),
            job_available_cvar: Condvar::new(),
            job_complete_mutex: Mutex::new(()),
            job_complete_cvar: Condvar::new(),
            debug,
            profile: self.profile.take(),
            memory,
            total_memory_allocated,
        });

        let mut threads = Vec::new();
        for (pool_index, &(thread_count, priorities)) in self.thread_pools.iter().enumerate() {
            for worker_index in 0..thread_count {
                match worker::spawn_worker(Arc::clone(&shared), pool_index, worker_index, priorities)
                {
                    Ok(handle) => threads.push(handle),
                    Err(error) => {
                        shared.destroying.store(true, Ordering::SeqCst);
                        shared.notify_job_available();
                        for handle in threads {
                            let _ = handle.join();
                        }
                        shared.callbacks.shutdown();
                        return Err(error);
                    }
                }
            }
        }
        *shared.threads.lock() = threads;

        shared.log(
            LogVerbosity::Message,
            LogGroup::Scheduler,
            format_args!("scheduler initialized"),
        );
        shared.log(
            LogVerbosity::Message,
            LogGroup::Scheduler,
            format_args!(
                "\t{} bytes allocated for fiber stacks",
                shared.total_memory_allocated.load(Ordering::SeqCst)
            ),
        );
        shared.log(
            LogVerbosity::Message,
            LogGroup::Scheduler,
            format_args!(
                "\t{} max jobs, {} max dependencies, {} max counters, {} max callbacks, \
                 {} max profile scopes",
                self.max_jobs,
                self.max_dependencies,
                self.max_counters,
                self.max_callbacks,
                self.max_profile_scopes
            ),
        );
        for (pool_index, &(thread_count, priorities)) in self.thread_pools.iter().enumerate() {
            shared.log(
                LogVerbosity::Message,
                LogGroup::Scheduler,
                format_args!(
                    "\tthread pool [{}] workers={} priorities={:#x}",
                    pool_index,
                    thread_count,
                    priorities.bits()
                ),
            );
        }
        for (pool_index, pool) in shared.fiber_pools.iter().enumerate() {
            shared.log(
                LogVerbosity::Message,
                LogGroup::Scheduler,
                format_args!(
                    "\tfiber pool [{}] fibers={} stack_size={}",
                    pool_index,
                    pool.stacks.len(),
                    pool.stack_size
                ),
            );
        }

        Ok(Scheduler { shared })
    }
}

fn build_fiber_pool(
    fiber_count: usize,
    stack_size: usize,
    memory: &MemoryFunctions,
    debug: &DebugLog,
    total_memory_allocated: &AtomicUsize,
) -> Result<FiberPool> {
    let stack_size = stack_size.max(MIN_STACK_SIZE);

    let mut stacks: Vec<StackBlock> = Vec::with_capacity(fiber_count);
    let mut fibers = Vec::with_capacity(fiber_count);

    for _ in 0..fiber_count {
        let ptr = (memory.alloc)(stack_size, STACK_ALIGN);
        if ptr.is_null() {
            drop(fibers);
            for block in stacks.drain(..) {
                (memory.free)(block.ptr, block.size, STACK_ALIGN);
            }
            return Err(Error::OutOfMemory);
        }

        let total = total_memory_allocated.fetch_add(stack_size, Ordering::SeqCst) + stack_size;
        debug.write(
            LogVerbosity::Verbose,
            LogGroup::Memory,
            format_args!("allocated fiber stack, size={} total={}", stack_size, total),
        );

        stacks.push(StackBlock { ptr, size: stack_size });
        fibers.push(unsafe { Fiber::with_raw_stack(ptr, stack_size, worker::job_fiber_proc) });
    }

    Ok(FiberPool {
        stack_size,
        free: Mutex::new(fibers),
        stacks,
    })
}

fn release_fiber_pools(pools: &mut Vec<FiberPool>, memory: &MemoryFunctions) {
    for pool in pools.iter_mut() {
        pool.free.get_mut().clear();
        for block in pool.stacks.drain(..) {
            (memory.free)(block.ptr, block.size, STACK_ALIGN);
        }
    }
    pools.clear();
}

/// The running scheduler. Created by [`SchedulerBuilder::init`].
///
/// Dropping the scheduler shuts the runtime down: workers finish their
/// current stint and exit, pending timer callbacks are discarded, and any
/// still-suspended job is abandoned (its fiber stack is freed without
/// unwinding, so values owned by suspended frames leak).
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a new job that can be configured and later dispatched.
    pub fn create_job(&self) -> Result<JobHandle> {
        let Some(index) = self.shared.jobs.alloc() else {
            self.shared.log(
                LogVerbosity::Warning,
                LogGroup::Scheduler,
                format_args!(
                    "attempt to create job, but job pool is empty. \
                     Try increasing SchedulerBuilder::max_jobs."
                ),
            );
            return Err(Error::OutOfJobs);
        };

        self.shared.log(
            LogVerbosity::Verbose,
            LogGroup::Scheduler,
            format_args!("job handle allocated, index={}", index),
        );
        Ok(JobHandle::new(Arc::clone(&self.shared), index))
    }

    /// Creates a new counter for job synchronization.
    pub fn create_counter(&self) -> Result<CounterHandle> {
        let Some(index) = self.shared.counters.alloc() else {
            self.shared.log(
                LogVerbosity::Warning,
                LogGroup::Scheduler,
                format_args!(
                    "attempt to create counter, but counter pool is empty. \
                     Try increasing SchedulerBuilder::max_counters."
                ),
            );
            return Err(Error::OutOfCounters);
        };

        self.shared.log(
            LogVerbosity::Verbose,
            LogGroup::Scheduler,
            format_args!("counter handle allocated, index={}", index),
        );
        Ok(CounterHandle::new(Arc::clone(&self.shared), index))
    }

    /// Creates a new event. Auto-reset events release exactly one waiter per
    /// signal; manual-reset events release everyone until reset.
    pub fn create_event(&self, auto_reset: bool) -> Result<EventHandle> {
        Ok(EventHandle::new(self.create_counter()?, auto_reset))
    }

    /// Blocks the calling thread until no dispatched job remains incomplete.
    /// Must not be called from inside a job.
    pub fn wait_until_idle(&self, timeout: Timeout) -> Result<()> {
        self.shared.wait_until_idle(timeout)
    }

    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Bytes of fiber-stack memory allocated through the memory functions.
    pub fn total_memory_allocated(&self) -> usize {
        self.shared.total_memory_allocated.load(Ordering::SeqCst)
    }

    pub fn logical_core_count() -> usize {
        num_cpus::get()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Scheduler")
            .field("active_jobs", &self.shared.active_jobs.load(Ordering::SeqCst))
            .field("max_jobs", &self.shared.jobs.capacity())
            .finish_non_exhaustive()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.destroying.store(true, Ordering::SeqCst);
        self.shared.notify_job_available();
        self.shared.notify_job_complete();
        self.shared.callbacks.shutdown();

        let threads = std::mem::take(&mut *self.shared.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }
}
