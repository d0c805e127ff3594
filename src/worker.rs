//! Worker threads and the thread-local job context.
//!
//! Each worker converts itself into a fiber at startup (its "host" fiber),
//! then loops dequeuing ready jobs and switching onto their fibers. The
//! thread-locals below are the channel between the two sides of a switch:
//! the worker publishes which job is active, the job side publishes how it
//! finished.
//!
//! Every accessor is `#[inline(never)]`: a job fiber can suspend on one
//! thread and resume on another, and an inlined TLS access would let the
//! compiler reuse a stale pre-switch TLS address.

use crate::job::{Priority, INVALID_INDEX};
use crate::profile::ProfileScopeType;
use crate::scheduler::Shared;
use crate::{LogGroup, LogVerbosity};
use fiber::Fiber;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Per-context stack of profile scopes, linked through the scope pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScopeList {
    pub head: usize,
    pub tail: usize,
    pub depth: usize,
}

impl ScopeList {
    pub fn new() -> ScopeList {
        ScopeList {
            head: INVALID_INDEX,
            tail: INVALID_INDEX,
            depth: 0,
        }
    }
}

const SCOPE_CACHE_LIMIT: usize = 32;

thread_local! {
    static ACTIVE_SCHEDULER: RefCell<Option<Arc<Shared>>> = RefCell::new(None);
    static CURRENT_JOB: Cell<usize> = Cell::new(INVALID_INDEX);
    static JOB_COMPLETED: Cell<bool> = Cell::new(false);
    static SUPPRESS_REQUEUE: Cell<bool> = Cell::new(false);
    /// The worker's host fiber handle, parked here while a job fiber runs on
    /// this thread.
    static HOST_FIBER: Cell<Option<Fiber>> = Cell::new(None);
    /// Whether the active profile context is the current job (vs. the
    /// worker itself).
    static ACTIVE_IS_JOB: Cell<bool> = Cell::new(false);
    static WORKER_SCOPES: RefCell<ScopeList> = RefCell::new(ScopeList::new());
    /// Small free-list of profile scope indices for fast alloc/free.
    static SCOPE_CACHE: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

#[inline(never)]
pub(crate) fn active_scheduler() -> Option<Arc<Shared>> {
    ACTIVE_SCHEDULER.with(|scheduler| scheduler.borrow().clone())
}

#[inline(never)]
pub(crate) fn current_job_index() -> usize {
    CURRENT_JOB.with(|job| job.get())
}

#[inline(never)]
pub(crate) fn set_current_job(index: usize) {
    CURRENT_JOB.with(|job| job.set(index));
}

#[inline(never)]
pub(crate) fn job_completed() -> bool {
    JOB_COMPLETED.with(|flag| flag.get())
}

#[inline(never)]
pub(crate) fn set_job_completed(value: bool) {
    JOB_COMPLETED.with(|flag| flag.set(value));
}

#[inline(never)]
pub(crate) fn suppress_requeue() -> bool {
    SUPPRESS_REQUEUE.with(|flag| flag.get())
}

#[inline(never)]
pub(crate) fn set_suppress_requeue(value: bool) {
    SUPPRESS_REQUEUE.with(|flag| flag.set(value));
}

#[inline(never)]
pub(crate) fn park_host_fiber(host: Fiber) {
    HOST_FIBER.with(|slot| slot.set(Some(host)));
}

#[inline(never)]
pub(crate) fn take_host_fiber() -> Option<Fiber> {
    HOST_FIBER.with(|slot| slot.take())
}

#[inline(never)]
pub(crate) fn active_is_job() -> bool {
    ACTIVE_IS_JOB.with(|flag| flag.get())
}

#[inline(never)]
pub(crate) fn set_active_is_job(value: bool) {
    ACTIVE_IS_JOB.with(|flag| flag.set(value));
}

/// The scheduler and job index of the job running on this thread, if any.
#[inline(never)]
pub(crate) fn active_job() -> Option<(Arc<Shared>, usize)> {
    if !active_is_job() {
        return None;
    }
    let shared = active_scheduler()?;
    let index = current_job_index();
    debug_assert!(index != INVALID_INDEX);
    Some((shared, index))
}

#[inline(never)]
pub(crate) fn with_worker_scopes<R>(f: impl FnOnce(&mut ScopeList) -> R) -> R {
    WORKER_SCOPES.with(|scopes| f(&mut scopes.borrow_mut()))
}

#[inline(never)]
pub(crate) fn scope_cache_pop() -> Option<usize> {
    SCOPE_CACHE.with(|cache| cache.borrow_mut().pop())
}

/// Returns false when the cache is full and the index should go back to the
/// shared pool.
#[inline(never)]
pub(crate) fn scope_cache_push(index: usize) -> bool {
    SCOPE_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() < SCOPE_CACHE_LIMIT {
            cache.push(index);
            true
        } else {
            false
        }
    })
}

pub(crate) fn spawn_worker(
    shared: Arc<Shared>,
    pool_index: usize,
    worker_index: usize,
    priorities: Priority,
) -> crate::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("gantry-worker-{}-{}", pool_index, worker_index))
        .spawn(move || worker_entry(shared, pool_index, worker_index, priorities))
        .map_err(|_| crate::Error::PlatformError)
}

fn worker_entry(shared: Arc<Shared>, pool_index: usize, worker_index: usize, priorities: Priority) {
    ACTIVE_SCHEDULER.with(|scheduler| *scheduler.borrow_mut() = Some(Arc::clone(&shared)));
    fiber::init();

    shared.log(
        LogVerbosity::Verbose,
        LogGroup::Worker,
        format_args!(
            "worker started, pool={} worker={} priorities={:#x}",
            pool_index,
            worker_index,
            priorities.bits()
        ),
    );

    let scope_tag = format!("Worker (pool={}, index={})", pool_index, worker_index);
    let entered_scope = shared.enter_scope(ProfileScopeType::Worker, &scope_tag).is_ok();

    while !shared.destroying.load(Ordering::SeqCst) {
        shared.execute_next_job(priorities, true);
    }

    if entered_scope {
        let _ = shared.leave_scope();
    }

    shared.log(
        LogVerbosity::Verbose,
        LogGroup::Worker,
        format_args!("worker terminated, pool={} worker={}", pool_index, worker_index),
    );

    fiber::deinit();
    ACTIVE_SCHEDULER.with(|scheduler| *scheduler.borrow_mut() = None);
}

/// Entry point for every pooled job fiber.
///
/// Each resume of this fiber runs exactly one stint of one job: either a
/// fresh closure invocation, or nothing at all here (continuations after a
/// suspension resume inside the wait primitive instead, not at this loop).
/// The fiber survives across jobs; after a job completes the fiber goes back
/// to its pool and the loop picks up whatever job it is bound to next.
pub(crate) fn job_fiber_proc(host: Fiber) -> ! {
    park_host_fiber(host);

    loop {
        run_one_job();
        switch_back_to_host();
    }
}

fn run_one_job() {
    let shared = active_scheduler().expect("job fiber running without a scheduler");
    let index = current_job_index();
    let slot = shared.jobs.get(index);

    shared.log(
        LogVerbosity::Verbose,
        LogGroup::Job,
        format_args!("executing job, index={}", index),
    );

    let (work, tag) = {
        let mut data = slot.data.lock();
        (data.work.take(), data.tag)
    };

    let entered_scope = shared.enter_scope(ProfileScopeType::Fiber, tag.as_str()).is_ok();

    if let Some(mut work) = work {
        if panic::catch_unwind(AssertUnwindSafe(|| work())).is_err() {
            shared.log(
                LogVerbosity::Error,
                LogGroup::Job,
                format_args!("job panicked, index={} tag={:?}", index, tag.as_str()),
            );
        }

        // Hand the closure back so a later re-dispatch can run it again.
        let mut data = slot.data.lock();
        if data.work.is_none() {
            data.work = Some(work);
        }
    }

    if entered_scope {
        let _ = shared.leave_scope();
    }

    set_job_completed(true);
}

fn switch_back_to_host() {
    let shared = active_scheduler().expect("job fiber running without a scheduler");
    shared.switch_to_worker_context();

    let host = take_host_fiber().expect("job fiber has no host to return to");
    let next_host = unsafe { host.resume() };

    // Resumed with a new job bound to this fiber, possibly on a different
    // worker thread.
    park_host_fiber(next_host);
}

/// Suspends the current job fiber and hands control back to the worker that
/// is hosting it. The caller must already have parked the job on a wait list
/// or armed a wakeup; the worker will neither complete nor requeue it.
pub(crate) fn yield_to_worker(shared: &Shared) {
    set_suppress_requeue(true);
    shared.switch_to_worker_context();

    let host = take_host_fiber().expect("yield outside a job fiber");
    let next_host = unsafe { host.resume() };

    // Back inside the job, possibly on a different worker thread; the worker
    // that resumed us already replayed our profile scopes.
    park_host_fiber(next_host);
}
