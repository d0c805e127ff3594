//! Job definitions, handles and the dependency graph.
//!
//! Job data is owned by the scheduler's fixed pool; a [`JobHandle`] is a
//! refcounted index into it. A job's user-visible settings are only mutable
//! while it is in the `Initialized` or `Completed` state; once dispatched,
//! everything but the scheduler-owned bookkeeping is frozen until it
//! completes.

use crate::counter::CounterHandle;
use crate::error::{Error, Result};
use crate::scheduler::Shared;
use crate::timing::Timeout;
use bitflags::bitflags;
use fiber::Fiber;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sentinel for "no slot" in every pool-index field.
pub(crate) const INVALID_INDEX: usize = usize::MAX;

bitflags! {
    /// Priority classes a job may occupy. The scheduler always attempts to
    /// execute higher priorities first, and a thread pool only dequeues jobs
    /// whose priority intersects its mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Priority: u32 {
        /// Very slow, long-running jobs; segregating them keeps them from
        /// saturating the other pools.
        const SLOW = 1 << 0;
        const LOW = 1 << 1;
        const MEDIUM = 1 << 2;
        const HIGH = 1 << 3;
        const CRITICAL = 1 << 4;
        /// All priorities together.
        const ALL = Self::SLOW.bits()
            | Self::LOW.bits()
            | Self::MEDIUM.bits()
            | Self::HIGH.bits()
            | Self::CRITICAL.bits();
    }
}

/// Number of distinct priority classes (and ready queues).
pub(crate) const PRIORITY_COUNT: usize = 5;

/// Current status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum JobStatus {
    /// Created and ready for setup or dispatch.
    Initialized = 0,
    /// Dispatched and awaiting execution.
    Pending,
    /// Running on a worker.
    Running,
    /// Suspended until a counter condition is satisfied.
    WaitingOnCounter,
    /// Suspended until another job completes.
    WaitingOnJob,
    /// Suspended until a wakeup time.
    Sleeping,
    /// Finished running.
    Completed,
}

impl JobStatus {
    fn from_u8(value: u8) -> JobStatus {
        match value {
            0 => JobStatus::Initialized,
            1 => JobStatus::Pending,
            2 => JobStatus::Running,
            3 => JobStatus::WaitingOnCounter,
            4 => JobStatus::WaitingOnJob,
            5 => JobStatus::Sleeping,
            6 => JobStatus::Completed,
            _ => unreachable!("invalid job status"),
        }
    }
}

/// Atomic wrapper over [`JobStatus`], packed with a transition epoch.
///
/// The low byte holds the status; the rest counts transitions. Wake-up paths
/// claim a waiter with a status-keyed CAS ([`transition`]), so a natural wake
/// and a timeout resolve to exactly one winner. Timeout callbacks go further
/// and claim against the exact epoch captured when they were armed
/// ([`transition_exact`]): a callback that outlived its own wait cannot touch
/// the job's next one, because any transition in between moved the epoch.
///
/// [`transition`]: AtomicStatus::transition
/// [`transition_exact`]: AtomicStatus::transition_exact
pub(crate) struct AtomicStatus(AtomicU64);

const STATUS_MASK: u64 = 0xff;

impl AtomicStatus {
    pub fn new(status: JobStatus) -> AtomicStatus {
        AtomicStatus(AtomicU64::new(status as u64))
    }

    pub fn load(&self) -> JobStatus {
        JobStatus::from_u8((self.0.load(Ordering::SeqCst) & STATUS_MASK) as u8)
    }

    /// The full status+epoch word, for a later [`transition_exact`].
    ///
    /// [`transition_exact`]: AtomicStatus::transition_exact
    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn store(&self, status: JobStatus) {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            match self.0.compare_exchange(
                current,
                bump(current, status),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn transition(&self, from: JobStatus, to: JobStatus) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if (current & STATUS_MASK) as u8 != from as u8 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                bump(current, to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Transitions only if no transition of any kind happened since
    /// `snapshot` was taken.
    pub fn transition_exact(&self, snapshot: u64, to: JobStatus) -> bool {
        self.0
            .compare_exchange(snapshot, bump(snapshot, to), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn bump(word: u64, status: JobStatus) -> u64 {
    let epoch = (word >> 8).wrapping_add(1);
    (epoch << 8) | status as u64
}

/// Why a suspended job was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaitResult {
    Signaled = 0,
    TimedOut,
}

/// Bounded ASCII tag used for jobs and profile scopes.
#[derive(Clone, Copy)]
pub(crate) struct Tag {
    bytes: [u8; Tag::MAX_LENGTH + 1],
    len: u8,
}

impl Tag {
    pub const MAX_LENGTH: usize = 63;

    pub fn new() -> Tag {
        Tag {
            bytes: [0; Tag::MAX_LENGTH + 1],
            len: 0,
        }
    }

    /// Stores `value`, truncating to the maximum length on a character
    /// boundary.
    pub fn set(&mut self, value: &str) {
        let mut end = value.len().min(Tag::MAX_LENGTH);
        while !value.is_char_boundary(end) {
            end -= 1;
        }

        self.bytes[..end].copy_from_slice(&value.as_bytes()[..end]);
        self.len = end as u8;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

/// One half of a dependency edge, allocated from the shared edge pool. A
/// logical edge is two of these: one in the successor's predecessor list and
/// one in the predecessor's successor list, each naming the opposite job.
pub(crate) struct DependencySlot {
    pub other_job: usize,
    pub next: usize,
}

/// The edge pool plus its free list, all guarded by one scheduler-wide mutex;
/// every piece of edge-list surgery happens under it.
pub(crate) struct DependencyPool {
    pub slots: Vec<DependencySlot>,
    pub free: Vec<usize>,
}

impl DependencyPool {
    pub fn new(capacity: usize) -> DependencyPool {
        DependencyPool {
            slots: (0..capacity)
                .map(|_| DependencySlot {
                    other_job: INVALID_INDEX,
                    next: INVALID_INDEX,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }

    pub fn free_slot(&mut self, index: usize) {
        self.slots[index].other_job = INVALID_INDEX;
        self.slots[index].next = INVALID_INDEX;
        self.free.push(index);
    }
}

/// Scheduler-internal state for one job slot.
///
/// The atomics are the fields touched from wake-up paths that may hold a
/// wait-list lock; keeping them outside the data mutex keeps those paths
/// free of lock-order concerns.
pub(crate) struct JobSlot {
    pub status: AtomicStatus,
    pub ref_count: AtomicU32,
    pub pending_predecessors: AtomicU32,
    /// Bit per priority queue currently holding this index; stops a job from
    /// being enqueued twice into the same queue.
    pub queues_contained_in: AtomicU32,
    /// Snapshot of the priority mask taken at dispatch, so requeue paths
    /// don't need the data mutex.
    pub priority_bits: AtomicU32,
    /// Intrusive link for whichever wait list the job is suspended on.
    pub wait_next: AtomicUsize,
    /// Counter value this job is waiting for, when waiting on a counter.
    pub wait_value: AtomicU64,
    /// Whether the counter wait is a decrement (`remove`) or an equality
    /// (`wait_for`).
    pub wait_remove: AtomicBool,
    pub wait_result: AtomicU8,
    /// Heads the list of jobs suspended on this job's completion. Waiters add
    /// themselves with a CAS push under the read lock; the completer drains
    /// under the write lock.
    pub waiter_head: AtomicUsize,
    pub waiter_lock: RwLock<()>,
    /// First edge of this job's predecessor list (edge pool index).
    pub first_predecessor: AtomicUsize,
    /// First edge of this job's successor list (edge pool index).
    pub first_successor: AtomicUsize,
    pub data: Mutex<JobData>,
}

pub(crate) struct JobData {
    pub work: Option<Box<dyn FnMut() + Send>>,
    pub tag: Tag,
    pub stack_size: usize,
    pub priority: Priority,
    /// Counter to `add(1)` to on completion, or `INVALID_INDEX`. Holds a
    /// counter refcount while set.
    pub completion_counter: usize,
    /// The job's bound fiber while parked. Taken by the worker that runs the
    /// job and parked back on suspension; `fiber_in_flight` covers the window
    /// in between.
    pub fiber: Option<Fiber>,
    pub fiber_pool: usize,
    pub fiber_in_flight: bool,
    /// Timeout callback armed for the current wait, cancelled on a natural
    /// wake.
    pub wait_callback: Option<crate::callback::CallbackHandle>,
    pub profile_head: usize,
    pub profile_tail: usize,
    pub profile_depth: usize,
}

impl JobSlot {
    pub fn new() -> JobSlot {
        JobSlot {
            status: AtomicStatus::new(JobStatus::Initialized),
            ref_count: AtomicU32::new(0),
            pending_predecessors: AtomicU32::new(0),
            queues_contained_in: AtomicU32::new(0),
            priority_bits: AtomicU32::new(0),
            wait_next: AtomicUsize::new(INVALID_INDEX),
            wait_value: AtomicU64::new(0),
            wait_remove: AtomicBool::new(false),
            wait_result: AtomicU8::new(WaitResult::Signaled as u8),
            waiter_head: AtomicUsize::new(INVALID_INDEX),
            waiter_lock: RwLock::new(()),
            first_predecessor: AtomicUsize::new(INVALID_INDEX),
            first_successor: AtomicUsize::new(INVALID_INDEX),
            data: Mutex::new(JobData {
                work: None,
                tag: Tag::new(),
                stack_size: 0,
                priority: Priority::MEDIUM,
                completion_counter: INVALID_INDEX,
                fiber: None,
                fiber_pool: 0,
                fiber_in_flight: false,
                wait_callback: None,
                profile_head: INVALID_INDEX,
                profile_tail: INVALID_INDEX,
                profile_depth: 0,
            }),
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self.status.load(),
            JobStatus::Initialized | JobStatus::Completed
        )
    }

    pub fn set_wait_result(&self, result: WaitResult) {
        self.wait_result.store(result as u8, Ordering::SeqCst);
    }

    pub fn wait_result(&self) -> WaitResult {
        match self.wait_result.load(Ordering::SeqCst) {
            0 => WaitResult::Signaled,
            _ => WaitResult::TimedOut,
        }
    }
}

/// A handle to a job created by [`Scheduler::create_job`].
///
/// Handles are refcounted: clones share the same job, and the slot is
/// returned to the pool once every handle is gone and the job is not in
/// flight. Dispatching takes an internal hold, so dropping all handles to a
/// running job is safe.
///
/// [`Scheduler::create_job`]: crate::Scheduler::create_job
pub struct JobHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: usize,
}

impl JobHandle {
    pub(crate) fn new(shared: Arc<Shared>, index: usize) -> JobHandle {
        shared.add_job_ref(index);
        JobHandle { shared, index }
    }

    fn slot(&self) -> &JobSlot {
        self.shared.jobs.get(self.index)
    }

    /// Sets the closure the job runs. The closure is retained across
    /// completion, so re-dispatching the handle runs it again.
    pub fn set_work(&self, work: impl FnMut() + Send + 'static) -> Result<()> {
        let slot = self.slot();
        if !slot.is_mutable() {
            return Err(Error::NotMutable);
        }
        slot.data.lock().work = Some(Box::new(work));
        Ok(())
    }

    /// Sets the descriptive tag, truncated to 63 bytes.
    pub fn set_tag(&self, tag: &str) -> Result<()> {
        let slot = self.slot();
        if !slot.is_mutable() {
            return Err(Error::NotMutable);
        }
        slot.data.lock().tag.set(tag);
        Ok(())
    }

    /// Sets the minimum fiber stack size the job needs.
    pub fn set_stack_size(&self, stack_size: usize) -> Result<()> {
        let slot = self.slot();
        if !slot.is_mutable() {
            return Err(Error::NotMutable);
        }
        slot.data.lock().stack_size = stack_size;
        Ok(())
    }

    /// Sets the priority mask. A job may occupy several classes, making it
    /// eligible for every thread pool whose mask intersects.
    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        debug_assert!(!priority.is_empty(), "job priority mask must not be empty");
        let slot = self.slot();
        if !slot.is_mutable() {
            return Err(Error::NotMutable);
        }
        slot.data.lock().priority = priority;
        Ok(())
    }

    /// Attaches a counter that receives `add(1)` each time this job
    /// completes.
    pub fn set_completion_counter(&self, counter: &CounterHandle) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &counter.shared) {
            return Err(Error::InvalidHandle);
        }
        let slot = self.slot();
        if !slot.is_mutable() {
            return Err(Error::NotMutable);
        }

        let mut data = slot.data.lock();
        if data.completion_counter != INVALID_INDEX {
            self.shared.release_counter(data.completion_counter);
        }
        self.shared.add_counter_ref(counter.index);
        data.completion_counter = counter.index;
        Ok(())
    }

    /// Makes `other` a predecessor: this job will not start until `other`
    /// completes. Both jobs must be mutable.
    pub fn add_predecessor(&self, other: &JobHandle) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &other.shared) {
            return Err(Error::InvalidHandle);
        }
        self.shared.add_job_dependency(self.index, other.index)
    }

    /// Makes `other` a successor: it will not start until this job
    /// completes. Both jobs must be mutable.
    pub fn add_successor(&self, other: &JobHandle) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &other.shared) {
            return Err(Error::InvalidHandle);
        }
        self.shared.add_job_dependency(other.index, self.index)
    }

    /// Removes every dependency edge attached to this job, in both
    /// directions.
    pub fn clear_dependencies(&self) -> Result<()> {
        if !self.slot().is_mutable() {
            return Err(Error::NotMutable);
        }
        self.shared.clear_job_dependencies(self.index);
        Ok(())
    }

    /// Queues the job for execution. A completed job can be dispatched again;
    /// its dependencies were cleared on completion, so the new run starts
    /// fresh.
    pub fn dispatch(&self) -> Result<()> {
        self.shared.dispatch_job(self.index)
    }

    /// Blocks until the job completes. From inside a job this suspends the
    /// calling fiber; from a plain thread it blocks on a condition variable.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        self.shared.wait_for_job(self.index, timeout)
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.slot().status.load(),
            JobStatus::Pending
                | JobStatus::WaitingOnCounter
                | JobStatus::WaitingOnJob
                | JobStatus::Sleeping
        )
    }

    pub fn is_running(&self) -> bool {
        self.slot().status.load() == JobStatus::Running
    }

    pub fn is_complete(&self) -> bool {
        self.slot().status.load() == JobStatus::Completed
    }

    /// Whether the job's settings can currently be changed.
    pub fn is_mutable(&self) -> bool {
        self.slot().is_mutable()
    }

    pub fn is_valid(&self) -> bool {
        self.index < self.shared.jobs.capacity()
            && self.slot().ref_count.load(Ordering::SeqCst) > 0
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> JobHandle {
        JobHandle::new(Arc::clone(&self.shared), self.index)
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.shared.release_job(self.index);
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.index == other.index
    }
}

impl Eq for JobHandle {}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("JobHandle")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
