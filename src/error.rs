//! Error and result types shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Describes the specific success or failure of a scheduler operation.
///
/// The `OutOf*` variants mean a fixed pool was exhausted at runtime; the fix
/// is raising the matching limit on [`SchedulerBuilder`](crate::SchedulerBuilder)
/// before `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Could not allocate enough memory to fulfil the request.
    #[error("out of memory")]
    OutOfMemory,

    /// Could not allocate a free job instance to fulfil the request.
    #[error("job pool exhausted")]
    OutOfJobs,

    /// Could not allocate a free fiber instance to fulfil the request.
    #[error("fiber pool exhausted")]
    OutOfFibers,

    /// Could not allocate a free counter instance to fulfil the request.
    #[error("counter pool exhausted")]
    OutOfCounters,

    /// Could not allocate a free latent-callback slot to fulfil the request.
    #[error("callback pool exhausted")]
    OutOfCallbacks,

    /// Could not allocate a free dependency edge to fulfil the request.
    #[error("dependency pool exhausted")]
    OutOfDependencies,

    /// Could not allocate a free profile scope to fulfil the request.
    #[error("profile scope pool exhausted")]
    OutOfProfileScopes,

    /// The maximum number of resources that can be registered has been
    /// exceeded.
    #[error("maximum resource count exceeded")]
    MaximumExceeded,

    /// The operation could not be performed because the scheduler has already
    /// been initialized.
    #[error("scheduler already initialized")]
    AlreadyInitialized,

    /// The job is already dispatched and cannot be dispatched again until it
    /// completes.
    #[error("job already dispatched")]
    AlreadyDispatched,

    /// The job is not in a mutable state; settings can only be changed before
    /// dispatch or after completion.
    #[error("job is not mutable")]
    NotMutable,

    /// The handle does not belong to this scheduler or no longer refers to a
    /// live resource.
    #[error("invalid handle")]
    InvalidHandle,

    /// The scheduler was initialized with no thread pools defined.
    #[error("no thread pools defined")]
    NoThreadPools,

    /// The scheduler was initialized with no fiber pools defined.
    #[error("no fiber pools defined")]
    NoFiberPools,

    /// A blocking operation timed out before its condition was satisfied.
    #[error("timed out")]
    Timeout,

    /// An operating system call failed.
    #[error("platform error")]
    PlatformError,
}
