//! Fiber-backed cooperative job scheduling.
//!
//! `gantry` multiplexes a bounded number of cooperative execution contexts
//! (fibers, each owning a private stack) onto fixed pools of worker threads.
//! Client code submits jobs as closures, declares predecessor/successor
//! ordering between them, and synchronizes through counters, events, sleeps
//! and handle-waits. Inside a running job every wait point yields the fiber
//! back to its worker so the worker can run another ready job: dependencies
//! read as ordinary blocking calls, but no OS thread ever blocks on them.
//!
//! Everything is allocated up front. Jobs, counters, dependency edges,
//! profile scopes, timer callbacks and fibers all live in fixed pools sized
//! before [`SchedulerBuilder::init`]; after init the scheduler allocates
//! nothing on the dispatch or switch paths.
//!
//! # Example
//!
//! ```
//! use gantry::{Priority, SchedulerBuilder, Timeout};
//!
//! let mut builder = SchedulerBuilder::new();
//! builder.add_thread_pool(2, Priority::ALL)?;
//! builder.add_fiber_pool(16, 64 * 1024)?;
//! let scheduler = builder.init()?;
//!
//! let counter = scheduler.create_counter()?;
//!
//! let job = scheduler.create_job()?;
//! let count = counter.clone();
//! job.set_work(move || count.add(1))?;
//! job.set_tag("example")?;
//! job.dispatch()?;
//!
//! scheduler.wait_until_idle(Timeout::INFINITE)?;
//! assert_eq!(counter.get(), 1);
//! # Ok::<(), gantry::Error>(())
//! ```
//!
//! # Sizing
//!
//! A suspended job keeps its fiber (the fiber holds the job's live stack),
//! so the fiber pools bound how many jobs can be in flight at once. If every
//! fiber is held by a suspended job, ready jobs cannot start and the system
//! livelocks; size `fiber_count` to at least the maximum number of
//! concurrently suspended jobs.

mod callback;
mod counter;
mod debug;
mod error;
mod event;
mod job;
mod pool;
mod profile;
mod queue;
mod scheduler;
mod timing;
mod worker;

pub use crate::counter::CounterHandle;
pub use crate::debug::{DebugOutputFn, LogGroup, LogVerbosity};
pub use crate::error::{Error, Result};
pub use crate::event::EventHandle;
pub use crate::job::{JobHandle, Priority};
pub use crate::profile::{ProfileFunctions, ProfileScope, ProfileScopeType};
pub use crate::scheduler::{in_job, sleep, MemoryFunctions, Scheduler, SchedulerBuilder};
pub use crate::timing::Timeout;
