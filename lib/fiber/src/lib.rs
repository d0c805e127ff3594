//! A library for creating and managing fibers.
//!
//! Fibers are threads of execution that must be manually scheduled by the
//! client application, as opposed to OS threads which are scheduled
//! preemptively by the kernel. Each fiber has its own stack and can yield its
//! time on the system thread to another fiber at any point during execution.
//! This allows for forms of concurrency that can't be expressed with normal
//! system threads, most notably suspending work mid-function without blocking
//! the thread that was running it.
//!
//! This library is meant to be the base for a fiber-pool system, in which a
//! fixed number of fibers are created up front and used to run units of work
//! that may suspend themselves.
//!
//! # Fibers and Threads
//!
//! Fibers run on top of system threads, with one fiber active on a thread at
//! a time. Once a fiber has been suspended it can be resumed on any thread,
//! not just the one it last ran on. A thread must call [`init`] before it can
//! switch fibers; this converts the thread's own execution into that thread's
//! root fiber.
//!
//! Moving fibers between threads has implications for thread-safety: any
//! thread-local state read before a switch must be re-read after it, since
//! the fiber may wake up on a different thread.
//!
//! # Unsafety
//!
//! A fiber can be suspended on one thread and resumed on another, pulling any
//! stack-owned data along with it. That means a `!Send` type alive across a
//! suspension point would be moved between threads, violating its contract.
//! As such it is unsafe to call [`Fiber::resume`] while a `!Send` type is
//! alive and in scope.
//!
//! # Examples
//!
//! ```
//! use fiber::Fiber;
//!
//! // Function run by the fiber. The return type is `!` because a fiber proc
//! // has no caller to return to; it must switch away instead.
//! fn fiber_proc(suspended: Fiber) -> ! {
//!     // `suspended` is the fiber that resumed us; switch straight back.
//!     unsafe { suspended.resume(); }
//!
//!     panic!("resumed a fiber that already finished");
//! }
//!
//! fiber::init();
//!
//! let fiber = Fiber::new(64 * 1024, fiber_proc);
//! let fiber_id = fiber.id();
//!
//! let prev = unsafe { fiber.resume() };
//! assert_eq!(fiber_id, prev.id());
//! ```

use platform::PlatformId;
use std::cell::Cell;
use std::mem;

#[cfg(unix)]
#[path = "platform/unix.rs"]
pub mod platform;

#[cfg(not(unix))]
compile_error!("the fiber crate currently only supports unix targets");

/// Identity of a fiber, stable across suspensions and thread migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(PlatformId);

// `FiberId` contains a raw pointer so it's not `Send`/`Sync` by default, but
// it's only ever used as an identity token so sharing it is harmless.
unsafe impl Send for FiberId {}
unsafe impl Sync for FiberId {}

/// An owning handle to a suspended fiber.
///
/// There is exactly one `Fiber` handle per suspended fiber. The currently
/// running fiber has no handle; it reappears as the return value of
/// [`Fiber::resume`] on whichever fiber it switches to.
///
/// Dropping a `Fiber` releases its stack and context. The suspended stack
/// frames are *not* unwound, so anything they own is leaked rather than
/// dropped.
#[derive(Debug)]
pub struct Fiber(PlatformId);

thread_local! {
    /// The fiber that most recently suspended on this thread.
    static PREV: Cell<Option<PlatformId>> = Cell::new(None);
    /// The fiber currently executing on this thread.
    static CURRENT: Cell<Option<PlatformId>> = Cell::new(None);
}

/// Initializes the current thread for fiber use, converting its execution
/// into the thread's root fiber.
///
/// Must be called on every thread that resumes fibers. Returns the id of the
/// root fiber. Calling it twice on the same thread returns the existing root.
pub fn init() -> FiberId {
    if let Some(current) = read_current() {
        return FiberId(current);
    }

    let platform_fiber = platform::init_thread();
    CURRENT.with(|current| current.set(Some(platform_fiber)));
    FiberId(platform_fiber)
}

/// Releases the root fiber context created by [`init`], converting the thread
/// back to a plain thread.
///
/// Only valid on the thread's root fiber, with no other fiber running on the
/// thread.
pub fn deinit() {
    if let Some(current) = CURRENT.with(|current| current.take()) {
        PREV.with(|prev| prev.set(None));
        unsafe { platform::destroy(current) };
    }
}

/// Returns the fiber currently executing on this thread, or `None` if
/// [`init`] has not been called.
pub fn current() -> Option<FiberId> {
    read_current().map(FiberId)
}

impl Fiber {
    /// Creates a new fiber with the specified stack size, set up to begin
    /// executing `fiber_proc` when first resumed.
    ///
    /// The previously running fiber is passed to `fiber_proc` so it can be
    /// resumed later. `fiber_proc` must never return; a fiber has no caller
    /// to return to, so it must always switch away instead.
    ///
    /// Stack sizes are rounded up to a small platform minimum.
    pub fn new(stack_size: usize, fiber_proc: fn(Fiber) -> !) -> Fiber {
        Fiber(platform::create_fiber(stack_size, fiber_proc))
    }

    /// Creates a fiber running on caller-owned stack memory.
    ///
    /// # Safety
    ///
    /// `stack` must point to a writable block of `stack_len` bytes that
    /// outlives the fiber. The fiber will not free it; the caller must, after
    /// the `Fiber` has been dropped.
    pub unsafe fn with_raw_stack(
        stack: *mut u8,
        stack_len: usize,
        fiber_proc: fn(Fiber) -> !,
    ) -> Fiber {
        Fiber(platform::create_fiber_with_stack(stack, stack_len, fiber_proc))
    }

    /// Makes this fiber active, consuming the handle in the process.
    ///
    /// The current fiber is suspended so the resumed fiber can run in its
    /// place. At some later point another fiber may resume the current one,
    /// at which point `resume` returns, yielding the handle of the fiber that
    /// was running just before the switch back.
    ///
    /// # Safety
    ///
    /// No `!Send` value may be alive across this call (see the module docs),
    /// and the target must be a suspended fiber, which is guaranteed when the
    /// handle came from this library and was not forged.
    pub unsafe fn resume(self) -> Fiber {
        // Initialize the thread for fiber usage if that hasn't happened yet.
        if read_current().is_none() {
            init();
        }

        let target = self.0;

        // The target is about to run; it must no longer have an owning handle
        // or a later drop would free a live stack.
        mem::forget(self);

        let prev_handle = CURRENT.with(|current| {
            let prev = current.get();
            current.set(Some(target));
            prev
        });
        PREV.with(|prev| prev.set(prev_handle));

        platform::resume(prev_handle.expect("CURRENT was None during resume"), target);

        // Back from suspension, possibly on a different thread. Nothing read
        // before the switch can be reused; only the thread-locals are
        // trustworthy, and they must be re-read.
        let prev_fiber = take_prev().expect("PREV was None after resuming");
        Fiber(prev_fiber)
    }

    /// Returns the fiber's unique id.
    pub fn id(&self) -> FiberId {
        FiberId(self.0)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        unsafe { platform::destroy(self.0) };
    }
}

// `Fiber` holds a raw pointer so we confirm sending manually. Fibers are
// designed to migrate between threads, and resuming one from two threads at
// once is prevented statically by `resume` taking `self`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

// The thread-local reads below must go through non-inlined calls: a fiber can
// migrate between threads at any switch, and an inlined TLS access would let
// the compiler reuse a pre-switch TLS address.

#[inline(never)]
fn read_current() -> Option<PlatformId> {
    CURRENT.with(|current| current.get())
}

#[inline(never)]
fn take_prev() -> Option<PlatformId> {
    PREV.with(|prev| prev.get())
}
