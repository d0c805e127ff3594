//! Events: single-bit synchronization built on counters.
//!
//! An event is a counter constrained to 0/1. For manual-reset events every
//! waiter passes once the event is signalled, until someone resets it. For
//! auto-reset events the first waiter through consumes the signal
//! atomically, so each signal releases exactly one waiter:
//!
//! ```text
//! signal  = set(1)        (manual)   add(1)       (auto)
//! wait    = wait_for(1)   (manual)   remove(1)    (auto)
//! reset   = set(0)
//! ```

use crate::counter::CounterHandle;
use crate::error::Result;
use crate::timing::Timeout;

/// A handle to an event created by [`Scheduler::create_event`].
///
/// [`Scheduler::create_event`]: crate::Scheduler::create_event
#[derive(Clone)]
pub struct EventHandle {
    counter: CounterHandle,
    auto_reset: bool,
}

impl EventHandle {
    pub(crate) fn new(counter: CounterHandle, auto_reset: bool) -> EventHandle {
        EventHandle { counter, auto_reset }
    }

    /// Signals the event, releasing one waiter (auto-reset) or every waiter
    /// until reset (manual-reset).
    pub fn signal(&self) {
        if self.auto_reset {
            self.counter.add(1);
        } else {
            self.counter.set(1);
        }
    }

    /// Returns the event to the unsignalled state.
    pub fn reset(&self) {
        self.counter.set(0);
    }

    /// Blocks until the event is signalled. From inside a job this suspends
    /// the fiber; from a plain thread it blocks the thread.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        if self.auto_reset {
            self.counter.remove(1, timeout)
        } else {
            self.counter.wait_for(1, timeout)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.counter.is_valid()
    }
}

impl PartialEq for EventHandle {
    fn eq(&self, other: &EventHandle) -> bool {
        self.counter == other.counter
    }
}

impl Eq for EventHandle {}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("EventHandle")
            .field("auto_reset", &self.auto_reset)
            .finish_non_exhaustive()
    }
}
