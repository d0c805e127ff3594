//! Profiling hooks and scope tracking.
//!
//! The scheduler never interprets profile data itself; it maintains, per
//! execution context, a stack of named scopes and replays enter/leave events
//! into a user-installed hook pair. Because a job fiber keeps its scope
//! stack across suspensions, a context switch must unwind the leaving
//! context's scopes and replay the entering context's, so an external
//! profiler always sees a coherent nesting on each worker thread.

use crate::error::{Error, Result};
use crate::job::{Tag, INVALID_INDEX};
use crate::scheduler::Shared;
use crate::worker::{self, ScopeList};
use crate::{LogGroup, LogVerbosity};
use parking_lot::Mutex;

/// Context-specific kind of a profile scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileScopeType {
    /// A worker thread's root scope.
    Worker,
    /// A scope opened on a job fiber.
    Fiber,
    /// A scope opened by user code.
    UserDefined,
}

/// User-defined callbacks invoked as profile scopes are entered and left.
pub struct ProfileFunctions {
    pub enter_scope: Box<dyn Fn(ProfileScopeType, &str) + Send + Sync>,
    pub leave_scope: Box<dyn Fn() + Send + Sync>,
}

/// One scope record in the fixed pool, linked into a per-context stack.
pub(crate) struct ScopeSlot {
    data: Mutex<ScopeData>,
}

struct ScopeData {
    kind: ProfileScopeType,
    tag: Tag,
    next: usize,
    prev: usize,
}

impl ScopeSlot {
    pub fn new() -> ScopeSlot {
        ScopeSlot {
            data: Mutex::new(ScopeData {
                kind: ProfileScopeType::UserDefined,
                tag: Tag::new(),
                next: INVALID_INDEX,
                prev: INVALID_INDEX,
            }),
        }
    }
}

impl Shared {
    /// Pushes a scope onto the active context's stack and reports it to the
    /// profile hooks. A no-op without hooks installed.
    pub(crate) fn enter_scope(&self, kind: ProfileScopeType, tag: &str) -> Result<()> {
        if self.profile.is_none() {
            return Ok(());
        }

        let index = self.alloc_scope()?;
        {
            let mut data = self.scopes.get(index).data.lock();
            data.kind = kind;
            data.tag.set(tag);
            data.next = INVALID_INDEX;
            data.prev = INVALID_INDEX;
        }

        self.with_active_scope_list(|list| {
            if list.tail != INVALID_INDEX {
                self.scopes.get(list.tail).data.lock().next = index;
                self.scopes.get(index).data.lock().prev = list.tail;
            } else {
                list.head = index;
            }
            list.tail = index;
            list.depth += 1;
        });

        if let Some(profile) = &self.profile {
            (profile.enter_scope)(kind, tag);
        }

        Ok(())
    }

    /// Pops the most recently entered scope of the active context.
    pub(crate) fn leave_scope(&self) -> Result<()> {
        if self.profile.is_none() {
            return Ok(());
        }

        let index = self.with_active_scope_list(|list| {
            let tail = list.tail;
            if tail == INVALID_INDEX {
                return INVALID_INDEX;
            }

            let prev = self.scopes.get(tail).data.lock().prev;
            if prev != INVALID_INDEX {
                self.scopes.get(prev).data.lock().next = INVALID_INDEX;
            } else {
                list.head = INVALID_INDEX;
            }
            list.tail = prev;
            list.depth -= 1;
            tail
        });

        debug_assert!(index != INVALID_INDEX, "leave_scope with an empty scope stack");
        if index == INVALID_INDEX {
            return Ok(());
        }

        if let Some(profile) = &self.profile {
            (profile.leave_scope)();
        }

        self.free_scope(index);
        Ok(())
    }

    /// Emits `leave` for every frame of a context being switched away from.
    pub(crate) fn replay_leave_scopes(&self, depth: usize) {
        if let Some(profile) = &self.profile {
            for _ in 0..depth {
                (profile.leave_scope)();
            }
        }
    }

    /// Emits `enter` for every frame of a context being switched to, oldest
    /// first.
    pub(crate) fn replay_enter_scopes(&self, list: &ScopeList) {
        let Some(profile) = &self.profile else {
            return;
        };

        let mut cursor = list.head;
        while cursor != INVALID_INDEX {
            let (kind, tag, next) = {
                let data = self.scopes.get(cursor).data.lock();
                (data.kind, data.tag, data.next)
            };
            (profile.enter_scope)(kind, tag.as_str());
            cursor = next;
        }
    }

    /// Runs `f` on the scope list of the active context: the running job's
    /// if a job is active on this thread, the worker's own otherwise.
    fn with_active_scope_list<R>(&self, f: impl FnOnce(&mut ScopeList) -> R) -> R {
        if worker::active_is_job() {
            let index = worker::current_job_index();
            let mut data = self.jobs.get(index).data.lock();
            let mut list = ScopeList {
                head: data.profile_head,
                tail: data.profile_tail,
                depth: data.profile_depth,
            };
            let result = f(&mut list);
            data.profile_head = list.head;
            data.profile_tail = list.tail;
            data.profile_depth = list.depth;
            result
        } else {
            worker::with_worker_scopes(f)
        }
    }

    fn alloc_scope(&self) -> Result<usize> {
        if let Some(index) = worker::scope_cache_pop() {
            return Ok(index);
        }

        self.scopes.alloc().ok_or_else(|| {
            self.log(
                LogVerbosity::Warning,
                LogGroup::Scheduler,
                format_args!(
                    "attempt to allocate profile scope, but pool is empty. \
                     Try increasing SchedulerBuilder::max_profile_scopes."
                ),
            );
            Error::OutOfProfileScopes
        })
    }

    fn free_scope(&self, index: usize) {
        if !worker::scope_cache_push(index) {
            self.scopes.free(index);
        }
    }
}

/// RAII guard that enters a user-defined profile scope on construction and
/// leaves it on drop.
///
/// Only meaningful on a worker thread (inside a job or the worker loop);
/// elsewhere it does nothing.
pub struct ProfileScope {
    entered: bool,
}

impl ProfileScope {
    pub fn new(tag: &str) -> ProfileScope {
        let entered = match worker::active_scheduler() {
            Some(shared) => shared
                .enter_scope(ProfileScopeType::UserDefined, tag)
                .is_ok(),
            None => false,
        };
        ProfileScope { entered }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if self.entered {
            if let Some(shared) = worker::active_scheduler() {
                let _ = shared.leave_scope();
            }
        }
    }
}
