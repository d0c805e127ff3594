//! Fiber support for unix targets.
//!
//! There is no portable user-space context-switch API worth using here
//! (ucontext is deprecated and syscall-heavy), so the switch is a small piece
//! of inline assembly that saves and restores the callee-saved register set
//! and the stack pointer. Caller-saved registers don't need saving: the
//! switch happens inside a regular `extern "C"` call, so the compiler has
//! already spilled anything it cares about.

use crate::Fiber;
use std::alloc::{self, Layout};
use std::arch::naked_asm;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("no fiber context switch implemented for this architecture");

/// Stacks must be at least this large. Tiny requests are rounded up so the
/// entry shim always has room to run.
const MIN_STACK_SIZE: usize = 4096;

const STACK_ALIGN: usize = 16;

pub type PlatformId = *mut FiberState;

/// Saved execution context plus stack ownership for one fiber.
pub struct FiberState {
    ctx: TaskContext,
    stack: Option<OwnedStack>,
    fiber_proc: Option<fn(Fiber) -> !>,
}

/// Converts the calling thread's execution into a fiber context.
///
/// The returned state has no stack of its own; it borrows the thread's. Its
/// context is filled in the first time the thread switches away.
pub fn init_thread() -> PlatformId {
    Box::into_raw(Box::new(FiberState {
        ctx: TaskContext::default(),
        stack: None,
        fiber_proc: None,
    }))
}

pub fn create_fiber(stack_size: usize, fiber_proc: fn(Fiber) -> !) -> PlatformId {
    let stack = OwnedStack::new(stack_size.max(MIN_STACK_SIZE));
    let (base, len) = (stack.ptr, stack.layout.size());

    let state = Box::into_raw(Box::new(FiberState {
        ctx: TaskContext::default(),
        stack: Some(stack),
        fiber_proc: Some(fiber_proc),
    }));

    unsafe { prepare_context(state, base, len) };
    state
}

/// Like [`create_fiber`] but on caller-owned stack memory, which must outlive
/// the fiber.
pub unsafe fn create_fiber_with_stack(
    stack: *mut u8,
    stack_len: usize,
    fiber_proc: fn(Fiber) -> !,
) -> PlatformId {
    assert!(stack_len >= MIN_STACK_SIZE, "fiber stack too small");

    let state = Box::into_raw(Box::new(FiberState {
        ctx: TaskContext::default(),
        stack: None,
        fiber_proc: Some(fiber_proc),
    }));

    prepare_context(state, stack, stack_len);
    state
}

/// Suspends `from`, saving the live register state into it, and resumes `to`
/// exactly where it last suspended (or at its entry shim if it has never
/// run). Returns when something later switches back to `from`.
pub unsafe fn resume(from: PlatformId, to: PlatformId) {
    let save = &mut (*from).ctx as *mut TaskContext;
    let restore = &(*to).ctx as *const TaskContext;
    switch_context(save, restore);
}

/// Frees a fiber's state and owned stack. The fiber must not be running.
pub unsafe fn destroy(id: PlatformId) {
    drop(Box::from_raw(id));
}

struct OwnedStack {
    ptr: *mut u8,
    layout: Layout,
}

impl OwnedStack {
    fn new(size: usize) -> OwnedStack {
        let layout = Layout::from_size_align(size, STACK_ALIGN).expect("bad stack layout");
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        OwnedStack { ptr, layout }
    }
}

impl Drop for OwnedStack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

/// First code run on a fresh fiber, reached through the arch trampoline with
/// the fiber's own state as argument.
unsafe extern "C" fn fiber_entry(state: *mut FiberState) -> ! {
    let fiber_proc = (*state).fiber_proc.expect("entered a fiber with no proc");
    let prev = crate::take_prev().expect("PREV was None entering a fiber");
    fiber_proc(Fiber(prev))
}

// x86_64 System V: callee-saved registers are rbx, rbp, r12-r15 plus rsp. The
// return address lives on the stack, so restoring rsp and executing `ret`
// resumes the target after its own call into `switch_context`.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Default)]
struct TaskContext {
    rsp: u64, // 0x00
    rbx: u64, // 0x08
    rbp: u64, // 0x10
    r12: u64, // 0x18
    r13: u64, // 0x20
    r14: u64, // 0x28
    r15: u64, // 0x30
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
extern "C" fn switch_context(_save: *mut TaskContext, _restore: *const TaskContext) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbx",
        "mov [rdi + 0x10], rbp",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x08]",
        "mov rbp, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    );
}

// A fresh fiber's stack has the trampoline's address planted where `ret`
// expects the return address, and r12 carries the fiber's state pointer
// through the switch. `jmp` (not `call`) keeps the entry's stack alignment at
// the ABI's expected entry alignment.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r12",
        "jmp {entry}",
        entry = sym fiber_entry,
    );
}

#[cfg(target_arch = "x86_64")]
unsafe fn prepare_context(state: *mut FiberState, stack_base: *mut u8, stack_len: usize) {
    // Arrange for the first switch's `ret` to pop the trampoline address with
    // the stack left at the alignment a function entry expects.
    let top = ((stack_base as usize) + stack_len) & !(STACK_ALIGN - 1);
    let sp = top - 16;
    *(sp as *mut usize) = fiber_trampoline as usize;

    (*state).ctx.rsp = sp as u64;
    (*state).ctx.r12 = state as u64;
}

// AArch64 AAPCS: callee-saved are x19-x28, the frame pointer x29, the link
// register x30, sp, and the low halves of v8-v15 (d8-d15). The link register
// holds the resume point, so `ret` continues after the target's own call into
// `switch_context`.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Default)]
struct TaskContext {
    sp: u64,  // 0x00
    x19: u64, // 0x08
    x20: u64, // 0x10
    x21: u64, // 0x18
    x22: u64, // 0x20
    x23: u64, // 0x28
    x24: u64, // 0x30
    x25: u64, // 0x38
    x26: u64, // 0x40
    x27: u64, // 0x48
    x28: u64, // 0x50
    fp: u64,  // 0x58
    lr: u64,  // 0x60
    d8: u64,  // 0x68
    d9: u64,  // 0x70
    d10: u64, // 0x78
    d11: u64, // 0x80
    d12: u64, // 0x88
    d13: u64, // 0x90
    d14: u64, // 0x98
    d15: u64, // 0xa0
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
extern "C" fn switch_context(_save: *mut TaskContext, _restore: *const TaskContext) {
    naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "stp x19, x20, [x0, #0x08]",
        "stp x21, x22, [x0, #0x18]",
        "stp x23, x24, [x0, #0x28]",
        "stp x25, x26, [x0, #0x38]",
        "stp x27, x28, [x0, #0x48]",
        "stp x29, x30, [x0, #0x58]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x08]",
        "ldp x21, x22, [x1, #0x18]",
        "ldp x23, x24, [x1, #0x28]",
        "ldp x25, x26, [x1, #0x38]",
        "ldp x27, x28, [x1, #0x48]",
        "ldp x29, x30, [x1, #0x58]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x19",
        "b {entry}",
        entry = sym fiber_entry,
    );
}

#[cfg(target_arch = "aarch64")]
unsafe fn prepare_context(state: *mut FiberState, stack_base: *mut u8, stack_len: usize) {
    // sp must stay 16-byte aligned at all times on aarch64.
    let top = ((stack_base as usize) + stack_len) & !(STACK_ALIGN - 1);

    (*state).ctx.sp = top as u64;
    (*state).ctx.lr = fiber_trampoline as usize as u64;
    (*state).ctx.x19 = state as u64;
}
