//! Callee-saved-register context switch.
//!
//! Grounded on the teacher's `task/context.rs` `global_asm!` save/restore
//! routine, reduced from a full GPR+RFLAGS+segment dump to the seven
//! registers the System V ABI actually requires a callee to preserve:
//! r15, r14, r13, r12, rbx, rbp, rsp.

use core::arch::global_asm;

#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
}

extern "C" {
    /// Saves the outgoing context's callee-saved registers into `*old`,
    /// loads `*new`'s, and returns on the new stack. On a thread's very
    /// first run `*old` is a throwaway scratch context and `new.rsp`
    /// points at the trampoline's prepared stack frame.
    fn switch_context(old: *mut CpuContext, new: *const CpuContext);
}

/// # Safety
/// `old` and `new` must point to valid, non-overlapping `CpuContext`
/// records; `new` must have been produced by `CpuContext::bootstrap` or a
/// prior `switch_context` save.
pub unsafe fn perform_context_switch(old: *mut CpuContext, new: *const CpuContext) {
    switch_context(old, new);
}

impl CpuContext {
    /// Seeds a context so that its first `switch_context` lands on
    /// `trampoline` with `rsp` pointing just below the return address slot.
    pub fn bootstrap(stack_top: u64, trampoline: u64) -> Self {
        let rsp = stack_top - 8;
        unsafe {
            core::ptr::write(rsp as *mut u64, trampoline);
        }
        CpuContext {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp,
        }
    }
}

global_asm!(
    r#"
.global switch_context
switch_context:
    // rdi = &mut old, rsi = &new
    mov [rdi + 0x00], r15
    mov [rdi + 0x08], r14
    mov [rdi + 0x10], r13
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], rbx
    mov [rdi + 0x28], rbp
    mov [rdi + 0x30], rsp

    mov r15, [rsi + 0x00]
    mov r14, [rsi + 0x08]
    mov r13, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov rbx, [rsi + 0x20]
    mov rbp, [rsi + 0x28]
    mov rsp, [rsi + 0x30]

    ret
"#
);
