//! Naked entry stubs for the fatal CPU exceptions.
//!
//! `extern "x86-interrupt" fn` handlers only ever see the five fields the
//! CPU itself pushes (the teacher's `interrupts.rs` fault handlers are this
//! shape too, and stop there); there is no way to reach the general-purpose
//! registers through that ABI. These stubs push the full GPR set by hand
//! before handing a `TrapFrame` pointer to `fatal_fault_dispatch`, following
//! the same `global_asm!` idiom `task::context` uses for its save/restore
//! routine. Every path here ends in a halt, so unlike a context switch there
//! is no restore side — the stub never needs to get back to user code.
//!
//! Each of the six vectors below is installed on its own IST stack (see
//! `gdt`), so the CPU always performs a real stack switch on entry and the
//! frame it leaves is always the full {SS,RSP,RFLAGS,CS,RIP}, never the
//! shorter same-stack form. `TrapFrame` assumes that uniform shape.

use core::arch::global_asm;
use x86_64::VirtAddr;

/// Mirrors the stack layout the stubs below build, lowest address first:
/// the GPRs we push, then the vector number and error code the stub
/// supplies, then the frame the CPU pushed before the stub ever ran.
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

fn fault_name(vector: u64) -> &'static str {
    match vector {
        0 => "Divide Error",
        1 => "Debug",
        6 => "Invalid Opcode",
        8 => "Double Fault",
        13 => "General Protection Fault",
        14 => "Page Fault",
        _ => "Unknown Fault",
    }
}

#[no_mangle]
extern "C" fn fatal_fault_dispatch(frame: *const TrapFrame) -> ! {
    let frame = unsafe { &*frame };
    let cr2 = if frame.vector == 14 {
        x86_64::registers::control::Cr2::read().map(|a| a.as_u64()).ok()
    } else {
        None
    };
    crate::panic_screen::render_fault(fault_name(frame.vector), frame, cr2);
    crate::hlt_loop();
}

extern "C" {
    fn divide_error_stub();
    fn debug_stub();
    fn invalid_opcode_stub();
    fn general_protection_fault_stub();
    fn double_fault_stub();
    fn page_fault_stub();
}

/// Addresses of the stubs above, for `set_handler_addr` at IDT install time.
pub fn divide_error_addr() -> VirtAddr {
    VirtAddr::new(divide_error_stub as u64)
}
pub fn debug_addr() -> VirtAddr {
    VirtAddr::new(debug_stub as u64)
}
pub fn invalid_opcode_addr() -> VirtAddr {
    VirtAddr::new(invalid_opcode_stub as u64)
}
pub fn general_protection_fault_addr() -> VirtAddr {
    VirtAddr::new(general_protection_fault_stub as u64)
}
pub fn double_fault_addr() -> VirtAddr {
    VirtAddr::new(double_fault_stub as u64)
}
pub fn page_fault_addr() -> VirtAddr {
    VirtAddr::new(page_fault_stub as u64)
}

global_asm!(
    r#"
.global divide_error_stub
divide_error_stub:
    push 0
    push 0
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call fatal_fault_dispatch

.global debug_stub
debug_stub:
    push 0
    push 1
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call fatal_fault_dispatch

.global invalid_opcode_stub
invalid_opcode_stub:
    push 0
    push 6
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call fatal_fault_dispatch

.global double_fault_stub
double_fault_stub:
    push 8
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call fatal_fault_dispatch

.global general_protection_fault_stub
general_protection_fault_stub:
    push 13
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call fatal_fault_dispatch

.global page_fault_stub
page_fault_stub:
    push 14
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call fatal_fault_dispatch
"#
);
