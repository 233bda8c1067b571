//! Renders a fatal CPU exception as a full register dump plus halt. This is
//! the one place a "Fatal" error surfaces — it never returns a `KernelError`.

use crate::console;
use crate::interrupts::trap::TrapFrame;

pub fn render_fault(name: &str, frame: &TrapFrame, cr2: Option<u64>) {
    console::emergency_write(format_args!("\n*** {} (vector {}) ***\n", name, frame.vector));
    console::emergency_write(format_args!(
        "RIP: {:#018x}  CS: {:#06x}  RFLAGS: {:#018x}\n",
        frame.rip, frame.cs, frame.rflags
    ));
    console::emergency_write(format_args!("RSP: {:#018x}  SS: {:#06x}\n", frame.rsp, frame.ss));
    console::emergency_write(format_args!("error code: {:#x}\n", frame.error_code));
    if let Some(addr) = cr2 {
        console::emergency_write(format_args!("CR2: {:#018x}\n", addr));
    }
    console::emergency_write(format_args!(
        "RAX: {:#018x}  RBX: {:#018x}  RCX: {:#018x}  RDX: {:#018x}\n",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    ));
    console::emergency_write(format_args!(
        "RSI: {:#018x}  RDI: {:#018x}  RBP: {:#018x}\n",
        frame.rsi, frame.rdi, frame.rbp
    ));
    console::emergency_write(format_args!(
        "R8:  {:#018x}  R9:  {:#018x}  R10: {:#018x}  R11: {:#018x}\n",
        frame.r8, frame.r9, frame.r10, frame.r11
    ));
    console::emergency_write(format_args!(
        "R12: {:#018x}  R13: {:#018x}  R14: {:#018x}  R15: {:#018x}\n",
        frame.r12, frame.r13, frame.r14, frame.r15
    ));
    console::emergency_write(format_args!("System Halted.\n"));
    crate::serial::flush_serial();
}
