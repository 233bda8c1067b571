//! Timer ISR. Grounded directly on the teacher's `interrupts/timer.rs`: the
//! handler only increments the tick counter and sets the reschedule flag,
//! then EOIs and returns — it never switches threads inside IRQ context.
//! The teacher's userspace-thread check is dropped; there are no user
//! threads in this core.

use x86_64::structures::idt::InterruptStackFrame;

use super::InterruptIndex;

pub extern "x86-interrupt" fn timer_interrupt_handler(_frame: InterruptStackFrame) {
    crate::time::increment_ticks();
    crate::task::scheduler::set_reschedule_requested();
    super::send_eoi(InterruptIndex::Timer as u8);
}
