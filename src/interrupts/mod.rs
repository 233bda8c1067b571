//! IDT install, exception dispatch, panic rendering, PIC remap, CPUID-gated
//! LAPIC promotion, and the timer tick hook.
//!
//! Grounded on the teacher's `interrupts.rs` (IDT layout, `ChainedPics`
//! remap/mask) and `interrupts/timer.rs` (tick handler sets a flag and
//! returns — reused directly, with the userspace-thread check dropped since
//! this core has no user threads).

pub mod lapic;
mod pic;
pub mod timer;
pub mod trap;

use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use crate::gdt::{
    DEBUG_IST_INDEX, DIVIDE_ERROR_IST_INDEX, DOUBLE_FAULT_IST_INDEX,
    GENERAL_PROTECTION_FAULT_IST_INDEX, INVALID_OPCODE_IST_INDEX, PAGE_FAULT_IST_INDEX,
};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
}

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::uninit();

/// Whether the LAPIC was successfully promoted; EOI routing consults this.
static LAPIC_ENABLED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

pub fn init() {
    crate::gdt::init();
    init_idt();
    pic::init();

    if lapic::try_enable() {
        LAPIC_ENABLED.store(true, core::sync::atomic::Ordering::Relaxed);
        log::info!(target: "interrupts", "LAPIC promoted, PIC masked except timer passthrough");
    } else {
        log::info!(target: "interrupts", "no LAPIC reported by CPUID, staying on PIC");
    }
}

fn init_idt() {
    IDT.init_once(|| {
        let mut idt = InterruptDescriptorTable::new();

        // Fatal faults route through hand-written naked stubs so the dump
        // in a panic screen can show the full register set, not just the
        // five fields `extern "x86-interrupt"` exposes. Each gets its own
        // IST stack so the CPU always performs a real stack switch on
        // entry, keeping the pushed frame a uniform five words regardless
        // of vector — see `gdt`.
        unsafe {
            idt.divide_error
                .set_handler_addr(trap::divide_error_addr())
                .set_stack_index(DIVIDE_ERROR_IST_INDEX);
            idt.debug
                .set_handler_addr(trap::debug_addr())
                .set_stack_index(DEBUG_IST_INDEX);
            idt.invalid_opcode
                .set_handler_addr(trap::invalid_opcode_addr())
                .set_stack_index(INVALID_OPCODE_IST_INDEX);
            idt.general_protection_fault
                .set_handler_addr(trap::general_protection_fault_addr())
                .set_stack_index(GENERAL_PROTECTION_FAULT_IST_INDEX);
            idt.double_fault
                .set_handler_addr(trap::double_fault_addr())
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.page_fault
                .set_handler_addr(trap::page_fault_addr())
                .set_stack_index(PAGE_FAULT_IST_INDEX);
        }

        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt[InterruptIndex::Timer as u8].set_handler_fn(timer::timer_interrupt_handler);

        idt
    });

    IDT.get().unwrap().load();
}

pub(crate) fn send_eoi(vector: u8) {
    if LAPIC_ENABLED.load(core::sync::atomic::Ordering::Relaxed) {
        lapic::send_eoi();
    } else {
        pic::send_eoi(vector);
    }
}

pub(crate) static PICS: Mutex<Option<pic8259::ChainedPics>> = Mutex::new(None);

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!(target: "interrupts", "breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}
