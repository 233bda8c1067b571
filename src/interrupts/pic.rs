//! 8259 PIC remap and masking. Always brought up first; the LAPIC, if
//! present, takes over EOI duty but the PIC itself stays remapped so spurious
//! vectors never alias into the exception range.

use pic8259::ChainedPics;

use super::{PICS, PIC_1_OFFSET, PIC_2_OFFSET};

pub fn init() {
    let mut pics = unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) };
    unsafe {
        pics.initialize();
        // Mask everything except IRQ0 (timer): bit 0 clear, rest set.
        pics.write_masks(0b1111_1110, 0b1111_1111);
    }
    *PICS.lock() = Some(pics);

    x86_64::instructions::interrupts::enable();
    log::info!(target: "interrupts", "PIC remapped to {}..{}", PIC_1_OFFSET, PIC_2_OFFSET + 8);
}

pub fn send_eoi(vector: u8) {
    if let Some(pics) = PICS.lock().as_mut() {
        unsafe { pics.notify_end_of_interrupt(vector) };
    }
}
