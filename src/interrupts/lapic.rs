//! CPUID-gated local APIC promotion. The teacher kernel never carries LAPIC
//! code (PIC-only); this is enriched from the pack's `raw-cpuid` usage
//! combined with the `x86_64` crate's existing MSR access.

use raw_cpuid::CpuId;
use x86_64::registers::model_specific::Msr;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_TPR: usize = 0x80;

static mut LAPIC_VIRT_BASE: u64 = 0;

/// Returns true if a LAPIC was reported by CPUID and successfully enabled.
pub fn try_enable() -> bool {
    let cpuid = CpuId::new();
    let has_apic = cpuid
        .get_feature_info()
        .map(|f| f.has_apic())
        .unwrap_or(false);
    if !has_apic {
        return false;
    }

    unsafe {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let base = msr.read();
        let phys_base = base & 0xFFFF_F000;
        msr.write(base | APIC_BASE_ENABLE);

        let virt_base = crate::memory::paging::phys_to_virt(phys_base);
        LAPIC_VIRT_BASE = virt_base;

        write_reg(REG_TPR, 0);
        write_reg(REG_SPURIOUS, 0x100 | 0xFF);
    }

    true
}

unsafe fn write_reg(offset: usize, value: u32) {
    let ptr = (LAPIC_VIRT_BASE as usize + offset) as *mut u32;
    core::ptr::write_volatile(ptr, value);
}

pub fn send_eoi() {
    unsafe { write_reg(REG_EOI, 0) };
}
