//! Flat kernel code/data segments plus a TSS carrying one IST stack per
//! fatal-fault vector. No user segments: this core never runs ring 3.
//!
//! Every fatal vector gets its own IST index so the CPU always performs a
//! real stack switch on entry — this keeps the interrupt frame a uniform
//! {SS,RSP,RFLAGS,CS,RIP} on every fault, rather than the shorter
//! {RFLAGS,CS,RIP} frame the CPU pushes when no stack switch occurs, which
//! `interrupts::trap`'s naked stubs rely on.

use conquer_once::spin::OnceCell;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DIVIDE_ERROR_IST_INDEX: u16 = 0;
pub const DEBUG_IST_INDEX: u16 = 1;
pub const INVALID_OPCODE_IST_INDEX: u16 = 2;
pub const DOUBLE_FAULT_IST_INDEX: u16 = 3;
pub const GENERAL_PROTECTION_FAULT_IST_INDEX: u16 = 4;
pub const PAGE_FAULT_IST_INDEX: u16 = 5;

/// Size of each statically reserved fault stack.
const FAULT_STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; FAULT_STACK_SIZE]);

static mut DIVIDE_ERROR_STACK: AlignedStack = AlignedStack([0; FAULT_STACK_SIZE]);
static mut DEBUG_STACK: AlignedStack = AlignedStack([0; FAULT_STACK_SIZE]);
static mut INVALID_OPCODE_STACK: AlignedStack = AlignedStack([0; FAULT_STACK_SIZE]);
static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; FAULT_STACK_SIZE]);
static mut GENERAL_PROTECTION_FAULT_STACK: AlignedStack = AlignedStack([0; FAULT_STACK_SIZE]);
static mut PAGE_FAULT_STACK: AlignedStack = AlignedStack([0; FAULT_STACK_SIZE]);

static TSS: OnceCell<TaskStateSegment> = OnceCell::uninit();

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();

fn stack_top(stack: *const AlignedStack) -> VirtAddr {
    VirtAddr::from_ptr(stack) + FAULT_STACK_SIZE as u64
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS};
    use x86_64::instructions::tables::load_tss;

    TSS.init_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DIVIDE_ERROR_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(DIVIDE_ERROR_STACK));
        tss.interrupt_stack_table[DEBUG_IST_INDEX as usize] = stack_top(core::ptr::addr_of!(DEBUG_STACK));
        tss.interrupt_stack_table[INVALID_OPCODE_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(INVALID_OPCODE_STACK));
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(DOUBLE_FAULT_STACK));
        tss.interrupt_stack_table[GENERAL_PROTECTION_FAULT_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(GENERAL_PROTECTION_FAULT_STACK));
        tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(PAGE_FAULT_STACK));
        tss
    });

    GDT.init_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(TSS.get().unwrap()));
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
            },
        )
    });

    let (gdt, selectors) = GDT.get().unwrap();
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        DS::set_reg(selectors.data_selector);
        load_tss(selectors.tss_selector);
    }

    log::info!(target: "gdt", "GDT/TSS installed, 6 fault IST stacks mapped");
}
