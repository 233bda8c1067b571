//! Manual four-level x86-64 page table walk over the HHDM.
//!
//! Grounded on the teacher's `kernel_page_table.rs` manual
//! PML4/PDPT/PD/PT indexing and allocate-on-walk pattern, stripped of its
//! process/IST-stack-migration machinery: this core has one address space
//! per caller and no per-CPU stack carve-outs to special-case.

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::KernelResult;
use crate::memory::pfa;

static mut HHDM_OFFSET: u64 = 0;

pub fn init(hhdm_offset: u64) {
    unsafe {
        HHDM_OFFSET = hhdm_offset;
    }
}

pub fn phys_to_virt(phys: u64) -> u64 {
    phys + unsafe { HHDM_OFFSET }
}

/// An address space is identified by the physical frame holding its PML4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace(pub u64);

fn table_at(frame_phys: u64) -> &'static mut PageTable {
    unsafe { &mut *(phys_to_virt(frame_phys) as *mut PageTable) }
}

fn zero_table(frame_phys: u64) {
    let table = table_at(frame_phys);
    for entry in table.iter_mut() {
        entry.set_unused();
    }
}

fn kernel_pml4_frame() -> u64 {
    let (frame, _) = Cr3::read();
    frame.start_address().as_u64()
}

/// Allocates a fresh PML4 and shares the kernel's higher-half (256..511)
/// entries into it so every address space observes the same kernel mappings.
pub fn create_address_space() -> KernelResult<AddressSpace> {
    let pml4_phys = pfa::alloc()?;
    zero_table(pml4_phys);

    let new_pml4 = table_at(pml4_phys);
    let kernel_pml4 = table_at(kernel_pml4_frame());
    for i in 256..512 {
        new_pml4[i] = kernel_pml4[i].clone();
    }

    Ok(AddressSpace(pml4_phys))
}

pub fn switch_to(space: AddressSpace) {
    let frame = PhysFrame::containing_address(PhysAddr::new(space.0));
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

fn indices(virt: u64) -> (usize, usize, usize, usize) {
    (
        ((virt >> 39) & 0x1FF) as usize,
        ((virt >> 30) & 0x1FF) as usize,
        ((virt >> 21) & 0x1FF) as usize,
        ((virt >> 12) & 0x1FF) as usize,
    )
}

/// Walks to the next level, allocating and zeroing a table if the entry is
/// unused. If `widen_user` is set and the entry already exists but lacks
/// `USER_ACCESSIBLE`, the flag is added — permissions only ever widen along
/// a walk, never narrow.
fn step(table: &mut PageTable, index: usize, widen_user: bool) -> KernelResult<u64> {
    let entry = &mut table[index];
    if entry.is_unused() {
        let frame_phys = pfa::alloc()?;
        zero_table(frame_phys);
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if widen_user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        entry.set_addr(PhysAddr::new(frame_phys), flags);
        Ok(frame_phys)
    } else {
        if widen_user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
            let flags = entry.flags() | PageTableFlags::USER_ACCESSIBLE;
            let addr = entry.addr();
            entry.set_addr(addr, flags);
        }
        Ok(entry.addr().as_u64())
    }
}

pub fn map(
    space: AddressSpace,
    virt: u64,
    phys: u64,
    flags: PageTableFlags,
) -> KernelResult<()> {
    let virt = virt & !0xFFF;
    let phys = phys & !0xFFF;
    let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);
    let (l4, l3, l2, l1) = indices(virt);

    let pml4 = table_at(space.0);
    let pdpt_phys = step(pml4, l4, user)?;
    let pdpt = table_at(pdpt_phys);
    let pd_phys = step(pdpt, l3, user)?;
    let pd = table_at(pd_phys);
    let pt_phys = step(pd, l2, user)?;
    let pt = table_at(pt_phys);

    pt[l1].set_addr(PhysAddr::new(phys), flags | PageTableFlags::PRESENT);

    if Cr3::read().0.start_address().as_u64() == space.0 {
        x86_64::instructions::tlb::flush(VirtAddr::new(virt));
    }

    Ok(())
}

pub fn unmap(space: AddressSpace, virt: u64) {
    let virt = virt & !0xFFF;
    let (l4, l3, l2, l1) = indices(virt);

    let pml4 = table_at(space.0);
    if pml4[l4].is_unused() {
        return;
    }
    let pdpt = table_at(pml4[l4].addr().as_u64());
    if pdpt[l3].is_unused() {
        return;
    }
    let pd = table_at(pdpt[l3].addr().as_u64());
    if pd[l2].is_unused() {
        return;
    }
    let pt = table_at(pd[l2].addr().as_u64());
    pt[l1].set_unused();

    if Cr3::read().0.start_address().as_u64() == space.0 {
        x86_64::instructions::tlb::flush(VirtAddr::new(virt));
    }
}

pub fn translate(space: AddressSpace, virt: u64) -> u64 {
    let (l4, l3, l2, l1) = indices(virt);
    let offset = virt & 0xFFF;

    let pml4 = table_at(space.0);
    if pml4[l4].is_unused() {
        return 0;
    }
    let pdpt = table_at(pml4[l4].addr().as_u64());
    if pdpt[l3].is_unused() {
        return 0;
    }
    let pd = table_at(pdpt[l3].addr().as_u64());
    if pd[l2].is_unused() {
        return 0;
    }
    let pt = table_at(pd[l2].addr().as_u64());
    if pt[l1].is_unused() {
        return 0;
    }
    pt[l1].addr().as_u64() + offset
}

pub fn current_address_space() -> AddressSpace {
    AddressSpace(kernel_pml4_frame())
}

pub fn enable_global_pages() {
    use x86_64::registers::control::{Cr4, Cr4Flags};
    unsafe {
        Cr4::update(|flags| flags.insert(Cr4Flags::PAGE_GLOBAL));
    }
}
