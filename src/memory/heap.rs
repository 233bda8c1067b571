//! Small first-fit coalescing heap, exposed both as `kmalloc`/`kcalloc`/
//! `kfree`/`stats` and as the `#[global_allocator]` backing `alloc::*`.
//!
//! Grounded on the teacher's heap bring-up sequence (fixed virtual region,
//! map pages through the frame allocator before first use, `GlobalAlloc`
//! wiring, `#[alloc_error_handler]` signature) but not its body: the
//! teacher hands off entirely to `linked_list_allocator`, which exposes no
//! block-header contract, so the allocator itself is hand-rolled here.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

use crate::memory::{layout, paging};

const MAGIC: u32 = 0x4B48_4541; // "KHEA"
const MIN_SPLIT_REMAINDER: usize = 16;

#[repr(C)]
struct BlockHeader {
    magic: u32,
    free: bool,
    size: usize, // payload size, excludes header
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

struct HeapState {
    head: *mut BlockHeader,
    heap_end: usize,
    mapped_end: usize,
    allocated: usize,
    live_allocs: usize,
}

unsafe impl Send for HeapState {}

#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub allocated: usize,
    pub free: usize,
    pub live_allocs: usize,
}

pub struct LockedHeap {
    inner: Mutex<Option<HeapState>>,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap {
            inner: Mutex::new(None),
        }
    }

    /// Maps the first page of the heap region and installs the initial
    /// single free block spanning it. The heap grows lazily as allocations
    /// outrun the mapped region.
    pub fn init(&self) {
        let start = layout::HEAP_START;
        let space = paging::current_address_space();
        let phys = crate::memory::pfa::alloc().expect("out of memory mapping initial heap page");
        paging::map(
            space,
            start,
            phys,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        )
        .expect("failed to map initial heap page");

        let head = start as *mut BlockHeader;
        unsafe {
            (*head).magic = MAGIC;
            (*head).free = true;
            (*head).size = pfa_frame_size() - HEADER_SIZE;
            (*head).next = core::ptr::null_mut();
        }

        *self.inner.lock() = Some(HeapState {
            head,
            heap_end: start as usize,
            mapped_end: start as usize + pfa_frame_size(),
            allocated: 0,
            live_allocs: 0,
        });
    }

    fn grow(&self, state: &mut HeapState, min_additional: usize) -> bool {
        let pages_needed = (min_additional + pfa_frame_size() - 1) / pfa_frame_size();
        let space = paging::current_address_space();
        let grow_start = state.mapped_end;

        for i in 0..pages_needed {
            let phys = match crate::memory::pfa::alloc() {
                Ok(p) => p,
                Err(_) => return false,
            };
            let virt = grow_start as u64 + (i * pfa_frame_size()) as u64;
            if paging::map(
                space,
                virt,
                phys,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            )
            .is_err()
            {
                return false;
            }
        }

        let new_block_size = pages_needed * pfa_frame_size() - HEADER_SIZE;
        let new_block = grow_start as *mut BlockHeader;
        unsafe {
            (*new_block).magic = MAGIC;
            (*new_block).free = true;
            (*new_block).size = new_block_size;
            (*new_block).next = core::ptr::null_mut();
        }

        append_block(state, new_block);
        state.mapped_end += pages_needed * pfa_frame_size();
        true
    }

    pub fn stats(&self) -> HeapStats {
        let guard = self.inner.lock();
        let state = guard.as_ref().expect("heap not initialized");
        let mut free = 0usize;
        let mut cur = state.head;
        unsafe {
            while !cur.is_null() {
                if (*cur).free {
                    free += (*cur).size;
                }
                cur = (*cur).next;
            }
        }
        HeapStats {
            allocated: state.allocated,
            free,
            live_allocs: state.live_allocs,
        }
    }
}

fn append_block(state: &mut HeapState, block: *mut BlockHeader) {
    if state.head.is_null() {
        state.head = block;
        return;
    }
    let mut cur = state.head;
    unsafe {
        while !(*cur).next.is_null() {
            cur = (*cur).next;
        }
        (*cur).next = block;
    }
}

fn pfa_frame_size() -> usize {
    crate::memory::pfa::FRAME_SIZE as usize
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = align_up(layout.size().max(8), 8);
        let mut guard = self.inner.lock();
        let state = guard.as_mut().expect("heap not initialized");

        loop {
            let mut cur = state.head;
            while !cur.is_null() {
                if (*cur).free && (*cur).size >= size {
                    if (*cur).size >= size + HEADER_SIZE + MIN_SPLIT_REMAINDER {
                        let remainder_addr = (cur as usize) + HEADER_SIZE + size;
                        let remainder = remainder_addr as *mut BlockHeader;
                        (*remainder).magic = MAGIC;
                        (*remainder).free = true;
                        (*remainder).size = (*cur).size - size - HEADER_SIZE;
                        (*remainder).next = (*cur).next;
                        (*cur).next = remainder;
                        (*cur).size = size;
                    }
                    (*cur).free = false;
                    state.allocated += (*cur).size;
                    state.live_allocs += 1;
                    return (cur as usize + HEADER_SIZE) as *mut u8;
                }
                cur = (*cur).next;
            }

            if !self.grow(state, size + HEADER_SIZE) {
                return core::ptr::null_mut();
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut guard = self.inner.lock();
        let state = guard.as_mut().expect("heap not initialized");

        let header = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
        assert_eq!((*header).magic, MAGIC, "kfree: corrupted or foreign pointer");
        assert!(!(*header).free, "kfree: double free detected");

        state.allocated -= (*header).size;
        state.live_allocs -= 1;
        (*header).free = true;

        coalesce(state);
    }
}

/// Single forward pass merging adjacent free blocks by address order.
/// `next` pointers already reflect address order because blocks are only
/// ever created in increasing-address order (split remainder, or heap
/// growth).
fn coalesce(state: &mut HeapState) {
    unsafe {
        let mut cur = state.head;
        while !cur.is_null() {
            let next = (*cur).next;
            if (*cur).free
                && !next.is_null()
                && (*next).free
                && (cur as usize) + HEADER_SIZE + (*cur).size == next as usize
            {
                (*cur).size += HEADER_SIZE + (*next).size;
                (*cur).next = (*next).next;
                // retry merging further with the same cur in case the newly
                // absorbed neighbor unlocks another adjacency
                continue;
            }
            cur = (*cur).next;
        }
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub fn init() {
    ALLOCATOR.init();
    let s = ALLOCATOR.stats();
    log::info!(target: "heap", "heap initialized: {} bytes free", s.free);
}

pub fn kmalloc(size: usize) -> *mut u8 {
    unsafe { ALLOCATOR.alloc(Layout::from_size_align(size, 8).unwrap()) }
}

pub fn kcalloc(count: usize, size: usize) -> *mut u8 {
    let total = count * size;
    let ptr = kmalloc(total);
    if !ptr.is_null() {
        unsafe { core::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// # Safety
/// `ptr` must have come from `kmalloc`/`kcalloc` and not already be freed.
pub unsafe fn kfree(ptr: *mut u8) {
    if let Some(p) = NonNull::new(ptr) {
        ALLOCATOR.dealloc(p.as_ptr(), Layout::from_size_align(1, 8).unwrap());
    }
}

pub fn stats() -> HeapStats {
    ALLOCATOR.stats()
}

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    panic!("heap allocation of {} bytes failed", layout.size());
}

#[cfg(test)]
mod heap_tests {
    use super::*;

    /// A standalone heap instance over a host-allocated buffer, used to
    /// exercise the first-fit/split/coalesce logic without touching the
    /// frame allocator or page tables.
    struct TestHeap {
        head: *mut BlockHeader,
        #[allow(dead_code)]
        backing: alloc::vec::Vec<u8>,
    }

    extern crate alloc;

    impl TestHeap {
        fn new(size: usize) -> Self {
            let mut backing = alloc::vec![0u8; size];
            let head = backing.as_mut_ptr() as *mut BlockHeader;
            unsafe {
                (*head).magic = MAGIC;
                (*head).free = true;
                (*head).size = size - HEADER_SIZE;
                (*head).next = core::ptr::null_mut();
            }
            TestHeap { head, backing }
        }

        fn alloc(&mut self, size: usize) -> *mut u8 {
            let size = align_up(size.max(8), 8);
            unsafe {
                let mut cur = self.head;
                while !cur.is_null() {
                    if (*cur).free && (*cur).size >= size {
                        if (*cur).size >= size + HEADER_SIZE + MIN_SPLIT_REMAINDER {
                            let remainder_addr = (cur as usize) + HEADER_SIZE + size;
                            let remainder = remainder_addr as *mut BlockHeader;
                            (*remainder).magic = MAGIC;
                            (*remainder).free = true;
                            (*remainder).size = (*cur).size - size - HEADER_SIZE;
                            (*remainder).next = (*cur).next;
                            (*cur).next = remainder;
                            (*cur).size = size;
                        }
                        (*cur).free = false;
                        return (cur as usize + HEADER_SIZE) as *mut u8;
                    }
                    cur = (*cur).next;
                }
            }
            core::ptr::null_mut()
        }

        fn free(&mut self, ptr: *mut u8) {
            unsafe {
                let header = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
                assert_eq!((*header).magic, MAGIC, "kfree: corrupted or foreign pointer");
                assert!(!(*header).free, "kfree: double free detected");
                (*header).free = true;

                let mut cur = self.head;
                while !cur.is_null() {
                    let next = (*cur).next;
                    if (*cur).free
                        && !next.is_null()
                        && (*next).free
                        && (cur as usize) + HEADER_SIZE + (*cur).size == next as usize
                    {
                        (*cur).size += HEADER_SIZE + (*next).size;
                        (*cur).next = (*next).next;
                        continue;
                    }
                    cur = (*cur).next;
                }
            }
        }

        fn free_bytes(&self) -> usize {
            let mut total = 0;
            unsafe {
                let mut cur = self.head;
                while !cur.is_null() {
                    if (*cur).free {
                        total += (*cur).size;
                    }
                    cur = (*cur).next;
                }
            }
            total
        }
    }

    #[test_case]
    fn alloc_splits_and_free_coalesces() {
        let mut heap = TestHeap::new(4096);
        let before = heap.free_bytes();

        let a = heap.alloc(64);
        let b = heap.alloc(64);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);

        heap.free(a);
        heap.free(b);

        assert_eq!(heap.free_bytes(), before);
    }

    #[test_case]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught() {
        let mut heap = TestHeap::new(4096);
        let a = heap.alloc(32);
        heap.free(a);
        heap.free(a);
    }
}
